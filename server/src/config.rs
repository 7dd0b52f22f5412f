use std::time::Duration;

use holded_mcp_runtime::{McpRuntimeConfig, parse_env_u64_with_bounds};

const DEFAULT_API_URL: &str = "https://api.holded.com/api";

const REQUEST_TIMEOUT_SECS_ENV: &str = "HOLDED_MCP_REQUEST_TIMEOUT_SECS";
const REQUEST_TIMEOUT_SECS_MIN: u64 = 1;
const REQUEST_TIMEOUT_SECS_MAX: u64 = 600;
const REQUEST_TIMEOUT_SECS_DEFAULT: u64 = 30;

const EVENT_LOG_CAP_ENV: &str = "HOLDED_MCP_EVENT_LOG_CAP";
const EVENT_LOG_CAP_MIN: u64 = 16;
const EVENT_LOG_CAP_MAX: u64 = 65_536;
const EVENT_LOG_CAP_DEFAULT: u64 = 1_024;

/// Server settings resolved from the environment once at startup. Tunables
/// are clamped into their bounds; only the API key is hard-required.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub runtime: McpRuntimeConfig,
    pub port: u16,
    pub request_timeout: Duration,
    pub event_log_cap: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        let api_key = std::env::var("HOLDED_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "HOLDED_API_KEY must be set".to_string())?;

        let api_url = std::env::var("HOLDED_API_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let (timeout_secs, _) = parse_env_u64_with_bounds(
            std::env::var(REQUEST_TIMEOUT_SECS_ENV).ok(),
            REQUEST_TIMEOUT_SECS_MIN,
            REQUEST_TIMEOUT_SECS_MAX,
            REQUEST_TIMEOUT_SECS_DEFAULT,
        );

        let (event_log_cap, _) = parse_env_u64_with_bounds(
            std::env::var(EVENT_LOG_CAP_ENV).ok(),
            EVENT_LOG_CAP_MIN,
            EVENT_LOG_CAP_MAX,
            EVENT_LOG_CAP_DEFAULT,
        );

        Ok(Self {
            runtime: McpRuntimeConfig::new(api_url, api_key).with_env_overrides(),
            port,
            request_timeout: Duration::from_secs(timeout_secs),
            event_log_cap: event_log_cap as usize,
        })
    }
}
