use clap::Parser;

use holded_mcp_runtime::{McpRuntimeConfig, McpServer};

#[derive(Parser)]
#[command(
    name = "holded-mcp",
    version,
    about = "Holded MCP server: tool surface for the Holded API over stdio"
)]
struct Cli {
    /// Holded API base URL
    #[arg(
        long,
        env = "HOLDED_API_URL",
        default_value = "https://api.holded.com/api"
    )]
    api_url: String,

    /// Holded API key, sent as the `key` header on every upstream call
    #[arg(long, env = "HOLDED_API_KEY")]
    api_key: String,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = McpRuntimeConfig::new(cli.api_url, cli.api_key).with_env_overrides();
    let server = McpServer::new(config);

    if let Err(err) = server.serve_stdio().await {
        let payload = serde_json::json!({
            "error": "mcp_server_error",
            "message": err,
        });
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        );
        std::process::exit(1);
    }
}
