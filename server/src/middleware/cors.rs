use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Build a CORS layer from the `HOLDED_MCP_CORS_ORIGINS` env var.
///
/// - Origins: comma-separated list, or `*` for any (the default)
/// - Methods: GET, POST, DELETE, OPTIONS
/// - Headers: Content-Type, Mcp-Session-Id, Last-Event-ID
/// - Exposed: Mcp-Session-Id, so browser clients can read the session id
pub fn build_cors_layer() -> CorsLayer {
    let origins_str =
        std::env::var("HOLDED_MCP_CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());

    let allow_origin = if origins_str.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins_str
            .split(',')
            .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("mcp-session-id"),
            HeaderName::from_static("last-event-id"),
        ])
        .expose_headers([HeaderName::from_static("mcp-session-id")])
        .max_age(std::time::Duration::from_secs(3600))
}
