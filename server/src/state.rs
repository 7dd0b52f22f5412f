use std::sync::Arc;

use holded_mcp_runtime::McpServer;

use crate::config::ServerConfig;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub mcp: Arc<McpServer>,
    pub sessions: Arc<SessionRegistry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let mcp = Arc::new(McpServer::new(config.runtime.clone()));
        let sessions = Arc::new(SessionRegistry::new(config.event_log_cap));
        Self {
            mcp,
            sessions,
            config: Arc::new(config),
        }
    }
}
