use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

pub mod aggregate;
pub mod client;
pub mod tools;

use client::HoldedClient;
use tools::DEFAULT_PAGE_SIZE;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "holded-mcp";

const DEFAULT_MAX_PAGES: u32 = 100;
const DEFAULT_RESPONSE_BYTE_LIMIT: usize = 100_000;

const PAGE_SIZE_ENV: &str = "HOLDED_MCP_PAGE_SIZE";
const PAGE_SIZE_MIN: u32 = 1;
const PAGE_SIZE_MAX: u32 = 500;
const MAX_PAGES_ENV: &str = "HOLDED_MCP_MAX_PAGES";
const MAX_PAGES_MIN: u32 = 1;
const MAX_PAGES_MAX: u32 = 10_000;
const RESPONSE_BYTE_LIMIT_ENV: &str = "HOLDED_MCP_RESPONSE_BYTE_LIMIT";
const RESPONSE_BYTE_LIMIT_MIN: u64 = 1_000;
const RESPONSE_BYTE_LIMIT_MAX: u64 = 10_000_000;

/// Runtime settings shared by the stdio binary and the HTTP server.
#[derive(Clone, Debug)]
pub struct McpRuntimeConfig {
    pub api_url: String,
    pub api_key: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub response_byte_limit: usize,
}

impl McpRuntimeConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            response_byte_limit: DEFAULT_RESPONSE_BYTE_LIMIT,
        }
    }

    /// Apply the tuning env vars. Out-of-range values are clamped rather than
    /// rejected so a typo cannot take the server down.
    pub fn with_env_overrides(mut self) -> Self {
        let (page_size, _) = parse_env_u32_with_bounds(
            std::env::var(PAGE_SIZE_ENV).ok(),
            PAGE_SIZE_MIN,
            PAGE_SIZE_MAX,
            self.page_size,
        );
        let (max_pages, _) = parse_env_u32_with_bounds(
            std::env::var(MAX_PAGES_ENV).ok(),
            MAX_PAGES_MIN,
            MAX_PAGES_MAX,
            self.max_pages,
        );
        let (response_byte_limit, _) = parse_env_u64_with_bounds(
            std::env::var(RESPONSE_BYTE_LIMIT_ENV).ok(),
            RESPONSE_BYTE_LIMIT_MIN,
            RESPONSE_BYTE_LIMIT_MAX,
            self.response_byte_limit as u64,
        );
        self.page_size = page_size;
        self.max_pages = max_pages;
        self.response_byte_limit = response_byte_limit as usize;
        self
    }
}

pub fn parse_env_u64_with_bounds(
    raw: Option<String>,
    min: u64,
    max: u64,
    default: u64,
) -> (u64, bool) {
    match raw.and_then(|value| value.parse::<u64>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

pub fn parse_env_u32_with_bounds(
    raw: Option<String>,
    min: u32,
    max: u32,
    default: u32,
) -> (u32, bool) {
    match raw.and_then(|value| value.parse::<u32>().ok()) {
        Some(parsed) => (parsed.clamp(min, max), true),
        None => (default, false),
    }
}

/// MCP JSON-RPC server over the Holded tool surface. Holds no per-session
/// state, so one instance can serve every HTTP session concurrently.
pub struct McpServer {
    config: McpRuntimeConfig,
    client: HoldedClient,
}

impl McpServer {
    pub fn new(config: McpRuntimeConfig) -> Self {
        let client = HoldedClient::new(config.api_url.clone(), config.api_key.clone());
        Self { config, client }
    }

    /// Serve MCP over stdin/stdout with Content-Length framing until EOF.
    pub async fn serve_stdio(&self) -> Result<(), String> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    /// Handle one decoded wire message, which may be a batch. Returns the
    /// responses to send; notifications contribute nothing.
    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; server does not issue outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Tools for the Holded invoicing and CRM API: contacts, products, and invoices. Listing tools are paginated; get_all_contacts walks every page and summarizes oversized results."
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tools::tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let Some(tool) = tools::find_tool(name) else {
            return Err(RpcError::unknown_tool(name));
        };

        if let Err(err) = tools::validate_required_arguments(&tool, &args) {
            return Ok(build_tool_call_response(err.to_value(), true));
        }

        match tools::execute_action(
            &self.client,
            tool.action,
            &args,
            self.config.page_size,
            self.config.max_pages,
            self.config.response_byte_limit,
        )
        .await
        {
            Ok(envelope) => Ok(build_tool_call_response(envelope, false)),
            Err(err) => {
                tracing::warn!(
                    event = "tool_call_failed",
                    tool = name,
                    code = %err.code,
                    "tool call returned an error result"
                );
                Ok(build_tool_call_response(err.to_value(), true))
            }
        }
    }
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| envelope.to_string());

    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn unknown_tool(name: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Unknown tool: {name}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> McpServer {
        // Port 9 is never listening; these paths must resolve before any request.
        McpServer::new(McpRuntimeConfig::new("http://127.0.0.1:9", "test-key"))
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_server_info() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            }))
            .await;

        assert_eq!(responses.len(), 1);
        let result = &responses[0]["result"];
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], MCP_SERVER_NAME);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    }

    #[tokio::test]
    async fn tools_list_exposes_the_full_surface() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            }))
            .await;

        let tools = responses[0]["result"]["tools"]
            .as_array()
            .expect("tools array");
        assert_eq!(tools.len(), 12);
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"get_all_contacts"));
        assert!(names.contains(&"create_invoice"));
        assert!(tools.iter().all(|t| t.get("inputSchema").is_some()));
    }

    #[tokio::test]
    async fn ping_returns_empty_result() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" }))
            .await;
        assert_eq!(responses[0]["result"], json!({}));
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_invalid_request() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "1.0", "id": 4, "method": "ping" }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32600);
        assert_eq!(responses[0]["id"], 4);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "resources/list"
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_protocol_fault() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": { "name": "get_bookings", "arguments": {} }
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32601);
        assert!(
            responses[0]["error"]["message"]
                .as_str()
                .unwrap()
                .contains("get_bookings")
        );
    }

    #[tokio::test]
    async fn missing_required_argument_is_an_error_flagged_result() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": "get_contact", "arguments": {} }
            }))
            .await;

        let result = &responses[0]["result"];
        assert!(responses[0].get("error").is_none());
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"], "validation_failed");
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn batch_requests_are_answered_element_wise() {
        let server = test_server();
        let responses = server
            .handle_incoming_message(json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "method": "notifications/initialized" },
                { "jsonrpc": "2.0", "id": 2, "method": "nope" }
            ]))
            .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let server = test_server();
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn non_object_message_is_invalid_request() {
        let server = test_server();
        let responses = server.handle_incoming_message(json!("ping")).await;
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[test]
    fn env_override_parsing_clamps_out_of_range_values() {
        let (value, set) = parse_env_u32_with_bounds(Some("9999".to_string()), 1, 500, 50);
        assert_eq!(value, 500);
        assert!(set);

        let (value, set) = parse_env_u32_with_bounds(Some("nope".to_string()), 1, 500, 50);
        assert_eq!(value, 50);
        assert!(!set);

        let (value, _) =
            parse_env_u64_with_bounds(Some("10".to_string()), 1_000, 10_000_000, 100_000);
        assert_eq!(value, 1_000);
    }

    #[test]
    fn error_response_carries_optional_data() {
        let with_data = error_response(
            json!(1),
            RpcError {
                code: -32602,
                message: "bad".to_string(),
                data: Some(json!({ "field": "page" })),
            },
        );
        assert_eq!(with_data["error"]["data"]["field"], "page");

        let without = error_response(json!(1), RpcError::invalid_params("bad"));
        assert!(without["error"].get("data").is_none());
    }
}
