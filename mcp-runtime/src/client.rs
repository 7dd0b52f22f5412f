use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.holded.com/api";

/// Holded resource addressed by its collection path. Item, create, update and
/// delete URLs all derive from the collection path, so a new resource is one
/// more constant here plus its tool registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub name: &'static str,
    pub collection_path: &'static str,
}

impl Resource {
    fn item_path(&self, id: &str) -> String {
        format!("{}/{id}", self.collection_path)
    }
}

pub const CONTACTS: Resource = Resource {
    name: "contacts",
    collection_path: "/invoicing/v1/contacts",
};

pub const PRODUCTS: Resource = Resource {
    name: "products",
    collection_path: "/catalog/v1/products",
};

pub const INVOICES: Resource = Resource {
    name: "invoices",
    collection_path: "/invoicing/v1/documents/invoice",
};

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("Holded API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to reach Holded API: {0}")]
    Connection(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Connection(_) => None,
        }
    }
}

/// Thin client for the Holded REST API. One call, one request: retries and
/// backoff are the caller's decision, never taken here.
#[derive(Clone)]
pub struct HoldedClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HoldedClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Fetch one page of a listed resource. Holded returns a bare JSON array;
    /// anything else (some tenants return an object on empty collections) is
    /// treated as an empty page.
    pub async fn fetch_page(
        &self,
        resource: Resource,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Value>, UpstreamError> {
        let query = [
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        let body = self
            .request(Method::GET, resource.collection_path, &query, None)
            .await?;
        match body {
            Value::Array(records) => Ok(records),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn fetch_one(&self, resource: Resource, id: &str) -> Result<Value, UpstreamError> {
        self.request(Method::GET, &resource.item_path(id), &[], None)
            .await
    }

    pub async fn create(&self, resource: Resource, payload: &Value) -> Result<Value, UpstreamError> {
        self.request(Method::POST, resource.collection_path, &[], Some(payload))
            .await
    }

    pub async fn update(
        &self,
        resource: Resource,
        id: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        self.request(Method::PUT, &resource.item_path(id), &[], Some(payload))
            .await
    }

    pub async fn delete(&self, resource: Resource, id: &str) -> Result<Value, UpstreamError> {
        self.request(Method::DELETE, &resource.item_path(id), &[], None)
            .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let mut url =
            reqwest::Url::parse(&format!("{}{path}", self.api_url.trim_end_matches('/')))
                .map_err(|e| UpstreamError::Connection(format!("invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut request = self
            .http
            .request(method, url)
            .header("key", &self.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Connection(format!("failed to read response body: {e}")))?;
        let body = parse_response_body(&bytes);

        if !(200..=299).contains(&status) {
            return Err(UpstreamError::Status {
                status,
                message: upstream_error_message(&body),
            });
        }
        Ok(body)
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

/// Holded error bodies carry the human-readable part under "info" or
/// "message" depending on the endpoint.
fn upstream_error_message(body: &Value) -> String {
    for key in ["info", "message", "error"] {
        if let Some(message) = body.get(key).and_then(Value::as_str) {
            if !message.trim().is_empty() {
                return message.trim().to_string();
            }
        }
    }
    match body {
        Value::String(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        Value::Null => "empty error body".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_path_appends_id_to_collection_path() {
        assert_eq!(CONTACTS.item_path("abc123"), "/invoicing/v1/contacts/abc123");
        assert_eq!(
            INVOICES.item_path("inv-1"),
            "/invoicing/v1/documents/invoice/inv-1"
        );
    }

    #[test]
    fn upstream_error_message_prefers_info_field() {
        let body = json!({ "info": "Missing mandatory field", "status": 0 });
        assert_eq!(upstream_error_message(&body), "Missing mandatory field");
    }

    #[test]
    fn upstream_error_message_falls_back_to_raw_body() {
        assert_eq!(
            upstream_error_message(&Value::String("Forbidden".to_string())),
            "Forbidden"
        );
        assert_eq!(upstream_error_message(&Value::Null), "empty error body");
    }

    #[test]
    fn parse_response_body_tolerates_non_json() {
        assert_eq!(parse_response_body(b""), Value::Null);
        assert_eq!(
            parse_response_body(b"not json"),
            Value::String("not json".to_string())
        );
        assert_eq!(parse_response_body(b"[1,2]"), json!([1, 2]));
    }

    #[tokio::test]
    async fn connection_failure_maps_to_connection_error() {
        // Port 9 (discard) is never listening in test environments.
        let client = HoldedClient::new("http://127.0.0.1:9", "test-key");
        let err = client
            .fetch_page(CONTACTS, 1, 50)
            .await
            .expect_err("request against a closed port must fail");
        assert!(err.status().is_none());
    }
}
