use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

/// Transport-level failures that map onto the JSON-RPC wire error bodies.
#[derive(Debug)]
pub enum AppError {
    /// Missing or unknown session id (400, code -32000). Carries the request
    /// id from the incoming body when one was readable.
    BadSession { id: Value },
    /// Anything unexpected (500, code -32603). Details stay in the logs.
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadSession { id } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "jsonrpc": "2.0",
                    "error": {
                        "code": -32000,
                        "message": "Bad Request: No valid session ID provided"
                    },
                    "id": id
                })),
            )
                .into_response(),
            AppError::Internal(message) => {
                tracing::error!(event = "internal_error", error = %message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "jsonrpc": "2.0",
                        "error": {
                            "code": -32603,
                            "message": "Internal server error"
                        },
                        "id": Value::Null
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Map a caught handler panic onto the internal-error wire body. Installed
/// via `CatchPanicLayer` on the router.
pub fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "opaque panic payload".to_string()
    };
    AppError::Internal(detail).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn bad_session_renders_the_stable_wire_body() {
        let response = AppError::BadSession { id: json!(7) }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(
            body["error"]["message"],
            "Bad Request: No valid session ID provided"
        );
        assert_eq!(body["id"], 7);
    }

    #[tokio::test]
    async fn caught_panic_becomes_an_internal_error_body() {
        let response = handle_panic(Box::new("handler blew up"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], -32603);
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(!body.to_string().contains("blew up"));
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let response = AppError::Internal("secret detail".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], -32603);
        assert!(!body.to_string().contains("secret detail"));
    }
}
