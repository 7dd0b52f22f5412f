use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::AppError;
use crate::session::SessionHandle;
use crate::state::AppState;

const MCP_PATH: &str = "/mcp";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub fn router() -> Router<AppState> {
    Router::new().route(MCP_PATH, post(mcp_post).get(mcp_get).delete(mcp_delete))
}

/// POST /mcp: one JSON-RPC message or batch per request. A sessionless
/// initialize opens a session; everything else must name one via the
/// `mcp-session-id` header.
async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = format!("mcp-req-{}", Uuid::now_v7());

    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": -32700,
                        "message": "Parse error"
                    }
                })),
            )
                .into_response();
        }
    };

    match header_value(&headers, SESSION_ID_HEADER) {
        Some(session_id) => {
            let session = state
                .sessions
                .resume(&session_id)
                .filter(|session| session.is_active());
            let Some(session) = session else {
                tracing::warn!(
                    event = "unknown_session",
                    request_id = %request_id,
                    session_id = %session_id,
                );
                return AppError::BadSession {
                    id: rpc_id_of(&incoming),
                }
                .into_response();
            };

            let responses = run_session_request(&state, &session, incoming).await;
            respond(responses, &session.id)
        }
        None => {
            if !is_initialize_request(&incoming) {
                return AppError::BadSession {
                    id: rpc_id_of(&incoming),
                }
                .into_response();
            }

            let session = state.sessions.begin();
            tracing::info!(
                event = "session_started",
                request_id = %request_id,
                session_id = %session.id,
            );
            let responses = run_session_request(&state, &session, incoming).await;
            // The id is only announced with this response, so activation
            // cannot race a concurrent request on the same session.
            session.activate();
            respond(responses, &session.id)
        }
    }
}

/// GET /mcp: open or resume the session's SSE stream. `Last-Event-ID`
/// replays retained events past the cursor before live delivery.
async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_value(&headers, SESSION_ID_HEADER) else {
        return AppError::BadSession { id: Value::Null }.into_response();
    };
    let session = state
        .sessions
        .resume(&session_id)
        .filter(|session| session.is_active());
    let Some(session) = session else {
        return AppError::BadSession { id: Value::Null }.into_response();
    };

    let last_event_id =
        header_value(&headers, LAST_EVENT_ID_HEADER).and_then(|raw| raw.parse::<u64>().ok());
    let Some(rx) = session.attach_stream(last_event_id) else {
        return AppError::BadSession { id: Value::Null }.into_response();
    };
    tracing::debug!(
        event = "stream_attached",
        session_id = %session.id,
        replay_from = ?last_event_id,
    );

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .id(event.seq.to_string())
                .event("message")
                .data(event.payload.to_string()),
        )
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    insert_session_header(&mut response, &session.id);
    response
}

/// DELETE /mcp: terminate the named session.
async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_value(&headers, SESSION_ID_HEADER) else {
        return AppError::BadSession { id: Value::Null }.into_response();
    };
    if !state.sessions.terminate(&session_id) {
        return AppError::BadSession { id: Value::Null }.into_response();
    }
    tracing::info!(event = "session_terminated", session_id = %session_id);
    StatusCode::OK.into_response()
}

/// Process a message for one session: FIFO within the session via its gate,
/// bounded by the request timeout, with every response recorded in the
/// session's event log for stream replay.
async fn run_session_request(
    state: &AppState,
    session: &SessionHandle,
    incoming: Value,
) -> Vec<Value> {
    let _ordered = session.gate.lock().await;

    let handled = tokio::time::timeout(
        state.config.request_timeout,
        state.mcp.handle_incoming_message(incoming.clone()),
    )
    .await;

    let responses = match handled {
        Ok(responses) => responses,
        Err(_) => {
            tracing::warn!(
                event = "request_timeout",
                session_id = %session.id,
                timeout_secs = state.config.request_timeout.as_secs(),
            );
            vec![json!({
                "jsonrpc": "2.0",
                "id": rpc_id_of(&incoming),
                "error": {
                    "code": -32603,
                    "message": "Request timed out"
                }
            })]
        }
    };

    for response in &responses {
        session.publish(response.clone());
    }
    responses
}

fn respond(responses: Vec<Value>, session_id: &str) -> Response {
    let mut response = if responses.is_empty() {
        // Notification-only input gets no body.
        StatusCode::ACCEPTED.into_response()
    } else if responses.len() == 1 {
        (
            StatusCode::OK,
            Json(responses.into_iter().next().unwrap_or(Value::Null)),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(Value::Array(responses))).into_response()
    };
    insert_session_header(&mut response, session_id);
    response
}

fn insert_session_header(response: &mut Response, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
}

/// An initialize notification (no id) expects no response, so it cannot
/// carry a session id back and must not open a session.
fn is_initialize_request(incoming: &Value) -> bool {
    incoming.get("method").and_then(Value::as_str) == Some("initialize")
        && incoming.get("id").is_some_and(|id| !id.is_null())
}

/// Best-effort request id for error bodies; batches report null.
fn rpc_id_of(incoming: &Value) -> Value {
    incoming.get("id").cloned().unwrap_or(Value::Null)
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}
