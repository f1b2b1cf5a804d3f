//! HTTP + WebSocket transport for workers and the conversation boundary.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Role, SignalKind, WorkerSignal};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ItemError, WorkerError};
use crate::fingerprint::{WorkParameters, WorkerConfig};
use crate::reports::ReportKind;

/// Header carrying the credential issued at first connect.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the operator credential.
pub const OPERATOR_KEY_HEADER: &str = "x-operator-key";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

/// Build the router with worker, conversation and event routes.
pub fn dispatch_routes(dispatcher: Arc<Dispatcher>) -> Router {
    let state = AppState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/workers/{id}/connect", post(connect_worker))
        .route("/api/workers/{id}/disconnect", post(disconnect_worker))
        .route("/api/workers/{id}/poll", post(poll_for_work))
        .route("/api/workers/{id}/signal", post(worker_signal))
        .route("/api/workers/{id}/compliance", post(complete_check))
        .route("/api/chats/{id}", get(get_chat))
        .route("/api/chats/{id}/messages", post(create_message))
        .route("/api/messages/{id}", get(get_message))
        .route("/api/messages/{id}/reports", post(submit_report))
        .route("/api/messages/{id}/cancel", post(cancel_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Item(ItemError::NotFound { .. }) | Error::Worker(WorkerError::Unknown { .. }) => {
            StatusCode::NOT_FOUND
        }
        Error::Worker(WorkerError::Unauthorized { .. }) => StatusCode::UNAUTHORIZED,
        Error::Item(ItemError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::Item(ItemError::ParentMismatch { .. }) | Error::Fingerprint(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::Config(_) | Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: impl Into<Error>) -> ApiError {
    let err = err.into();
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    }
    (status, Json(json!({"error": err.to_string()})))
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn parse_id(id: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| bad_request(&format!("Invalid {what} ID")))
}

/// Require the caller's key to belong to the worker in the path.
async fn authorize(state: &AppState, headers: &HeaderMap, worker_id: &str) -> ApiResult<()> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match state.dispatcher.authenticate(key).await {
        Some(owner) if owner == worker_id => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid worker credential"})),
        )),
    }
}

/// Require the operator credential. Operator routes stay closed when no
/// credential is configured.
fn authorize_operator(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.dispatcher.config().operator_key.as_ref() else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Operator access is not configured"})),
        ));
    };
    let presented = headers
        .get(OPERATOR_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected.expose_secret()) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid operator credential"})),
        ));
    }
    Ok(())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "inference-dispatch"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Event stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.dispatcher))
}

/// Forward item events to the client until it goes away.
async fn handle_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let mut rx = dispatcher.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event stream client lagged behind broadcast");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Event stream connection closed");
}

// ── Workers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    name: Option<String>,
    config: WorkerConfig,
}

async fn connect_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConnectRequest>,
) -> ApiResult<Response> {
    if id.trim().is_empty() {
        return Err(bad_request("Invalid worker ID"));
    }
    let name = body.name.unwrap_or_else(|| id.clone());
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let registered = state
        .dispatcher
        .connect_worker(&id, &name, body.config, api_key)
        .await
        .map_err(api_error)?;
    Ok(Json(registered).into_response())
}

async fn disconnect_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authorize(&state, &headers, &id).await?;
    let outcome = state
        .dispatcher
        .disconnect_worker(&id)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({
        "status": "disconnected",
        "released_item": outcome.map(|o| o.item_id()),
    }))
    .into_response())
}

async fn poll_for_work(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authorize(&state, &headers, &id).await?;
    match state.dispatcher.poll_for_work(&id).await.map_err(api_error)? {
        Some(assignment) => Ok(Json(assignment).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Deserialize)]
struct SignalRequest {
    item_id: Uuid,
    #[serde(flatten)]
    kind: SignalKind,
}

async fn worker_signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SignalRequest>,
) -> ApiResult<Response> {
    authorize(&state, &headers, &id).await?;
    let read = state
        .dispatcher
        .apply_signal(WorkerSignal {
            item_id: body.item_id,
            worker_id: id,
            kind: body.kind,
        })
        .await
        .map_err(api_error)?;
    Ok(Json(read).into_response())
}

#[derive(Deserialize)]
struct ComplianceRequest {
    passed: bool,
}

async fn complete_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ComplianceRequest>,
) -> ApiResult<Response> {
    authorize_operator(&state, &headers)?;
    let worker = state
        .dispatcher
        .complete_check(&id, body.passed)
        .await
        .map_err(api_error)?;
    Ok(Json(worker).into_response())
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateMessageRequest {
    #[serde(default)]
    parent_id: Option<Uuid>,
    role: Role,
    /// Already-produced text (a user turn). Mutually exclusive with
    /// `work_parameters`.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    work_parameters: Option<WorkParameters>,
}

async fn create_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateMessageRequest>,
) -> ApiResult<Response> {
    let chat_id = parse_id(&id, "chat")?;
    let item = match (body.content, body.work_parameters) {
        (Some(content), None) => state
            .dispatcher
            .record_message(chat_id, body.parent_id, body.role, content)
            .await,
        (None, Some(params)) => state
            .dispatcher
            .create_item(chat_id, body.parent_id, body.role, params)
            .await,
        _ => {
            return Err(bad_request(
                "Exactly one of content or work_parameters is required",
            ));
        }
    }
    .map_err(api_error)?;

    let read = state.dispatcher.message(item.id).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(read)).into_response())
}

async fn get_chat(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let chat_id = parse_id(&id, "chat")?;
    match state.dispatcher.conversation(chat_id).await {
        Some(chat) => Ok(Json(chat).into_response()),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Chat not found"})),
        )),
    }
}

async fn get_message(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let message_id = parse_id(&id, "message")?;
    let read = state.dispatcher.message(message_id).await.map_err(api_error)?;
    Ok(Json(read).into_response())
}

#[derive(Deserialize)]
struct ReportRequest {
    report_type: ReportKind,
    #[serde(default)]
    reason: String,
}

async fn submit_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReportRequest>,
) -> ApiResult<Response> {
    let message_id = parse_id(&id, "message")?;
    let outcome = state
        .dispatcher
        .submit_report(message_id, body.report_type, &body.reason)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

async fn cancel_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let message_id = parse_id(&id, "message")?;
    let read = state.dispatcher.cancel(message_id).await.map_err(api_error)?;
    Ok(Json(read).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FingerprintError;

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = Error::Item(ItemError::NotFound { id: Uuid::nil() });
        assert_eq!(status_for(&not_found), StatusCode::NOT_FOUND);

        let unknown = Error::Worker(WorkerError::Unknown { id: "w".into() });
        assert_eq!(status_for(&unknown), StatusCode::NOT_FOUND);

        let rejected = Error::Worker(WorkerError::Unauthorized { id: "w".into() });
        assert_eq!(status_for(&rejected), StatusCode::UNAUTHORIZED);

        let conflict = Error::Item(ItemError::InvalidTransition {
            id: Uuid::nil(),
            state: "complete".into(),
            signal: "complete".into(),
        });
        assert_eq!(status_for(&conflict), StatusCode::CONFLICT);

        let invalid = Error::Fingerprint(FingerprintError::InvalidConfiguration {
            field: "model_id".into(),
            reason: "empty".into(),
        });
        assert_eq!(status_for(&invalid), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn error_body_carries_message() {
        let (status, Json(body)) = api_error(ItemError::NotFound { id: Uuid::nil() });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }
}
