//! HTTP request handlers.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use parley_protocol::headers::{STREAM_CLOSED, STREAM_NEXT_OFFSET};
use parley_protocol::{ChunkPayload, ControlAction, Message, PermissionMode, Role, SessionConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::CurrentUser;
use crate::coordinator::{RunInput, RunStarted, RunStatus};
use crate::encoder::{self, ChunkMeta};
use crate::error::ParleyError;
use crate::metadata::SessionMetadata;
use crate::proxy::ReadBody;
use crate::store::ReadOptions;

fn default_true() -> bool {
    true
}

/// Record session activity. Metadata is best-effort and never fails a write.
async fn touch(state: &AppState, session_id: &str, actor_id: &str) {
    if let Err(e) = state.metadata.touch(session_id, actor_id).await {
        warn!("Failed to update metadata for session {}: {:?}", session_id, e);
    }
}

/// A user-originated entry that was appended.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Appended {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<String>,
}

/// Encode a single-shot chunk as the user and append it.
async fn append_single(
    state: &AppState,
    session_id: &str,
    user: &CurrentUser,
    role: Role,
    payload: ChunkPayload,
    txid: Option<String>,
) -> ApiResult<Appended> {
    let message_id = encoder::new_message_id();
    let entry = encoder::encode(
        &payload,
        &ChunkMeta::single(message_id.as_str(), user.id(), role, Utc::now()).with_txid(txid),
    )?;
    let outcome = state.producer.append(session_id, &entry, None).await?;
    debug!(
        "Appended {} {} to session {}",
        payload.kind(),
        message_id,
        session_id
    );
    touch(state, session_id, user.id()).await;
    Ok(Appended {
        message_id,
        next_offset: outcome.next_offset,
    })
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_runs: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_runs: state.coordinator.active_runs(),
    })
}

// ============================================================================
// Stream
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub offset: Option<String>,
    pub cursor: Option<String>,
    /// `sse` (or `true`) tails the stream.
    pub live: Option<String>,
}

fn parse_live(value: Option<&str>) -> ApiResult<bool> {
    match value {
        None | Some("") | Some("false") => Ok(false),
        Some("sse") | Some("true") => Ok(true),
        Some(other) => Err(ApiError::bad_request(format!(
            "unsupported live mode: {}",
            other
        ))),
    }
}

/// Catch-up or live read of a session stream.
pub async fn read_stream(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let live = parse_live(query.live.as_deref())?;
    let options = ReadOptions {
        offset: query.offset,
        cursor: query.cursor,
        live,
    };
    let read = state.proxy.read(&session_id, &options).await?;

    let body = match read.body {
        ReadBody::Batch(bytes) => Body::from(bytes),
        ReadBody::Live(stream) => {
            Body::from_stream(stream.take_until(state.shutdown.clone().cancelled_owned()))
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = read.status;
    *response.headers_mut() = read.headers;
    if live {
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }
    Ok(response)
}

/// Raw producer append. The body is a pre-encoded entry; producer headers
/// pass through and the store's verdict is relayed back.
pub async fn append_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if body.is_empty() {
        return Err(ApiError::bad_request("append body must not be empty"));
    }
    encoder::validate_append_body(&body)?;
    state.producer.ensure_stream(&session_id).await?;
    let relayed = state.producer.forward(&session_id, body, &headers).await?;
    if relayed.status.is_success() {
        touch(&state, &session_id, user.id()).await;
    }

    let mut response = Response::new(Body::from(relayed.body));
    *response.status_mut() = relayed.status;
    *response.headers_mut() = relayed.headers;
    Ok(response)
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub content: String,
    /// Start an agent run answering this message.
    #[serde(default = "default_true")]
    pub start_run: bool,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub txid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageResponse {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunStarted>,
}

/// Append a user message, optionally starting a run that answers it.
pub async fn post_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(request): Json<PostMessageRequest>,
) -> ApiResult<Response> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("message content must not be empty"));
    }

    if !request.start_run {
        state.producer.ensure_stream(&session_id).await?;
        let appended = append_single(
            &state,
            &session_id,
            &user,
            Role::User,
            ChunkPayload::WholeMessage {
                message: Message::user(request.content),
            },
            request.txid,
        )
        .await?;
        return Ok(Json(PostMessageResponse {
            message_id: appended.message_id,
            next_offset: appended.next_offset,
            run: None,
        })
        .into_response());
    }

    // The coordinator appends the prompt after superseding any active run.
    let started = state
        .coordinator
        .start(
            &session_id,
            RunInput {
                actor_id: user.id().to_string(),
                prompt: Some(request.content),
                model: request.model,
                cwd: request.cwd,
                permission_mode: request.permission_mode,
                txid: request.txid,
            },
        )
        .await?;
    touch(&state, &session_id, user.id()).await;
    info!(
        "User {} started run {} on session {}",
        user.id(),
        started.run_id,
        session_id
    );

    let response = PostMessageResponse {
        message_id: started.prompt_message_id.clone().unwrap_or_default(),
        next_offset: None,
        run: Some(started),
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

// ============================================================================
// Tool results
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultRequest {
    pub tool_call_id: String,
    #[serde(default)]
    pub output: String,
    pub error: Option<String>,
    pub txid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultResponse {
    #[serde(flatten)]
    pub appended: Appended,
    /// Whether an active run received the result.
    pub delivered: bool,
}

/// Append a client-side tool result and hand it to the waiting run.
pub async fn post_tool_result(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(request): Json<ToolResultRequest>,
) -> ApiResult<Json<ToolResultResponse>> {
    if request.tool_call_id.trim().is_empty() {
        return Err(ApiError::bad_request("toolCallId must not be empty"));
    }

    let appended = append_single(
        &state,
        &session_id,
        &user,
        Role::Tool,
        ChunkPayload::ToolResult {
            tool_call_id: request.tool_call_id.clone(),
            output: request.output.clone(),
            error: request.error.clone(),
        },
        request.txid,
    )
    .await?;

    let delivered = state
        .coordinator
        .deliver_tool_result(
            &session_id,
            &request.tool_call_id,
            request.output,
            request.error,
        )
        .await;

    Ok(Json(ToolResultResponse {
        appended,
        delivered,
    }))
}

// ============================================================================
// Approvals
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approved: bool,
    pub answers: Option<Value>,
    pub txid: Option<String>,
}

/// Record an approval decision and resume the paused run.
pub async fn post_approval(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((session_id, approval_id)): Path<(String, String)>,
    Json(request): Json<ApprovalRequest>,
) -> ApiResult<Json<Appended>> {
    let status = state
        .coordinator
        .status(&session_id)
        .await
        .ok_or_else(|| ParleyError::RunNotFound(session_id.clone()))?;
    if status.pending_approval_id.as_deref() != Some(approval_id.as_str()) {
        return Err(ParleyError::ApprovalNotPending(approval_id).into());
    }

    let appended = append_single(
        &state,
        &session_id,
        &user,
        Role::User,
        ChunkPayload::ApprovalResponse {
            approval_id: approval_id.clone(),
            approved: request.approved,
            answers: request.answers.clone(),
        },
        request.txid,
    )
    .await?;

    state
        .coordinator
        .resume(
            &session_id,
            Some(&approval_id),
            request.approved,
            request.answers,
        )
        .await?;

    Ok(Json(appended))
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub action: ControlAction,
    pub txid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    #[serde(flatten)]
    pub appended: Appended,
    /// Whether an active run was aborted.
    pub cancelled: bool,
}

/// Append a control action and apply it.
pub async fn post_control(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<Json<ControlResponse>> {
    let payload = ChunkPayload::Control {
        action: request.action,
    };

    let response = match request.action {
        ControlAction::Stop => {
            let appended =
                append_single(&state, &session_id, &user, Role::User, payload, request.txid)
                    .await?;
            let reason = format!("stopped by {}", user.id());
            let cancelled = state.coordinator.cancel(&session_id, &reason).await?;
            ControlResponse {
                appended,
                cancelled,
            }
        }
        ControlAction::Close => {
            // The run's abort marker must land before the stream closes.
            let cancelled = state
                .coordinator
                .cancel(&session_id, "stream closed")
                .await?;
            let message_id = encoder::new_message_id();
            let entry = encoder::encode(
                &payload,
                &ChunkMeta::single(message_id.as_str(), user.id(), Role::User, Utc::now())
                    .with_txid(request.txid),
            )?;
            let outcome = state
                .producer
                .close_stream(&session_id, &entry, None)
                .await?;
            touch(&state, &session_id, user.id()).await;
            info!("Session {} closed by {}", session_id, user.id());
            ControlResponse {
                appended: Appended {
                    message_id,
                    next_offset: outcome.next_offset,
                },
                cancelled,
            }
        }
    };

    Ok(Json(response))
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    #[serde(flatten)]
    pub config: SessionConfig,
    pub txid: Option<String>,
}

/// Append a session config update.
pub async fn post_config(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(request): Json<ConfigRequest>,
) -> ApiResult<Json<Appended>> {
    if request.config.is_empty() {
        return Err(ApiError::bad_request("config update sets no fields"));
    }

    state.producer.ensure_stream(&session_id).await?;
    let title = request.config.title.clone();
    let appended = append_single(
        &state,
        &session_id,
        &user,
        Role::User,
        ChunkPayload::Config(request.config),
        request.txid,
    )
    .await?;

    if let Some(title) = title
        && let Err(e) = state.metadata.set_title(&session_id, &title).await
    {
        warn!("Failed to set title of session {}: {:?}", session_id, e);
    }

    Ok(Json(appended))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<String>,
    pub closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunStatus>,
}

/// Stream position, metadata and active run of a session.
pub async fn get_session(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let headers = state.proxy.head(&session_id).await?;
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let metadata = match state.metadata.get(&session_id).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("Failed to read metadata of session {}: {:?}", session_id, e);
            None
        }
    };

    Ok(Json(SessionInfo {
        next_offset: header(STREAM_NEXT_OFFSET).map(str::to_string),
        closed: header(STREAM_CLOSED) == Some("true"),
        metadata,
        run: state.coordinator.status(&session_id).await,
        id: session_id,
    }))
}

/// Existence check. Relays the stream's position headers.
pub async fn head_session(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<(StatusCode, HeaderMap)> {
    let headers = state.proxy.head(&session_id).await?;
    Ok((StatusCode::OK, headers))
}

/// Delete the session stream, its metadata and any active run.
pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.coordinator.forget(&session_id).await;
    let deleted = state.producer.delete_stream(&session_id).await;

    if let Err(e) = state.metadata.delete(&session_id).await {
        warn!("Failed to delete metadata of session {}: {:?}", session_id, e);
    }

    deleted?;
    info!("Session {} deleted by {}", session_id, user.id());
    Ok(StatusCode::NO_CONTENT)
}

/// The session's active run.
pub async fn get_run(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<RunStatus>> {
    state
        .coordinator
        .status(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| ParleyError::RunNotFound(session_id).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_live() {
        assert!(!parse_live(None).unwrap());
        assert!(!parse_live(Some("false")).unwrap());
        assert!(parse_live(Some("sse")).unwrap());
        assert!(parse_live(Some("true")).unwrap());
        assert!(parse_live(Some("long-poll")).is_err());
    }

    #[test]
    fn test_config_request_flattens_fields() {
        let request: ConfigRequest = serde_json::from_str(
            r#"{"model":"gpt-4o","permissionMode":"plan","txid":"t1"}"#,
        )
        .unwrap();
        assert_eq!(request.config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.config.permission_mode, Some(PermissionMode::Plan));
        assert_eq!(request.txid.as_deref(), Some("t1"));
    }

    #[test]
    fn test_post_message_defaults_to_starting_a_run() {
        let request: PostMessageRequest =
            serde_json::from_str(r#"{"content":"fix bug"}"#).unwrap();
        assert!(request.start_run);
        assert!(request.permission_mode.is_none());
    }
}
