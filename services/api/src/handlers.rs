//! Axum Handlers for the REST API
//!
//! Session lifecycle, single-shot transcription and chat, and health. Every
//! failure is reported as an [`ErrorResponse`] carrying a transport code the
//! client maps back onto its fault taxonomy.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use omni_agent_core::{TransportCode, frame::FrameError};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    models::{
        ChatPayload, ChatResponse, CloseSessionResponse, CreateSessionPayload, ErrorResponse,
        HealthResponse, SessionResponse, TranscribeResponse,
    },
    state::AppState,
    store::StoredSession,
};

/// Header naming the session a unary request belongs to.
pub const SESSION_HEADER: &str = "X-Session-ID";

#[derive(Debug)]
pub enum ApiError {
    BadRequest {
        message: String,
        param: Option<String>,
    },
    NotFound(String),
    /// A capability provider failed or could not be reached.
    Upstream(anyhow::Error),
    InternalServerError(anyhow::Error),
}

impl ApiError {
    fn bad_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    fn invalid_config(err: FrameError) -> Self {
        ApiError::bad_param(err.param(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, param) = match self {
            ApiError::BadRequest { message, param } => (
                StatusCode::BAD_REQUEST,
                TransportCode::InvalidArgument,
                message,
                param,
            ),
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, TransportCode::NotFound, message, None)
            }
            ApiError::Upstream(err) => {
                warn!("Upstream provider failure: {:?}", err);
                (
                    StatusCode::BAD_GATEWAY,
                    TransportCode::Unavailable,
                    format!("Upstream provider failed: {err}"),
                    None,
                )
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    TransportCode::Internal,
                    "An internal server error occurred.".to_string(),
                    None,
                )
            }
        };
        let body = ErrorResponse {
            code: code.as_str(),
            message,
            param,
        };
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn session_response(stored: &StoredSession) -> SessionResponse {
    SessionResponse {
        session_id: stored.session.id().to_string(),
        config: stored.session.config().clone(),
        created_at: stored.created_at,
    }
}

async fn find_session(state: &AppState, id: &str) -> Result<StoredSession, ApiError> {
    state
        .sessions
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session with ID '{}' not found", id)))
}

async fn session_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<StoredSession, ApiError> {
    let id = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ApiError::bad_param(SESSION_HEADER, format!("Missing {} header", SESSION_HEADER))
        })?;
    find_session(state, id).await
}

/// Create a new session.
#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionPayload,
    responses(
        (status = 201, description = "Session created successfully", body = SessionResponse),
        (status = 400, description = "Invalid configuration", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let config = payload
        .config
        .resolve(&state.base_session_config())
        .map_err(ApiError::invalid_config)?;
    let stored = state.sessions.create(config).await?;
    Ok((StatusCode::CREATED, Json(session_response(&stored))))
}

/// Get a session by its ID.
#[utoipa::path(
    get,
    path = "/v1/sessions/{id}",
    responses(
        (status = 200, description = "Session found", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "The session ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let stored = find_session(&state, &id).await?;
    Ok(Json(session_response(&stored)))
}

/// Close a session. Closing an unknown or already closed session reports `closed: false`.
#[utoipa::path(
    delete,
    path = "/v1/sessions/{id}",
    responses(
        (status = 200, description = "Close processed", body = CloseSessionResponse)
    ),
    params(
        ("id" = String, Path, description = "The session ID")
    )
)]
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<CloseSessionResponse> {
    let closed = state.sessions.close(&id).await;
    Json(CloseSessionResponse { closed })
}

/// Transcribe a complete PCM16 utterance.
#[utoipa::path(
    post,
    path = "/v1/stt/transcribe",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Transcription", body = TranscribeResponse),
        (status = 400, description = "Missing session header or audio", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 502, description = "Recognizer failed", body = ErrorResponse)
    ),
    params(
        ("X-Session-ID" = String, Header, description = "The session the audio belongs to")
    )
)]
pub async fn transcribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    audio: Bytes,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let stored = session_from_headers(&state, &headers).await?;
    if audio.is_empty() {
        return Err(ApiError::bad_param("audio", "Audio body is empty"));
    }
    info!(session_id = %stored.session.id(), bytes = audio.len(), "Transcribing utterance");
    let text = state
        .recognizer
        .transcribe(audio, stored.session.config())
        .await
        .map_err(ApiError::Upstream)?;
    Ok(Json(TranscribeResponse { text }))
}

/// Generate a complete reply to a conversation.
#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatPayload,
    responses(
        (status = 200, description = "Generated reply", body = ChatResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 502, description = "Generator failed", body = ErrorResponse)
    ),
    params(
        ("X-Session-ID" = String, Header, description = "The session the conversation belongs to")
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<ChatResponse>, ApiError> {
    let stored = session_from_headers(&state, &headers).await?;
    if payload.messages.is_empty() {
        return Err(ApiError::bad_param("messages", "At least one message is required"));
    }
    let config = payload
        .config
        .unwrap_or_default()
        .resolve(stored.session.config())
        .map_err(ApiError::invalid_config)?;
    info!(
        session_id = %stored.session.id(),
        messages = payload.messages.len(),
        model = %config.model,
        "Generating chat reply"
    );
    let reply = state
        .generator
        .complete(payload.messages, &config)
        .await
        .map_err(ApiError::Upstream)?;
    Ok(Json(ChatResponse {
        content: reply.content,
        finish_reason: reply.finish_reason,
    }))
}

/// Report liveness and the server version.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
