//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the streaming WebSocket endpoint, and OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{
        ChatPayload, ChatResponse, CloseSessionResponse, CreateSessionPayload, ErrorResponse,
        HealthResponse, SessionResponse, TranscribeResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::get_session,
        handlers::close_session,
        handlers::transcribe,
        handlers::chat,
        handlers::health,
    ),
    components(
        schemas(
            CreateSessionPayload,
            SessionResponse,
            CloseSessionResponse,
            TranscribeResponse,
            ChatPayload,
            ChatResponse,
            HealthResponse,
            ErrorResponse
        )
    ),
    tags(
        (name = "Omni-Agent API", description = "Sessions, unary speech and chat calls for the Omni-Agent")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Streams enforce the same cap on their buffered audio.
    let max_audio_bytes = app_state.config.max_audio_bytes;
    let api_router = Router::new()
        .route("/v1/sessions", post(handlers::create_session))
        .route(
            "/v1/sessions/{id}",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route(
            "/v1/stt/transcribe",
            post(handlers::transcribe).layer(DefaultBodyLimit::max(max_audio_bytes)),
        )
        .route("/v1/chat", post(handlers::chat))
        .route("/v1/stream", get(ws_handler))
        .route("/health", get(handlers::health))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
