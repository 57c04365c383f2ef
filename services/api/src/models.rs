//! API Models
//!
//! Request and response bodies for the REST surface, annotated for OpenAPI
//! generation with `utoipa`. Core types without a schema are documented as
//! plain objects.

use chrono::{DateTime, Utc};
use omni_agent_core::{ConfigOverrides, Message, SessionConfig};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct CreateSessionPayload {
    /// Overrides applied on top of the server defaults. Every field is optional.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: ConfigOverrides,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionResponse {
    pub session_id: String,
    #[schema(value_type = Object)]
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy)]
pub struct CloseSessionResponse {
    /// `false` when the session was already closed or never existed.
    pub closed: bool,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct TranscribeResponse {
    pub text: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct ChatPayload {
    /// The full conversation to answer, oldest first.
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<Message>,
    /// Per-request overrides on top of the session config.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub config: Option<ConfigOverrides>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ErrorResponse {
    /// Machine-readable transport code, e.g. `not_found` or `invalid_argument`.
    #[schema(example = "not_found")]
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_omits_missing_param() {
        let body = ErrorResponse {
            code: "not_found".into(),
            message: "Session with ID 'x' not found".into(),
            param: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "not_found");
        assert!(json.get("param").is_none());
    }

    #[test]
    fn test_create_session_payload_config_is_optional() {
        let payload: CreateSessionPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload.config, ConfigOverrides::default());

        let payload: CreateSessionPayload =
            serde_json::from_str(r#"{"config":{"temperature":0.3}}"#).unwrap();
        assert_eq!(payload.config.temperature, Some(0.3));
    }
}
