//! API request/response models and the JSON response envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Stable error codes
pub const CODE_OK: i32 = 0;
pub const CODE_AUTH: i32 = 1001;
pub const CODE_PARAM: i32 = 1002;
pub const CODE_CHANNEL: i32 = 1003;
pub const CODE_AI_CHANNEL: i32 = 1004;
pub const CODE_INTERNAL: i32 = 1005;
pub const CODE_NOT_FOUND: i32 = 1006;

/// Response envelope carried by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// API error mapped to an envelope plus HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub code: i32,
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: i32, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CODE_AUTH, StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(CODE_AUTH, StatusCode::FORBIDDEN, message)
    }

    pub fn param(message: impl Into<String>) -> Self {
        Self::new(CODE_PARAM, StatusCode::BAD_REQUEST, message)
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(CODE_CHANNEL, StatusCode::BAD_REQUEST, message)
    }

    pub fn ai_channel(message: impl Into<String>) -> Self {
        Self::new(CODE_AI_CHANNEL, StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CODE_NOT_FOUND, StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(Envelope {
            code: self.code,
            message: self.message,
            data: None,
        });
        (self.status, body).into_response()
    }
}

/// `code=0` success envelope.
pub fn ok(data: serde_json::Value) -> Json<Envelope> {
    Json(Envelope {
        code: CODE_OK,
        message: "success".to_string(),
        data: Some(data),
    })
}

/// Parameters accepted by `/api/v1/push` (query, form or JSON body).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushParams {
    pub token: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    /// Pipe-separated channel ids, e.g. `"ch1|ch2"`
    pub channels: Option<String>,
    /// AI channel id
    pub ai: Option<String>,
}

impl PushParams {
    pub fn channel_list(&self) -> Vec<String> {
        self.channels
            .as_deref()
            .map(|raw| {
                raw.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_payload(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.is_empty());
        filled(&self.title) || filled(&self.content) || filled(&self.url)
    }
}

/// Per-channel delivery status in `/api/v1/message/{id}` responses.
#[derive(Debug, Serialize)]
pub struct ChannelStatusView {
    pub id: String,
    pub name: String,
    pub status: String,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// AI processing status in `/api/v1/message/{id}` responses.
#[derive(Debug, Serialize)]
pub struct AiStatusView {
    pub id: String,
    pub name: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}
