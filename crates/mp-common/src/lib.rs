use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Template Types
// ============================================================================

/// HTTP method a channel template dispatches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    /// GET and DELETE carry parameters in the query string and send no body.
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body encoding for POST/PUT channel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Form,
    Json,
    Xml,
}

impl BodyEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyEncoding::Form => "form",
            BodyEncoding::Json => "json",
            BodyEncoding::Xml => "xml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "form" => Some(BodyEncoding::Form),
            "json" => Some(BodyEncoding::Json),
            "xml" => Some(BodyEncoding::Xml),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BodyEncoding::Form => "application/x-www-form-urlencoded",
            BodyEncoding::Json => "application/json",
            BodyEncoding::Xml => "application/xml",
        }
    }
}

/// Enabled/disabled switch shared by channels, AI channels and credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Enabled,
    Disabled,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Enabled => "enabled",
            EntityStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "enabled" => Some(EntityStatus::Enabled),
            "disabled" => Some(EntityStatus::Disabled),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, EntityStatus::Enabled)
    }
}

/// Outbound proxy configuration for a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    /// Stable key for caching one HTTP client per proxy configuration.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}",
            self.http.as_deref().unwrap_or(""),
            self.https.as_deref().unwrap_or("")
        )
    }
}

/// A parameterised description of how to call an external push service.
///
/// `params` values may contain `{name}` placeholders which the request
/// builder resolves against the template's `placeholders` plus the
/// message-derived bindings (`title`, `content`, `url`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTemplate {
    pub id: String,
    pub name: String,
    pub api_url: String,
    pub method: HttpMethod,
    pub content_type: BodyEncoding,
    pub params: IndexMap<String, serde_json::Value>,
    pub headers: Option<IndexMap<String, String>>,
    pub placeholders: Option<IndexMap<String, String>>,
    pub proxy: Option<ProxyConfig>,
    pub max_length: u32,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_MAX_LENGTH: u32 = 2000;

/// A parameterised description of a chat-completion style AI endpoint.
///
/// Dispatch is always an HTTP POST with a JSON body; `prompt` becomes the
/// system message and is additionally available as the `{prompt}`
/// placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiChannelTemplate {
    pub id: String,
    pub name: String,
    pub api_url: String,
    pub model: String,
    pub params: Option<IndexMap<String, serde_json::Value>>,
    pub headers: Option<IndexMap<String, String>>,
    pub placeholders: Option<IndexMap<String, String>>,
    pub prompt: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Credential & Message Types
// ============================================================================

/// Long-lived opaque token authorising a caller to submit messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub token: String,
    pub default_channels: Vec<String>,
    pub default_ai: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// A credential is valid iff enabled and not past its expiry.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status.is_enabled() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// A submitted message. Immutable after creation except for `url_content`
/// and `file_storage`, which the URL fetch handler populates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub api_token_id: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub url_content: Option<String>,
    pub file_storage: Option<String>,
    pub view_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// At least one of title/content/url must be present at creation.
    pub fn has_payload(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.is_empty());
        filled(&self.title) || filled(&self.content) || filled(&self.url)
    }
}

// ============================================================================
// Attempt Types
// ============================================================================

/// Delivery state of one (message, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Waiting,
    Sending,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Waiting => "waiting",
            AttemptStatus::Sending => "sending",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(AttemptStatus::Waiting),
            "sending" => Some(AttemptStatus::Sending),
            "success" => Some(AttemptStatus::Success),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }

    /// Once success is reached the row is terminal and never rewritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Success)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of the (message, ai_channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiAttemptStatus {
    Waiting,
    Processing,
    Success,
    Failed,
}

impl AiAttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiAttemptStatus::Waiting => "waiting",
            AiAttemptStatus::Processing => "processing",
            AiAttemptStatus::Success => "success",
            AiAttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(AiAttemptStatus::Waiting),
            "processing" => Some(AiAttemptStatus::Processing),
            "success" => Some(AiAttemptStatus::Success),
            "failed" => Some(AiAttemptStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AiAttemptStatus::Success)
    }
}

impl std::fmt::Display for AiAttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of a single (message, channel) delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAttempt {
    pub id: String,
    pub message_id: String,
    pub channel_id: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent record of the AI processing attempt for a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAttempt {
    pub id: String,
    pub message_id: String,
    pub ai_channel_id: String,
    pub prompt: String,
    pub result: Option<String>,
    pub status: AiAttemptStatus,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Dispatch Outcome
// ============================================================================

/// Classification of a dispatch attempt result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Delivered: HTTP status in [200, 300).
    Success,
    /// Retriable within the attempt's budget: network/timeout errors and
    /// 408, 425, 429, 500, 502, 503, 504.
    Transient,
    /// Terminal: every other non-success status, and structurally unusable
    /// success responses.
    Permanent,
}

/// Outcome of a dispatch attempt including the observed status and error.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: DispatchResult,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// Response body, captured for AI result extraction.
    pub body: Option<String>,
}

impl DispatchOutcome {
    pub fn success(status_code: u16, body: Option<String>) -> Self {
        Self {
            result: DispatchResult::Success,
            status_code: Some(status_code),
            error_message: None,
            body,
        }
    }

    pub fn transient(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: DispatchResult::Transient,
            status_code,
            error_message: Some(message),
            body: None,
        }
    }

    pub fn permanent(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: DispatchResult::Permanent,
            status_code,
            error_message: Some(message),
            body: None,
        }
    }
}

/// Classify an HTTP response status per the dispatch state machine.
pub fn classify_status(status: u16) -> DispatchResult {
    match status {
        200..=299 => DispatchResult::Success,
        408 | 425 | 429 | 500 | 502 | 503 | 504 => DispatchResult::Transient,
        _ => DispatchResult::Permanent,
    }
}

// ============================================================================
// Error Ledger Types
// ============================================================================

/// Severity of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 4] = [
        ErrorSeverity::Low,
        ErrorSeverity::Medium,
        ErrorSeverity::High,
        ErrorSeverity::Critical,
    ];
}

/// A categorised error record held in the in-memory ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl ErrorRecord {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            error_type: error_type.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            context,
        }
    }
}
