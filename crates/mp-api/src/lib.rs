//! MessagePusher HTTP API
//!
//! JSON-over-HTTP ingress under `/api/v1`:
//! - `POST|GET /api/v1/push` — submit a message for dispatch
//! - `GET /api/v1/message/{id}` — per-channel delivery status and AI result
//!
//! Every request carries the credential token as a query parameter or form
//! field; every response uses the `{code, message, data}` envelope.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Host, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::{info, warn};

use mp_common::{Credential, EntityStatus, ErrorSeverity};
use mp_dispatch::Engine;
use mp_queue::{TaskPriority, TaskType};
use mp_store::messages::NewMessage;
use mp_store::StoreError;

pub mod model;

use model::{AiStatusView, ApiError, ChannelStatusView, PushParams};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the API router.
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/v1/push", get(push_get).post(push_post))
        .route("/api/v1/message/:id", get(message_status))
        .route("/health", get(health))
        .fallback(not_found_fallback)
        .with_state(AppState { engine })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "UP"}))
}

impl AppState {
    fn store_error(&self, op: &str, err: StoreError) -> ApiError {
        self.engine.ledger().record(
            "store",
            format!("{}: {}", op, err),
            ErrorSeverity::Critical,
            json!({"op": op}),
        );
        ApiError::internal(format!("internal error: {}", op))
    }

    /// Resolve and validate the caller's credential.
    async fn authenticate(&self, token: Option<&str>) -> Result<Credential, ApiError> {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => {
                warn!("API request missing token");
                return Err(ApiError::auth("missing API token"));
            }
        };

        let credential = self
            .engine
            .store()
            .credentials()
            .find_by_token(token)
            .await
            .map_err(|e| self.store_error("load credential", e))?
            .ok_or_else(|| {
                warn!("Invalid API token");
                ApiError::auth("invalid API token")
            })?;

        if !credential.status.is_enabled() {
            return Err(ApiError::auth("API token disabled"));
        }
        if !credential.is_valid(chrono::Utc::now()) {
            return Err(ApiError::auth("API token expired"));
        }
        Ok(credential)
    }
}

async fn push_get(
    State(state): State<AppState>,
    Host(host): Host,
    Query(params): Query<PushParams>,
) -> Result<Response, ApiError> {
    push_impl(state, params, host).await
}

async fn push_post(
    State(state): State<AppState>,
    Host(host): Host,
    Query(query): Query<PushParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mut params: PushParams = if content_type.starts_with("application/json") {
        serde_json::from_slice(&body).map_err(|e| ApiError::param(format!("bad JSON body: {}", e)))?
    } else if content_type.starts_with("application/x-www-form-urlencoded") || body.is_empty() {
        serde_urlencoded::from_bytes(&body)
            .map_err(|e| ApiError::param(format!("bad form body: {}", e)))?
    } else {
        return Err(ApiError::param(format!(
            "unsupported content type {:?}",
            content_type
        )));
    };

    // The token may arrive as a query parameter regardless of body encoding
    if params.token.is_none() {
        params.token = query.token;
    }

    push_impl(state, params, host).await
}

async fn push_impl(state: AppState, params: PushParams, host: String) -> Result<Response, ApiError> {
    let credential = state.authenticate(params.token.as_deref()).await?;

    if !params.has_payload() {
        return Err(ApiError::param(
            "at least one of title, content, url is required",
        ));
    }

    let store = state.engine.store();

    // Resolve channels: explicit parameter, else the credential's defaults.
    // Validation happens before any row is written.
    let requested = {
        let explicit = params.channel_list();
        if explicit.is_empty() {
            credential.default_channels.clone()
        } else {
            explicit
        }
    };

    let mut channels = Vec::new();
    for channel_id in &requested {
        let channel = store
            .channels()
            .get(channel_id)
            .await
            .map_err(|e| state.store_error("load channel", e))?;
        match channel {
            Some(channel) if channel.status == EntityStatus::Enabled => channels.push(channel),
            _ => warn!(channel_id = %channel_id, "Requested channel missing or disabled"),
        }
    }
    if channels.is_empty() && !requested.is_empty() {
        return Err(ApiError::channel("channel not found or disabled"));
    }

    // Resolve the AI channel: explicit parameter, else the credential default
    let ai_id = params.ai.clone().or_else(|| credential.default_ai.clone());
    let ai_channel = match &ai_id {
        Some(ai_id) => {
            let ai = store
                .ai_channels()
                .get(ai_id)
                .await
                .map_err(|e| state.store_error("load ai channel", e))?;
            match ai {
                Some(ai) if ai.status == EntityStatus::Enabled => Some(ai),
                _ => return Err(ApiError::ai_channel("AI channel not found or disabled")),
            }
        }
        None => None,
    };

    // Everything validated; write the message and its attempt rows
    let message = store
        .messages()
        .create(NewMessage {
            api_token_id: credential.id.clone(),
            title: params.title.clone(),
            content: params.content.clone(),
            url: params.url.clone(),
        })
        .await
        .map_err(|e| state.store_error("create message", e))?;

    for channel in &channels {
        store
            .attempts()
            .create(&message.id, &channel.id)
            .await
            .map_err(|e| state.store_error("create attempt", e))?;
    }
    if let Some(ai) = &ai_channel {
        let prompt = ai.prompt.clone().unwrap_or_default();
        store
            .ai_attempts()
            .create(&message.id, &ai.id, &prompt)
            .await
            .map_err(|e| state.store_error("create ai attempt", e))?;
    }

    // Queue the work: URL fetch first, then dispatch and AI processing
    let queue = state.engine.queue();
    if let Some(url) = &params.url {
        if !url.is_empty() {
            queue.create_task(
                TaskType::UrlFetch,
                json!({"message_id": message.id, "url": url}),
                TaskPriority::High,
            );
        }
    }
    if !channels.is_empty() {
        queue.create_task(
            TaskType::SendMessage,
            json!({"message_id": message.id}),
            TaskPriority::Normal,
        );
    }
    if ai_channel.is_some() {
        queue.create_task(
            TaskType::AiProcess,
            json!({"message_id": message.id}),
            TaskPriority::Normal,
        );
    }

    info!(message_id = %message.id, channels = channels.len(), "Message accepted");

    let data = json!({
        "message_id": message.id,
        "channels": channels.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        "ai": ai_channel.as_ref().map(|a| a.id.clone()),
        "view_url": view_url(&host, &message.view_token),
    });
    Ok(model::ok(data).into_response())
}

async fn message_status(
    State(state): State<AppState>,
    Host(host): Host,
    Path(message_id): Path<String>,
    Query(params): Query<PushParams>,
) -> Result<Response, ApiError> {
    let credential = state.authenticate(params.token.as_deref()).await?;
    let store = state.engine.store();

    let message = store
        .messages()
        .get(&message_id)
        .await
        .map_err(|e| state.store_error("load message", e))?
        .ok_or_else(|| ApiError::not_found("message not found"))?;

    if message.api_token_id != credential.id {
        warn!(message_id = %message_id, "Ownership violation");
        return Err(ApiError::forbidden("not allowed to access this message"));
    }

    let attempts = store
        .attempts()
        .find_by_message(&message_id)
        .await
        .map_err(|e| state.store_error("load attempts", e))?;
    let mut channels = Vec::with_capacity(attempts.len());
    for attempt in &attempts {
        let name = store
            .channels()
            .get(&attempt.channel_id)
            .await
            .map_err(|e| state.store_error("load channel", e))?
            .map(|c| c.name)
            .unwrap_or_default();
        channels.push(ChannelStatusView {
            id: attempt.channel_id.clone(),
            name,
            status: attempt.status.to_string(),
            error: attempt.error.clone(),
            sent_at: attempt.sent_at,
        });
    }

    let ai = match store
        .ai_attempts()
        .find_by_message(&message_id)
        .await
        .map_err(|e| state.store_error("load ai attempt", e))?
    {
        Some(attempt) => {
            let name = store
                .ai_channels()
                .get(&attempt.ai_channel_id)
                .await
                .map_err(|e| state.store_error("load ai channel", e))?
                .map(|a| a.name)
                .unwrap_or_default();
            Some(AiStatusView {
                id: attempt.ai_channel_id.clone(),
                name,
                status: attempt.status.to_string(),
                result: attempt.result.clone(),
                error: attempt.error.clone(),
                processed_at: attempt.processed_at,
            })
        }
        None => None,
    };

    let data = json!({
        "message_id": message.id,
        "title": message.title,
        "content": message.content,
        "url": message.url,
        "url_content": message.url_content,
        "channels": channels,
        "ai": ai,
        "created_at": message.created_at,
        "view_url": view_url(&host, &message.view_token),
    });
    Ok(model::ok(data).into_response())
}

fn view_url(host: &str, view_token: &str) -> String {
    format!("http://{}/view/{}", host, view_token)
}

/// 404 fallback in the response envelope.
pub async fn not_found_fallback() -> Response {
    ApiError::new(
        model::CODE_NOT_FOUND,
        StatusCode::NOT_FOUND,
        "resource not found",
    )
    .into_response()
}
