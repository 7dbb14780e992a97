//! Dispatch Handlers
//!
//! Job handlers for the queue's task types. Each handler owns its slice of
//! the per-attempt state machine: transitions go through the store's CAS
//! primitive, so of several workers racing on the same attempt exactly one
//! observes `waiting -> sending` and the rest skip. A handler error flows
//! into the task's `failed` transition and never kills a worker.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use mp_common::{
    AiAttempt, AiAttemptStatus, AttemptStatus, ChannelAttempt, DispatchResult, ErrorSeverity,
    Message,
};
use mp_queue::{Task, TaskHandler, TaskPriority, TaskQueue, TaskType};
use mp_store::{AiAttemptUpdate, AttemptUpdate, Store, StoreError};

use crate::error::DispatchError;
use crate::ledger::ErrorLedger;
use crate::request::HttpDispatcher;

/// Tunables shared by the handlers, resolved at engine startup from
/// file/env config merged with the store's system_config rows.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Per-attempt retry budget
    pub max_retries: i32,
    /// Age after which a `sending`/`processing` attempt counts as stuck
    pub stuck_threshold: chrono::Duration,
    /// Cap on fetched URL content, in bytes
    pub max_content_length: usize,
    /// Completed queue tasks older than this are purged by `cleanup`
    pub max_task_age: std::time::Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stuck_threshold: chrono::Duration::seconds(600),
            max_content_length: 1_048_576,
            max_task_age: std::time::Duration::from_secs(604800),
        }
    }
}

/// Dependencies shared by every handler.
pub struct DispatchContext {
    pub store: Store,
    pub dispatcher: Arc<HttpDispatcher>,
    pub ledger: Arc<ErrorLedger>,
    pub settings: DispatchSettings,
}

impl DispatchContext {
    /// Store failures are escalated to the ledger as critical before they
    /// fail the task.
    fn store_error(&self, op: &str, err: StoreError) -> DispatchError {
        self.ledger.record(
            "store",
            format!("{}: {}", op, err),
            ErrorSeverity::Critical,
            json!({"op": op}),
        );
        DispatchError::Store(err)
    }
}

fn message_id_of(task: &Task) -> Result<&str, DispatchError> {
    task.data_str("message_id")
        .ok_or(DispatchError::MissingField("message_id"))
}

// ============================================================================
// SendMessage
// ============================================================================

/// Fans a message out to every dispatchable channel attempt.
pub struct SendMessageHandler {
    ctx: Arc<DispatchContext>,
}

impl SendMessageHandler {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    async fn dispatch_one(&self, message: &Message, attempt: &ChannelAttempt) -> DispatchResult {
        let ctx = &self.ctx;
        let attempts = ctx.store.attempts();

        // Claim the attempt; a lost race means another worker owns it
        let claimed = attempts
            .compare_and_set_status(
                &attempt.id,
                attempt.status,
                AttemptStatus::Sending,
                AttemptUpdate::default(),
            )
            .await
            .map_err(|e| ctx.store_error("claim attempt", e));
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(attempt_id = %attempt.id, "Attempt claimed by another worker, skipping");
                return DispatchResult::Success;
            }
            Err(_) => return DispatchResult::Transient,
        }

        let channel = match ctx.store.channels().get(&attempt.channel_id).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = ctx.store_error("load channel", e);
                let _ = attempts
                    .compare_and_set_status(
                        &attempt.id,
                        AttemptStatus::Sending,
                        AttemptStatus::Failed,
                        AttemptUpdate {
                            error: Some(Some("store error loading channel".to_string())),
                            increment_retry: true,
                            ..Default::default()
                        },
                    )
                    .await;
                return DispatchResult::Transient;
            }
        };

        let channel = match channel {
            Some(channel) if channel.status.is_enabled() => channel,
            found => {
                let error = if found.is_some() {
                    "channel disabled"
                } else {
                    "channel not found"
                };
                warn!(attempt_id = %attempt.id, channel_id = %attempt.channel_id, error);
                let _ = attempts
                    .compare_and_set_status(
                        &attempt.id,
                        AttemptStatus::Sending,
                        AttemptStatus::Failed,
                        AttemptUpdate {
                            error: Some(Some(error.to_string())),
                            retry_count: Some(ctx.settings.max_retries),
                            ..Default::default()
                        },
                    )
                    .await;
                return DispatchResult::Permanent;
            }
        };

        let outcome = ctx.dispatcher.dispatch_channel(&channel, message).await;
        match outcome.result {
            DispatchResult::Success => {
                let _ = attempts
                    .compare_and_set_status(
                        &attempt.id,
                        AttemptStatus::Sending,
                        AttemptStatus::Success,
                        AttemptUpdate {
                            error: Some(None),
                            sent_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await;
                info!(
                    message_id = %message.id,
                    channel_id = %channel.id,
                    "Message delivered"
                );
            }
            DispatchResult::Transient => {
                let error = outcome.error_message.clone().unwrap_or_default();
                warn!(
                    message_id = %message.id,
                    channel_id = %channel.id,
                    error = %error,
                    "Transient dispatch failure"
                );
                ctx.ledger.record(
                    "transient-dispatch",
                    error.clone(),
                    ErrorSeverity::Low,
                    json!({"message_id": message.id, "channel_id": channel.id}),
                );
                let _ = attempts
                    .compare_and_set_status(
                        &attempt.id,
                        AttemptStatus::Sending,
                        AttemptStatus::Failed,
                        AttemptUpdate {
                            error: Some(Some(error)),
                            increment_retry: true,
                            ..Default::default()
                        },
                    )
                    .await;
            }
            DispatchResult::Permanent => {
                let error = outcome.error_message.clone().unwrap_or_default();
                warn!(
                    message_id = %message.id,
                    channel_id = %channel.id,
                    error = %error,
                    "Permanent dispatch failure"
                );
                ctx.ledger.record(
                    "permanent-dispatch",
                    error.clone(),
                    ErrorSeverity::Medium,
                    json!({"message_id": message.id, "channel_id": channel.id}),
                );
                let _ = attempts
                    .compare_and_set_status(
                        &attempt.id,
                        AttemptStatus::Sending,
                        AttemptStatus::Failed,
                        AttemptUpdate {
                            error: Some(Some(error)),
                            retry_count: Some(ctx.settings.max_retries),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        }
        outcome.result
    }
}

#[async_trait]
impl TaskHandler for SendMessageHandler {
    async fn handle(&self, task: &Task) -> mp_queue::Result<serde_json::Value> {
        let message_id = message_id_of(task)?;
        let ctx = &self.ctx;

        let message = ctx
            .store
            .messages()
            .get(message_id)
            .await
            .map_err(|e| ctx.store_error("load message", e))?
            .ok_or_else(|| DispatchError::MessageNotFound(message_id.to_string()))?;

        let attempts = ctx
            .store
            .attempts()
            .find_dispatchable(message_id, ctx.settings.max_retries)
            .await
            .map_err(|e| ctx.store_error("load attempts", e))?;

        if attempts.is_empty() {
            debug!(message_id = %message_id, "No dispatchable attempts");
            return Ok(json!({"dispatched": 0}));
        }

        let results = join_all(
            attempts
                .iter()
                .map(|attempt| self.dispatch_one(&message, attempt)),
        )
        .await;

        let succeeded = results
            .iter()
            .filter(|r| matches!(r, DispatchResult::Success))
            .count();
        Ok(json!({
            "dispatched": results.len(),
            "succeeded": succeeded,
        }))
    }
}

// ============================================================================
// AiProcess
// ============================================================================

/// Runs the message's single AI attempt through its state machine.
pub struct AiProcessHandler {
    ctx: Arc<DispatchContext>,
}

impl AiProcessHandler {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    fn is_dispatchable(&self, attempt: &AiAttempt) -> bool {
        match attempt.status {
            AiAttemptStatus::Waiting => true,
            AiAttemptStatus::Failed => attempt.retry_count < self.ctx.settings.max_retries,
            _ => false,
        }
    }
}

/// Extract the completion text from an AI response body.
///
/// JSON bodies must carry `choices[0].message.content`; anything else is a
/// permanent failure. A non-JSON body is stored raw.
fn extract_ai_result(body: &str) -> Result<String, String> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "response missing choices[0].message.content".to_string()),
        Err(_) => Ok(body.to_string()),
    }
}

#[async_trait]
impl TaskHandler for AiProcessHandler {
    async fn handle(&self, task: &Task) -> mp_queue::Result<serde_json::Value> {
        let message_id = message_id_of(task)?;
        let ctx = &self.ctx;
        let repo = ctx.store.ai_attempts();

        let Some(attempt) = repo
            .find_by_message(message_id)
            .await
            .map_err(|e| ctx.store_error("load ai attempt", e))?
        else {
            return Ok(json!({"processed": false}));
        };

        if !self.is_dispatchable(&attempt) {
            debug!(message_id = %message_id, status = %attempt.status, "AI attempt not dispatchable");
            return Ok(json!({"processed": false}));
        }

        let message = ctx
            .store
            .messages()
            .get(message_id)
            .await
            .map_err(|e| ctx.store_error("load message", e))?
            .ok_or_else(|| DispatchError::MessageNotFound(message_id.to_string()))?;

        let claimed = repo
            .compare_and_set_status(
                &attempt.id,
                attempt.status,
                AiAttemptStatus::Processing,
                AiAttemptUpdate::default(),
            )
            .await
            .map_err(|e| ctx.store_error("claim ai attempt", e))?;
        if !claimed {
            debug!(attempt_id = %attempt.id, "AI attempt claimed by another worker");
            return Ok(json!({"processed": false}));
        }

        let ai = match ctx
            .store
            .ai_channels()
            .get(&attempt.ai_channel_id)
            .await
            .map_err(|e| ctx.store_error("load ai channel", e))?
        {
            Some(ai) if ai.status.is_enabled() => ai,
            found => {
                let error = if found.is_some() {
                    "ai channel disabled"
                } else {
                    "ai channel not found"
                };
                let _ = repo
                    .compare_and_set_status(
                        &attempt.id,
                        AiAttemptStatus::Processing,
                        AiAttemptStatus::Failed,
                        AiAttemptUpdate {
                            error: Some(Some(error.to_string())),
                            retry_count: Some(ctx.settings.max_retries),
                            ..Default::default()
                        },
                    )
                    .await;
                return Ok(json!({"processed": false, "error": error}));
            }
        };

        let outcome = ctx.dispatcher.dispatch_ai(&ai, &message, &attempt.prompt).await;
        match outcome.result {
            DispatchResult::Success => {
                let body = outcome.body.unwrap_or_default();
                match extract_ai_result(&body) {
                    Ok(result) => {
                        let _ = repo
                            .compare_and_set_status(
                                &attempt.id,
                                AiAttemptStatus::Processing,
                                AiAttemptStatus::Success,
                                AiAttemptUpdate {
                                    result: Some(result),
                                    processed_at: Some(Utc::now()),
                                    error: Some(None),
                                    ..Default::default()
                                },
                            )
                            .await;
                        info!(message_id = %message.id, ai_channel_id = %ai.id, "AI processing complete");
                        Ok(json!({"processed": true}))
                    }
                    Err(error) => {
                        // HTTP-success but structurally unusable: permanent
                        ctx.ledger.record(
                            "permanent-dispatch",
                            error.clone(),
                            ErrorSeverity::Medium,
                            json!({"message_id": message.id, "ai_channel_id": ai.id}),
                        );
                        let _ = repo
                            .compare_and_set_status(
                                &attempt.id,
                                AiAttemptStatus::Processing,
                                AiAttemptStatus::Failed,
                                AiAttemptUpdate {
                                    error: Some(Some(error.clone())),
                                    retry_count: Some(ctx.settings.max_retries),
                                    ..Default::default()
                                },
                            )
                            .await;
                        Ok(json!({"processed": false, "error": error}))
                    }
                }
            }
            DispatchResult::Transient => {
                let error = outcome.error_message.unwrap_or_default();
                ctx.ledger.record(
                    "transient-dispatch",
                    error.clone(),
                    ErrorSeverity::Low,
                    json!({"message_id": message.id, "ai_channel_id": ai.id}),
                );
                let _ = repo
                    .compare_and_set_status(
                        &attempt.id,
                        AiAttemptStatus::Processing,
                        AiAttemptStatus::Failed,
                        AiAttemptUpdate {
                            error: Some(Some(error.clone())),
                            increment_retry: true,
                            ..Default::default()
                        },
                    )
                    .await;
                Ok(json!({"processed": false, "error": error}))
            }
            DispatchResult::Permanent => {
                let error = outcome.error_message.unwrap_or_default();
                ctx.ledger.record(
                    "permanent-dispatch",
                    error.clone(),
                    ErrorSeverity::Medium,
                    json!({"message_id": message.id, "ai_channel_id": ai.id}),
                );
                let _ = repo
                    .compare_and_set_status(
                        &attempt.id,
                        AiAttemptStatus::Processing,
                        AiAttemptStatus::Failed,
                        AiAttemptUpdate {
                            error: Some(Some(error.clone())),
                            retry_count: Some(ctx.settings.max_retries),
                            ..Default::default()
                        },
                    )
                    .await;
                Ok(json!({"processed": false, "error": error}))
            }
        }
    }
}

// ============================================================================
// UrlFetch
// ============================================================================

/// Fetches the message's URL and stores the decoded text. Failures never
/// affect the message's channel delivery.
pub struct UrlFetchHandler {
    ctx: Arc<DispatchContext>,
}

impl UrlFetchHandler {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for UrlFetchHandler {
    async fn handle(&self, task: &Task) -> mp_queue::Result<serde_json::Value> {
        let message_id = message_id_of(task)?;
        let url = task.data_str("url").ok_or(DispatchError::MissingField("url"))?;
        let ctx = &self.ctx;

        match ctx
            .dispatcher
            .fetch_url(url, ctx.settings.max_content_length)
            .await
        {
            Ok(text) => {
                ctx.store
                    .messages()
                    .set_url_content(message_id, &text)
                    .await
                    .map_err(|e| ctx.store_error("store url content", e))?;
                debug!(message_id = %message_id, bytes = text.len(), "URL content stored");
                Ok(json!({"fetched": true, "bytes": text.len()}))
            }
            Err(err) if err.transient => {
                // Task-level retry drives another fetch
                Err(DispatchError::UrlFetch(err).into())
            }
            Err(err) => {
                warn!(message_id = %message_id, url = %url, error = %err, "URL fetch failed permanently");
                Ok(json!({"fetched": false, "error": err.to_string()}))
            }
        }
    }
}

// ============================================================================
// SystemMaintenance
// ============================================================================

/// Dispatcher task for the scheduler's maintenance actions.
pub struct MaintenanceHandler {
    ctx: Arc<DispatchContext>,
    queue: Arc<TaskQueue>,
}

impl MaintenanceHandler {
    pub fn new(ctx: Arc<DispatchContext>, queue: Arc<TaskQueue>) -> Self {
        Self { ctx, queue }
    }

    fn cleanup(&self, task: &Task) -> serde_json::Value {
        let max_age = task
            .data
            .get("max_age_secs")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.ctx.settings.max_task_age);
        let purged = self.queue.purge_completed(max_age);
        info!(purged, "Maintenance cleanup complete");
        json!({"purged": purged})
    }

    /// Sweep stuck attempts back to `failed`, then re-queue failed work with
    /// remaining budget at low priority.
    async fn retry_failed_messages(&self) -> Result<serde_json::Value, DispatchError> {
        let ctx = &self.ctx;
        let attempts = ctx.store.attempts();
        let ai_attempts = ctx.store.ai_attempts();

        // Recover attempts abandoned mid-send (crash or shutdown)
        let stuck = attempts
            .find_stuck(ctx.settings.stuck_threshold, 500)
            .await
            .map_err(|e| ctx.store_error("find stuck attempts", e))?;
        for attempt in &stuck {
            let recovered = attempts
                .compare_and_set_status(
                    &attempt.id,
                    AttemptStatus::Sending,
                    AttemptStatus::Failed,
                    AttemptUpdate {
                        error: Some(Some("dispatch timed out (stuck in sending)".to_string())),
                        increment_retry: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap_or(false);
            if recovered {
                warn!(attempt_id = %attempt.id, "Recovered stuck attempt");
            }
        }

        let stuck_ai = ai_attempts
            .find_stuck(ctx.settings.stuck_threshold, 500)
            .await
            .map_err(|e| ctx.store_error("find stuck ai attempts", e))?;
        for attempt in &stuck_ai {
            let recovered = ai_attempts
                .compare_and_set_status(
                    &attempt.id,
                    AiAttemptStatus::Processing,
                    AiAttemptStatus::Failed,
                    AiAttemptUpdate {
                        error: Some(Some("ai processing timed out (stuck)".to_string())),
                        increment_retry: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap_or(false);
            if recovered {
                warn!(attempt_id = %attempt.id, "Recovered stuck AI attempt");
            }
        }

        // Re-queue failed work, one low-priority job per message
        let failed = attempts
            .find_failed_with_budget(ctx.settings.max_retries, 500)
            .await
            .map_err(|e| ctx.store_error("find failed attempts", e))?;
        let message_ids: BTreeSet<String> =
            failed.into_iter().map(|a| a.message_id).collect();
        for message_id in &message_ids {
            self.queue.create_task(
                TaskType::SendMessage,
                json!({"message_id": message_id}),
                TaskPriority::Low,
            );
        }

        let failed_ai = ai_attempts
            .find_failed_with_budget(ctx.settings.max_retries, 500)
            .await
            .map_err(|e| ctx.store_error("find failed ai attempts", e))?;
        let ai_message_ids: BTreeSet<String> =
            failed_ai.into_iter().map(|a| a.message_id).collect();
        for message_id in &ai_message_ids {
            self.queue.create_task(
                TaskType::AiProcess,
                json!({"message_id": message_id}),
                TaskPriority::Low,
            );
        }

        if !message_ids.is_empty() || !ai_message_ids.is_empty() {
            info!(
                send_jobs = message_ids.len(),
                ai_jobs = ai_message_ids.len(),
                stuck_recovered = stuck.len() + stuck_ai.len(),
                "Retry sweep complete"
            );
        }

        Ok(json!({
            "send_jobs": message_ids.len(),
            "ai_jobs": ai_message_ids.len(),
            "stuck_recovered": stuck.len() + stuck_ai.len(),
        }))
    }

    async fn generate_stats(&self) -> Result<serde_json::Value, DispatchError> {
        let ctx = &self.ctx;
        let messages = ctx
            .store
            .messages()
            .count()
            .await
            .map_err(|e| ctx.store_error("count messages", e))?;
        let by_status = ctx
            .store
            .attempts()
            .count_by_status()
            .await
            .map_err(|e| ctx.store_error("count attempts", e))?;
        let ai_by_status = ctx
            .store
            .ai_attempts()
            .count_by_status()
            .await
            .map_err(|e| ctx.store_error("count ai attempts", e))?;
        let daily = ctx
            .store
            .messages()
            .daily_counts(7)
            .await
            .map_err(|e| ctx.store_error("daily counts", e))?;

        let stats = json!({
            "messages": messages,
            "attempts": by_status.iter().map(|(s, n)| (s.clone(), *n)).collect::<std::collections::HashMap<_, _>>(),
            "ai_attempts": ai_by_status.iter().map(|(s, n)| (s.clone(), *n)).collect::<std::collections::HashMap<_, _>>(),
            "daily": daily.iter().map(|d| json!({"day": d.day, "count": d.count})).collect::<Vec<_>>(),
        });
        info!(stats = %stats, "System statistics");
        Ok(stats)
    }
}

#[async_trait]
impl TaskHandler for MaintenanceHandler {
    async fn handle(&self, task: &Task) -> mp_queue::Result<serde_json::Value> {
        let action = task
            .data_str("action")
            .ok_or(DispatchError::MissingField("action"))?;

        debug!(action = %action, "Running maintenance action");
        match action {
            "cleanup" => Ok(self.cleanup(task)),
            "retry_failed_messages" => Ok(self.retry_failed_messages().await?),
            "generate_stats" => Ok(self.generate_stats().await?),
            "db_maintenance" => {
                self.ctx
                    .store
                    .vacuum_analyze()
                    .await
                    .map_err(|e| self.ctx.store_error("vacuum", e))?;
                Ok(json!({"maintained": true}))
            }
            other => Err(DispatchError::UnknownAction(other.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::request::{HttpDispatcher, HttpDispatcherConfig};
    use indexmap::indexmap;
    use mp_common::{BodyEncoding, EntityStatus, HttpMethod};
    use mp_queue::TaskQueueConfig;
    use mp_store::channels::NewChannel;
    use mp_store::credentials::NewCredential;
    use mp_store::messages::NewMessage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_ctx() -> Arc<DispatchContext> {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        Arc::new(DispatchContext {
            store,
            dispatcher: Arc::new(HttpDispatcher::new(HttpDispatcherConfig::default())),
            ledger: Arc::new(ErrorLedger::new(LedgerConfig::default())),
            settings: DispatchSettings::default(),
        })
    }

    async fn seed_message(ctx: &DispatchContext, content: &str) -> Message {
        let cred = ctx
            .store
            .credentials()
            .create(NewCredential {
                name: "t".to_string(),
                token: uuid::Uuid::new_v4().to_string(),
                default_channels: vec![],
                default_ai: None,
                expires_at: None,
            })
            .await
            .unwrap();
        ctx.store
            .messages()
            .create(NewMessage {
                api_token_id: cred.id,
                title: Some("hi".to_string()),
                content: Some(content.to_string()),
                url: None,
            })
            .await
            .unwrap()
    }

    async fn seed_channel(ctx: &DispatchContext, api_url: &str) -> mp_common::ChannelTemplate {
        ctx.store
            .channels()
            .create(NewChannel {
                name: "hook".to_string(),
                api_url: api_url.to_string(),
                method: HttpMethod::Post,
                content_type: BodyEncoding::Json,
                params: indexmap! {
                    "t".to_string() => serde_json::json!("{title}"),
                    "b".to_string() => serde_json::json!("{content}"),
                },
                headers: None,
                placeholders: None,
                proxy: None,
                max_length: Some(10),
            })
            .await
            .unwrap()
    }

    fn send_task(message_id: &str) -> Task {
        Task::new(
            TaskType::SendMessage,
            json!({"message_id": message_id}),
            TaskPriority::Normal,
            3,
        )
    }

    #[tokio::test]
    async fn test_send_message_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "hello-world-long").await;
        let channel = seed_channel(&ctx, &format!("{}/p", server.uri())).await;
        ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        let handler = SendMessageHandler::new(ctx.clone());
        let result = handler.handle(&send_task(&message.id)).await.unwrap();
        assert_eq!(result["dispatched"], 1);
        assert_eq!(result["succeeded"], 1);

        let attempt = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert!(attempt.sent_at.is_some());
        assert_eq!(attempt.retry_count, 0);
    }

    #[tokio::test]
    async fn test_send_message_transient_failure_increments_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, &format!("{}/p", server.uri())).await;
        ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        let handler = SendMessageHandler::new(ctx.clone());
        handler.handle(&send_task(&message.id)).await.unwrap();

        let attempt = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.retry_count, 1);
        assert_eq!(attempt.error.as_deref(), Some("HTTP 503"));

        // Still dispatchable: budget remains
        assert_eq!(
            ctx.store
                .attempts()
                .find_dispatchable(&message.id, 3)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_send_message_permanent_failure_exhausts_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, &format!("{}/p", server.uri())).await;
        ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        let handler = SendMessageHandler::new(ctx.clone());
        handler.handle(&send_task(&message.id)).await.unwrap();

        let attempt = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.retry_count, 3);
        assert!(ctx
            .store
            .attempts()
            .find_dispatchable(&message.id, 3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_send_message_disabled_channel() {
        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, "http://127.0.0.1:59999/p").await;
        ctx.store
            .channels()
            .set_status(&channel.id, EntityStatus::Disabled)
            .await
            .unwrap();
        ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        let handler = SendMessageHandler::new(ctx.clone());
        handler.handle(&send_task(&message.id)).await.unwrap();

        let attempt = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error.as_deref(), Some("channel disabled"));
        assert_eq!(attempt.retry_count, 3);
    }

    #[tokio::test]
    async fn test_resubmitting_terminal_message_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, &format!("{}/p", server.uri())).await;
        ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        let handler = SendMessageHandler::new(ctx.clone());
        handler.handle(&send_task(&message.id)).await.unwrap();
        let first = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();

        // Second submission: no dispatchable attempts, stub sees one call total
        let result = handler.handle(&send_task(&message.id)).await.unwrap();
        assert_eq!(result["dispatched"], 0);
        let second = ctx
            .store
            .attempts()
            .find_one(&message.id, &channel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_ai_process_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "summary"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let ai = ctx
            .store
            .ai_channels()
            .create(mp_store::ai_channels::NewAiChannel {
                name: "ai".to_string(),
                api_url: format!("{}/v1/chat/completions", server.uri()),
                model: "m".to_string(),
                params: None,
                headers: None,
                placeholders: None,
                prompt: Some("Summarize.".to_string()),
                proxy: None,
            })
            .await
            .unwrap();
        ctx.store
            .ai_attempts()
            .create(&message.id, &ai.id, "Summarize.")
            .await
            .unwrap();

        let handler = AiProcessHandler::new(ctx.clone());
        let task = Task::new(
            TaskType::AiProcess,
            json!({"message_id": message.id}),
            TaskPriority::Normal,
            3,
        );
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result["processed"], true);

        let attempt = ctx
            .store
            .ai_attempts()
            .find_by_message(&message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AiAttemptStatus::Success);
        assert_eq!(attempt.result.as_deref(), Some("summary"));
        assert!(attempt.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_ai_unusable_response_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let ai = ctx
            .store
            .ai_channels()
            .create(mp_store::ai_channels::NewAiChannel {
                name: "ai".to_string(),
                api_url: format!("{}/v1/chat/completions", server.uri()),
                model: "m".to_string(),
                params: None,
                headers: None,
                placeholders: None,
                prompt: None,
                proxy: None,
            })
            .await
            .unwrap();
        ctx.store
            .ai_attempts()
            .create(&message.id, &ai.id, "")
            .await
            .unwrap();

        let handler = AiProcessHandler::new(ctx.clone());
        let task = Task::new(
            TaskType::AiProcess,
            json!({"message_id": message.id}),
            TaskPriority::Normal,
            3,
        );
        handler.handle(&task).await.unwrap();

        let attempt = ctx
            .store
            .ai_attempts()
            .find_by_message(&message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, AiAttemptStatus::Failed);
        assert_eq!(attempt.retry_count, 3);
    }

    #[tokio::test]
    async fn test_url_fetch_stores_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("page text"))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;

        let handler = UrlFetchHandler::new(ctx.clone());
        let task = Task::new(
            TaskType::UrlFetch,
            json!({"message_id": message.id, "url": format!("{}/page", server.uri())}),
            TaskPriority::High,
            3,
        );
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result["fetched"], true);

        let fetched = ctx.store.messages().get(&message.id).await.unwrap().unwrap();
        assert_eq!(fetched.url_content.as_deref(), Some("page text"));
    }

    #[tokio::test]
    async fn test_url_fetch_permanent_error_is_nonfatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;

        let handler = UrlFetchHandler::new(ctx.clone());
        let task = Task::new(
            TaskType::UrlFetch,
            json!({"message_id": message.id, "url": format!("{}/missing", server.uri())}),
            TaskPriority::High,
            3,
        );
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result["fetched"], false);

        let fetched = ctx.store.messages().get(&message.id).await.unwrap().unwrap();
        assert!(fetched.url_content.is_none());
    }

    #[tokio::test]
    async fn test_maintenance_retry_requeues_failed() {
        let ctx = test_ctx().await;
        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, "http://127.0.0.1:59999/p").await;
        let attempt = ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();

        // Fail the attempt with budget remaining
        ctx.store
            .attempts()
            .compare_and_set_status(
                &attempt.id,
                AttemptStatus::Waiting,
                AttemptStatus::Sending,
                AttemptUpdate::default(),
            )
            .await
            .unwrap();
        ctx.store
            .attempts()
            .compare_and_set_status(
                &attempt.id,
                AttemptStatus::Sending,
                AttemptStatus::Failed,
                AttemptUpdate {
                    error: Some(Some("HTTP 503".to_string())),
                    increment_retry: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        let handler = MaintenanceHandler::new(ctx.clone(), queue.clone());
        let task = Task::new(
            TaskType::SystemMaintenance,
            json!({"action": "retry_failed_messages"}),
            TaskPriority::Normal,
            3,
        );
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result["send_jobs"], 1);

        // The re-queued job is low priority
        let status = queue.get_status();
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn test_maintenance_stuck_sweep() {
        let ctx = test_ctx().await;
        let mut ctx_settings = DispatchSettings::default();
        ctx_settings.stuck_threshold = chrono::Duration::seconds(-1);
        let ctx = Arc::new(DispatchContext {
            store: ctx.store.clone(),
            dispatcher: ctx.dispatcher.clone(),
            ledger: ctx.ledger.clone(),
            settings: ctx_settings,
        });

        let message = seed_message(&ctx, "x").await;
        let channel = seed_channel(&ctx, "http://127.0.0.1:59999/p").await;
        let attempt = ctx.store.attempts().create(&message.id, &channel.id).await.unwrap();
        ctx.store
            .attempts()
            .compare_and_set_status(
                &attempt.id,
                AttemptStatus::Waiting,
                AttemptStatus::Sending,
                AttemptUpdate::default(),
            )
            .await
            .unwrap();

        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        let handler = MaintenanceHandler::new(ctx.clone(), queue.clone());
        let task = Task::new(
            TaskType::SystemMaintenance,
            json!({"action": "retry_failed_messages"}),
            TaskPriority::Normal,
            3,
        );
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result["stuck_recovered"], 1);

        let recovered = ctx.store.attempts().get(&attempt.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, AttemptStatus::Failed);
        assert_eq!(recovered.retry_count, 1);
        // The recovered attempt is picked up by the same sweep's re-queue
        assert_eq!(result["send_jobs"], 1);
    }

    #[tokio::test]
    async fn test_maintenance_unknown_action_fails() {
        let ctx = test_ctx().await;
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        let handler = MaintenanceHandler::new(ctx, queue);
        let task = Task::new(
            TaskType::SystemMaintenance,
            json!({"action": "explode"}),
            TaskPriority::Low,
            0,
        );
        assert!(handler.handle(&task).await.is_err());
    }

    #[test]
    fn test_extract_ai_result() {
        assert_eq!(
            extract_ai_result(r#"{"choices":[{"message":{"content":"ok"}}]}"#).unwrap(),
            "ok"
        );
        assert!(extract_ai_result(r#"{"choices":[]}"#).is_err());
        assert_eq!(extract_ai_result("plain text").unwrap(), "plain text");
    }
}
