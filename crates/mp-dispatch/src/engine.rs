//! Engine supervisor
//!
//! Process-wide lifecycle: initialise the store (schema + seed), merge the
//! store's system_config rows over file/env configuration, wire the queue,
//! dispatcher, ledger and scheduler together, and start/stop the components
//! in declared order. Multiple isolated engines can coexist in one process,
//! which the tests rely on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use mp_config::AppConfig;
use mp_queue::{QueueStatus, TaskQueue, TaskQueueConfig, TaskType};
use mp_scheduler::{SchedulerConfig, TaskScheduler};
use mp_store::Store;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::handlers::{
    AiProcessHandler, DispatchContext, DispatchSettings, MaintenanceHandler, SendMessageHandler,
    UrlFetchHandler,
};
use crate::ledger::{ErrorLedger, LedgerConfig, LedgerStatus};
use crate::request::{HttpDispatcher, HttpDispatcherConfig};
use mp_queue::{Task, TaskHandler};

/// Wraps a handler so any unclassified error it surfaces lands in the
/// ledger (medium severity) before failing the task.
struct LedgeredHandler {
    inner: Arc<dyn TaskHandler>,
    ledger: Arc<ErrorLedger>,
}

#[async_trait]
impl TaskHandler for LedgeredHandler {
    async fn handle(&self, task: &Task) -> mp_queue::Result<serde_json::Value> {
        match self.inner.handle(task).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.ledger.record(
                    "handler",
                    err.to_string(),
                    mp_common::ErrorSeverity::Medium,
                    serde_json::json!({
                        "task_id": task.id,
                        "task_type": task.task_type.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }
}

/// Engine status snapshot.
#[derive(Debug)]
pub struct EngineStatus {
    pub running: bool,
    pub scheduler_running: bool,
    pub queue: QueueStatus,
    pub ledger: LedgerStatus,
}

/// The dispatch engine: store, queue, scheduler and ledger under one handle.
pub struct Engine {
    config: AppConfig,
    store: Store,
    queue: Arc<TaskQueue>,
    scheduler: TaskScheduler,
    ledger: Arc<ErrorLedger>,
    dispatcher: Arc<HttpDispatcher>,
    settings: DispatchSettings,
    running: AtomicBool,
}

impl Engine {
    /// Open the configured store file and initialise the engine.
    pub async fn init(config: AppConfig) -> Result<Self, DispatchError> {
        let store = Store::open(&config.database.path, config.database.max_connections).await?;
        Self::init_with_store(config, store).await
    }

    /// Initialise against an existing store (tests use an in-memory one).
    pub async fn init_with_store(config: AppConfig, store: Store) -> Result<Self, DispatchError> {
        store.init_schema().await?;

        // system_config rows win over file/env for the tunables they own
        let overrides = store.system_config().get_all().await?;
        let mut settings = DispatchSettings {
            max_retries: config.dispatch.max_retries,
            stuck_threshold: chrono::Duration::seconds(config.dispatch.stuck_threshold_secs),
            max_content_length: config.dispatch.max_content_length,
            max_task_age: Duration::from_secs(config.scheduler.max_task_age_secs),
        };
        if let Some(max_retries) = overrides.get("max_retry_count").and_then(|v| v.parse().ok()) {
            settings.max_retries = max_retries;
        }
        let retry_interval = overrides
            .get("retry_interval")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.scheduler.retry_interval_secs);

        let queue = Arc::new(TaskQueue::new(TaskQueueConfig {
            max_workers: config.queue.max_workers,
            worker_idle_timeout: Duration::from_millis(config.queue.worker_idle_timeout_ms),
            max_retries: config.queue.max_retries,
            retry_delay: Duration::from_secs(config.queue.retry_delay_secs),
        }));

        let ledger = Arc::new(ErrorLedger::new(LedgerConfig {
            max_error_history: config.ledger.max_error_history,
            thresholds: [
                (mp_common::ErrorSeverity::Low, config.ledger.threshold_low),
                (mp_common::ErrorSeverity::Medium, config.ledger.threshold_medium),
                (mp_common::ErrorSeverity::High, config.ledger.threshold_high),
                (mp_common::ErrorSeverity::Critical, config.ledger.threshold_critical),
            ]
            .into_iter()
            .collect(),
        }));

        let dispatcher = Arc::new(HttpDispatcher::new(HttpDispatcherConfig {
            timeout: Duration::from_secs(config.dispatch.url_fetch_timeout_secs),
            ..Default::default()
        }));

        let ctx = Arc::new(DispatchContext {
            store: store.clone(),
            dispatcher: dispatcher.clone(),
            ledger: ledger.clone(),
            settings: settings.clone(),
        });
        let register = |task_type, inner: Arc<dyn TaskHandler>| {
            queue.register_handler(
                task_type,
                Arc::new(LedgeredHandler {
                    inner,
                    ledger: ledger.clone(),
                }),
            );
        };
        register(
            TaskType::SendMessage,
            Arc::new(SendMessageHandler::new(ctx.clone())),
        );
        register(
            TaskType::AiProcess,
            Arc::new(AiProcessHandler::new(ctx.clone())),
        );
        register(
            TaskType::UrlFetch,
            Arc::new(UrlFetchHandler::new(ctx.clone())),
        );
        register(
            TaskType::SystemMaintenance,
            Arc::new(MaintenanceHandler::new(ctx, queue.clone())),
        );

        let scheduler = TaskScheduler::new(
            SchedulerConfig {
                enabled: config.scheduler.enabled,
                cleanup_interval: Duration::from_secs(config.scheduler.cleanup_interval_secs),
                retry_interval: Duration::from_secs(retry_interval),
                stats_interval: Duration::from_secs(config.scheduler.stats_interval_secs),
                max_task_age: Duration::from_secs(config.scheduler.max_task_age_secs),
                ..Default::default()
            },
            queue.clone(),
        );

        info!(
            max_retries = settings.max_retries,
            retry_interval_secs = retry_interval,
            workers = config.queue.max_workers,
            "Engine initialized"
        );

        Ok(Self {
            config,
            store,
            queue,
            scheduler,
            ledger,
            dispatcher,
            settings,
            running: AtomicBool::new(false),
        })
    }

    /// Start components in declared order: queue workers, then scheduler.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Engine already running");
            return;
        }
        self.queue.start();
        self.scheduler.start().await;
        info!("Engine started");
    }

    /// Stop in reverse order; each stop is best-effort.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop().await;
        self.queue.stop().await;
        info!("Engine stopped");
    }

    /// Stop then start with a settling gap.
    pub async fn restart(&self) {
        info!("Engine restarting");
        self.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start().await;
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            scheduler_running: self.scheduler.is_running().await,
            queue: self.queue.get_status(),
            ledger: self.ledger.status(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Arc<HttpDispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            error!("Engine dropped while running; stop() was not awaited");
        }
    }
}
