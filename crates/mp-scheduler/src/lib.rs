//! MessagePusher Task Scheduler
//!
//! Wall-clock periodic jobs that feed `SystemMaintenance` tasks into the
//! queue:
//! - `cleanup`: purge completed queue tasks and expired data
//! - `retry_failed`: re-queue failed attempts with remaining budget
//! - `generate_stats`: operator statistics
//! - `db_maintenance`: nightly store compaction at 02:00 local time
//!
//! Each job is a tokio interval loop guarded by a shared running flag, so at
//! most one firing is in flight per job and missed firings collapse into the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use mp_queue::{TaskPriority, TaskQueue, TaskType};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cleanup_interval: Duration,
    pub retry_interval: Duration,
    pub stats_interval: Duration,
    /// Completed/cancelled queue tasks older than this are purged
    pub max_task_age: Duration,
    /// Local wall-clock time of the nightly db maintenance run
    pub db_maintenance_time: NaiveTime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(300),
            stats_interval: Duration::from_secs(86400),
            max_task_age: Duration::from_secs(604800),
            db_maintenance_time: NaiveTime::from_hms_opt(2, 0, 0).expect("valid time"),
        }
    }
}

/// Periodic job scheduler driving the maintenance actions.
pub struct TaskScheduler {
    config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    running: Arc<RwLock<bool>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, queue: Arc<TaskQueue>) -> Self {
        Self {
            config,
            queue,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Task scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            cleanup_secs = self.config.cleanup_interval.as_secs(),
            retry_secs = self.config.retry_interval.as_secs(),
            stats_secs = self.config.stats_interval.as_secs(),
            "Starting task scheduler"
        );

        self.spawn_interval_job(
            "cleanup",
            self.config.cleanup_interval,
            serde_json::json!({
                "action": "cleanup",
                "max_age_secs": self.config.max_task_age.as_secs(),
            }),
            TaskPriority::Low,
        );

        self.spawn_interval_job(
            "retry_failed",
            self.config.retry_interval,
            serde_json::json!({"action": "retry_failed_messages"}),
            TaskPriority::Normal,
        );

        self.spawn_interval_job(
            "generate_stats",
            self.config.stats_interval,
            serde_json::json!({"action": "generate_stats"}),
            TaskPriority::Low,
        );

        self.spawn_daily_job(
            "db_maintenance",
            self.config.db_maintenance_time,
            serde_json::json!({"action": "db_maintenance"}),
        );
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Task scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    fn spawn_interval_job(
        &self,
        name: &'static str,
        period: Duration,
        data: serde_json::Value,
        priority: TaskPriority,
    ) {
        let queue = self.queue.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The immediate first tick would fire the job at startup
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                debug!(job = name, "Scheduler tick");
                queue.create_task(TaskType::SystemMaintenance, data.clone(), priority);
            }
            debug!(job = name, "Scheduler job exited");
        });
    }

    fn spawn_daily_job(&self, name: &'static str, at: NaiveTime, data: serde_json::Value) {
        let queue = self.queue.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                let wait = duration_until_next(at);
                tokio::time::sleep(wait).await;
                if !*running.read().await {
                    break;
                }
                debug!(job = name, "Scheduler daily tick");
                queue.create_task(TaskType::SystemMaintenance, data.clone(), TaskPriority::Low);
            }
            debug!(job = name, "Scheduler job exited");
        });
    }
}

/// Time until the next local occurrence of `at`.
fn duration_until_next(at: NaiveTime) -> Duration {
    let now = Local::now();
    let today = now.date_naive().and_time(at);
    let target = match Local.from_local_datetime(&today).earliest() {
        Some(t) if t > now => t,
        _ => {
            let tomorrow = (now.date_naive() + chrono::Days::new(1)).and_time(at);
            Local
                .from_local_datetime(&tomorrow)
                .earliest()
                .unwrap_or(now + chrono::Duration::days(1))
        }
    };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}
