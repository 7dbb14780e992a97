//! MessagePusher Task Queue
//!
//! Process-local priority queue backed by a fixed pool of worker tasks.
//! Tasks are ordered strictly by `(priority, admission order)`; workers pop
//! with a timeout so the shared stop flag is observed even when the queue is
//! empty. A handler error never terminates a worker: the task transitions to
//! `failed` and, while budget remains, is re-admitted after `retry_delay`.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub mod error;
mod task;

pub use error::QueueError;
pub use task::{Task, TaskCallback, TaskPriority, TaskStatus, TaskType};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Handler invoked by workers for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value>;
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Number of worker tasks consuming the queue
    pub max_workers: usize,
    /// Timed pop interval; the stop flag is re-checked at this cadence
    pub worker_idle_timeout: Duration,
    /// Default retry budget for tasks created through `create_task`
    pub max_retries: u32,
    /// Delay before a failed task is re-admitted
    pub retry_delay: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            worker_idle_timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Queue status snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub worker_count: usize,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Heap entry ordered by `(priority, seq)` ascending; `BinaryHeap` is a
/// max-heap so `Ord` is reversed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<String, Task>,
}

/// Process-local priority task queue with a fixed worker pool.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
    notify: Notify,
    running: AtomicBool,
    seq: AtomicU64,
    config: TaskQueueConfig,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            config,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Register the handler for a task type. At most one handler per type;
    /// a later registration replaces the earlier one.
    pub fn register_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        let previous = self.handlers.write().insert(task_type, handler);
        if previous.is_some() {
            warn!(task_type = %task_type, "Replaced existing task handler");
        } else {
            debug!(task_type = %task_type, "Registered task handler");
        }
    }

    /// Admit a task to the queue and return its id.
    pub fn submit(&self, mut task: Task) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        task.seq = seq;
        let id = task.id.clone();
        let entry = QueueEntry {
            priority: task.priority.value(),
            seq,
            id: id.clone(),
        };

        {
            let mut inner = self.inner.lock();
            inner.tasks.insert(id.clone(), task);
            inner.heap.push(entry);
        }

        self.notify.notify_one();
        id
    }

    /// Create and admit a task with the queue's default retry budget.
    pub fn create_task(
        &self,
        task_type: TaskType,
        data: serde_json::Value,
        priority: TaskPriority,
    ) -> String {
        let task = Task::new(task_type, data, priority, self.config.max_retries);
        debug!(
            task_id = %task.id,
            task_type = %task_type,
            priority = ?priority,
            "Submitting task"
        );
        self.submit(task)
    }

    /// Create and admit a task with a completion callback.
    pub fn create_task_with_callback(
        &self,
        task_type: TaskType,
        data: serde_json::Value,
        priority: TaskPriority,
        callback: TaskCallback,
    ) -> String {
        let mut task = Task::new(task_type, data, priority, self.config.max_retries);
        task.callback = Some(callback);
        self.submit(task)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    /// Cancel a task. Only succeeds while the task is still `pending`.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(QueueError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                operation: "cancel",
            });
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        debug!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Re-admit a failed task. Only valid while `failed` with budget left;
    /// resets to `pending`, clears the error, increments `retry_count`.
    pub fn retry_task(&self, task_id: &str) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Failed {
                return Err(QueueError::InvalidState {
                    task_id: task_id.to_string(),
                    status: task.status,
                    operation: "retry",
                });
            }
            if task.retry_count >= task.max_retries {
                return Err(QueueError::RetryExhausted {
                    task_id: task_id.to_string(),
                    max_retries: task.max_retries,
                });
            }
            task.status = TaskStatus::Pending;
            task.retry_count += 1;
            task.error = None;
            debug!(task_id = %task_id, retry_count = task.retry_count, "Retrying task");
            QueueEntry {
                priority: task.priority.value(),
                seq: task.seq,
                id: task.id.clone(),
            }
        };

        self.inner.lock().heap.push(entry);
        self.notify.notify_one();
        Ok(())
    }

    /// Drop completed/cancelled tasks older than `max_age`.
    pub fn purge_completed(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut inner = self.inner.lock();
        let before = inner.tasks.len();
        inner.tasks.retain(|_, task| {
            !(matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled)
                && task.completed_at.map_or(false, |done| done < cutoff))
        });
        let removed = before - inner.tasks.len();
        if removed > 0 {
            debug!(removed = removed, "Purged completed tasks");
        }
        removed
    }

    pub fn get_status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        let count = |status: TaskStatus| {
            inner.tasks.values().filter(|t| t.status == status).count()
        };
        QueueStatus {
            queue_size: inner.heap.len(),
            worker_count: self.workers.lock().len(),
            total: inner.tasks.len(),
            pending: count(TaskStatus::Pending),
            processing: count(TaskStatus::Processing),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
        }
    }

    /// Start the worker pool.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Task queue already running");
            return;
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.max_workers {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        info!(workers = self.config.max_workers, "Task queue started");
    }

    /// Stop the worker pool. Workers finish their in-flight task first.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("Worker did not stop within 2s");
            }
        }
        info!("Task queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            let task = match self.pop_pending() {
                Some(task) => task,
                None => {
                    // Timed wait so the stop flag is observed on idle
                    let _ = tokio::time::timeout(
                        self.config.worker_idle_timeout,
                        self.notify.notified(),
                    )
                    .await;
                    continue;
                }
            };

            self.process_task(task).await;
        }

        debug!(worker_id, "Worker stopped");
    }

    /// Pop the highest-priority pending task and mark it processing.
    /// Entries whose task was cancelled or purged are skipped.
    fn pop_pending(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.heap.pop() {
            let Some(task) = inner.tasks.get_mut(&entry.id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            task.status = TaskStatus::Processing;
            task.started_at = Some(Utc::now());
            return Some(task.clone());
        }
        None
    }

    async fn process_task(self: &Arc<Self>, task: Task) {
        debug!(task_id = %task.id, task_type = %task.task_type, "Processing task");

        let handler = self.handlers.read().get(&task.task_type).cloned();
        let outcome = match handler {
            Some(handler) => handler.handle(&task).await,
            None => Err(QueueError::NoHandler(task.task_type)),
        };

        match outcome {
            Ok(result) => {
                let callback = {
                    let mut inner = self.inner.lock();
                    if let Some(stored) = inner.tasks.get_mut(&task.id) {
                        stored.status = TaskStatus::Completed;
                        stored.completed_at = Some(Utc::now());
                        stored.result = Some(result.clone());
                        stored.callback.clone()
                    } else {
                        None
                    }
                };
                debug!(task_id = %task.id, "Task completed");

                // Best effort; a misbehaving callback must not kill the worker
                if let Some(callback) = callback {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(&result)
                    }));
                    if outcome.is_err() {
                        error!(task_id = %task.id, "Task callback panicked");
                    }
                }
            }
            Err(err) => {
                let budget_left = {
                    let mut inner = self.inner.lock();
                    match inner.tasks.get_mut(&task.id) {
                        Some(stored) => {
                            stored.status = TaskStatus::Failed;
                            stored.completed_at = Some(Utc::now());
                            stored.error = Some(err.to_string());
                            stored.retry_count < stored.max_retries
                        }
                        None => false,
                    }
                };
                error!(task_id = %task.id, error = %err, "Task failed");

                if budget_left {
                    let queue = Arc::clone(self);
                    let task_id = task.id.clone();
                    let delay = self.config.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(err) = queue.retry_task(&task_id) {
                            // Purged or raced with a manual retry
                            debug!(task_id = %task_id, error = %err, "Scheduled retry skipped");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, _task: &Task) -> Result<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(QueueError::Handler(anyhow::anyhow!("induced failure {}", call)));
            }
            Ok(serde_json::json!({"call": call}))
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn fast_config() -> TaskQueueConfig {
        TaskQueueConfig {
            max_workers: 2,
            worker_idle_timeout: Duration::from_millis(20),
            max_retries: 3,
            retry_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_priority_ordering() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        let low = queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::Low);
        let high = queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::High);
        let normal_a =
            queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::Normal);
        let normal_b =
            queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::Normal);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_pending().map(|t| t.id)).collect();
        assert_eq!(order, vec![high, normal_a, normal_b, low]);
    }

    #[test]
    fn test_cancel_only_while_pending() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        let id = queue.create_task(TaskType::UrlFetch, serde_json::json!({}), TaskPriority::Normal);

        queue.cancel_task(&id).unwrap();
        assert!(matches!(
            queue.cancel_task(&id),
            Err(QueueError::InvalidState { status: TaskStatus::Cancelled, .. })
        ));
        assert!(matches!(
            queue.cancel_task("missing"),
            Err(QueueError::TaskNotFound(_))
        ));
        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Cancelled);

        // A cancelled task is never handed to a worker
        assert!(queue.pop_pending().is_none());
    }

    #[test]
    fn test_retry_requires_failed_with_budget() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        let id = queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::Normal);

        // Pending task cannot be retried
        assert!(matches!(
            queue.retry_task(&id),
            Err(QueueError::InvalidState { operation: "retry", .. })
        ));

        let _ = queue.pop_pending().unwrap();
        {
            let mut inner = queue.inner.lock();
            let task = inner.tasks.get_mut(&id).unwrap();
            task.status = TaskStatus::Failed;
            task.error = Some("boom".to_string());
            task.retry_count = task.max_retries;
        }
        // Budget exhausted
        assert!(matches!(
            queue.retry_task(&id),
            Err(QueueError::RetryExhausted { .. })
        ));

        {
            let mut inner = queue.inner.lock();
            inner.tasks.get_mut(&id).unwrap().retry_count = 0;
        }
        queue.retry_task(&id).unwrap();
        let task = queue.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_workers_complete_tasks() {
        let queue = Arc::new(TaskQueue::new(fast_config()));
        let handler = Arc::new(RecordingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        queue.register_handler(TaskType::SendMessage, handler.clone());
        queue.start();

        let id = queue.create_task(
            TaskType::SendMessage,
            serde_json::json!({"message_id": "m1"}),
            TaskPriority::Normal,
        );

        let q = queue.clone();
        let id_clone = id.clone();
        wait_for(move || {
            q.get_task(&id_clone).map(|t| t.status) == Some(TaskStatus::Completed)
        })
        .await;

        let task = queue.get_task(&id).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(serde_json::json!({"call": 0})));

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_automatically() {
        let queue = Arc::new(TaskQueue::new(fast_config()));
        let handler = Arc::new(RecordingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        queue.register_handler(TaskType::AiProcess, handler.clone());
        queue.start();

        let id = queue.create_task(TaskType::AiProcess, serde_json::json!({}), TaskPriority::Normal);

        let q = queue.clone();
        let id_clone = id.clone();
        wait_for(move || {
            q.get_task(&id_clone).map(|t| t.status) == Some(TaskStatus::Completed)
        })
        .await;

        let task = queue.get_task(&id).unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let mut config = fast_config();
        config.max_retries = 1;
        let queue = Arc::new(TaskQueue::new(config));
        let handler = Arc::new(RecordingHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        queue.register_handler(TaskType::UrlFetch, handler.clone());
        queue.start();

        let id = queue.create_task(TaskType::UrlFetch, serde_json::json!({}), TaskPriority::Normal);

        let q = queue.clone();
        let id_clone = id.clone();
        wait_for(move || {
            q.get_task(&id_clone)
                .map(|t| t.status == TaskStatus::Failed && t.retry_count == 1)
                .unwrap_or(false)
        })
        .await;

        // Give any stray retry timer a chance to fire, then confirm terminal
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = queue.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task() {
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig {
            max_retries: 0,
            ..fast_config()
        }));
        queue.start();

        let id = queue.create_task(
            TaskType::SystemMaintenance,
            serde_json::json!({"action": "cleanup"}),
            TaskPriority::Low,
        );

        let q = queue.clone();
        let id_clone = id.clone();
        wait_for(move || q.get_task(&id_clone).map(|t| t.status) == Some(TaskStatus::Failed)).await;

        let task = queue.get_task(&id).unwrap();
        assert!(task.error.unwrap().contains("handler registered"));

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_purge_completed() {
        let queue = Arc::new(TaskQueue::new(fast_config()));
        let handler = Arc::new(RecordingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        queue.register_handler(TaskType::SendMessage, handler);
        queue.start();

        let id = queue.create_task(TaskType::SendMessage, serde_json::json!({}), TaskPriority::Normal);
        let q = queue.clone();
        let id_clone = id.clone();
        wait_for(move || {
            q.get_task(&id_clone).map(|t| t.status) == Some(TaskStatus::Completed)
        })
        .await;
        queue.stop().await;

        // Young completed tasks survive, zero-age purge drops them
        assert_eq!(queue.purge_completed(Duration::from_secs(3600)), 0);
        assert_eq!(queue.purge_completed(Duration::ZERO), 1);
        assert!(queue.get_task(&id).is_none());
    }
}
