//! Task model for the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Completion callback invoked best-effort with the handler result.
pub type TaskCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Closed set of job types the dispatch engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    SendMessage,
    AiProcess,
    UrlFetch,
    SystemMaintenance,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskType::SendMessage => "send_message",
            TaskType::AiProcess => "ai_process",
            TaskType::UrlFetch => "url_fetch",
            TaskType::SystemMaintenance => "system_maintenance",
        };
        f.write_str(name)
    }
}

/// Numeric priority; lower values pop first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

/// A unit of work keyed by id and dispatched to the handler registered for
/// its type.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub data: serde_json::Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Admission order, breaks priority ties FIFO.
    pub(crate) seq: u64,
    pub(crate) callback: Option<TaskCallback>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        data: serde_json::Value,
        priority: TaskPriority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            data,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            retry_count: 0,
            max_retries,
            seq: 0,
            callback: None,
        }
    }

    /// Convenience accessor for string fields in the task payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
