use thiserror::Error;

use crate::{TaskStatus, TaskType};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot {operation} task {task_id} in state {status:?}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("Retry budget exhausted for task {task_id} ({max_retries} retries)")]
    RetryExhausted { task_id: String, max_retries: u32 },

    #[error("No handler registered for task type {0}")]
    NoHandler(TaskType),

    #[error("Handler error: {0}")]
    Handler(#[from] anyhow::Error),
}
