use thiserror::Error;

use mp_queue::QueueError;
use mp_store::StoreError;

use crate::request::UrlFetchError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Task data missing field {0:?}")]
    MissingField(&'static str),

    #[error("URL fetch failed: {0}")]
    UrlFetch(#[from] UrlFetchError),

    #[error("Unknown maintenance action {0:?}")]
    UnknownAction(String),
}

/// Dispatch errors surface to the worker as handler failures.
impl From<DispatchError> for QueueError {
    fn from(err: DispatchError) -> Self {
        QueueError::Handler(err.into())
    }
}
