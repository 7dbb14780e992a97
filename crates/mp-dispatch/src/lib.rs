//! MessagePusher Dispatch Engine
//!
//! The asynchronous core of the gateway:
//! - `request`: turns channel/AI templates plus a message into concrete
//!   outbound HTTP requests and classifies the outcomes
//! - `handlers`: queue job handlers owning the per-attempt state machine
//! - `ledger`: bounded in-memory error history with notification thresholds
//! - `engine`: supervisor wiring store, queue, scheduler and ledger together

pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod request;

pub use engine::{Engine, EngineStatus};
pub use error::DispatchError;
pub use handlers::{
    AiProcessHandler, DispatchContext, DispatchSettings, MaintenanceHandler, SendMessageHandler,
    UrlFetchHandler,
};
pub use ledger::{ErrorLedger, LedgerConfig, LedgerStatus, LogNotificationHook, NotificationHook};
pub use request::{
    build_env, substitute, substitute_value, HttpDispatcher, HttpDispatcherConfig, SubstEnv,
    UrlFetchError,
};
