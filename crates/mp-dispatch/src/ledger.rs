//! Error Ledger - bounded in-memory error history with notification hooks
//!
//! Keeps a ring of categorised error records and severity-keyed counters.
//! When a counter reaches its threshold the notification hook fires and the
//! counter resets. Callbacks may be registered per error type; a panicking
//! callback is caught and logged.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use mp_common::{ErrorRecord, ErrorSeverity};

/// Callback invoked for every record of a registered error type.
pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Hook fired when a severity counter reaches its threshold.
pub trait NotificationHook: Send + Sync {
    fn notify(&self, severity: ErrorSeverity, count: u64, last: &ErrorRecord);
}

/// Hook that logs threshold crossings (default wiring).
pub struct LogNotificationHook;

impl NotificationHook for LogNotificationHook {
    fn notify(&self, severity: ErrorSeverity, count: u64, last: &ErrorRecord) {
        warn!(
            severity = ?severity,
            count,
            error_type = %last.error_type,
            message = %last.message,
            "Error threshold reached"
        );
    }
}

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Maximum records kept in the ring
    pub max_error_history: usize,
    /// Notification thresholds per severity
    pub thresholds: HashMap<ErrorSeverity, u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert(ErrorSeverity::Low, 100);
        thresholds.insert(ErrorSeverity::Medium, 10);
        thresholds.insert(ErrorSeverity::High, 1);
        thresholds.insert(ErrorSeverity::Critical, 1);
        Self {
            max_error_history: 1000,
            thresholds,
        }
    }
}

struct LedgerInner {
    history: VecDeque<ErrorRecord>,
    counters: HashMap<ErrorSeverity, u64>,
}

/// Counter snapshot for observability.
#[derive(Debug, Clone)]
pub struct LedgerStatus {
    pub history_size: usize,
    pub counters: HashMap<ErrorSeverity, u64>,
}

/// Bounded in-memory error ledger.
pub struct ErrorLedger {
    inner: Mutex<LedgerInner>,
    callbacks: RwLock<HashMap<String, Vec<ErrorCallback>>>,
    hook: RwLock<Arc<dyn NotificationHook>>,
    config: LedgerConfig,
}

impl ErrorLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                history: VecDeque::new(),
                counters: ErrorSeverity::ALL.iter().map(|s| (*s, 0)).collect(),
            }),
            callbacks: RwLock::new(HashMap::new()),
            hook: RwLock::new(Arc::new(LogNotificationHook)),
            config,
        }
    }

    pub fn set_notification_hook(&self, hook: Arc<dyn NotificationHook>) {
        *self.hook.write() = hook;
        info!("Notification hook attached to ErrorLedger");
    }

    /// Record an error; returns the record id.
    pub fn record(
        &self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        context: serde_json::Value,
    ) -> String {
        let record = ErrorRecord::new(error_type, message, severity, context);
        let id = record.id.clone();

        match severity {
            ErrorSeverity::Critical => {
                error!(error_type = %record.error_type, message = %record.message, "Critical error")
            }
            ErrorSeverity::High => {
                error!(error_type = %record.error_type, message = %record.message, "Error")
            }
            ErrorSeverity::Medium => {
                warn!(error_type = %record.error_type, message = %record.message, "Error")
            }
            ErrorSeverity::Low => {
                debug!(error_type = %record.error_type, message = %record.message, "Error")
            }
        }

        let threshold_hit = {
            let mut inner = self.inner.lock();
            inner.history.push_back(record.clone());
            while inner.history.len() > self.config.max_error_history {
                inner.history.pop_front();
            }

            let counter = inner.counters.entry(severity).or_insert(0);
            *counter += 1;
            let threshold = self.config.thresholds.get(&severity).copied();
            match threshold {
                Some(threshold) if *counter >= threshold => {
                    let count = *counter;
                    *counter = 0;
                    Some(count)
                }
                _ => None,
            }
        };

        if let Some(count) = threshold_hit {
            let hook = self.hook.read().clone();
            hook.notify(severity, count, &record);
        }

        let callbacks = self
            .callbacks
            .read()
            .get(&record.error_type)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&record)));
            if outcome.is_err() {
                error!(error_type = %record.error_type, "Error callback panicked");
            }
        }

        id
    }

    /// Register a callback for an error type.
    pub fn register_callback(&self, error_type: impl Into<String>, callback: ErrorCallback) {
        self.callbacks
            .write()
            .entry(error_type.into())
            .or_default()
            .push(callback);
    }

    pub fn history(&self) -> Vec<ErrorRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
        debug!("Error history cleared");
    }

    pub fn reset_counters(&self) {
        let mut inner = self.inner.lock();
        for severity in ErrorSeverity::ALL {
            inner.counters.insert(severity, 0);
        }
        debug!("Error counters reset");
    }

    pub fn status(&self) -> LedgerStatus {
        let inner = self.inner.lock();
        LedgerStatus {
            history_size: inner.history.len(),
            counters: inner.counters.clone(),
        }
    }
}

impl Default for ErrorLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
