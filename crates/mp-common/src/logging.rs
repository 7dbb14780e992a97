//! Logging bootstrap for MessagePusher binaries.
//!
//! `RUST_LOG` filters as usual; without it the named service's own crate
//! logs at debug and everything else at info. `LOG_FORMAT=json` switches
//! the output to JSON lines for log aggregation.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for the named service.
///
/// Safe to call more than once; later calls are no-ops (tests share one
/// process-wide subscriber).
pub fn init_logging(service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(service_name)));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        let _ = registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init();
    }
}

/// Default filter when `RUST_LOG` is unset: the service's own crate at
/// debug, dependencies at info.
fn default_directives(service_name: &str) -> String {
    format!("info,{}=debug", service_name.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_target_the_service_crate() {
        assert_eq!(default_directives("mp-server"), "info,mp_server=debug");
        // The generated directives must parse as a valid filter
        EnvFilter::try_new(default_directives("mp-server")).unwrap();
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging("mp-test");
        init_logging("mp-test");
    }
}
