//! Structured logging infrastructure for Pidgeon tooling.
//!
//! Centralized logging initialization with human readable or JSON output.
//! Logs go to stderr so command output on stdout stays machine readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use pidgeon_core::logging;
///
/// logging::init();
/// tracing::info!("Provisioning started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

/// Initialize the logging system with JSON output.
///
/// Suitable when provisioning runs are driven by automation that collects
/// logs. Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use pidgeon_core::logging;
///
/// logging::init_json();
/// tracing::info!(device_id = "0123", "Workspace allocated");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        // Can only initialize once per process, so only the filter is checked here
        let _ = EnvFilter::new(DEFAULT_FILTER);
    }
}
