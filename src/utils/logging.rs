//! Logging utilities for consistent logging across clients and modules
//!
//! - Supports client-process logging
//! - Supports module-specific logging with its own default filter
//! - Respects RUST_LOG environment variable
//! - Allows configuration via config file
//!
//! # Usage
//!
//! ```no_run
//! use ipc_dylink::utils::{init_logging, init_module_logging};
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! # let _ = init_module_logging;
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter to use when RUST_LOG is not set
fn resolve_filter(filter: Option<&str>, default: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(default))
}

/// Initialize logging for a client process
///
/// RUST_LOG takes precedence, then `filter`, then "info".
/// Calling it a second time in the same process is a no-op.
pub fn init_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(resolve_filter(filter, "info"))
        .try_init();
}

/// Initialize logging for a module process
///
/// Default filter: `{module_name}=info,ipc_dylink::module=debug`.
/// Modules are spawned with their standard streams discarded, so this only
/// shows output when a module is started by hand.
pub fn init_module_logging(module_name: &str, filter: Option<&str>) {
    let default_filter = format!("{}=info,ipc_dylink::module=debug", module_name);

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err())
                .with_writer(std::io::stderr),
        )
        .with(resolve_filter(filter, &default_filter))
        .try_init();
}

/// Initialize logging with JSON output (for log aggregation)
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter, "info"))
        .try_init();
}

/// Initialize logging from the `[logging]` config section
pub fn init_logging_from_config(config: Option<&crate::config::LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}
