//! Utility modules for logging and bounded retries

pub mod logging;
pub mod retry;

pub use logging::{init_logging, init_logging_from_config, init_module_logging};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use retry::{poll_until, retry_async_with_backoff, RetryConfig};
