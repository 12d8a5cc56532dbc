//! Shared tracing/logging setup for courier binaries.

/// Initialize process-wide logging.
///
/// Format comes from `COURIER_LOG_FORMAT` (`json`, the default, or `pretty`);
/// filtering from `RUST_LOG` (default `info`). Safe to call multiple times;
/// subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use self::tracing::{LogFormat, LogFormatError};
