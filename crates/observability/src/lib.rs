//! Process-wide logging setup for ledger binaries and test harnesses.

/// Tracing subscriber configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide tracing with the format picked from `KEEPER_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
