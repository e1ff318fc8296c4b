//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (default, for log shippers).
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

impl LogFormat {
    /// Reads `KEEPER_LOG_FORMAT` (`json` | `pretty`); anything else falls back to JSON.
    pub fn from_env() -> Self {
        std::env::var("KEEPER_LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Initialize tracing for the process. Filter comes from `RUST_LOG` (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_formats_fall_back_to_json() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" PRETTY "), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(LogFormat::Json);
        init(LogFormat::Pretty);
    }
}
