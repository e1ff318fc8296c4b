//! Engine configuration.

use std::time::Duration;

use keeper_infra::ConfigError;
use keeper_infra::config::millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerConfig {
    /// Upper bound for one deposit/withdraw/transfer, lock waits included.
    /// `None` lets operations wait as long as the store does.
    pub operation_timeout: Option<Duration>,
}

impl LedgerConfig {
    /// Reads `KEEPER_OPERATION_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            operation_timeout: millis(&lookup, "KEEPER_OPERATION_TIMEOUT_MS")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_optional() {
        assert_eq!(LedgerConfig::from_lookup(|_| None).unwrap(), LedgerConfig::default());

        let config = LedgerConfig::from_lookup(|key| {
            (key == "KEEPER_OPERATION_TIMEOUT_MS").then(|| "750".to_string())
        })
        .unwrap();
        assert_eq!(config.operation_timeout, Some(Duration::from_millis(750)));

        assert!(LedgerConfig::from_lookup(|_| Some("-1".to_string())).is_err());
    }
}
