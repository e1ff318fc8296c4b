//! Movement amounts.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Magnitude of a single money movement, in indivisible currency units.
///
/// Always strictly positive. Balances themselves are plain `i64`s; this type only
/// guards what flows into deposit/withdraw/transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> LedgerResult<Self> {
        if value <= 0 {
            return Err(LedgerError::invalid_argument(format!(
                "amount must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// `balance + self`, or `InvalidArgument` when the result does not fit.
    pub fn credit(self, balance: i64) -> LedgerResult<i64> {
        balance.checked_add(self.0).ok_or_else(|| {
            LedgerError::invalid_argument(format!(
                "crediting {} to balance {balance} overflows",
                self.0
            ))
        })
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
