//! The two record kinds the ledger owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::id::UserId;

/// Current balance of one account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    /// Non-negative between committed transactions.
    pub amount: i64,
}

/// One balance-affecting event (immutable once committed).
///
/// `amount` is the magnitude of the movement, never the resulting balance.
/// Entries are ordered by the store's insertion sequence, not by `time`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_id: UserId,
    /// true = funds left the account, false = funds arrived.
    pub is_debit: bool,
    pub amount: Amount,
    pub time: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn debit(user_id: UserId, amount: Amount, time: DateTime<Utc>) -> Self {
        Self {
            user_id,
            is_debit: true,
            amount,
            time,
        }
    }

    pub fn credit(user_id: UserId, amount: Amount, time: DateTime<Utc>) -> Self {
        Self {
            user_id,
            is_debit: false,
            amount,
            time,
        }
    }

    /// Signed effect of this entry on the account balance.
    pub fn delta(&self) -> i64 {
        if self.is_debit {
            -self.amount.get()
        } else {
            self.amount.get()
        }
    }
}
