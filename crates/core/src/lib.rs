//! `keeper-core`: ledger domain primitives.
//!
//! Pure types shared by the store adapters and the ledger engine: identifiers,
//! amounts, account/history records and the error taxonomy. No I/O here.

pub mod amount;
pub mod error;
pub mod id;
pub mod record;

pub use amount::Amount;
pub use error::{LedgerError, LedgerResult};
pub use id::UserId;
pub use record::{Account, HistoryEntry};
