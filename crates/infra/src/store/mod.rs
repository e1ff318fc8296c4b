//! Transactional ledger store boundary.
//!
//! Defines the store adapter (transaction scopes with exclusive row locks), the
//! account repository and the history recorder as traits, with an in-memory
//! backend for tests/dev and a PostgreSQL backend for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryLedgerStore, InMemoryTransaction};
pub use postgres::{PgLedgerStore, PgLedgerTransaction};
pub use r#trait::{
    AccountLock, AccountRepository, History, HistoryRecorder, LedgerStore, LedgerTransaction,
    StoreError,
};
