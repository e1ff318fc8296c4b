//! Infrastructure layer: store adapters, repositories and configuration.

pub mod config;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use store::{
    AccountLock, AccountRepository, History, HistoryRecorder, InMemoryLedgerStore,
    LedgerStore, LedgerTransaction, PgLedgerStore, StoreError,
};
