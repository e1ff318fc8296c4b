//! `keeper-ledger`: the transactional ledger engine.
//!
//! Composes the account repository and history recorder from `keeper-infra`
//! into atomic deposit/withdraw/transfer protocols plus plain balance and
//! history reads. All cross-request coordination is delegated to the store's
//! row locks; the engine itself holds no shared mutable state.

pub mod config;
pub mod engine;

pub use config::LedgerConfig;
pub use engine::{LedgerEngine, with_deadline};
pub use keeper_core::{Account, Amount, HistoryEntry, LedgerError, LedgerResult, UserId};
pub use keeper_infra::History;
