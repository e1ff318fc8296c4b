use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use keeper_core::{HistoryEntry, LedgerError, UserId};

/// Result of a locking read on one account.
///
/// An absent account still gets locked (so a concurrent first credit waits), but
/// no row is created: `existed = false`, `balance = 0`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccountLock {
    pub existed: bool,
    pub balance: i64,
}

impl AccountLock {
    pub fn present(balance: i64) -> Self {
        Self {
            existed: true,
            balance,
        }
    }

    pub fn absent() -> Self {
        Self {
            existed: false,
            balance: 0,
        }
    }
}

/// Most-recent-first run of history entries for one account.
///
/// Finite and consumed once: it is an iterator owned by the caller, not a cursor
/// that can be rewound. Entries are fetched in a single bounded query before the
/// iterator is handed out, so memory grows with `limit`; callers wanting the whole
/// history should page with a sensible limit rather than pass `i64::MAX`.
#[derive(Debug)]
pub struct History {
    entries: std::vec::IntoIter<HistoryEntry>,
}

impl History {
    /// `entries` must already be ordered most recent first.
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for History {
    type Item = HistoryEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for History {}

/// Store operation error.
///
/// These are infrastructure failures. Business outcomes (not found,
/// insufficient funds) are decided by the engine, not here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row already exists / missing where the caller assumed otherwise.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A schema constraint refused the write (e.g. negative balance).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The store gave up waiting for a row lock.
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("failed to decode row: {0}")]
    Decode(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => LedgerError::Conflict(msg),
            StoreError::LockTimeout(_) => LedgerError::DeadlineExceeded,
            other => LedgerError::Internal(other.to_string()),
        }
    }
}

/// Account reads/writes inside a transaction scope.
#[async_trait]
pub trait AccountRepository: Send {
    /// Take the exclusive lock on `user_id` (held until the scope ends) and read
    /// the balance. Never creates a row.
    async fn ensure_and_lock(&mut self, user_id: UserId) -> Result<AccountLock, StoreError>;

    /// Insert a new account. `Conflict` if it already exists.
    async fn create_with_balance(&mut self, user_id: UserId, balance: i64)
    -> Result<(), StoreError>;

    /// `balance += delta`. The caller has already checked the result is not
    /// negative; a missing row is a `Conflict`.
    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> Result<(), StoreError>;
}

/// Appends immutable history entries inside a transaction scope.
#[async_trait]
pub trait HistoryRecorder: Send {
    async fn append(&mut self, entry: &HistoryEntry) -> Result<(), StoreError>;
}

/// One unit of work that commits or rolls back atomically.
///
/// Dropping a scope without committing rolls it back and releases its locks,
/// so every exit path (early return, `?`, panic, cancelled future) is covered.
#[async_trait]
pub trait LedgerTransaction: AccountRepository + HistoryRecorder {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Shared, process-wide handle to the ledger store.
///
/// Implementations must:
/// - hand out an independent transaction scope per `begin()`
/// - make `ensure_and_lock` serialize scopes touching the same account
/// - keep plain reads (`balance`, `recent_history`) free of row-lock waits
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Transaction: LedgerTransaction + 'static;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Plain (non-locking) balance read. `None` if the account was never created.
    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError>;

    /// Up to `limit` entries for `user_id`, most recent first. `limit <= 0`
    /// yields nothing.
    async fn recent_history(&self, user_id: UserId, limit: i64) -> Result<History, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Transaction = S::Transaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        (**self).begin().await
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        (**self).balance(user_id).await
    }

    async fn recent_history(&self, user_id: UserId, limit: i64) -> Result<History, StoreError> {
        (**self).recent_history(user_id, limit).await
    }
}
