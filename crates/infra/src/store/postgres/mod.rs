//! Postgres-backed ledger store.
//!
//! ## Locking
//!
//! `ensure_and_lock` first takes a transaction-scoped advisory lock keyed by
//! `user_id` (`pg_advisory_xact_lock`), then reads the row with `FOR UPDATE`.
//! The advisory lock also covers accounts that do not exist yet, so two
//! transactions crediting the same brand-new account serialize instead of racing
//! on the primary key. Both locks are released by commit or rollback.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Constraint` |
//! | Database (lock not available) | `55P03` | `LockTimeout` |
//! | Database (other) | any other | `Database` |
//! | PoolClosed | n/a | `PoolClosed` |
//! | Other | n/a | `Database` |
//!
//! ## Thread Safety
//!
//! `PgLedgerStore` is `Send + Sync` and cheap to clone (the pool is reference
//! counted). Every `begin()` checks out its own connection.

mod accounts;
mod history;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use keeper_core::{HistoryEntry, UserId};

use super::r#trait::{
    AccountLock, AccountRepository, History, HistoryRecorder, LedgerStore, LedgerTransaction,
    StoreError,
};
use crate::config::StoreConfig;

const SCHEMA: &str = include_str!("../../../migrations/0001_ledger.sql");

/// Postgres-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgLedgerStore {
    /// Wrap an existing pool (no lock timeout).
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Open a pool using `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        tracing::info!("connected to ledger database");
        Ok(Self::new(pool).with_lock_timeout(config.lock_timeout))
    }

    /// Bound how long each transaction waits for a row lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `accounts` and `history` tables if they are missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("ledger database pool closed");
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Transaction = PgLedgerTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        }

        Ok(PgLedgerTransaction { tx })
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        accounts::fetch_balance(&self.pool, user_id).await
    }

    async fn recent_history(&self, user_id: UserId, limit: i64) -> Result<History, StoreError> {
        history::recent(&self.pool, user_id, limit).await
    }
}

/// Transaction scope over [`PgLedgerStore`]. Rolls back on drop (sqlx semantics).
pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountRepository for PgLedgerTransaction {
    async fn ensure_and_lock(&mut self, user_id: UserId) -> Result<AccountLock, StoreError> {
        accounts::lock(&mut self.tx, user_id).await
    }

    async fn create_with_balance(
        &mut self,
        user_id: UserId,
        balance: i64,
    ) -> Result<(), StoreError> {
        accounts::insert(&mut self.tx, user_id, balance).await
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> Result<(), StoreError> {
        accounts::adjust(&mut self.tx, user_id, delta).await
    }
}

#[async_trait]
impl HistoryRecorder for PgLedgerTransaction {
    async fn append(&mut self, entry: &HistoryEntry) -> Result<(), StoreError> {
        history::append(&mut self.tx, entry).await
    }
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Constraint(msg),
                Some("55P03") => StoreError::LockTimeout(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
