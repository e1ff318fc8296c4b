use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use keeper_core::{Account, HistoryEntry, UserId};

use super::r#trait::{
    AccountLock, AccountRepository, History, HistoryRecorder, LedgerStore, LedgerTransaction,
    StoreError,
};

#[derive(Debug, Default)]
struct Committed {
    accounts: HashMap<UserId, i64>,
    /// Insertion order is the sequence; index + 1 plays the role of `history.id`.
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Committed>,
    row_locks: Mutex<HashMap<UserId, Arc<RowLock<()>>>>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. It keeps the locking contract of the real store: a
/// scope that locks an account (present or not) holds a per-account async mutex
/// until it commits, rolls back or is dropped. Writes are staged in the scope and
/// applied to the committed state in one step on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All committed accounts, ordered by user id.
    pub fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let committed = read(&self.shared)?;
        let mut accounts: Vec<Account> = committed
            .accounts
            .iter()
            .map(|(user_id, amount)| Account {
                user_id: *user_id,
                amount: *amount,
            })
            .collect();
        accounts.sort_by_key(|a| a.user_id);
        Ok(accounts)
    }

    /// Number of committed history entries across all accounts.
    pub fn history_len(&self) -> Result<usize, StoreError> {
        Ok(read(&self.shared)?.history.len())
    }
}

fn read(shared: &Shared) -> Result<std::sync::RwLockReadGuard<'_, Committed>, StoreError> {
    shared
        .committed
        .read()
        .map_err(|_| StoreError::Database("lock poisoned".to_string()))
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            held: HashMap::new(),
            staged: HashMap::new(),
            appended: Vec::new(),
        })
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        Ok(read(&self.shared)?.accounts.get(&user_id).copied())
    }

    async fn recent_history(&self, user_id: UserId, limit: i64) -> Result<History, StoreError> {
        if limit <= 0 {
            return Ok(History::empty());
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let committed = read(&self.shared)?;
        let entries = committed
            .history
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .copied()
            .collect();
        Ok(History::new(entries))
    }
}

/// Transaction scope over [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    held: HashMap<UserId, OwnedMutexGuard<()>>,
    /// Balances written in this scope (created or adjusted).
    staged: HashMap<UserId, i64>,
    appended: Vec<HistoryEntry>,
}

impl InMemoryTransaction {
    /// Re-entrant within the scope, like a row lock taken twice by one transaction.
    async fn lock_row(&mut self, user_id: UserId) -> Result<(), StoreError> {
        if self.held.contains_key(&user_id) {
            return Ok(());
        }

        let row = {
            let mut locks = self
                .shared
                .row_locks
                .lock()
                .map_err(|_| StoreError::Database("lock poisoned".to_string()))?;
            Arc::clone(locks.entry(user_id).or_default())
        };

        let guard = row.lock_owned().await;
        self.held.insert(user_id, guard);
        Ok(())
    }

    fn current(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        if let Some(balance) = self.staged.get(&user_id) {
            return Ok(Some(*balance));
        }
        Ok(read(&self.shared)?.accounts.get(&user_id).copied())
    }
}

impl Drop for InMemoryTransaction {
    /// Release held rows and forget any row lock nobody else is using or waiting on.
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let released: Vec<UserId> = self.held.keys().copied().collect();
        self.held.clear();

        if let Ok(mut locks) = self.shared.row_locks.lock() {
            for user_id in released {
                if locks
                    .get(&user_id)
                    .is_some_and(|row| Arc::strong_count(row) == 1)
                {
                    locks.remove(&user_id);
                }
            }
        }
    }
}

#[async_trait]
impl AccountRepository for InMemoryTransaction {
    async fn ensure_and_lock(&mut self, user_id: UserId) -> Result<AccountLock, StoreError> {
        self.lock_row(user_id).await?;
        Ok(match self.current(user_id)? {
            Some(balance) => AccountLock::present(balance),
            None => AccountLock::absent(),
        })
    }

    async fn create_with_balance(
        &mut self,
        user_id: UserId,
        balance: i64,
    ) -> Result<(), StoreError> {
        self.lock_row(user_id).await?;
        if self.current(user_id)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "account {user_id} already exists"
            )));
        }
        if balance < 0 {
            return Err(StoreError::Constraint(format!(
                "account {user_id} cannot open with negative balance {balance}"
            )));
        }
        self.staged.insert(user_id, balance);
        Ok(())
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> Result<(), StoreError> {
        self.lock_row(user_id).await?;
        let current = self
            .current(user_id)?
            .ok_or_else(|| StoreError::Conflict(format!("account {user_id} does not exist")))?;

        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Constraint(format!("balance of {user_id} overflows")))?;
        if next < 0 {
            return Err(StoreError::Constraint(format!(
                "balance of {user_id} would become {next}"
            )));
        }
        self.staged.insert(user_id, next);
        Ok(())
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryTransaction {
    async fn append(&mut self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.appended.push(*entry);
        Ok(())
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    async fn commit(mut self) -> Result<(), StoreError> {
        {
            let mut committed = self
                .shared
                .committed
                .write()
                .map_err(|_| StoreError::Database("lock poisoned".to_string()))?;

            committed.accounts.extend(self.staged.drain());
            committed.history.append(&mut self.appended);
        }
        // Row locks are released when `self` drops here.
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
