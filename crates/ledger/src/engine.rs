//! Ledger engine: atomic money movement over a [`LedgerStore`].
//!
//! ## Transaction protocol
//!
//! Every mutating operation:
//! 1. validates its arguments (no store access on invalid input)
//! 2. opens exactly one transaction scope
//! 3. locks every account it touches, then decides (not found, insufficient funds)
//! 4. writes balances and history inside the same scope
//! 5. commits once on success, rolls back on any failure
//!
//! Dropping the in-flight future (deadline, caller gone) drops the scope, which
//! rolls back and releases its locks.
//!
//! ## Lock ordering
//!
//! Transfers lock both accounts in ascending `user_id` order. Two transfers in
//! opposite directions between the same pair therefore queue on the same first
//! lock instead of each holding one and waiting for the other.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::instrument;

use keeper_core::{Account, Amount, HistoryEntry, LedgerError, LedgerResult, UserId};
use keeper_infra::{AccountLock, History, LedgerStore, LedgerTransaction};

use crate::config::LedgerConfig;

/// Run `fut` until `deadline`; `DeadlineExceeded` if it has not finished by then.
///
/// Cancellation drops the future, so any transaction it opened rolls back.
pub async fn with_deadline<T, F>(deadline: Instant, fut: F) -> LedgerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| LedgerError::DeadlineExceeded)?
}

/// Ledger engine over an injected store handle.
///
/// Cheap to clone when the store is (pools and `Arc`s are).
#[derive(Debug, Clone)]
pub struct LedgerEngine<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> LedgerEngine<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Current balance. `NotFound` if the account was never created.
    #[instrument(skip(self), err)]
    pub async fn get_balance(&self, user_id: UserId) -> LedgerResult<Account> {
        let amount = self
            .store
            .balance(user_id)
            .await?
            .ok_or(LedgerError::NotFound(user_id))?;
        Ok(Account { user_id, amount })
    }

    /// Up to `limit` most recent entries, newest first.
    ///
    /// An unknown account is not an error here: it simply has no history.
    #[instrument(skip(self), err)]
    pub async fn get_history(&self, user_id: UserId, limit: i64) -> LedgerResult<History> {
        if limit <= 0 {
            return Ok(History::empty());
        }
        Ok(self.store.recent_history(user_id, limit).await?)
    }

    /// Credit `amount`, opening the account if this is its first credit.
    #[instrument(skip(self), err)]
    pub async fn deposit(&self, user_id: UserId, amount: i64) -> LedgerResult<()> {
        let amount = Amount::new(amount)?;

        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let outcome = deposit_in(&mut tx, user_id, amount, Utc::now()).await;
            finish(tx, outcome).await
        })
        .await?;

        tracing::debug!(%user_id, %amount, "deposit committed");
        Ok(())
    }

    /// Debit `amount`. The funds check happens under the row lock.
    #[instrument(skip(self), err)]
    pub async fn withdraw(&self, user_id: UserId, amount: i64) -> LedgerResult<()> {
        let amount = Amount::new(amount)?;

        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let outcome = withdraw_in(&mut tx, user_id, amount, Utc::now()).await;
            finish(tx, outcome).await
        })
        .await?;

        tracing::debug!(%user_id, %amount, "withdrawal committed");
        Ok(())
    }

    /// Move `amount` from `from` to `to`, opening `to` if needed.
    #[instrument(skip(self), err)]
    pub async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> LedgerResult<()> {
        let amount = Amount::new(amount)?;
        if from == to {
            return Err(LedgerError::invalid_argument(format!(
                "cannot transfer from account {from} to itself"
            )));
        }

        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let outcome = transfer_in(&mut tx, from, to, amount, Utc::now()).await;
            finish(tx, outcome).await
        })
        .await?;

        tracing::debug!(%from, %to, %amount, "transfer committed");
        Ok(())
    }

    async fn bounded<T, F>(&self, fut: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        match self.config.operation_timeout {
            Some(timeout) => with_deadline(Instant::now() + timeout, fut).await,
            None => fut.await,
        }
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged and the
/// original error wins; the scope is gone either way.
async fn finish<T, X>(tx: X, outcome: LedgerResult<T>) -> LedgerResult<T>
where
    X: LedgerTransaction,
{
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed; scope dropped");
            }
            Err(err)
        }
    }
}

async fn deposit_in<X>(
    tx: &mut X,
    user_id: UserId,
    amount: Amount,
    now: DateTime<Utc>,
) -> LedgerResult<()>
where
    X: LedgerTransaction,
{
    let lock = tx.ensure_and_lock(user_id).await?;
    credit(tx, user_id, lock, amount).await?;
    tx.append(&HistoryEntry::credit(user_id, amount, now)).await?;
    Ok(())
}

async fn withdraw_in<X>(
    tx: &mut X,
    user_id: UserId,
    amount: Amount,
    now: DateTime<Utc>,
) -> LedgerResult<()>
where
    X: LedgerTransaction,
{
    let lock = tx.ensure_and_lock(user_id).await?;
    ensure_funds(user_id, lock, amount)?;

    tx.adjust_balance(user_id, -amount.get()).await?;
    tx.append(&HistoryEntry::debit(user_id, amount, now)).await?;
    Ok(())
}

async fn transfer_in<X>(
    tx: &mut X,
    from: UserId,
    to: UserId,
    amount: Amount,
    now: DateTime<Utc>,
) -> LedgerResult<()>
where
    X: LedgerTransaction,
{
    let (from_lock, to_lock) = if from < to {
        let from_lock = tx.ensure_and_lock(from).await?;
        let to_lock = tx.ensure_and_lock(to).await?;
        (from_lock, to_lock)
    } else {
        let to_lock = tx.ensure_and_lock(to).await?;
        let from_lock = tx.ensure_and_lock(from).await?;
        (from_lock, to_lock)
    };

    ensure_funds(from, from_lock, amount)?;

    tx.adjust_balance(from, -amount.get()).await?;
    credit(tx, to, to_lock, amount).await?;

    tx.append(&HistoryEntry::debit(from, amount, now)).await?;
    tx.append(&HistoryEntry::credit(to, amount, now)).await?;
    Ok(())
}

fn ensure_funds(user_id: UserId, lock: AccountLock, amount: Amount) -> LedgerResult<()> {
    if !lock.existed {
        return Err(LedgerError::NotFound(user_id));
    }
    if lock.balance < amount.get() {
        return Err(LedgerError::InsufficientFunds {
            user_id,
            balance: lock.balance,
            requested: amount.get(),
        });
    }
    Ok(())
}

/// Create the account with `amount` or add `amount` to the locked balance.
async fn credit<X>(
    tx: &mut X,
    user_id: UserId,
    lock: AccountLock,
    amount: Amount,
) -> LedgerResult<()>
where
    X: LedgerTransaction,
{
    if lock.existed {
        amount.credit(lock.balance)?;
        tx.adjust_balance(user_id, amount.get()).await?;
    } else {
        tx.create_with_balance(user_id, amount.get()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_infra::{AccountRepository, InMemoryLedgerStore};
    use std::time::Duration;

    fn user(id: i64) -> UserId {
        UserId::new(id)
    }

    fn engine() -> LedgerEngine<InMemoryLedgerStore> {
        LedgerEngine::new(InMemoryLedgerStore::new())
    }

    async fn balance(engine: &LedgerEngine<InMemoryLedgerStore>, id: i64) -> i64 {
        engine.get_balance(user(id)).await.unwrap().amount
    }

    async fn history(
        engine: &LedgerEngine<InMemoryLedgerStore>,
        id: i64,
        limit: i64,
    ) -> Vec<HistoryEntry> {
        engine.get_history(user(id), limit).await.unwrap().collect()
    }

    #[tokio::test]
    async fn deposit_opens_account() {
        let engine = engine();
        engine.deposit(user(1), 100).await.unwrap();

        assert_eq!(
            engine.get_balance(user(1)).await.unwrap(),
            Account {
                user_id: user(1),
                amount: 100
            }
        );
    }

    #[tokio::test]
    async fn withdraw_after_deposit_records_both_movements() {
        let engine = engine();
        engine.deposit(user(1), 100).await.unwrap();
        engine.withdraw(user(1), 30).await.unwrap();

        assert_eq!(balance(&engine, 1).await, 70);

        let entries = history(&engine, 1, 2).await;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_debit);
        assert_eq!(entries[0].amount.get(), 30);
        assert!(!entries[1].is_debit);
        assert_eq!(entries[1].amount.get(), 100);
    }

    #[tokio::test]
    async fn withdraw_from_unknown_account_is_not_found_and_creates_nothing() {
        let engine = engine();

        let err = engine.withdraw(user(2), 10).await.unwrap_err();
        assert_eq!(err, LedgerError::NotFound(user(2)));

        assert!(engine.store().accounts().unwrap().is_empty());
        assert_eq!(engine.store().history_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn transfer_drains_sender_and_opens_receiver() {
        let engine = engine();
        engine.deposit(user(1), 50).await.unwrap();
        engine.transfer(user(1), user(2), 50).await.unwrap();

        assert_eq!(balance(&engine, 1).await, 0);
        assert_eq!(balance(&engine, 2).await, 50);

        let debit = history(&engine, 1, 1).await;
        let credit = history(&engine, 2, 1).await;
        assert!(debit[0].is_debit);
        assert!(!credit[0].is_debit);
        assert_eq!(debit[0].time, credit[0].time);
    }

    #[tokio::test]
    async fn transfer_to_existing_account_adds_to_its_balance() {
        let engine = engine();
        engine.deposit(user(1), 40).await.unwrap();
        engine.deposit(user(2), 5).await.unwrap();

        engine.transfer(user(2), user(1), 5).await.unwrap();

        assert_eq!(balance(&engine, 1).await, 45);
        assert_eq!(balance(&engine, 2).await, 0);
    }

    #[tokio::test]
    async fn transfer_with_insufficient_funds_changes_nothing() {
        let engine = engine();
        engine.deposit(user(1), 10).await.unwrap();

        let err = engine.transfer(user(1), user(2), 20).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                user_id: user(1),
                balance: 10,
                requested: 20
            }
        );

        assert_eq!(balance(&engine, 1).await, 10);
        assert_eq!(
            engine.get_balance(user(2)).await.unwrap_err(),
            LedgerError::NotFound(user(2))
        );
        assert_eq!(engine.store().history_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn transfer_from_unknown_account_is_not_found() {
        let engine = engine();
        engine.deposit(user(2), 10).await.unwrap();

        let err = engine.transfer(user(1), user(2), 5).await.unwrap_err();
        assert_eq!(err, LedgerError::NotFound(user(1)));
        assert_eq!(balance(&engine, 2).await, 10);
    }

    #[tokio::test]
    async fn withdraw_beyond_balance_is_a_no_op() {
        let engine = engine();
        engine.deposit(user(1), 10).await.unwrap();

        let err = engine.withdraw(user(1), 11).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        assert_eq!(balance(&engine, 1).await, 10);
        assert_eq!(history(&engine, 1, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected_before_touching_the_store() {
        let engine = engine();

        for amount in [0, -1] {
            assert!(matches!(
                engine.deposit(user(1), amount).await,
                Err(LedgerError::InvalidArgument(_))
            ));
            assert!(matches!(
                engine.withdraw(user(1), amount).await,
                Err(LedgerError::InvalidArgument(_))
            ));
            assert!(matches!(
                engine.transfer(user(1), user(2), amount).await,
                Err(LedgerError::InvalidArgument(_))
            ));
        }
        assert!(engine.store().accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_transfer_is_rejected() {
        let engine = engine();
        engine.deposit(user(1), 10).await.unwrap();

        assert!(matches!(
            engine.transfer(user(1), user(1), 5).await,
            Err(LedgerError::InvalidArgument(_))
        ));
        assert_eq!(history(&engine, 1, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn overflowing_credit_is_rejected_and_rolled_back() {
        let engine = engine();
        engine.deposit(user(1), i64::MAX).await.unwrap();
        engine.deposit(user(2), 1).await.unwrap();

        assert!(matches!(
            engine.deposit(user(1), 1).await,
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.transfer(user(2), user(1), 1).await,
            Err(LedgerError::InvalidArgument(_))
        ));

        assert_eq!(balance(&engine, 1).await, i64::MAX);
        assert_eq!(balance(&engine, 2).await, 1);
        assert_eq!(engine.store().history_len().unwrap(), 2);
    }

    #[tokio::test]
    async fn history_of_unknown_account_or_non_positive_limit_is_empty() {
        let engine = engine();
        engine.deposit(user(1), 10).await.unwrap();

        assert!(history(&engine, 99, 10).await.is_empty());
        assert!(history(&engine, 1, 0).await.is_empty());
        assert!(history(&engine, 1, -1).await.is_empty());
    }

    #[tokio::test]
    async fn repeated_balance_reads_agree() {
        let engine = engine();
        engine.deposit(user(1), 42).await.unwrap();

        let first = engine.get_balance(user(1)).await.unwrap();
        let second = engine.get_balance(user(1)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_withdrawals_of_the_full_balance_admit_exactly_one() {
        for _ in 0..50 {
            let engine = engine();
            engine.deposit(user(1), 25).await.unwrap();

            let a = tokio::spawn({
                let engine = engine.clone();
                async move { engine.withdraw(user(1), 25).await }
            });
            let b = tokio::spawn({
                let engine = engine.clone();
                async move { engine.withdraw(user(1), 25).await }
            });
            let results = [a.await.unwrap(), b.await.unwrap()];

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results.iter().any(|r| matches!(
                r,
                Err(LedgerError::InsufficientFunds { .. })
            )));
            assert_eq!(balance(&engine, 1).await, 0);
            assert_eq!(history(&engine, 1, 10).await.len(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_transfers_do_not_deadlock_and_conserve_total() {
        let engine = LedgerEngine::with_config(
            InMemoryLedgerStore::new(),
            LedgerConfig {
                operation_timeout: Some(Duration::from_secs(5)),
            },
        );
        engine.deposit(user(1), 1_000).await.unwrap();
        engine.deposit(user(2), 1_000).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..200 {
            let engine = engine.clone();
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            tasks.push(tokio::spawn(async move {
                engine.transfer(user(from), user(to), 3).await
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(result.is_ok(), "transfer failed: {result:?}");
        }

        assert_eq!(balance(&engine, 1).await + balance(&engine, 2).await, 2_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_deposits_both_land() {
        let engine = engine();

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.deposit(user(7), 5).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.deposit(user(7), 6).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(balance(&engine, 7).await, 11);
        assert_eq!(history(&engine, 7, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn deadline_while_waiting_for_lock_rolls_back() {
        let engine = LedgerEngine::with_config(
            InMemoryLedgerStore::new(),
            LedgerConfig {
                operation_timeout: Some(Duration::from_millis(50)),
            },
        );
        engine.deposit(user(1), 10).await.unwrap();

        let mut blocker = engine.store().begin().await.unwrap();
        blocker.ensure_and_lock(user(1)).await.unwrap();

        assert_eq!(
            engine.withdraw(user(1), 5).await.unwrap_err(),
            LedgerError::DeadlineExceeded
        );
        assert_eq!(
            engine.transfer(user(2), user(1), 5).await.unwrap_err(),
            LedgerError::DeadlineExceeded
        );

        blocker.rollback().await.unwrap();

        assert_eq!(balance(&engine, 1).await, 10);
        assert_eq!(engine.store().history_len().unwrap(), 1);

        engine.withdraw(user(1), 5).await.unwrap();
        assert_eq!(balance(&engine, 1).await, 5);
    }

    #[tokio::test]
    async fn with_deadline_passes_results_through() {
        let far = Instant::now() + Duration::from_secs(5);
        assert_eq!(with_deadline(far, async { Ok(3) }).await, Ok(3));

        let past = Instant::now();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, LedgerError>(())
        };
        assert_eq!(
            with_deadline(past, slow).await,
            Err(LedgerError::DeadlineExceeded)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(i64, i64),
        Withdraw(i64, i64),
        Transfer(i64, i64, i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        let id = 0i64..4;
        let amount = 1i64..60;
        prop_oneof![
            (id.clone(), amount.clone()).prop_map(|(u, a)| Op::Deposit(u, a)),
            (id.clone(), amount.clone()).prop_map(|(u, a)| Op::Withdraw(u, a)),
            (id.clone(), id, amount).prop_map(|(f, t, a)| Op::Transfer(f, t, a)),
        ]
    }

    fn total(store: &InMemoryLedgerStore) -> i64 {
        store.accounts().unwrap().iter().map(|a| a.amount).sum()
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: after every operation, no balance is negative, the total
        /// moves only by deposits/withdrawals, and each committed operation
        /// added exactly one (or, for transfers, two) history entries.
        #[test]
        fn ledger_invariants_hold_for_any_operation_sequence(
            ops in prop::collection::vec(op(), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async {
                let engine = engine();
                let store = engine.store().clone();

                for op in ops {
                    let total_before = total(&store);
                    let rows_before = store.history_len().unwrap();

                    let (result, expected_delta, expected_rows) = match op {
                        Op::Deposit(u, a) => (engine.deposit(user(u), a).await, a, 1),
                        Op::Withdraw(u, a) => (engine.withdraw(user(u), a).await, -a, 1),
                        Op::Transfer(f, t, a) => {
                            (engine.transfer(user(f), user(t), a).await, 0, 2)
                        }
                    };

                    let accounts = store.accounts().unwrap();
                    prop_assert!(accounts.iter().all(|a| a.amount >= 0));

                    let rows_after = store.history_len().unwrap();
                    match result {
                        Ok(()) => {
                            prop_assert_eq!(total(&store), total_before + expected_delta);
                            prop_assert_eq!(rows_after, rows_before + expected_rows);
                        }
                        Err(err) => {
                            let expected = matches!(
                                err,
                                LedgerError::NotFound(_)
                                    | LedgerError::InsufficientFunds { .. }
                                    | LedgerError::InvalidArgument(_)
                            );
                            prop_assert!(expected, "unexpected error: {err:?}");
                            prop_assert_eq!(total(&store), total_before);
                            prop_assert_eq!(rows_after, rows_before);
                        }
                    }
                }

                // Every balance is exactly the sum of its history.
                for account in store.accounts().unwrap() {
                    let replayed: i64 = engine
                        .get_history(account.user_id, 100)
                        .await
                        .unwrap()
                        .map(|e| e.delta())
                        .sum();
                    prop_assert_eq!(replayed, account.amount);
                }
                Ok(())
            })?;
        }
    }
}
