//! Account repository queries.

use sqlx::{PgConnection, PgPool, Row};

use keeper_core::UserId;

use super::map_sqlx_error;
use crate::store::r#trait::{AccountLock, StoreError};

pub(super) async fn fetch_balance(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Option<i64>, StoreError> {
    let row = sqlx::query("SELECT amount FROM accounts WHERE user_id = $1")
        .bind(user_id.get())
        .fetch_optional(pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_balance", e))?;

    row.map(|r| r.try_get::<i64, _>("amount"))
        .transpose()
        .map_err(|e| map_sqlx_error("fetch_balance", e))
}

/// Lock `user_id` for the rest of the transaction, whether or not the row exists.
pub(super) async fn lock(
    conn: &mut PgConnection,
    user_id: UserId,
) -> Result<AccountLock, StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(user_id.get())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;

    let row = sqlx::query("SELECT amount FROM accounts WHERE user_id = $1 FOR UPDATE")
        .bind(user_id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_account", e))?;

    match row {
        Some(row) => {
            let balance: i64 = row
                .try_get("amount")
                .map_err(|e| map_sqlx_error("lock_account", e))?;
            Ok(AccountLock::present(balance))
        }
        None => Ok(AccountLock::absent()),
    }
}

pub(super) async fn insert(
    conn: &mut PgConnection,
    user_id: UserId,
    balance: i64,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO accounts (user_id, amount) VALUES ($1, $2)")
        .bind(user_id.get())
        .bind(balance)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_account", e))?;
    Ok(())
}

pub(super) async fn adjust(
    conn: &mut PgConnection,
    user_id: UserId,
    delta: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE accounts SET amount = amount + $1 WHERE user_id = $2")
        .bind(delta)
        .bind(user_id.get())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("adjust_balance", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "account {user_id} does not exist"
        )));
    }
    Ok(())
}
