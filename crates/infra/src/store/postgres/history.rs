//! History recorder queries.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};

use keeper_core::{Amount, HistoryEntry, UserId};

use super::map_sqlx_error;
use crate::store::r#trait::{History, StoreError};

pub(super) async fn append(
    conn: &mut PgConnection,
    entry: &HistoryEntry,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO history (user_id, is_debit, amount, time) VALUES ($1, $2, $3, $4)")
        .bind(entry.user_id.get())
        .bind(entry.is_debit)
        .bind(entry.amount.get())
        .bind(entry.time)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("append_history", e))?;
    Ok(())
}

pub(super) async fn recent(
    pool: &PgPool,
    user_id: UserId,
    limit: i64,
) -> Result<History, StoreError> {
    if limit <= 0 {
        return Ok(History::empty());
    }

    let rows = sqlx::query(
        r#"
        SELECT user_id, is_debit, amount, time
        FROM history
        WHERE user_id = $1
        ORDER BY id DESC
        LIMIT $2
        "#,
    )
    .bind(user_id.get())
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| map_sqlx_error("recent_history", e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let row = HistoryRow::from_row(&row)
            .map_err(|e| StoreError::Decode(format!("failed to deserialize history row: {e}")))?;
        entries.push(HistoryEntry::try_from(row)?);
    }
    Ok(History::new(entries))
}

#[derive(Debug)]
struct HistoryRow {
    user_id: i64,
    is_debit: bool,
    amount: i64,
    time: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for HistoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            user_id: row.try_get("user_id")?,
            is_debit: row.try_get("is_debit")?,
            amount: row.try_get("amount")?,
            time: row.try_get("time")?,
        })
    }
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let amount = Amount::new(row.amount)
            .map_err(|e| StoreError::Decode(format!("history amount: {e}")))?;
        Ok(HistoryEntry {
            user_id: UserId::new(row.user_id),
            is_debit: row.is_debit,
            amount,
            time: row.time,
        })
    }
}
