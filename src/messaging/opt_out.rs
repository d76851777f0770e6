//! Opt-out registry keyed by E.164 number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::db::{decode_opt_time, encode_time};
use crate::error::GatewayError;

/// Row type returned by SQLite queries for phones.
type PhoneRow = (String, bool, Option<String>);

/// Subscription state of an external number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    /// Number in E.164.
    pub number: String,
    /// True after STOP until START.
    pub opted_out: bool,
    /// When the current opt-out began.
    pub opted_out_at: Option<DateTime<Utc>>,
}

/// Load a number's subscription row. Unknown numbers have none.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn get_phone(db: &SqlitePool, number: &str) -> Result<Option<Phone>, GatewayError> {
    let row: Option<PhoneRow> =
        sqlx::query_as("SELECT number, opted_out, opted_out_at FROM phones WHERE number = ?1")
            .bind(number)
            .fetch_optional(db)
            .await?;
    row.map(|(number, opted_out, opted_out_at)| {
        Ok(Phone {
            number,
            opted_out,
            opted_out_at: decode_opt_time("opted_out_at", opted_out_at)?,
        })
    })
    .transpose()
}

/// Create a subscribed row for a number on first contact. Existing rows are untouched.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn ensure_phone(db: &SqlitePool, number: &str) -> Result<(), GatewayError> {
    sqlx::query("INSERT INTO phones (number) VALUES (?1) ON CONFLICT(number) DO NOTHING")
        .bind(number)
        .execute(db)
        .await?;
    Ok(())
}

/// Whether sends to this number are blocked.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn is_opted_out(db: &SqlitePool, number: &str) -> Result<bool, GatewayError> {
    let row: Option<(bool,)> = sqlx::query_as("SELECT opted_out FROM phones WHERE number = ?1")
        .bind(number)
        .fetch_optional(db)
        .await?;
    Ok(row.is_some_and(|(opted_out,)| opted_out))
}

/// Record a STOP (`true`) or START (`false`), creating the row if needed.
///
/// A repeated STOP keeps the original `opted_out_at`.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn set_opted_out(
    db: &SqlitePool,
    number: &str,
    opted_out: bool,
    at: DateTime<Utc>,
) -> Result<(), GatewayError> {
    let at = encode_time(at);
    let opted_out_at = opted_out.then(|| at.clone());
    sqlx::query(
        "INSERT INTO phones (number, opted_out, opted_out_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(number) DO UPDATE SET \
             opted_out = excluded.opted_out, \
             opted_out_at = CASE \
                 WHEN excluded.opted_out = 0 THEN NULL \
                 WHEN phones.opted_out = 1 THEN phones.opted_out_at \
                 ELSE excluded.opted_out_at END, \
             updated_at = excluded.updated_at",
    )
    .bind(number)
    .bind(opted_out)
    .bind(opted_out_at)
    .bind(&at)
    .execute(db)
    .await?;
    debug!(opted_out, "subscription state updated");
    Ok(())
}
