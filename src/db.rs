//! SQLite pool setup and timestamp encoding.
//!
//! The schema is applied inline via `include_str!` on every open; all
//! statements are `IF NOT EXISTS`, so reopening an existing file is a no-op.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::GatewayError;

/// Schema applied on open.
pub const SCHEMA_SQL: &str = include_str!("../migrations/001_schema.sql");

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum pooled connections for the file-backed database.
const MAX_CONNECTIONS: u32 = 8;

/// Open (or create) the gateway database and apply the schema.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the schema fails to apply.
pub async fn open_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .pragma("trusted_schema", "OFF")
        .pragma("foreign_keys", "ON");

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Open a single-connection in-memory database with the schema applied.
///
/// # Errors
///
/// Returns an error if SQLite cannot be initialised.
pub async fn open_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("invalid in-memory sqlite url")?
        .pragma("foreign_keys", "ON");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply the schema to an open pool.
///
/// # Errors
///
/// Returns an error if any statement fails.
pub async fn apply_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to apply numgate schema")?;
    Ok(())
}

/// Encode a timestamp for storage.
///
/// Fixed-width microsecond RFC 3339 so stored values compare correctly as text.
pub fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidEnum`] when the column is not RFC 3339.
pub fn decode_time(field: &'static str, raw: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| GatewayError::InvalidEnum {
            field,
            value: raw.to_owned(),
        })
}

/// Decode an optional stored timestamp.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidEnum`] when a present value is not RFC 3339.
pub fn decode_opt_time(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, GatewayError> {
    raw.map(|value| decode_time(field, &value)).transpose()
}
