//! Per-user forwarding preferences and the quiet-hours window.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::db::encode_time;
use crate::error::GatewayError;
use crate::phone::normalize_e164;

/// Row type returned by SQLite queries for forwarding preferences.
type PrefsRow = (i64, bool, Option<String>, Option<String>, Option<i64>, Option<i64>, i64);

/// Where and when a user's inbound messages are forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingPrefs {
    /// Owner of the pool number.
    pub user_id: i64,
    /// Master switch.
    pub enabled: bool,
    /// Alternate phone in E.164.
    pub forward_to_phone: Option<String>,
    /// Alternate email address.
    pub forward_to_email: Option<String>,
    /// Start hour of the quiet window, 0-23.
    pub quiet_hours_start: Option<u8>,
    /// End hour of the quiet window (exclusive), 0-23.
    pub quiet_hours_end: Option<u8>,
    /// User's offset from UTC, used to compute local hour.
    pub utc_offset_minutes: i32,
}

impl ForwardingPrefs {
    /// Whether forwarding is suppressed at `now`.
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        match (self.quiet_hours_start, self.quiet_hours_end) {
            (Some(start), Some(end)) => {
                in_quiet_hours(start, end, local_hour(now, self.utc_offset_minutes))
            }
            _ => false,
        }
    }
}

/// Whether `hour` falls in `[start, end)`. `start > end` spans midnight and
/// `start == end` is an empty window.
pub fn in_quiet_hours(start: u8, end: u8, hour: u8) -> bool {
    if start < end {
        (start..end).contains(&hour)
    } else if start > end {
        hour >= start || hour < end
    } else {
        false
    }
}

/// Hour of day at `now` shifted by `offset_minutes`.
pub fn local_hour(now: DateTime<Utc>, offset_minutes: i32) -> u8 {
    let local = TimeDelta::try_minutes(i64::from(offset_minutes))
        .and_then(|offset| now.checked_add_signed(offset))
        .unwrap_or(now);
    u8::try_from(local.hour()).unwrap_or(0)
}

/// Load a user's preferences.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn get_prefs(db: &SqlitePool, user_id: i64) -> Result<Option<ForwardingPrefs>, GatewayError> {
    let row: Option<PrefsRow> = sqlx::query_as(
        "SELECT user_id, enabled, forward_to_phone, forward_to_email, \
         quiet_hours_start, quiet_hours_end, utc_offset_minutes \
         FROM forwarding_prefs WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|(user_id, enabled, phone, email, start, end, offset)| ForwardingPrefs {
        user_id,
        enabled,
        forward_to_phone: phone,
        forward_to_email: email,
        quiet_hours_start: start.and_then(|h| u8::try_from(h).ok()),
        quiet_hours_end: end.and_then(|h| u8::try_from(h).ok()),
        utc_offset_minutes: i32::try_from(offset).unwrap_or(0),
    }))
}

/// Insert or replace a user's preferences.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidArgument`] for an hour outside 0-23 or a
/// malformed forwarding phone, and [`GatewayError::Database`] on SQLite failure.
pub async fn upsert_prefs(db: &SqlitePool, prefs: &ForwardingPrefs) -> Result<(), GatewayError> {
    for hour in [prefs.quiet_hours_start, prefs.quiet_hours_end].into_iter().flatten() {
        if hour > 23 {
            return Err(GatewayError::InvalidArgument(format!(
                "quiet hour {hour} is outside 0-23"
            )));
        }
    }
    let phone = prefs
        .forward_to_phone
        .as_deref()
        .map(normalize_e164)
        .transpose()?;
    sqlx::query(
        "INSERT INTO forwarding_prefs (user_id, enabled, forward_to_phone, forward_to_email, \
         quiet_hours_start, quiet_hours_end, utc_offset_minutes, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(user_id) DO UPDATE SET enabled = excluded.enabled, \
             forward_to_phone = excluded.forward_to_phone, \
             forward_to_email = excluded.forward_to_email, \
             quiet_hours_start = excluded.quiet_hours_start, \
             quiet_hours_end = excluded.quiet_hours_end, \
             utc_offset_minutes = excluded.utc_offset_minutes, \
             updated_at = excluded.updated_at",
    )
    .bind(prefs.user_id)
    .bind(prefs.enabled)
    .bind(phone)
    .bind(&prefs.forward_to_email)
    .bind(prefs.quiet_hours_start.map(i64::from))
    .bind(prefs.quiet_hours_end.map(i64::from))
    .bind(i64::from(prefs.utc_offset_minutes))
    .bind(encode_time(Utc::now()))
    .execute(db)
    .await?;
    debug!(user_id = prefs.user_id, enabled = prefs.enabled, "forwarding preferences saved");
    Ok(())
}
