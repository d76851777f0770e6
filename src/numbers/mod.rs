//! Leasable phone-number pool.
//!
//! [`pool::NumberPoolManager`] is the only writer of `phone_numbers.status`
//! and `assigned_user_id`. Every transition is one conditional `UPDATE`
//! guarded on the current status; a zero row count means the caller lost a
//! race and gets a domain conflict rather than a silent substitution.

pub mod policy;
pub mod pool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::trace;

use crate::db::{decode_opt_time, encode_time};
use crate::error::GatewayError;
use crate::providers::Capability;

/// Lifecycle state of a pool number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumberStatus {
    /// In the pool, free to reserve or lease.
    Available,
    /// At least one user holds an advisory reservation.
    Reserved,
    /// Durably leased to one user.
    Assigned,
    /// Cooling off after release; still attributed to the former owner.
    Hold,
    /// Returned upstream. Terminal.
    Released,
}

impl NumberStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Assigned => "ASSIGNED",
            Self::Hold => "HOLD",
            Self::Released => "RELEASED",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "RESERVED" => Ok(Self::Reserved),
            "ASSIGNED" => Ok(Self::Assigned),
            "HOLD" => Ok(Self::Hold),
            "RELEASED" => Ok(Self::Released),
            other => Err(GatewayError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A pool number row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    /// Row id.
    pub id: i64,
    /// Canonical number, globally unique.
    pub e164: String,
    /// Adapter that owns (or will own) the number upstream.
    pub provider: String,
    /// Upstream identifier; `None` until purchased.
    pub provider_ref: Option<String>,
    /// Lifecycle state.
    pub status: NumberStatus,
    /// Owner while `ASSIGNED` or `HOLD`.
    pub assigned_user_id: Option<i64>,
    /// When the current lease began.
    pub assigned_at: Option<DateTime<Utc>>,
    /// End of the cooling-off period while in `HOLD`.
    pub hold_until: Option<DateTime<Utc>>,
    /// Premium protection: never released or recycled.
    pub keep_locked: bool,
    /// Messaging/voice capabilities.
    pub capabilities: Vec<Capability>,
    /// NANP area code, if any.
    pub area_code: Option<String>,
    /// ISO 3166 alpha-2 country.
    pub iso_country: String,
    /// Premium inventory that requires explicit purchase intent.
    pub for_sale: bool,
    /// Last inbound or outbound traffic.
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Columns selected for [`PhoneNumber`] decoding.
pub(crate) const PHONE_NUMBER_COLUMNS: &str = "id, e164, provider, provider_ref, status, \
     assigned_user_id, assigned_at, hold_until, keep_locked, capabilities, area_code, \
     iso_country, for_sale, last_activity_at";

impl PhoneNumber {
    /// Decode a row selected with [`PHONE_NUMBER_COLUMNS`].
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, GatewayError> {
        let status: String = row.try_get("status")?;
        let capabilities: String = row.try_get("capabilities")?;
        Ok(Self {
            id: row.try_get("id")?,
            e164: row.try_get("e164")?,
            provider: row.try_get("provider")?,
            provider_ref: row.try_get("provider_ref")?,
            status: NumberStatus::parse(&status)?,
            assigned_user_id: row.try_get("assigned_user_id")?,
            assigned_at: decode_opt_time("assigned_at", row.try_get("assigned_at")?)?,
            hold_until: decode_opt_time("hold_until", row.try_get("hold_until")?)?,
            keep_locked: row.try_get("keep_locked")?,
            capabilities: decode_capabilities(&capabilities)?,
            area_code: row.try_get("area_code")?,
            iso_country: row.try_get("iso_country")?,
            for_sale: row.try_get("for_sale")?,
            last_activity_at: decode_opt_time("last_activity_at", row.try_get("last_activity_at")?)?,
        })
    }

    /// Whether the number advertises a capability.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// An advisory hold on a number by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberReservation {
    /// Reserved number row.
    pub phone_number_id: i64,
    /// Number in E.164.
    pub e164: String,
    /// Reserving user.
    pub user_id: i64,
    /// When the reservation lapses.
    pub expires_at: DateTime<Utc>,
}

/// A number being added to pool inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPoolNumber {
    /// Number in E.164.
    pub e164: String,
    /// Owning adapter.
    pub provider: String,
    /// Upstream identifier if already purchased.
    pub provider_ref: Option<String>,
    /// Capabilities.
    pub capabilities: Vec<Capability>,
    /// ISO 3166 alpha-2 country.
    pub iso_country: String,
    /// Premium inventory flag.
    pub for_sale: bool,
}

pub(crate) fn encode_capabilities(capabilities: &[Capability]) -> String {
    let mut sorted = capabilities.to_vec();
    sorted.sort();
    sorted.dedup();
    serde_json::to_string(&sorted).unwrap_or_else(|_| "[]".to_owned())
}

fn decode_capabilities(raw: &str) -> Result<Vec<Capability>, GatewayError> {
    serde_json::from_str(raw).map_err(|_| GatewayError::InvalidEnum {
        field: "capabilities",
        value: raw.to_owned(),
    })
}

/// Stamp traffic on a pool number. No-op for numbers outside the pool.
///
/// Feeds inactivity recycling; does not touch lifecycle columns.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn touch_activity(
    db: &SqlitePool,
    e164: &str,
    at: DateTime<Utc>,
) -> Result<(), GatewayError> {
    let result = sqlx::query(
        "UPDATE phone_numbers SET last_activity_at = ?1 \
         WHERE e164 = ?2 AND status IN ('ASSIGNED', 'HOLD')",
    )
    .bind(encode_time(at))
    .bind(e164)
    .execute(db)
    .await?;
    trace!(touched = result.rows_affected(), "number activity recorded");
    Ok(())
}

/// Whether a number belongs to the pool (any non-terminal state).
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn is_pool_number(db: &SqlitePool, e164: &str) -> Result<bool, GatewayError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM phone_numbers WHERE e164 = ?1 AND status != 'RELEASED'",
    )
    .bind(e164)
    .fetch_optional(db)
    .await?;
    Ok(row.is_some())
}

/// Owner of the number currently assigned as `e164`, if any.
///
/// # Errors
///
/// Returns [`GatewayError::Database`] on SQLite failure.
pub async fn assigned_owner(db: &SqlitePool, e164: &str) -> Result<Option<i64>, GatewayError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT assigned_user_id FROM phone_numbers WHERE e164 = ?1 AND status = 'ASSIGNED'",
    )
    .bind(e164)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|(user_id,)| user_id))
}
