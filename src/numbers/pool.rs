//! Number pool manager: search, reserve, claim, lease, release, recycle.
//!
//! Ordering rule for anything that touches the carrier: a caller first wins
//! the purchase marker with a conditional `UPDATE`, then buys upstream, then
//! assigns with a second conditional `UPDATE`. Racing callers conflict before
//! reaching the carrier, and a failed or timed-out purchase never leaves a
//! number `ASSIGNED`.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::db::encode_time;
use crate::error::{is_unique_violation, GatewayError};
use crate::phone::{area_code_of, country_hint, normalize_e164, vanity_score};
use crate::providers::gateway::ProviderGateway;
use crate::providers::{AvailableNumber, Capability, PurchasedNumber, SearchFilter};

use super::policy::NumberPolicy;
use super::{
    encode_capabilities, NewPoolNumber, NumberReservation, NumberStatus, PhoneNumber,
    PHONE_NUMBER_COLUMNS,
};

/// How many filter matches are ranked when auto-assigning from the pool.
const CANDIDATE_SCAN_LIMIT: i64 = 100;

/// A purchase marker older than this is treated as abandoned.
const PURCHASE_MARKER_STALE_SECS: i64 = 300;

/// Conditional assignment shared by claim and lease.
///
/// The `WHERE status IN (...)` guard is what makes concurrent claims safe:
/// exactly one caller sees a non-zero row count. A number being bought by
/// someone else cannot be assigned.
const ASSIGN_SQL: &str = "UPDATE phone_numbers SET status = 'ASSIGNED', assigned_user_id = ?1, \
     assigned_at = ?2, hold_until = NULL, provider_ref = ?3, keep_locked = ?4, \
     last_activity_at = ?2, updated_at = ?2, \
     purchasing_user_id = NULL, purchase_started_at = NULL \
     WHERE id = ?5 AND status IN ('AVAILABLE', 'RESERVED') \
     AND (purchasing_user_id IS NULL OR purchasing_user_id = ?1)";

/// Take the purchase marker on an unbought number.
const MARK_PURCHASE_SQL: &str = "UPDATE phone_numbers \
     SET purchasing_user_id = ?1, purchase_started_at = ?2, updated_at = ?2 \
     WHERE id = ?3 AND status IN ('AVAILABLE', 'RESERVED') AND provider_ref IS NULL \
     AND (purchasing_user_id IS NULL OR purchase_started_at < ?4)";

/// What a lease should pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseTarget {
    /// A specific number the user searched for.
    Number(String),
    /// First pool match, preferring vanity numbers.
    Filter(SearchFilter),
}

/// Result of releasing a user's number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// The released number.
    pub e164: String,
    /// State after release (`HOLD` or `AVAILABLE`).
    pub status: NumberStatus,
    /// End of the cooling-off period, when held.
    pub hold_until: Option<DateTime<Utc>>,
}

/// Counts from one hygiene sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// `HOLD` numbers returned to `AVAILABLE`.
    pub holds_returned: u64,
    /// `RESERVED` numbers with no live reservation returned to `AVAILABLE`.
    pub reservations_lapsed: u64,
    /// Expired reservation rows deleted.
    pub reservations_purged: u64,
}

/// Owner of the phone-number state machine.
#[derive(Debug, Clone)]
pub struct NumberPoolManager {
    db: SqlitePool,
    gateway: Arc<ProviderGateway>,
    config: PoolConfig,
}

impl NumberPoolManager {
    /// Create a manager over the given pool and gateway.
    pub fn new(db: SqlitePool, gateway: Arc<ProviderGateway>, config: PoolConfig) -> Self {
        Self {
            db,
            gateway,
            config,
        }
    }

    /// Access the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Pool configuration in effect.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // -- Reads ---------------------------------------------------------------

    /// Query upstream inventory through the default adapter. No state change.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BadGateway`] when the carrier query fails.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<AvailableNumber>, GatewayError> {
        let adapter = self.gateway.default_adapter();
        let results = adapter.search_available(filter).await?;
        debug!(provider = adapter.name(), count = results.len(), "inventory search");
        Ok(results)
    }

    /// Load a number by E.164.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] on SQLite failure.
    pub async fn get(&self, e164: &str) -> Result<Option<PhoneNumber>, GatewayError> {
        let sql = format!("SELECT {PHONE_NUMBER_COLUMNS} FROM phone_numbers WHERE e164 = ?1");
        let row = sqlx::query(&sql).bind(e164).fetch_optional(&self.db).await?;
        row.as_ref().map(PhoneNumber::from_row).transpose()
    }

    /// The number currently `ASSIGNED` to a user.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] on SQLite failure.
    pub async fn active_number(&self, user_id: i64) -> Result<Option<PhoneNumber>, GatewayError> {
        let mut conn = self.db.acquire().await?;
        active_number_on(&mut conn, user_id).await
    }

    // -- Inventory -----------------------------------------------------------

    /// Add a number to pool inventory as `AVAILABLE`.
    ///
    /// Idempotent on `e164`: an existing row is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for a malformed number.
    pub async fn add_to_pool(&self, number: NewPoolNumber) -> Result<PhoneNumber, GatewayError> {
        let e164 = normalize_e164(&number.e164)?;
        let result = sqlx::query(
            "INSERT INTO phone_numbers (e164, provider, provider_ref, status, capabilities, \
             area_code, iso_country, for_sale) \
             VALUES (?1, ?2, ?3, 'AVAILABLE', ?4, ?5, ?6, ?7) \
             ON CONFLICT(e164) DO NOTHING",
        )
        .bind(&e164)
        .bind(&number.provider)
        .bind(&number.provider_ref)
        .bind(encode_capabilities(&number.capabilities))
        .bind(area_code_of(&e164))
        .bind(number.iso_country.to_ascii_uppercase())
        .bind(number.for_sale)
        .execute(&self.db)
        .await?;
        if result.rows_affected() > 0 {
            info!(provider = %number.provider, "number added to pool");
        }
        self.get(&e164)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("{e164} vanished after insert")))
    }

    // -- Reserve / claim -----------------------------------------------------

    /// Reserve a number for the configured default TTL.
    ///
    /// # Errors
    ///
    /// See [`Self::reserve`].
    pub async fn reserve_default(
        &self,
        user_id: i64,
        e164: &str,
    ) -> Result<NumberReservation, GatewayError> {
        let ttl = std::time::Duration::from_secs(
            u64::from(self.config.reservation_ttl_minutes).saturating_mul(60),
        );
        self.reserve(user_id, e164, ttl).await
    }

    /// Place an advisory hold on a number.
    ///
    /// Upserts the number to `RESERVED` only if it is `AVAILABLE` or already
    /// `RESERVED`. Several users may hold reservations at once; the claim
    /// decides the winner.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for a malformed number or a
    /// zero TTL, and [`GatewayError::Conflict`] when the number is leased,
    /// held, or released.
    pub async fn reserve(
        &self,
        user_id: i64,
        e164: &str,
        ttl: std::time::Duration,
    ) -> Result<NumberReservation, GatewayError> {
        let e164 = normalize_e164(e164)?;
        let ttl = TimeDelta::from_std(ttl)
            .ok()
            .filter(|t| *t > TimeDelta::zero())
            .ok_or_else(|| {
                GatewayError::InvalidArgument("reservation ttl must be positive".to_owned())
            })?;
        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            GatewayError::InvalidArgument("reservation ttl out of range".to_owned())
        })?;

        let mut tx = self.db.begin().await?;
        let upsert = sqlx::query(
            "INSERT INTO phone_numbers (e164, provider, status, area_code, iso_country, updated_at) \
             VALUES (?1, ?2, 'RESERVED', ?3, ?4, ?5) \
             ON CONFLICT(e164) DO UPDATE SET status = 'RESERVED', updated_at = excluded.updated_at \
             WHERE phone_numbers.status IN ('AVAILABLE', 'RESERVED')",
        )
        .bind(&e164)
        .bind(self.gateway.default_name())
        .bind(area_code_of(&e164))
        .bind(country_hint(&e164))
        .bind(encode_time(now))
        .execute(&mut *tx)
        .await?;
        if upsert.rows_affected() == 0 {
            return Err(GatewayError::Conflict(format!("{e164} is not available")));
        }

        let (phone_number_id,): (i64,) =
            sqlx::query_as("SELECT id FROM phone_numbers WHERE e164 = ?1")
                .bind(&e164)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO number_reservations (phone_number_id, user_id, expires_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(phone_number_id)
        .bind(user_id)
        .bind(encode_time(expires_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(user_id, %e164, %expires_at, "number reserved");
        Ok(NumberReservation {
            phone_number_id,
            e164,
            user_id,
            expires_at,
        })
    }

    /// Durably assign a reserved number to the user.
    ///
    /// Purchases upstream first when the number has no provider reference,
    /// then performs the single conditional update.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] if the number is unknown.
    /// - [`GatewayError::Gone`] if the user has no unexpired reservation.
    /// - [`GatewayError::Conflict`] if the user already holds a number or the
    ///   number was taken (including losing a concurrent claim).
    /// - [`GatewayError::BadGateway`] if the upstream purchase fails; nothing
    ///   is written in that case.
    pub async fn claim(&self, user_id: i64, e164: &str) -> Result<PhoneNumber, GatewayError> {
        let e164 = normalize_e164(e164)?;
        let now = Utc::now();
        // Status and reservation are read in one statement so a concurrent
        // winner is always seen as a conflict, never as a lapsed reservation.
        let sql = format!(
            "SELECT {PHONE_NUMBER_COLUMNS}, EXISTS ( \
                 SELECT 1 FROM number_reservations r \
                 WHERE r.phone_number_id = phone_numbers.id \
                 AND r.user_id = ?2 AND r.expires_at > ?3) AS has_reservation \
             FROM phone_numbers WHERE e164 = ?1"
        );
        let row = sqlx::query(&sql)
            .bind(&e164)
            .bind(user_id)
            .bind(encode_time(now))
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("{e164} is not in the pool")))?;
        let number = PhoneNumber::from_row(&row)?;
        let has_reservation: bool = row.try_get("has_reservation")?;

        if number.status == NumberStatus::Assigned && number.assigned_user_id == Some(user_id) {
            return Ok(number);
        }
        if !matches!(
            number.status,
            NumberStatus::Available | NumberStatus::Reserved
        ) {
            return Err(GatewayError::Conflict(format!(
                "{e164} is {}",
                number.status.as_str()
            )));
        }
        if !has_reservation {
            return Err(GatewayError::Gone(format!(
                "no live reservation on {e164}; reserve it again"
            )));
        }
        self.ensure_claimable(user_id, &number).await?;

        let provider_ref = self.ensure_purchased(user_id, &number, now).await?;
        let mut conn = self.db.acquire().await?;
        assign_on(&mut conn, &number, user_id, &provider_ref, number.keep_locked, now).await?;
        drop(conn);

        info!(user_id, number_id = number.id, "number claimed");
        self.reload(&e164).await
    }

    // -- Lease ---------------------------------------------------------------

    /// Reserve and claim in one step (pool auto-assignment).
    ///
    /// `purchase_intent` allows premium (`for_sale`) inventory, locks it to
    /// the buyer, and lets an explicit number outside the pool be bought.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] when nothing matches.
    /// - [`GatewayError::Forbidden`] for premium inventory without intent.
    /// - [`GatewayError::Conflict`] when the user already holds a number or
    ///   the candidate was taken concurrently. The lease is not retried
    ///   against another number.
    /// - [`GatewayError::BadGateway`] when the upstream purchase fails.
    pub async fn lease(
        &self,
        user_id: i64,
        target: &LeaseTarget,
        purchase_intent: bool,
    ) -> Result<PhoneNumber, GatewayError> {
        let candidate = match target {
            LeaseTarget::Number(raw) => {
                let e164 = normalize_e164(raw)?;
                match self.get(&e164).await? {
                    Some(number) => number,
                    None if purchase_intent => {
                        self.add_to_pool(NewPoolNumber {
                            iso_country: country_hint(&e164).to_owned(),
                            e164,
                            provider: self.gateway.default_name().to_owned(),
                            provider_ref: None,
                            capabilities: vec![Capability::Sms],
                            for_sale: false,
                        })
                        .await?
                    }
                    None => {
                        return Err(GatewayError::NotFound(format!("{e164} is not in the pool")))
                    }
                }
            }
            LeaseTarget::Filter(filter) => self
                .pick_candidate(filter, purchase_intent)
                .await?
                .ok_or_else(|| {
                    GatewayError::NotFound("no pool number matches the filter".to_owned())
                })?,
        };

        if candidate.for_sale && !purchase_intent {
            return Err(GatewayError::Forbidden(format!(
                "{} is premium inventory and requires purchase intent",
                candidate.e164
            )));
        }
        self.ensure_claimable(user_id, &candidate).await?;

        let now = Utc::now();
        let provider_ref = self.ensure_purchased(user_id, &candidate, now).await?;
        let keep_locked = candidate.keep_locked || (purchase_intent && candidate.for_sale);

        let mut conn = self.db.acquire().await?;
        assign_on(&mut conn, &candidate, user_id, &provider_ref, keep_locked, now).await?;
        drop(conn);

        info!(user_id, number_id = candidate.id, keep_locked, "number leased");
        self.reload(&candidate.e164).await
    }

    async fn pick_candidate(
        &self,
        filter: &SearchFilter,
        purchase_intent: bool,
    ) -> Result<Option<PhoneNumber>, GatewayError> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {PHONE_NUMBER_COLUMNS} FROM phone_numbers WHERE status = 'AVAILABLE'"
        ));
        query
            .push(" AND iso_country = ")
            .push_bind(filter.iso_country.trim().to_ascii_uppercase());
        if let Some(area_code) = filter.area_code.as_deref().filter(|a| !a.is_empty()) {
            query.push(" AND area_code = ").push_bind(area_code.to_owned());
        }
        for capability in &filter.capabilities {
            query
                .push(" AND capabilities LIKE ")
                .push_bind(format!("%\"{}\"%", capability.as_str()));
        }
        if !purchase_intent {
            query.push(" AND for_sale = 0");
        }
        query
            .push(" ORDER BY id LIMIT ")
            .push_bind(CANDIDATE_SCAN_LIMIT);

        let rows = query.build().fetch_all(&self.db).await?;
        let mut candidates = rows
            .iter()
            .map(PhoneNumber::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        candidates.sort_by_key(|n| (Reverse(vanity_score(&n.e164)), n.id));
        Ok(candidates.into_iter().next())
    }

    // -- Release -------------------------------------------------------------

    /// Return the user's number to the pool.
    ///
    /// With `hold_days > 0` the number enters `HOLD` until the cooling-off
    /// period ends (the sweeper frees it afterwards); otherwise it goes
    /// straight to `AVAILABLE`. Releasing an already-held number is a no-op
    /// that reports the existing hold.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] if the user holds no number.
    /// - [`GatewayError::Forbidden`] if the number is `keep_locked`.
    /// - [`GatewayError::Conflict`] if the number changed state concurrently.
    pub async fn release(
        &self,
        user_id: i64,
        hold_days: Option<u32>,
    ) -> Result<ReleaseOutcome, GatewayError> {
        let sql = format!(
            "SELECT {PHONE_NUMBER_COLUMNS} FROM phone_numbers \
             WHERE assigned_user_id = ?1 AND status IN ('ASSIGNED', 'HOLD') \
             ORDER BY CASE status WHEN 'ASSIGNED' THEN 0 ELSE 1 END LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        let number = row
            .as_ref()
            .map(PhoneNumber::from_row)
            .transpose()?
            .ok_or_else(|| GatewayError::NotFound(format!("user {user_id} holds no number")))?;

        if number.keep_locked {
            return Err(GatewayError::Forbidden(format!(
                "{} is locked to its owner",
                number.e164
            )));
        }
        if number.status == NumberStatus::Hold {
            return Ok(ReleaseOutcome {
                e164: number.e164,
                status: NumberStatus::Hold,
                hold_until: number.hold_until,
            });
        }

        let now = Utc::now();
        let outcome = match hold_days.filter(|d| *d > 0) {
            Some(days) => {
                let hold_until = add_days(now, days)?;
                let result = sqlx::query(
                    "UPDATE phone_numbers SET status = 'HOLD', hold_until = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = 'ASSIGNED' AND keep_locked = 0",
                )
                .bind(encode_time(hold_until))
                .bind(encode_time(now))
                .bind(number.id)
                .execute(&self.db)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(lost_race(&number.e164));
                }
                ReleaseOutcome {
                    e164: number.e164,
                    status: NumberStatus::Hold,
                    hold_until: Some(hold_until),
                }
            }
            None => {
                let result = sqlx::query(
                    "UPDATE phone_numbers SET status = 'AVAILABLE', assigned_user_id = NULL, \
                     assigned_at = NULL, hold_until = NULL, updated_at = ?1 \
                     WHERE id = ?2 AND status = 'ASSIGNED' AND keep_locked = 0",
                )
                .bind(encode_time(now))
                .bind(number.id)
                .execute(&self.db)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(lost_race(&number.e164));
                }
                ReleaseOutcome {
                    e164: number.e164,
                    status: NumberStatus::Available,
                    hold_until: None,
                }
            }
        };
        info!(user_id, status = outcome.status.as_str(), "number released");
        Ok(outcome)
    }

    /// Give an unleased number back to the carrier (terminal `RELEASED`).
    ///
    /// The row leaves the pool first so nobody can lease it mid-release; an
    /// upstream failure puts it back to `AVAILABLE`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] if the number is unknown.
    /// - [`GatewayError::Forbidden`] if it is `keep_locked`.
    /// - [`GatewayError::Conflict`] if it is not `AVAILABLE`.
    /// - [`GatewayError::BadGateway`] if the carrier refuses the release.
    pub async fn retire(&self, e164: &str) -> Result<PhoneNumber, GatewayError> {
        let e164 = normalize_e164(e164)?;
        let number = self
            .get(&e164)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("{e164} is not in the pool")))?;
        if number.keep_locked {
            return Err(GatewayError::Forbidden(format!("{e164} is locked")));
        }

        let now = encode_time(Utc::now());
        let taken = sqlx::query(
            "UPDATE phone_numbers SET status = 'RELEASED', updated_at = ?1 \
             WHERE id = ?2 AND status = 'AVAILABLE' AND keep_locked = 0",
        )
        .bind(&now)
        .bind(number.id)
        .execute(&self.db)
        .await?;
        if taken.rows_affected() == 0 {
            return Err(GatewayError::Conflict(format!(
                "{e164} must be AVAILABLE to release upstream"
            )));
        }

        if let Some(provider_ref) = number.provider_ref.as_deref() {
            let adapter = self.gateway.resolve(Some(&number.provider));
            if let Err(err) = adapter.release_number(provider_ref).await {
                warn!(number_id = number.id, error = %err, "upstream release failed, restoring");
                sqlx::query(
                    "UPDATE phone_numbers SET status = 'AVAILABLE', updated_at = ?1 \
                     WHERE id = ?2 AND status = 'RELEASED'",
                )
                .bind(&now)
                .bind(number.id)
                .execute(&self.db)
                .await?;
                return Err(GatewayError::BadGateway(err));
            }
        }
        info!(number_id = number.id, "number released upstream");
        self.reload(&e164).await
    }

    // -- Hygiene -------------------------------------------------------------

    /// Free expired holds and lapsed reservations.
    ///
    /// Correctness never depends on this running; claim checks expiry lazily.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] on SQLite failure.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, GatewayError> {
        let now = encode_time(now);
        let holds = sqlx::query(
            "UPDATE phone_numbers SET status = 'AVAILABLE', assigned_user_id = NULL, \
             assigned_at = NULL, hold_until = NULL, updated_at = ?1 \
             WHERE status = 'HOLD' AND keep_locked = 0 \
             AND hold_until IS NOT NULL AND hold_until <= ?1",
        )
        .bind(&now)
        .execute(&self.db)
        .await?;
        let lapsed = sqlx::query(
            "UPDATE phone_numbers SET status = 'AVAILABLE', updated_at = ?1 \
             WHERE status = 'RESERVED' AND NOT EXISTS ( \
                 SELECT 1 FROM number_reservations r \
                 WHERE r.phone_number_id = phone_numbers.id AND r.expires_at > ?1)",
        )
        .bind(&now)
        .execute(&self.db)
        .await?;
        let purged = sqlx::query("DELETE FROM number_reservations WHERE expires_at <= ?1")
            .bind(&now)
            .execute(&self.db)
            .await?;

        let report = SweepReport {
            holds_returned: holds.rows_affected(),
            reservations_lapsed: lapsed.rows_affected(),
            reservations_purged: purged.rows_affected(),
        };
        debug!(?report, "pool sweep complete");
        Ok(report)
    }

    /// Reclaim assigned numbers idle longer than the policy allows.
    ///
    /// Idle numbers enter `HOLD` for `policy.hold_days`, or return straight
    /// to `AVAILABLE` when the policy has no hold. Locked numbers and
    /// `PROTECTED` policies are never touched. Returns the number recycled.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] on SQLite failure.
    pub async fn recycle_inactive(
        &self,
        policy: &NumberPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64, GatewayError> {
        if !policy.recycles() {
            return Ok(0);
        }
        let cutoff = sub_days(now, policy.inactivity_days)?;
        let result = if policy.hold_days > 0 {
            let hold_until = add_days(now, policy.hold_days)?;
            sqlx::query(
                "UPDATE phone_numbers SET status = 'HOLD', hold_until = ?1, updated_at = ?2 \
                 WHERE status = 'ASSIGNED' AND keep_locked = 0 \
                 AND COALESCE(last_activity_at, assigned_at) < ?3",
            )
            .bind(encode_time(hold_until))
            .bind(encode_time(now))
            .bind(encode_time(cutoff))
            .execute(&self.db)
            .await?
        } else {
            sqlx::query(
                "UPDATE phone_numbers SET status = 'AVAILABLE', assigned_user_id = NULL, \
                 assigned_at = NULL, hold_until = NULL, updated_at = ?1 \
                 WHERE status = 'ASSIGNED' AND keep_locked = 0 \
                 AND COALESCE(last_activity_at, assigned_at) < ?2",
            )
            .bind(encode_time(now))
            .bind(encode_time(cutoff))
            .execute(&self.db)
            .await?
        };
        let recycled = result.rows_affected();
        if recycled > 0 {
            info!(recycled, "inactive numbers recycled");
        }
        Ok(recycled)
    }

    // -- Helpers -------------------------------------------------------------

    async fn ensure_claimable(&self, user_id: i64, number: &PhoneNumber) -> Result<(), GatewayError> {
        if self.active_number(user_id).await?.is_some() {
            return Err(GatewayError::Conflict(
                "user already holds an assigned number".to_owned(),
            ));
        }
        if !matches!(
            number.status,
            NumberStatus::Available | NumberStatus::Reserved
        ) {
            return Err(GatewayError::Conflict(format!(
                "{} is {}",
                number.e164,
                number.status.as_str()
            )));
        }
        Ok(())
    }

    /// Buy the number upstream unless it already has a provider reference.
    ///
    /// Only the caller that wins the purchase marker reaches the carrier;
    /// the rest get [`GatewayError::Conflict`]. A failed purchase clears the
    /// marker so the number can be tried again.
    async fn ensure_purchased(
        &self,
        user_id: i64,
        number: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<String, GatewayError> {
        if let Some(provider_ref) = &number.provider_ref {
            return Ok(provider_ref.clone());
        }
        let stale_before = TimeDelta::try_seconds(PURCHASE_MARKER_STALE_SECS)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(now);
        let marked = sqlx::query(MARK_PURCHASE_SQL)
            .bind(user_id)
            .bind(encode_time(now))
            .bind(number.id)
            .bind(encode_time(stale_before))
            .execute(&self.db)
            .await?;
        if marked.rows_affected() == 0 {
            debug!(number_id = number.id, user_id, "purchase already under way elsewhere");
            return Err(lost_race(&number.e164));
        }

        let adapter = self.gateway.resolve(Some(&number.provider));
        match adapter.purchase_number(&number.e164).await {
            Ok(PurchasedNumber { provider_ref, .. }) => {
                info!(number_id = number.id, provider = adapter.name(), "number purchased upstream");
                Ok(provider_ref)
            }
            Err(err) => {
                warn!(number_id = number.id, provider = adapter.name(), error = %err, "purchase failed");
                let cleared = sqlx::query(
                    "UPDATE phone_numbers SET purchasing_user_id = NULL, purchase_started_at = NULL \
                     WHERE id = ?1 AND purchasing_user_id = ?2",
                )
                .bind(number.id)
                .bind(user_id)
                .execute(&self.db)
                .await;
                if let Err(db_err) = cleared {
                    warn!(number_id = number.id, error = %db_err, "failed to clear purchase marker");
                }
                Err(GatewayError::BadGateway(err))
            }
        }
    }

    async fn reload(&self, e164: &str) -> Result<PhoneNumber, GatewayError> {
        self.get(e164)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("{e164} is not in the pool")))
    }
}

async fn active_number_on(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Option<PhoneNumber>, GatewayError> {
    let sql = format!(
        "SELECT {PHONE_NUMBER_COLUMNS} FROM phone_numbers \
         WHERE assigned_user_id = ?1 AND status = 'ASSIGNED'"
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(PhoneNumber::from_row).transpose()
}

async fn assign_on(
    conn: &mut SqliteConnection,
    number: &PhoneNumber,
    user_id: i64,
    provider_ref: &str,
    keep_locked: bool,
    now: DateTime<Utc>,
) -> Result<(), GatewayError> {
    let assigned = sqlx::query(ASSIGN_SQL)
        .bind(user_id)
        .bind(encode_time(now))
        .bind(provider_ref)
        .bind(keep_locked)
        .bind(number.id)
        .execute(&mut *conn)
        .await;
    let result = match assigned {
        Ok(result) => result,
        Err(err) => {
            keep_purchase(conn, number, user_id, provider_ref).await;
            return Err(if is_unique_violation(&err) {
                GatewayError::Conflict("user already holds an assigned number".to_owned())
            } else {
                GatewayError::Database(err)
            });
        }
    };
    if result.rows_affected() == 0 {
        keep_purchase(conn, number, user_id, provider_ref).await;
        return Err(lost_race(&number.e164));
    }

    sqlx::query("DELETE FROM number_reservations WHERE phone_number_id = ?1")
        .bind(number.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record a fresh upstream purchase whose assignment failed, so the number
/// stays owned by the pool instead of being bought again.
async fn keep_purchase(
    conn: &mut SqliteConnection,
    number: &PhoneNumber,
    user_id: i64,
    provider_ref: &str,
) {
    if number.provider_ref.is_some() {
        return;
    }
    let kept = sqlx::query(
        "UPDATE phone_numbers SET provider_ref = ?1, \
         purchasing_user_id = NULL, purchase_started_at = NULL \
         WHERE id = ?2 AND provider_ref IS NULL AND purchasing_user_id = ?3",
    )
    .bind(provider_ref)
    .bind(number.id)
    .bind(user_id)
    .execute(&mut *conn)
    .await;
    match kept {
        Ok(result) if result.rows_affected() > 0 => {
            warn!(number_id = number.id, "purchased upstream but not assigned; kept in pool");
        }
        Ok(_) => warn!(number_id = number.id, "purchased upstream but the row moved on"),
        Err(err) => warn!(number_id = number.id, error = %err, "failed to record purchase"),
    }
}

fn lost_race(e164: &str) -> GatewayError {
    GatewayError::Conflict(format!("{e164} was taken by a concurrent request"))
}

fn add_days(at: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, GatewayError> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| GatewayError::InvalidArgument(format!("{days} days is out of range")))
}

fn sub_days(at: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, GatewayError> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| at.checked_sub_signed(delta))
        .ok_or_else(|| GatewayError::InvalidArgument(format!("{days} days is out of range")))
}
