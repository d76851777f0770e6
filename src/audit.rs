//! Append-only carrier event ledger.
//!
//! Every opt-out block, send attempt, and keyword transition lands here. Rows
//! are never updated or read back for decisions; the table is a write sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{trace, warn};

use crate::db::encode_time;
use crate::error::GatewayError;

/// Kind of carrier event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarrierEventKind {
    /// An outbound send was refused because the recipient opted out.
    BlockedOptOut,
    /// The provider accepted an outbound message.
    OutboundSent,
    /// The provider rejected or failed an outbound message.
    OutboundFailed,
    /// Recipient replied with a STOP-class keyword.
    Stop,
    /// Recipient replied with a START-class keyword.
    Start,
    /// Recipient replied with a HELP-class keyword.
    Help,
}

impl CarrierEventKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedOptOut => "BLOCKED_OPT_OUT",
            Self::OutboundSent => "OUTBOUND_SENT",
            Self::OutboundFailed => "OUTBOUND_FAILED",
            Self::Stop => "STOP",
            Self::Start => "START",
            Self::Help => "HELP",
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone)]
pub struct CarrierEvent {
    /// What happened.
    pub kind: CarrierEventKind,
    /// The external party's number (recipient for outbound, sender for inbound).
    pub phone: String,
    /// Free-form structured context.
    pub detail: serde_json::Value,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl CarrierEvent {
    /// Build an event stamped with the current time.
    pub fn now(kind: CarrierEventKind, phone: &str, detail: serde_json::Value) -> Self {
        Self {
            kind,
            phone: phone.to_owned(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Write-only handle to the `carrier_events` table.
#[derive(Debug, Clone)]
pub struct AuditLedger {
    db: SqlitePool,
}

impl AuditLedger {
    /// Create a ledger over the given pool.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append an event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Database`] on SQLite failure.
    pub async fn record(&self, event: &CarrierEvent) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO carrier_events (kind, phone, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event.kind.as_str())
        .bind(&event.phone)
        .bind(event.detail.to_string())
        .bind(encode_time(event.at))
        .execute(&self.db)
        .await?;
        trace!(kind = event.kind.as_str(), "carrier event recorded");
        Ok(())
    }

    /// Append an event, logging instead of failing.
    ///
    /// Audit writes never abort the operation they describe.
    pub async fn record_best_effort(&self, event: CarrierEvent) {
        if let Err(err) = self.record(&event).await {
            warn!(kind = event.kind.as_str(), error = %err, "failed to record carrier event");
        }
    }
}
