//! Safe send: opt-out enforcement plus at-most-once delivery per client ref.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLedger, CarrierEvent, CarrierEventKind};
use crate::config::DispatchConfig;
use crate::db::encode_time;
use crate::error::{is_unique_violation, GatewayError};
use crate::numbers::touch_activity;
use crate::phone::normalize_e164;
use crate::providers::gateway::ProviderGateway;
use crate::providers::OutboundSms;

use super::opt_out::{ensure_phone, is_opted_out};
use super::{SendBlockReason, SendOutcome, SendRequest};

/// Row type for an idempotency lookup: id, provider, status, provider message id.
type OutboundRow = (String, String, String, Option<String>);

/// What the idempotency check decided.
enum Slot {
    /// This caller owns the row and must call the carrier.
    Owned(String),
    /// Resolved without a carrier call.
    Done(SendOutcome),
}

/// Sends outbound SMS/MMS through the gateway.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    db: SqlitePool,
    gateway: Arc<ProviderGateway>,
    audit: AuditLedger,
    config: DispatchConfig,
}

impl MessageDispatcher {
    /// Create a dispatcher.
    pub fn new(
        db: SqlitePool,
        gateway: Arc<ProviderGateway>,
        audit: AuditLedger,
        config: DispatchConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            audit,
            config,
        }
    }

    /// Send a message.
    ///
    /// Opted-out recipients and carrier failures come back as a non-`ok`
    /// [`SendOutcome`], never as an error. A replayed `client_ref` that
    /// already succeeded returns the recorded message id without contacting
    /// the carrier; one that failed is re-attempted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for a malformed `to` or
    /// `from`, and [`GatewayError::Database`] on SQLite failure.
    pub async fn send(&self, request: &SendRequest) -> Result<SendOutcome, GatewayError> {
        let to = normalize_e164(&request.to)?;
        let from = request
            .from
            .as_deref()
            .or(self.config.default_from.as_deref())
            .map(normalize_e164)
            .transpose()?;
        let client_ref = request
            .client_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());

        if is_opted_out(&self.db, &to).await? {
            debug!(client_ref, "send blocked, recipient opted out");
            self.audit
                .record_best_effort(CarrierEvent::now(
                    CarrierEventKind::BlockedOptOut,
                    &to,
                    json!({ "client_ref": client_ref }),
                ))
                .await;
            return Ok(SendOutcome::blocked(SendBlockReason::OptedOut, None));
        }
        ensure_phone(&self.db, &to).await?;

        let adapter = self.gateway.default_adapter();
        let provider = adapter.name().to_owned();
        let row_id = match self
            .acquire_slot(&to, from.as_deref(), request, client_ref, &provider)
            .await?
        {
            Slot::Owned(id) => id,
            Slot::Done(outcome) => return Ok(outcome),
        };

        let message = OutboundSms {
            from: from.clone(),
            to: to.clone(),
            body: request.text.clone(),
            media_urls: request.media_urls.clone(),
        };
        match adapter.send_raw(&message).await {
            Ok(sent) => {
                sqlx::query(
                    "UPDATE outbound_messages SET status = 'sent', provider_message_id = ?1, \
                     error = NULL, updated_at = ?2 WHERE id = ?3",
                )
                .bind(&sent.provider_message_id)
                .bind(encode_time(Utc::now()))
                .bind(&row_id)
                .execute(&self.db)
                .await?;
                info!(provider = %provider, client_ref, "message sent");
                self.audit
                    .record_best_effort(CarrierEvent::now(
                        CarrierEventKind::OutboundSent,
                        &to,
                        json!({
                            "message_id": row_id,
                            "provider": provider,
                            "provider_message_id": sent.provider_message_id,
                        }),
                    ))
                    .await;
                if let Some(from) = from.as_deref() {
                    if let Err(err) = touch_activity(&self.db, from, Utc::now()).await {
                        warn!(error = %err, "failed to record number activity");
                    }
                }
                Ok(SendOutcome::sent(provider, sent.provider_message_id))
            }
            Err(err) => {
                let detail = err.to_string();
                sqlx::query(
                    "UPDATE outbound_messages SET status = 'failed', error = ?1, updated_at = ?2 \
                     WHERE id = ?3",
                )
                .bind(&detail)
                .bind(encode_time(Utc::now()))
                .bind(&row_id)
                .execute(&self.db)
                .await?;
                warn!(provider = %provider, client_ref, error = %detail, "send failed");
                self.audit
                    .record_best_effort(CarrierEvent::now(
                        CarrierEventKind::OutboundFailed,
                        &to,
                        json!({ "message_id": row_id, "provider": provider, "error": detail }),
                    ))
                    .await;
                Ok(SendOutcome::blocked(
                    SendBlockReason::ProviderError,
                    Some(provider),
                ))
            }
        }
    }

    /// Create the pending row, or resolve the request from an earlier one.
    async fn acquire_slot(
        &self,
        to: &str,
        from: Option<&str>,
        request: &SendRequest,
        client_ref: Option<&str>,
        provider: &str,
    ) -> Result<Slot, GatewayError> {
        if let Some(client_ref) = client_ref {
            if let Some(existing) = self.lookup(client_ref).await? {
                return self.resume(client_ref, existing).await;
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = encode_time(Utc::now());
        let media = (!request.media_urls.is_empty())
            .then(|| serde_json::to_string(&request.media_urls))
            .transpose()
            .map_err(|e| GatewayError::InvalidArgument(format!("media urls: {e}")))?;
        let inserted = sqlx::query(
            "INSERT INTO outbound_messages \
             (id, from_number, to_number, body, media_urls, provider, client_ref, status, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        )
        .bind(&id)
        .bind(from)
        .bind(to)
        .bind(&request.text)
        .bind(media)
        .bind(provider)
        .bind(client_ref)
        .bind(&now)
        .execute(&self.db)
        .await;

        match (inserted, client_ref) {
            (Ok(_), _) => Ok(Slot::Owned(id)),
            (Err(err), Some(client_ref)) if is_unique_violation(&err) => {
                debug!(client_ref, "concurrent send with same client ref");
                match self.lookup(client_ref).await? {
                    Some(existing) => self.resume(client_ref, existing).await,
                    None => Ok(Slot::Done(SendOutcome::blocked(
                        SendBlockReason::InFlight,
                        None,
                    ))),
                }
            }
            (Err(err), _) => Err(err.into()),
        }
    }

    /// Decide what to do with an existing row for this client ref.
    async fn resume(&self, client_ref: &str, existing: OutboundRow) -> Result<Slot, GatewayError> {
        let (id, provider, status, provider_message_id) = existing;
        match (status.as_str(), provider_message_id) {
            ("sent", Some(sid)) => {
                debug!(client_ref, "idempotent replay of delivered send");
                Ok(Slot::Done(SendOutcome::sent(provider, sid)))
            }
            ("failed", _) => {
                let reclaimed = sqlx::query(
                    "UPDATE outbound_messages SET status = 'pending', error = NULL, \
                     updated_at = ?1 WHERE id = ?2 AND status = 'failed'",
                )
                .bind(encode_time(Utc::now()))
                .bind(&id)
                .execute(&self.db)
                .await?;
                if reclaimed.rows_affected() == 1 {
                    info!(client_ref, "retrying previously failed send");
                    Ok(Slot::Owned(id))
                } else {
                    self.await_in_flight(client_ref).await.map(Slot::Done)
                }
            }
            ("pending", _) => {
                if self.reclaim_stale_pending(&id).await? {
                    warn!(client_ref, "reclaiming send abandoned while pending");
                    Ok(Slot::Owned(id))
                } else {
                    self.await_in_flight(client_ref).await.map(Slot::Done)
                }
            }
            _ => self.await_in_flight(client_ref).await.map(Slot::Done),
        }
    }

    /// Take over a `pending` row nobody has touched for `pending_stale_secs`.
    async fn reclaim_stale_pending(&self, id: &str) -> Result<bool, GatewayError> {
        let now = Utc::now();
        let Some(cutoff) = i64::try_from(self.config.pending_stale_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(false);
        };
        let reclaimed = sqlx::query(
            "UPDATE outbound_messages SET updated_at = ?1 \
             WHERE id = ?2 AND status = 'pending' AND updated_at < ?3",
        )
        .bind(encode_time(now))
        .bind(id)
        .bind(encode_time(cutoff))
        .execute(&self.db)
        .await?;
        Ok(reclaimed.rows_affected() == 1)
    }

    /// Poll a pending row owned by another caller until it settles.
    async fn await_in_flight(&self, client_ref: &str) -> Result<SendOutcome, GatewayError> {
        let interval = Duration::from_millis(self.config.in_flight_poll_interval_ms);
        for _ in 0..self.config.in_flight_poll_attempts {
            tokio::time::sleep(interval).await;
            let Some((_, provider, status, provider_message_id)) = self.lookup(client_ref).await?
            else {
                break;
            };
            match (status.as_str(), provider_message_id) {
                ("sent", Some(sid)) => return Ok(SendOutcome::sent(provider, sid)),
                ("failed", _) => {
                    return Ok(SendOutcome::blocked(
                        SendBlockReason::ProviderError,
                        Some(provider),
                    ))
                }
                _ => {}
            }
        }
        debug!(client_ref, "send still in flight, giving up on wait");
        Ok(SendOutcome::blocked(SendBlockReason::InFlight, None))
    }

    async fn lookup(&self, client_ref: &str) -> Result<Option<OutboundRow>, GatewayError> {
        let row: Option<OutboundRow> = sqlx::query_as(
            "SELECT id, provider, status, provider_message_id FROM outbound_messages \
             WHERE client_ref = ?1",
        )
        .bind(client_ref)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }
}
