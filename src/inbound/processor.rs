//! Inbound compliance processor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLedger, CarrierEvent, CarrierEventKind};
use crate::config::InboundConfig;
use crate::db::encode_time;
use crate::error::GatewayError;
use crate::messaging::dispatcher::MessageDispatcher;
use crate::messaging::mailer::Mailer;
use crate::messaging::opt_out::{ensure_phone, set_opted_out};
use crate::messaging::SendRequest;
use crate::numbers::{assigned_owner, is_pool_number, touch_activity};
use crate::phone::normalize_e164;

use super::forwarding::get_prefs;
use super::keywords::{classify, KeywordClass};
use super::{InboundAck, InboundOutcome, InboundPayload};

/// Client-ref prefix for forwarded copies.
pub const FORWARD_REF_PREFIX: &str = "fwd:";

/// A validated delivery.
struct Accepted {
    from: String,
    to: String,
    sid: String,
}

/// Handles carrier webhooks for inbound SMS/MMS.
pub struct InboundComplianceProcessor {
    db: SqlitePool,
    dispatcher: Arc<MessageDispatcher>,
    mailer: Arc<dyn Mailer>,
    audit: AuditLedger,
    config: InboundConfig,
    forwarding: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for InboundComplianceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundComplianceProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InboundComplianceProcessor {
    /// Create a processor.
    pub fn new(
        db: SqlitePool,
        dispatcher: Arc<MessageDispatcher>,
        mailer: Arc<dyn Mailer>,
        audit: AuditLedger,
        config: InboundConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            mailer,
            audit,
            config,
            forwarding: Mutex::new(JoinSet::new()),
        }
    }

    /// Process one webhook delivery. Never fails.
    pub async fn handle_inbound_webhook(&self, payload: &InboundPayload) -> InboundAck {
        self.handle_at(payload, Utc::now()).await
    }

    /// [`Self::handle_inbound_webhook`] with an explicit clock, for quiet-hours checks.
    pub async fn handle_at(&self, payload: &InboundPayload, now: DateTime<Utc>) -> InboundAck {
        let Some(accepted) = accept(payload) else {
            return InboundAck::silent(InboundOutcome::Dropped);
        };
        let keyword = classify(&payload.body);

        match self.store(&accepted, payload, keyword, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(sid = %accepted.sid, "duplicate webhook delivery");
                return InboundAck::silent(InboundOutcome::Duplicate);
            }
            Err(err) if keyword.is_some() => {
                error!(sid = %accepted.sid, error = %err, "failed to store keyword message, replying anyway");
            }
            Err(err) => {
                error!(sid = %accepted.sid, error = %err, "failed to store inbound message");
                return InboundAck::silent(InboundOutcome::Failed);
            }
        }

        if let Err(err) = touch_activity(&self.db, &accepted.to, now).await {
            warn!(error = %err, "failed to record number activity");
        }

        match keyword {
            Some(class) => self.apply_keyword(&accepted, class, now).await,
            None => {
                if let Err(err) = ensure_phone(&self.db, &accepted.from).await {
                    warn!(error = %err, "failed to record sender");
                }
                if let Err(err) = self.schedule_forwarding(&accepted, payload, now).await {
                    error!(sid = %accepted.sid, error = %err, "forwarding lookup failed");
                }
                InboundAck::silent(InboundOutcome::Stored)
            }
        }
    }

    /// Wait for every spawned forwarding task to finish.
    ///
    /// The set is swapped out under the lock so webhooks arriving meanwhile
    /// can keep scheduling; their tasks are left for the next drain.
    pub async fn drain_forwarding(&self) {
        let mut tasks = std::mem::take(&mut *self.forwarding.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "forwarding task panicked or was cancelled");
            }
        }
    }

    /// Insert the inbound row; `false` means it already existed.
    async fn store(
        &self,
        accepted: &Accepted,
        payload: &InboundPayload,
        keyword: Option<KeywordClass>,
        now: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        let media = if payload.media.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&payload.media).map_err(|e| {
                GatewayError::InvalidArgument(format!("media could not be encoded: {e}"))
            })?)
        };
        let result = sqlx::query(
            "INSERT INTO inbound_messages \
             (provider_message_id, from_number, to_number, body, media, keyword, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(provider_message_id) DO NOTHING",
        )
        .bind(&accepted.sid)
        .bind(&accepted.from)
        .bind(&accepted.to)
        .bind(&payload.body)
        .bind(media)
        .bind(keyword.map(|k| k.as_str()))
        .bind(encode_time(now))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_keyword(
        &self,
        accepted: &Accepted,
        class: KeywordClass,
        now: DateTime<Utc>,
    ) -> InboundAck {
        let (kind, reply) = match class {
            KeywordClass::Stop => (CarrierEventKind::Stop, &self.config.stop_reply),
            KeywordClass::Help => (CarrierEventKind::Help, &self.config.help_reply),
            KeywordClass::Start => (CarrierEventKind::Start, &self.config.start_reply),
        };
        let opt_out = match class {
            KeywordClass::Stop => Some(true),
            KeywordClass::Start => Some(false),
            KeywordClass::Help => None,
        };
        if let Some(opted_out) = opt_out {
            if let Err(err) = set_opted_out(&self.db, &accepted.from, opted_out, now).await {
                error!(keyword = class.as_str(), error = %err, "failed to update subscription state");
            }
        }
        self.audit
            .record_best_effort(CarrierEvent::now(
                kind,
                &accepted.from,
                json!({ "to": accepted.to, "message_sid": accepted.sid }),
            ))
            .await;
        info!(keyword = class.as_str(), "compliance keyword handled");
        InboundAck {
            reply: Some(reply.clone()),
            outcome: InboundOutcome::Keyword(class),
        }
    }

    /// Decide whether to forward and spawn the delivery.
    async fn schedule_forwarding(
        &self,
        accepted: &Accepted,
        payload: &InboundPayload,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let Some(user_id) = assigned_owner(&self.db, &accepted.to).await? else {
            return Ok(());
        };
        if is_pool_number(&self.db, &accepted.from).await? {
            debug!(user_id, "sender is a pool number, not forwarding");
            return Ok(());
        }
        let Some(prefs) = get_prefs(&self.db, user_id).await? else {
            return Ok(());
        };
        if !prefs.enabled {
            return Ok(());
        }
        if prefs.in_quiet_hours(now) {
            debug!(user_id, "inside quiet hours, not forwarding");
            return Ok(());
        }

        let text = format!("Fwd from {}: {}", accepted.from, payload.body);
        let mut email_body = format!("From: {}\nTo: {}\n\n{}", accepted.from, accepted.to, payload.body);
        for media in &payload.media {
            email_body.push('\n');
            email_body.push_str(&media.url);
        }

        let phone_request = prefs.forward_to_phone.map(|phone| SendRequest {
            to: phone,
            text,
            client_ref: Some(format!("{FORWARD_REF_PREFIX}{}", accepted.sid)),
            from: Some(accepted.to.clone()),
            media_urls: payload.media.iter().map(|m| m.url.clone()).collect(),
        });
        let email = prefs.forward_to_email.filter(|e| !e.trim().is_empty());
        if phone_request.is_none() && email.is_none() {
            return Ok(());
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let mailer = Arc::clone(&self.mailer);
        let subject = self.config.forward_email_subject.clone();
        let mut tasks = self.forwarding.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Some(request) = phone_request {
                match dispatcher.send(&request).await {
                    Ok(outcome) if outcome.ok => debug!(user_id, "forwarded by sms"),
                    Ok(outcome) => warn!(user_id, reason = ?outcome.reason, "sms forward not sent"),
                    Err(err) => warn!(user_id, error = %err, "sms forward failed"),
                }
            }
            if let Some(address) = email {
                match mailer.send(&address, &subject, &email_body).await {
                    Ok(()) => debug!(user_id, "forwarded by email"),
                    Err(err) => warn!(user_id, error = %err, "email forward failed"),
                }
            }
        });
        Ok(())
    }
}

fn accept(payload: &InboundPayload) -> Option<Accepted> {
    let from = match normalize_e164(&payload.from) {
        Ok(from) => from,
        Err(err) => {
            warn!(error = %err, "dropping inbound with invalid From");
            return None;
        }
    };
    let to = match normalize_e164(&payload.to) {
        Ok(to) => to,
        Err(err) => {
            warn!(error = %err, "dropping inbound with invalid To");
            return None;
        }
    };
    let Some(sid) = payload.message_sid.clone() else {
        warn!("dropping inbound without a message id");
        return None;
    };
    Some(Accepted { from, to, sid })
}
