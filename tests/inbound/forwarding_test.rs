//! Tests for inbound forwarding: preferences, quiet hours, and loop guard.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use numgate::audit::AuditLedger;
use numgate::inbound::forwarding::{upsert_prefs, ForwardingPrefs};
use numgate::inbound::processor::InboundComplianceProcessor;
use numgate::inbound::{InboundMedia, InboundOutcome, InboundPayload};
use numgate::numbers::pool::LeaseTarget;

use super::fixtures::{
    count, dispatcher, inbound_config, memory_db, pool_manager, pool_number, FakeCarrier,
    RecordingMailer,
};

const OWNER: i64 = 42;
const USER_NUMBER: &str = "+14155550100";
const SENDER: &str = "+12125550123";
const ALT_PHONE: &str = "+13105550199";

struct Harness {
    db: sqlx::SqlitePool,
    carrier: Arc<FakeCarrier>,
    mailer: Arc<RecordingMailer>,
    processor: InboundComplianceProcessor,
}

async fn harness(prefs: ForwardingPrefs) -> Harness {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let pool = pool_manager(&db, &carrier);
    pool.add_to_pool(pool_number(USER_NUMBER)).await.expect("stock");
    pool.lease(OWNER, &LeaseTarget::Number(USER_NUMBER.to_owned()), false)
        .await
        .expect("lease");
    upsert_prefs(&db, &prefs).await.expect("prefs");

    let mailer = Arc::new(RecordingMailer::default());
    let processor = InboundComplianceProcessor::new(
        db.clone(),
        dispatcher(&db, &carrier),
        Arc::clone(&mailer) as Arc<dyn numgate::messaging::mailer::Mailer>,
        AuditLedger::new(db.clone()),
        inbound_config(),
    );
    Harness {
        db,
        carrier,
        mailer,
        processor,
    }
}

fn prefs() -> ForwardingPrefs {
    ForwardingPrefs {
        user_id: OWNER,
        enabled: true,
        forward_to_phone: Some(ALT_PHONE.to_owned()),
        forward_to_email: Some("owner@example.com".to_owned()),
        quiet_hours_start: Some(22),
        quiet_hours_end: Some(6),
        utc_offset_minutes: 0,
    }
}

fn message(sid: &str, from: &str) -> InboundPayload {
    InboundPayload {
        from: from.to_owned(),
        to: USER_NUMBER.to_owned(),
        body: "running late".to_owned(),
        message_sid: Some(sid.to_owned()),
        media: vec![InboundMedia {
            url: "https://media.example/1".to_owned(),
            content_type: Some("image/png".to_owned()),
        }],
    }
}

#[tokio::test]
async fn forwards_to_phone_and_email_outside_quiet_hours() {
    let h = harness(prefs()).await;
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");

    let ack = h.processor.handle_at(&message("SM1", SENDER), noon).await;
    h.processor.drain_forwarding().await;

    assert_eq!(ack.outcome, InboundOutcome::Stored);
    let sent = h.carrier.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, ALT_PHONE);
    assert_eq!(sent[0].from.as_deref(), Some(USER_NUMBER));
    assert_eq!(sent[0].body, format!("Fwd from {SENDER}: running late"));
    assert_eq!(sent[0].media_urls, vec!["https://media.example/1".to_owned()]);
    assert_eq!(
        count(&h.db, "SELECT COUNT(*) FROM outbound_messages WHERE client_ref = 'fwd:SM1'").await,
        1
    );

    let mails = h.mailer.sent.lock().expect("mail lock").clone();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].0, "owner@example.com");
    assert!(mails[0].2.contains("running late"));
}

#[tokio::test]
async fn quiet_hours_suppress_forwarding() {
    let h = harness(prefs()).await;
    let late_night = Utc.with_ymd_and_hms(2026, 5, 4, 23, 30, 0).single().expect("valid");

    let ack = h.processor.handle_at(&message("SM1", SENDER), late_night).await;
    h.processor.drain_forwarding().await;

    assert_eq!(ack.outcome, InboundOutcome::Stored);
    assert_eq!(h.carrier.send_count(), 0);
    assert!(h.mailer.sent.lock().expect("mail lock").is_empty());
    assert_eq!(count(&h.db, "SELECT COUNT(*) FROM inbound_messages").await, 1);
}

#[tokio::test]
async fn quiet_hours_follow_user_offset() {
    let mut local = prefs();
    local.utc_offset_minutes = -420;
    let h = harness(local).await;
    // 05:00 UTC is 22:00 at UTC-7.
    let at = Utc.with_ymd_and_hms(2026, 5, 4, 5, 0, 0).single().expect("valid");

    h.processor.handle_at(&message("SM1", SENDER), at).await;
    h.processor.drain_forwarding().await;
    assert_eq!(h.carrier.send_count(), 0);
}

#[tokio::test]
async fn disabled_forwarding_sends_nothing() {
    let mut off = prefs();
    off.enabled = false;
    let h = harness(off).await;
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");

    h.processor.handle_at(&message("SM1", SENDER), noon).await;
    h.processor.drain_forwarding().await;
    assert_eq!(h.carrier.send_count(), 0);
}

#[tokio::test]
async fn messages_from_pool_numbers_are_not_forwarded() {
    let h = harness(prefs()).await;
    let pool = pool_manager(&h.db, &h.carrier);
    pool.add_to_pool(pool_number("+14155550101")).await.expect("stock");
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");

    let ack = h
        .processor
        .handle_at(&message("SM1", "+14155550101"), noon)
        .await;
    h.processor.drain_forwarding().await;

    assert_eq!(ack.outcome, InboundOutcome::Stored);
    assert_eq!(h.carrier.send_count(), 0);
}

#[tokio::test]
async fn redelivery_does_not_forward_twice() {
    let h = harness(prefs()).await;
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");
    let payload = message("SM1", SENDER);

    h.processor.handle_at(&payload, noon).await;
    let second = h.processor.handle_at(&payload, noon).await;
    h.processor.drain_forwarding().await;

    assert_eq!(second.outcome, InboundOutcome::Duplicate);
    assert_eq!(h.carrier.send_count(), 1);
}

#[tokio::test]
async fn inbound_traffic_marks_number_active() {
    let mut off = prefs();
    off.enabled = false;
    let h = harness(off).await;
    let noon = Utc.with_ymd_and_hms(2030, 5, 4, 12, 0, 0).single().expect("valid");

    h.processor.handle_at(&message("SM1", SENDER), noon).await;
    h.processor.drain_forwarding().await;

    let (last,): (Option<String>,) =
        sqlx::query_as("SELECT last_activity_at FROM phone_numbers WHERE e164 = ?1")
            .bind(USER_NUMBER)
            .fetch_one(&h.db)
            .await
            .expect("row");
    assert!(last.expect("stamped").starts_with("2030-05-04T12:00:00"));
}

#[tokio::test]
async fn first_message_from_a_stranger_records_them_as_subscribed() {
    let mut off = prefs();
    off.enabled = false;
    let h = harness(off).await;
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");

    h.processor.handle_at(&message("SM1", SENDER), noon).await;
    h.processor.handle_at(&message("SM2", SENDER), noon).await;

    assert_eq!(
        count(
            &h.db,
            "SELECT COUNT(*) FROM phones WHERE number = '+12125550123' AND opted_out = 0"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn webhooks_keep_flowing_while_forwarding_drains() {
    let h = harness(prefs()).await;
    h.carrier.send_delay_ms.store(300, Ordering::SeqCst);
    let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid");
    h.processor.handle_at(&message("SM1", SENDER), noon).await;

    let meanwhile = async {
        tokio::task::yield_now().await;
        tokio::time::timeout(
            Duration::from_millis(150),
            h.processor.handle_at(&message("SM2", SENDER), noon),
        )
        .await
    };
    let ((), meanwhile) = tokio::join!(h.processor.drain_forwarding(), meanwhile);

    let ack = meanwhile.expect("webhook handled while the drain was waiting");
    assert_eq!(ack.outcome, InboundOutcome::Stored);
    h.processor.drain_forwarding().await;
    assert_eq!(h.carrier.send_count(), 2);
}
