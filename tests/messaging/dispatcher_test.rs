//! Tests for `src/messaging/dispatcher.rs`: opt-out and idempotent send.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;

use numgate::audit::AuditLedger;
use numgate::config::DispatchConfig;
use numgate::error::GatewayError;
use numgate::messaging::dispatcher::MessageDispatcher;
use numgate::messaging::opt_out::set_opted_out;
use numgate::messaging::{SendBlockReason, SendRequest};
use numgate::providers::gateway::ProviderGateway;

use super::fixtures::{count, dispatcher, memory_db, FakeCarrier, FAKE_PROVIDER};

#[tokio::test]
async fn send_reaches_carrier_and_records_row() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);

    let outcome = dispatcher
        .send(&SendRequest::new("555-123-4567", "hello").with_from("+15550009999"))
        .await
        .expect("send");

    assert!(outcome.ok);
    assert_eq!(outcome.provider.as_deref(), Some(FAKE_PROVIDER));
    assert_eq!(outcome.message_sid.as_deref(), Some("SM0000"));
    let sent = carrier.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "+15551234567");
    assert_eq!(sent[0].from.as_deref(), Some("+15550009999"));
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM outbound_messages WHERE status = 'sent'").await,
        1
    );
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM carrier_events WHERE kind = 'OUTBOUND_SENT'").await,
        1
    );
}

#[tokio::test]
async fn same_client_ref_sends_once() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);
    let request = SendRequest::new("+15551234567", "hi").with_client_ref("X");

    let first = dispatcher.send(&request).await.expect("first");
    let second = dispatcher.send(&request).await.expect("second");

    assert!(first.ok && second.ok);
    assert_eq!(first.message_sid, second.message_sid);
    assert_eq!(carrier.send_count(), 1);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM outbound_messages").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_client_ref_sends_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = numgate::db::open_pool(&dir.path().join("send.db"))
        .await
        .expect("file db");
    let carrier = FakeCarrier::new();
    carrier.send_delay_ms.store(100, Ordering::SeqCst);
    let dispatcher = dispatcher(&db, &carrier);
    let request = SendRequest::new("+15551234567", "hi").with_client_ref("race");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let dispatcher = Arc::clone(&dispatcher);
        let request = request.clone();
        handles.push(tokio::spawn(async move { dispatcher.send(&request).await }));
    }
    let mut sids = Vec::new();
    for handle in handles {
        let outcome = handle.await.expect("task").expect("send");
        assert!(outcome.ok, "waiters observe the completed send: {outcome:?}");
        sids.push(outcome.message_sid);
    }

    assert_eq!(carrier.send_count(), 1);
    sids.dedup();
    assert_eq!(sids.len(), 1);
}

#[tokio::test]
async fn opted_out_recipient_is_blocked_without_carrier_call() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);
    set_opted_out(&db, "+15551234567", true, Utc::now())
        .await
        .expect("opt out");

    let outcome = dispatcher
        .send(&SendRequest::new("+15551234567", "hi"))
        .await
        .expect("send");

    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Some(SendBlockReason::OptedOut));
    assert_eq!(carrier.send_count(), 0);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM outbound_messages").await, 0);
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM carrier_events WHERE kind = 'BLOCKED_OPT_OUT'").await,
        1
    );
}

#[tokio::test]
async fn failed_send_is_kept_and_retried_with_same_ref() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    carrier.fail_sends.store(true, Ordering::SeqCst);
    let dispatcher = dispatcher(&db, &carrier);
    let request = SendRequest::new("+15551234567", "hi").with_client_ref("retry-me");

    let failed = dispatcher.send(&request).await.expect("send");
    assert!(!failed.ok);
    assert_eq!(failed.reason, Some(SendBlockReason::ProviderError));
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM outbound_messages WHERE status = 'failed'").await,
        1
    );
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM carrier_events WHERE kind = 'OUTBOUND_FAILED'").await,
        1
    );

    carrier.fail_sends.store(false, Ordering::SeqCst);
    let retried = dispatcher.send(&request).await.expect("retry");
    assert!(retried.ok);
    assert_eq!(carrier.send_count(), 2);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM outbound_messages").await, 1);
}

#[tokio::test]
async fn malformed_recipient_is_invalid_argument() {
    let db = memory_db().await;
    let dispatcher = dispatcher(&db, &FakeCarrier::new());
    let err = dispatcher
        .send(&SendRequest::new("call me", "hi"))
        .await
        .expect_err("invalid");
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn unconfigured_gateway_fails_loudly() {
    let db = memory_db().await;
    let dispatcher = MessageDispatcher::new(
        db.clone(),
        Arc::new(ProviderGateway::mock_only()),
        AuditLedger::new(db.clone()),
        DispatchConfig::default(),
    );

    let outcome = dispatcher
        .send(&SendRequest::new("+15551234567", "hi"))
        .await
        .expect("send");
    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Some(SendBlockReason::ProviderError));
    assert_eq!(outcome.provider.as_deref(), Some("mock"));
}

/// Leave a `pending` row behind as if the sending process died mid-call.
async fn abandoned_pending(db: &sqlx::SqlitePool, client_ref: &str, age_secs: i64) {
    let touched = Utc::now()
        .checked_sub_signed(chrono::TimeDelta::try_seconds(age_secs).expect("in range"))
        .expect("no underflow");
    sqlx::query(
        "INSERT INTO outbound_messages \
         (id, to_number, body, provider, client_ref, status, created_at, updated_at) \
         VALUES ('crashed', '+15551234567', 'hi', ?1, ?2, 'pending', ?3, ?3)",
    )
    .bind(FAKE_PROVIDER)
    .bind(client_ref)
    .bind(numgate::db::encode_time(touched))
    .execute(db)
    .await
    .expect("seed pending row");
}

#[tokio::test]
async fn stale_pending_row_is_retried_under_same_ref() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);
    abandoned_pending(&db, "stuck", 600).await;

    let outcome = dispatcher
        .send(&SendRequest::new("+15551234567", "hi").with_client_ref("stuck"))
        .await
        .expect("send");

    assert!(outcome.ok);
    assert_eq!(carrier.send_count(), 1);
    assert_eq!(
        count(
            &db,
            "SELECT COUNT(*) FROM outbound_messages WHERE id = 'crashed' AND status = 'sent'"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn recent_pending_row_is_left_to_its_owner() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);
    abandoned_pending(&db, "busy", 5).await;

    let outcome = dispatcher
        .send(&SendRequest::new("+15551234567", "hi").with_client_ref("busy"))
        .await
        .expect("send");

    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Some(SendBlockReason::InFlight));
    assert_eq!(carrier.send_count(), 0);
}

#[tokio::test]
async fn first_send_to_a_number_creates_its_phone_row() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let dispatcher = dispatcher(&db, &carrier);

    dispatcher
        .send(&SendRequest::new("+15551234567", "one"))
        .await
        .expect("send");
    dispatcher
        .send(&SendRequest::new("+15551234567", "two"))
        .await
        .expect("send");

    let phone = numgate::messaging::opt_out::get_phone(&db, "+15551234567")
        .await
        .expect("lookup")
        .expect("row created on first send");
    assert!(!phone.opted_out);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM phones").await, 1);
}
