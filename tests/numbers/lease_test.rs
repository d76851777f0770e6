//! Tests for pool auto-assignment (`lease`) in `src/numbers/pool.rs`.

use std::sync::atomic::Ordering;

use numgate::error::GatewayError;
use numgate::numbers::pool::LeaseTarget;
use numgate::numbers::NumberStatus;
use numgate::providers::{Capability, SearchFilter};

use super::fixtures::{
    count, file_pool_manager, memory_db, pool_manager, pool_number, FakeCarrier,
};

fn filter(area_code: &str) -> LeaseTarget {
    LeaseTarget::Filter(SearchFilter {
        area_code: Some(area_code.to_owned()),
        ..SearchFilter::default()
    })
}

#[tokio::test]
async fn lease_prefers_vanity_numbers() {
    let db = memory_db().await;
    let pool = pool_manager(&db, &FakeCarrier::new());
    for e164 in ["+14155550193", "+14155557777", "+14155551234"] {
        pool.add_to_pool(pool_number(e164)).await.expect("stock");
    }

    let number = pool.lease(3, &filter("415"), false).await.expect("lease");
    assert_eq!(number.e164, "+14155557777");
    assert_eq!(number.status, NumberStatus::Assigned);
    assert_eq!(number.assigned_user_id, Some(3));
}

#[tokio::test]
async fn lease_filters_by_area_code_and_capability() {
    let db = memory_db().await;
    let pool = pool_manager(&db, &FakeCarrier::new());
    pool.add_to_pool(pool_number("+12125550100")).await.expect("stock");
    let mut mms = pool_number("+14155550100");
    mms.capabilities = vec![Capability::Sms, Capability::Mms];
    pool.add_to_pool(mms).await.expect("stock");

    let target = LeaseTarget::Filter(SearchFilter {
        area_code: None,
        capabilities: vec![Capability::Mms],
        ..SearchFilter::default()
    });
    let number = pool.lease(1, &target, false).await.expect("lease");
    assert_eq!(number.e164, "+14155550100");

    assert!(matches!(
        pool.lease(2, &filter("305"), false).await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn premium_inventory_requires_purchase_intent() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let pool = pool_manager(&db, &carrier);
    let mut premium = pool_number("+14155558888");
    premium.for_sale = true;
    pool.add_to_pool(premium).await.expect("stock");

    assert!(matches!(
        pool.lease(1, &filter("415"), false).await,
        Err(GatewayError::NotFound(_)),
    ));
    assert!(matches!(
        pool.lease(1, &LeaseTarget::Number("+14155558888".to_owned()), false)
            .await,
        Err(GatewayError::Forbidden(_)),
    ));

    let number = pool
        .lease(1, &LeaseTarget::Number("+14155558888".to_owned()), true)
        .await
        .expect("purchase");
    assert!(number.keep_locked, "bought numbers are locked to the buyer");
    assert_eq!(carrier.purchase_count(), 1);
}

#[tokio::test]
async fn explicit_number_outside_pool_needs_intent() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let pool = pool_manager(&db, &carrier);
    let target = LeaseTarget::Number("+13055550111".to_owned());

    assert!(matches!(
        pool.lease(1, &target, false).await,
        Err(GatewayError::NotFound(_))
    ));
    let number = pool.lease(1, &target, true).await.expect("bought");
    assert_eq!(number.status, NumberStatus::Assigned);
    assert_eq!(number.provider_ref.as_deref(), Some("PN0000"));
}

#[tokio::test]
async fn lease_of_taken_number_conflicts_without_substitution() {
    let db = memory_db().await;
    let pool = pool_manager(&db, &FakeCarrier::new());
    pool.add_to_pool(pool_number("+14155550100")).await.expect("stock");
    pool.add_to_pool(pool_number("+14155550101")).await.expect("stock");
    let target = LeaseTarget::Number("+14155550100".to_owned());

    pool.lease(1, &target, false).await.expect("first lease");
    assert!(matches!(
        pool.lease(2, &target, false).await,
        Err(GatewayError::Conflict(_))
    ));
    let spare = pool.get("+14155550101").await.expect("get").expect("row");
    assert_eq!(spare.status, NumberStatus::Available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_share_one_candidate_and_one_purchase() {
    let dir = tempfile::tempdir().expect("tempdir");
    let carrier = FakeCarrier::new();
    carrier.purchase_delay_ms.store(150, Ordering::SeqCst);
    let pool = file_pool_manager(&dir, &carrier).await;
    pool.add_to_pool(pool_number("+14155557777")).await.expect("stock");
    pool.add_to_pool(pool_number("+14155550193")).await.expect("stock");

    let mut handles = Vec::new();
    for user in 1..=6_i64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            (user, pool.lease(user, &filter("415"), false).await)
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        let (user, result) = handle.await.expect("task");
        match result {
            Ok(number) => {
                assert_eq!(number.e164, "+14155557777");
                winners.push(user);
            }
            Err(GatewayError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected lease error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 5);
    assert_eq!(carrier.purchase_count(), 1);

    let spare = pool.get("+14155550193").await.expect("get").expect("row");
    assert_eq!(spare.status, NumberStatus::Available);
    assert_eq!(
        count(pool.pool(), "SELECT COUNT(*) FROM phone_numbers WHERE status = 'ASSIGNED'").await,
        1
    );
}

#[tokio::test]
async fn one_active_number_per_user() {
    let db = memory_db().await;
    let pool = pool_manager(&db, &FakeCarrier::new());
    pool.add_to_pool(pool_number("+14155550100")).await.expect("stock");
    pool.add_to_pool(pool_number("+14155550101")).await.expect("stock");

    pool.lease(1, &filter("415"), false).await.expect("lease");
    assert!(matches!(
        pool.lease(1, &filter("415"), false).await,
        Err(GatewayError::Conflict(_))
    ));
    let active = pool.active_number(1).await.expect("query").expect("assigned");
    assert_eq!(active.assigned_user_id, Some(1));
}

#[tokio::test]
async fn search_goes_through_default_adapter() {
    let db = memory_db().await;
    let carrier = FakeCarrier::new();
    let pool = pool_manager(&db, &carrier);
    let results = pool
        .search(&SearchFilter {
            area_code: Some("212".to_owned()),
            ..SearchFilter::default()
        })
        .await
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].area_code.as_deref(), Some("212"));
    assert!(pool.get(&results[0].e164).await.expect("get").is_none(), "search writes nothing");
}
