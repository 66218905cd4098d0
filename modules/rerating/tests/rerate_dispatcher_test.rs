//! Rerate dispatcher against a real ledger, with an in-process rating engine

mod common;

use async_trait::async_trait;
use chrono::NaiveDate;
use common::{
    amount, cleanup, get_test_pool, insert_rated_transaction, insert_wallet_operation, options,
    rt_status, WoSeed,
};
use rerating_rs::config::DispatchOptions;
use rerating_rs::job::{run_job, JobLimits};
use rerating_rs::rating::{RatingEngine, RatingError, RerateOutcome};
use rerating_rs::services::view_builder::drop_graph_views;
use rerating_rs::{RatingCancellationJob, RerateDispatcherJob};
use serial_test::serial;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingEngine {
    batches: Mutex<Vec<Vec<i64>>>,
}

#[async_trait]
impl RatingEngine for RecordingEngine {
    async fn apply_mass_rerate(
        &self,
        wo_ids: &[i64],
        _use_same_price_plan: bool,
        _edr_date_filter: Option<NaiveDate>,
    ) -> Result<RerateOutcome, RatingError> {
        self.batches.lock().unwrap().push(wo_ids.to_vec());
        Ok(RerateOutcome {
            rerated: wo_ids.len() as u64,
            failed: 0,
        })
    }
}

#[tokio::test]
#[serial]
async fn test_pending_operations_are_dispatched_per_account() {
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let base = 980_000;
    cleanup(&pool, base).await;

    // Account A has three pending operations, account B two; one operation
    // of account B was refused and must not be dispatched.
    let account_a = base + 1;
    let account_b = base + 2;
    for (id, ba, status) in [
        (base + 11, account_a, "TO_RERATE"),
        (base + 12, account_a, "TO_RERATE"),
        (base + 13, account_a, "TO_RERATE"),
        (base + 21, account_b, "TO_RERATE"),
        (base + 22, account_b, "TO_RERATE"),
        (base + 23, account_b, "F_TO_RERATE"),
    ] {
        insert_wallet_operation(
            &pool,
            WoSeed {
                id,
                ba_id: ba,
                status,
                rerate_batch_id: Some(base),
                ..Default::default()
            },
        )
        .await;
    }

    let engine = Arc::new(RecordingEngine::default());
    let mut opts = options("it_dispatch", base);
    opts.max_units_per_tx = 2;

    let job = Arc::new(RerateDispatcherJob::new(
        pool.clone(),
        engine.clone(),
        opts,
        DispatchOptions::default(),
    ));
    let report = run_job(job, 1, JobLimits::default()).await.unwrap();

    assert_eq!(report.succeeded, 5);
    assert!(!report.has_failures());
    assert_eq!(report.report, vec!["5 WOs were submitted for rerating"]);

    // Budget 2 never splits an account: A goes out whole, then B
    let batches = engine.batches.lock().unwrap().clone();
    assert_eq!(
        batches,
        vec![
            vec![base + 11, base + 12, base + 13],
            vec![base + 21, base + 22]
        ]
    );

    cleanup(&pool, base).await;
}

#[tokio::test]
#[serial]
async fn test_nothing_pending_submits_nothing() {
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let base = 990_000;
    cleanup(&pool, base).await;

    let engine = Arc::new(RecordingEngine::default());
    let job = Arc::new(RerateDispatcherJob::new(
        pool.clone(),
        engine.clone(),
        options("it_dispatch_empty", base),
        DispatchOptions::default(),
    ));
    let report = run_job(job, 2, JobLimits::default()).await.unwrap();

    assert!(report.nothing_to_do);
    assert!(engine.batches.lock().unwrap().is_empty());
    assert_eq!(
        report.report,
        vec!["0 WOs to submit for rerating", "0 WOs were submitted for rerating"]
    );
}

#[tokio::test]
#[serial]
async fn test_operations_on_live_rated_transactions_are_not_dispatched() {
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let base = 1_000_000;
    cleanup(&pool, base).await;

    let account_a = base + 1;
    let account_b = base + 2;
    insert_rated_transaction(&pool, base + 111, account_a, "OPEN", None, amount(100)).await;
    insert_rated_transaction(&pool, base + 112, account_a, "CANCELED", None, amount(100)).await;
    insert_rated_transaction(&pool, base + 121, account_b, "BILLED", None, amount(100)).await;
    for (id, ba, rt) in [
        (base + 11, account_a, Some(base + 111)),
        (base + 12, account_a, Some(base + 112)),
        (base + 13, account_a, None),
        (base + 21, account_b, Some(base + 121)),
    ] {
        insert_wallet_operation(
            &pool,
            WoSeed {
                id,
                ba_id: ba,
                status: "TO_RERATE",
                rated_transaction_id: rt,
                rerate_batch_id: Some(base),
                ..Default::default()
            },
        )
        .await;
    }

    let engine = Arc::new(RecordingEngine::default());
    let job = Arc::new(RerateDispatcherJob::new(
        pool.clone(),
        engine.clone(),
        options("it_dispatch_live", base),
        DispatchOptions::default(),
    ));
    let report = run_job(job, 1, JobLimits::default()).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(
        engine.batches.lock().unwrap().clone(),
        vec![vec![base + 12, base + 13]]
    );

    cleanup(&pool, base).await;
}

#[tokio::test]
#[serial]
async fn test_interrupted_cancellation_only_releases_cancelled_operations() {
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let base = 1_010_000;
    cleanup(&pool, base).await;

    // Two accounts, one operation each, both on an open rated transaction
    for (account, wo, rt) in [(base + 1, base + 10, base + 100), (base + 2, base + 20, base + 200)] {
        insert_rated_transaction(&pool, rt, account, "OPEN", None, amount(100)).await;
        insert_wallet_operation(
            &pool,
            WoSeed {
                id: wo,
                ba_id: account,
                status: "TO_RERATE",
                rated_transaction_id: Some(rt),
                rerate_batch_id: Some(base),
                ..Default::default()
            },
        )
        .await;
    }

    let mut opts = options("it_dispatch_partial", base);
    opts.workers = 1;
    opts.max_units_per_tx = 1;
    let views = opts.views.clone();

    let limits = JobLimits {
        max_items: Some(1),
        max_duration: None,
    };
    let cancel = Arc::new(RatingCancellationJob::new(pool.clone(), opts.clone()));
    let cancelled = run_job(cancel, 1, limits).await.unwrap();

    assert_eq!(cancelled.succeeded, 1);
    assert!(cancelled.stopped_early);
    assert!(!cancelled.is_complete());
    assert_eq!(rt_status(&pool, base + 100).await.0, "CANCELED");
    assert_eq!(rt_status(&pool, base + 200).await.0, "OPEN");

    let engine = Arc::new(RecordingEngine::default());
    let dispatch = Arc::new(RerateDispatcherJob::new(
        pool.clone(),
        engine.clone(),
        opts,
        DispatchOptions::default(),
    ));
    let report = run_job(dispatch, 1, JobLimits::default()).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(engine.batches.lock().unwrap().clone(), vec![vec![base + 10]]);

    // Views of an interrupted run are kept for a resume
    drop_graph_views(&pool, &views).await.unwrap();
    cleanup(&pool, base).await;
}
