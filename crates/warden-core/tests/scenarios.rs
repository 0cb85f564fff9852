//! Cross-component scenarios on a shared in-memory store with a fixed clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use warden_core::app::{
    DefragWatchdog, LoggingUnitHandler, SubscriptionDispatchWatchdog, TickOutcome,
    TransactionVisibilityCoordinator, Watchdog, WatchdogRunner, WatchdogSettings,
};
use warden_core::domain::{ConfigParameter, JobStatus, QueueType, ResourceWrite, TransactionId};
use warden_core::impls::InMemoryCoordinationStore;
use warden_core::ports::{
    Clock, ConfigStore, FixedClock, JobQueueClient, LeaseStore, StoreClient,
};

fn fixed() -> (FixedClock, Arc<InMemoryCoordinationStore>) {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(clock.clone())));
    (clock, store)
}

fn defrag_runner(
    store: &Arc<InMemoryCoordinationStore>,
    clock: &FixedClock,
    worker: &str,
) -> WatchdogRunner {
    let watchdog = DefragWatchdog::new(
        store.clone(),
        Arc::new(LoggingUnitHandler),
        worker,
        2,
        Duration::from_secs(60),
    );
    let settings = WatchdogSettings {
        period: Duration::from_secs(5),
        lease_period: Duration::from_secs(20),
        allow_rebalance: false,
        enabled: true,
    };
    WatchdogRunner::new(
        Arc::new(watchdog),
        store.clone(),
        Arc::new(clock.clone()),
        worker,
        settings,
        0.25,
    )
}

fn at(clock: &FixedClock, secs: i64) {
    clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs));
}

#[tokio::test]
async fn defrag_lease_handover_runs_body_once() {
    let (clock, store) = fixed();
    let a = defrag_runner(&store, &clock, "A");
    let b = defrag_runner(&store, &clock, "B");
    a.bootstrap().await.unwrap();
    b.bootstrap().await.unwrap();
    let token = CancellationToken::new();

    // t=0: A acquires (end = 20s) and runs the body.
    let acquired = a.lease().try_acquire().await.unwrap();
    assert!(acquired.acquired);
    assert_eq!(
        acquired.lease_end_time,
        Some(clock.now() + chrono::Duration::seconds(20))
    );
    assert_eq!(a.tick_once(&token).await.unwrap(), TickOutcome::Executed);

    // t=3: B is rejected, A is reported as holder.
    at(&clock, 3);
    let rejected = b.lease().try_acquire().await.unwrap();
    assert!(!rejected.acquired);
    assert_eq!(rejected.current_holder.as_deref(), Some("A"));

    // t=4: A crashes. B keeps ticking and is rejected while A's store lease is valid.
    for t in [5, 10, 15] {
        at(&clock, t);
        assert!(!b.lease().try_acquire().await.unwrap().acquired, "t={t}");
        assert_eq!(b.tick_once(&token).await.unwrap(), TickOutcome::NotHolder);
    }
    assert!(!a.lease().is_holder());

    // The lease end is exclusive: at t=20 the store row already counts as expired.
    at(&clock, 20);
    let boundary = store
        .get_lease(DefragWatchdog::NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(boundary.holder_id, "A");
    assert!(boundary.is_expired_at(clock.now()));
    assert_eq!(b.tick_once(&token).await.unwrap(), TickOutcome::NotHolder);

    at(&clock, 21);
    let taken = b.lease().try_acquire().await.unwrap();
    assert!(taken.acquired);
    assert_eq!(taken.current_holder.as_deref(), Some("B"));
    assert!(b.lease().is_holder());

    let coordinators = store
        .counts_by_status(&QueueType::new("defrag"))
        .await
        .unwrap();
    assert_eq!(coordinators.completed, 1);
    assert_eq!(a.status().run_count + b.status().run_count, 1);
}

#[tokio::test]
async fn stuck_transactions_are_eventually_visible() {
    let (clock, store) = fixed();
    let coordinator = TransactionVisibilityCoordinator::new(store.clone());
    let threshold = Duration::from_secs(18);
    let token = CancellationToken::new();

    let mut stuck = Vec::new();
    for i in 0..3 {
        let tx = store.begin_transaction().await.unwrap();
        store
            .write_resources(tx, &[ResourceWrite::new("Patient", format!("p{i}"), json!(i))])
            .await
            .unwrap();
        stuck.push(tx);
    }
    let last = store.begin_transaction().await.unwrap();
    store.commit_transaction(last, None).await.unwrap();

    // Heartbeats keep the first writer alive for a while.
    let mut previous = TransactionId::MIN;
    for _ in 0..10 {
        clock.advance(chrono::Duration::seconds(3));
        store.heartbeat_transaction(stuck[0]).await.unwrap();
        let report = coordinator.run_once(threshold, &token).await.unwrap();
        assert!(report.watermark_after >= previous);
        assert!(report.watermark_after < stuck[0]);
        previous = report.watermark_after;
    }

    // Then it dies too; repeated passes finish every writer.
    let mut watermark = previous;
    for _ in 0..10 {
        clock.advance(chrono::Duration::seconds(3));
        let report = coordinator.run_once(threshold, &token).await.unwrap();
        assert!(report.watermark_after >= watermark);
        watermark = report.watermark_after;
    }
    assert_eq!(watermark, last);
    for tx in stuck {
        assert!(store.transaction(tx).await.unwrap().is_committed());
    }
}

/// Keeps the fixed clock in step with tokio's paused clock.
fn follow_tokio_time(clock: &FixedClock) -> tokio::task::JoinHandle<()> {
    let clock = clock.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            clock.advance(chrono::Duration::seconds(1));
        }
    })
}

#[tokio::test(start_paused = true)]
async fn crashed_coordinator_group_is_finished_by_another_instance() {
    let (clock, store) = fixed();
    let coordinator_queue = QueueType::new("defrag");
    let unit_queue = QueueType::new("defrag.unit");

    // Instance A claims the coordinator, enqueues its units, claims one unit, and dies.
    store
        .enqueue(&coordinator_queue, vec![json!({ "kind": "defrag" })], None, true)
        .await
        .unwrap();
    let coordinator = store
        .dequeue(&coordinator_queue, "A", Duration::from_secs(60), None)
        .await
        .unwrap()
        .unwrap();
    let units: Vec<_> = (0..8)
        .map(|unit| {
            json!({ "unit": unit, "of": 8, "coordinator": coordinator.job_id.to_string() })
        })
        .collect();
    store
        .enqueue(&unit_queue, units, Some(coordinator.group_id), false)
        .await
        .unwrap();
    // The unit is claimed later than the coordinator, so its heartbeat outlives it.
    at(&clock, 30);
    let held = store
        .dequeue(&unit_queue, "A/defrag.unit/0", Duration::from_secs(60), None)
        .await
        .unwrap()
        .unwrap();

    at(&clock, 61);
    let ticker = follow_tokio_time(&clock);
    let b = DefragWatchdog::new(
        store.clone(),
        Arc::new(LoggingUnitHandler),
        "B",
        2,
        Duration::from_secs(60),
    );
    b.bootstrap().await.unwrap();
    b.execute(&CancellationToken::new()).await.unwrap();
    ticker.abort();

    let unit_jobs = store
        .get_jobs_by_group(&unit_queue, coordinator.group_id)
        .await
        .unwrap();
    assert_eq!(unit_jobs.len(), 8);
    assert!(unit_jobs.iter().all(|j| j.status == JobStatus::Completed));
    let row = store.job(coordinator.job_id).await.unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!(row.dequeue_count, 2);
    let held = store.job(held.job_id).await.unwrap();
    assert_eq!(held.dequeue_count, 2);
    let expiry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap();
    assert!(held.ended_at.unwrap() >= expiry);
    assert!(row.ended_at.unwrap() >= held.ended_at.unwrap());
}

#[tokio::test]
async fn replaying_a_cursor_range_is_idempotent() {
    let (_clock, store) = fixed();
    for i in 0..4 {
        let tx = store.begin_transaction().await.unwrap();
        store
            .write_resources(tx, &[ResourceWrite::new("Patient", format!("p{i}"), json!(i))])
            .await
            .unwrap();
        store.mark_resources_committed(tx).await.unwrap();
        store.commit_transaction(tx, None).await.unwrap();
    }
    let watermark = store.advance_visibility().await.unwrap();

    let dispatch = SubscriptionDispatchWatchdog::new(store.clone());
    dispatch.bootstrap().await.unwrap();
    let token = CancellationToken::new();
    dispatch.execute(&token).await.unwrap();
    let first = store.counts_by_status(dispatch.queue_type()).await.unwrap();

    // Rewind the cursor and process the same range again.
    store
        .set_parameter(&ConfigParameter::bigint(
            "SubscriptionDispatch.LastProcessedTransactionId",
            TransactionId::MIN.value(),
        ))
        .await
        .unwrap();
    dispatch.execute(&token).await.unwrap();

    let second = store.counts_by_status(dispatch.queue_type()).await.unwrap();
    assert_eq!(first.created, 4);
    assert_eq!(second, first);
    assert_eq!(dispatch.cursor().position().await.unwrap(), watermark);
}
