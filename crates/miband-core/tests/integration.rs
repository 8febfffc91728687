//! Integration tests for miband-core
//!
//! These exercise the public API against [`MockLink`] and run without
//! Bluetooth hardware. Hardware tests live in `hardware_tests.rs`.

use std::sync::Arc;
use std::time::Duration;

use miband_core::{
    ConnectMode, DeviceSession, MockLink, RadioLink, RefreshOutcome, SessionConfig, SessionEvent,
    SessionState, SnapshotStore, WakePolicy,
};
use miband_types::{Reading, ReadingKind};

fn session(link: MockLink, config: SessionConfig) -> Arc<DeviceSession<MockLink>> {
    Arc::new(DeviceSession::new(link, config, Arc::new(SnapshotStore::new())).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_full_refresh_lifecycle() {
    let link = MockLink::builder()
        .battery(73)
        .activity(4200, 3100, 160)
        .build();
    let session = session(link, SessionConfig::default());
    let mut state = session.watch_state();

    assert_eq!(session.refresh().await, RefreshOutcome::Success);

    let readings = session.snapshot().all();
    assert_eq!(readings.len(), 2);
    assert!(readings.iter().any(|r| r.kind() == ReadingKind::BatteryLevel));
    match session.snapshot().get(ReadingKind::Activity) {
        Some(Reading::Activity(sample)) => {
            assert_eq!(sample.steps, 4200);
            assert_eq!(sample.distance_m, 3100);
            assert_eq!(sample.calories, 160);
        }
        other => panic!("unexpected reading: {other:?}"),
    }

    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), SessionState::Idle);
    assert!(!session.link().is_connected().await);

    let metrics = session.metrics();
    assert_eq!(metrics.refresh_success, 1);
    assert_eq!(metrics.connects.succeeded, 1);
    assert_eq!(metrics.refreshes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_battery_only_skips_subscription() {
    let link = MockLink::builder().battery(12).activity(1, 1, 1).build();
    let session = session(link, SessionConfig::battery_only());

    assert_eq!(session.refresh().await, RefreshOutcome::Success);
    assert_eq!(session.link().subscribe_calls(), 0);
    assert_eq!(session.link().discover_calls(), 0);
    assert!(session.snapshot().activity().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_independent() {
    let healthy = session(
        MockLink::builder()
            .address("C8:0F:10:00:00:01")
            .battery(50)
            .activity(10, 8, 1)
            .build(),
        SessionConfig::default(),
    );
    let broken = session(
        MockLink::builder()
            .address("C8:0F:10:00:00:02")
            .always_fail_connect()
            .build(),
        SessionConfig::default(),
    );

    let (a, b) = tokio::join!(healthy.refresh(), broken.refresh());

    assert_eq!(a, RefreshOutcome::Success);
    assert_eq!(b, RefreshOutcome::Failure);
    assert!(healthy.snapshot().battery().is_some());
    assert!(broken.snapshot().all().is_empty());
    assert_eq!(broken.state(), SessionState::Failed);
    assert_eq!(healthy.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_failed_refresh() {
    let link = MockLink::builder().battery(40).activity(5, 4, 3).build();
    link.set_always_fail_connect(true);
    let session = session(link, SessionConfig::default());

    assert_eq!(session.refresh().await, RefreshOutcome::Failure);
    assert_eq!(session.state(), SessionState::Failed);

    session.link().set_always_fail_connect(false);
    assert_eq!(session.refresh().await, RefreshOutcome::Success);
    assert_eq!(session.state(), SessionState::Idle);

    let metrics = session.metrics();
    assert_eq!(metrics.refresh_failure, 1);
    assert_eq!(metrics.refresh_success, 1);
    assert_eq!(metrics.connects.failed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_flaky_connect_within_budget() {
    let link = MockLink::builder()
        .connect_failures(2)
        .activity(9, 9, 9)
        .build();
    let session = session(link, SessionConfig::default());

    assert_eq!(session.refresh().await, RefreshOutcome::Success);
    assert_eq!(session.link().connect_calls(), 3);
    assert_eq!(session.link().disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_blocking_with_latency() {
    let link = MockLink::builder()
        .connect_latency(Duration::from_millis(300))
        .activity(2, 2, 2)
        .build();
    let config = SessionConfig::default().connect_mode(ConnectMode::NonBlocking);
    let session = session(link, config);

    assert_eq!(session.refresh().await, RefreshOutcome::Success);
    assert_eq!(session.link().connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_matched_handle_times_out_on_unrelated_traffic() {
    let link = MockLink::builder()
        .notification(
            miband_types::CharacteristicHandle(40),
            miband_core::mock::activity_payload(1, 1, 1),
        )
        .build();
    let config = SessionConfig::default()
        .wake_policy(WakePolicy::MatchedHandle)
        .notification_timeout(Duration::from_secs(5));
    let session = session(link, config);
    let start = tokio::time::Instant::now();

    assert_eq!(session.refresh().await, RefreshOutcome::PartialFailure);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(session.metrics().notification_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_retry_events() {
    let link = MockLink::builder()
        .activity(1, 1, 1)
        .drops_after_subscribe(2)
        .build();
    let session = session(link, SessionConfig::default());
    let mut events = session.subscribe_events();

    assert_eq!(session.refresh().await, RefreshOutcome::Success);

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::CycleRetry { attempt, .. } = event {
            retries.push(attempt);
        }
    }
    assert_eq!(retries, vec![1, 2]);
    assert_eq!(session.metrics().cycle_retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_token_cancels_sessions() {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let link = MockLink::builder().battery(60).build();
    let session = Arc::new(
        DeviceSession::new(link, SessionConfig::default(), Arc::new(SnapshotStore::new()))
            .unwrap()
            .with_cancellation(shutdown.child_token()),
    );

    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.refresh().await }
    });
    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.cancel();

    assert_eq!(task.await.unwrap(), RefreshOutcome::Failure);
    assert!(session.is_cancelled());
    assert_eq!(session.link().disconnect_calls(), 1);
}
