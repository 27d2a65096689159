//! Integration tests for the reconciliation loop

mod harness;

use harness::{settle, wait_until, ProctorHarness};
use proctor_link::signaling::protocol::events;
use proctor_link::{
    DesiredSessions, Error, ParticipantId, ReconciliationLoop, SessionId, StreamStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn desired(pairs: &[(&str, &str)]) -> DesiredSessions {
    pairs
        .iter()
        .map(|(session, participant)| (SessionId::new(*session), ParticipantId::new(*participant)))
        .collect()
}

#[tokio::test]
async fn test_idle_desired_session_is_requested_once() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");
    let wanted = desired(&[("s1", "student-1")]);

    let report = reconciler.reconcile(&wanted);
    assert_eq!(report.requested, vec![s1.clone()]);
    assert!(report.stopped.is_empty());
    assert_eq!(viewer.store.status(&s1), StreamStatus::Waiting);

    let report = reconciler.reconcile(&wanted);
    assert!(report.requested.is_empty());

    wait_until("request sent", || {
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM) == 1
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM),
        1
    );
}

#[tokio::test]
async fn test_errored_session_is_not_requested_by_reconcile() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");

    viewer.store.set_error(&s1, "earlier failure");
    let report = reconciler.reconcile(&desired(&[("s1", "student-1")]));

    assert!(report.requested.is_empty());
    assert_eq!(viewer.store.status(&s1), StreamStatus::Error);
}

#[tokio::test]
async fn test_undesired_session_is_stopped() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");

    reconciler.reconcile(&desired(&[("s1", "student-1")]));
    let transport = harness
        .go_live(&viewer, &s1, "student-1", "pub-sock-1")
        .await
        .unwrap();

    let report = reconciler.reconcile(&DesiredSessions::new());
    assert_eq!(report.stopped, vec![s1.clone()]);

    let state = viewer.store.get(&s1).unwrap();
    assert_eq!(state.status, StreamStatus::Idle);
    assert!(state.stream.is_none());
    assert!(!viewer.service.has_link(&s1));
    wait_until("transport closed", || transport.is_closed())
        .await
        .unwrap();

    // Offers for a participant no longer desired are dropped
    harness
        .relay
        .inject(
            &viewer.context,
            events::WEBRTC_OFFER_RECEIVED,
            &harness::offer_received("pub-sock-1", "student-1", "late-offer"),
        )
        .unwrap();
    settle().await;
    assert_eq!(harness.transports.count(), 1);
}

#[tokio::test]
async fn test_sweep_rerequests_stuck_sessions() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let deadline = Duration::from_secs(5);
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), Some(deadline));
    let s1 = SessionId::new("s1");

    reconciler.reconcile(&desired(&[("s1", "student-1")]));
    assert!(reconciler.sweep_stale(Instant::now()).is_empty());

    let later = Instant::now() + deadline * 2;
    assert_eq!(reconciler.sweep_stale(later), vec![s1.clone()]);
    assert_eq!(viewer.store.status(&s1), StreamStatus::Waiting);

    wait_until("second request", || {
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM) == 2
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_sweep_leaves_live_sessions_alone() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let deadline = Duration::from_secs(5);
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), Some(deadline));
    let s1 = SessionId::new("s1");

    reconciler.reconcile(&desired(&[("s1", "student-1")]));
    let transport = harness
        .go_live(&viewer, &s1, "student-1", "pub-sock-1")
        .await
        .unwrap();

    assert!(reconciler
        .sweep_stale(Instant::now() + deadline * 2)
        .is_empty());
    assert_eq!(viewer.store.status(&s1), StreamStatus::Live);
    assert!(!transport.is_closed());
}

#[tokio::test]
async fn test_sweep_disabled_without_deadline() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);

    reconciler.reconcile(&desired(&[("s1", "student-1")]));
    assert!(reconciler
        .sweep_stale(Instant::now() + Duration::from_secs(3600))
        .is_empty());
}

#[tokio::test]
async fn test_retry_failed_after_reconnect() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");
    let s2 = SessionId::new("s2");

    reconciler.reconcile(&desired(&[("s1", "student-1"), ("s2", "student-2")]));
    viewer.service.stop_stream(&s2);
    viewer.store.set_error(&s1, "connection interrupted");

    let mut retried = reconciler.retry_failed();
    retried.sort();
    assert_eq!(retried, vec![s1.clone(), s2.clone()]);
    assert_eq!(viewer.store.status(&s1), StreamStatus::Waiting);
    assert_eq!(viewer.store.status(&s2), StreamStatus::Waiting);
}

#[tokio::test]
async fn test_run_follows_desired_changes() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");
    let s2 = SessionId::new("s2");

    let (desired_tx, desired_rx) = watch::channel(desired(&[("s1", "student-1")]));
    let task = tokio::spawn(async move { reconciler.run(desired_rx).await });

    wait_until("s1 waiting", || viewer.store.status(&s1) == StreamStatus::Waiting)
        .await
        .unwrap();

    desired_tx.send_replace(desired(&[("s2", "student-2")]));
    wait_until("s1 idle, s2 waiting", || {
        viewer.store.status(&s1) == StreamStatus::Idle
            && viewer.store.status(&s2) == StreamStatus::Waiting
    })
    .await
    .unwrap();

    drop(desired_tx);
    tokio::time::timeout(harness::WAIT_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_recovers_sessions_after_relay_reconnect() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler = ReconciliationLoop::new(Arc::clone(&viewer.service), None);
    let s1 = SessionId::new("s1");

    let (_desired_tx, desired_rx) = watch::channel(desired(&[("s1", "student-1")]));
    let task = tokio::spawn(async move { reconciler.run(desired_rx).await });

    wait_until("requested", || {
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM) == 1
    })
    .await
    .unwrap();
    harness
        .go_live(&viewer, &s1, "student-1", "pub-sock-1")
        .await
        .unwrap();

    let mut updates = viewer.store.subscribe();
    harness.relay.drop_connection(&viewer.context);

    // The session fails with the interruption first, then is re-requested
    loop {
        let update = tokio::time::timeout(harness::WAIT_TIMEOUT, updates.recv())
            .await
            .unwrap()
            .unwrap();
        if update.session == s1 && update.state.status == StreamStatus::Error {
            let interrupted =
                Error::Connectivity("signaling relay connection interrupted".to_string());
            assert_eq!(update.state.error, Some(interrupted.to_string()));
            break;
        }
    }
    wait_until("re-requested", || {
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM) == 2
    })
    .await
    .unwrap();
    assert_eq!(viewer.store.status(&s1), StreamStatus::Waiting);

    task.abort();
}

#[tokio::test]
async fn test_run_sweeps_on_deadline() {
    let harness = ProctorHarness::new();
    let viewer = harness.viewer("exam-1", "proctor-1").await.unwrap();
    let reconciler =
        ReconciliationLoop::new(Arc::clone(&viewer.service), Some(Duration::from_millis(200)));

    let (_desired_tx, desired_rx) = watch::channel(desired(&[("s1", "student-1")]));
    let task = tokio::spawn(async move { reconciler.run(desired_rx).await });

    wait_until("stuck request re-sent", || {
        harness.relay.sent_count(&viewer.context, events::PROCTOR_REQUEST_STREAM) >= 2
    })
    .await
    .unwrap();

    task.abort();
}
