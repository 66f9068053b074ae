use std::time::Duration;

use chrono::Utc;
use stride::recovery::RecoverySnapshot;
use stride::{
    CommandError, LocationSample, RecoveryDecision, RunTracker, SessionGoals, SessionPhase,
    TrackerConfig,
};
use tempfile::TempDir;
use uuid::Uuid;

fn tracker_in(root: &TempDir) -> RunTracker {
    let mut config = TrackerConfig::default();
    config.storage.root = root.path().join("data");
    config.session.tick_interval_ms = 50;
    RunTracker::new(config)
}

fn sample(monotonic_ms: u64, latitude: f64) -> LocationSample {
    LocationSample::new(latitude, -122.0, Utc::now(), monotonic_ms)
        .unwrap()
        .with_accuracy(4.0)
}

/// The recovery writer is write-behind, so tests wait for the snapshot
/// on disk to reach the state they arranged.
async fn wait_for_snapshot<F>(
    tracker: &RunTracker,
    user_id: Uuid,
    what: &str,
    matches: F,
) -> RecoverySnapshot
where
    F: Fn(&RecoverySnapshot) -> bool,
{
    for _ in 0..200 {
        if let Ok(Some(snapshot)) = tracker.recoverable_session(user_id).await {
            if matches(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("recovery snapshot never became {what}");
}

#[tokio::test]
async fn a_crash_leaves_a_resumable_snapshot() {
    let root = TempDir::new().unwrap();
    let user_id = Uuid::new_v4();

    let tracker = tracker_in(&root);
    let session_id = tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.ingest(sample(0, 37.0)).await.unwrap();
    tracker.ingest(sample(5_000, 37.0005)).await.unwrap();
    wait_for_snapshot(&tracker, user_id, "two samples", |s| s.sample_count == 2).await;
    // no shutdown: drop models the process dying mid-run
    drop(tracker);

    let tracker = tracker_in(&root);
    let snapshot = tracker
        .recoverable_session(user_id)
        .await
        .unwrap()
        .expect("snapshot survives the crash");
    assert_eq!(snapshot.session_id, session_id);
    assert_eq!(snapshot.user_id, user_id);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(snapshot.sample_count, 2);
    assert!((snapshot.metrics.distance_m - 55.5).abs() < 1.0);

    tracker.shutdown().await;
}

#[tokio::test]
async fn resuming_continues_the_same_session() {
    let root = TempDir::new().unwrap();
    let user_id = Uuid::new_v4();

    let tracker = tracker_in(&root);
    let session_id = tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.ingest(sample(0, 37.0)).await.unwrap();
    tracker.ingest(sample(5_000, 37.0005)).await.unwrap();
    wait_for_snapshot(&tracker, user_id, "two samples", |s| s.sample_count == 2).await;
    drop(tracker);

    let tracker = tracker_in(&root);

    // an unresolved snapshot blocks brand-new sessions
    let error = tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap_err();
    assert_eq!(
        error,
        CommandError::AlreadyActive {
            user_id,
            session_id
        }
    );

    let revived = tracker
        .resolve_recovery(user_id, RecoveryDecision::Resume)
        .await
        .unwrap();
    assert_eq!(revived, Some(session_id));
    let status = tracker.status().await.unwrap();
    assert_eq!(status.phase, SessionPhase::Active);
    assert_eq!(status.session_id, Some(session_id));

    tracker.ingest(sample(10_000, 37.0010)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = tracker.stop().await.unwrap();
    assert_eq!(record.id, session_id);
    assert_eq!(record.samples.len(), 3);
    assert!((record.distance_m - 111.2).abs() < 2.0);
    assert!(
        tracker
            .recoverable_session(user_id)
            .await
            .unwrap()
            .is_none()
    );

    tracker.shutdown().await;
}

#[tokio::test]
async fn discarding_clears_the_snapshot_for_good() {
    let root = TempDir::new().unwrap();
    let user_id = Uuid::new_v4();

    let tracker = tracker_in(&root);
    tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.ingest(sample(0, 37.0)).await.unwrap();
    wait_for_snapshot(&tracker, user_id, "one sample", |s| s.sample_count == 1).await;
    drop(tracker);

    let tracker = tracker_in(&root);
    let cleared = tracker
        .resolve_recovery(user_id, RecoveryDecision::Discard)
        .await
        .unwrap();
    assert_eq!(cleared, None);
    assert!(
        tracker
            .recoverable_session(user_id)
            .await
            .unwrap()
            .is_none()
    );

    // discarding with nothing pending is a quiet no-op
    let nothing = tracker
        .resolve_recovery(user_id, RecoveryDecision::Discard)
        .await
        .unwrap();
    assert_eq!(nothing, None);

    // and new sessions start cleanly again
    tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.abandon().await.unwrap();

    tracker.shutdown().await;
}

#[tokio::test]
async fn a_paused_session_recovers_paused() {
    let root = TempDir::new().unwrap();
    let user_id = Uuid::new_v4();

    let tracker = tracker_in(&root);
    tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.ingest(sample(0, 37.0)).await.unwrap();
    tracker.pause().await.unwrap();
    wait_for_snapshot(&tracker, user_id, "paused", |s| s.phase == SessionPhase::Paused).await;
    drop(tracker);

    let tracker = tracker_in(&root);
    tracker
        .resolve_recovery(user_id, RecoveryDecision::Resume)
        .await
        .unwrap();
    let status = tracker.status().await.unwrap();
    assert_eq!(status.phase, SessionPhase::Paused);

    tracker.resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = tracker.stop().await.unwrap();
    assert_eq!(record.samples.len(), 1);

    tracker.shutdown().await;
}

#[tokio::test]
async fn resolving_without_a_snapshot_reports_it() {
    let root = TempDir::new().unwrap();
    let tracker = tracker_in(&root);
    let user_id = Uuid::new_v4();

    let error = tracker
        .resolve_recovery(user_id, RecoveryDecision::Resume)
        .await
        .unwrap_err();
    assert_eq!(error, CommandError::NoRecoverableSession { user_id });

    tracker.shutdown().await;
}

#[tokio::test]
async fn abandon_wipes_the_snapshot_immediately() {
    let root = TempDir::new().unwrap();
    let tracker = tracker_in(&root);
    let user_id = Uuid::new_v4();

    tracker
        .start(user_id, SessionGoals::default())
        .await
        .unwrap();
    tracker.ingest(sample(0, 37.0)).await.unwrap();
    wait_for_snapshot(&tracker, user_id, "one sample", |s| s.sample_count == 1).await;

    tracker.abandon().await.unwrap();
    assert!(
        tracker
            .recoverable_session(user_id)
            .await
            .unwrap()
            .is_none()
    );

    tracker.shutdown().await;
}
