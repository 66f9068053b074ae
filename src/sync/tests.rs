use super::*;
use crate::session::{Provenance, RunSession};
use crate::storage::{FileStore, SessionRepository};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap()
}

/// Scriptable in-memory platform double.
struct MockPlatform {
    id: PlatformId,
    uploads: Mutex<Vec<ActivityPayload>>,
    updates: Mutex<Vec<(String, ActivityPayload)>>,
    upload_failures: Mutex<VecDeque<PlatformError>>,
    upload_delay: Option<std::time::Duration>,
    day: Mutex<Option<DailyTotals>>,
    counter: AtomicU32,
}

impl MockPlatform {
    fn new(id: PlatformId) -> Arc<Self> {
        Arc::new(Self {
            id,
            uploads: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            upload_failures: Mutex::new(VecDeque::new()),
            upload_delay: None,
            day: Mutex::new(None),
            counter: AtomicU32::new(0),
        })
    }

    fn fail_uploads(&self, error: PlatformError, times: u32) {
        let mut failures = self.upload_failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl HealthPlatform for MockPlatform {
    fn platform_id(&self) -> &PlatformId {
        &self.id
    }

    fn upload_activity(
        &self,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<String, PlatformError>> {
        Box::pin(async move {
            if let Some(delay) = self.upload_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.upload_failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.uploads.lock().unwrap().push(payload);
            Ok(format!("ext-{n}"))
        })
    }

    fn update_activity(
        &self,
        external_id: String,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            self.updates.lock().unwrap().push((external_id, payload));
            Ok(())
        })
    }

    fn daily_totals(
        &self,
        _date: chrono::NaiveDate,
    ) -> BoxFuture<'_, Result<DailyTotals, PlatformError>> {
        Box::pin(async move {
            self.day
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| PlatformError::Network("no day data".to_string()))
        })
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        ..SyncConfig::default()
    }
}

async fn repository() -> (TempDir, SessionRepository) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    (dir, SessionRepository::new(store))
}

fn completed_session(user_id: Uuid) -> RunSession {
    let mut session = RunSession::begin(user_id, base_time());
    session.ended_at = Some(base_time() + Duration::minutes(30));
    session.duration_ms = 1_800_000;
    session.distance_m = 5_000.0;
    session.aggregates.average_pace_s_per_km = Some(360.0);
    session.aggregates.calories_kcal = Some(320.0);
    session
}

fn manager_with(
    config: SyncConfig,
    repository: SessionRepository,
    mock: &Arc<MockPlatform>,
) -> SyncManager {
    SyncManager::new(
        config,
        repository,
        vec![Arc::clone(mock) as Arc<dyn HealthPlatform>],
    )
}

#[tokio::test]
async fn sync_records_the_external_id_and_marks_synced() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    let outcome = manager.sync_session(user_id, session.id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            external_ids: vec![(PlatformId::health_connect(), "ext-0".to_string())],
        }
    );

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert!(status.synced);
    assert_eq!(status.external_id.as_deref(), Some("ext-0"));
    assert_eq!(status.attempts, 1);
    assert!(status.last_error.is_none());
    assert!(status.last_attempt_at.is_some());

    // The platform saw a deterministic idempotency key.
    let expected_key = Uuid::new_v5(&session.id, b"health-connect").to_string();
    let uploads = mock.uploads.lock().unwrap();
    assert_eq!(uploads[0].idempotency_key, expected_key);
    assert_eq!(uploads[0].distance_m, 5_000.0);
}

#[tokio::test]
async fn a_second_sync_updates_the_existing_activity() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    manager.sync_session(user_id, session.id).await.unwrap();
    let outcome = manager.sync_session(user_id, session.id).await.unwrap();

    // Local state is pushed over the recorded external id, never created
    // a second time.
    assert_eq!(mock.upload_count(), 1);
    assert_eq!(mock.update_count(), 1);
    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            external_ids: vec![(PlatformId::health_connect(), "ext-0".to_string())],
        }
    );
    let updates = mock.updates.lock().unwrap();
    assert_eq!(updates[0].0, "ext-0");
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    mock.fail_uploads(PlatformError::Network("connection reset".to_string()), 2);
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    manager.sync_session(user_id, session.id).await.unwrap();

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert!(status.synced);
    assert_eq!(status.attempts, 3);
    assert!(status.last_error.is_none());
    assert_eq!(mock.upload_count(), 1);
}

#[tokio::test]
async fn rejected_payloads_are_not_retried() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    mock.fail_uploads(PlatformError::InvalidPayload("bad unit".to_string()), 10);
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    let error = manager.sync_session(user_id, session.id).await.unwrap_err();
    assert!(matches!(error, SyncError::Rejected { .. }));

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert!(!status.synced);
    assert_eq!(status.attempts, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn exhausted_attempts_record_the_last_error() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    mock.fail_uploads(PlatformError::Network("offline".to_string()), 10);
    let config = SyncConfig {
        max_attempts: 2,
        ..fast_config()
    };
    let manager = manager_with(config, repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    let error = manager.sync_session(user_id, session.id).await.unwrap_err();
    assert!(matches!(error, SyncError::Transient { .. }));

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert!(!status.synced);
    assert_eq!(status.attempts, 2);
    assert!(status.last_error.as_deref().unwrap().contains("offline"));
}

#[tokio::test]
async fn a_hung_platform_call_times_out_as_transient() {
    let (_dir, repo) = repository().await;
    let mut mock = MockPlatform::new(PlatformId::health_connect());
    Arc::get_mut(&mut mock).unwrap().upload_delay = Some(std::time::Duration::from_millis(200));
    let config = SyncConfig {
        attempt_timeout_ms: 50,
        max_attempts: 1,
        ..fast_config()
    };
    let manager = manager_with(config, repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    let error = manager.sync_session(user_id, session.id).await.unwrap_err();
    assert!(matches!(error, SyncError::Transient { .. }));
    assert!(error.to_string().contains("timed out"));
}

#[tokio::test]
async fn open_sessions_are_not_eligible() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = RunSession::begin(user_id, base_time());
    repo.save(&session).await.unwrap();

    let error = manager.sync_session(user_id, session.id).await.unwrap_err();
    assert!(matches!(error, SyncError::NotEligible { .. }));
    assert_eq!(mock.upload_count(), 0);
}

#[tokio::test]
async fn syncing_an_unknown_session_fails_cleanly() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo, &mock);

    let error = manager
        .sync_session(Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::SessionNotFound { .. }));
}

#[tokio::test]
async fn migration_copies_onto_the_successor_platform() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let mut session = completed_session(user_id);
    session.provenance = Provenance::Platform(PlatformId::google_fit());
    repo.save(&session).await.unwrap();

    let outcome = manager.migrate_session(user_id, session.id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Migrated {
            platform: PlatformId::health_connect(),
            external_id: "ext-0".to_string(),
        }
    );

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    assert!(stored.migrated);
    // Provenance survives; migrated is a separate mark.
    assert_eq!(
        stored.provenance,
        Provenance::Platform(PlatformId::google_fit())
    );
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert_eq!(status.external_id.as_deref(), Some("ext-0"));
}

#[tokio::test]
async fn a_second_migration_reports_already_migrated() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let mut session = completed_session(user_id);
    session.provenance = Provenance::Platform(PlatformId::google_fit());
    repo.save(&session).await.unwrap();

    manager.migrate_session(user_id, session.id).await.unwrap();
    let error = manager
        .migrate_session(user_id, session.id)
        .await
        .unwrap_err();

    assert!(matches!(error, SyncError::AlreadyMigrated { .. }));
    assert_eq!(mock.upload_count(), 1);
}

#[tokio::test]
async fn locally_tracked_sessions_cannot_be_migrated() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    let error = manager
        .migrate_session(user_id, session.id)
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::NotEligible { .. }));
    assert_eq!(mock.upload_count(), 0);
}

#[tokio::test]
async fn migration_sweep_classifies_each_session() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();

    let mut eligible = completed_session(user_id);
    eligible.provenance = Provenance::Platform(PlatformId::google_fit());
    repo.save(&eligible).await.unwrap();

    let mut done = completed_session(user_id);
    done.provenance = Provenance::Platform(PlatformId::google_fit());
    done.migrated = true;
    repo.save(&done).await.unwrap();

    let local = completed_session(user_id);
    repo.save(&local).await.unwrap();

    let report = manager.run_migration(user_id).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.migrated, 1);
    assert_eq!(report.already_migrated, 1);
    assert!(report.failed.is_empty());
    assert_eq!(mock.upload_count(), 1);
}

#[tokio::test]
async fn daily_totals_sum_local_sessions_beside_platform_numbers() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    *mock.day.lock().unwrap() = Some(DailyTotals {
        sessions: 3,
        distance_m: 12_000.0,
        duration_ms: 4_000_000,
        calories_kcal: 800.0,
    });
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    repo.save(&completed_session(user_id)).await.unwrap();
    repo.save(&completed_session(user_id)).await.unwrap();

    let mut other_day = completed_session(user_id);
    other_day.started_at = base_time() - Duration::days(1);
    other_day.ended_at = Some(other_day.started_at + Duration::minutes(30));
    repo.save(&other_day).await.unwrap();

    let report = manager
        .daily_totals(user_id, base_time().date_naive())
        .await
        .unwrap();

    assert_eq!(report.local.sessions, 2);
    assert_eq!(report.local.distance_m, 10_000.0);
    assert_eq!(report.local.duration_ms, 3_600_000);
    assert_eq!(report.platforms.len(), 1);
    let (platform, totals) = &report.platforms[0];
    assert_eq!(*platform, PlatformId::health_connect());
    assert_eq!(totals.as_ref().unwrap().sessions, 3);
}

#[tokio::test]
async fn queued_requests_sync_in_the_background() {
    let (_dir, repo) = repository().await;
    let mock = MockPlatform::new(PlatformId::health_connect());
    let manager = manager_with(fast_config(), repo.clone(), &mock);

    let user_id = Uuid::new_v4();
    let session = completed_session(user_id);
    repo.save(&session).await.unwrap();

    manager
        .request_sender()
        .send(SyncRequest {
            user_id,
            session_id: session.id,
        })
        .await
        .unwrap();

    // Shutdown drains the queue and waits for the attempt to finish.
    manager.shutdown().await;

    let stored = repo.load(user_id, session.id).await.unwrap().unwrap();
    let status = stored.sync_status(&PlatformId::health_connect()).unwrap();
    assert!(status.synced);
    assert_eq!(mock.upload_count(), 1);
}
