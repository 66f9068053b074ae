//! Background sync of completed sessions to health platforms.
//!
//! Completed session ids arrive on an inbound queue and are fanned out
//! to per-session tasks. Uploads are idempotent twice over: a stable
//! idempotency key lets the platform deduplicate, and a recorded
//! external id switches later attempts to update-in-place. Local records
//! are authoritative; nothing a platform returns is merged back.

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::platform::{ActivityPayload, HealthPlatform, PlatformError};
use super::types::{
    DailyReport, DailyTotals, MigrationReport, PlatformId, SyncError, SyncOutcome, SyncRequest,
};
use crate::session::{Provenance, RunSession, SessionId, UserId};
use crate::storage::SessionRepository;

/// Sync behavior tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Platforms every completed session is pushed to.
    pub targets: Vec<PlatformId>,
    /// Legacy platform whose sessions qualify for migration.
    pub deprecated_platform: PlatformId,
    /// Platform migrated sessions are copied onto.
    pub successor_platform: PlatformId,
    /// Upload attempts per platform before giving up.
    pub max_attempts: u32,
    /// Wall-clock budget for a single platform call.
    pub attempt_timeout_ms: u64,
    /// First retry delay; doubles per attempt.
    pub base_backoff_ms: u64,
    /// Ceiling for the backoff delay.
    pub max_backoff_ms: u64,
    /// Sessions syncing in parallel.
    pub max_concurrent_sessions: usize,
    /// Inbound queue depth before completed sessions apply backpressure.
    pub inbound_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            targets: vec![PlatformId::health_connect()],
            deprecated_platform: PlatformId::google_fit(),
            successor_platform: PlatformId::health_connect(),
            max_attempts: 4,
            attempt_timeout_ms: 10_000,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_concurrent_sessions: 2,
            inbound_capacity: 64,
        }
    }
}

/// Owns the inbound queue and the dispatch task.
pub struct SyncManager {
    core: Arc<SyncCore>,
    requests: mpsc::Sender<SyncRequest>,
    dispatcher: JoinHandle<()>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        repository: SessionRepository,
        connectors: Vec<Arc<dyn HealthPlatform>>,
    ) -> Self {
        let platforms: HashMap<PlatformId, Arc<dyn HealthPlatform>> = connectors
            .into_iter()
            .map(|c| (c.platform_id().clone(), c))
            .collect();

        let (requests, inbound) = mpsc::channel(config.inbound_capacity.max(1));
        let core = Arc::new(SyncCore {
            limiter: Semaphore::new(config.max_concurrent_sessions.max(1)),
            in_flight: DashMap::new(),
            config,
            repository,
            platforms,
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&core), inbound));

        Self {
            core,
            requests,
            dispatcher,
        }
    }

    /// Sender the session worker enqueues completed sessions on.
    pub fn request_sender(&self) -> mpsc::Sender<SyncRequest> {
        self.requests.clone()
    }

    /// Requests accepted but not yet picked up by the dispatcher.
    pub fn queue_depth(&self) -> usize {
        self.requests.max_capacity() - self.requests.capacity()
    }

    /// Push one completed session to every configured target platform.
    pub async fn sync_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        self.core.sync_session(user_id, session_id).await
    }

    /// One-time copy of a deprecated-platform session onto its successor.
    pub async fn migrate_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        self.core.migrate_session(user_id, session_id).await
    }

    /// Migrate every eligible historical session of one user.
    pub async fn run_migration(&self, user_id: UserId) -> Result<MigrationReport, SyncError> {
        self.core.run_migration(user_id).await
    }

    /// Local day totals next to whatever each platform reports.
    pub async fn daily_totals(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<DailyReport, SyncError> {
        self.core.daily_totals(user_id, date).await
    }

    /// Stop accepting requests and let in-flight attempts finish.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(error) = self.dispatcher.await {
            warn!(%error, "sync dispatcher ended abnormally");
        }
    }
}

/// Drains the inbound queue into per-session tasks.
async fn dispatch_loop(core: Arc<SyncCore>, mut inbound: mpsc::Receiver<SyncRequest>) {
    let mut tasks = JoinSet::new();
    while let Some(request) = inbound.recv().await {
        let core = Arc::clone(&core);
        tasks.spawn(async move {
            match core.sync_session(request.user_id, request.session_id).await {
                Ok(_) => {}
                Err(SyncError::AttemptInFlight { .. }) => {}
                Err(error) => {
                    warn!(
                        session_id = %request.session_id,
                        %error,
                        "background sync failed"
                    );
                }
            }
        });
        // Reap finished tasks without blocking the queue.
        while tasks.try_join_next().is_some() {}
    }
    while tasks.join_next().await.is_some() {}
}

/// Shared state behind both the dispatcher and direct calls.
struct SyncCore {
    config: SyncConfig,
    repository: SessionRepository,
    platforms: HashMap<PlatformId, Arc<dyn HealthPlatform>>,
    /// Sessions with an attempt currently running.
    in_flight: DashMap<SessionId, ()>,
    limiter: Semaphore,
}

/// Removes the in-flight marker when an attempt finishes.
struct InFlightGuard {
    core: Arc<SyncCore>,
    session_id: SessionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core.in_flight.remove(&self.session_id);
    }
}

impl SyncCore {
    fn claim(self: &Arc<Self>, session_id: SessionId) -> Result<InFlightGuard, SyncError> {
        if self.in_flight.insert(session_id, ()).is_some() {
            return Err(SyncError::AttemptInFlight { session_id });
        }
        Ok(InFlightGuard {
            core: Arc::clone(self),
            session_id,
        })
    }

    async fn load(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<RunSession, SyncError> {
        self.repository
            .load(user_id, session_id)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or(SyncError::SessionNotFound { session_id })
    }

    async fn sync_session(
        self: &Arc<Self>,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        let _flight = self.claim(session_id)?;
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| SyncError::Storage("sync limiter closed".to_string()))?;

        let mut session = self.load(user_id, session_id).await?;
        if session.is_open() {
            return Err(SyncError::NotEligible {
                session_id,
                reason: "session is still open".to_string(),
            });
        }
        if session.provenance != Provenance::LocalTracking {
            return Err(SyncError::NotEligible {
                session_id,
                reason: "only locally tracked sessions sync to platforms".to_string(),
            });
        }

        let mut external_ids = Vec::new();
        let mut first_error = None;
        for platform_id in &self.config.targets {
            let connector = self
                .platforms
                .get(platform_id)
                .ok_or_else(|| SyncError::UnknownPlatform(platform_id.clone()))?;

            match self
                .push_to_platform(&mut session, connector.as_ref(), platform_id)
                .await
            {
                Ok(external_id) => external_ids.push((platform_id.clone(), external_id)),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                info!(%session_id, platforms = external_ids.len(), "session synced");
                Ok(SyncOutcome::Synced { external_ids })
            }
        }
    }

    async fn migrate_session(
        self: &Arc<Self>,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        let _flight = self.claim(session_id)?;
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| SyncError::Storage("sync limiter closed".to_string()))?;

        let mut session = self.load(user_id, session_id).await?;
        if session.migrated {
            return Err(SyncError::AlreadyMigrated { session_id });
        }
        if !session.provenance.is_platform(&self.config.deprecated_platform) {
            return Err(SyncError::NotEligible {
                session_id,
                reason: format!(
                    "provenance is not {}",
                    self.config.deprecated_platform
                ),
            });
        }

        let successor = self.config.successor_platform.clone();
        let connector = self
            .platforms
            .get(&successor)
            .ok_or_else(|| SyncError::UnknownPlatform(successor.clone()))?;

        let external_id = self
            .push_to_platform(&mut session, connector.as_ref(), &successor)
            .await?;

        // The migrated flag is the only thing making a second call a
        // no-op, so its persistence failure is a hard error.
        session.migrated = true;
        self.repository
            .save(&session)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        info!(%session_id, platform = %successor, %external_id, "session migrated");
        Ok(SyncOutcome::Migrated {
            platform: successor,
            external_id,
        })
    }

    async fn run_migration(self: &Arc<Self>, user_id: UserId) -> Result<MigrationReport, SyncError> {
        let sessions = self
            .repository
            .list_for_user(user_id)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut report = MigrationReport::default();
        for session in sessions {
            if !session
                .provenance
                .is_platform(&self.config.deprecated_platform)
            {
                continue;
            }
            report.examined += 1;
            if session.migrated {
                report.already_migrated += 1;
                continue;
            }
            match self.migrate_session(user_id, session.id).await {
                Ok(_) => report.migrated += 1,
                Err(SyncError::AlreadyMigrated { .. }) => report.already_migrated += 1,
                Err(error) => report.failed.push((session.id, error.to_string())),
            }
        }

        info!(
            %user_id,
            examined = report.examined,
            migrated = report.migrated,
            failed = report.failed.len(),
            "migration sweep finished"
        );
        Ok(report)
    }

    async fn daily_totals(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<DailyReport, SyncError> {
        let sessions = self
            .repository
            .list_for_user(user_id)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut local = DailyTotals::default();
        for session in &sessions {
            if session.is_open()
                || session.started_on() != date
                || session.provenance != Provenance::LocalTracking
            {
                continue;
            }
            local.sessions += 1;
            local.distance_m += session.distance_m;
            local.duration_ms += session.duration_ms;
            local.calories_kcal += session.aggregates.calories_kcal.unwrap_or(0.0);
        }

        // Platform numbers are informational; an unreachable platform
        // reports None instead of failing the report.
        let timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let mut platforms = Vec::with_capacity(self.platforms.len());
        for (id, connector) in &self.platforms {
            let totals = match tokio::time::timeout(timeout, connector.daily_totals(date)).await {
                Ok(Ok(totals)) => Some(totals),
                Ok(Err(error)) => {
                    debug!(platform = %id, %error, "platform day totals unavailable");
                    None
                }
                Err(_) => {
                    debug!(platform = %id, "platform day totals timed out");
                    None
                }
            };
            platforms.push((id.clone(), totals));
        }
        platforms.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        Ok(DailyReport {
            date,
            local,
            platforms,
        })
    }

    /// Upload with retries; create when no external id is recorded yet,
    /// overwrite in place when one is.
    async fn push_to_platform(
        &self,
        session: &mut RunSession,
        connector: &dyn HealthPlatform,
        platform: &PlatformId,
    ) -> Result<String, SyncError> {
        let payload = ActivityPayload::from_session(session, platform);
        let existing = session
            .sync_status(platform)
            .and_then(|s| s.external_id.clone());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .single_attempt(connector, existing.as_deref(), payload.clone())
                .await;

            let status = session.sync_status_mut(platform);
            status.attempts += 1;
            status.last_attempt_at = Some(Utc::now());

            match result {
                Ok(external_id) => {
                    status.synced = true;
                    status.external_id = Some(external_id.clone());
                    status.last_error = None;
                    self.record_state(session).await;
                    return Ok(external_id);
                }
                Err(error) => {
                    status.synced = false;
                    status.last_error = Some(error.to_string());
                    let retry = error.is_transient() && attempt < self.config.max_attempts;
                    self.record_state(session).await;

                    if !retry {
                        warn!(
                            session_id = %session.id,
                            platform = %platform,
                            attempt,
                            %error,
                            "giving up on platform upload"
                        );
                        return Err(self.classify(platform, error));
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        session_id = %session.id,
                        platform = %platform,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "platform upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn single_attempt(
        &self,
        connector: &dyn HealthPlatform,
        existing: Option<&str>,
        payload: ActivityPayload,
    ) -> Result<String, PlatformError> {
        let budget = Duration::from_millis(self.config.attempt_timeout_ms);
        match existing {
            Some(id) => {
                tokio::time::timeout(budget, connector.update_activity(id.to_string(), payload))
                    .await
                    .map_err(|_| PlatformError::Timeout)??;
                Ok(id.to_string())
            }
            None => tokio::time::timeout(budget, connector.upload_activity(payload))
                .await
                .map_err(|_| PlatformError::Timeout)?,
        }
    }

    /// Persisting sync bookkeeping is best effort; the platform already
    /// holds the truth and the idempotency key makes re-uploads safe.
    async fn record_state(&self, session: &RunSession) {
        if let Err(error) = self.repository.save(session).await {
            warn!(session_id = %session.id, %error, "failed to record sync state");
        }
    }

    fn classify(&self, platform: &PlatformId, error: PlatformError) -> SyncError {
        if error.is_transient() {
            SyncError::Transient {
                platform: platform.clone(),
                message: error.to_string(),
            }
        } else {
            SyncError::Rejected {
                platform: platform.clone(),
                message: error.to_string(),
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1).min(5));
        let base = self.config.base_backoff_ms.saturating_mul(multiplier);
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        let jittered = (base as f64 * (1.0 + jitter)) as u64;
        Duration::from_millis(jittered.min(self.config.max_backoff_ms))
    }
}
