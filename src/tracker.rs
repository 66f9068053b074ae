//! Tracker facade
//!
//! Owns every long-lived piece: the file store, the recovery writer, the
//! session worker, and the sync manager. Callers talk to the worker over
//! a bounded command channel with oneshot replies, so every command sees
//! the same serialized session state. Live metrics fan out on a watch
//! channel and coaching triggers on a broadcast channel.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::TrackerConfig;
use crate::metrics::{LocationSample, MetricsSnapshot};
use crate::recovery::{RecoverySnapshot, RecoveryStore, RecoveryWriter};
use crate::session::worker::{SessionCommand, SessionWorker};
use crate::session::{CommandError, RunSession, SessionId, SessionPhase, UserId};
use crate::storage::{FileStore, RecordStore, SessionRepository, StoreError};
use crate::sync::{
    DailyReport, HealthPlatform, MigrationReport, RestPlatform, SyncError, SyncManager,
    SyncOutcome,
};
use crate::triggers::{SessionGoals, TriggerEvent};

/// Slow trigger consumers drop old events rather than stalling the worker.
const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// How the user wants a crash-recovered session handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Rebuild the session and keep tracking it.
    Resume,
    /// Drop the snapshot for good.
    Discard,
}

/// Point-in-time view of the tracker for dashboards and health checks.
#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub phase: SessionPhase,
    pub user_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    pub accepted_samples: u32,
    pub rejected_samples: u32,
    /// True while a recovery write is pending or has failed and awaits retry.
    pub recovery_dirty: bool,
    pub sync_queue_depth: u32,
}

/// The engine's front door. All methods take `&self`; share it by
/// reference or inside an `Arc`.
pub struct RunTracker {
    commands: mpsc::Sender<SessionCommand>,
    live: watch::Receiver<Option<MetricsSnapshot>>,
    events: broadcast::Sender<TriggerEvent>,
    repository: SessionRepository,
    recovery_store: RecoveryStore,
    sync: SyncManager,
    worker: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RunTracker {
    /// Stand up the full engine from configuration. Spawns the worker,
    /// recovery writer, and sync dispatcher, so it must run inside a
    /// Tokio runtime.
    pub fn new(config: TrackerConfig) -> Self {
        let connectors: Vec<Arc<dyn HealthPlatform>> = config
            .platforms
            .iter()
            .map(|endpoint| {
                Arc::new(RestPlatform::new(
                    endpoint.id.clone(),
                    endpoint.base_url.clone(),
                    endpoint.access_token.clone(),
                )) as Arc<dyn HealthPlatform>
            })
            .collect();
        Self::with_connectors(config, connectors)
    }

    /// Like [`new`](Self::new) but with caller-supplied platform
    /// connectors, for platforms that speak something other than the
    /// bundled REST shape.
    pub fn with_connectors(
        config: TrackerConfig,
        connectors: Vec<Arc<dyn HealthPlatform>>,
    ) -> Self {
        let store: Arc<dyn RecordStore> = Arc::new(FileStore::new(config.storage.root.clone()));
        let repository = SessionRepository::new(Arc::clone(&store));
        let recovery_store = RecoveryStore::new(Arc::clone(&store), config.recovery.clone());
        let (recovery, writer) = RecoveryWriter::spawn(recovery_store.clone());

        let sync = SyncManager::new(config.sync.clone(), repository.clone(), connectors);

        let (commands, command_rx) = mpsc::channel(config.session.command_queue_capacity.max(1));
        let (live_tx, live) = watch::channel(None);
        let (events, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);

        let worker = SessionWorker::new(
            config.session,
            config.metrics,
            config.triggers,
            repository.clone(),
            recovery_store.clone(),
            recovery,
            live_tx,
            events.clone(),
            sync.request_sender(),
        );
        let worker = tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            live,
            events,
            repository,
            recovery_store,
            sync,
            worker,
            writer,
        }
    }

    async fn roundtrip<T>(
        &self,
        command: SessionCommand,
        response: oneshot::Receiver<Result<T, CommandError>>,
    ) -> Result<T, CommandError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CommandError::Closed)?;
        response.await.map_err(|_| CommandError::Closed)?
    }

    /// Begin tracking a run for this user.
    pub async fn start(
        &self,
        user_id: UserId,
        goals: SessionGoals,
    ) -> Result<SessionId, CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(
            SessionCommand::Start {
                user_id,
                goals,
                reply,
            },
            response,
        )
        .await
    }

    pub async fn pause(&self) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(SessionCommand::Pause { reply }, response).await
    }

    pub async fn resume(&self) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(SessionCommand::Resume { reply }, response).await
    }

    /// Finalize the open session. On success the completed record has
    /// been saved and queued for sync; on `InvalidFinalMetrics` the
    /// session is still open.
    pub async fn stop(&self) -> Result<RunSession, CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(SessionCommand::Stop { reply }, response).await
    }

    /// Discard the open session without keeping anything.
    pub async fn abandon(&self) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(SessionCommand::Abandon { reply }, response)
            .await
    }

    /// Feed one GPS sample. Validation happens in the worker; rejected
    /// samples are logged and dropped there.
    pub async fn ingest(&self, sample: LocationSample) -> Result<(), CommandError> {
        self.commands
            .send(SessionCommand::Sample(sample))
            .await
            .map_err(|_| CommandError::Closed)
    }

    /// Forward a device position stream until it ends. Gaps are fine;
    /// tick updates keep publishing through silence.
    pub async fn attach_sampler<S>(&self, samples: S) -> Result<(), CommandError>
    where
        S: Stream<Item = LocationSample>,
    {
        let mut samples = std::pin::pin!(samples);
        while let Some(sample) = samples.next().await {
            self.ingest(sample).await?;
        }
        Ok(())
    }

    /// Feed one heart-rate reading from a wearable.
    pub async fn ingest_heart_rate(&self, bpm: u16) -> Result<(), CommandError> {
        self.commands
            .send(SessionCommand::HeartRate(bpm))
            .await
            .map_err(|_| CommandError::Closed)
    }

    /// Latest metrics snapshot, `None` while no session is open.
    pub fn live_metrics(&self) -> watch::Receiver<Option<MetricsSnapshot>> {
        self.live.clone()
    }

    /// Coaching trigger events as they fire.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    /// Crash snapshot left behind for this user, if any. The caller
    /// presents the choice; nothing is discarded silently.
    pub async fn recoverable_session(
        &self,
        user_id: UserId,
    ) -> Result<Option<RecoverySnapshot>, StoreError> {
        self.recovery_store.load(user_id).await
    }

    /// Apply the user's resume-or-discard choice for a crash snapshot.
    /// Returns the revived session id on resume.
    pub async fn resolve_recovery(
        &self,
        user_id: UserId,
        decision: RecoveryDecision,
    ) -> Result<Option<SessionId>, CommandError> {
        let (reply, response) = oneshot::channel();
        self.roundtrip(
            SessionCommand::ResolveRecovery {
                user_id,
                decision,
                reply,
            },
            response,
        )
        .await
    }

    pub async fn status(&self) -> Result<TrackerStatus, CommandError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Status { reply })
            .await
            .map_err(|_| CommandError::Closed)?;
        response.await.map_err(|_| CommandError::Closed)
    }

    /// The authoritative table of completed sessions.
    pub fn sessions(&self) -> &SessionRepository {
        &self.repository
    }

    /// Push one completed session to every configured platform now,
    /// instead of waiting for the background queue.
    pub async fn sync_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync.sync_session(user_id, session_id).await
    }

    /// One-time copy of a deprecated-platform session onto its successor.
    pub async fn migrate_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync.migrate_session(user_id, session_id).await
    }

    /// Migrate every eligible historical session of one user.
    pub async fn run_migration(&self, user_id: UserId) -> Result<MigrationReport, SyncError> {
        self.sync.run_migration(user_id).await
    }

    /// Local day totals next to whatever each platform reports.
    pub async fn daily_totals(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<DailyReport, SyncError> {
        self.sync.daily_totals(user_id, date).await
    }

    /// Graceful shutdown: close the command channel, drain the worker
    /// and recovery writer, then let sync finish in-flight attempts.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(error) = self.worker.await {
            warn!(%error, "session worker ended abnormally");
        }
        if let Err(error) = self.writer.await {
            warn!(%error, "recovery writer ended abnormally");
        }
        self.sync.shutdown().await;
    }
}
