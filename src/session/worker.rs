//! Single-writer session worker
//!
//! Every mutation of the open session flows through one task draining a
//! command channel, so transitions, sample ingestion, and tick updates
//! are totally ordered without locks. The worker owns the state machine
//! and decides what each outcome publishes: live metrics on the watch
//! channel, trigger events on the broadcast channel, recovery snapshots
//! to the write-behind writer, and completed records to the repository
//! and sync queue.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::machine::{SampleOutcome, SessionMachine};
use super::types::{CommandError, RunSession, SessionId, SessionPhase, UserId};
use crate::metrics::{LocationSample, MetricsConfig, MetricsSnapshot};
use crate::recovery::{RecoveryHandle, RecoveryStore};
use crate::storage::SessionRepository;
use crate::sync::SyncRequest;
use crate::tracker::{RecoveryDecision, TrackerStatus};
use crate::triggers::{SessionGoals, TriggerConfig, TriggerEvent};

/// Knobs for the session worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the command queue feeding the worker.
    pub command_queue_capacity: usize,
    /// How often live metrics refresh when no samples arrive.
    pub tick_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: 256,
            tick_interval_ms: 1000,
        }
    }
}

/// Everything the tracker facade can ask of the worker.
pub(crate) enum SessionCommand {
    Start {
        user_id: UserId,
        goals: SessionGoals,
        reply: oneshot::Sender<Result<SessionId, CommandError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<RunSession, CommandError>>,
    },
    Abandon {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Sample(LocationSample),
    HeartRate(u16),
    ResolveRecovery {
        user_id: UserId,
        decision: RecoveryDecision,
        reply: oneshot::Sender<Result<Option<SessionId>, CommandError>>,
    },
    Status {
        reply: oneshot::Sender<TrackerStatus>,
    },
}

pub(crate) struct SessionWorker {
    session_config: SessionConfig,
    metrics_config: MetricsConfig,
    trigger_config: TriggerConfig,
    repository: SessionRepository,
    recovery_store: RecoveryStore,
    recovery: RecoveryHandle,
    live: watch::Sender<Option<MetricsSnapshot>>,
    events: broadcast::Sender<TriggerEvent>,
    sync_requests: mpsc::Sender<SyncRequest>,
    active: Option<SessionMachine>,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_config: SessionConfig,
        metrics_config: MetricsConfig,
        trigger_config: TriggerConfig,
        repository: SessionRepository,
        recovery_store: RecoveryStore,
        recovery: RecoveryHandle,
        live: watch::Sender<Option<MetricsSnapshot>>,
        events: broadcast::Sender<TriggerEvent>,
        sync_requests: mpsc::Sender<SyncRequest>,
    ) -> Self {
        Self {
            session_config,
            metrics_config,
            trigger_config,
            repository,
            recovery_store,
            recovery,
            live,
            events,
            sync_requests,
            active: None,
        }
    }

    /// Drain commands until the channel closes, refreshing live metrics
    /// on a fixed tick in between.
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let tick = Duration::from_millis(self.session_config.tick_interval_ms.max(1));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!("session worker stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                user_id,
                goals,
                reply,
            } => {
                let _ = reply.send(self.handle_start(user_id, goals).await);
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(self.handle_pause());
            }
            SessionCommand::Resume { reply } => {
                let _ = reply.send(self.handle_resume());
            }
            SessionCommand::Stop { reply } => {
                let _ = reply.send(self.handle_stop().await);
            }
            SessionCommand::Abandon { reply } => {
                let _ = reply.send(self.handle_abandon().await);
            }
            SessionCommand::Sample(sample) => self.handle_sample(sample),
            SessionCommand::HeartRate(bpm) => self.handle_heart_rate(bpm),
            SessionCommand::ResolveRecovery {
                user_id,
                decision,
                reply,
            } => {
                let _ = reply.send(self.handle_resolve(user_id, decision).await);
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_start(
        &mut self,
        user_id: UserId,
        goals: SessionGoals,
    ) -> Result<SessionId, CommandError> {
        if let Some(open) = &self.active {
            return Err(CommandError::AlreadyActive {
                user_id: open.user_id(),
                session_id: open.session_id(),
            });
        }
        // An unresolved crash snapshot blocks new sessions until the user
        // chooses to resume or discard it.
        match self.recovery_store.load(user_id).await {
            Ok(Some(pending)) => {
                return Err(CommandError::AlreadyActive {
                    user_id,
                    session_id: pending.session_id,
                });
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "recovery probe failed, starting anyway"),
        }

        let now = Utc::now();
        let machine = SessionMachine::start(
            user_id,
            goals,
            self.metrics_config.clone(),
            self.trigger_config.clone(),
            now,
        );
        let session_id = machine.session_id();
        let tail = self.recovery_store.config().tail_samples;
        self.recovery.persist(machine.recovery_snapshot(now, tail));
        self.live.send_replace(Some(machine.live_snapshot().clone()));
        self.active = Some(machine);

        info!(session_id = %session_id, user_id = %user_id, "session started");
        Ok(session_id)
    }

    fn open_session(&mut self, command: &'static str) -> Result<&mut SessionMachine, CommandError> {
        self.active.as_mut().ok_or(CommandError::InvalidTransition {
            command,
            phase: SessionPhase::Inactive,
        })
    }

    fn handle_pause(&mut self) -> Result<(), CommandError> {
        let now = Utc::now();
        let tail = self.recovery_store.config().tail_samples;
        let machine = self.open_session("pause")?;
        machine.pause(now)?;

        let snapshot = machine.recovery_snapshot(now, tail);
        let live = machine.live_snapshot().clone();
        let session_id = machine.session_id();
        self.recovery.persist(snapshot);
        self.live.send_replace(Some(live));
        info!(session_id = %session_id, "session paused");
        Ok(())
    }

    fn handle_resume(&mut self) -> Result<(), CommandError> {
        let now = Utc::now();
        let tail = self.recovery_store.config().tail_samples;
        let machine = self.open_session("resume")?;
        machine.resume(now)?;

        let snapshot = machine.recovery_snapshot(now, tail);
        let live = machine.live_snapshot().clone();
        let session_id = machine.session_id();
        self.recovery.persist(snapshot);
        self.live.send_replace(Some(live));
        info!(session_id = %session_id, "session resumed");
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<RunSession, CommandError> {
        let now = Utc::now();
        let machine = self.open_session("stop")?;
        let record = machine.stop(now)?;
        self.active = None;
        self.live.send_replace(None);

        match self.repository.save(&record).await {
            Ok(()) => {
                self.recovery.clear(record.user_id, record.id).await;
                let request = SyncRequest {
                    user_id: record.user_id,
                    session_id: record.id,
                };
                if let Err(error) = self.sync_requests.try_send(request) {
                    warn!(%error, session_id = %record.id, "sync queue full, session will sync on demand");
                }
            }
            Err(error) => {
                // Keep the recovery snapshot: it is the only durable copy
                // until the record can be saved.
                error!(%error, session_id = %record.id, "failed to persist completed session");
            }
        }

        info!(
            session_id = %record.id,
            duration_ms = record.duration_ms,
            distance_m = record.distance_m,
            "session completed"
        );
        Ok(record)
    }

    async fn handle_abandon(&mut self) -> Result<(), CommandError> {
        let machine = self.open_session("abandon")?;
        let user_id = machine.user_id();
        let session_id = machine.session_id();
        machine.abandon()?;
        self.active = None;
        self.live.send_replace(None);
        self.recovery.clear(user_id, session_id).await;
        info!(session_id = %session_id, "session abandoned, nothing kept");
        Ok(())
    }

    fn handle_sample(&mut self, sample: LocationSample) {
        let tail = self.recovery_store.config().tail_samples;
        let Some(machine) = self.active.as_mut() else {
            debug!("location sample with no open session");
            return;
        };

        match machine.on_sample(sample) {
            SampleOutcome::Accepted(snapshot) => {
                let now = Utc::now();
                let recovery = machine.recovery_snapshot(now, tail);
                let events = machine.evaluate_triggers();
                self.live.send_replace(Some(snapshot));
                self.recovery.persist(recovery);
                for event in events {
                    let _ = self.events.send(event);
                }
            }
            SampleOutcome::Rejected(_) => {}
            SampleOutcome::Ignored => debug!("location sample outside the active phase"),
        }
    }

    fn handle_heart_rate(&mut self, bpm: u16) {
        if let Some(machine) = self.active.as_mut() {
            machine.on_heart_rate(bpm);
        }
    }

    fn on_tick(&mut self) {
        let Some(machine) = self.active.as_mut() else {
            return;
        };
        if let Some(snapshot) = machine.on_tick(Utc::now()) {
            let events = machine.evaluate_triggers();
            self.live.send_replace(Some(snapshot));
            for event in events {
                let _ = self.events.send(event);
            }
        }
    }

    async fn handle_resolve(
        &mut self,
        user_id: UserId,
        decision: RecoveryDecision,
    ) -> Result<Option<SessionId>, CommandError> {
        match decision {
            RecoveryDecision::Resume => {
                if let Some(open) = &self.active {
                    return Err(CommandError::AlreadyActive {
                        user_id: open.user_id(),
                        session_id: open.session_id(),
                    });
                }
                let recovered = match self.recovery_store.load(user_id).await {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => return Err(CommandError::NoRecoverableSession { user_id }),
                    Err(error) => {
                        warn!(%error, user_id = %user_id, "recovery snapshot unreadable");
                        return Err(CommandError::NoRecoverableSession { user_id });
                    }
                };

                let now = Utc::now();
                let machine = SessionMachine::restore(
                    recovered,
                    self.metrics_config.clone(),
                    self.trigger_config.clone(),
                    now,
                );
                let session_id = machine.session_id();
                let tail = self.recovery_store.config().tail_samples;
                self.recovery.persist(machine.recovery_snapshot(now, tail));
                self.live.send_replace(Some(machine.live_snapshot().clone()));
                self.active = Some(machine);

                info!(session_id = %session_id, user_id = %user_id, "session resumed from recovery snapshot");
                Ok(Some(session_id))
            }
            RecoveryDecision::Discard => {
                match self.recovery_store.load(user_id).await {
                    Ok(Some(snapshot)) => {
                        if let Err(error) =
                            self.recovery_store.clear(user_id, snapshot.session_id).await
                        {
                            warn!(%error, user_id = %user_id, "failed to discard recovery snapshot");
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        // Unreadable snapshots are cleared as stale.
                        if let Err(error) =
                            self.recovery_store.clear(user_id, SessionId::nil()).await
                        {
                            warn!(%error, user_id = %user_id, "failed to discard recovery snapshot");
                        }
                    }
                }
                info!(user_id = %user_id, "recovery snapshot discarded");
                Ok(None)
            }
        }
    }

    fn status(&self) -> TrackerStatus {
        let sync_queue_depth =
            (self.sync_requests.max_capacity() - self.sync_requests.capacity()) as u32;
        match &self.active {
            Some(machine) => TrackerStatus {
                phase: machine.phase(),
                user_id: Some(machine.user_id()),
                session_id: Some(machine.session_id()),
                accepted_samples: machine.live_snapshot().accepted_samples,
                rejected_samples: machine.rejected_samples(),
                recovery_dirty: self.recovery.is_dirty(),
                sync_queue_depth,
            },
            None => TrackerStatus {
                phase: SessionPhase::Inactive,
                user_id: None,
                session_id: None,
                accepted_samples: 0,
                rejected_samples: 0,
                recovery_dirty: self.recovery.is_dirty(),
                sync_queue_depth,
            },
        }
    }
}
