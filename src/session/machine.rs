//! Session lifecycle state machine
//!
//! Pure in-memory state: it owns the session record, the metrics engine,
//! and the trigger evaluator, but performs no I/O and holds no channels.
//! The worker drives it and decides what to persist and publish. Every
//! transition either succeeds or returns `CommandError` leaving state
//! untouched, so a failed stop keeps the session open.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{CommandError, HeartRateStats, RunSession, SessionId, SessionPhase, UserId};
use crate::metrics::{
    LocationSample, MetricsConfig, MetricsEngine, MetricsSnapshot, SampleRejected,
};
use crate::recovery::RecoverySnapshot;
use crate::triggers::{SessionGoals, TriggerConfig, TriggerEngine, TriggerEvent};

/// What became of one ingested sample.
#[derive(Debug)]
pub enum SampleOutcome {
    /// Folded into the metrics; the fresh snapshot is attached.
    Accepted(MetricsSnapshot),
    /// Failed validation and changed nothing.
    Rejected(SampleRejected),
    /// Arrived outside the Active phase.
    Ignored,
}

/// One open session's live state.
pub struct SessionMachine {
    record: RunSession,
    goals: SessionGoals,
    phase: SessionPhase,
    engine: MetricsEngine,
    triggers: TriggerEngine,
    snapshot: MetricsSnapshot,
    heart: HeartRateStats,
    rejected: u32,
}

impl SessionMachine {
    /// Begin a fresh Active session.
    pub fn start(
        user_id: UserId,
        goals: SessionGoals,
        metrics_config: MetricsConfig,
        trigger_config: TriggerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let record = RunSession::begin(user_id, now);
        let engine = MetricsEngine::new(metrics_config, now);
        let snapshot = engine.snapshot(now);
        Self {
            record,
            goals,
            phase: SessionPhase::Active,
            engine,
            triggers: TriggerEngine::new(trigger_config),
            snapshot,
            heart: HeartRateStats::default(),
            rejected: 0,
        }
    }

    /// Rebuild an open session from its recovery snapshot, continuing in
    /// the phase it crashed in.
    pub fn restore(
        recovered: RecoverySnapshot,
        metrics_config: MetricsConfig,
        trigger_config: TriggerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut engine = MetricsEngine::restore(
            metrics_config,
            &recovered.metrics,
            recovered.active_ms,
            &recovered.recent_samples,
        );
        let phase = if recovered.phase == SessionPhase::Paused {
            SessionPhase::Paused
        } else {
            engine.resume(now);
            SessionPhase::Active
        };

        let mut record = RunSession::begin(recovered.user_id, recovered.started_at);
        record.id = recovered.session_id;
        record.samples = recovered.recent_samples;

        let snapshot = engine.snapshot(now);
        Self {
            record,
            goals: recovered.goals,
            phase,
            engine,
            triggers: TriggerEngine::new(trigger_config),
            snapshot,
            heart: recovered.heart,
            rejected: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> SessionId {
        self.record.id
    }

    pub fn user_id(&self) -> UserId {
        self.record.user_id
    }

    pub fn live_snapshot(&self) -> &MetricsSnapshot {
        &self.snapshot
    }

    pub fn rejected_samples(&self) -> u32 {
        self.rejected
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), CommandError> {
        if self.phase != SessionPhase::Active {
            return Err(CommandError::InvalidTransition {
                command: "pause",
                phase: self.phase,
            });
        }
        self.engine.pause(now);
        self.phase = SessionPhase::Paused;
        self.snapshot = self.engine.snapshot(now);
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), CommandError> {
        if self.phase != SessionPhase::Paused {
            return Err(CommandError::InvalidTransition {
                command: "resume",
                phase: self.phase,
            });
        }
        self.engine.resume(now);
        self.phase = SessionPhase::Active;
        self.snapshot = self.engine.snapshot(now);
        Ok(())
    }

    /// Finalize the session. On success the record carries frozen totals;
    /// on `InvalidFinalMetrics` the session stays open unchanged.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<RunSession, CommandError> {
        if !self.phase.is_open() {
            return Err(CommandError::InvalidTransition {
                command: "stop",
                phase: self.phase,
            });
        }

        let finals = self.engine.snapshot(now);
        if finals.elapsed_ms == 0 || finals.distance_m < 0.0 {
            return Err(CommandError::InvalidFinalMetrics {
                duration_ms: finals.elapsed_ms,
                distance_m: finals.distance_m,
            });
        }

        self.phase = SessionPhase::Completed;
        self.record.ended_at = Some(now);
        self.record.duration_ms = finals.elapsed_ms;
        self.record.distance_m = finals.distance_m;

        let aggregates = &mut self.record.aggregates;
        aggregates.average_pace_s_per_km = finals.average_pace_s_per_km;
        aggregates.average_speed_mps = finals.average_speed_mps;
        aggregates.average_heart_rate_bpm = self.heart.average();
        aggregates.max_heart_rate_bpm = self.heart.max();
        if finals.accepted_samples > 0 {
            aggregates.calories_kcal = Some(finals.calories_kcal);
            aggregates.elevation_gain_m = Some(finals.elevation_gain_m);
            aggregates.elevation_loss_m = Some(finals.elevation_loss_m);
        }

        self.snapshot = finals;
        Ok(self.record.clone())
    }

    /// Discard the session. Valid from any open phase.
    pub fn abandon(&mut self) -> Result<(), CommandError> {
        if !self.phase.is_open() {
            return Err(CommandError::InvalidTransition {
                command: "abandon",
                phase: self.phase,
            });
        }
        self.phase = SessionPhase::Inactive;
        Ok(())
    }

    /// Feed one GPS sample. Only Active sessions consume samples.
    pub fn on_sample(&mut self, sample: LocationSample) -> SampleOutcome {
        if self.phase != SessionPhase::Active {
            return SampleOutcome::Ignored;
        }
        match self.engine.accept(&sample) {
            Ok(snapshot) => {
                self.record.samples.push(sample);
                self.snapshot = snapshot.clone();
                SampleOutcome::Accepted(snapshot)
            }
            Err(error) => {
                self.rejected += 1;
                debug!(session_id = %self.record.id, %error, "sample rejected");
                SampleOutcome::Rejected(error)
            }
        }
    }

    /// Record a heart-rate reading; ignored outside Active.
    pub fn on_heart_rate(&mut self, bpm: u16) {
        if self.phase == SessionPhase::Active {
            self.heart.record(bpm);
        }
    }

    /// Periodic refresh so elapsed time and signal-loss degradation move
    /// between samples. Returns the new snapshot while Active.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<MetricsSnapshot> {
        if self.phase != SessionPhase::Active {
            return None;
        }
        self.snapshot = self.engine.snapshot(now);
        Some(self.snapshot.clone())
    }

    /// Run trigger rules over the current snapshot.
    pub fn evaluate_triggers(&mut self) -> Vec<TriggerEvent> {
        if self.phase != SessionPhase::Active {
            return Vec::new();
        }
        self.triggers.evaluate(&self.snapshot, &self.goals)
    }

    /// Image of this session for the crash-recovery record.
    pub fn recovery_snapshot(&self, now: DateTime<Utc>, tail_samples: usize) -> RecoverySnapshot {
        let samples = &self.record.samples;
        let tail_start = samples.len().saturating_sub(tail_samples);
        RecoverySnapshot {
            session_id: self.record.id,
            user_id: self.record.user_id,
            phase: self.phase,
            started_at: self.record.started_at,
            goals: self.goals.clone(),
            metrics: self.snapshot.clone(),
            heart: self.heart.clone(),
            active_ms: self.engine.active_time_ms(now),
            sample_count: samples.len() as u32,
            recent_samples: samples[tail_start..].to_vec(),
            last_updated: now,
        }
    }
}
