use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::LocationSample;
use crate::sync::{PlatformId, SyncStatus};

/// Unique session identifier
pub type SessionId = Uuid;

/// Unique user identifier
pub type UserId = Uuid;

/// Lifecycle phase of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    Inactive,
    Active,
    Paused,
    Completed,
}

impl SessionPhase {
    /// Open sessions accept commands and shadow a recovery snapshot.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionPhase::Active | SessionPhase::Paused)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionPhase::Inactive => "inactive",
            SessionPhase::Active => "active",
            SessionPhase::Paused => "paused",
            SessionPhase::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Which subsystem originally produced a session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    LocalTracking,
    Platform(PlatformId),
}

impl Provenance {
    pub fn is_platform(&self, id: &PlatformId) -> bool {
        matches!(self, Provenance::Platform(p) if p == id)
    }
}

/// Rolling heart-rate tally fed by an optional wearable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartRateStats {
    pub sum_bpm: f64,
    pub readings: u32,
    pub max_bpm: f64,
}

impl HeartRateStats {
    pub fn record(&mut self, bpm: u16) {
        self.sum_bpm += f64::from(bpm);
        self.readings += 1;
        self.max_bpm = self.max_bpm.max(f64::from(bpm));
    }

    pub fn average(&self) -> Option<f64> {
        if self.readings == 0 {
            None
        } else {
            Some(self.sum_bpm / f64::from(self.readings))
        }
    }

    pub fn max(&self) -> Option<f64> {
        if self.readings == 0 { None } else { Some(self.max_bpm) }
    }
}

/// Whole-session rollups; each optional since hardware may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregates {
    pub average_pace_s_per_km: Option<f64>,
    pub average_speed_mps: Option<f64>,
    pub average_heart_rate_bpm: Option<f64>,
    pub max_heart_rate_bpm: Option<f64>,
    pub calories_kcal: Option<f64>,
    pub elevation_gain_m: Option<f64>,
    pub elevation_loss_m: Option<f64>,
}

/// The authoritative record of one tracked run.
///
/// Live fields are written only by the session worker; the per-platform
/// `sync` descriptors are written only by the sync manager once the
/// session is completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    /// None while the session is still open.
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub distance_m: f64,
    pub aggregates: SessionAggregates,
    /// Ordered accepted samples; empty if GPS never acquired.
    pub samples: Vec<LocationSample>,
    pub provenance: Provenance,
    /// One-time copy to the successor platform happened. Distinct from
    /// `sync`: a migrated session keeps its original provenance tag.
    pub migrated: bool,
    pub sync: HashMap<PlatformId, SyncStatus>,
}

impl RunSession {
    /// Fresh locally-tracked session, still open.
    pub fn begin(user_id: UserId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            started_at,
            ended_at: None,
            duration_ms: 0,
            distance_m: 0.0,
            aggregates: SessionAggregates::default(),
            samples: Vec::new(),
            provenance: Provenance::LocalTracking,
            migrated: false,
            sync: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Calendar date the run started on, for daily aggregation.
    pub fn started_on(&self) -> NaiveDate {
        self.started_at.date_naive()
    }

    pub fn sync_status(&self, platform: &PlatformId) -> Option<&SyncStatus> {
        self.sync.get(platform)
    }

    pub fn sync_status_mut(&mut self, platform: &PlatformId) -> &mut SyncStatus {
        self.sync.entry(platform.clone()).or_default()
    }
}

/// Errors returned synchronously to command issuers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("user {user_id} already has an open session {session_id}")]
    AlreadyActive {
        user_id: UserId,
        session_id: SessionId,
    },

    #[error("cannot {command} while session is {phase}")]
    InvalidTransition {
        command: &'static str,
        phase: SessionPhase,
    },

    #[error("final metrics invalid: duration {duration_ms}ms, distance {distance_m:.1}m")]
    InvalidFinalMetrics { duration_ms: u64, distance_m: f64 },

    #[error("no recoverable session for user {user_id}")]
    NoRecoverableSession { user_id: UserId },

    #[error("tracker is shut down")]
    Closed,
}
