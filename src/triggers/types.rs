use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::GpsQuality;

/// Targets the runner set for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionGoals {
    /// Desired pace in seconds per kilometer.
    pub target_pace_s_per_km: Option<f64>,
    /// Half-width of the acceptable band around the target pace.
    pub pace_tolerance_s: f64,
    /// Announce every crossing of this distance interval.
    pub distance_milestone_m: Option<f64>,
    /// Announce every crossing of this elapsed-time interval.
    pub duration_milestone_ms: Option<u64>,
    /// Announce once when this total distance is reached.
    pub target_distance_m: Option<f64>,
}

impl Default for SessionGoals {
    fn default() -> Self {
        Self {
            target_pace_s_per_km: None,
            pace_tolerance_s: 15.0,
            distance_milestone_m: Some(1000.0),
            duration_milestone_ms: None,
            target_distance_m: None,
        }
    }
}

/// Cooldown key; one timer per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerCategory {
    PaceDeviation,
    DistanceMilestone,
    DurationMilestone,
    GpsDegradation,
    GoalCompleted,
}

/// Whether the runner is ahead of or behind the target pace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaceDirection {
    Faster,
    Slower,
}

/// A discrete coaching-relevant event derived from a metrics snapshot.
///
/// Events carry the data a cue renderer needs; how they are voiced or
/// displayed is out of scope here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerEvent {
    PaceDeviation {
        direction: PaceDirection,
        instant_pace_s_per_km: f64,
        target_pace_s_per_km: f64,
        at: DateTime<Utc>,
    },
    DistanceMilestone {
        interval_m: f64,
        ordinal: u32,
        at: DateTime<Utc>,
    },
    DurationMilestone {
        interval_ms: u64,
        ordinal: u32,
        at: DateTime<Utc>,
    },
    GpsDegradation {
        quality: GpsQuality,
        at: DateTime<Utc>,
    },
    GoalCompleted {
        target_distance_m: f64,
        at: DateTime<Utc>,
    },
}

impl TriggerEvent {
    pub fn category(&self) -> TriggerCategory {
        match self {
            TriggerEvent::PaceDeviation { .. } => TriggerCategory::PaceDeviation,
            TriggerEvent::DistanceMilestone { .. } => TriggerCategory::DistanceMilestone,
            TriggerEvent::DurationMilestone { .. } => TriggerCategory::DurationMilestone,
            TriggerEvent::GpsDegradation { .. } => TriggerCategory::GpsDegradation,
            TriggerEvent::GoalCompleted { .. } => TriggerCategory::GoalCompleted,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TriggerEvent::PaceDeviation { at, .. }
            | TriggerEvent::DistanceMilestone { at, .. }
            | TriggerEvent::DurationMilestone { at, .. }
            | TriggerEvent::GpsDegradation { at, .. }
            | TriggerEvent::GoalCompleted { at, .. } => *at,
        }
    }
}
