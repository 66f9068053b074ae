//! Coaching trigger rules
//!
//! A pure rule pass over a metrics snapshot plus session goals. The only
//! internal state is cooldown bookkeeping, the previous GPS quality for
//! edge detection, and the next milestone ordinals. Every decision keys
//! off the snapshot's own timestamp, so an identical snapshot sequence
//! always produces an identical event sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{PaceDirection, SessionGoals, TriggerCategory, TriggerEvent};
use crate::metrics::{GpsQuality, MetricsSnapshot};

/// Trigger evaluation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Minimum spacing between two events of the same category.
    pub cooldown_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { cooldown_ms: 45_000 }
    }
}

/// Per-session rule evaluator.
#[derive(Debug)]
pub struct TriggerEngine {
    config: TriggerConfig,
    last_fired: HashMap<TriggerCategory, DateTime<Utc>>,
    previous_quality: Option<GpsQuality>,
    /// The first evaluation seeds the milestone ordinals from current
    /// totals, so a restored session does not re-announce milestones it
    /// already passed.
    seeded: bool,
    next_distance_ordinal: u32,
    next_duration_ordinal: u32,
    goal_announced: bool,
}

impl TriggerEngine {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            last_fired: HashMap::new(),
            previous_quality: None,
            seeded: false,
            next_distance_ordinal: 1,
            next_duration_ordinal: 1,
            goal_announced: false,
        }
    }

    /// Inspect one snapshot and emit the events it warrants.
    pub fn evaluate(
        &mut self,
        snapshot: &MetricsSnapshot,
        goals: &SessionGoals,
    ) -> Vec<TriggerEvent> {
        let at = snapshot.captured_at;
        self.seed_ordinals(snapshot, goals);

        let mut events = Vec::new();

        if let Some(event) = self.pace_deviation(snapshot, goals, at) {
            events.push(event);
        }
        if let Some(event) = self.distance_milestone(snapshot, goals, at) {
            events.push(event);
        }
        if let Some(event) = self.duration_milestone(snapshot, goals, at) {
            events.push(event);
        }
        if let Some(event) = self.gps_degradation(snapshot, at) {
            events.push(event);
        }
        if let Some(event) = self.goal_completed(snapshot, goals, at) {
            events.push(event);
        }

        self.previous_quality = Some(snapshot.gps_quality);
        events
    }

    /// On the first snapshot, advance milestone counters past whatever the
    /// session already covered. A fresh session stays on ordinal one.
    fn seed_ordinals(&mut self, snapshot: &MetricsSnapshot, goals: &SessionGoals) {
        if self.seeded {
            return;
        }
        self.seeded = true;
        if let Some(interval) = goals.distance_milestone_m.filter(|i| *i > 0.0) {
            self.next_distance_ordinal = (snapshot.distance_m / interval) as u32 + 1;
        }
        if let Some(interval) = goals.duration_milestone_ms.filter(|i| *i > 0) {
            self.next_duration_ordinal = (snapshot.elapsed_ms / interval) as u32 + 1;
        }
        if let Some(target) = goals.target_distance_m {
            if snapshot.distance_m >= target {
                self.goal_announced = true;
            }
        }
    }

    fn pace_deviation(
        &mut self,
        snapshot: &MetricsSnapshot,
        goals: &SessionGoals,
        at: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        let target = goals.target_pace_s_per_km?;
        let instant = snapshot.instant_pace_s_per_km?;
        let deviation = instant - target;
        if deviation.abs() <= goals.pace_tolerance_s {
            return None;
        }
        if !self.try_fire(TriggerCategory::PaceDeviation, at) {
            return None;
        }
        // Higher seconds per kilometer means a slower runner.
        let direction = if deviation > 0.0 {
            PaceDirection::Slower
        } else {
            PaceDirection::Faster
        };
        Some(TriggerEvent::PaceDeviation {
            direction,
            instant_pace_s_per_km: instant,
            target_pace_s_per_km: target,
            at,
        })
    }

    fn distance_milestone(
        &mut self,
        snapshot: &MetricsSnapshot,
        goals: &SessionGoals,
        at: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        let interval = goals.distance_milestone_m.filter(|i| *i > 0.0)?;
        let reached = (snapshot.distance_m / interval) as u32;
        if reached < self.next_distance_ordinal {
            return None;
        }
        if !self.try_fire(TriggerCategory::DistanceMilestone, at) {
            return None;
        }
        // A large gap can cross several intervals at once; announce the
        // latest and skip the stale ones.
        self.next_distance_ordinal = reached + 1;
        Some(TriggerEvent::DistanceMilestone {
            interval_m: interval,
            ordinal: reached,
            at,
        })
    }

    fn duration_milestone(
        &mut self,
        snapshot: &MetricsSnapshot,
        goals: &SessionGoals,
        at: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        let interval = goals.duration_milestone_ms.filter(|i| *i > 0)?;
        let reached = (snapshot.elapsed_ms / interval) as u32;
        if reached < self.next_duration_ordinal {
            return None;
        }
        if !self.try_fire(TriggerCategory::DurationMilestone, at) {
            return None;
        }
        self.next_duration_ordinal = reached + 1;
        Some(TriggerEvent::DurationMilestone {
            interval_ms: interval,
            ordinal: reached,
            at,
        })
    }

    fn gps_degradation(
        &mut self,
        snapshot: &MetricsSnapshot,
        at: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        let quality = snapshot.gps_quality;
        if !quality.is_degraded() {
            return None;
        }
        // Fires only on a transition, never while already degraded; the
        // first snapshot sets the baseline silently.
        let previous = self.previous_quality?;
        if previous == quality {
            return None;
        }
        if !self.try_fire(TriggerCategory::GpsDegradation, at) {
            return None;
        }
        Some(TriggerEvent::GpsDegradation { quality, at })
    }

    fn goal_completed(
        &mut self,
        snapshot: &MetricsSnapshot,
        goals: &SessionGoals,
        at: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        let target = goals.target_distance_m?;
        if self.goal_announced || snapshot.distance_m < target {
            return None;
        }
        self.goal_announced = true;
        self.last_fired.insert(TriggerCategory::GoalCompleted, at);
        Some(TriggerEvent::GoalCompleted {
            target_distance_m: target,
            at,
        })
    }

    /// Record a firing unless the category is still cooling down.
    fn try_fire(&mut self, category: TriggerCategory, at: DateTime<Utc>) -> bool {
        let cooled = self.last_fired.get(&category).is_none_or(|last| {
            at.signed_duration_since(*last).num_milliseconds() >= self.config.cooldown_ms as i64
        });
        if cooled {
            self.last_fired.insert(category, at);
        }
        cooled
    }
}
