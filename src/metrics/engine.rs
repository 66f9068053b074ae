//! Sample-to-metrics pipeline
//!
//! Consumes raw position samples, filters noise, and maintains cumulative
//! totals plus a trailing window for instantaneous pace and speed. The
//! engine holds only the window buffer and totals, never full history.

use chrono::{DateTime, Utc};
use geo::{Distance as _, Haversine, geometry::Point};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::types::{GpsQuality, LocationSample, MetricsSnapshot, SampleRejected};

/// Calorie model: running MET tracks speed in km/h nearly 1:1 across
/// typical training paces (ACSM compendium values).
mod met {
    /// Below this speed the runner is treated as idle between samples.
    pub const IDLE_THRESHOLD_KMH: f64 = 3.0;
    /// MET charged for idle intervals.
    pub const IDLE: f64 = 1.5;
    /// Slowest ambulatory MET.
    pub const WALKING_FLOOR: f64 = 3.5;
    /// Sprinting cap.
    pub const CEILING: f64 = 23.0;
}

/// Pace is reported as unavailable below this speed.
const MIN_PACE_SPEED_MPS: f64 = 0.1;

/// Tunables for the sample pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples with worse horizontal accuracy than this are rejected.
    pub accuracy_ceiling_m: f64,
    /// Position deltas implying a faster speed than this are treated as
    /// GPS noise and excluded from distance.
    pub max_plausible_speed_mps: f64,
    /// Trailing window for instantaneous pace and speed.
    pub instant_window_ms: u64,
    /// Without an accepted sample for this long, quality reads SignalLost.
    pub signal_loss_timeout_ms: u64,
    /// Runner weight used by the calorie estimate.
    pub runner_weight_kg: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            accuracy_ceiling_m: 20.0,
            max_plausible_speed_mps: 12.0,
            instant_window_ms: 30_000,
            signal_loss_timeout_ms: 15_000,
            runner_weight_kg: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    monotonic_ms: u64,
    distance_m: f64,
}

/// Wall-clock ledger of Active time. Paused spans contribute nothing.
#[derive(Debug, Clone)]
struct ActiveClock {
    accumulated_ms: u64,
    active_since: Option<DateTime<Utc>>,
}

impl ActiveClock {
    fn running(at: DateTime<Utc>) -> Self {
        Self {
            accumulated_ms: 0,
            active_since: Some(at),
        }
    }

    fn pause(&mut self, at: DateTime<Utc>) {
        if let Some(since) = self.active_since.take() {
            self.accumulated_ms += span_ms(since, at);
        }
    }

    fn resume(&mut self, at: DateTime<Utc>) {
        if self.active_since.is_none() {
            self.active_since = Some(at);
        }
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.accumulated_ms + self.active_since.map_or(0, |since| span_ms(since, now))
    }
}

fn span_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    to.signed_duration_since(from).num_milliseconds().max(0) as u64
}

fn pace_from_speed(speed_mps: f64) -> Option<f64> {
    if speed_mps > MIN_PACE_SPEED_MPS {
        Some(1000.0 / speed_mps)
    } else {
        None
    }
}

/// Streaming metrics accumulator for one session.
#[derive(Debug)]
pub struct MetricsEngine {
    config: MetricsConfig,
    distance_m: f64,
    elevation_gain_m: f64,
    elevation_loss_m: f64,
    calories_kcal: f64,
    accepted: u32,
    window: VecDeque<WindowEntry>,
    last_point: Option<Point>,
    last_altitude: Option<f64>,
    last_monotonic_ms: Option<u64>,
    last_sample_at: Option<DateTime<Utc>>,
    last_quality: GpsQuality,
    clock: ActiveClock,
}

impl MetricsEngine {
    /// Fresh engine with the session clock running from `started_at`.
    pub fn new(config: MetricsConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            distance_m: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            calories_kcal: 0.0,
            accepted: 0,
            window: VecDeque::new(),
            last_point: None,
            last_altitude: None,
            last_monotonic_ms: None,
            last_sample_at: None,
            last_quality: GpsQuality::SignalLost,
            clock: ActiveClock::running(started_at),
        }
    }

    /// Rebuild an engine from a recovered snapshot and its buffered sample
    /// tail. The clock comes back frozen; call `resume` to continue it.
    pub fn restore(
        config: MetricsConfig,
        metrics: &MetricsSnapshot,
        active_ms: u64,
        tail: &[LocationSample],
    ) -> Self {
        let mut engine = Self {
            config,
            distance_m: metrics.distance_m,
            elevation_gain_m: metrics.elevation_gain_m,
            elevation_loss_m: metrics.elevation_loss_m,
            calories_kcal: metrics.calories_kcal,
            accepted: metrics.accepted_samples,
            window: VecDeque::new(),
            last_point: None,
            last_altitude: None,
            last_monotonic_ms: None,
            last_sample_at: metrics.last_sample_at,
            last_quality: metrics.gps_quality,
            clock: ActiveClock {
                accumulated_ms: active_ms,
                active_since: None,
            },
        };

        // Rebuild window offsets from the tail; the base is chosen so the
        // newest entry lines up with the recorded cumulative distance.
        let mut offsets = Vec::with_capacity(tail.len());
        let mut running = 0.0;
        let mut prev: Option<(Point, u64)> = None;
        for sample in tail {
            let point = Point::new(sample.longitude, sample.latitude);
            if let Some((prev_point, prev_ms)) = prev {
                let dt_s = sample.monotonic_ms.saturating_sub(prev_ms) as f64 / 1000.0;
                let step_m = Haversine.distance(prev_point, point);
                if dt_s > 0.0 && step_m <= engine.config.max_plausible_speed_mps * dt_s {
                    running += step_m;
                }
            }
            offsets.push(running);
            prev = Some((point, sample.monotonic_ms));
            engine.last_point = Some(point);
            if sample.altitude_m.is_some() {
                engine.last_altitude = sample.altitude_m;
            }
            engine.last_monotonic_ms = Some(sample.monotonic_ms);
        }
        let base = engine.distance_m - running;
        for (sample, offset) in tail.iter().zip(offsets) {
            engine.window.push_back(WindowEntry {
                monotonic_ms: sample.monotonic_ms,
                distance_m: base + offset,
            });
        }
        if let Some(last_ms) = engine.last_monotonic_ms {
            engine.prune_window(last_ms);
        }
        engine
    }

    /// Freeze the elapsed-time clock.
    pub fn pause(&mut self, at: DateTime<Utc>) {
        self.clock.pause(at);
    }

    /// Continue the elapsed-time clock.
    pub fn resume(&mut self, at: DateTime<Utc>) {
        self.clock.resume(at);
    }

    /// Active time accumulated so far, the value a recovery snapshot keeps.
    pub fn active_time_ms(&self, now: DateTime<Utc>) -> u64 {
        self.clock.elapsed_ms(now)
    }

    /// Fold one sample into the totals, or reject it.
    ///
    /// A rejected sample leaves every total untouched. An accepted sample
    /// with an implausible position jump still advances last-known
    /// position but contributes no distance.
    pub fn accept(&mut self, sample: &LocationSample) -> Result<MetricsSnapshot, SampleRejected> {
        if !(-90.0..=90.0).contains(&sample.latitude)
            || !(-180.0..=180.0).contains(&sample.longitude)
        {
            return Err(SampleRejected::CoordinatesOutOfRange {
                latitude: sample.latitude,
                longitude: sample.longitude,
            });
        }

        let accuracy = sample.accuracy_m.unwrap_or(self.config.accuracy_ceiling_m);
        if accuracy > self.config.accuracy_ceiling_m {
            return Err(SampleRejected::AccuracyExceeded {
                accuracy_m: accuracy,
                ceiling_m: self.config.accuracy_ceiling_m,
            });
        }

        if let Some(previous_ms) = self.last_monotonic_ms {
            if sample.monotonic_ms <= previous_ms {
                return Err(SampleRejected::OutOfOrder {
                    monotonic_ms: sample.monotonic_ms,
                    previous_ms,
                });
            }
        }

        let point = Point::new(sample.longitude, sample.latitude);
        if let (Some(prev_point), Some(prev_ms)) = (self.last_point, self.last_monotonic_ms) {
            let step_m = Haversine.distance(prev_point, point);
            let dt_s = (sample.monotonic_ms - prev_ms) as f64 / 1000.0;
            if step_m <= self.config.max_plausible_speed_mps * dt_s {
                self.distance_m += step_m;
                self.burn_calories(step_m, dt_s);
            } else {
                debug!(step_m, dt_s, "implausible jump excluded from distance");
            }
        }
        self.last_point = Some(point);

        if let Some(altitude) = sample.altitude_m {
            if let Some(previous) = self.last_altitude {
                let delta = altitude - previous;
                if delta > 0.0 {
                    self.elevation_gain_m += delta;
                } else if delta < 0.0 {
                    self.elevation_loss_m += -delta;
                }
            }
            self.last_altitude = Some(altitude);
        }

        self.window.push_back(WindowEntry {
            monotonic_ms: sample.monotonic_ms,
            distance_m: self.distance_m,
        });
        self.prune_window(sample.monotonic_ms);

        self.accepted += 1;
        self.last_monotonic_ms = Some(sample.monotonic_ms);
        self.last_sample_at = Some(sample.recorded_at);
        self.last_quality = GpsQuality::from_accuracy(accuracy);

        Ok(self.snapshot(sample.recorded_at))
    }

    /// Current derived view at `now`. Also used by periodic ticks so
    /// elapsed time and signal-loss degradation advance between samples.
    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let elapsed_ms = self.clock.elapsed_ms(now);
        let elapsed_s = elapsed_ms as f64 / 1000.0;
        let average_speed_mps = if elapsed_s > 0.0 && self.distance_m > 0.0 {
            Some(self.distance_m / elapsed_s)
        } else {
            None
        };
        let signal_lost = self.signal_lost(now);
        let instant_speed_mps = if signal_lost { None } else { self.instant_speed() };

        MetricsSnapshot {
            distance_m: self.distance_m,
            elapsed_ms,
            average_pace_s_per_km: average_speed_mps.and_then(pace_from_speed),
            instant_pace_s_per_km: instant_speed_mps.and_then(pace_from_speed),
            average_speed_mps,
            instant_speed_mps,
            calories_kcal: self.calories_kcal,
            elevation_gain_m: self.elevation_gain_m,
            elevation_loss_m: self.elevation_loss_m,
            gps_quality: if signal_lost {
                GpsQuality::SignalLost
            } else {
                self.last_quality
            },
            accepted_samples: self.accepted,
            last_sample_at: self.last_sample_at,
            captured_at: now,
        }
    }

    fn burn_calories(&mut self, step_m: f64, dt_s: f64) {
        if dt_s <= 0.0 {
            return;
        }
        let kmh = step_m / dt_s * 3.6;
        let met_value = if kmh < met::IDLE_THRESHOLD_KMH {
            met::IDLE
        } else {
            kmh.clamp(met::WALKING_FLOOR, met::CEILING)
        };
        self.calories_kcal += met_value * self.config.runner_weight_kg * dt_s / 3600.0;
    }

    fn instant_speed(&self) -> Option<f64> {
        if self.window.len() < 2 {
            return None;
        }
        let first = self.window.front()?;
        let last = self.window.back()?;
        let dt_s = (last.monotonic_ms - first.monotonic_ms) as f64 / 1000.0;
        if dt_s <= 0.0 {
            return None;
        }
        Some((last.distance_m - first.distance_m) / dt_s)
    }

    fn prune_window(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.config.instant_window_ms);
        while let Some(front) = self.window.front() {
            if front.monotonic_ms < horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn signal_lost(&self, now: DateTime<Utc>) -> bool {
        match self.last_sample_at {
            Some(last) => {
                now.signed_duration_since(last).num_milliseconds()
                    > self.config.signal_loss_timeout_ms as i64
            }
            None => true,
        }
    }
}
