use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single raw position fix delivered by the device sampler.
///
/// Samples are immutable once constructed. `monotonic_ms` comes from the
/// device's monotonic clock and is the authority for ordering and window
/// arithmetic; `recorded_at` is wall time for display and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub recorded_at: DateTime<Utc>,
    pub monotonic_ms: u64,
}

impl LocationSample {
    /// Create a sample, validating coordinate ranges.
    ///
    /// Latitude must be within [-90, 90] and longitude within [-180, 180];
    /// anything outside is rejected here and never stored.
    pub fn new(
        latitude: f64,
        longitude: f64,
        recorded_at: DateTime<Utc>,
        monotonic_ms: u64,
    ) -> Result<Self, SampleRejected> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(SampleRejected::CoordinatesOutOfRange {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
            altitude_m: None,
            accuracy_m: None,
            speed_mps: None,
            bearing_deg: None,
            recorded_at,
            monotonic_ms,
        })
    }

    pub fn with_altitude(mut self, meters: f64) -> Self {
        self.altitude_m = Some(meters);
        self
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_m = Some(meters);
        self
    }

    pub fn with_speed(mut self, meters_per_second: f64) -> Self {
        self.speed_mps = Some(meters_per_second);
        self
    }

    pub fn with_bearing(mut self, degrees: f64) -> Self {
        self.bearing_deg = Some(degrees);
        self
    }
}

/// Discrete GPS signal classification derived from horizontal accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpsQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    SignalLost,
}

impl GpsQuality {
    /// Map a horizontal accuracy radius to a quality bucket.
    pub fn from_accuracy(accuracy_m: f64) -> Self {
        if accuracy_m <= 5.0 {
            GpsQuality::Excellent
        } else if accuracy_m <= 10.0 {
            GpsQuality::Good
        } else if accuracy_m <= 20.0 {
            GpsQuality::Fair
        } else if accuracy_m <= 50.0 {
            GpsQuality::Poor
        } else {
            GpsQuality::SignalLost
        }
    }

    /// True for the buckets that warrant surfacing a degradation cue.
    pub fn is_degraded(&self) -> bool {
        matches!(self, GpsQuality::Poor | GpsQuality::SignalLost)
    }
}

impl std::fmt::Display for GpsQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GpsQuality::Excellent => "excellent",
            GpsQuality::Good => "good",
            GpsQuality::Fair => "fair",
            GpsQuality::Poor => "poor",
            GpsQuality::SignalLost => "signal-lost",
        };
        write!(f, "{label}")
    }
}

/// Derived metrics, recomputed on every accepted sample and on clock ticks.
///
/// Pace fields are seconds per kilometer. Instantaneous values are `None`
/// rather than zero whenever fewer than two samples fall inside the
/// trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub distance_m: f64,
    pub elapsed_ms: u64,
    pub average_pace_s_per_km: Option<f64>,
    pub instant_pace_s_per_km: Option<f64>,
    pub average_speed_mps: Option<f64>,
    pub instant_speed_mps: Option<f64>,
    pub calories_kcal: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub gps_quality: GpsQuality,
    pub accepted_samples: u32,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Snapshot for a session that has not yet accepted any sample.
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            distance_m: 0.0,
            elapsed_ms: 0,
            average_pace_s_per_km: None,
            instant_pace_s_per_km: None,
            average_speed_mps: None,
            instant_speed_mps: None,
            calories_kcal: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            gps_quality: GpsQuality::SignalLost,
            accepted_samples: 0,
            last_sample_at: None,
            captured_at: at,
        }
    }
}

/// Why a sample was dropped instead of folded into the metrics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleRejected {
    #[error("coordinates out of range: lat {latitude}, lon {longitude}")]
    CoordinatesOutOfRange { latitude: f64, longitude: f64 },

    #[error("accuracy {accuracy_m:.1}m exceeds ceiling {ceiling_m:.1}m")]
    AccuracyExceeded { accuracy_m: f64, ceiling_m: f64 },

    #[error("sample at {monotonic_ms}ms is not newer than previous at {previous_ms}ms")]
    OutOfOrder { monotonic_ms: u64, previous_ms: u64 },
}
