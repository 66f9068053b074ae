use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::types::{DailyTotals, PlatformId};
use crate::session::RunSession;

/// Failures surfaced by a platform connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("platform rate limit hit")]
    RateLimited,

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("platform rejected payload: {0}")]
    InvalidPayload(String),

    #[error("platform credentials rejected")]
    Unauthorized,
}

impl PlatformError {
    /// Transient failures are worth another attempt after backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_) | PlatformError::Timeout | PlatformError::RateLimited => true,
            PlatformError::Http { status, .. } => *status == 408 || (500..=599).contains(status),
            PlatformError::InvalidPayload(_) | PlatformError::Unauthorized => false,
        }
    }
}

/// The activity record shipped to a platform.
///
/// Carries the final aggregates only; raw GPS samples stay local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// Stable per session and platform, so a retried upload that already
    /// landed is recognized server-side as the same activity.
    pub idempotency_key: String,
    pub activity_type: String,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub distance_m: f64,
    pub average_pace_s_per_km: Option<f64>,
    pub average_speed_mps: Option<f64>,
    pub calories_kcal: Option<f64>,
    pub elevation_gain_m: Option<f64>,
    pub average_heart_rate_bpm: Option<f64>,
    pub max_heart_rate_bpm: Option<f64>,
    pub sample_count: u32,
}

impl ActivityPayload {
    pub fn from_session(session: &RunSession, platform: &PlatformId) -> Self {
        // Name the target platform inside the session's UUID namespace;
        // the same session uploaded to the same platform always carries
        // the same key.
        let idempotency_key =
            Uuid::new_v5(&session.id, platform.as_str().as_bytes()).to_string();
        Self {
            idempotency_key,
            activity_type: "running".to_string(),
            user_id: session.user_id,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_ms: session.duration_ms,
            distance_m: session.distance_m,
            average_pace_s_per_km: session.aggregates.average_pace_s_per_km,
            average_speed_mps: session.aggregates.average_speed_mps,
            calories_kcal: session.aggregates.calories_kcal,
            elevation_gain_m: session.aggregates.elevation_gain_m,
            average_heart_rate_bpm: session.aggregates.average_heart_rate_bpm,
            max_heart_rate_bpm: session.aggregates.max_heart_rate_bpm,
            sample_count: session.samples.len() as u32,
        }
    }
}

/// Connector to one external health platform.
///
/// Implementations wrap whatever transport the platform speaks; the
/// sync manager only sees uploads, in-place updates, and day totals.
pub trait HealthPlatform: Send + Sync {
    /// Platform this connector talks to.
    fn platform_id(&self) -> &PlatformId;

    /// Create the activity remotely and return its external id.
    fn upload_activity(
        &self,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<String, PlatformError>>;

    /// Overwrite an activity that already exists remotely.
    ///
    /// Local data is authoritative; whatever the platform holds under
    /// `external_id` is replaced, never merged.
    fn update_activity(
        &self,
        external_id: String,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<(), PlatformError>>;

    /// Aggregates the platform reports for one calendar day.
    fn daily_totals(&self, date: NaiveDate) -> BoxFuture<'_, Result<DailyTotals, PlatformError>>;
}
