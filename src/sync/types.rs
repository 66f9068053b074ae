use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an external health-data platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The deprecated platform historical sessions migrate away from.
    pub fn google_fit() -> Self {
        Self("google-fit".to_string())
    }

    /// The successor platform migration targets.
    pub fn health_connect() -> Self {
        Self("health-connect".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-platform sync bookkeeping carried on each session record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub synced: bool,
    pub external_id: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub attempts: u32,
}

/// What a successful sync or migration call accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The session is present on every configured target platform.
    Synced {
        external_ids: Vec<(PlatformId, String)>,
    },
    /// One-time copy of a legacy session onto the successor platform.
    Migrated {
        platform: PlatformId,
        external_id: String,
    },
}

/// Sync failures, split by how callers should react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network or platform hiccup; retried with backoff.
    #[error("transient failure syncing to {platform}: {message}")]
    Transient { platform: PlatformId, message: String },

    /// The platform refused the payload; retrying cannot help.
    #[error("platform {platform} rejected the session: {message}")]
    Rejected { platform: PlatformId, message: String },

    /// Migration requested twice; the first run already succeeded.
    #[error("session {session_id} is already migrated")]
    AlreadyMigrated { session_id: Uuid },

    /// Session provenance does not qualify for migration.
    #[error("session {session_id} is not eligible for migration: {reason}")]
    NotEligible { session_id: Uuid, reason: String },

    /// No connector is configured for the requested platform.
    #[error("no connector configured for platform {0}")]
    UnknownPlatform(PlatformId),

    /// Another attempt for the same session is still running.
    #[error("a sync attempt for session {session_id} is already in flight")]
    AttemptInFlight { session_id: Uuid },

    /// The session is missing from the repository.
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: Uuid },

    /// Storage failed while reading or recording sync state.
    #[error("storage failure during sync: {0}")]
    Storage(String),
}

/// Aggregate counters for one calendar day on one platform or locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyTotals {
    pub sessions: u32,
    pub distance_m: f64,
    pub duration_ms: u64,
    pub calories_kcal: f64,
}

/// Local and per-platform day aggregates, reported side by side.
///
/// Local numbers are authoritative; platform numbers are informational
/// and never merged into local records.
#[derive(Debug, Clone)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub local: DailyTotals,
    pub platforms: Vec<(PlatformId, Option<DailyTotals>)>,
}

/// Work item handed to the sync dispatch loop when a session completes.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Summary of one `run_migration` sweep.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub examined: u32,
    pub migrated: u32,
    pub already_migrated: u32,
    pub failed: Vec<(Uuid, String)>,
}
