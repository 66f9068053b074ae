//! # Stride
//!
//! A run-tracking session engine: live GPS metrics, crash-safe recovery,
//! coaching triggers, and health-platform sync. One worker task owns the
//! session state, so every command and sample sees a single serialized
//! timeline.
//!
//! ## Architecture Overview
//!
//! The engine consists of several components organized into modules:
//!
//! - **[`metrics`]**: Sample validation and live metric derivation
//! - **[`session`]**: Session lifecycle state machine and worker
//! - **[`triggers`]**: Cooldown-gated coaching cues over live snapshots
//! - **[`recovery`]**: Write-behind crash snapshots with resume-or-discard
//! - **[`sync`]**: Idempotent upload and migration across health platforms
//! - **[`tracker`]**: The facade wiring everything together
//!
//! ## Features
//!
//! ### 📍 Live Metrics
//! - **Sample Gatekeeping**: Accuracy ceiling, ordering, and coordinate checks
//! - **Distance and Pace**: Haversine accumulation with a trailing instant window
//! - **Plausibility Filter**: Implausible jumps move the position, not the totals
//! - **Signal Awareness**: GPS quality in every snapshot, degradation on silence
//!
//! ### 💾 Crash Recovery
//! - **Write-Behind Snapshots**: Every accepted sample shadows the open session
//! - **Atomic Persistence**: Temp file, fsync, rename; never a torn record
//! - **Explicit Resolution**: Restart offers resume or discard, never silent loss
//!
//! ### 🔄 Platform Sync
//! - **Idempotent Uploads**: Deterministic external ids, update-in-place on re-sync
//! - **Bounded Retries**: Exponential backoff with jitter, capped attempts
//! - **Legacy Migration**: One-time copy off deprecated platforms, provenance kept
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stride::{RunTracker, SessionGoals, TrackerConfig};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let tracker = RunTracker::new(TrackerConfig::default());
//!
//!     let user_id = Uuid::new_v4();
//!     let session_id = tracker.start(user_id, SessionGoals::default()).await?;
//!     println!("tracking session {session_id}");
//!
//!     // feed GPS samples via tracker.ingest(..) or tracker.attach_sampler(..)
//!
//!     let record = tracker.stop().await?;
//!     println!("ran {:.0} m", record.distance_m);
//!
//!     tracker.shutdown().await;
//!     Ok(())
//! }
//! ```

/// GPS sample validation and live metric derivation.
///
/// Accepts raw location fixes, rejects the implausible ones, and derives
/// distance, pace, speed, calories, elevation, and GPS quality.
pub mod metrics;

/// Session lifecycle management.
///
/// The pure state machine for one tracked run plus the single-writer
/// worker task that serializes every command and sample against it.
pub mod session;

/// Coaching trigger evaluation.
///
/// Deterministic, cooldown-gated cues derived from metric snapshots:
/// pace deviation, milestones, GPS degradation, and goal completion.
pub mod triggers;

/// Crash recovery persistence.
///
/// Shadows the open session with an atomically written snapshot after
/// every accepted sample and rebuilds it after a process death.
pub mod recovery;

/// Durable record storage.
///
/// A small filesystem key-value store with atomic single-record writes,
/// plus the authoritative repository of completed sessions on top.
pub mod storage;

/// Health-platform synchronization.
///
/// Pushes completed sessions to configured platforms with idempotent
/// uploads, bounded retries, and the deprecated-platform migration path.
pub mod sync;

/// The engine facade.
///
/// Wires storage, recovery, the session worker, and sync together and
/// exposes the command surface callers use.
pub mod tracker;

// Re-export the command surface
pub use tracker::{RecoveryDecision, RunTracker, TrackerStatus};

// Re-export core session types
pub use session::{CommandError, RunSession, SessionId, SessionPhase, UserId};

// Re-export live metric types
pub use metrics::{GpsQuality, LocationSample, MetricsSnapshot};

// Re-export trigger types
pub use triggers::{SessionGoals, TriggerEvent};

// Configuration file loading
pub mod config;
pub use config::TrackerConfig;
