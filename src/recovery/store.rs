//! Crash-recovery persistence
//!
//! Keeps exactly one snapshot per user, overwritten on every accepted
//! sample, so an unplanned process death can be undone by reconstructing
//! the session from the last written image. Durability comes from the
//! record store's atomic write path; payloads above a threshold are
//! gzip-compressed, and gzip's CRC doubles as an integrity check on load.

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use crate::metrics::{LocationSample, MetricsSnapshot};
use crate::session::{HeartRateStats, SessionId, SessionPhase, UserId};
use crate::storage::{RecordStore, StoreError};
use crate::triggers::SessionGoals;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Recovery persistence tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Gzip payloads that reach the size threshold.
    pub compress: bool,
    /// Payloads smaller than this are stored as plain JSON.
    pub compression_threshold_bytes: usize,
    /// How many trailing samples the snapshot carries for reconstruction.
    pub tail_samples: usize,
    /// How often a failed write is retried while the snapshot is dirty.
    pub retry_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            compress: true,
            compression_threshold_bytes: 4096,
            tail_samples: 64,
            retry_interval_ms: 5_000,
        }
    }
}

/// Everything needed to reconstruct an in-flight session after a crash.
///
/// Shadows exactly one open session; cleared the moment that session
/// completes or is abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
    pub goals: SessionGoals,
    pub metrics: MetricsSnapshot,
    pub heart: HeartRateStats,
    /// Active time accumulated when the snapshot was taken.
    pub active_ms: u64,
    /// Total accepted samples, which may exceed the buffered tail.
    pub sample_count: u32,
    pub recent_samples: Vec<LocationSample>,
    pub last_updated: DateTime<Utc>,
}

/// Durable store for recovery snapshots, one record per user.
#[derive(Clone)]
pub struct RecoveryStore {
    store: Arc<dyn RecordStore>,
    config: RecoveryConfig,
}

impl RecoveryStore {
    pub fn new(store: Arc<dyn RecordStore>, config: RecoveryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn key(user_id: UserId) -> String {
        format!("recovery/{user_id}")
    }

    /// Idempotent overwrite of the user's snapshot. Success here means
    /// `load` will see this image even if the process dies right after.
    pub async fn persist(&self, snapshot: &RecoverySnapshot) -> Result<(), StoreError> {
        let key = Self::key(snapshot.user_id);
        let json = serde_json::to_vec(snapshot).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let payload = if self.config.compress && json.len() >= self.config.compression_threshold_bytes
        {
            compress(&json)?
        } else {
            json
        };
        self.store.put(&key, &payload).await
    }

    pub async fn load(&self, user_id: UserId) -> Result<Option<RecoverySnapshot>, StoreError> {
        let key = Self::key(user_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            decompress(&bytes).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: format!("gzip: {e}"),
            })?
        } else {
            bytes
        };
        let snapshot = serde_json::from_slice(&json).map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    /// Remove the user's snapshot, but only if it still belongs to the
    /// given session. A snapshot for a newer session stays untouched.
    pub async fn clear(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<bool, StoreError> {
        match self.load(user_id).await {
            Ok(Some(snapshot)) if snapshot.session_id == session_id => {
                self.store.delete(&Self::key(user_id)).await
            }
            Ok(Some(snapshot)) => {
                debug!(
                    %user_id,
                    stored = %snapshot.session_id,
                    requested = %session_id,
                    "skipping clear of a different session's snapshot"
                );
                Ok(false)
            }
            Ok(None) => Ok(false),
            // An unreadable record for this user is stale by definition.
            Err(StoreError::Corrupt { .. }) => self.store.delete(&Self::key(user_id)).await,
            Err(e) => Err(e),
        }
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}
