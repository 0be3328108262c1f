//! Model artifact persistence
//!
//! Every processed metric type leaves an audit copy of its fitted model on
//! disk. Artifacts are write-only; nothing in the worker reads them back.
//!
//! Writes go to a unique temp file in the target directory, are flushed with
//! `sync_all` and then renamed over the slot, so a reader (or a second worker
//! sharing the directory) never observes a partially written artifact.

use crate::anomaly::FittedModel;
use crate::errors::PersistError;
use crate::models::MetricType;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Serialized form of one trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub metric_type: MetricType,
    pub job_id: String,
    pub trained_at: DateTime<Utc>,
    pub model: FittedModel,
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub path: PathBuf,
    /// Hex SHA-256 of the bytes written
    pub checksum: String,
    pub size_bytes: usize,
}

/// How artifact slots are named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotNaming {
    /// `model_<metric_type>.json`, overwritten by every job
    #[default]
    MetricType,
    /// `model_<job_id>_<metric_type>.json`, one file per job
    JobAndMetricType,
}

impl SlotNaming {
    pub fn slot_name(&self, job_id: &str, metric_type: &MetricType) -> String {
        match self {
            SlotNaming::MetricType => format!("model_{}", sanitize(metric_type.as_str())),
            SlotNaming::JobAndMetricType => format!(
                "model_{}_{}",
                sanitize(job_id),
                sanitize(metric_type.as_str())
            ),
        }
    }
}

/// Destination for model artifacts
pub trait ModelStore: Send + Sync {
    fn save(&self, artifact: &ModelArtifact) -> Result<SavedArtifact, PersistError>;
}

/// Stores artifacts as JSON files in a flat directory
pub struct FileModelStore {
    dir: PathBuf,
    naming: SlotNaming,
    slot_locks: DashMap<String, Arc<Mutex<()>>>,
    tmp_counter: AtomicU64,
}

impl FileModelStore {
    /// Create the store, creating `dir` if needed
    pub fn new(dir: impl Into<PathBuf>, naming: SlotNaming) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir,
            naming,
            slot_locks: DashMap::new(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn naming(&self) -> SlotNaming {
        self.naming
    }

    /// Final path of the slot an artifact would be written to
    pub fn slot_path(&self, job_id: &str, metric_type: &MetricType) -> PathBuf {
        self.dir
            .join(format!("{}.json", self.naming.slot_name(job_id, metric_type)))
    }

    fn slot_lock(&self, slot: &str) -> Arc<Mutex<()>> {
        self.slot_locks
            .entry(slot.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the slot's mutex once no writer holds or waits on it
    fn release_slot_lock(&self, slot: &str) {
        self.slot_locks
            .remove_if(slot, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn write_atomic(&self, slot: &str, path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
        let temp_path = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            slot,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let result = write_synced(&temp_path, bytes)
            .and_then(|()| fs::rename(&temp_path, path).map_err(io_error(path)));

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

impl ModelStore for FileModelStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<SavedArtifact, PersistError> {
        let slot = self
            .naming
            .slot_name(&artifact.job_id, &artifact.metric_type);
        let path = self.slot_path(&artifact.job_id, &artifact.metric_type);
        let bytes = serde_json::to_vec(artifact)?;

        let lock = self.slot_lock(&slot);
        let written = {
            // The guarded value is (), poisoning carries no state
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.write_atomic(&slot, &path, &bytes)
        };
        drop(lock);
        self.release_slot_lock(&slot);
        written?;

        Ok(SavedArtifact {
            path,
            checksum: compute_checksum(&bytes),
            size_bytes: bytes.len(),
        })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let mut file = File::create(path).map_err(io_error(path))?;
    file.write_all(bytes).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError {
    let path = path.to_path_buf();
    move |source| PersistError::Io { path, source }
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
