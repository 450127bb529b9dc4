//! Model quality memory
//!
//! Process-wide reliability statistics per model, persisted between tasks
//! as a JSON file. Reads share a lock; updates take it exclusively, so
//! concurrent tasks never interleave writes to the same record.
//!
//! Reliability is the Beta(1, 1) posterior mean of the observed outcomes:
//! starting at 0.5 with no observations, each outcome `o ∈ {0, 1}` moves
//! it by `(o − r) / (n + 2)` once `n` has been incremented.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::ModelId;

/// Reliability assumed for models with no observations
pub const NEUTRAL_RELIABILITY: f64 = 0.5;

/// File name of the persisted memory inside the output directory
pub const MEMORY_FILE: &str = "model_quality.json";

/// Error type for quality memory operations
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt quality memory at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for quality memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Shared reference to ModelQualityMemory
pub type SharedQualityMemory = Arc<ModelQualityMemory>;

/// Reliability statistics for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQualityRecord {
    pub model_id: ModelId,
    /// Number of observed outcomes
    pub n: u64,
    /// Posterior mean in [0, 1]
    pub reliability: f64,
    pub updated_at: DateTime<Utc>,
}

impl ModelQualityRecord {
    pub fn new(model_id: impl Into<ModelId>) -> Self {
        Self {
            model_id: model_id.into(),
            n: 0,
            reliability: NEUTRAL_RELIABILITY,
            updated_at: Utc::now(),
        }
    }

    /// Fold one outcome into the record
    pub fn observe(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.n += 1;
        self.reliability += (outcome - self.reliability) / (self.n as f64 + 2.0);
        self.reliability = self.reliability.clamp(0.0, 1.0);
        self.updated_at = Utc::now();
    }
}

/// Keyed reliability store
#[derive(Debug, Default)]
pub struct ModelQualityMemory {
    records: RwLock<BTreeMap<ModelId, ModelQualityRecord>>,
    /// Backing file; `None` keeps the memory in process only
    path: Option<PathBuf>,
}

impl ModelQualityMemory {
    /// Memory with no backing file
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file yields an empty memory bound to
    /// that path; unreadable or malformed content is an error.
    pub fn load(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<ModelId, ModelQualityRecord>>(&raw).map_err(|e| {
                MemoryError::Corrupt {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No quality memory yet, starting empty");
                BTreeMap::new()
            }
            Err(source) => return Err(MemoryError::Io { path, source }),
        };

        info!(path = %path.display(), models = records.len(), "Loaded quality memory");
        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    /// Create a shared reference to this memory
    pub fn shared(self) -> SharedQualityMemory {
        Arc::new(self)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reliability of `model_id`, or the neutral prior if unseen
    pub fn reliability(&self, model_id: &str) -> MemoryResult<f64> {
        let records = self.records.read().map_err(|_| MemoryError::LockPoisoned)?;
        Ok(records
            .get(model_id)
            .map(|r| r.reliability)
            .unwrap_or(NEUTRAL_RELIABILITY))
    }

    /// Reliabilities for several models under one read lock
    pub fn reliabilities(&self, model_ids: &[&str]) -> MemoryResult<BTreeMap<ModelId, f64>> {
        let records = self.records.read().map_err(|_| MemoryError::LockPoisoned)?;
        Ok(model_ids
            .iter()
            .map(|id| {
                let reliability = records
                    .get(*id)
                    .map(|r| r.reliability)
                    .unwrap_or(NEUTRAL_RELIABILITY);
                (id.to_string(), reliability)
            })
            .collect())
    }

    pub fn get(&self, model_id: &str) -> MemoryResult<Option<ModelQualityRecord>> {
        let records = self.records.read().map_err(|_| MemoryError::LockPoisoned)?;
        Ok(records.get(model_id).cloned())
    }

    /// All records in model-id order
    pub fn snapshot(&self) -> MemoryResult<Vec<ModelQualityRecord>> {
        let records = self.records.read().map_err(|_| MemoryError::LockPoisoned)?;
        Ok(records.values().cloned().collect())
    }

    /// Apply one run's outcomes atomically with respect to other writers
    pub fn record_outcomes(&self, outcomes: &[(ModelId, bool)]) -> MemoryResult<()> {
        let mut records = self.records.write().map_err(|_| MemoryError::LockPoisoned)?;
        for (model_id, success) in outcomes {
            let record = records
                .entry(model_id.clone())
                .or_insert_with(|| ModelQualityRecord::new(model_id.clone()));
            record.observe(*success);
            debug!(
                model_id = %model_id,
                success,
                n = record.n,
                reliability = record.reliability,
                "Updated model reliability"
            );
        }
        Ok(())
    }

    /// Operator reset of one model. Returns whether a record existed.
    pub fn reset(&self, model_id: &str) -> MemoryResult<bool> {
        let mut records = self.records.write().map_err(|_| MemoryError::LockPoisoned)?;
        let existed = records.remove(model_id).is_some();
        info!(model_id, existed, "Reset model reliability");
        Ok(existed)
    }

    /// Operator reset of every model. Returns the number of records dropped.
    pub fn reset_all(&self) -> MemoryResult<usize> {
        let mut records = self.records.write().map_err(|_| MemoryError::LockPoisoned)?;
        let dropped = records.len();
        records.clear();
        info!(dropped, "Reset all model reliabilities");
        Ok(dropped)
    }

    /// Write the memory to its backing file via a temp file and rename.
    /// No-op for in-process memories.
    pub fn flush(&self) -> MemoryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let records = self.records.read().map_err(|_| MemoryError::LockPoisoned)?;
            serde_json::to_string_pretty(&*records).map_err(|e| MemoryError::Serialization(e.to_string()))?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| MemoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| MemoryError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| MemoryError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Flushed quality memory");
        Ok(())
    }
}
