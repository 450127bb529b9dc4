//! Persisted decision and audit artifacts
//!
//! Layout under the output directory:
//!
//! ```text
//! <out>/model_quality.json
//! <out>/<task_id>/final.json
//! <out>/<task_id>/runs.jsonl
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ArbitrationConfig;
use crate::quality::MEMORY_FILE;
use crate::stability::{EarlyStopDecision, StabilityResult};
use crate::types::{DecisionMode, ModelId, SolverStatus, TaskId};

const DECISION_FILE: &str = "final.json";
const AUDIT_FILE: &str = "runs.jsonl";

/// Error type for artifact persistence
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for artifact persistence
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// A run of a task that failed; later runs still go ahead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub run_index: u32,
    pub stage: String,
    pub message: String,
}

/// Final decision for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: TaskId,
    pub problem_id: String,
    pub domain: String,
    pub final_answer: String,
    pub decision_mode: DecisionMode,
    pub contributors: Vec<ModelId>,
    pub stability: StabilityResult,
    pub early_stop: EarlyStopDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RunFailure>,
    pub config: ArbitrationConfig,
    pub created_at: DateTime<Utc>,
}

/// One solver's row for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_index: u32,
    pub model_id: ModelId,
    pub status: SolverStatus,
    pub latency_ms: u64,
    pub attempts: u32,
    pub confidence: Option<f64>,
    /// Answer the model ended the run with (post-rebuttal if revised)
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub revised: bool,
    pub cluster_id: Option<usize>,
    pub arbiter_score: Option<f64>,
    pub rank: Option<usize>,
    /// Whether the answer was used for the final answer
    pub used: bool,
    pub decision_mode: DecisionMode,
}

/// Writes task artifacts below a root directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the persisted quality memory
    pub fn memory_path(&self) -> PathBuf {
        self.root.join(MEMORY_FILE)
    }

    /// Directory for one task; path separators in the id are neutralised
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        let safe = if safe.is_empty() || safe.chars().all(|c| c == '.') {
            "_".to_string()
        } else {
            safe
        };
        self.root.join(safe)
    }

    fn ensure_dir(path: &Path) -> ArtifactResult<()> {
        std::fs::create_dir_all(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write `final.json` for the record's task, replacing any previous one
    pub fn write_decision(&self, record: &DecisionRecord) -> ArtifactResult<PathBuf> {
        let dir = self.task_dir(&record.task_id);
        Self::ensure_dir(&dir)?;
        let path = dir.join(DECISION_FILE);
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(task_id = %record.task_id, path = %path.display(), "Wrote decision record");
        Ok(path)
    }

    pub fn read_decision(&self, task_id: &str) -> ArtifactResult<DecisionRecord> {
        let path = self.task_dir(task_id).join(DECISION_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| ArtifactError::Io { path, source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Append audit rows to `runs.jsonl`, sorted by model id
    pub fn append_audit(&self, task_id: &str, records: &[AuditRecord]) -> ArtifactResult<()> {
        let dir = self.task_dir(task_id);
        Self::ensure_dir(&dir)?;
        let path = dir.join(AUDIT_FILE);

        let mut sorted: Vec<&AuditRecord> = records.iter().collect();
        sorted.sort_by(|a, b| (a.run_index, &a.model_id).cmp(&(b.run_index, &b.model_id)));

        let mut buf = String::new();
        for record in sorted {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let io_err = |source| ArtifactError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        file.write_all(buf.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    pub fn read_audit(&self, task_id: &str) -> ArtifactResult<Vec<AuditRecord>> {
        let path = self.task_dir(task_id).join(AUDIT_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ArtifactError::Io { path, source }),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ArtifactError::from))
            .collect()
    }
}
