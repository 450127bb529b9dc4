//! Core data model for the arbitration pipeline
//!
//! Everything here except [`ModelQualityRecord`](crate::quality::ModelQualityRecord)
//! is created fresh for a single run and discarded once the run result is
//! emitted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a solver backend (e.g. `anthropic/claude-3-opus`)
pub type ModelId = String;

/// Identifier of one arbitration task
pub type TaskId = String;

/// Fresh task identifier
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A unit of work. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Caller-supplied identifier
    pub id: String,
    /// Domain tag (science, math, med, econ, ...)
    pub domain: String,
    /// The problem statement
    pub text: String,
}

impl Problem {
    pub fn new(id: impl Into<String>, domain: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            text: text.into(),
        }
    }
}

/// Terminal status of one solver call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Ok,
    Timeout,
    Error,
}

impl std::fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Structured self-report a solver may attach to its answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverDetails {
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub self_checks: Vec<String>,
}

impl SolverDetails {
    pub fn is_empty(&self) -> bool {
        self.assumptions.is_empty()
            && self.risks.is_empty()
            && self.evidence.is_empty()
            && self.self_checks.is_empty()
    }
}

/// One solver's answer for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOutput {
    pub model_id: ModelId,
    /// Answer text (empty for failed calls)
    pub answer: String,
    /// Self-reported confidence in [0, 1]
    pub confidence: Option<f64>,
    /// Wall-clock latency of the call, retries included
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub status: SolverStatus,
    /// Failure description for non-ok outputs
    pub error: Option<String>,
    /// Number of attempts made (1 = no retry)
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<SolverDetails>,
}

impl SolverOutput {
    /// Successful output
    pub fn ok(model_id: impl Into<ModelId>, answer: impl Into<String>, latency: Duration) -> Self {
        Self {
            model_id: model_id.into(),
            answer: answer.into(),
            confidence: None,
            latency,
            status: SolverStatus::Ok,
            error: None,
            attempts: 1,
            details: None,
        }
    }

    /// Failed output with a terminal status
    pub fn failed(
        model_id: impl Into<ModelId>,
        status: SolverStatus,
        error: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            answer: String::new(),
            confidence: None,
            latency,
            status,
            error: Some(error.into()),
            attempts: 1,
            details: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_details(mut self, details: SolverDetails) -> Self {
        if !details.is_empty() {
            self.details = Some(details);
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == SolverStatus::Ok
    }
}

/// A group of semantically equivalent answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCluster {
    /// 0 = largest cluster
    pub cluster_id: usize,
    /// Member model ids, sorted
    pub members: Vec<ModelId>,
    /// Mean of the member embeddings
    pub centroid: Vec<f32>,
    /// Member whose answer is most similar to the rest of the cluster
    pub representative: ModelId,
}

impl SemanticCluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.members.iter().any(|m| m == model_id)
    }
}

/// Advisory decision produced by the disagreement detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    HardSelect,
    Consensus,
    Rebuttal,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardSelect => write!(f, "hard_select"),
            Self::Consensus => write!(f, "consensus"),
            Self::Rebuttal => write!(f, "rebuttal"),
        }
    }
}

/// Result of clustering one answer set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisagreementResult {
    pub num_clusters: usize,
    /// 1 − largest cluster / total answers, in [0, 1]
    pub disagreement_score: f64,
    pub recommendation: Recommendation,
    /// Clusters ordered largest first
    pub clusters: Vec<SemanticCluster>,
    /// Candidates dropped because their embedding failed
    pub excluded: Vec<ModelId>,
}

impl DisagreementResult {
    /// Cluster containing `model_id`, if it was clustered
    pub fn cluster_of(&self, model_id: &str) -> Option<&SemanticCluster> {
        self.clusters.iter().find(|c| c.contains(model_id))
    }

    pub fn dominant_cluster_size(&self) -> usize {
        self.clusters.first().map(SemanticCluster::size).unwrap_or(0)
    }
}

/// A scored and ranked candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub output: SolverOutput,
    /// Arbiter score in [0, 1]
    pub arbiter_score: f64,
    /// 1 = best
    pub rank: usize,
}

impl RankedCandidate {
    pub fn model_id(&self) -> &str {
        &self.output.model_id
    }
}

/// Merged answer from the top-K candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusAnswer {
    pub text: String,
    /// Contributors ordered by weight descending, ties by model id
    pub contributors: Vec<ModelId>,
    /// Weight per contributor, sums to 1
    pub weights: BTreeMap<ModelId, f64>,
    /// Whether the generative merge step produced the text
    pub generative: bool,
}

/// One solver's reply to the rebuttal round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuttalOutcome {
    pub model_id: ModelId,
    pub revised: SolverOutput,
    pub critique: String,
}

/// How the final answer of a run was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    HardSelect,
    ConsensusTop2,
    ConsensusTop3,
}

impl DecisionMode {
    /// Consensus mode for a given top-K
    pub fn consensus(k: usize) -> Self {
        if k >= 3 {
            Self::ConsensusTop3
        } else {
            Self::ConsensusTop2
        }
    }

    pub fn is_consensus(self) -> bool {
        !matches!(self, Self::HardSelect)
    }

    /// Coarse family used in outcome signatures
    pub fn family(self) -> &'static str {
        match self {
            Self::HardSelect => "hard",
            Self::ConsensusTop2 | Self::ConsensusTop3 => "consensus",
        }
    }
}

impl std::fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardSelect => write!(f, "hard_select"),
            Self::ConsensusTop2 => write!(f, "consensus_top2"),
            Self::ConsensusTop3 => write!(f, "consensus_top3"),
        }
    }
}

/// Compact view of a ranked candidate kept on the run result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub model_id: ModelId,
    pub score: f64,
    pub rank: usize,
}

impl From<&RankedCandidate> for RankSummary {
    fn from(candidate: &RankedCandidate) -> Self {
        Self {
            model_id: candidate.output.model_id.clone(),
            score: candidate.arbiter_score,
            rank: candidate.rank,
        }
    }
}

/// The atomic output of one full pipeline pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// 1-indexed position within the stability loop
    pub run_index: u32,
    pub decision_mode: DecisionMode,
    pub final_answer: String,
    /// Model ids whose answers were used for the final answer
    pub used_candidates: Vec<ModelId>,
    /// Disagreement reading the final decision was made on
    pub disagreement: DisagreementResult,
    pub rebuttal_ran: bool,
    pub ranking: Vec<RankSummary>,
    pub unranked: Vec<ModelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_weights: Option<BTreeMap<ModelId, f64>>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Serde adapter storing durations as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
