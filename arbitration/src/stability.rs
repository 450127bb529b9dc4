//! Run-to-run stability and early stopping
//!
//! Each run is reduced to an outcome signature: the decision-mode family
//! plus which previously seen final answer it semantically matches. The
//! majority share of signatures gets a 95% Wilson score interval, and the
//! early stopper halts once the interval is tight enough or every run
//! agreed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::Embedder;
use crate::embedding::cosine_similarity;
use crate::types::DecisionMode;

/// z for a two-sided 95% interval
pub const Z_95: f64 = 1.96;

/// Characters of a final answer kept as its fallback identity
const PREFIX_CHARS: usize = 200;

/// Wilson score interval for `successes` out of `total`, without continuity
/// correction. Always contains the observed proportion and stays in
/// `[0, 1]`; `total == 0` yields `(0, 1)`.
pub fn wilson_interval(successes: u32, total: u32, z: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 1.0);
    }
    let n = f64::from(total);
    let p = f64::from(successes.min(total)) / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let half = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;

    let lower = (center - half).clamp(0.0, 1.0).min(p);
    let upper = (center + half).clamp(0.0, 1.0).max(p);
    (lower, upper)
}

/// Identity of a run's decisive outcome
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutcomeSignature {
    /// "hard" or "consensus"
    pub family: String,
    /// Index of the final-answer cluster, in order of first appearance
    pub answer_cluster: usize,
}

impl OutcomeSignature {
    pub fn new(mode: DecisionMode, answer_cluster: usize) -> Self {
        Self {
            family: mode.family().to_string(),
            answer_cluster,
        }
    }
}

impl std::fmt::Display for OutcomeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.family, self.answer_cluster)
    }
}

#[derive(Debug, Clone)]
struct KnownAnswer {
    embedding: Option<Vec<f32>>,
    prefix: String,
}

/// Assigns final answers to semantic clusters across runs
#[derive(Debug, Clone)]
pub struct AnswerClusters {
    threshold: f64,
    known: Vec<KnownAnswer>,
}

impl AnswerClusters {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            known: Vec::new(),
        }
    }

    /// Number of distinct final answers seen so far
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Cluster index of `answer`, registering a new cluster when it matches
    /// none. Falls back to the lower-cased prefix when embedding fails.
    pub fn classify(&mut self, answer: &str, embedder: &dyn Embedder) -> usize {
        let prefix: String = answer.trim().to_lowercase().chars().take(PREFIX_CHARS).collect();
        let embedding = embedder.embed(answer).ok();

        let matched = self.known.iter().position(|known| match (&embedding, &known.embedding) {
            (Some(a), Some(b)) => cosine_similarity(a, b) >= self.threshold,
            _ => known.prefix == prefix,
        });

        match matched {
            Some(index) => index,
            None => {
                self.known.push(KnownAnswer { embedding, prefix });
                self.known.len() - 1
            }
        }
    }
}

/// Aggregate agreement across the runs of one problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityResult {
    /// Share of runs with the most common signature
    pub majority_rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub total_runs: u32,
    pub majority_count: u32,
    pub majority_signature: Option<OutcomeSignature>,
    /// Runs per decision mode
    pub mode_distribution: BTreeMap<DecisionMode, u32>,
}

impl StabilityResult {
    pub fn interval_width(&self) -> f64 {
        self.ci_upper - self.ci_lower
    }
}

/// Running tally of outcome signatures
#[derive(Debug, Clone, Default)]
pub struct OutcomeTally {
    signatures: Vec<OutcomeSignature>,
    modes: Vec<DecisionMode>,
}

impl OutcomeTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, mode: DecisionMode, signature: OutcomeSignature) {
        self.modes.push(mode);
        self.signatures.push(signature);
    }

    pub fn runs(&self) -> u32 {
        self.signatures.len() as u32
    }

    pub fn signatures(&self) -> &[OutcomeSignature] {
        &self.signatures
    }

    /// Most common signature and its count; ties go to the one seen first
    pub fn majority(&self) -> Option<(&OutcomeSignature, u32)> {
        let mut best: Option<(&OutcomeSignature, u32)> = None;
        for (i, signature) in self.signatures.iter().enumerate() {
            if self.signatures[..i].contains(signature) {
                continue;
            }
            let count = self.signatures.iter().filter(|s| *s == signature).count() as u32;
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((signature, count));
            }
        }
        best
    }

    pub fn stability(&self) -> StabilityResult {
        let total = self.runs();
        let (majority_signature, majority_count) = match self.majority() {
            Some((signature, count)) => (Some(signature.clone()), count),
            None => (None, 0),
        };
        let majority_rate = if total == 0 {
            0.0
        } else {
            f64::from(majority_count) / f64::from(total)
        };
        let (ci_lower, ci_upper) = wilson_interval(majority_count, total, Z_95);

        let mut mode_distribution = BTreeMap::new();
        for mode in &self.modes {
            *mode_distribution.entry(*mode).or_insert(0) += 1;
        }

        StabilityResult {
            majority_rate,
            ci_lower,
            ci_upper,
            total_runs: total,
            majority_count,
            majority_signature,
            mode_distribution,
        }
    }
}

/// Why the loop stopped or continues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Below the minimum run count or not yet converged
    Continue,
    /// Every run so far produced the same outcome
    Converged,
    /// Wilson interval narrower than the precision target
    PrecisionReached,
    /// Run budget exhausted, failed runs included
    MaxRunsReached,
    /// Caller cancelled the task
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Converged => write!(f, "converged"),
            Self::PrecisionReached => write!(f, "precision_reached"),
            Self::MaxRunsReached => write!(f, "max_runs_reached"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Verdict after one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopDecision {
    pub should_stop: bool,
    pub reason: StopReason,
    /// `max_runs − runs_so_far` when stopping, otherwise 0
    pub saved_runs: u32,
    pub runs_so_far: u32,
    pub majority_rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Early stopping policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStopper {
    pub min_runs: u32,
    pub max_runs: u32,
    /// Maximum Wilson interval width accepted as converged
    pub precision_target: f64,
}

impl EarlyStopper {
    pub fn new(min_runs: u32, max_runs: u32, precision_target: f64) -> Self {
        Self {
            min_runs,
            max_runs,
            precision_target,
        }
    }

    pub fn decide(&self, stability: &StabilityResult) -> EarlyStopDecision {
        let runs = stability.total_runs;
        let reached_min = runs >= self.min_runs;

        let reason = if reached_min && stability.majority_rate >= 1.0 {
            StopReason::Converged
        } else if reached_min && stability.interval_width() <= self.precision_target {
            StopReason::PrecisionReached
        } else if runs >= self.max_runs {
            StopReason::MaxRunsReached
        } else {
            StopReason::Continue
        };

        let should_stop = reason != StopReason::Continue;
        EarlyStopDecision {
            should_stop,
            reason,
            saved_runs: if should_stop {
                self.max_runs.saturating_sub(runs)
            } else {
                0
            },
            runs_so_far: runs,
            majority_rate: stability.majority_rate,
            ci_lower: stability.ci_lower,
            ci_upper: stability.ci_upper,
        }
    }

    /// Verdict for a loop that ended without an early stop. `attempted`
    /// counts failed runs as well.
    pub fn conclude(&self, stability: &StabilityResult, attempted: u32, cancelled: bool) -> EarlyStopDecision {
        EarlyStopDecision {
            should_stop: true,
            reason: if cancelled {
                StopReason::Cancelled
            } else {
                StopReason::MaxRunsReached
            },
            saved_runs: self.max_runs.saturating_sub(attempted),
            runs_so_far: stability.total_runs,
            majority_rate: stability.majority_rate,
            ci_lower: stability.ci_lower,
            ci_upper: stability.ci_upper,
        }
    }
}
