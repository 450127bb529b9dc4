//! Decision router: hard select, consensus or one rebuttal round.
//!
//! The router is the only branching state machine of a run:
//!
//! ```text
//! Initial ──▶ PostRebuttal ──▶ HardSelect | Consensus
//!    └─────────────────────────▶ HardSelect | Consensus
//! ```
//!
//! `PostRebuttal` can only be entered from `Initial`, so at most one
//! rebuttal round happens per task.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ArbitrationConfig;
use crate::ranking::score_gap;
use crate::types::{DecisionMode, DisagreementResult, RankedCandidate};

/// Router state within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouterState {
    /// First reading of the ranked candidates.
    Initial,
    /// Rebuttal has run; the next decision is terminal.
    PostRebuttal,
    /// Rank-1 candidate wins outright.
    HardSelect,
    /// Top-K candidates are merged.
    Consensus,
}

impl RouterState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::HardSelect | Self::Consensus)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(self) -> &'static [RouterState] {
        match self {
            Self::Initial => &[Self::PostRebuttal, Self::HardSelect, Self::Consensus],
            Self::PostRebuttal => &[Self::HardSelect, Self::Consensus],
            Self::HardSelect | Self::Consensus => &[],
        }
    }
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::PostRebuttal => write!(f, "post_rebuttal"),
            Self::HardSelect => write!(f, "hard_select"),
            Self::Consensus => write!(f, "consensus"),
        }
    }
}

/// What the pipeline should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Run the rebuttal round, then route again.
    Rebuttal,
    HardSelect,
    /// Merge the top `k` candidates.
    Consensus { k: usize },
}

impl Route {
    /// State the router moves to when taking this route.
    pub fn target(self) -> RouterState {
        match self {
            Self::Rebuttal => RouterState::PostRebuttal,
            Self::HardSelect => RouterState::HardSelect,
            Self::Consensus { .. } => RouterState::Consensus,
        }
    }

    /// Decision mode of a terminal route.
    pub fn decision_mode(self) -> Option<DecisionMode> {
        match self {
            Self::Rebuttal => None,
            Self::HardSelect => Some(DecisionMode::HardSelect),
            Self::Consensus { k } => Some(DecisionMode::consensus(k)),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rebuttal => write!(f, "rebuttal"),
            Self::HardSelect => write!(f, "hard_select"),
            Self::Consensus { k } => write!(f, "consensus_top{k}"),
        }
    }
}

/// Error for routing from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RouterState,
    pub to: RouterState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid router transition {} → {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Routing thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterPolicy {
    pub epsilon: f64,
    pub consensus_topk: usize,
    pub rebuttal_enabled: bool,
    pub hard_only: bool,
    /// Disagreement score at or above which a rebuttal is triggered
    pub rebuttal_threshold: f64,
}

impl RouterPolicy {
    pub fn from_config(config: &ArbitrationConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            consensus_topk: config.consensus_topk,
            rebuttal_enabled: config.rebuttal_enabled,
            hard_only: config.hard_only,
            rebuttal_threshold: config.disagreement_threshold,
        }
    }
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self::from_config(&ArbitrationConfig::default())
    }
}

/// Pure routing decision for `state`. Never returns `Rebuttal` outside
/// `Initial`.
pub fn decide(
    policy: &RouterPolicy,
    state: RouterState,
    ranked: &[RankedCandidate],
    disagreement: &DisagreementResult,
) -> Route {
    if policy.hard_only {
        return Route::HardSelect;
    }

    if policy.rebuttal_enabled
        && state == RouterState::Initial
        && disagreement.disagreement_score >= policy.rebuttal_threshold
    {
        return Route::Rebuttal;
    }

    match score_gap(ranked) {
        Some(gap) if gap < policy.epsilon => Route::Consensus {
            // Unvalidated configs still merge two or three answers
            k: policy.consensus_topk.clamp(2, 3).min(ranked.len()),
        },
        _ => Route::HardSelect,
    }
}

/// One recorded router move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTransition {
    pub from: RouterState,
    pub to: RouterState,
    pub disagreement_score: f64,
    pub gap: Option<f64>,
}

/// Stateful router for one run.
#[derive(Debug, Clone)]
pub struct DecisionRouter {
    policy: RouterPolicy,
    state: RouterState,
    history: Vec<RouterTransition>,
}

impl DecisionRouter {
    pub fn new(policy: RouterPolicy) -> Self {
        Self {
            policy,
            state: RouterState::Initial,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn rebuttal_ran(&self) -> bool {
        self.history.iter().any(|t| t.to == RouterState::PostRebuttal)
    }

    pub fn history(&self) -> &[RouterTransition] {
        &self.history
    }

    /// Decide and move to the next state.
    pub fn route(
        &mut self,
        ranked: &[RankedCandidate],
        disagreement: &DisagreementResult,
    ) -> Result<Route, TransitionError> {
        let route = decide(&self.policy, self.state, ranked, disagreement);
        let to = route.target();
        if !self.state.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }

        let gap = score_gap(ranked);
        info!(
            from = %self.state,
            route = %route,
            disagreement_score = disagreement.disagreement_score,
            gap = gap.unwrap_or(f64::NAN),
            "Routing decision"
        );

        self.history.push(RouterTransition {
            from: self.state,
            to,
            disagreement_score: disagreement.disagreement_score,
            gap,
        });
        self.state = to;
        Ok(route)
    }
}
