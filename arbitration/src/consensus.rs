//! Consensus synthesis over the top-K ranked candidates
//!
//! Weights are `arbiter_score × reliability`, normalized to sum to 1.
//! Candidates are always presented in (weight desc, model id) order, so
//! permuting the input does not change what the merge step sees.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{ModelClient, ModelRequest};
use crate::config::ArbitrationConfig;
use crate::pool::{call_with_retry, CallPolicy};
use crate::prompts;
use crate::quality::{MemoryError, SharedQualityMemory};
use crate::reply::SolverReply;
use crate::types::{ConsensusAnswer, ModelId, Problem, RankedCandidate};

/// Error type for consensus synthesis
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("consensus needs at least 2 candidates, got {0}")]
    TooFewCandidates(usize),

    #[error("quality memory unavailable: {0}")]
    Memory(#[from] MemoryError),
}

/// Result type for consensus synthesis
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Normalized weights for `candidates`, ordered by weight descending then
/// model id. Models missing from `reliabilities` get the neutral prior.
pub fn consensus_weights(
    candidates: &[RankedCandidate],
    reliabilities: &BTreeMap<ModelId, f64>,
) -> Vec<(ModelId, f64)> {
    let raw: Vec<(ModelId, f64)> = candidates
        .iter()
        .map(|c| {
            let reliability = reliabilities
                .get(c.model_id())
                .copied()
                .unwrap_or(crate::quality::NEUTRAL_RELIABILITY);
            let product = c.arbiter_score * reliability;
            let product = if product.is_finite() { product.max(0.0) } else { 0.0 };
            (c.model_id().to_string(), product)
        })
        .collect();

    let total: f64 = raw.iter().map(|(_, w)| w).sum();
    let mut weights: Vec<(ModelId, f64)> = if total > 0.0 {
        raw.into_iter().map(|(id, w)| (id, w / total)).collect()
    } else {
        let equal = 1.0 / raw.len().max(1) as f64;
        raw.into_iter().map(|(id, _)| (id, equal)).collect()
    };

    weights.sort_by(|(a, wa), (b, wb)| match wb.total_cmp(wa) {
        Ordering::Equal => a.cmp(b),
        other => other,
    });
    weights
}

/// Deterministic merge: every candidate's answer under its attribution
pub fn attributed_merge(weighted: &[(&str, f64, &str)]) -> String {
    weighted
        .iter()
        .map(|(model_id, weight, answer)| format!("[{model_id} · weight {weight:.3}]\n{}", answer.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Merges top-ranked candidates weighted by score and reliability
pub struct ConsensusSynthesizer {
    memory: SharedQualityMemory,
    /// Generative merge backend and model; `None` merges deterministically
    merger: Option<(Arc<dyn ModelClient>, String)>,
    policy: CallPolicy,
}

impl ConsensusSynthesizer {
    pub fn new(memory: SharedQualityMemory, policy: CallPolicy) -> Self {
        Self {
            memory,
            merger: None,
            policy,
        }
    }

    /// Use `model_id` through `client` for the generative merge step
    pub fn with_merger(mut self, client: Arc<dyn ModelClient>, model_id: impl Into<String>) -> Self {
        self.merger = Some((client, model_id.into()));
        self
    }

    pub fn from_config(
        memory: SharedQualityMemory,
        client: Arc<dyn ModelClient>,
        config: &ArbitrationConfig,
    ) -> Self {
        let synthesizer = Self::new(memory, CallPolicy::from_config(config));
        match &config.pool.synthesis_model {
            Some(model_id) => synthesizer.with_merger(client, model_id.clone()),
            None => synthesizer,
        }
    }

    /// Merge `top` (already cut to K) into one answer
    pub async fn synthesize(
        &self,
        problem: &Problem,
        top: &[RankedCandidate],
    ) -> SynthesisResult<ConsensusAnswer> {
        if top.len() < 2 {
            return Err(SynthesisError::TooFewCandidates(top.len()));
        }

        let ids: Vec<&str> = top.iter().map(RankedCandidate::model_id).collect();
        let reliabilities = self.memory.reliabilities(&ids)?;
        let weights = consensus_weights(top, &reliabilities);

        let by_id: BTreeMap<&str, &RankedCandidate> = top.iter().map(|c| (c.model_id(), c)).collect();
        let weighted: Vec<(&str, f64, &str)> = weights
            .iter()
            .filter_map(|(id, w)| by_id.get(id.as_str()).map(|c| (id.as_str(), *w, c.output.answer.as_str())))
            .collect();

        let (text, generative) = match self.generative_merge(problem, &weighted).await {
            Some(text) => (text, true),
            None => (attributed_merge(&weighted), false),
        };

        info!(
            problem_id = %problem.id,
            k = top.len(),
            generative,
            "Consensus synthesized"
        );

        Ok(ConsensusAnswer {
            text,
            contributors: weights.iter().map(|(id, _)| id.clone()).collect(),
            weights: weights.into_iter().collect(),
            generative,
        })
    }

    async fn generative_merge(&self, problem: &Problem, weighted: &[(&str, f64, &str)]) -> Option<String> {
        let (client, model_id) = self.merger.as_ref()?;
        let request = ModelRequest::new(
            model_id,
            prompts::synthesis_system(&problem.domain, weighted.len()),
            prompts::synthesis_user(problem, weighted),
        )
        .with_temperature(0.2);

        let outcome = call_with_retry(client.as_ref(), &request, &self.policy, SolverReply::parse).await;
        match outcome.result {
            Ok(reply) => Some(reply.answer),
            Err(e) => {
                warn!(model_id = %model_id, error = %e, "Generative merge failed, using attributed merge");
                None
            }
        }
    }
}
