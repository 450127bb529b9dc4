//! Rebuttal round
//!
//! Each solver with an `ok` answer sees every other solver's answer and
//! may critique them and revise its own. Solvers that fail or run out of
//! time keep their previous answer.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ModelClient, ModelRequest};
use crate::config::{ArbitrationConfig, PoolConfig};
use crate::pool::{call_with_retry, gather, CallOutcome, CallPolicy};
use crate::prompts;
use crate::reply::RebuttalReply;
use crate::types::{ModelId, Problem, RebuttalOutcome, SolverOutput};

/// Error type for the rebuttal round
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebuttalError {
    #[error("rebuttal round cancelled")]
    Cancelled,
}

/// Revised answer set after one rebuttal round
#[derive(Debug, Clone, PartialEq)]
pub struct RebuttalReport {
    /// Full output set with revisions applied, sorted by model id
    pub outputs: Vec<SolverOutput>,
    /// One outcome per solver that responded
    pub outcomes: Vec<RebuttalOutcome>,
    /// Solvers that kept their pre-rebuttal answer
    pub unchanged: Vec<ModelId>,
}

impl RebuttalReport {
    pub fn revised_count(&self) -> usize {
        self.outcomes.len()
    }
}

pub struct RebuttalRound {
    client: Arc<dyn ModelClient>,
    pool: PoolConfig,
    policy: CallPolicy,
}

impl RebuttalRound {
    pub fn new(client: Arc<dyn ModelClient>, pool: PoolConfig, policy: CallPolicy) -> Self {
        Self { client, pool, policy }
    }

    pub fn from_config(client: Arc<dyn ModelClient>, config: &ArbitrationConfig) -> Self {
        Self::new(client, config.pool.clone(), CallPolicy::from_config(config))
    }

    pub async fn run(
        &self,
        problem: &Problem,
        outputs: &[SolverOutput],
        cancel: &CancellationToken,
    ) -> Result<RebuttalReport, RebuttalError> {
        let participants: Vec<&SolverOutput> = outputs.iter().filter(|o| o.is_ok()).collect();
        info!(
            problem_id = %problem.id,
            participants = participants.len(),
            "Starting rebuttal round"
        );

        let system = prompts::rebuttal_system(&problem.domain);
        let calls: Vec<_> = participants
            .iter()
            .map(|own| {
                let peers: Vec<(&str, &str)> = participants
                    .iter()
                    .filter(|p| p.model_id != own.model_id)
                    .map(|p| (p.model_id.as_str(), p.answer.as_str()))
                    .collect();
                let request = ModelRequest::new(
                    &own.model_id,
                    &system,
                    prompts::rebuttal_user(problem, &own.answer, &peers),
                )
                .with_temperature(self.pool.temperature_of(&own.model_id));
                let client = self.client.as_ref();
                let policy = &self.policy;
                let fut = async move { call_with_retry(client, &request, policy, RebuttalReply::parse).await };
                (own.model_id.clone(), fut)
            })
            .collect();

        let gathered = gather(calls, self.policy.ceiling, cancel).await;
        if gathered.cancelled {
            warn!(problem_id = %problem.id, "Rebuttal round cancelled");
            return Err(RebuttalError::Cancelled);
        }

        let mut revised = gathered.done;
        let mut outcomes = Vec::new();
        let mut unchanged = Vec::new();
        let mut merged = Vec::with_capacity(outputs.len());

        for output in outputs {
            if !output.is_ok() {
                merged.push(output.clone());
                continue;
            }
            match revised.remove(&output.model_id) {
                Some(CallOutcome {
                    result: Ok(reply),
                    attempts,
                    latency,
                }) => {
                    let mut revision =
                        SolverOutput::ok(&output.model_id, reply.answer, latency).with_attempts(attempts);
                    revision.confidence = reply.confidence;
                    outcomes.push(RebuttalOutcome {
                        model_id: output.model_id.clone(),
                        revised: revision.clone(),
                        critique: reply.critique,
                    });
                    merged.push(revision);
                }
                Some(CallOutcome { result: Err(e), .. }) => {
                    warn!(model_id = %output.model_id, error = %e, "Rebuttal failed, keeping original answer");
                    unchanged.push(output.model_id.clone());
                    merged.push(output.clone());
                }
                None => {
                    warn!(model_id = %output.model_id, "Rebuttal timed out, keeping original answer");
                    unchanged.push(output.model_id.clone());
                    merged.push(output.clone());
                }
            }
        }

        merged.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        outcomes.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        unchanged.sort();

        info!(
            problem_id = %problem.id,
            revised = outcomes.len(),
            unchanged = unchanged.len(),
            "Rebuttal round complete"
        );

        Ok(RebuttalReport {
            outputs: merged,
            outcomes,
            unchanged,
        })
    }
}
