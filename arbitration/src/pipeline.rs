//! One full arbitration pass over a problem
//!
//! pool → detect → rank → route ⇄ (one) rebuttal → hard select | consensus
//! → quality memory update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::artifacts::AuditRecord;
use crate::backend::{Embedder, ModelClient, Scorer};
use crate::config::ArbitrationConfig;
use crate::consensus::ConsensusSynthesizer;
use crate::disagreement::DisagreementDetector;
use crate::error::{ArbitrationError, ArbitrationResult};
use crate::pool::SolverPool;
use crate::quality::SharedQualityMemory;
use crate::ranking::{ArbiterRanker, ModelScorer, Ranking, RankingError};
use crate::rebuttal::RebuttalRound;
use crate::router::{DecisionRouter, Route, RouterPolicy};
use crate::types::{
    DecisionMode, DisagreementResult, ModelId, Problem, RankSummary, RunResult, SolverOutput,
};

/// Result of one run plus its per-solver audit rows
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: RunResult,
    /// One row per solver, sorted by model id
    pub audit: Vec<AuditRecord>,
}

/// Wires the per-run components together
pub struct ArbitrationPipeline {
    config: ArbitrationConfig,
    pool: SolverPool,
    detector: DisagreementDetector,
    ranker: ArbiterRanker,
    rebuttal: RebuttalRound,
    synthesizer: ConsensusSynthesizer,
    memory: SharedQualityMemory,
}

impl ArbitrationPipeline {
    /// Build from explicit collaborators
    pub fn new(
        config: ArbitrationConfig,
        client: Arc<dyn ModelClient>,
        embedder: Arc<dyn Embedder>,
        scorer: Arc<dyn Scorer>,
        memory: SharedQualityMemory,
    ) -> Self {
        Self {
            pool: SolverPool::from_config(client.clone(), &config),
            detector: DisagreementDetector::from_config(embedder, &config),
            ranker: ArbiterRanker::from_config(scorer, &config),
            rebuttal: RebuttalRound::from_config(client.clone(), &config),
            synthesizer: ConsensusSynthesizer::from_config(memory.clone(), client, &config),
            memory,
            config,
        }
    }

    /// Build with the pool's arbiter model as the scorer
    pub fn with_model_scorer(
        config: ArbitrationConfig,
        client: Arc<dyn ModelClient>,
        embedder: Arc<dyn Embedder>,
        memory: SharedQualityMemory,
        domain: &str,
    ) -> Self {
        let scorer = Arc::new(ModelScorer::from_config(client.clone(), &config, domain));
        Self::new(config, client, embedder, scorer, memory)
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn memory(&self) -> &SharedQualityMemory {
        &self.memory
    }

    /// Execute one run. `cancel` and the configured run timeout abort
    /// outstanding calls of this run only.
    pub async fn run_once(
        &self,
        problem: &Problem,
        run_index: u32,
        cancel: &CancellationToken,
    ) -> ArbitrationResult<RunOutput> {
        let span = info_span!("run", problem_id = %problem.id, run = run_index);
        let run = self.execute(problem, run_index, cancel).instrument(span);

        match self.config.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ArbitrationError::RunTimeout(limit))?,
            None => run.await,
        }
    }

    async fn execute(
        &self,
        problem: &Problem,
        run_index: u32,
        cancel: &CancellationToken,
    ) -> ArbitrationResult<RunOutput> {
        let started = Instant::now();

        let report = self.pool.execute(problem, cancel).await?;
        let pool_outputs = report.outputs;

        let mut outputs = pool_outputs.clone();
        let mut disagreement = self.detector.detect(&outputs)?;
        let mut ranking = self.rank(problem, &outputs, &disagreement).await?;

        let mut router = DecisionRouter::new(RouterPolicy::from_config(&self.config));
        let route = loop {
            match router.route(&ranking.ranked, &disagreement)? {
                Route::Rebuttal => {
                    let rebuttal = self.rebuttal.run(problem, &outputs, cancel).await?;
                    outputs = rebuttal.outputs;
                    disagreement = self.detector.detect(&outputs)?;
                    ranking = self.rank(problem, &outputs, &disagreement).await?;
                }
                terminal => break terminal,
            }
        };

        let (decision_mode, final_answer, used, weights) = match route {
            Route::Consensus { k } => {
                let answer = self.synthesizer.synthesize(problem, ranking.top_k(k)).await?;
                (
                    DecisionMode::consensus(k),
                    answer.text,
                    answer.contributors,
                    Some(answer.weights),
                )
            }
            // Rebuttal never leaves the loop above
            Route::HardSelect | Route::Rebuttal => {
                let winner = ranking.top().ok_or(RankingError::NoCandidates)?;
                (
                    DecisionMode::HardSelect,
                    winner.output.answer.clone(),
                    vec![winner.output.model_id.clone()],
                    None,
                )
            }
        };

        self.update_memory(&ranking, &disagreement, &used)?;

        let result = RunResult {
            run_index,
            decision_mode,
            final_answer,
            used_candidates: used,
            disagreement,
            rebuttal_ran: router.rebuttal_ran(),
            ranking: ranking.ranked.iter().map(RankSummary::from).collect(),
            unranked: ranking.unranked.clone(),
            consensus_weights: weights,
            elapsed: started.elapsed(),
        };
        let audit = audit_rows(&result, &pool_outputs, &outputs, &ranking);

        info!(
            problem_id = %problem.id,
            run = run_index,
            decision_mode = %result.decision_mode,
            used = ?result.used_candidates,
            rebuttal_ran = result.rebuttal_ran,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Run complete"
        );

        Ok(RunOutput { result, audit })
    }

    /// Rank the ok outputs that survived embedding
    async fn rank(
        &self,
        problem: &Problem,
        outputs: &[SolverOutput],
        disagreement: &DisagreementResult,
    ) -> ArbitrationResult<Ranking> {
        let candidates: Vec<SolverOutput> = outputs
            .iter()
            .filter(|o| o.is_ok() && !disagreement.excluded.contains(&o.model_id))
            .cloned()
            .collect();
        Ok(self.ranker.rank(problem, &candidates).await?)
    }

    /// Outcome 1 for ranked models that contributed or share a cluster with
    /// a contributor, 0 for the other ranked models.
    fn update_memory(
        &self,
        ranking: &Ranking,
        disagreement: &DisagreementResult,
        used: &[ModelId],
    ) -> ArbitrationResult<()> {
        let winning_clusters: BTreeSet<usize> = used
            .iter()
            .filter_map(|id| disagreement.cluster_of(id))
            .map(|c| c.cluster_id)
            .collect();

        let outcomes: Vec<(ModelId, bool)> = ranking
            .ranked
            .iter()
            .map(|candidate| {
                let id = candidate.model_id();
                let in_winning_cluster = disagreement
                    .cluster_of(id)
                    .is_some_and(|c| winning_clusters.contains(&c.cluster_id));
                (id.to_string(), used.iter().any(|u| u == id) || in_winning_cluster)
            })
            .collect();

        self.memory.record_outcomes(&outcomes)?;
        Ok(())
    }
}

fn audit_rows(
    result: &RunResult,
    pool_outputs: &[SolverOutput],
    final_outputs: &[SolverOutput],
    ranking: &Ranking,
) -> Vec<AuditRecord> {
    let finals: BTreeMap<&str, &SolverOutput> =
        final_outputs.iter().map(|o| (o.model_id.as_str(), o)).collect();
    let ranks: BTreeMap<&str, (f64, usize)> = ranking
        .ranked
        .iter()
        .map(|c| (c.model_id(), (c.arbiter_score, c.rank)))
        .collect();

    let mut rows: Vec<AuditRecord> = pool_outputs
        .iter()
        .map(|original| {
            let id = original.model_id.as_str();
            let current = finals.get(id).copied().unwrap_or(original);
            let scored = ranks.get(id);
            AuditRecord {
                run_index: result.run_index,
                model_id: original.model_id.clone(),
                status: current.status,
                latency_ms: current.latency.as_millis() as u64,
                attempts: current.attempts,
                confidence: current.confidence,
                answer: current.answer.clone(),
                error: current.error.clone(),
                revised: current.is_ok() && current.answer != original.answer,
                cluster_id: result.disagreement.cluster_of(id).map(|c| c.cluster_id),
                arbiter_score: scored.map(|(score, _)| *score),
                rank: scored.map(|(_, rank)| *rank),
                used: result.used_candidates.iter().any(|u| u == id),
                decision_mode: result.decision_mode,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    rows
}
