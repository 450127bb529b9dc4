//! Stability engine: repeats the pipeline per problem and stops early
//! once the outcomes agree.
//!
//! Runs are strictly sequential so quality-memory updates of one run are
//! visible to the next. A failed or timed-out run is recorded and the loop
//! moves on; only cancellation, early stop or the run budget end it.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactStore, DecisionRecord, RunFailure};
use crate::backend::Embedder;
use crate::error::{ArbitrationError, ArbitrationResult};
use crate::pool::PoolError;
use crate::pipeline::ArbitrationPipeline;
use crate::stability::{
    AnswerClusters, EarlyStopDecision, EarlyStopper, OutcomeSignature, OutcomeTally, StabilityResult,
};
use crate::types::{DecisionMode, ModelId, Problem, RunResult, TaskId};

/// Everything one task produced
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub problem: Problem,
    /// Completed runs in order
    pub runs: Vec<RunResult>,
    pub signatures: Vec<OutcomeSignature>,
    pub stability: StabilityResult,
    pub early_stop: EarlyStopDecision,
    /// Index into `runs` of the run whose answer is reported
    pub chosen_run: usize,
    /// Runs started, failed ones included
    pub runs_attempted: u32,
    /// Failed runs in order, plus a trailing memory entry if the flush failed
    pub failures: Vec<RunFailure>,
}

impl TaskOutcome {
    pub fn final_run(&self) -> &RunResult {
        &self.runs[self.chosen_run]
    }

    pub fn final_answer(&self) -> &str {
        &self.final_run().final_answer
    }

    pub fn decision_mode(&self) -> DecisionMode {
        self.final_run().decision_mode
    }

    pub fn contributors(&self) -> &[ModelId] {
        &self.final_run().used_candidates
    }

    pub fn to_record(&self, config: &crate::config::ArbitrationConfig) -> DecisionRecord {
        DecisionRecord {
            task_id: self.task_id.clone(),
            problem_id: self.problem.id.clone(),
            domain: self.problem.domain.clone(),
            final_answer: self.final_answer().to_string(),
            decision_mode: self.decision_mode(),
            contributors: self.contributors().to_vec(),
            stability: self.stability.clone(),
            early_stop: self.early_stop.clone(),
            failures: self.failures.clone(),
            config: config.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Repeats the pipeline with early stopping
pub struct StabilityEngine {
    pipeline: ArbitrationPipeline,
    embedder: Arc<dyn Embedder>,
    stopper: EarlyStopper,
    artifacts: Option<ArtifactStore>,
}

impl StabilityEngine {
    pub fn new(pipeline: ArbitrationPipeline, embedder: Arc<dyn Embedder>) -> Self {
        let config = pipeline.config();
        let stopper = EarlyStopper::new(config.min_runs, config.max_runs, config.precision_target);
        Self {
            pipeline,
            embedder,
            stopper,
            artifacts: None,
        }
    }

    /// Persist audit rows and the decision record under `store`
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn pipeline(&self) -> &ArbitrationPipeline {
        &self.pipeline
    }

    /// Run up to `max_runs` passes over `problem`.
    ///
    /// Failed runs count against the budget but do not stop later runs.
    /// Returns the typed error of the first failed run if no run completed.
    /// Cancelling `cancel` aborts the current run and starts no new one.
    pub async fn run_task(
        &self,
        task_id: &str,
        problem: &Problem,
        cancel: &CancellationToken,
    ) -> ArbitrationResult<TaskOutcome> {
        let config = self.pipeline.config();
        let mut clusters = AnswerClusters::new(config.similarity_threshold);
        let mut tally = OutcomeTally::new();
        let mut runs: Vec<RunResult> = Vec::new();
        let mut failures: Vec<RunFailure> = Vec::new();
        let mut first_error: Option<ArbitrationError> = None;
        let mut attempted = 0;
        let mut decision = None;

        info!(
            task_id,
            problem_id = %problem.id,
            max_runs = self.stopper.max_runs,
            "Starting task"
        );

        for run_index in 1..=self.stopper.max_runs {
            if cancel.is_cancelled() {
                warn!(task_id, run = run_index, "Task cancelled before run");
                break;
            }
            attempted = run_index;

            let output = match self.pipeline.run_once(problem, run_index, cancel).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(
                        task_id,
                        run = run_index,
                        stage = e.stage(),
                        error = %e,
                        completed = runs.len(),
                        "Run failed"
                    );
                    failures.push(RunFailure {
                        run_index,
                        stage: e.stage().to_string(),
                        message: e.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(store) = &self.artifacts {
                store.append_audit(task_id, &output.audit)?;
            }

            let result = output.result;
            let cluster = clusters.classify(&result.final_answer, self.embedder.as_ref());
            let signature = OutcomeSignature::new(result.decision_mode, cluster);
            tally.record(result.decision_mode, signature.clone());
            runs.push(result);

            let mut verdict = self.stopper.decide(&tally.stability());
            info!(
                task_id,
                run = run_index,
                signature = %signature,
                majority_rate = verdict.majority_rate,
                ci_lower = verdict.ci_lower,
                ci_upper = verdict.ci_upper,
                reason = %verdict.reason,
                "Run tallied"
            );
            if verdict.should_stop {
                // Failed runs already spent part of the budget
                verdict.saved_runs = self.stopper.max_runs.saturating_sub(run_index);
                decision = Some(verdict);
                break;
            }
        }

        if runs.is_empty() {
            let err = first_error.unwrap_or_else(|| PoolError::Cancelled.into());
            error!(task_id, attempted, stage = err.stage(), error = %err, "No run completed");
            return Err(err);
        }

        let stability = tally.stability();
        let early_stop = decision
            .unwrap_or_else(|| self.stopper.conclude(&stability, attempted, cancel.is_cancelled()));
        let chosen_run = choose_run(tally.signatures(), stability.majority_signature.as_ref());

        if let Err(e) = self.pipeline.memory().flush() {
            error!(task_id, error = %e, "Failed to flush quality memory, keeping completed runs");
            let e = ArbitrationError::from(e);
            failures.push(RunFailure {
                run_index: attempted,
                stage: e.stage().to_string(),
                message: e.to_string(),
            });
        }

        let outcome = TaskOutcome {
            task_id: task_id.to_string(),
            problem: problem.clone(),
            runs,
            signatures: tally.signatures().to_vec(),
            stability,
            early_stop,
            chosen_run,
            runs_attempted: attempted,
            failures,
        };

        if let Some(store) = &self.artifacts {
            store.write_decision(&outcome.to_record(config))?;
        }

        info!(
            task_id,
            runs = outcome.runs.len(),
            attempted,
            failed = outcome.failures.len(),
            majority_rate = outcome.stability.majority_rate,
            saved_runs = outcome.early_stop.saved_runs,
            reason = %outcome.early_stop.reason,
            decision_mode = %outcome.decision_mode(),
            "Task complete"
        );

        Ok(outcome)
    }
}

/// Most recent run carrying the majority signature
fn choose_run(signatures: &[OutcomeSignature], majority: Option<&OutcomeSignature>) -> usize {
    majority
        .and_then(|m| signatures.iter().rposition(|s| s == m))
        .unwrap_or_else(|| signatures.len().saturating_sub(1))
}
