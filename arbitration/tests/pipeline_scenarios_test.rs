//! End-to-end scenarios for a single arbitration run and for repeated
//! runs through the stability engine.
//!
//! All collaborators are deterministic: scripted model replies, the
//! built-in lexical embedder and table-driven arbiter scores.

mod common;

use std::sync::Arc;

use arbitration::{
    ArbitrationConfig, ArbitrationError, ArbitrationPipeline, ArtifactStore, DecisionMode,
    LexicalEmbedder, ModelQualityMemory, PoolError, Problem, Recommendation, ScoreError, Scorer,
    SharedQualityMemory, SolverStatus, StabilityEngine, StopReason,
};
use async_trait::async_trait;
use common::{answer, config_for, Behavior, Role, ScriptedClient, TableScorer, DOMAIN};
use mockall::mock;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

mock! {
    pub Arbiter {}

    #[async_trait]
    impl Scorer for Arbiter {
        async fn score(&self, problem: &str, answer: &str) -> Result<f64, ScoreError>;
    }
}

fn problem() -> Problem {
    Problem::new("boiling", DOMAIN, "At what temperature does water boil at sea level?")
}

fn pipeline(
    config: ArbitrationConfig,
    client: Arc<ScriptedClient>,
    scorer: Arc<dyn Scorer>,
    memory: SharedQualityMemory,
) -> ArbitrationPipeline {
    ArbitrationPipeline::new(
        config,
        client,
        Arc::new(LexicalEmbedder::default()),
        scorer,
        memory,
    )
}

// ── Near-unanimous pool with a close race (consensus) ─────────────────

const BOIL_1: &str = "Water boils at 100 C at sea level.";
const BOIL_2: &str = "water boils at 100 c at sea level";
const BOIL_3: &str = "Water boils at 100 C at sea level!";
const BOIL_4: &str = "WATER BOILS AT 100 C AT SEA LEVEL";
const DIVERGENT: &str = "Roughly ninety degrees on mountain summits";

fn near_unanimous_client() -> ScriptedClient {
    ScriptedClient::new()
        .solver("m1", answer(BOIL_1))
        .solver("m2", answer(BOIL_2))
        .solver("m3", answer(BOIL_3))
        .solver("m4", answer(BOIL_4))
        .solver("m5", answer(DIVERGENT))
}

fn close_race_scorer() -> TableScorer {
    TableScorer::new(&[
        (BOIL_1, 0.90),
        (BOIL_2, 0.87),
        (BOIL_3, 0.85),
        (BOIL_4, 0.80),
        (DIVERGENT, 0.40),
    ])
}

#[tokio::test]
async fn test_close_race_routes_to_consensus_top3() {
    common::init_tracing();
    let client = Arc::new(near_unanimous_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let config = config_for(&["m1", "m2", "m3", "m4", "m5"]);
    let pipeline = pipeline(config, client.clone(), Arc::new(close_race_scorer()), memory.clone());

    let output = pipeline
        .run_once(&problem(), 1, &CancellationToken::new())
        .await
        .unwrap();
    let result = output.result;

    assert_eq!(result.disagreement.num_clusters, 2);
    assert!((result.disagreement.disagreement_score - 0.2).abs() < 1e-9);
    assert_eq!(result.disagreement.recommendation, Recommendation::Consensus);
    assert_eq!(result.disagreement.clusters[0].size(), 4);

    assert!(!result.rebuttal_ran);
    assert_eq!(client.count(Role::Rebuttal), 0);
    assert_eq!(result.decision_mode, DecisionMode::ConsensusTop3);

    let mut used = result.used_candidates.clone();
    used.sort();
    assert_eq!(used, vec!["m1", "m2", "m3"]);

    let weights = result.consensus_weights.as_ref().unwrap();
    let total: f64 = weights.values().sum();
    assert!((total - 1.0).abs() < 1e-9);
    // Fresh memory: every contributor is neutral, so weights are equal
    for weight in weights.values() {
        assert!((weight - 1.0 / 3.0).abs() < 1e-9);
    }
    assert!(result.final_answer.contains(BOIL_1));
    assert!(!result.final_answer.contains(DIVERGENT));
}

#[tokio::test]
async fn test_consensus_run_updates_quality_memory() {
    let client = Arc::new(near_unanimous_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let config = config_for(&["m1", "m2", "m3", "m4", "m5"]);
    let pipeline = pipeline(config, client, Arc::new(close_race_scorer()), memory.clone());

    pipeline
        .run_once(&problem(), 1, &CancellationToken::new())
        .await
        .unwrap();

    // The whole winning cluster is credited, the outlier is not
    for id in ["m1", "m2", "m3", "m4"] {
        let record = memory.get(id).unwrap().unwrap();
        assert_eq!(record.n, 1);
        assert!(record.reliability > 0.5, "{id}: {}", record.reliability);
    }
    let outlier = memory.get("m5").unwrap().unwrap();
    assert!(outlier.reliability < 0.5);
}

#[tokio::test]
async fn test_audit_rows_cover_every_solver_in_model_order() {
    let client = Arc::new(near_unanimous_client().solver("m5", Behavior::Fail));
    let memory = ModelQualityMemory::in_memory().shared();
    let config = config_for(&["m5", "m3", "m1", "m4", "m2"]);
    let pipeline = pipeline(config, client, Arc::new(close_race_scorer()), memory);

    let output = pipeline
        .run_once(&problem(), 7, &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = output.audit.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "m5"]);
    assert!(output.audit.iter().all(|r| r.run_index == 7));

    let failed = &output.audit[4];
    assert_eq!(failed.status, SolverStatus::Error);
    assert!(failed.rank.is_none());
    assert!(!failed.used);
    assert!(output.result.ranking.iter().all(|r| r.model_id != "m5"));
}

// ── Arbiter is consulted once per candidate ───────────────────────────

#[tokio::test]
async fn test_hard_only_scores_each_candidate_once() {
    let client = Arc::new(near_unanimous_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let mut config = config_for(&["m1", "m2", "m3", "m4", "m5"]);
    config.hard_only = true;

    let mut arbiter = MockArbiter::new();
    arbiter
        .expect_score()
        .times(5)
        .returning(|_, answer| Ok(if answer == DIVERGENT { 0.95 } else { 0.5 }));

    let pipeline = pipeline(config, client, Arc::new(arbiter), memory);
    let result = pipeline
        .run_once(&problem(), 1, &CancellationToken::new())
        .await
        .unwrap()
        .result;

    // hard_only ignores the close race and the cluster majority
    assert_eq!(result.decision_mode, DecisionMode::HardSelect);
    assert_eq!(result.used_candidates, vec!["m5"]);
    assert_eq!(result.final_answer, DIVERGENT);
}

#[tokio::test]
async fn test_unscoreable_candidates_are_left_unranked() {
    let client = Arc::new(near_unanimous_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let config = config_for(&["m1", "m2", "m3", "m4", "m5"]);

    let mut arbiter = MockArbiter::new();
    arbiter.expect_score().returning(|_, answer| {
        if answer == BOIL_2 {
            Err(ScoreError::Unparseable("no number".into()))
        } else if answer == BOIL_1 {
            Ok(0.9)
        } else {
            Ok(0.3)
        }
    });

    let pipeline = pipeline(config, client, Arc::new(arbiter), memory);
    let result = pipeline
        .run_once(&problem(), 1, &CancellationToken::new())
        .await
        .unwrap()
        .result;

    assert_eq!(result.unranked, vec!["m2"]);
    assert_eq!(result.ranking.len(), 4);
    assert_eq!(result.decision_mode, DecisionMode::HardSelect);
    assert_eq!(result.final_answer, BOIL_1);
}

// ── Total pool failure (quorum) ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_all_solvers_timing_out_fails_quorum_without_touching_memory() {
    let ids = ["t1", "t2", "t3", "t4", "t5", "t6", "t7"];
    let client = ids
        .iter()
        .fold(ScriptedClient::new(), |client, id| client.solver(id, Behavior::Hang));
    let client = Arc::new(client);

    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let memory = ModelQualityMemory::load(store.memory_path()).unwrap().shared();
    let config = config_for(&ids);

    let engine = StabilityEngine::new(
        pipeline(config, client.clone(), Arc::new(TableScorer::new(&[])), memory.clone()),
        Arc::new(LexicalEmbedder::default()),
    )
    .with_artifacts(store.clone());

    let err = engine
        .run_task("all-timeout", &problem(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_quorum_failure());
    assert_eq!(err.stage(), "pool");
    match err {
        ArbitrationError::Pool(PoolError::QuorumNotMet {
            ok,
            required,
            pool_size,
            statuses,
        }) => {
            assert_eq!((ok, required, pool_size), (0, 4, 7));
            assert_eq!(statuses.len(), 7);
            assert!(statuses.iter().all(|(_, s)| *s == SolverStatus::Timeout));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Every run fails the same way: one retry per solver after the first timeout
    assert_eq!(client.count(Role::Solver), 5 * 14);
    assert!(memory.snapshot().unwrap().is_empty());
    assert!(!store.memory_path().exists());
    assert!(store.read_audit("all-timeout").unwrap().is_empty());
}

#[tokio::test]
async fn test_quorum_met_with_minority_failures() {
    // 3 of 5 answer; quorum for 5 is 3
    let client = Arc::new(
        near_unanimous_client()
            .solver("m4", Behavior::Fail)
            .solver("m5", Behavior::Fail),
    );
    let memory = ModelQualityMemory::in_memory().shared();
    let config = config_for(&["m1", "m2", "m3", "m4", "m5"]);
    let pipeline = pipeline(config, client, Arc::new(close_race_scorer()), memory.clone());

    let result = pipeline
        .run_once(&problem(), 1, &CancellationToken::new())
        .await
        .unwrap()
        .result;

    assert_eq!(result.disagreement.num_clusters, 1);
    assert_eq!(result.ranking.len(), 3);
    // Failed solvers are not scored and not recorded
    assert!(memory.get("m4").unwrap().is_none());
    assert!(memory.get("m5").unwrap().is_none());
}

// ── High disagreement (single rebuttal round) ─────────────────────────

const SPREAD: [(&str, &str); 10] = [
    ("s00", "rayleigh scattering of sunlight"),
    ("s01", "ocean reflection tints everything"),
    ("s02", "ozone absorbs crimson wavelengths"),
    ("s03", "nitrogen glows after lightning"),
    ("s04", "dust particles diffract violet"),
    ("s05", "mie theory explains overcast haze"),
    ("s06", "cosmic background radiation leaks"),
    ("s07", "human retina prefers cyan hues"),
    ("s08", "water vapour emits sapphire photons"),
    ("s09", "volcanic sulfur paints stratosphere"),
];

fn spread_ids() -> Vec<&'static str> {
    SPREAD.iter().map(|(id, _)| *id).collect()
}

fn spread_client() -> ScriptedClient {
    SPREAD
        .iter()
        .fold(ScriptedClient::new(), |client, (id, text)| client.solver(id, answer(text)))
}

fn spread_scorer() -> TableScorer {
    TableScorer::new(&[(SPREAD[0].1, 0.95), (SPREAD[1].1, 0.60)]).with_default(0.30)
}

fn sky_problem() -> Problem {
    Problem::new("sky", DOMAIN, "Why is the sky blue?")
}

#[tokio::test]
async fn test_stubborn_pool_runs_exactly_one_rebuttal_then_terminates() {
    // Every model defends its own answer, disagreement stays at 0.9
    let client = SPREAD
        .iter()
        .fold(spread_client(), |client, (id, text)| client.rebuttal(id, answer(text)));
    let client = Arc::new(client);
    let memory = ModelQualityMemory::in_memory().shared();
    let pipeline = pipeline(
        config_for(&spread_ids()),
        client.clone(),
        Arc::new(spread_scorer()),
        memory,
    );

    let output = pipeline
        .run_once(&sky_problem(), 1, &CancellationToken::new())
        .await
        .unwrap();
    let result = output.result;

    assert!(result.rebuttal_ran);
    assert_eq!(client.count(Role::Rebuttal), 10);
    assert_eq!(result.disagreement.num_clusters, 10);
    assert!((result.disagreement.disagreement_score - 0.9).abs() < 1e-9);
    assert_eq!(result.disagreement.recommendation, Recommendation::Rebuttal);

    assert_eq!(result.decision_mode, DecisionMode::HardSelect);
    assert_eq!(result.used_candidates, vec!["s00"]);
    assert!(output.audit.iter().all(|r| !r.revised));
}

#[tokio::test]
async fn test_rebuttal_convergence_is_used_downstream() {
    let converged = "Rayleigh scattering of sunlight by air molecules";
    let client = SPREAD
        .iter()
        .fold(spread_client(), |client, (id, _)| client.rebuttal(id, answer(converged)));
    let client = Arc::new(client);
    let memory = ModelQualityMemory::in_memory().shared();
    let pipeline = pipeline(
        config_for(&spread_ids()),
        client.clone(),
        Arc::new(spread_scorer()),
        memory,
    );

    let output = pipeline
        .run_once(&sky_problem(), 1, &CancellationToken::new())
        .await
        .unwrap();
    let result = output.result;

    assert!(result.rebuttal_ran);
    assert_eq!(client.count(Role::Rebuttal), 10);
    assert_eq!(result.disagreement.num_clusters, 1);
    assert_eq!(result.disagreement.disagreement_score, 0.0);
    // Identical revised answers score identically: consensus over the top 3
    assert_eq!(result.decision_mode, DecisionMode::ConsensusTop3);
    assert!(result.final_answer.contains(converged));
    assert!(output.audit.iter().all(|r| r.revised && r.answer == converged));
}

#[tokio::test]
async fn test_rebuttal_disabled_goes_straight_to_selection() {
    let client = Arc::new(spread_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let mut config = config_for(&spread_ids());
    config.rebuttal_enabled = false;
    let pipeline = pipeline(config, client.clone(), Arc::new(spread_scorer()), memory);

    let result = pipeline
        .run_once(&sky_problem(), 1, &CancellationToken::new())
        .await
        .unwrap()
        .result;

    assert!(!result.rebuttal_ran);
    assert_eq!(client.count(Role::Rebuttal), 0);
    assert_eq!(result.final_answer, SPREAD[0].1);
}

#[tokio::test]
async fn test_failed_rebuttals_keep_original_answers() {
    // No rebuttal scripts: every rebuttal call fails
    let client = Arc::new(spread_client());
    let memory = ModelQualityMemory::in_memory().shared();
    let pipeline = pipeline(
        config_for(&spread_ids()),
        client,
        Arc::new(spread_scorer()),
        memory,
    );

    let output = pipeline
        .run_once(&sky_problem(), 1, &CancellationToken::new())
        .await
        .unwrap();

    assert!(output.result.rebuttal_ran);
    assert_eq!(output.result.final_answer, SPREAD[0].1);
    assert!(output.audit.iter().all(|r| r.status == SolverStatus::Ok && !r.revised));
}

// ── Repeated runs (stability engine) ──────────────────────────────────

fn unanimous_client() -> ScriptedClient {
    ["u1", "u2", "u3", "u4", "u5"]
        .iter()
        .fold(ScriptedClient::new(), |client, id| client.solver(id, answer(BOIL_1)))
}

fn engine_for(
    client: Arc<ScriptedClient>,
    config: ArbitrationConfig,
    store: &ArtifactStore,
) -> StabilityEngine {
    let memory = ModelQualityMemory::load(store.memory_path()).unwrap().shared();
    let embedder = Arc::new(LexicalEmbedder::default());
    let pipeline = ArbitrationPipeline::new(
        config,
        client,
        embedder.clone(),
        Arc::new(TableScorer::new(&[]).with_default(0.8)),
        memory,
    );
    StabilityEngine::new(pipeline, embedder).with_artifacts(store.clone())
}

#[tokio::test]
async fn test_identical_runs_stop_early_after_minimum() {
    let client = Arc::new(unanimous_client());
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let config = config_for(&["u1", "u2", "u3", "u4", "u5"]);
    assert_eq!((config.min_runs, config.max_runs), (3, 5));

    let engine = engine_for(client.clone(), config, &store);
    let outcome = engine
        .run_task("unanimous", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(client.count(Role::Solver), 15);
    assert!(outcome.early_stop.should_stop);
    assert_eq!(outcome.early_stop.reason, StopReason::Converged);
    assert_eq!(outcome.early_stop.saved_runs, 2);
    assert_eq!(outcome.stability.majority_rate, 1.0);
    assert_eq!(outcome.stability.total_runs, 3);
    assert!(outcome.stability.ci_lower > 0.4 && outcome.stability.ci_upper == 1.0);
    // Equal scores make every run a consensus over the same three models
    assert_eq!(outcome.decision_mode(), DecisionMode::ConsensusTop3);
    assert!(outcome.final_answer().contains(BOIL_1));
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.runs_attempted, 3);
}

#[tokio::test]
async fn test_task_artifacts_are_persisted() {
    let client = Arc::new(unanimous_client());
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let config = config_for(&["u1", "u2", "u3", "u4", "u5"]);
    let engine = engine_for(client, config.clone(), &store);

    let outcome = engine
        .run_task("persisted", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    let record = store.read_decision("persisted").unwrap();
    assert_eq!(record.final_answer, outcome.final_answer());
    assert_eq!(record.problem_id, "boiling");
    assert_eq!(record.config, config);
    assert_eq!(record.early_stop.saved_runs, 2);

    let rows = store.read_audit("persisted").unwrap();
    assert_eq!(rows.len(), 15);
    let keys: Vec<(u32, &str)> = rows.iter().map(|r| (r.run_index, r.model_id.as_str())).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    // Memory is flushed once the task ends and survives a reload
    let reloaded = ModelQualityMemory::load(store.memory_path()).unwrap();
    let record = reloaded.get("u1").unwrap().unwrap();
    assert_eq!(record.n, 3);
    assert!(record.reliability > 0.5);
}

#[tokio::test]
async fn test_failed_runs_do_not_stop_later_runs() {
    // Run 1 consumes the first five solver calls, every later run finds all solvers failing
    let client = Arc::new(unanimous_client().solver_budget(5));
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let engine = engine_for(client.clone(), config_for(&["u1", "u2", "u3", "u4", "u5"]), &store);

    let outcome = engine
        .run_task("flaky", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.runs_attempted, 5);
    assert_eq!(client.count(Role::Solver), 25);
    let failed: Vec<u32> = outcome.failures.iter().map(|f| f.run_index).collect();
    assert_eq!(failed, vec![2, 3, 4, 5]);
    assert!(outcome.failures.iter().all(|f| f.stage == "pool"));
    assert!(outcome.final_answer().contains(BOIL_1));

    assert!(outcome.early_stop.should_stop);
    assert_eq!(outcome.early_stop.reason, StopReason::MaxRunsReached);
    assert_eq!(outcome.early_stop.runs_so_far, 1);
    assert_eq!(outcome.early_stop.saved_runs, 0);

    let record = store.read_decision("flaky").unwrap();
    assert_eq!(record.failures.len(), 4);
    assert_eq!(record.early_stop.reason, StopReason::MaxRunsReached);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_only_cancels_that_run() {
    // Run 2's five solver calls hang past the run deadline
    let client = Arc::new(unanimous_client().hang_solver_calls(5..10));
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let mut config = config_for(&["u1", "u2", "u3", "u4", "u5"]);
    config.run_timeout_secs = Some(2);
    let engine = engine_for(client.clone(), config, &store);

    let outcome = engine
        .run_task("slow-run", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].run_index, 2);
    assert_eq!(outcome.failures[0].stage, "timeout");

    // Runs 3 and 4 still happen and the task converges on three completed runs
    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(outcome.runs_attempted, 4);
    assert_eq!(client.count(Role::Solver), 20);
    assert_eq!(outcome.early_stop.reason, StopReason::Converged);
    assert_eq!(outcome.early_stop.runs_so_far, 3);
    assert_eq!(outcome.early_stop.saved_runs, 1);

    // Audit rows exist only for completed runs
    let runs: std::collections::BTreeSet<u32> =
        store.read_audit("slow-run").unwrap().iter().map(|r| r.run_index).collect();
    assert_eq!(runs.into_iter().collect::<Vec<_>>(), vec![1, 3, 4]);
}

#[tokio::test]
async fn test_memory_flush_failure_keeps_outcome() {
    let client = Arc::new(unanimous_client());
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path().join("out"));
    // A directory squatting on the memory file makes the final rename fail
    let memory_path = dir.path().join("blocked.json");
    let memory = ModelQualityMemory::load(&memory_path).unwrap().shared();
    std::fs::create_dir(&memory_path).unwrap();

    let embedder = Arc::new(LexicalEmbedder::default());
    let pipeline = ArbitrationPipeline::new(
        config_for(&["u1", "u2", "u3", "u4", "u5"]),
        client,
        embedder.clone(),
        Arc::new(TableScorer::new(&[]).with_default(0.8)),
        memory,
    );
    let engine = StabilityEngine::new(pipeline, embedder).with_artifacts(store.clone());

    let outcome = engine
        .run_task("unflushed", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "memory");
    assert_eq!(outcome.failures[0].run_index, 3);

    let record = store.read_decision("unflushed").unwrap();
    assert_eq!(record.final_answer, outcome.final_answer());
    assert_eq!(record.failures, outcome.failures);
}

#[tokio::test]
async fn test_cancelled_task_runs_nothing() {
    let client = Arc::new(unanimous_client());
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let engine = engine_for(client.clone(), config_for(&["u1", "u2", "u3", "u4", "u5"]), &store);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.run_task("cancelled", &problem(), &cancel).await.unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(client.count(Role::Solver), 0);
}

#[tokio::test]
async fn test_single_run_budget() {
    let client = Arc::new(unanimous_client());
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let mut config = config_for(&["u1", "u2", "u3", "u4", "u5"]);
    config.max_runs = 1;
    config.min_runs = 1;
    let engine = engine_for(client, config, &store);

    let outcome = engine
        .run_task("once", &problem(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.early_stop.saved_runs, 0);
    assert!(outcome.early_stop.should_stop);
}
