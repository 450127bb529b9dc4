//! Decision arbitration over multi-model solver pools
//!
//! Several independent solver models answer the same problem. This crate
//! turns their answers into one final answer with a quantified confidence:
//!
//! - [`pool`]: concurrent solver fan-out with retries, a ceiling timeout
//!   and a quorum
//! - [`disagreement`]: semantic clustering of the answers and a
//!   disagreement score
//! - [`ranking`]: arbiter scoring with a deterministic tie-break
//! - [`router`]: hard select, consensus or a single rebuttal round
//! - [`consensus`]: reliability-weighted merge of the top candidates
//! - [`rebuttal`]: peer critique and revision
//! - [`quality`]: persisted per-model reliability
//! - [`stability`] and [`engine`]: repeated runs, Wilson intervals and
//!   early stopping
//!
//! Model calls, embeddings and scoring are reached only through the traits
//! in [`backend`].
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbitration::{
//!     ArbitrationConfig, ArbitrationPipeline, LexicalEmbedder, ModelClient,
//!     ModelQualityMemory, Problem, StabilityEngine,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(client: Arc<dyn ModelClient>) -> Result<(), arbitration::ArbitrationError> {
//! let config = ArbitrationConfig::for_pool("science");
//! let memory = ModelQualityMemory::load(config.out_dir.join("model_quality.json"))?.shared();
//! let embedder = Arc::new(LexicalEmbedder::default());
//! let pipeline =
//!     ArbitrationPipeline::with_model_scorer(config, client, embedder.clone(), memory, "science");
//! let engine = StabilityEngine::new(pipeline, embedder);
//!
//! let problem = Problem::new("p1", "science", "Why is the sky blue?");
//! let outcome = engine.run_task("task-1", &problem, &CancellationToken::new()).await?;
//! println!("{} ({:.2})", outcome.final_answer(), outcome.stability.majority_rate);
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod backend;
pub mod cache;
pub mod config;
pub mod consensus;
pub mod disagreement;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod prompts;
pub mod quality;
pub mod ranking;
pub mod rebuttal;
pub mod reply;
pub mod router;
pub mod stability;
pub mod types;

// Re-export capability seams
pub use backend::{
    Embedder, EmbeddingError, ModelCallError, ModelClient, ModelReply, ModelRequest, ScoreError,
    Scorer,
};

// Re-export configuration
pub use config::{ArbitrationConfig, ConfigError, PoolConfig, SolverSpec};

// Re-export core data model
pub use types::{
    new_task_id, ConsensusAnswer, DecisionMode, DisagreementResult, ModelId, Problem,
    RankedCandidate, RebuttalOutcome, Recommendation, RunResult, SemanticCluster, SolverOutput,
    SolverStatus, TaskId,
};

// Re-export components
pub use artifacts::{ArtifactError, ArtifactStore, AuditRecord, DecisionRecord};
pub use cache::{CacheConfig, CachedModelClient, CacheStats};
pub use consensus::{ConsensusSynthesizer, SynthesisError};
pub use disagreement::{DetectionError, DisagreementDetector};
pub use embedding::LexicalEmbedder;
pub use engine::{StabilityEngine, TaskOutcome};
pub use error::{ArbitrationError, ArbitrationResult};
pub use pipeline::{ArbitrationPipeline, RunOutput};
pub use pool::{CallPolicy, PoolError, PoolReport, SolverPool};
pub use quality::{MemoryError, ModelQualityMemory, ModelQualityRecord, SharedQualityMemory};
pub use ranking::{ArbiterRanker, ModelScorer, Ranking, RankingError};
pub use rebuttal::{RebuttalError, RebuttalReport, RebuttalRound};
pub use router::{DecisionRouter, Route, RouterPolicy, RouterState};
pub use stability::{
    wilson_interval, EarlyStopDecision, EarlyStopper, OutcomeSignature, OutcomeTally,
    StabilityResult, StopReason,
};
