//! Run-level error taxonomy
//!
//! Every failure surfaced to a caller names the stage it came from.

use std::time::Duration;

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::consensus::SynthesisError;
use crate::disagreement::DetectionError;
use crate::pool::PoolError;
use crate::quality::MemoryError;
use crate::ranking::RankingError;
use crate::rebuttal::RebuttalError;
use crate::router::TransitionError;

/// Error type for a pipeline run or a stability task
#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("solver pool: {0}")]
    Pool(#[from] PoolError),

    #[error("embedding: {0}")]
    Embedding(#[from] DetectionError),

    #[error("ranking: {0}")]
    Ranking(#[from] RankingError),

    #[error("routing: {0}")]
    Routing(#[from] TransitionError),

    #[error("rebuttal: {0}")]
    Rebuttal(#[from] RebuttalError),

    #[error("synthesis: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("quality memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("artifacts: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("run timed out after {0:?}")]
    RunTimeout(Duration),
}

/// Result type for pipeline runs
pub type ArbitrationResult<T> = Result<T, ArbitrationError>;

impl ArbitrationError {
    /// Short name of the failing stage
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Pool(_) => "pool",
            Self::Embedding(_) => "embedding",
            Self::Ranking(_) => "ranking",
            Self::Routing(_) => "routing",
            Self::Rebuttal(_) => "rebuttal",
            Self::Synthesis(_) => "synthesis",
            Self::Memory(_) => "memory",
            Self::Artifact(_) => "artifacts",
            Self::Config(_) => "config",
            Self::RunTimeout(_) => "timeout",
        }
    }

    pub fn is_quorum_failure(&self) -> bool {
        matches!(self, Self::Pool(PoolError::QuorumNotMet { .. }))
    }

    /// Whether the run was cut short by cancellation or a run timeout
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Pool(PoolError::Cancelled) | Self::Rebuttal(RebuttalError::Cancelled) | Self::RunTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        let quorum: ArbitrationError = PoolError::QuorumNotMet {
            ok: 0,
            required: 4,
            pool_size: 7,
            statuses: Vec::new(),
        }
        .into();
        assert_eq!(quorum.stage(), "pool");
        assert!(quorum.is_quorum_failure());
        assert!(quorum.to_string().contains("0 of 7"));

        let ranking: ArbitrationError = RankingError::AllUnscoreable(3).into();
        assert_eq!(ranking.stage(), "ranking");
        assert!(!ranking.is_quorum_failure());

        assert!(ArbitrationError::RunTimeout(Duration::from_secs(1)).is_cancellation());
    }
}
