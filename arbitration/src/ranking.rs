//! Arbiter ranking
//!
//! Every candidate is scored independently through a [`Scorer`]. Scores
//! order the candidates best first; identical scores fall back to model id
//! order so the same inputs always produce the same rank list.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{ModelCallError, ModelClient, ModelRequest, ScoreError, Scorer};
use crate::config::ArbitrationConfig;
use crate::pool::{call_with_retry, CallPolicy};
use crate::prompts;
use crate::reply::parse_score;
use crate::types::{ModelId, Problem, RankedCandidate, SolverOutput};

/// Error type for ranking
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankingError {
    #[error("no candidates to rank")]
    NoCandidates,

    #[error("scoring failed for all {0} candidates")]
    AllUnscoreable(usize),
}

/// Result type for ranking
pub type RankingResult<T> = Result<T, RankingError>;

/// Ranked candidates plus the ones the scorer could not handle
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    /// Best first, `rank` 1..=n
    pub ranked: Vec<RankedCandidate>,
    /// Candidates excluded because scoring failed, sorted
    pub unranked: Vec<ModelId>,
}

impl Ranking {
    /// Score difference between rank 1 and rank 2
    pub fn gap(&self) -> Option<f64> {
        score_gap(&self.ranked)
    }

    pub fn top(&self) -> Option<&RankedCandidate> {
        self.ranked.first()
    }

    pub fn top_k(&self, k: usize) -> &[RankedCandidate] {
        &self.ranked[..k.min(self.ranked.len())]
    }
}

/// `score(rank 1) − score(rank 2)`; `None` with fewer than two candidates
pub fn score_gap(ranked: &[RankedCandidate]) -> Option<f64> {
    match ranked {
        [first, second, ..] => Some(first.arbiter_score - second.arbiter_score),
        _ => None,
    }
}

/// Order scored outputs by score descending then model id, assigning
/// ranks from 1.
pub fn assign_ranks(scored: Vec<(SolverOutput, f64)>) -> Vec<RankedCandidate> {
    let mut scored = scored;
    scored.sort_by(|(a, sa), (b, sb)| match sb.total_cmp(sa) {
        Ordering::Equal => a.model_id.cmp(&b.model_id),
        other => other,
    });
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (output, arbiter_score))| RankedCandidate {
            output,
            arbiter_score,
            rank: i + 1,
        })
        .collect()
}

/// Scores candidates concurrently and ranks them
pub struct ArbiterRanker {
    scorer: Arc<dyn Scorer>,
    /// Upper bound on one candidate's scoring, retries included
    timeout: Duration,
}

impl ArbiterRanker {
    pub fn new(scorer: Arc<dyn Scorer>, timeout: Duration) -> Self {
        Self { scorer, timeout }
    }

    pub fn from_config(scorer: Arc<dyn Scorer>, config: &ArbitrationConfig) -> Self {
        Self::new(scorer, config.pool_timeout())
    }

    /// Rank the `ok` candidates in `outputs`
    pub async fn rank(&self, problem: &Problem, outputs: &[SolverOutput]) -> RankingResult<Ranking> {
        let candidates: Vec<&SolverOutput> = outputs.iter().filter(|o| o.is_ok()).collect();
        if candidates.is_empty() {
            return Err(RankingError::NoCandidates);
        }

        let scores = join_all(candidates.iter().map(|output| async move {
            let scoring = self.scorer.score(&problem.text, &output.answer);
            match tokio::time::timeout(self.timeout, scoring).await {
                Ok(result) => result,
                Err(_) => Err(ScoreError::Call(ModelCallError::Timeout(self.timeout))),
            }
        }))
        .await;

        let mut scored = Vec::with_capacity(candidates.len());
        let mut unranked = Vec::new();
        for (output, result) in candidates.into_iter().zip(scores) {
            match result {
                Ok(score) if score.is_finite() => {
                    if !(0.0..=1.0).contains(&score) {
                        warn!(model_id = %output.model_id, score, "Score out of range, clamping");
                    }
                    debug!(model_id = %output.model_id, score, "Candidate scored");
                    scored.push((output.clone(), score.clamp(0.0, 1.0)));
                }
                Ok(score) => {
                    warn!(model_id = %output.model_id, score, "Non-finite score, leaving unranked");
                    unranked.push(output.model_id.clone());
                }
                Err(e) => {
                    warn!(model_id = %output.model_id, error = %e, "Scoring failed, leaving unranked");
                    unranked.push(output.model_id.clone());
                }
            }
        }
        unranked.sort();

        if scored.is_empty() {
            return Err(RankingError::AllUnscoreable(unranked.len()));
        }

        let ranked = assign_ranks(scored);
        info!(
            problem_id = %problem.id,
            ranked = ranked.len(),
            unranked = unranked.len(),
            top = %ranked[0].output.model_id,
            top_score = ranked[0].arbiter_score,
            "Candidates ranked"
        );

        Ok(Ranking { ranked, unranked })
    }
}

/// [`Scorer`] backed by an arbiter model reached through a [`ModelClient`]
pub struct ModelScorer {
    client: Arc<dyn ModelClient>,
    model_id: String,
    domain: String,
    policy: CallPolicy,
}

impl ModelScorer {
    pub fn new(
        client: Arc<dyn ModelClient>,
        model_id: impl Into<String>,
        domain: impl Into<String>,
        policy: CallPolicy,
    ) -> Self {
        Self {
            client,
            model_id: model_id.into(),
            domain: domain.into(),
            policy,
        }
    }

    /// Arbiter for `domain` using the pool's arbiter model and timeouts
    pub fn from_config(client: Arc<dyn ModelClient>, config: &ArbitrationConfig, domain: &str) -> Self {
        let policy = CallPolicy {
            call_timeout: config.arbiter_timeout(),
            ..CallPolicy::from_config(config)
        };
        Self::new(client, config.pool.arbiter_model.clone(), domain, policy)
    }
}

#[async_trait]
impl Scorer for ModelScorer {
    async fn score(&self, problem: &str, answer: &str) -> Result<f64, ScoreError> {
        let request = ModelRequest::new(
            &self.model_id,
            prompts::arbiter_system(&self.domain),
            prompts::arbiter_user(problem, answer),
        )
        .with_temperature(0.0);

        let outcome = call_with_retry(self.client.as_ref(), &request, &self.policy, |reply| {
            Ok(reply.text.clone())
        })
        .await;
        let text = outcome.result?;

        let score = parse_score(&text).ok_or_else(|| ScoreError::Unparseable(text.clone()))?;
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ScoreError::OutOfRange(score));
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelReply;
    use std::collections::HashMap;

    /// Scores answers from a fixed table; missing answers fail
    struct TableScorer(HashMap<String, f64>);

    #[async_trait]
    impl Scorer for TableScorer {
        async fn score(&self, _problem: &str, answer: &str) -> Result<f64, ScoreError> {
            self.0
                .get(answer)
                .copied()
                .ok_or_else(|| ScoreError::Unparseable(answer.to_string()))
        }
    }

    fn outputs(ids: &[&str]) -> Vec<SolverOutput> {
        ids.iter()
            .map(|id| SolverOutput::ok(*id, format!("answer {id}"), Duration::ZERO))
            .collect()
    }

    fn problem() -> Problem {
        Problem::new("p", "science", "question")
    }

    #[tokio::test]
    async fn test_ties_break_by_model_id() {
        let table = HashMap::from([
            ("answer c".to_string(), 0.8),
            ("answer a".to_string(), 0.8),
            ("answer b".to_string(), 0.9),
        ]);
        let ranker = ArbiterRanker::new(Arc::new(TableScorer(table)), Duration::from_secs(1));

        let first = ranker.rank(&problem(), &outputs(&["c", "b", "a"])).await.unwrap();
        let second = ranker.rank(&problem(), &outputs(&["a", "c", "b"])).await.unwrap();

        let ids: Vec<_> = first.ranked.iter().map(|c| c.model_id()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(first.ranked, second.ranked);
        assert_eq!(first.ranked[2].rank, 3);
        assert!((first.gap().unwrap() - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_scoring_is_unranked_not_zero() {
        let table = HashMap::from([("answer a".to_string(), 0.4), ("answer c".to_string(), f64::NAN)]);
        let ranker = ArbiterRanker::new(Arc::new(TableScorer(table)), Duration::from_secs(1));

        let ranking = ranker.rank(&problem(), &outputs(&["a", "b", "c"])).await.unwrap();
        assert_eq!(ranking.ranked.len(), 1);
        assert_eq!(ranking.unranked, vec!["b", "c"]);
        assert_eq!(ranking.gap(), None);
    }

    #[tokio::test]
    async fn test_all_unscoreable_is_an_error() {
        let ranker = ArbiterRanker::new(Arc::new(TableScorer(HashMap::new())), Duration::from_secs(1));
        let err = ranker.rank(&problem(), &outputs(&["a", "b"])).await.unwrap_err();
        assert_eq!(err, RankingError::AllUnscoreable(2));
    }

    struct FixedClient(&'static str);

    #[async_trait]
    impl ModelClient for FixedClient {
        async fn invoke(&self, _request: &ModelRequest, _timeout: Duration) -> Result<ModelReply, ModelCallError> {
            Ok(ModelReply::text(self.0))
        }
    }

    #[tokio::test]
    async fn test_model_scorer_parses_and_validates() {
        let policy = CallPolicy::default();
        let scorer = ModelScorer::new(Arc::new(FixedClient("```json\n{\"score\": 0.82}\n```")), "arb", "science", policy);
        assert_eq!(scorer.score("q", "a").await.unwrap(), 0.82);

        let scorer = ModelScorer::new(Arc::new(FixedClient("{\"score\": 7}")), "arb", "science", policy);
        assert_eq!(scorer.score("q", "a").await.unwrap_err(), ScoreError::OutOfRange(7.0));

        let scorer = ModelScorer::new(Arc::new(FixedClient("Score: -0.5")), "arb", "science", policy);
        assert_eq!(scorer.score("q", "a").await.unwrap_err(), ScoreError::OutOfRange(-0.5));

        let scorer = ModelScorer::new(Arc::new(FixedClient("no idea")), "arb", "science", policy);
        assert!(matches!(scorer.score("q", "a").await, Err(ScoreError::Unparseable(_))));
    }
}
