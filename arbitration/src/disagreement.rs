//! Disagreement detection over semantic clusters
//!
//! Answers are embedded, linked when their cosine similarity reaches the
//! threshold, and grouped into connected components. The number of
//! clusters is whatever the pool's semantic spread produces.

use std::collections::BTreeMap;
use std::sync::Arc;

use petgraph::unionfind::UnionFind;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::Embedder;
use crate::config::ArbitrationConfig;
use crate::embedding::{centroid, cosine_similarity};
use crate::types::{DisagreementResult, ModelId, Recommendation, SemanticCluster, SolverOutput};

/// Error type for disagreement detection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("no ok answers to cluster")]
    NoCandidates,

    #[error("embedding failed for all {0} answers")]
    AllEmbeddingsFailed(usize),
}

/// Result type for disagreement detection
pub type DetectionResult<T> = Result<T, DetectionError>;

/// Fraction of answers outside the largest cluster, in `[0, 1]`
pub fn disagreement_score(largest: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (1.0 - largest as f64 / total as f64).clamp(0.0, 1.0)
}

/// Advisory recommendation for one disagreement reading
pub fn recommend(num_clusters: usize, score: f64, rebuttal_threshold: f64) -> Recommendation {
    if num_clusters <= 1 {
        Recommendation::HardSelect
    } else if score >= rebuttal_threshold {
        Recommendation::Rebuttal
    } else {
        Recommendation::Consensus
    }
}

/// Group `vectors` into connected components of the graph whose edges join
/// pairs with cosine similarity `>= threshold`.
///
/// `ids` must be sorted; clusters come back largest first, ties broken by
/// their smallest member, with `cluster_id` equal to the position.
pub fn cluster_embeddings(ids: &[ModelId], vectors: &[Vec<f32>], threshold: f64) -> Vec<SemanticCluster> {
    let n = ids.len().min(vectors.len());
    let mut similarity = vec![vec![1.0f64; n]; n];
    let mut components = UnionFind::<usize>::new(n);

    for i in 0..n {
        for j in (i + 1)..n {
            let sim = cosine_similarity(&vectors[i], &vectors[j]);
            similarity[i][j] = sim;
            similarity[j][i] = sim;
            if sim >= threshold {
                components.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        groups.entry(components.find(i)).or_default().push(i);
    }

    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    // Members are index-ordered, so the first member is the smallest id
    groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| ids[a[0]].cmp(&ids[b[0]])));

    groups
        .into_iter()
        .enumerate()
        .map(|(cluster_id, members)| {
            let member_vectors: Vec<&[f32]> = members.iter().map(|&i| vectors[i].as_slice()).collect();

            // Medoid: highest total similarity to the rest, first on ties
            let mut representative = members[0];
            let mut best = f64::NEG_INFINITY;
            for &i in &members {
                let total: f64 = members.iter().filter(|&&j| j != i).map(|&j| similarity[i][j]).sum();
                if total > best {
                    best = total;
                    representative = i;
                }
            }

            SemanticCluster {
                cluster_id,
                members: members.iter().map(|&i| ids[i].clone()).collect(),
                centroid: centroid(&member_vectors),
                representative: ids[representative].clone(),
            }
        })
        .collect()
}

/// Embeds ok answers and measures how fragmented they are
pub struct DisagreementDetector {
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f64,
    rebuttal_threshold: f64,
}

impl DisagreementDetector {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f64, rebuttal_threshold: f64) -> Self {
        Self {
            embedder,
            similarity_threshold,
            rebuttal_threshold,
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &ArbitrationConfig) -> Self {
        Self::new(
            embedder,
            config.similarity_threshold,
            config.disagreement_threshold,
        )
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Cluster the `ok` outputs. Failed outputs are ignored; an answer whose
    /// embedding fails is listed in `excluded`.
    pub fn detect(&self, outputs: &[SolverOutput]) -> DetectionResult<DisagreementResult> {
        let mut ok: Vec<&SolverOutput> = outputs.iter().filter(|o| o.is_ok()).collect();
        if ok.is_empty() {
            return Err(DetectionError::NoCandidates);
        }
        ok.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let mut ids = Vec::with_capacity(ok.len());
        let mut vectors = Vec::with_capacity(ok.len());
        let mut excluded = Vec::new();

        for output in &ok {
            match self.embedder.embed(&output.answer) {
                Ok(vector) => {
                    ids.push(output.model_id.clone());
                    vectors.push(vector);
                }
                Err(e) => {
                    warn!(model_id = %output.model_id, error = %e, "Embedding failed, excluding answer");
                    excluded.push(output.model_id.clone());
                }
            }
        }

        if ids.is_empty() {
            return Err(DetectionError::AllEmbeddingsFailed(ok.len()));
        }

        let clusters = cluster_embeddings(&ids, &vectors, self.similarity_threshold);
        let largest = clusters.first().map(SemanticCluster::size).unwrap_or(0);
        let score = disagreement_score(largest, ids.len());
        let recommendation = recommend(clusters.len(), score, self.rebuttal_threshold);

        for cluster in &clusters {
            debug!(
                cluster_id = cluster.cluster_id,
                size = cluster.size(),
                representative = %cluster.representative,
                "Semantic cluster"
            );
        }
        info!(
            answers = ids.len(),
            num_clusters = clusters.len(),
            disagreement_score = score,
            recommendation = %recommendation,
            "Disagreement measured"
        );

        Ok(DisagreementResult {
            num_clusters: clusters.len(),
            disagreement_score: score,
            recommendation,
            clusters,
            excluded,
        })
    }
}
