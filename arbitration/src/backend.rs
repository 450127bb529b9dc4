//! External capability seams
//!
//! The pipeline never talks to a model provider directly. Solvers,
//! rebuttals and the generative merge go through [`ModelClient`]; the
//! disagreement detector goes through [`Embedder`]; the arbiter ranker
//! goes through [`Scorer`]. All three are black boxes that may fail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single prompt sent to one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(
        model_id: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.7,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Raw model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    pub confidence: Option<f64>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// Failure of one model call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelCallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

impl ModelCallError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Model-call capability: `invoke(model, prompt, timeout) -> text | failure`
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Invoke a model. Implementations should honour `timeout` themselves;
    /// callers additionally enforce it.
    async fn invoke(
        &self,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelReply, ModelCallError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn invoke(
        &self,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelReply, ModelCallError> {
        (**self).invoke(request, timeout).await
    }
}

/// Failure to embed a text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    #[error("nothing to embed")]
    EmptyInput,

    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// Embedding capability: `embed(text) -> fixed-length vector`.
///
/// Must be deterministic for identical input within a run.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text)
    }
}

/// Failure to score an answer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("scoring call failed: {0}")]
    Call(#[from] ModelCallError),

    #[error("score out of range: {0}")]
    OutOfRange(f64),

    #[error("no score in reply: {0}")]
    Unparseable(String),
}

/// Scoring capability: `score(problem, answer) -> [0, 1] | failure`
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, problem: &str, answer: &str) -> Result<f64, ScoreError>;
}

#[async_trait]
impl<T: Scorer + ?Sized> Scorer for Arc<T> {
    async fn score(&self, problem: &str, answer: &str) -> Result<f64, ScoreError> {
        (**self).score(problem, answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ModelCallError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ModelCallError::Transient("503".into()).is_transient());
        assert!(!ModelCallError::Permanent("401".into()).is_transient());
        assert!(!ModelCallError::Malformed("empty".into()).is_transient());
    }
}
