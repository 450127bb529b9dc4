//! Arbitration configuration
//!
//! Values come from, lowest precedence first: built-in defaults, an
//! optional TOML file, then `ARBITER_*` environment variables. The runner
//! applies command-line flags on top.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Smallest and largest supported solver pools
pub const MIN_POOL_SIZE: usize = 5;
pub const MAX_POOL_SIZE: usize = 12;

/// One solver backend in a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSpec {
    pub model_id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

impl SolverSpec {
    pub fn new(model_id: impl Into<String>, temperature: f32) -> Self {
        Self {
            model_id: model_id.into(),
            temperature,
        }
    }
}

/// A named pool of solvers plus the models used for arbitration roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub solvers: Vec<SolverSpec>,
    /// Model asked to score candidate answers
    pub arbiter_model: String,
    /// Model asked to merge consensus candidates (None = deterministic merge)
    #[serde(default)]
    pub synthesis_model: Option<String>,
}

impl PoolConfig {
    /// Built-in pool for a domain. Unknown names fall back to `science`.
    pub fn preset(name: &str) -> Self {
        const GPT4: &str = "openai/gpt-4-turbo-preview";
        const OPUS: &str = "anthropic/claude-3-opus";
        const LLAMA: &str = "meta-llama/llama-3-70b-instruct";
        const MISTRAL: &str = "mistralai/mistral-large";
        const DEEPSEEK: &str = "deepseek/deepseek-chat";
        const GEMINI: &str = "google/gemini-2.0-flash-exp";

        let (name, solvers, arbiter) = match name {
            "math" => (
                "math",
                vec![
                    SolverSpec::new(GPT4, 0.3),
                    SolverSpec::new(OPUS, 0.3),
                    SolverSpec::new("deepseek/deepseek-reasoner", 0.2),
                    SolverSpec::new(LLAMA, 0.5),
                    SolverSpec::new(MISTRAL, 0.4),
                    SolverSpec::new(GEMINI, 0.3),
                ],
                GPT4,
            ),
            "med" => (
                "med",
                vec![
                    SolverSpec::new(OPUS, 0.5),
                    SolverSpec::new(GPT4, 0.5),
                    SolverSpec::new(MISTRAL, 0.5),
                    SolverSpec::new(GEMINI, 0.5),
                    SolverSpec::new(LLAMA, 0.5),
                ],
                OPUS,
            ),
            "econ" => (
                "econ",
                vec![
                    SolverSpec::new(GPT4, 0.6),
                    SolverSpec::new(OPUS, 0.6),
                    SolverSpec::new(MISTRAL, 0.6),
                    SolverSpec::new(GEMINI, 0.6),
                    SolverSpec::new(LLAMA, 0.6),
                    SolverSpec::new(DEEPSEEK, 0.6),
                ],
                GPT4,
            ),
            _ => (
                "science",
                vec![
                    SolverSpec::new(GPT4, 0.7),
                    SolverSpec::new(OPUS, 0.7),
                    SolverSpec::new(LLAMA, 0.6),
                    SolverSpec::new(MISTRAL, 0.7),
                    SolverSpec::new(DEEPSEEK, 0.6),
                    SolverSpec::new(GEMINI, 0.7),
                    SolverSpec::new("x-ai/grok-2", 0.7),
                ],
                GPT4,
            ),
        };

        Self {
            name: name.to_string(),
            solvers,
            arbiter_model: arbiter.to_string(),
            synthesis_model: Some(arbiter.to_string()),
        }
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.solvers.iter().map(|s| s.model_id.clone()).collect()
    }

    pub fn temperature_of(&self, model_id: &str) -> f32 {
        self.solvers
            .iter()
            .find(|s| s.model_id == model_id)
            .map(|s| s.temperature)
            .unwrap_or_else(default_temperature)
    }
}

/// Full configuration surface consumed by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub pool: PoolConfig,
    /// Maximum pipeline repeats per problem
    pub max_runs: u32,
    /// Runs required before early stopping may trigger
    pub min_runs: u32,
    /// Maximum Wilson interval width accepted as converged
    pub precision_target: f64,
    /// Candidates merged in consensus mode (2 or 3)
    pub consensus_topk: usize,
    /// Arbiter score gap below which consensus is preferred
    pub epsilon: f64,
    pub rebuttal_enabled: bool,
    pub hard_only: bool,
    /// Disagreement score at or above which a rebuttal round runs
    pub disagreement_threshold: f64,
    /// Cosine similarity at or above which two answers share a cluster
    pub similarity_threshold: f64,
    /// Fraction of the pool that must answer; strict majority at 0.5
    pub min_quorum_fraction: f64,
    pub call_timeout_secs: u64,
    pub arbiter_timeout_secs: u64,
    /// Ceiling for the whole fan-out of one stage
    pub pool_timeout_secs: u64,
    /// Cancels a run that takes longer than this
    pub run_timeout_secs: Option<u64>,
    /// Retries per call after a transient failure
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub out_dir: PathBuf,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::preset("science"),
            max_runs: 5,
            min_runs: 3,
            precision_target: 0.5,
            consensus_topk: 3,
            epsilon: 0.07,
            rebuttal_enabled: true,
            hard_only: false,
            disagreement_threshold: 0.55,
            similarity_threshold: 0.6,
            min_quorum_fraction: 0.5,
            call_timeout_secs: 60,
            arbiter_timeout_secs: 30,
            pool_timeout_secs: 90,
            run_timeout_secs: None,
            retries: 1,
            retry_backoff_ms: 250,
            out_dir: PathBuf::from("./out"),
        }
    }
}

impl ArbitrationConfig {
    /// Defaults with a named pool preset
    pub fn for_pool(name: &str) -> Self {
        Self {
            pool: PoolConfig::preset(name),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `ARBITER_*` environment overrides from the process environment
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (testable without touching
    /// the process environment)
    pub fn apply_env_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> ConfigResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })
        }

        fn boolean(var: &str, value: String) -> ConfigResult<bool> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                }),
            }
        }

        if let Some(v) = lookup("ARBITER_POOL") {
            self.pool = PoolConfig::preset(v.trim());
        }
        if let Some(v) = lookup("ARBITER_REPEATS") {
            self.max_runs = parsed("ARBITER_REPEATS", v)?;
        }
        if let Some(v) = lookup("ARBITER_MIN_RUNS") {
            self.min_runs = parsed("ARBITER_MIN_RUNS", v)?;
        }
        if let Some(v) = lookup("ARBITER_PRECISION_TARGET") {
            self.precision_target = parsed("ARBITER_PRECISION_TARGET", v)?;
        }
        if let Some(v) = lookup("ARBITER_CONSENSUS_TOPK") {
            self.consensus_topk = parsed("ARBITER_CONSENSUS_TOPK", v)?;
        }
        if let Some(v) = lookup("ARBITER_EPSILON") {
            self.epsilon = parsed("ARBITER_EPSILON", v)?;
        }
        if let Some(v) = lookup("ARBITER_REBUTTAL") {
            self.rebuttal_enabled = boolean("ARBITER_REBUTTAL", v)?;
        }
        if let Some(v) = lookup("ARBITER_HARD_ONLY") {
            self.hard_only = boolean("ARBITER_HARD_ONLY", v)?;
        }
        if let Some(v) = lookup("ARBITER_DISAGREEMENT_THRESHOLD") {
            self.disagreement_threshold = parsed("ARBITER_DISAGREEMENT_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("ARBITER_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = parsed("ARBITER_SIMILARITY_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("ARBITER_MIN_QUORUM") {
            self.min_quorum_fraction = parsed("ARBITER_MIN_QUORUM", v)?;
        }
        if let Some(v) = lookup("ARBITER_CALL_TIMEOUT_SEC") {
            self.call_timeout_secs = parsed("ARBITER_CALL_TIMEOUT_SEC", v)?;
        }
        if let Some(v) = lookup("ARBITER_ARBITER_TIMEOUT_SEC") {
            self.arbiter_timeout_secs = parsed("ARBITER_ARBITER_TIMEOUT_SEC", v)?;
        }
        if let Some(v) = lookup("ARBITER_RETRIES") {
            self.retries = parsed("ARBITER_RETRIES", v)?;
        }
        if let Some(v) = lookup("ARBITER_OUT_DIR") {
            self.out_dir = PathBuf::from(v);
        }
        Ok(self)
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> ConfigResult<()> {
        let size = self.pool.solvers.len();
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&size) {
            return Err(ConfigError::Invalid(format!(
                "pool '{}' has {} solvers, expected {}..={}",
                self.pool.name, size, MIN_POOL_SIZE, MAX_POOL_SIZE
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.pool.solvers {
            if spec.model_id.trim().is_empty() {
                return Err(ConfigError::Invalid("empty solver model id".to_string()));
            }
            if !seen.insert(spec.model_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate solver model id '{}'",
                    spec.model_id
                )));
            }
        }

        if !(2..=3).contains(&self.consensus_topk) {
            return Err(ConfigError::Invalid(format!(
                "consensus_topk must be 2 or 3, got {}",
                self.consensus_topk
            )));
        }
        if self.max_runs == 0 {
            return Err(ConfigError::Invalid("max_runs must be at least 1".to_string()));
        }
        if self.min_runs > self.max_runs {
            return Err(ConfigError::Invalid(format!(
                "min_runs {} exceeds max_runs {}",
                self.min_runs, self.max_runs
            )));
        }
        if self.epsilon.is_nan() || self.epsilon < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "epsilon must be non-negative, got {}",
                self.epsilon
            )));
        }

        for (name, value) in [
            ("precision_target", self.precision_target),
            ("disagreement_threshold", self.disagreement_threshold),
            ("similarity_threshold", self.similarity_threshold),
            ("min_quorum_fraction", self.min_quorum_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.call_timeout_secs == 0 || self.pool_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Minimum number of ok solver outputs a run needs
    pub fn quorum(&self) -> usize {
        quorum_for(self.pool.solvers.len(), self.min_quorum_fraction)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn arbiter_timeout(&self) -> Duration {
        Duration::from_secs(self.arbiter_timeout_secs)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// `floor(pool_size × fraction) + 1`, clamped to `[1, pool_size]`
pub fn quorum_for(pool_size: usize, fraction: f64) -> usize {
    if pool_size == 0 {
        return 0;
    }
    let raw = (pool_size as f64 * fraction.clamp(0.0, 1.0)).floor() as usize + 1;
    raw.clamp(1, pool_size)
}
