//! Backend connection settings for the runner
//!
//! Arbitration behaviour lives in [`arbitration::ArbitrationConfig`]; this
//! only covers how to reach the OpenAI-compatible model endpoint.

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Debug, Error)]
pub enum RunnerConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("base URL must start with http:// or https://, got {0:?}")]
    InvalidBaseUrl(String),
}

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Base URL; `/chat/completions` is appended
    pub base_url: String,
    /// Bearer token, omitted from requests when unset
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl RunnerConfig {
    /// Read `ARBITER_BASE_URL`, `ARBITER_API_KEY` (falling back to
    /// `OPENROUTER_API_KEY`) and `ARBITER_MAX_TOKENS`.
    pub fn from_env() -> Result<Self, RunnerConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RunnerConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("ARBITER_BASE_URL").filter(|v| !v.trim().is_empty()) {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://")) {
            return Err(RunnerConfigError::InvalidBaseUrl(config.base_url));
        }

        config.api_key = lookup("ARBITER_API_KEY")
            .or_else(|| lookup("OPENROUTER_API_KEY"))
            .filter(|key| !key.trim().is_empty());

        if let Some(raw) = lookup("ARBITER_MAX_TOKENS") {
            config.max_tokens = raw
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(RunnerConfigError::InvalidEnv {
                    var: "ARBITER_MAX_TOKENS".to_string(),
                    value: raw,
                })?;
        }

        Ok(config)
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}
