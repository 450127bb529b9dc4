//! Deterministic collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use arbitration::config::{ArbitrationConfig, PoolConfig, SolverSpec};
use arbitration::prompts;
use arbitration::{ModelCallError, ModelClient, ModelReply, ModelRequest, ScoreError, Scorer};
use async_trait::async_trait;

pub const DOMAIN: &str = "science";

/// Which role a request was made for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Solver,
    Rebuttal,
    Merge,
    Other,
}

/// What a scripted model does when called
#[derive(Debug, Clone)]
pub enum Behavior {
    Answer(String),
    Fail,
    Hang,
}

pub fn answer(text: &str) -> Behavior {
    Behavior::Answer(text.to_string())
}

/// Model client replaying fixed answers per (role, model)
#[derive(Default)]
pub struct ScriptedClient {
    solver: HashMap<String, Behavior>,
    rebuttal: HashMap<String, Behavior>,
    /// Solver calls allowed to succeed before every solver call fails
    solver_budget: Option<usize>,
    /// Solver call numbers (0-based, across runs) that hang
    solver_hang: Option<Range<usize>>,
    solver_calls: AtomicUsize,
    pub calls: Mutex<Vec<(String, Role)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solver(mut self, model_id: &str, behavior: Behavior) -> Self {
        self.solver.insert(model_id.to_string(), behavior);
        self
    }

    pub fn rebuttal(mut self, model_id: &str, behavior: Behavior) -> Self {
        self.rebuttal.insert(model_id.to_string(), behavior);
        self
    }

    pub fn solver_budget(mut self, calls: usize) -> Self {
        self.solver_budget = Some(calls);
        self
    }

    pub fn hang_solver_calls(mut self, calls: Range<usize>) -> Self {
        self.solver_hang = Some(calls);
        self
    }

    pub fn count(&self, role: Role) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, r)| *r == role).count()
    }

    fn role_of(request: &ModelRequest) -> Role {
        if request.system_prompt == prompts::solver_system(DOMAIN) {
            Role::Solver
        } else if request.system_prompt == prompts::rebuttal_system(DOMAIN) {
            Role::Rebuttal
        } else if request.system_prompt.starts_with("You merge") {
            Role::Merge
        } else {
            Role::Other
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn invoke(
        &self,
        request: &ModelRequest,
        _timeout: Duration,
    ) -> Result<ModelReply, ModelCallError> {
        let role = Self::role_of(request);
        self.calls
            .lock()
            .unwrap()
            .push((request.model_id.clone(), role));

        let behavior = match role {
            Role::Solver => {
                let n = self.solver_calls.fetch_add(1, Ordering::SeqCst);
                if self.solver_budget.is_some_and(|budget| n >= budget) {
                    Behavior::Fail
                } else if self.solver_hang.as_ref().is_some_and(|hang| hang.contains(&n)) {
                    Behavior::Hang
                } else {
                    self.solver.get(&request.model_id).cloned().unwrap_or(Behavior::Fail)
                }
            }
            Role::Rebuttal => self
                .rebuttal
                .get(&request.model_id)
                .cloned()
                .unwrap_or(Behavior::Fail),
            Role::Merge | Role::Other => Behavior::Fail,
        };

        match behavior {
            Behavior::Answer(text) => {
                let body = match role {
                    Role::Rebuttal => serde_json::json!({
                        "critique": "peers overlooked the conditions",
                        "final_answer": text,
                        "confidence": 0.7,
                    }),
                    _ => serde_json::json!({ "final_answer": text, "confidence": 0.8 }),
                };
                Ok(ModelReply::text(body.to_string()))
            }
            Behavior::Fail => Err(ModelCallError::Permanent("scripted failure".into())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Scores answers from a fixed table; unknown answers get `default`
pub struct TableScorer {
    table: HashMap<String, f64>,
    default: Option<f64>,
}

impl TableScorer {
    pub fn new(entries: &[(&str, f64)]) -> Self {
        Self {
            table: entries.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
            default: None,
        }
    }

    pub fn with_default(mut self, score: f64) -> Self {
        self.default = Some(score);
        self
    }
}

#[async_trait]
impl Scorer for TableScorer {
    async fn score(&self, _problem: &str, answer: &str) -> Result<f64, ScoreError> {
        self.table
            .get(answer)
            .copied()
            .or(self.default)
            .ok_or_else(|| ScoreError::Unparseable(answer.to_string()))
    }
}

/// Config over a custom pool with short timeouts and a deterministic merge
pub fn config_for(model_ids: &[&str]) -> ArbitrationConfig {
    ArbitrationConfig {
        pool: PoolConfig {
            name: "test".to_string(),
            solvers: model_ids.iter().map(|id| SolverSpec::new(*id, 0.5)).collect(),
            arbiter_model: "arbiter".to_string(),
            synthesis_model: None,
        },
        call_timeout_secs: 5,
        arbiter_timeout_secs: 5,
        pool_timeout_secs: 30,
        retries: 1,
        retry_backoff_ms: 10,
        ..ArbitrationConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
