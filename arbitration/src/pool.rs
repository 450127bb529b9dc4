//! Solver pool executor
//!
//! Fans one problem out to every solver backend at once. Each call runs
//! under its own timeout with bounded retries; the fan-out as a whole is
//! joined against a ceiling deadline. Every backend yields exactly one
//! [`SolverOutput`], keyed by model id and returned in model-id order.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ModelCallError, ModelClient, ModelReply, ModelRequest};
use crate::config::{ArbitrationConfig, PoolConfig};
use crate::prompts;
use crate::reply::SolverReply;
use crate::types::{ModelId, Problem, SolverOutput, SolverStatus};

/// Error type for pool execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("quorum not met: {ok} of {pool_size} solvers answered, {required} required")]
    QuorumNotMet {
        ok: usize,
        required: usize,
        pool_size: usize,
        /// Per-solver terminal statuses, in model-id order
        statuses: Vec<(ModelId, SolverStatus)>,
    },

    #[error("solver pool is empty")]
    EmptyPool,

    #[error("solver pool cancelled")]
    Cancelled,
}

/// Result type for pool execution
pub type PoolResult<T> = Result<T, PoolError>;

/// Timeout and retry policy for a single outbound call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    pub call_timeout: Duration,
    /// Ceiling for the whole fan-out
    pub ceiling: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &ArbitrationConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            ceiling: config.pool_timeout(),
            retries: config.retries,
            backoff: config.retry_backoff(),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&ArbitrationConfig::default())
    }
}

/// Outcome of one call including retries
#[derive(Debug, Clone)]
pub(crate) struct CallOutcome<T> {
    pub result: Result<T, ModelCallError>,
    pub attempts: u32,
    pub latency: Duration,
}

/// Invoke `request` and parse the reply, retrying transient failures.
///
/// Parse failures are not retried.
pub(crate) async fn call_with_retry<T, P>(
    client: &dyn ModelClient,
    request: &ModelRequest,
    policy: &CallPolicy,
    parse: P,
) -> CallOutcome<T>
where
    P: Fn(&ModelReply) -> Result<T, ModelCallError>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let raw = match tokio::time::timeout(
            policy.call_timeout,
            client.invoke(request, policy.call_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ModelCallError::Timeout(policy.call_timeout)),
        };

        match raw {
            Ok(reply) => {
                return CallOutcome {
                    result: parse(&reply),
                    attempts,
                    latency: start.elapsed(),
                };
            }
            Err(e) if e.is_transient() && attempts <= policy.retries => {
                warn!(
                    model_id = %request.model_id,
                    attempt = attempts,
                    error = %e,
                    "Transient model failure, retrying"
                );
                tokio::time::sleep(policy.backoff * attempts).await;
            }
            Err(e) => {
                return CallOutcome {
                    result: Err(e),
                    attempts,
                    latency: start.elapsed(),
                };
            }
        }
    }
}

/// Results of a joined fan-out
#[derive(Debug)]
pub(crate) struct Gathered<T> {
    pub done: BTreeMap<ModelId, T>,
    /// Calls still outstanding when the ceiling elapsed, in model-id order
    pub unfinished: Vec<ModelId>,
    pub cancelled: bool,
}

/// Drive keyed futures concurrently until all finish, the ceiling elapses
/// or `cancel` fires. Outstanding futures are dropped (cancelled) on return.
pub(crate) async fn gather<T, Fut>(
    calls: Vec<(ModelId, Fut)>,
    ceiling: Duration,
    cancel: &CancellationToken,
) -> Gathered<T>
where
    Fut: Future<Output = T>,
{
    let mut keys: Vec<ModelId> = calls.iter().map(|(id, _)| id.clone()).collect();
    keys.sort();

    let mut pending: FuturesUnordered<_> = calls
        .into_iter()
        .map(|(id, fut)| async move { (id, fut.await) })
        .collect();

    let deadline = tokio::time::sleep(ceiling);
    tokio::pin!(deadline);

    let mut done = BTreeMap::new();
    let mut cancelled = false;

    loop {
        tokio::select! {
            next = pending.next() => match next {
                Some((id, value)) => {
                    done.insert(id, value);
                }
                None => break,
            },
            _ = &mut deadline => {
                debug!(outstanding = pending.len(), "Fan-out ceiling reached");
                break;
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
        }
    }

    let unfinished = keys
        .into_iter()
        .filter(|id| !done.contains_key(id))
        .collect();

    Gathered {
        done,
        unfinished,
        cancelled,
    }
}

/// Per-solver outputs of one pool execution
#[derive(Debug, Clone, PartialEq)]
pub struct PoolReport {
    /// One output per backend, sorted by model id
    pub outputs: Vec<SolverOutput>,
    /// Minimum ok outputs the run needed
    pub quorum: usize,
}

impl PoolReport {
    pub fn ok_outputs(&self) -> Vec<SolverOutput> {
        self.outputs.iter().filter(|o| o.is_ok()).cloned().collect()
    }

    pub fn ok_count(&self) -> usize {
        self.outputs.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &SolverOutput> {
        self.outputs.iter().filter(|o| !o.is_ok())
    }
}

/// Concurrent executor over a named pool of solver backends
pub struct SolverPool {
    client: Arc<dyn ModelClient>,
    pool: PoolConfig,
    policy: CallPolicy,
    quorum: usize,
}

impl SolverPool {
    pub fn new(client: Arc<dyn ModelClient>, pool: PoolConfig, policy: CallPolicy, quorum: usize) -> Self {
        Self {
            client,
            pool,
            policy,
            quorum,
        }
    }

    pub fn from_config(client: Arc<dyn ModelClient>, config: &ArbitrationConfig) -> Self {
        Self::new(
            client,
            config.pool.clone(),
            CallPolicy::from_config(config),
            config.quorum(),
        )
    }

    pub fn size(&self) -> usize {
        self.pool.solvers.len()
    }

    /// Invoke every solver on `problem` and enforce the quorum
    pub async fn execute(&self, problem: &Problem, cancel: &CancellationToken) -> PoolResult<PoolReport> {
        if self.pool.solvers.is_empty() {
            return Err(PoolError::EmptyPool);
        }

        info!(
            problem_id = %problem.id,
            pool = %self.pool.name,
            solvers = self.pool.solvers.len(),
            "Dispatching solver pool"
        );

        let system = prompts::solver_system(&problem.domain);
        let user = prompts::solver_user(problem);

        let calls: Vec<_> = self
            .pool
            .solvers
            .iter()
            .map(|spec| {
                let request = ModelRequest::new(&spec.model_id, &system, &user)
                    .with_temperature(spec.temperature);
                let client = self.client.as_ref();
                let policy = &self.policy;
                let fut = async move {
                    call_with_retry(client, &request, policy, SolverReply::parse).await
                };
                (spec.model_id.clone(), fut)
            })
            .collect();

        let gathered = gather(calls, self.policy.ceiling, cancel).await;
        if gathered.cancelled {
            warn!(problem_id = %problem.id, "Solver pool cancelled");
            return Err(PoolError::Cancelled);
        }

        let mut outputs: Vec<SolverOutput> = gathered
            .done
            .into_iter()
            .map(|(model_id, outcome)| to_output(model_id, outcome))
            .collect();
        outputs.extend(gathered.unfinished.into_iter().map(|model_id| {
            SolverOutput::failed(
                model_id,
                SolverStatus::Timeout,
                "pool deadline reached",
                self.policy.ceiling,
            )
        }));
        outputs.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let report = PoolReport {
            outputs,
            quorum: self.quorum,
        };

        for failed in report.failed() {
            warn!(
                model_id = %failed.model_id,
                status = %failed.status,
                error = failed.error.as_deref().unwrap_or(""),
                "Solver failed"
            );
        }

        let ok = report.ok_count();
        info!(
            problem_id = %problem.id,
            ok,
            quorum = self.quorum,
            "Solver pool complete"
        );

        if ok < self.quorum {
            return Err(PoolError::QuorumNotMet {
                ok,
                required: self.quorum,
                pool_size: report.outputs.len(),
                statuses: report
                    .outputs
                    .iter()
                    .map(|o| (o.model_id.clone(), o.status))
                    .collect(),
            });
        }

        Ok(report)
    }
}

fn to_output(model_id: ModelId, outcome: CallOutcome<SolverReply>) -> SolverOutput {
    match outcome.result {
        Ok(reply) => {
            let mut output = SolverOutput::ok(model_id, reply.answer, outcome.latency)
                .with_attempts(outcome.attempts)
                .with_details(reply.details);
            output.confidence = reply.confidence;
            output
        }
        Err(e) => {
            let status = if e.is_timeout() {
                SolverStatus::Timeout
            } else {
                SolverStatus::Error
            };
            SolverOutput::failed(model_id, status, e.to_string(), outcome.latency)
                .with_attempts(outcome.attempts)
        }
    }
}
