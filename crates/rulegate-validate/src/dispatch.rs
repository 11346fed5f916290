use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use rulegate_core::chunk::Chunk;
use rulegate_core::select::ModelChoice;
use rulegate_core::{Criticality, Rule, Settings, TaskState, Verdict};

use crate::engine::{CompletionService, InvocationError};
use crate::parse::parse_verdict;
use crate::prompt::{build_prompt, clarify_prompt};
use crate::retry::{RetryPolicy, Stop};

/// One rule evaluated against one chunk.
#[derive(Debug, Clone)]
pub struct ValidationTask {
    pub rule: Arc<Rule>,
    pub chunk: Chunk,
    pub total_chunks: usize,
    pub choice: Arc<ModelChoice>,
    pub tree: Arc<str>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrency: usize,
    /// Bound on a single model invocation, not on the whole task
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
    pub short_circuit: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            task_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            short_circuit: false,
        }
    }
}

impl From<&Settings> for DispatchConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            task_timeout: Duration::from_secs(settings.task_timeout_secs.max(1)),
            retry: RetryPolicy::from(settings),
            short_circuit: settings.short_circuit,
        }
    }
}

/// Runs validation tasks concurrently, bounded by a fair semaphore.
pub struct Dispatcher {
    completion: Arc<dyn CompletionService>,
    limiter: Arc<Semaphore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(completion: Arc<dyn CompletionService>, config: DispatchConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            completion,
            limiter: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Evaluate every task and return one verdict per task, in task order.
    /// Returns only once every task has reached a terminal state.
    pub async fn dispatch(&self, tasks: Vec<ValidationTask>, cancel: &CancellationToken) -> Vec<Verdict> {
        let low_cancel = cancel.child_token();
        let mut keys = Vec::with_capacity(tasks.len());
        let mut set = JoinSet::new();

        for (slot, task) in tasks.into_iter().enumerate() {
            keys.push((task.rule.id.clone(), task.chunk.index, task.rule.criticality));
            transition(&task.rule.id, task.chunk.index, TaskState::Pending);

            let token = if task.rule.criticality == Criticality::Low {
                low_cancel.clone()
            } else {
                cancel.clone()
            };
            let worker = Worker {
                completion: Arc::clone(&self.completion),
                limiter: Arc::clone(&self.limiter),
                timeout: self.config.task_timeout,
                retry: self.config.retry.clone(),
            };
            set.spawn(async move { (slot, worker.run(task, token).await) });
        }

        let mut slots: Vec<Option<Verdict>> = vec![None; keys.len()];

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, verdict)) => {
                    let decided_failure = !verdict.undetermined && !verdict.compliant;
                    if self.config.short_circuit
                        && decided_failure
                        && keys[slot].2 == Criticality::High
                        && !low_cancel.is_cancelled()
                    {
                        tracing::info!(
                            rule = %verdict.rule_id,
                            "high-criticality rule failed, cancelling outstanding low-criticality tasks"
                        );
                        low_cancel.cancel();
                    }
                    slots[slot] = Some(verdict);
                }
                Err(e) => tracing::error!(error = %e, "validation task aborted"),
            }
        }

        slots
            .into_iter()
            .zip(keys)
            .map(|(verdict, (rule_id, chunk, _))| {
                verdict.unwrap_or_else(|| {
                    Verdict::undetermined(&rule_id, chunk, "validation task aborted", None, 0)
                })
            })
            .collect()
    }
}

fn transition(rule: &str, chunk: usize, state: TaskState) {
    tracing::debug!(rule, chunk, state = ?state, "task state");
}

struct Worker {
    completion: Arc<dyn CompletionService>,
    limiter: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Worker {
    /// One model call: wait for a permit, then invoke under the timeout.
    /// The permit is released as soon as the call returns.
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String, InvocationError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| InvocationError::Permanent("dispatcher closed".to_string()))?;

        match tokio::time::timeout(self.timeout, self.completion.complete(model, prompt)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationError::Timeout(self.timeout)),
        }
    }

    async fn run(&self, task: ValidationTask, cancel: CancellationToken) -> Verdict {
        let rule_id = task.rule.id.as_str();
        let chunk = task.chunk.index;

        let cancelled = |attempts: u32| {
            transition(rule_id, chunk, TaskState::Undetermined);
            Verdict::cancelled(rule_id, chunk, "validation cancelled before a verdict was reached", attempts)
        };
        let undetermined = |reason: String, model: Option<&str>, attempts: u32| {
            tracing::warn!(rule = rule_id, chunk, attempts, reason = %reason, "verdict undetermined");
            transition(rule_id, chunk, TaskState::Undetermined);
            Verdict::undetermined(rule_id, chunk, reason, model, attempts)
        };

        if cancel.is_cancelled() {
            return cancelled(0);
        }

        let prompt = build_prompt(&task.rule, &task.chunk, task.total_chunks, &task.tree);
        let prompt = prompt.as_str();
        let primary = task.choice.primary.as_str();
        transition(rule_id, chunk, TaskState::Dispatched);

        let (result, mut attempts) = self
            .retry
            .run(&cancel, move |attempt| {
                if attempt > 1 {
                    transition(rule_id, chunk, TaskState::Retrying);
                }
                self.invoke(primary, prompt)
            })
            .await;

        let (model, raw) = match result {
            Ok(raw) => (primary, raw),
            Err(Stop::Cancelled) => return cancelled(attempts),
            Err(Stop::Failed(err)) => {
                let Some(fallback) = task.choice.next_fallback() else {
                    return undetermined(format!("model {primary} failed: {err}"), Some(primary), attempts);
                };
                tracing::warn!(
                    rule = rule_id,
                    chunk,
                    model = primary,
                    fallback,
                    attempts,
                    error = %err,
                    "primary model failed, trying fallback"
                );
                transition(rule_id, chunk, TaskState::Retrying);

                let (second, n) = RetryPolicy::once()
                    .run(&cancel, move |_| self.invoke(fallback, prompt))
                    .await;
                attempts += n;
                match second {
                    Ok(raw) => (fallback, raw),
                    Err(Stop::Cancelled) => return cancelled(attempts),
                    Err(Stop::Failed(fallback_err)) => {
                        return undetermined(
                            format!("model {primary} failed: {err}; fallback {fallback} failed: {fallback_err}"),
                            Some(fallback),
                            attempts,
                        )
                    }
                }
            }
        };

        let problem = match parse_verdict(&raw) {
            Ok(parsed) => {
                transition(rule_id, chunk, TaskState::VerdictOk);
                return Verdict::decided(rule_id, chunk, parsed.compliant, parsed.evidence, model, attempts);
            }
            Err(problem) => problem,
        };

        tracing::warn!(rule = rule_id, chunk, model, error = %problem, "unusable model output, asking again");
        transition(rule_id, chunk, TaskState::Retrying);
        let follow_up = clarify_prompt(prompt, &raw, &problem.to_string());
        let follow_up = follow_up.as_str();

        let (second, n) = RetryPolicy::once()
            .run(&cancel, move |_| self.invoke(model, follow_up))
            .await;
        attempts += n;

        match second {
            Ok(raw) => match parse_verdict(&raw) {
                Ok(parsed) => {
                    transition(rule_id, chunk, TaskState::VerdictOk);
                    Verdict::decided(rule_id, chunk, parsed.compliant, parsed.evidence, model, attempts)
                }
                Err(e) => undetermined(format!("model {model} gave no usable verdict: {e}"), Some(model), attempts),
            },
            Err(Stop::Cancelled) => cancelled(attempts),
            Err(Stop::Failed(e)) => undetermined(
                format!("model {model} failed on clarification: {e}"),
                Some(model),
                attempts,
            ),
        }
    }
}
