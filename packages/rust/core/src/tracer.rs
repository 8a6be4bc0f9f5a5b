//! Run/step tracer.
//!
//! Tracing is best-effort: a failed trace write is logged and swallowed so
//! it never breaks the item being processed. Every method that takes an
//! optional id is a no-op when the id is `None`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use pipewright_shared::{QueueItem, RunStatus, StepError, StepStatus, Usage};
use pipewright_storage::{StepCompletion, Storage};

const SIGNATURE_MAX_CHARS: usize = 100;

/// Normalize an error message so recurring failures group together:
/// UUIDs become `UUID`, digit runs become `N`, capped at 100 characters.
pub fn error_signature(message: &str) -> String {
    static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .expect("valid regex")
    });
    static DIGITS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

    let without_uuids = UUID_RE.replace_all(message, "UUID");
    let normalized = DIGITS_RE.replace_all(&without_uuids, "N");
    normalized.chars().take(SIGNATURE_MAX_CHARS).collect()
}

/// Key identifying one attempt of one step for one item.
pub fn idempotency_key(item_id: &str, step: &str, attempt: u32) -> String {
    format!("{item_id}:{step}:{attempt}")
}

/// Result of [`RunTracer::start_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepStart {
    /// A new running attempt, `None` when tracing is unavailable.
    Started(Option<String>),
    /// The latest attempt already succeeded with `output`.
    Cached { step_id: String, output: Value },
}

impl StepStart {
    /// Id of the newly opened attempt.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Started(id) => id.as_deref(),
            Self::Cached { .. } => None,
        }
    }
}

/// Writes runs and step attempts for the orchestrator.
pub struct RunTracer<'a> {
    storage: &'a Storage,
}

impl<'a> RunTracer<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// The item's run, or a new one stamped onto the item.
    ///
    /// An item that already points at a run keeps it whatever its status.
    /// The trigger of a new run follows the item's origin: manual submissions
    /// are manual runs, everything else is discovery.
    pub async fn ensure_run(&self, item: &QueueItem) -> Option<String> {
        if let Some(run_id) = &item.current_run_id {
            return Some(run_id.clone());
        }

        let run = match self.storage.create_run(&item.id, item.origin.trigger()).await {
            Ok(run) => run,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "failed to create run");
                return None;
            }
        };
        if let Err(e) = self.storage.set_item_run(&item.id, Some(&run.id)).await {
            warn!(item_id = %item.id, run_id = %run.id, error = %e, "failed to stamp run on item");
        }
        debug!(item_id = %item.id, run_id = %run.id, trigger = run.trigger.as_str(), "run created");
        Some(run.id)
    }

    /// Open the next attempt of `step` within the run.
    ///
    /// When the latest attempt of the step already succeeded its output is
    /// handed back instead, so the caller can skip the agent call.
    pub async fn start_step(
        &self,
        run_id: Option<&str>,
        item_id: &str,
        step: &str,
        input: &Value,
    ) -> StepStart {
        let Some(run_id) = run_id else {
            return StepStart::Started(None);
        };
        let prior = match self.storage.max_step_attempt(run_id, step).await {
            Ok(max) => max,
            Err(e) => {
                warn!(run_id, step, error = %e, "failed to read prior attempts");
                return StepStart::Started(None);
            }
        };

        if prior > 0 {
            let key = idempotency_key(item_id, step, prior);
            match self.storage.find_succeeded_step(run_id, &key).await {
                Ok(Some(done)) => {
                    debug!(run_id, step, key = %key, "step already succeeded, reusing output");
                    return StepStart::Cached {
                        step_id: done.id,
                        output: done.output.unwrap_or(Value::Null),
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(run_id, step, error = %e, "idempotency check failed"),
            }
        }

        let attempt = prior + 1;
        let key = idempotency_key(item_id, step, attempt);
        match self.storage.insert_step(run_id, step, attempt, &key, input).await {
            Ok(step_run) => {
                debug!(run_id, step, attempt, "step started");
                StepStart::Started(Some(step_run.id))
            }
            Err(e) => {
                warn!(run_id, step, error = %e, "failed to start step");
                StepStart::Started(None)
            }
        }
    }

    pub async fn complete_step(&self, step_id: Option<&str>, output: &Value) {
        self.finish(
            step_id,
            StepCompletion {
                status: StepStatus::Success,
                output: Some(output.clone()),
                error_message: None,
                error_signature: None,
            },
        )
        .await;
    }

    pub async fn fail_step(&self, step_id: Option<&str>, error: &StepError) {
        self.finish(
            step_id,
            StepCompletion {
                status: StepStatus::Failed,
                output: None,
                error_message: Some(error.message.clone()),
                error_signature: Some(error_signature(&error.message)),
            },
        )
        .await;
    }

    pub async fn skip_step(&self, step_id: Option<&str>, reason: &str) {
        self.finish(
            step_id,
            StepCompletion {
                status: StepStatus::Skipped,
                output: None,
                error_message: Some(reason.to_string()),
                error_signature: None,
            },
        )
        .await;
    }

    async fn finish(&self, step_id: Option<&str>, completion: StepCompletion) {
        let Some(step_id) = step_id else {
            return;
        };
        match self.storage.finish_step(step_id, &completion).await {
            Ok(true) => debug!(step_id, status = completion.status.as_str(), "step finished"),
            Ok(false) => warn!(step_id, "step was already finalized"),
            Err(e) => warn!(step_id, error = %e, "failed to finalize step"),
        }
    }

    /// Add an agent call's usage to the run's counters.
    pub async fn add_usage(&self, run_id: Option<&str>, usage: Usage) {
        let Some(run_id) = run_id else {
            return;
        };
        if let Err(e) = self.storage.add_run_usage(run_id, usage).await {
            warn!(run_id, error = %e, "failed to record usage");
        }
    }

    /// Close the run with `status` if it is still running.
    pub async fn complete_run(&self, run_id: Option<&str>, status: RunStatus) {
        let Some(run_id) = run_id else {
            return;
        };
        match self.storage.complete_run(run_id, status).await {
            Ok(true) => debug!(run_id, status = status.as_str(), "run closed"),
            Ok(false) => {}
            Err(e) => warn!(run_id, error = %e, "failed to close run"),
        }
    }
}
