//! Batch orchestrator: the per-agent processing loop.
//!
//! Each item walks `ready → working → {next | ready (retry) | dead letter}`.
//! Items in a batch are processed strictly one after another; per-item
//! failures are recorded and routed but never abort the batch.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use pipewright_shared::{
    Actor, AgentJob, AgentSettings, DEAD_LETTER_CODE, DefaultsConfig, PipelineError, QueueItem,
    Result, RunStatus, StatusCode, StepError, Usage,
};
use pipewright_storage::{FailureRecord, ItemChanges, JobCounts, Storage, TransitionRequest};

use crate::agent::{Agent, AgentOutput};
use crate::classify::{DEFAULT_DEAD_LETTER_THRESHOLD, classify, retry_delay, should_move_to_dead_letter};
use crate::registry::StatusRegistry;
use crate::tracer::{RunTracer, StepStart, error_signature};
use crate::transitions::TransitionTable;
use crate::wip::{Capacity, WipController};

/// Error message written onto jobs reclaimed by stale recovery.
pub const STALE_JOB_MESSAGE: &str = "Job timed out (stale)";

/// Stage name rejected items are parked in.
const REJECTED_STATUS: &str = "rejected";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Orchestrator-wide knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Deadline for one agent call.
    pub agent_timeout: Duration,
    /// Age after which a running job is considered abandoned.
    pub stale_job_after: Duration,
    /// Consecutive same-step failures before dead-lettering.
    pub dead_letter_threshold: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(90),
            stale_job_after: Duration::from_secs(30 * 60),
            dead_letter_threshold: DEFAULT_DEAD_LETTER_THRESHOLD,
        }
    }
}

impl From<&DefaultsConfig> for OrchestratorSettings {
    fn from(defaults: &DefaultsConfig) -> Self {
        Self {
            agent_timeout: defaults.agent_timeout(),
            stale_job_after: defaults.stale_job_after(),
            dead_letter_threshold: defaults.dead_letter_threshold,
        }
    }
}

/// Stage codes one agent moves items between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStages {
    pub ready: StatusCode,
    pub working: StatusCode,
    pub next: StatusCode,
}

/// Everything the loop needs to know about one agent.
#[derive(Debug, Clone)]
pub struct AgentBatchConfig {
    pub agent_name: String,
    pub step_name: String,
    pub stages: AgentStages,
    pub wip_limit: u32,
}

impl AgentBatchConfig {
    /// Resolve an agent's stage names through the registry.
    pub fn resolve(
        agent_name: &str,
        settings: &AgentSettings,
        registry: &StatusRegistry,
        wip_limit: u32,
    ) -> Result<Self> {
        let stages = AgentStages {
            ready: registry.code(&settings.ready_status)?,
            working: registry.code(&settings.working_status)?,
            next: registry.code(&settings.next_status)?,
        };
        if stages.ready == stages.working {
            return Err(PipelineError::config(format!(
                "agent '{agent_name}': ready and working stages must differ"
            )));
        }
        Ok(Self {
            agent_name: agent_name.to_string(),
            step_name: settings.step_name.clone(),
            stages,
            wip_limit,
        })
    }

    fn actor(&self) -> Actor {
        Actor::Agent(self.agent_name.clone())
    }
}

// ---------------------------------------------------------------------------
// Outcomes and progress
// ---------------------------------------------------------------------------

/// Why a batch did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    JobAlreadyRunning,
    WipLimit,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobAlreadyRunning => "job-already-running",
            Self::WipLimit => "wip-limit",
        }
    }
}

/// Result of [`Orchestrator::run_batch`].
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// No job was created.
    Skipped {
        reason: SkipReason,
        capacity: Option<Capacity>,
    },
    /// A job ran (possibly over zero items) and is now closed.
    Finished { job: AgentJob },
}

impl BatchOutcome {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Skipped { .. } => None,
            Self::Finished { job } => Some(&job.id),
        }
    }

    /// One-line description for operators.
    pub fn message(&self) -> String {
        match self {
            Self::Skipped { reason, .. } => format!("skipped: {}", reason.as_str()),
            Self::Finished { job } if job.total_items == 0 => {
                format!("no items for {}", job.agent_name)
            }
            Self::Finished { job } => format!(
                "job {} {}: {}/{} processed, {} succeeded, {} failed",
                job.id,
                job.status.as_str(),
                job.processed_items,
                job.total_items,
                job.success_count,
                job.failed_count
            ),
        }
    }
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Moved on to the agent's next stage.
    Advanced { to: StatusCode },
    /// Agent refused the item as bad data.
    Rejected,
    /// Failed; back in the ready stage for another attempt.
    Retrying { failure_count: u32 },
    /// Failed for good; parked in the dead-letter stage.
    DeadLettered { failure_count: u32 },
    /// Another actor moved the item after selection; left untouched.
    Contended { reason: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Rejected)
    }
}

/// Progress callback for reporting batch status.
pub trait BatchProgress: Send + Sync {
    /// Called before an item is handed to the agent. `index` is 0-based.
    fn item_started(&self, index: usize, total: usize, title: &str);
    /// Called after an item has been routed.
    fn item_finished(&self, item_id: &str, outcome: &ItemOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn item_started(&self, _index: usize, _total: usize, _title: &str) {}
    fn item_finished(&self, _item_id: &str, _outcome: &ItemOutcome) {}
}

/// Run and step ids of the item currently being processed.
struct ItemTrace {
    run_id: Option<String>,
    step_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives agent batches against the store.
pub struct Orchestrator<'a> {
    storage: &'a Storage,
    registry: &'a StatusRegistry,
    transitions: &'a TransitionTable,
    settings: OrchestratorSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        storage: &'a Storage,
        registry: &'a StatusRegistry,
        transitions: &'a TransitionTable,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            storage,
            registry,
            transitions,
            settings,
        }
    }

    /// Run one batch of up to `limit` items for an agent.
    ///
    /// 1. Reclaim a stale job, if any
    /// 2. Skip if a job is still running or the working stage is full
    /// 3. Select the oldest ready items that fit under the WIP limit
    /// 4. Process them one by one, then close the job
    #[instrument(skip_all, fields(agent = %config.agent_name, limit = limit))]
    pub async fn run_batch<A: Agent>(
        &self,
        agent: &A,
        config: &AgentBatchConfig,
        limit: u32,
        progress: &dyn BatchProgress,
    ) -> Result<BatchOutcome> {
        self.registry.load(self.storage).await?;
        self.transitions.load(self.storage).await?;

        let running = match self.recover_stale_job(config).await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "stale job cleanup failed");
                self.storage.find_running_job(&config.agent_name).await?
            }
        };
        if let Some(job) = running {
            info!(job_id = %job.id, "skipping: job already running");
            return Ok(BatchOutcome::Skipped {
                reason: SkipReason::JobAlreadyRunning,
                capacity: None,
            });
        }

        let capacity = WipController::new(self.storage)
            .check_capacity(&config.agent_name, config.stages.working, config.wip_limit)
            .await?;
        if capacity.is_full() {
            info!(
                current = capacity.current,
                limit = capacity.limit,
                "skipping: WIP limit reached"
            );
            return Ok(BatchOutcome::Skipped {
                reason: SkipReason::WipLimit,
                capacity: Some(capacity),
            });
        }

        let take = u64::from(limit).min(capacity.available) as u32;
        let items = self
            .storage
            .select_ready_items(config.stages.ready, take)
            .await?;
        let total = items.len() as u32;
        let job = self
            .storage
            .create_agent_job(&config.agent_name, total, Utc::now())
            .await?;

        if items.is_empty() {
            let job = self.storage.finish_job(&job.id, JobCounts::default()).await?;
            info!(job_id = %job.id, "no items, job completed");
            return Ok(BatchOutcome::Finished { job });
        }

        info!(job_id = %job.id, total, "started job");
        let mut counts = JobCounts::default();

        for (index, item) in items.iter().enumerate() {
            if self.is_cancelled(&job.id).await {
                info!(job_id = %job.id, processed = counts.processed, "job cancelled, stopping");
                break;
            }

            let title = item.title().unwrap_or_else(|| "Unknown".to_string());
            if let Err(e) = self
                .storage
                .set_job_current_item(&job.id, &item.id, Some(&title))
                .await
            {
                warn!(job_id = %job.id, error = %e, "failed to record current item");
            }
            progress.item_started(index, items.len(), &title);

            let outcome = self.process_item(agent, config, item).await;
            progress.item_finished(&item.id, &outcome);

            counts.processed += 1;
            if outcome.is_success() {
                counts.success += 1;
            } else {
                counts.failed += 1;
            }
            if let Err(e) = self.storage.record_job_progress(&job.id, counts).await {
                warn!(job_id = %job.id, error = %e, "failed to record job progress");
            }
        }

        let job = self.storage.finish_job(&job.id, counts).await?;
        info!(
            job_id = %job.id,
            status = job.status.as_str(),
            success = counts.success,
            failed = counts.failed,
            "job finished"
        );
        Ok(BatchOutcome::Finished { job })
    }

    async fn is_cancelled(&self, job_id: &str) -> bool {
        match self.storage.get_job(job_id).await {
            Ok(Some(job)) => job.status == pipewright_shared::JobStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!(job_id, error = %e, "failed to check job status");
                false
            }
        }
    }

    /// Mark the agent's running job cancelled. The loop stops before its
    /// next item; the item in flight finishes normally.
    pub async fn cancel_job(&self, agent_name: &str) -> Result<Option<AgentJob>> {
        self.storage.cancel_running_job(agent_name).await
    }

    /// Fail an abandoned running job and return its stuck items to the
    /// ready stage. Returns the running job if it is not stale.
    #[instrument(skip_all, fields(agent = %config.agent_name))]
    pub async fn recover_stale_job(&self, config: &AgentBatchConfig) -> Result<Option<AgentJob>> {
        let Some(job) = self.storage.find_running_job(&config.agent_name).await? else {
            return Ok(None);
        };

        let age = (Utc::now() - job.started_at).to_std().unwrap_or_default();
        if age < self.settings.stale_job_after {
            return Ok(Some(job));
        }

        info!(job_id = %job.id, age_minutes = age.as_secs() / 60, "cleaning up stale job");
        self.storage.fail_job(&job.id, STALE_JOB_MESSAGE).await?;

        let actor = Actor::System("stale-recovery".into());
        let mut reset = 0usize;
        for item_id in self.storage.item_ids_in_status(config.stages.working).await? {
            if let Ok(Some(item)) = self.storage.get_item(&item_id).await {
                if let Some(run_id) = &item.current_run_id {
                    if let Err(e) = self
                        .storage
                        .abandon_running_steps(
                            run_id,
                            STALE_JOB_MESSAGE,
                            &error_signature(STALE_JOB_MESSAGE),
                        )
                        .await
                    {
                        warn!(%run_id, error = %e, "failed to close abandoned steps");
                    }
                }
            }
            match self
                .transition(&item_id, config.stages.ready, &actor, false, ItemChanges::default())
                .await
            {
                Ok(_) => reset += 1,
                Err(e) => warn!(%item_id, error = %e, "failed to reset stuck item"),
            }
        }
        info!(reset, ready = config.stages.ready, "reset stuck items");
        Ok(None)
    }

    /// Move an item, checking legality against the in-memory table first
    /// for a readable error, then atomically in the store.
    pub async fn transition(
        &self,
        item_id: &str,
        to: StatusCode,
        actor: &Actor,
        manual: bool,
        changes: ItemChanges,
    ) -> Result<QueueItem> {
        self.move_item(item_id, None, to, actor, manual, changes).await
    }

    /// Operator move back into the pipeline (e.g. out of dead letter).
    ///
    /// The item leaves its previous run behind: a still-running run is
    /// closed as failed and the next agent step opens a fresh one.
    #[instrument(skip_all, fields(item_id = %item_id, to = to))]
    pub async fn requeue(&self, item_id: &str, to: StatusCode, actor: &Actor) -> Result<QueueItem> {
        let previous_run = self.storage.require_item(item_id).await?.current_run_id;
        let item = self
            .transition(
                item_id,
                to,
                actor,
                true,
                ItemChanges {
                    detach_run: true,
                    ..Default::default()
                },
            )
            .await?;

        RunTracer::new(self.storage)
            .complete_run(previous_run.as_deref(), RunStatus::Failed)
            .await;
        info!(previous_run = ?previous_run, "item requeued");
        Ok(item)
    }

    async fn move_item(
        &self,
        item_id: &str,
        expected_from: Option<StatusCode>,
        to: StatusCode,
        actor: &Actor,
        manual: bool,
        changes: ItemChanges,
    ) -> Result<QueueItem> {
        self.registry.load(self.storage).await?;
        self.transitions.load(self.storage).await?;

        let current = self.storage.require_item(item_id).await?;
        if let Some(expected) = expected_from {
            if current.status_code != expected {
                return Err(PipelineError::InvalidTransition {
                    from: current.status_code,
                    to,
                    message: format!(
                        "item {item_id} moved from {expected} to {} concurrently",
                        current.status_code
                    ),
                });
            }
        }
        self.transitions
            .validate(current.status_code, to, manual, self.registry)?;

        self.storage
            .transition_item(&TransitionRequest {
                item_id,
                to,
                actor,
                manual,
                expected_from,
                changes,
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Per-item processing
    // -----------------------------------------------------------------------

    async fn process_item<A: Agent>(
        &self,
        agent: &A,
        config: &AgentBatchConfig,
        item: &QueueItem,
    ) -> ItemOutcome {
        let tracer = RunTracer::new(self.storage);
        let run_id = tracer.ensure_run(item).await;
        let input = step_input(item);
        let start = tracer
            .start_step(run_id.as_deref(), &item.id, &config.step_name, &input)
            .await;
        let trace = ItemTrace {
            run_id,
            step_id: start.step_id().map(str::to_string),
        };

        let working = match self
            .move_item(
                &item.id,
                Some(config.stages.ready),
                config.stages.working,
                &config.actor(),
                false,
                ItemChanges::default(),
            )
            .await
        {
            Ok(working) => working,
            Err(PipelineError::InvalidTransition { message, .. }) => {
                tracer
                    .skip_step(trace.step_id.as_deref(), &format!("Skipped: {message}"))
                    .await;
                warn!(item_id = %item.id, %message, "item taken by another actor, skipping");
                return ItemOutcome::Contended { reason: message };
            }
            Err(e) => return self.handle_failure(config, &item.id, &trace, StepError::from(e)).await,
        };

        let result = match start {
            StepStart::Cached { step_id, output } => {
                info!(item_id = %item.id, %step_id, "reusing output of a succeeded attempt");
                Ok(AgentOutput::completed(output))
            }
            StepStart::Started(_) => {
                match tokio::time::timeout(self.settings.agent_timeout, agent.run(&working)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::timeout(self.settings.agent_timeout)),
                }
            }
        };

        match result {
            Ok(AgentOutput::Completed { output, usage }) => {
                match self
                    .handle_success(agent, config, &working, &trace, &output, usage)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let err = StepError::new(format!("Status update failed: {e}"));
                        self.handle_failure(config, &item.id, &trace, err).await
                    }
                }
            }
            Ok(AgentOutput::Rejected { reason }) => {
                self.handle_rejection(config, &working, &trace, &reason).await
            }
            Err(err) => self.handle_failure(config, &item.id, &trace, err).await,
        }
    }

    async fn handle_success<A: Agent>(
        &self,
        agent: &A,
        config: &AgentBatchConfig,
        item: &QueueItem,
        trace: &ItemTrace,
        output: &Value,
        usage: Option<Usage>,
    ) -> Result<ItemOutcome> {
        let mut payload = item.payload.clone();
        agent.merge(&mut payload, output);

        // Recorded before the move so a retry after a failed move reuses it.
        let tracer = RunTracer::new(self.storage);
        tracer.complete_step(trace.step_id.as_deref(), output).await;
        if let Some(usage) = usage {
            tracer.add_usage(trace.run_id.as_deref(), usage).await;
        }

        let next = config.stages.next;
        self.transition(
            &item.id,
            next,
            &config.actor(),
            false,
            ItemChanges {
                payload: Some(payload),
                clear_failures: true,
                ..Default::default()
            },
        )
        .await?;

        if self.transitions.ends_automation(next)? {
            tracer
                .complete_run(trace.run_id.as_deref(), RunStatus::Completed)
                .await;
        }

        info!(item_id = %item.id, to = next, "item advanced");
        Ok(ItemOutcome::Advanced { to: next })
    }

    async fn handle_rejection(
        &self,
        config: &AgentBatchConfig,
        item: &QueueItem,
        trace: &ItemTrace,
        reason: &str,
    ) -> ItemOutcome {
        let reason = if reason.is_empty() { "bad data" } else { reason };
        let tracer = RunTracer::new(self.storage);
        tracer
            .skip_step(trace.step_id.as_deref(), &format!("Rejected: {reason}"))
            .await;

        match self.registry.code(REJECTED_STATUS) {
            Ok(rejected) if self.transitions.is_legal(item.status_code, rejected, false).unwrap_or(false) => {
                if let Err(e) = self
                    .transition(&item.id, rejected, &config.actor(), false, ItemChanges::default())
                    .await
                {
                    warn!(item_id = %item.id, error = %e, "failed to park rejected item");
                }
            }
            _ => {}
        }
        tracer
            .complete_run(trace.run_id.as_deref(), RunStatus::Completed)
            .await;

        info!(item_id = %item.id, reason, "item rejected");
        ItemOutcome::Rejected
    }

    async fn handle_failure(
        &self,
        config: &AgentBatchConfig,
        item_id: &str,
        trace: &ItemTrace,
        err: StepError,
    ) -> ItemOutcome {
        let tracer = RunTracer::new(self.storage);
        tracer.fail_step(trace.step_id.as_deref(), &err).await;

        let classification = classify(&err);
        let current = match self.storage.get_item(item_id).await {
            Ok(Some(item)) => Some(item),
            Ok(None) => None,
            Err(e) => {
                warn!(item_id, error = %e, "failed to reload failed item");
                None
            }
        };
        let failure_count = match &current {
            Some(item) if item.last_failed_step.as_deref() == Some(config.step_name.as_str()) => {
                item.failure_count + 1
            }
            _ => 1,
        };

        let dead = should_move_to_dead_letter(
            &classification,
            failure_count,
            self.settings.dead_letter_threshold,
        );
        let now = Utc::now();
        let retry_after = if dead {
            None
        } else {
            retry_delay(&classification, failure_count)
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d)
        };
        let target = if dead {
            DEAD_LETTER_CODE
        } else {
            config.stages.ready
        };

        let failure = FailureRecord {
            step: config.step_name.clone(),
            count: failure_count,
            message: err.message.clone(),
            error_type: classification.error_type.as_str().to_string(),
            signature: error_signature(&err.message),
            at: now,
            retry_after,
        };
        if let Err(e) = self
            .transition(
                item_id,
                target,
                &config.actor(),
                false,
                ItemChanges {
                    failure: Some(failure),
                    ..Default::default()
                },
            )
            .await
        {
            error!(item_id, target, error = %e, "failed to route failed item");
        }

        if dead {
            tracer
                .complete_run(trace.run_id.as_deref(), RunStatus::Failed)
                .await;
            warn!(
                item_id,
                failure_count,
                error_type = classification.error_type.as_str(),
                error = %err,
                "item dead-lettered"
            );
            ItemOutcome::DeadLettered { failure_count }
        } else {
            warn!(
                item_id,
                failure_count,
                error_type = classification.error_type.as_str(),
                error = %err,
                "item failed, will retry"
            );
            ItemOutcome::Retrying { failure_count }
        }
    }
}

/// Snapshot of what the agent is about to see. Rerunning a step rebuilds
/// the agent's input from it.
fn step_input(item: &QueueItem) -> Value {
    json!({
        "url": item.url,
        "status_code": item.status_code,
        "title": item.payload.get("title"),
        "payload": item.payload,
    })
}
