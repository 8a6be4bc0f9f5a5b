//! Structural replay of recorded runs.
//!
//! A replay rebuilds a run's timeline from its persisted step attempts and
//! checks it for consistency. Agents are never re-invoked by a replay; a
//! single recorded step can be rerun explicitly with
//! [`ReplayEngine::rerun_step`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use pipewright_shared::{
    PipelineError, PipelineRun, QueueItem, Result, RunStatus, StepError, StepRun, StepStatus,
};
use pipewright_storage::{RunSampleFilter, Storage};

use crate::agent::{Agent, AgentOutput};

/// One entry of a reconstructed timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    /// `pipeline_started`, `step_started`, `step_<status>` or `pipeline_completed`.
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEvent {
    fn new(timestamp: DateTime<Utc>, event: impl Into<String>) -> Self {
        Self {
            timestamp,
            event: event.into(),
            step_name: None,
            attempt: None,
            trigger: None,
            status: None,
            input: None,
            output: None,
            error: None,
        }
    }

    fn is_step_event(&self) -> bool {
        self.event.starts_with("step_")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ReplayValidation {
    fn error(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }
}

/// Outcome of replaying one run. Failures to load are reported in `error`
/// instead of being returned as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub success: bool,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub steps_replayed: usize,
    pub state_history: Vec<HistoryEvent>,
    pub validation: ReplayValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub simulated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplayReport {
    fn failed(run_id: &str, simulate: bool, error: String) -> Self {
        Self {
            success: false,
            run_id: run_id.to_string(),
            item_id: None,
            steps_replayed: 0,
            state_history: Vec::new(),
            validation: ReplayValidation::default(),
            fingerprint: None,
            simulated: simulate,
            error: Some(error),
        }
    }
}

/// Aggregate over several replays.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReplaySummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage of successful replays, 0.0 for an empty batch.
    pub success_rate: f64,
    pub results: Vec<ReplayReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    #[serde(flatten)]
    pub summary: BatchReplaySummary,
    pub target_pct: f64,
    pub meets_target: bool,
}

/// What a rerun agent call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RerunOutcome {
    Completed { output: Value },
    Rejected { reason: String },
    Failed { error: String },
}

/// Result of rerunning one recorded step.
#[derive(Debug, Clone, Serialize)]
pub struct RerunReport {
    pub step_id: String,
    pub run_id: String,
    pub item_id: String,
    pub step_name: String,
    pub attempt: u32,
    pub recorded_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_error: Option<String>,
    pub outcome: RerunOutcome,
    /// The rerun ended the way the recorded attempt did, with the same output.
    pub matches_recorded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Write nothing back to the store.
    pub simulate: bool,
    /// Log each replayed step at info level.
    pub verbose: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            simulate: true,
            verbose: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconstruction and validation
// ---------------------------------------------------------------------------

/// Rebuild the timeline of a run from its steps (already in start order).
pub fn reconstruct_history(run: &PipelineRun, steps: &[StepRun]) -> Vec<HistoryEvent> {
    let mut history = Vec::with_capacity(steps.len() * 2 + 2);

    let mut started = HistoryEvent::new(run.created_at, "pipeline_started");
    started.trigger = Some(run.trigger.as_str().to_string());
    started.status = Some(RunStatus::Running.as_str().to_string());
    history.push(started);

    for step in steps {
        let mut begin = HistoryEvent::new(step.started_at, "step_started");
        begin.step_name = Some(step.step_name.clone());
        begin.attempt = Some(step.attempt);
        begin.input = step.input_snapshot.clone();
        history.push(begin);

        if let Some(completed_at) = step.completed_at {
            let mut end = HistoryEvent::new(completed_at, format!("step_{}", step.status.as_str()));
            end.step_name = Some(step.step_name.clone());
            end.attempt = Some(step.attempt);
            end.output = step.output.clone();
            end.error = step.error_message.clone();
            history.push(end);
        }
    }

    let mut finished = HistoryEvent::new(
        run.completed_at.unwrap_or_else(Utc::now),
        "pipeline_completed",
    );
    finished.status = Some(run.status.as_str().to_string());
    history.push(finished);

    history
}

/// Check a reconstructed timeline for completeness, step consistency and
/// chronological order.
pub fn validate_history(steps: &[StepRun], history: &[HistoryEvent]) -> ReplayValidation {
    let mut validation = ReplayValidation {
        is_valid: true,
        ..Default::default()
    };

    let expected = steps.len() * 2;
    let found = history.iter().filter(|e| e.is_step_event()).count();
    if found != expected {
        validation.error(format!("Expected {expected} step events, found {found}"));
    }

    for step in steps {
        match step.status {
            StepStatus::Success if step.output.is_none() => {
                validation.warnings.push(format!(
                    "Step {} (attempt {}) succeeded but has no output",
                    step.step_name, step.attempt
                ));
            }
            StepStatus::Failed if step.error_message.is_none() => {
                validation.warnings.push(format!(
                    "Step {} (attempt {}) failed but has no error message",
                    step.step_name, step.attempt
                ));
            }
            _ => {}
        }
    }

    for (i, pair) in history.windows(2).enumerate() {
        if pair[1].timestamp < pair[0].timestamp {
            validation.error(format!("State history not chronological at index {}", i + 1));
        }
    }

    validation
}

/// SHA-256 over the step events of a timeline, hex encoded.
///
/// The run's own start and end events are left out so a still-running run
/// fingerprints the same way on every replay.
pub fn history_fingerprint(history: &[HistoryEvent]) -> String {
    history_fingerprint_prefix(history, usize::MAX)
}

/// Fingerprint of the first `events` step events only.
pub fn history_fingerprint_prefix(history: &[HistoryEvent], events: usize) -> String {
    let mut hasher = Sha256::new();
    for event in history.iter().filter(|e| e.is_step_event()).take(events) {
        let line = serde_json::to_string(event).unwrap_or_default();
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Compare a timeline with the fingerprint of an earlier persisted replay.
///
/// Steps recorded after that replay extend the timeline and are not drift;
/// only the covered prefix has to hash the same.
fn check_drift(recorded: &Value, history: &[HistoryEvent], validation: &mut ReplayValidation) {
    let Some(previous) = recorded.get("fingerprint").and_then(Value::as_str) else {
        return;
    };
    let found = history.iter().filter(|e| e.is_step_event()).count();

    let replayed = match recorded.get("step_events").and_then(Value::as_u64) {
        Some(covered) => {
            let covered = usize::try_from(covered).unwrap_or(usize::MAX);
            if found < covered {
                validation.error(format!(
                    "fingerprint drift: recorded {covered} step events, replayed {found}"
                ));
                return;
            }
            history_fingerprint_prefix(history, covered)
        }
        None => history_fingerprint(history),
    };
    if previous != replayed {
        validation.error(format!(
            "fingerprint drift: recorded {previous}, replayed {replayed}"
        ));
    }
}

/// The agent input recorded on a step: the item with the snapshot's url,
/// stage and payload laid over it.
fn item_from_snapshot(mut item: QueueItem, snapshot: Option<&Value>) -> QueueItem {
    let Some(snapshot) = snapshot else {
        return item;
    };
    if let Some(payload) = snapshot.get("payload").filter(|p| p.is_object()) {
        item.payload = payload.clone();
    }
    if let Some(url) = snapshot.get("url") {
        item.url = url.as_str().map(str::to_string);
    }
    if let Some(code) = snapshot.get("status_code").and_then(Value::as_i64) {
        item.status_code = code;
    }
    item
}

fn matches_recorded(step: &StepRun, outcome: &RerunOutcome) -> bool {
    match outcome {
        RerunOutcome::Completed { output } => {
            step.status == StepStatus::Success && step.output.as_ref() == Some(output)
        }
        RerunOutcome::Rejected { .. } => step.status == StepStatus::Skipped,
        RerunOutcome::Failed { error } => {
            step.status == StepStatus::Failed && step.error_message.as_deref() == Some(error)
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Replays runs recorded in the store.
pub struct ReplayEngine<'a> {
    storage: &'a Storage,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Replay one run. Never fails: load errors come back as an
    /// unsuccessful report.
    #[instrument(skip_all, fields(run_id = %run_id, simulate = options.simulate))]
    pub async fn replay_run(&self, run_id: &str, options: ReplayOptions) -> ReplayReport {
        match self.try_replay(run_id, options).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "replay failed");
                ReplayReport::failed(run_id, options.simulate, e.to_string())
            }
        }
    }

    async fn try_replay(&self, run_id: &str, options: ReplayOptions) -> Result<ReplayReport> {
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("pipeline run", run_id))?;
        let steps = self.storage.list_steps(run_id).await?;
        debug!(steps = steps.len(), "loaded step history");

        for step in &steps {
            if options.verbose {
                info!(step = %step.step_name, attempt = step.attempt, status = step.status.as_str(), "replayed step");
            } else {
                debug!(step = %step.step_name, attempt = step.attempt, status = step.status.as_str(), "replayed step");
            }
        }

        let state_history = reconstruct_history(&run, &steps);
        let mut validation = validate_history(&steps, &state_history);
        let fingerprint = history_fingerprint(&state_history);
        if let Some(recorded) = &run.replay_validation {
            check_drift(recorded, &state_history, &mut validation);
        }

        if !options.simulate {
            let step_events = state_history.iter().filter(|e| e.is_step_event()).count();
            let summary = json!({
                "is_valid": validation.is_valid,
                "errors": validation.errors,
                "warnings": validation.warnings,
                "steps_replayed": steps.len(),
                "step_events": step_events,
                "fingerprint": fingerprint,
            });
            self.storage.write_replay_validation(run_id, &summary).await?;
        }

        info!(
            valid = validation.is_valid,
            errors = validation.errors.len(),
            warnings = validation.warnings.len(),
            "replay finished"
        );
        Ok(ReplayReport {
            success: validation.is_valid,
            run_id: run.id,
            item_id: Some(run.queue_item_id),
            steps_replayed: steps.len(),
            state_history,
            validation,
            fingerprint: Some(fingerprint),
            simulated: options.simulate,
            error: None,
        })
    }

    /// Replay several runs one after another.
    #[instrument(skip_all, fields(total = run_ids.len(), simulate = simulate))]
    pub async fn replay_batch(&self, run_ids: &[String], simulate: bool) -> BatchReplaySummary {
        let options = ReplayOptions {
            simulate,
            verbose: false,
        };
        let mut results = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            results.push(self.replay_run(run_id, options).await);
        }

        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            (successful as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        BatchReplaySummary {
            total,
            successful,
            failed: total - successful,
            success_rate,
            results,
        }
    }

    /// Replay a random sample of completed runs (simulated) and compare the
    /// success rate with `target_pct`.
    pub async fn test_replay_capability(
        &self,
        sample_size: u32,
        target_pct: f64,
    ) -> Result<CapabilityReport> {
        let run_ids = self
            .sample(&RunSampleFilter {
                size: sample_size,
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await?;
        info!(sample_size, selected = run_ids.len(), "testing replay capability");

        let summary = self.replay_batch(&run_ids, true).await;
        let meets_target = summary.total > 0 && summary.success_rate >= target_pct;
        Ok(CapabilityReport {
            summary,
            target_pct,
            meets_target,
        })
    }

    /// Random run ids matching the filter.
    pub async fn sample(&self, filter: &RunSampleFilter) -> Result<Vec<String>> {
        self.storage.sample_run_ids(filter).await
    }

    /// Run `agent` again on the input recorded for one step and compare the
    /// result with what was recorded. Nothing is written back.
    #[instrument(skip_all, fields(step_id = %step_id))]
    pub async fn rerun_step<A: Agent>(
        &self,
        step_id: &str,
        agent: &A,
        timeout: Duration,
    ) -> Result<RerunReport> {
        let step = self
            .storage
            .get_step(step_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("step run", step_id))?;
        let run = self
            .storage
            .get_run(&step.run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("pipeline run", step.run_id.as_str()))?;
        let item = self.storage.require_item(&run.queue_item_id).await?;
        let input = item_from_snapshot(item, step.input_snapshot.as_ref());
        info!(step = %step.step_name, attempt = step.attempt, item_id = %input.id, "rerunning step");

        let outcome = match tokio::time::timeout(timeout, agent.run(&input)).await {
            Ok(Ok(AgentOutput::Completed { output, .. })) => RerunOutcome::Completed { output },
            Ok(Ok(AgentOutput::Rejected { reason })) => RerunOutcome::Rejected { reason },
            Ok(Err(err)) => RerunOutcome::Failed { error: err.message },
            Err(_) => RerunOutcome::Failed {
                error: StepError::timeout(timeout).message,
            },
        };
        let matches_recorded = matches_recorded(&step, &outcome);
        info!(matches_recorded, "rerun finished");

        Ok(RerunReport {
            step_id: step.id,
            run_id: run.id,
            item_id: input.id,
            step_name: step.step_name,
            attempt: step.attempt,
            recorded_status: step.status.as_str().to_string(),
            recorded_output: step.output,
            recorded_error: step.error_message,
            outcome,
            matches_recorded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::RunTracer;
    use pipewright_shared::{EntryOrigin, NewQueueItem, RunTrigger, new_id};

    async fn storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", new_id()));
        Storage::open(&tmp).await.unwrap()
    }

    /// A run with a failed then successful `tag` attempt, closed as completed.
    async fn recorded_run(storage: &Storage) -> String {
        let item = storage
            .enqueue_item(&NewQueueItem {
                url: Some("https://example.com/post".into()),
                status_code: 220,
                payload: json!({ "title": "post" }),
                origin: EntryOrigin::Rss,
            })
            .await
            .unwrap();
        let tracer = RunTracer::new(storage);
        let run_id = tracer.ensure_run(&item).await.unwrap();

        let input = json!({ "url": item.url });
        let first = tracer.start_step(Some(&run_id), &item.id, "tag", &input).await;
        tracer.fail_step(first.step_id(), &StepError::new("upstream 503")).await;
        let second = tracer.start_step(Some(&run_id), &item.id, "tag", &input).await;
        tracer.complete_step(second.step_id(), &json!({ "tags": ["rust"] })).await;
        tracer.complete_run(Some(&run_id), RunStatus::Completed).await;
        run_id
    }

    fn run_at(created: DateTime<Utc>, completed: Option<DateTime<Utc>>) -> PipelineRun {
        PipelineRun {
            id: new_id(),
            queue_item_id: new_id(),
            trigger: RunTrigger::Manual,
            status: if completed.is_some() {
                RunStatus::Completed
            } else {
                RunStatus::Running
            },
            created_at: created,
            completed_at: completed,
            total_tokens: 0,
            total_cost_usd: 0.0,
            replay_validation: None,
            replayed_at: None,
        }
    }

    fn step_at(
        name: &str,
        status: StepStatus,
        started: DateTime<Utc>,
        completed: Option<DateTime<Utc>>,
    ) -> StepRun {
        StepRun {
            id: new_id(),
            run_id: new_id(),
            step_name: name.into(),
            attempt: 1,
            idempotency_key: None,
            status,
            input_snapshot: None,
            output: None,
            error_message: None,
            error_signature: None,
            started_at: started,
            completed_at: completed,
        }
    }

    #[tokio::test]
    async fn simulated_replay_writes_nothing() {
        let storage = storage().await;
        let run_id = recorded_run(&storage).await;

        let report = ReplayEngine::new(&storage)
            .replay_run(&run_id, ReplayOptions::default())
            .await;
        assert!(report.success, "errors: {:?}", report.validation.errors);
        assert_eq!(report.steps_replayed, 2);
        let events: Vec<&str> = report.state_history.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            events,
            vec![
                "pipeline_started",
                "step_started",
                "step_failed",
                "step_started",
                "step_success",
                "pipeline_completed",
            ]
        );

        let run = storage.get_run(&run_id).await.unwrap().unwrap();
        assert!(run.replay_validation.is_none());
        assert!(run.replayed_at.is_none());
    }

    #[tokio::test]
    async fn persisted_replay_writes_one_summary() {
        let storage = storage().await;
        let run_id = recorded_run(&storage).await;

        let report = ReplayEngine::new(&storage)
            .replay_run(
                &run_id,
                ReplayOptions {
                    simulate: false,
                    verbose: true,
                },
            )
            .await;
        assert!(report.success);

        let run = storage.get_run(&run_id).await.unwrap().unwrap();
        let summary = run.replay_validation.expect("summary written");
        assert_eq!(summary["is_valid"], true);
        assert_eq!(summary["steps_replayed"], 2);
        assert_eq!(summary["step_events"], 4);
        assert_eq!(summary["fingerprint"].as_str(), report.fingerprint.as_deref());
        assert!(run.replayed_at.is_some());
    }

    #[tokio::test]
    async fn replay_is_deterministic_until_the_trace_changes() {
        let storage = storage().await;
        let run_id = recorded_run(&storage).await;
        let engine = ReplayEngine::new(&storage);
        let persist = ReplayOptions {
            simulate: false,
            verbose: false,
        };

        let first = engine.replay_run(&run_id, persist).await;
        let second = engine.replay_run(&run_id, persist).await;
        assert!(second.success);
        assert_eq!(first.fingerprint, second.fingerprint);

        storage
            .write_replay_validation(&run_id, &json!({ "fingerprint": "0000" }))
            .await
            .unwrap();
        let drifted = engine.replay_run(&run_id, ReplayOptions::default()).await;
        assert!(!drifted.success);
        assert!(drifted.validation.errors[0].starts_with("fingerprint drift"));
    }

    #[tokio::test]
    async fn steps_recorded_after_a_persisted_replay_are_not_drift() {
        let storage = storage().await;
        let item = storage
            .enqueue_item(&NewQueueItem {
                url: Some("https://example.com/post".into()),
                status_code: 220,
                payload: json!({ "title": "post" }),
                origin: EntryOrigin::Rss,
            })
            .await
            .unwrap();
        let tracer = RunTracer::new(&storage);
        let run_id = tracer.ensure_run(&item).await.unwrap();
        let engine = ReplayEngine::new(&storage);

        let tag = tracer.start_step(Some(&run_id), &item.id, "tag", &json!({})).await;
        tracer.complete_step(tag.step_id(), &json!({ "tags": ["rust"] })).await;
        let persist = ReplayOptions {
            simulate: false,
            verbose: false,
        };
        assert!(engine.replay_run(&run_id, persist).await.success);

        let thumb = tracer
            .start_step(Some(&run_id), &item.id, "thumbnail", &json!({}))
            .await;
        tracer
            .complete_step(thumb.step_id(), &json!({ "thumbnail_url": "t.png" }))
            .await;
        tracer.complete_run(Some(&run_id), RunStatus::Completed).await;

        let later = engine.replay_run(&run_id, ReplayOptions::default()).await;
        assert!(later.success, "errors: {:?}", later.validation.errors);
        assert_eq!(later.steps_replayed, 2);

        // A rewritten step inside the covered prefix is still drift.
        storage
            .write_replay_validation(
                &run_id,
                &json!({ "fingerprint": "0000", "step_events": 2 }),
            )
            .await
            .unwrap();
        let drifted = engine.replay_run(&run_id, ReplayOptions::default()).await;
        assert!(!drifted.success);
        assert!(drifted.validation.errors[0].starts_with("fingerprint drift"));

        storage
            .write_replay_validation(
                &run_id,
                &json!({ "fingerprint": later.fingerprint, "step_events": 6 }),
            )
            .await
            .unwrap();
        let shrunk = engine.replay_run(&run_id, ReplayOptions::default()).await;
        assert_eq!(
            shrunk.validation.errors,
            vec!["fingerprint drift: recorded 6 step events, replayed 4"]
        );
    }

    /// Echoes the title it was given.
    struct TitleAgent;

    impl Agent for TitleAgent {
        fn run(
            &self,
            item: &QueueItem,
        ) -> impl std::future::Future<Output = std::result::Result<AgentOutput, StepError>> + Send
        {
            let output = json!({ "seen": item.payload.get("title").cloned() });
            async move { Ok(AgentOutput::completed(output)) }
        }
    }

    #[tokio::test]
    async fn rerun_uses_the_recorded_input() {
        let storage = storage().await;
        let item = storage
            .enqueue_item(&NewQueueItem {
                url: Some("https://example.com/post".into()),
                status_code: 230,
                payload: json!({ "title": "edited later" }),
                origin: EntryOrigin::Manual,
            })
            .await
            .unwrap();
        let tracer = RunTracer::new(&storage);
        let run_id = tracer.ensure_run(&item).await.unwrap();
        let snapshot = json!({ "url": item.url, "status_code": 220, "payload": { "title": "original" } });
        let step = tracer.start_step(Some(&run_id), &item.id, "tag", &snapshot).await;
        let step_id = step.step_id().unwrap().to_string();
        tracer.complete_step(Some(&step_id), &json!({ "seen": "original" })).await;

        let before = storage.require_item(&item.id).await.unwrap();

        let engine = ReplayEngine::new(&storage);
        let report = engine
            .rerun_step(&step_id, &TitleAgent, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            RerunOutcome::Completed {
                output: json!({ "seen": "original" })
            }
        );
        assert!(report.matches_recorded);
        assert_eq!(report.item_id, item.id);
        assert_eq!(report.recorded_status, "success");

        // Nothing was written.
        let steps = storage.list_steps(&run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output, Some(json!({ "seen": "original" })));
        let after = storage.require_item(&item.id).await.unwrap();
        assert_eq!(after.status_code, 230);
        assert_eq!(after.updated_at, before.updated_at);

        let err = engine
            .rerun_step("no-such-step", &TitleAgent, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn rerun_comparison_follows_the_recorded_status() {
        let t0 = Utc::now();
        let mut step = step_at("tag", StepStatus::Failed, t0, Some(t0));
        step.error_message = Some("upstream 503".into());

        assert!(matches_recorded(
            &step,
            &RerunOutcome::Failed {
                error: "upstream 503".into()
            }
        ));
        assert!(!matches_recorded(
            &step,
            &RerunOutcome::Completed { output: json!({}) }
        ));
    }

    #[tokio::test]
    async fn missing_run_is_reported_not_raised() {
        let storage = storage().await;
        let report = ReplayEngine::new(&storage)
            .replay_run("no-such-run", ReplayOptions::default())
            .await;
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("pipeline run not found: no-such-run"));
    }

    #[tokio::test]
    async fn batch_aggregates_results() {
        let storage = storage().await;
        let good = recorded_run(&storage).await;
        let engine = ReplayEngine::new(&storage);

        let summary = engine
            .replay_batch(&[good, "missing".to_string()], true)
            .await;
        assert_eq!((summary.total, summary.successful, summary.failed), (2, 1, 1));
        assert_eq!(summary.success_rate, 50.0);

        let empty = engine.replay_batch(&[], true).await;
        assert_eq!(empty.total, 0);
        assert_eq!(empty.success_rate, 0.0);
    }

    #[tokio::test]
    async fn capability_test_samples_completed_runs() {
        let storage = storage().await;
        for _ in 0..3 {
            recorded_run(&storage).await;
        }
        let engine = ReplayEngine::new(&storage);

        let report = engine.test_replay_capability(10, 100.0).await.unwrap();
        assert_eq!(report.summary.total, 3);
        assert!(report.meets_target);

        let sample = engine
            .sample(&RunSampleFilter {
                size: 2,
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn open_step_is_an_incomplete_history() {
        let t0 = Utc::now();
        let run = run_at(t0, None);
        let steps = vec![step_at("tag", StepStatus::Running, t0, None)];

        let history = reconstruct_history(&run, &steps);
        let validation = validate_history(&steps, &history);
        assert!(!validation.is_valid);
        assert_eq!(validation.errors, vec!["Expected 2 step events, found 1"]);
    }

    #[test]
    fn out_of_order_timestamps_are_errors() {
        let t0 = Utc::now();
        let run = run_at(t0, Some(t0 + chrono::Duration::seconds(10)));
        let steps = vec![step_at(
            "tag",
            StepStatus::Failed,
            t0 + chrono::Duration::seconds(5),
            Some(t0 + chrono::Duration::seconds(2)),
        )];

        let validation = validate_history(&steps, &reconstruct_history(&run, &steps));
        assert!(!validation.is_valid);
        assert_eq!(validation.errors, vec!["State history not chronological at index 2"]);
        assert_eq!(
            validation.warnings,
            vec!["Step tag (attempt 1) failed but has no error message"]
        );
    }

    #[test]
    fn success_without_output_is_a_warning_only() {
        let t0 = Utc::now();
        let run = run_at(t0, Some(t0 + chrono::Duration::seconds(3)));
        let steps = vec![step_at(
            "summarize",
            StepStatus::Success,
            t0 + chrono::Duration::seconds(1),
            Some(t0 + chrono::Duration::seconds(2)),
        )];

        let validation = validate_history(&steps, &reconstruct_history(&run, &steps));
        assert!(validation.is_valid);
        assert_eq!(validation.warnings.len(), 1);
    }
}
