//! Pipeline runs and step attempts: the execution trace.

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use pipewright_shared::{
    PipelineError, PipelineRun, Result, RunStatus, RunTrigger, StepRun, StepStatus, Usage, new_id,
};
use serde_json::Value;

use crate::{
    Storage, col_f64, col_i64, col_opt_json, col_opt_str, col_opt_ts, col_str, col_ts, format_ts,
    now_ts, to_u32,
};

const RUN_COLUMNS: &str = "id, queue_item_id, trigger_kind, status, created_at, completed_at, \
     total_tokens, total_cost_usd, replay_validation, replayed_at";

const STEP_COLUMNS: &str = "id, run_id, step_name, attempt, status, input_snapshot, output, \
     error_message, error_signature, started_at, completed_at, idempotency_key";

/// Final state written onto a step attempt.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub error_signature: Option<String>,
}

/// Filter for random run sampling.
#[derive(Debug, Clone, Default)]
pub struct RunSampleFilter {
    pub size: u32,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

fn row_to_run(row: &Row) -> Result<PipelineRun> {
    let raw_status = col_str(row, 3)?;
    let status = RunStatus::parse(&raw_status)
        .ok_or_else(|| PipelineError::Storage(format!("unknown run status '{raw_status}'")))?;
    Ok(PipelineRun {
        id: col_str(row, 0)?,
        queue_item_id: col_str(row, 1)?,
        trigger: RunTrigger::parse(&col_str(row, 2)?),
        status,
        created_at: col_ts(row, 4)?,
        completed_at: col_opt_ts(row, 5)?,
        total_tokens: col_i64(row, 6)?.max(0) as u64,
        total_cost_usd: col_f64(row, 7)?,
        replay_validation: col_opt_json(row, 8)?,
        replayed_at: col_opt_ts(row, 9)?,
    })
}

fn row_to_step(row: &Row) -> Result<StepRun> {
    let raw_status = col_str(row, 4)?;
    let status = StepStatus::parse(&raw_status)
        .ok_or_else(|| PipelineError::Storage(format!("unknown step status '{raw_status}'")))?;
    Ok(StepRun {
        id: col_str(row, 0)?,
        run_id: col_str(row, 1)?,
        step_name: col_str(row, 2)?,
        attempt: to_u32(col_i64(row, 3)?),
        idempotency_key: col_opt_str(row, 11),
        status,
        input_snapshot: col_opt_json(row, 5)?,
        output: col_opt_json(row, 6)?,
        error_message: col_opt_str(row, 7),
        error_signature: col_opt_str(row, 8),
        started_at: col_ts(row, 9)?,
        completed_at: col_opt_ts(row, 10)?,
    })
}

impl Storage {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Open a new running run for an item.
    pub async fn create_run(&self, queue_item_id: &str, trigger: RunTrigger) -> Result<PipelineRun> {
        self.check_writable()?;
        let id = new_id();
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, queue_item_id, trigger_kind, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    queue_item_id,
                    trigger.as_str(),
                    RunStatus::Running.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        self.get_run(&id)
            .await?
            .ok_or_else(|| PipelineError::not_found("pipeline run", id))
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Runs of one item, oldest first.
    pub async fn runs_for_item(&self, queue_item_id: &str) -> Result<Vec<PipelineRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE queue_item_id = ?1 ORDER BY created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![queue_item_id])
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Close a running run. Returns whether the run was still running.
    pub async fn complete_run(&self, id: &str, status: RunStatus) -> Result<bool> {
        self.check_writable()?;
        let now = now_ts();
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET status = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, status.as_str(), now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(changed > 0)
    }

    /// Add an agent call's usage to the run totals.
    pub async fn add_run_usage(&self, id: &str, usage: Usage) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE pipeline_runs
                 SET total_tokens = total_tokens + ?2, total_cost_usd = total_cost_usd + ?3
                 WHERE id = ?1",
                params![id, usage.tokens as i64, usage.cost_usd],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Store a replay summary on the run.
    pub async fn write_replay_validation(&self, id: &str, summary: &Value) -> Result<()> {
        self.check_writable()?;
        let now = now_ts();
        let summary = summary.to_string();
        self.conn
            .execute(
                "UPDATE pipeline_runs SET replay_validation = ?2, replayed_at = ?3 WHERE id = ?1",
                params![id, summary.as_str(), now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Uniformly random run IDs matching the filter.
    pub async fn sample_run_ids(&self, filter: &RunSampleFilter) -> Result<Vec<String>> {
        let since = filter.since.as_ref().map(format_ts);
        let until = filter.until.as_ref().map(format_ts);
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM pipeline_runs
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR created_at >= ?2)
                   AND (?3 IS NULL OR created_at <= ?3)
                 ORDER BY RANDOM()
                 LIMIT ?4",
                params![
                    filter.status.map(|s| s.as_str()),
                    since.as_deref(),
                    until.as_deref(),
                    filter.size as i64
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(col_str(&row, 0)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Highest attempt number recorded for `step_name` in a run, 0 if none.
    pub async fn max_step_attempt(&self, run_id: &str, step_name: &str) -> Result<u32> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(attempt), 0) FROM pipeline_step_runs
                 WHERE run_id = ?1 AND step_name = ?2",
                params![run_id, step_name],
            )
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(to_u32(col_i64(&row, 0)?)),
            None => Ok(0),
        }
    }

    /// Insert a running step attempt.
    pub async fn insert_step(
        &self,
        run_id: &str,
        step_name: &str,
        attempt: u32,
        idempotency_key: &str,
        input: &Value,
    ) -> Result<StepRun> {
        self.check_writable()?;
        let id = new_id();
        let now = now_ts();
        let input = input.to_string();
        self.conn
            .execute(
                "INSERT INTO pipeline_step_runs (id, run_id, step_name, attempt, idempotency_key, status, input_snapshot, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    run_id,
                    step_name,
                    attempt as i64,
                    idempotency_key,
                    StepStatus::Running.as_str(),
                    input.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        self.get_step(&id)
            .await?
            .ok_or_else(|| PipelineError::not_found("step run", id))
    }

    /// Get a step attempt by ID.
    pub async fn get_step(&self, id: &str) -> Result<Option<StepRun>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM pipeline_step_runs WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    /// The successful attempt of a run carrying `idempotency_key`, if any.
    pub async fn find_succeeded_step(
        &self,
        run_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<StepRun>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM pipeline_step_runs
             WHERE run_id = ?1 AND idempotency_key = ?2 AND status = 'success'
             LIMIT 1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![run_id, idempotency_key])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    /// Finalize a running step. A step is finalized at most once; returns
    /// `false` if it was already final.
    pub async fn finish_step(&self, id: &str, completion: &StepCompletion) -> Result<bool> {
        self.check_writable()?;
        let now = now_ts();
        let output = completion.output.as_ref().map(Value::to_string);
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_step_runs
                 SET status = ?2, output = ?3, error_message = ?4, error_signature = ?5, completed_at = ?6
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    completion.status.as_str(),
                    output.as_deref(),
                    completion.error_message.as_deref(),
                    completion.error_signature.as_deref(),
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(changed > 0)
    }

    /// Fail every still-running step of a run. Returns how many were closed.
    pub async fn abandon_running_steps(
        &self,
        run_id: &str,
        message: &str,
        signature: &str,
    ) -> Result<u64> {
        self.check_writable()?;
        let now = now_ts();
        self.conn
            .execute(
                "UPDATE pipeline_step_runs
                 SET status = 'failed', error_message = ?2, error_signature = ?3, completed_at = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id, message, signature, now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)
    }

    /// Steps of a run in start order.
    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRun>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM pipeline_step_runs
             WHERE run_id = ?1
             ORDER BY started_at, attempt, rowid"
        );
        let mut rows = self
            .conn
            .query(&sql, params![run_id])
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(row_to_step(&row)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use pipewright_shared::{EntryOrigin, NewQueueItem};
    use serde_json::json;

    async fn item_id(storage: &Storage) -> String {
        storage
            .enqueue_item(&NewQueueItem {
                url: None,
                status_code: 220,
                payload: json!({}),
                origin: EntryOrigin::Manual,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn run_lifecycle_and_usage() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;

        let run = storage.create_run(&item, RunTrigger::Manual).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.trigger, RunTrigger::Manual);

        storage
            .add_run_usage(&run.id, Usage { tokens: 120, cost_usd: 0.25 })
            .await
            .unwrap();
        storage
            .add_run_usage(&run.id, Usage { tokens: 30, cost_usd: 0.5 })
            .await
            .unwrap();

        assert!(storage.complete_run(&run.id, RunStatus::Completed).await.unwrap());
        assert!(!storage.complete_run(&run.id, RunStatus::Failed).await.unwrap());

        let run = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_tokens, 150);
        assert!((run.total_cost_usd - 0.75).abs() < 1e-9);
        assert!(run.completed_at.is_some());
        assert_eq!(storage.runs_for_item(&item).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn steps_finalize_once() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;
        let run = storage.create_run(&item, RunTrigger::Discovery).await.unwrap();

        assert_eq!(storage.max_step_attempt(&run.id, "tag").await.unwrap(), 0);
        let step = storage
            .insert_step(&run.id, "tag", 1, "item:tag:1", &json!({ "url": null }))
            .await
            .unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(storage.max_step_attempt(&run.id, "tag").await.unwrap(), 1);

        let completion = StepCompletion {
            status: StepStatus::Success,
            output: Some(json!({ "tags": ["rust"] })),
            error_message: None,
            error_signature: None,
        };
        assert!(storage.finish_step(&step.id, &completion).await.unwrap());
        assert!(!storage.finish_step(&step.id, &completion).await.unwrap());

        let steps = storage.list_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output, Some(json!({ "tags": ["rust"] })));
        assert_eq!(steps[0].idempotency_key.as_deref(), Some("item:tag:1"));
        assert!(steps[0].completed_at.is_some());

        let cached = storage
            .find_succeeded_step(&run.id, "item:tag:1")
            .await
            .unwrap()
            .expect("succeeded step");
        assert_eq!(cached.id, step.id);
        assert!(storage.find_succeeded_step(&run.id, "item:tag:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_steps_are_failed() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;
        let run = storage.create_run(&item, RunTrigger::Manual).await.unwrap();
        storage.insert_step(&run.id, "tag", 1, "item:tag:1", &json!({})).await.unwrap();

        let closed = storage
            .abandon_running_steps(&run.id, "Job timed out (stale)", "Job timed out (stale)")
            .await
            .unwrap();
        assert_eq!(closed, 1);
        let steps = storage.list_steps(&run.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_message.as_deref(), Some("Job timed out (stale)"));
        assert_eq!(steps[0].error_signature.as_deref(), Some("Job timed out (stale)"));
    }

    #[tokio::test]
    async fn duplicate_attempt_is_rejected() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;
        let run = storage.create_run(&item, RunTrigger::Manual).await.unwrap();

        storage.insert_step(&run.id, "tag", 1, "item:tag:1", &json!({})).await.unwrap();
        assert!(storage.insert_step(&run.id, "tag", 1, "item:tag:1", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn sampling_respects_status_and_size() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;
        for i in 0..5 {
            let run = storage.create_run(&item, RunTrigger::Manual).await.unwrap();
            if i < 3 {
                storage.complete_run(&run.id, RunStatus::Completed).await.unwrap();
            }
        }

        let completed = storage
            .sample_run_ids(&RunSampleFilter {
                size: 10,
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);

        let any_two = storage
            .sample_run_ids(&RunSampleFilter {
                size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(any_two.len(), 2);

        let future_only = storage
            .sample_run_ids(&RunSampleFilter {
                size: 10,
                since: Some(Utc::now() + chrono::Duration::days(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(future_only.is_empty());
    }

    #[tokio::test]
    async fn replay_validation_is_stored() {
        let storage = test_storage().await;
        let item = item_id(&storage).await;
        let run = storage.create_run(&item, RunTrigger::Manual).await.unwrap();

        storage
            .write_replay_validation(&run.id, &json!({ "valid": true }))
            .await
            .unwrap();
        let run = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.replay_validation, Some(json!({ "valid": true })));
        assert!(run.replayed_at.is_some());
    }
}
