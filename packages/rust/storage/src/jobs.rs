//! Agent job records.

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use pipewright_shared::{AgentJob, JobStatus, PipelineError, Result, new_id};

use crate::{
    Storage, col_i64, col_opt_str, col_opt_ts, col_str, col_ts, format_ts, now_ts, to_u32,
};

const JOB_COLUMNS: &str = "id, agent_name, status, total_items, processed_items, success_count, \
     failed_count, current_item_id, current_item_title, error_message, started_at, completed_at";

/// Progress counters of a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub processed: u32,
    pub success: u32,
    pub failed: u32,
}

fn row_to_job(row: &Row) -> Result<AgentJob> {
    let raw_status = col_str(row, 2)?;
    let status = JobStatus::parse(&raw_status)
        .ok_or_else(|| PipelineError::Storage(format!("unknown job status '{raw_status}'")))?;
    Ok(AgentJob {
        id: col_str(row, 0)?,
        agent_name: col_str(row, 1)?,
        status,
        total_items: to_u32(col_i64(row, 3)?),
        processed_items: to_u32(col_i64(row, 4)?),
        success_count: to_u32(col_i64(row, 5)?),
        failed_count: to_u32(col_i64(row, 6)?),
        current_item_id: col_opt_str(row, 7),
        current_item_title: col_opt_str(row, 8),
        error_message: col_opt_str(row, 9),
        started_at: col_ts(row, 10)?,
        completed_at: col_opt_ts(row, 11)?,
    })
}

impl Storage {
    /// Insert a running job for `agent`. Fails if the agent already has one.
    pub async fn create_agent_job(
        &self,
        agent: &str,
        total_items: u32,
        started_at: DateTime<Utc>,
    ) -> Result<AgentJob> {
        self.check_writable()?;
        let id = new_id();
        let started = format_ts(&started_at);
        self.conn
            .execute(
                "INSERT INTO agent_jobs (id, agent_name, status, total_items, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    agent,
                    JobStatus::Running.as_str(),
                    total_items as i64,
                    started.as_str()
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    PipelineError::validation(format!("agent '{agent}' already has a running job"))
                } else {
                    PipelineError::storage(e)
                }
            })?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| PipelineError::not_found("agent job", id))
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &str) -> Result<Option<AgentJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// The running job of `agent`, if any.
    pub async fn find_running_job(&self, agent: &str) -> Result<Option<AgentJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs WHERE agent_name = ?1 AND status = 'running'"
        );
        let mut rows = self
            .conn
            .query(&sql, params![agent])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent jobs, optionally for a single agent.
    pub async fn list_jobs(&self, agent: Option<&str>, limit: u32) -> Result<Vec<AgentJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs
             WHERE ?1 IS NULL OR agent_name = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![agent, limit as i64])
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Record the item a job is working on.
    pub async fn set_job_current_item(
        &self,
        job_id: &str,
        item_id: &str,
        title: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE agent_jobs SET current_item_id = ?2, current_item_title = ?3 WHERE id = ?1",
                params![job_id, item_id, title],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Persist progress counters.
    pub async fn record_job_progress(&self, job_id: &str, counts: JobCounts) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE agent_jobs
                 SET processed_items = ?2, success_count = ?3, failed_count = ?4
                 WHERE id = ?1",
                params![
                    job_id,
                    counts.processed as i64,
                    counts.success as i64,
                    counts.failed as i64
                ],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Close out a job with its final counters.
    ///
    /// A job that was cancelled meanwhile keeps its `cancelled` status but
    /// still receives the counts.
    pub async fn finish_job(&self, job_id: &str, counts: JobCounts) -> Result<AgentJob> {
        self.check_writable()?;
        let now = now_ts();
        self.conn
            .execute(
                "UPDATE agent_jobs SET
                    status = CASE WHEN status = 'running' THEN 'completed' ELSE status END,
                    processed_items = ?2,
                    success_count = ?3,
                    failed_count = ?4,
                    current_item_id = NULL,
                    current_item_title = NULL,
                    completed_at = COALESCE(completed_at, ?5)
                 WHERE id = ?1",
                params![
                    job_id,
                    counts.processed as i64,
                    counts.success as i64,
                    counts.failed as i64,
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        self.get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("agent job", job_id))
    }

    /// Mark a running job failed. Returns whether a row changed.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> Result<bool> {
        self.check_writable()?;
        let now = now_ts();
        let changed = self
            .conn
            .execute(
                "UPDATE agent_jobs
                 SET status = 'failed', error_message = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![job_id, message, now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(changed > 0)
    }

    /// Cancel the running job of `agent`. Returns the cancelled job, if any.
    pub async fn cancel_running_job(&self, agent: &str) -> Result<Option<AgentJob>> {
        self.check_writable()?;
        let Some(job) = self.find_running_job(agent).await? else {
            return Ok(None);
        };
        let now = now_ts();
        let changed = self
            .conn
            .execute(
                "UPDATE agent_jobs SET status = 'cancelled', completed_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![job.id.as_str(), now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)?;

        if changed == 0 {
            return Ok(None);
        }
        tracing::info!(agent, job_id = %job.id, "job cancelled");
        self.get_job(&job.id).await
    }
}
