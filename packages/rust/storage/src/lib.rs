//! Turso Embedded / libSQL storage layer for the pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding the stage catalogue,
//! the transition graph, queue items and their status history, agent jobs,
//! and the run/step execution trace.
//!
//! **Access rules:**
//! - Orchestrator and CLI writes: read-write via [`Storage::open`]
//! - Inspection and simulated replay: read-only via [`Storage::open_readonly`]
//!
//! Operations are grouped by table family in the `catalog`, `queue`, `jobs`
//! and `runs` modules; each adds methods to [`Storage`].

mod catalog;
mod jobs;
mod migrations;
mod queue;
mod runs;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, params};
use pipewright_shared::{PipelineError, Result};

pub use jobs::JobCounts;
pub use queue::{FailureRecord, ItemChanges, StatusChange, TransitionRequest};
pub use runs::{RunSampleFilter, StepCompletion};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(PipelineError::storage)?;
        let conn = db.connect().map_err(PipelineError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.configure_connection().await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(PipelineError::storage)?;
        let conn = db.connect().map_err(PipelineError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: true,
        };
        storage.configure_connection().await?;
        Ok(storage)
    }

    async fn configure_connection(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PipelineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column helpers shared by the table modules
// ---------------------------------------------------------------------------

/// Timestamps are stored as fixed-width RFC 3339 so they sort lexically.
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(&Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn col_str(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(PipelineError::storage)
}

pub(crate) fn col_i64(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(PipelineError::storage)
}

pub(crate) fn col_f64(row: &Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx).map_err(PipelineError::storage)
}

/// Nullable text column.
pub(crate) fn col_opt_str(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn col_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&col_str(row, idx)?)
}

pub(crate) fn col_opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    col_opt_str(row, idx).map(|s| parse_ts(&s)).transpose()
}

/// Nullable JSON text column.
pub(crate) fn col_opt_json(row: &Row, idx: i32) -> Result<Option<serde_json::Value>> {
    col_opt_str(row, idx)
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| PipelineError::Storage(format!("bad JSON in column {idx}: {e}")))
        })
        .transpose()
}

pub(crate) fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}


#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use pipewright_shared::{EntryOrigin, NewQueueItem, new_id};

    #[tokio::test]
    async fn open_applies_all_migrations() {
        let storage = test_storage().await;
        assert_eq!(storage.schema_version().await, 3);
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", new_id()));
        let first = Storage::open(&tmp).await.unwrap();
        let statuses = first.list_statuses().await.unwrap().len();
        drop(first);

        let second = Storage::open(&tmp).await.unwrap();
        assert_eq!(second.list_statuses().await.unwrap().len(), statuses);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&early)).unwrap(), early);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", new_id()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .enqueue_item(&NewQueueItem {
                url: Some("https://example.com/a".into()),
                status_code: 120,
                payload: serde_json::json!({}),
                origin: EntryOrigin::Manual,
            })
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
