//! Queue items and their status history.
//!
//! Every stage change goes through [`Storage::transition_item`], a single
//! compare-and-swap `UPDATE` guarded by the transition graph. Two processes
//! racing on the same item cannot both win: the loser sees the item's new
//! stage and gets [`PipelineError::InvalidTransition`].

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use pipewright_shared::{
    Actor, EntryOrigin, NewQueueItem, PipelineError, QueueItem, Result, StatusCode, new_id,
};
use serde_json::Value;

use crate::{
    Storage, col_i64, col_opt_json, col_opt_str, col_opt_ts, col_str, col_ts, format_ts, now_ts,
    to_u32,
};

const ITEM_COLUMNS: &str = "id, url, status_code, payload, origin, current_run_id, failure_count, \
     last_failed_step, last_error_message, last_error_type, last_error_signature, last_error_at, \
     retry_after, discovered_at, updated_at";

/// A requested stage change plus the item fields that change with it.
#[derive(Debug, Clone)]
pub struct TransitionRequest<'a> {
    pub item_id: &'a str,
    pub to: StatusCode,
    pub actor: &'a Actor,
    /// Allow manual-only edges.
    pub manual: bool,
    /// Refuse the move unless the item is still in this stage.
    pub expected_from: Option<StatusCode>,
    pub changes: ItemChanges,
}

/// Field updates applied atomically with a transition.
#[derive(Debug, Clone, Default)]
pub struct ItemChanges {
    /// Replacement payload.
    pub payload: Option<Value>,
    /// Failure bookkeeping after a failed step.
    pub failure: Option<FailureRecord>,
    /// Reset the failure count and retry hint after a successful step.
    pub clear_failures: bool,
    /// Drop the item's run pointer so the next step opens a fresh run.
    pub detach_run: bool,
}

/// Failure bookkeeping written onto the item.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub step: String,
    pub count: u32,
    pub message: String,
    pub error_type: String,
    pub signature: String,
    pub at: DateTime<Utc>,
    pub retry_after: Option<DateTime<Utc>>,
}

/// One row of an item's status history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub from: StatusCode,
    pub to: StatusCode,
    pub actor: String,
    pub manual: bool,
    pub changed_at: DateTime<Utc>,
}

fn moved_concurrently(req: &TransitionRequest<'_>, expected: StatusCode, actual: StatusCode) -> PipelineError {
    PipelineError::InvalidTransition {
        from: actual,
        to: req.to,
        message: format!(
            "item {} moved from {expected} to {actual} concurrently",
            req.item_id
        ),
    }
}

fn row_to_item(row: &Row) -> Result<QueueItem> {
    let payload = col_opt_json(row, 3)?.unwrap_or_else(|| Value::Object(Default::default()));
    Ok(QueueItem {
        id: col_str(row, 0)?,
        url: col_opt_str(row, 1),
        status_code: col_i64(row, 2)?,
        payload,
        origin: EntryOrigin::parse(&col_str(row, 4)?),
        current_run_id: col_opt_str(row, 5),
        failure_count: to_u32(col_i64(row, 6)?),
        last_failed_step: col_opt_str(row, 7),
        last_error_message: col_opt_str(row, 8),
        last_error_type: col_opt_str(row, 9),
        last_error_signature: col_opt_str(row, 10),
        last_error_at: col_opt_ts(row, 11)?,
        retry_after: col_opt_ts(row, 12)?,
        discovered_at: col_ts(row, 13)?,
        updated_at: col_ts(row, 14)?,
    })
}

impl Storage {
    /// Insert a new item at the requested stage.
    pub async fn enqueue_item(&self, item: &NewQueueItem) -> Result<QueueItem> {
        self.check_writable()?;
        if !item.payload.is_object() {
            return Err(PipelineError::validation("payload must be a JSON object"));
        }
        if !self.status_exists(item.status_code).await? {
            return Err(PipelineError::UnknownStatus(item.status_code.to_string()));
        }

        let id = new_id();
        let now = now_ts();
        let payload = item.payload.to_string();
        self.conn
            .execute(
                "INSERT INTO queue_items (id, url, status_code, payload, origin, discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    item.url.as_deref(),
                    item.status_code,
                    payload.as_str(),
                    item.origin.as_str(),
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        tracing::debug!(item_id = %id, status = item.status_code, "enqueued item");
        self.require_item(&id).await
    }

    async fn status_exists(&self, code: StatusCode) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM statuses WHERE code = ?1", params![code])
            .await
            .map_err(PipelineError::storage)?;
        Ok(rows.next().await.map_err(PipelineError::storage)?.is_some())
    }

    /// Get an item by ID.
    pub async fn get_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Get an item by ID, failing with `NotFound` when it is absent.
    pub async fn require_item(&self, id: &str) -> Result<QueueItem> {
        self.get_item(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("queue item", id))
    }

    /// Up to `limit` items in `status`, oldest discovery first.
    pub async fn select_ready_items(&self, status: StatusCode, limit: u32) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items
             WHERE status_code = ?1
             ORDER BY discovered_at, rowid
             LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![status, limit as i64])
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// IDs of every item currently in `status`.
    pub async fn item_ids_in_status(&self, status: StatusCode) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM queue_items WHERE status_code = ?1 ORDER BY discovered_at, rowid",
                params![status],
            )
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(col_str(&row, 0)?);
        }
        Ok(results)
    }

    /// Number of items currently in `status`.
    pub async fn count_in_status(&self, status: StatusCode) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM queue_items WHERE status_code = ?1",
                params![status],
            )
            .await
            .map_err(PipelineError::storage)?;

        match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => Ok(col_i64(&row, 0)?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Point the item at its active run.
    pub async fn set_item_run(&self, item_id: &str, run_id: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let now = now_ts();
        self.conn
            .execute(
                "UPDATE queue_items SET current_run_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![item_id, run_id, now.as_str()],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Move an item to `req.to` if the edge from its current stage is legal,
    /// applying `req.changes` and appending a history row in one transaction.
    ///
    /// Returns the updated item.
    pub async fn transition_item(&self, req: &TransitionRequest<'_>) -> Result<QueueItem> {
        self.check_writable()?;
        let current = self.require_item(req.item_id).await?;
        let from = current.status_code;
        if let Some(expected) = req.expected_from {
            if expected != from {
                return Err(moved_concurrently(req, expected, from));
            }
        }

        let now = now_ts();
        let payload = req.changes.payload.as_ref().map(Value::to_string);
        let failure = req.changes.failure.as_ref();
        let failure_at = failure.map(|f| format_ts(&f.at));
        let retry_after = failure.and_then(|f| f.retry_after.as_ref()).map(format_ts);

        let sql = format!(
            "UPDATE queue_items SET
                status_code = ?2,
                payload = COALESCE(?5, payload),
                failure_count = CASE WHEN ?6 IS NOT NULL THEN ?6 WHEN ?7 = 1 THEN 0 ELSE failure_count END,
                last_failed_step = CASE WHEN ?6 IS NOT NULL THEN ?8 ELSE last_failed_step END,
                last_error_message = CASE WHEN ?6 IS NOT NULL THEN ?9 ELSE last_error_message END,
                last_error_type = CASE WHEN ?6 IS NOT NULL THEN ?10 ELSE last_error_type END,
                last_error_signature = CASE WHEN ?6 IS NOT NULL THEN ?11 ELSE last_error_signature END,
                last_error_at = CASE WHEN ?6 IS NOT NULL THEN ?12 ELSE last_error_at END,
                retry_after = CASE WHEN ?6 IS NOT NULL THEN ?13 WHEN ?7 = 1 THEN NULL ELSE retry_after END,
                current_run_id = CASE WHEN ?15 = 1 THEN NULL ELSE current_run_id END,
                updated_at = ?14
             WHERE id = ?1
               AND status_code = ?3
               AND (?2 = ?3 OR EXISTS (
                    SELECT 1 FROM state_transitions t
                    WHERE t.from_status = ?3 AND t.to_status = ?2
                      AND (t.is_manual = 0 OR ?4 = 1)))
             RETURNING {ITEM_COLUMNS}"
        );

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(PipelineError::storage)?;

        let mut rows = tx
            .query(
                &sql,
                params![
                    req.item_id,
                    req.to,
                    from,
                    req.manual as i64,
                    payload.as_deref(),
                    failure.map(|f| f.count as i64),
                    req.changes.clear_failures as i64,
                    failure.map(|f| f.step.as_str()),
                    failure.map(|f| f.message.as_str()),
                    failure.map(|f| f.error_type.as_str()),
                    failure.map(|f| f.signature.as_str()),
                    failure_at.as_deref(),
                    retry_after.as_deref(),
                    now.as_str(),
                    req.changes.detach_run as i64
                ],
            )
            .await
            .map_err(PipelineError::storage)?;

        let updated = match rows.next().await.map_err(PipelineError::storage)? {
            Some(row) => row_to_item(&row)?,
            None => {
                drop(rows);
                tx.rollback().await.map_err(PipelineError::storage)?;
                return Err(self.rejected_transition(req, from).await);
            }
        };
        drop(rows);

        if from != req.to {
            let actor = req.actor.to_string();
            tx.execute(
                "INSERT INTO status_history (queue_item_id, from_status, to_status, actor, is_manual, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    req.item_id,
                    from,
                    req.to,
                    actor.as_str(),
                    req.manual as i64,
                    now.as_str()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;
        }

        tx.commit().await.map_err(PipelineError::storage)?;

        tracing::debug!(
            item_id = req.item_id,
            from,
            to = req.to,
            actor = %req.actor,
            "item transitioned"
        );
        Ok(updated)
    }

    /// Build the error for a transition the guarded update refused.
    async fn rejected_transition(&self, req: &TransitionRequest<'_>, from: StatusCode) -> PipelineError {
        match self.get_item(req.item_id).await {
            Ok(Some(item)) if item.status_code != from => {
                moved_concurrently(req, from, item.status_code)
            }
            Ok(Some(_)) => PipelineError::InvalidTransition {
                from,
                to: req.to,
                message: format!("Invalid state transition: {from} → {}", req.to),
            },
            Ok(None) => PipelineError::not_found("queue item", req.item_id),
            Err(e) => e,
        }
    }

    /// Stage changes recorded for an item, oldest first.
    pub async fn status_history(&self, item_id: &str) -> Result<Vec<StatusChange>> {
        let mut rows = self
            .conn
            .query(
                "SELECT from_status, to_status, actor, is_manual, changed_at
                 FROM status_history
                 WHERE queue_item_id = ?1
                 ORDER BY id",
                params![item_id],
            )
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(StatusChange {
                from: col_i64(&row, 0)?,
                to: col_i64(&row, 1)?,
                actor: col_str(&row, 2)?,
                manual: col_i64(&row, 3)? != 0,
                changed_at: col_ts(&row, 4)?,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use serde_json::json;

    fn new_item(status: StatusCode) -> NewQueueItem {
        NewQueueItem {
            url: Some("https://example.com/post".into()),
            status_code: status,
            payload: json!({ "title": "A post" }),
            origin: EntryOrigin::Rss,
        }
    }

    fn tagger() -> Actor {
        Actor::Agent("tagger".into())
    }

    #[tokio::test]
    async fn enqueue_and_get() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(220)).await.expect("enqueue");

        assert_eq!(item.status_code, 220);
        assert_eq!(item.failure_count, 0);
        assert_eq!(item.origin, EntryOrigin::Rss);
        assert_eq!(item.title().as_deref(), Some("A post"));

        let found = storage.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(found.id, item.id);
        assert!(storage.get_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_status_and_non_object_payload() {
        let storage = test_storage().await;
        let err = storage.enqueue_item(&new_item(777)).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStatus(_)));

        let mut bad = new_item(220);
        bad.payload = json!([1, 2, 3]);
        let err = storage.enqueue_item(&bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[tokio::test]
    async fn ready_items_are_fifo_and_limited() {
        let storage = test_storage().await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(storage.enqueue_item(&new_item(220)).await.unwrap().id);
        }
        storage.enqueue_item(&new_item(210)).await.unwrap();

        let picked = storage.select_ready_items(220, 3).await.unwrap();
        let picked: Vec<String> = picked.into_iter().map(|i| i.id).collect();
        assert_eq!(picked, ids[..3].to_vec());
        assert_eq!(storage.count_in_status(220).await.unwrap(), 4);
        assert_eq!(storage.count_in_status(221).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn legal_transition_updates_item_and_history() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(220)).await.unwrap();
        let actor = tagger();

        let moved = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 221,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges::default(),
            })
            .await
            .expect("220 -> 221 is legal");
        assert_eq!(moved.status_code, 221);

        let history = storage.status_history(&item.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].from, history[0].to), (220, 221));
        assert_eq!(history[0].actor, "agent:tagger");
    }

    #[tokio::test]
    async fn illegal_transition_leaves_item_untouched() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(220)).await.unwrap();
        let actor = tagger();

        let err = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 400,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges {
                    payload: Some(json!({ "title": "changed" })),
                    ..Default::default()
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { from: 220, to: 400, .. }));

        let after = storage.require_item(&item.id).await.unwrap();
        assert_eq!(after.status_code, 220);
        assert_eq!(after.title().as_deref(), Some("A post"));
        assert!(storage.status_history(&item.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_edges_need_manual_flag() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(599)).await.unwrap();
        let actor = Actor::User("ops".into());

        let mut req = TransitionRequest {
            item_id: &item.id,
            to: 220,
            actor: &actor,
            manual: false,
            expected_from: None,
            changes: ItemChanges::default(),
        };
        assert!(storage.transition_item(&req).await.is_err());

        req.manual = true;
        let moved = storage.transition_item(&req).await.unwrap();
        assert_eq!(moved.status_code, 220);
        assert!(storage.status_history(&item.id).await.unwrap()[0].manual);
    }

    #[tokio::test]
    async fn expected_stage_guards_the_move() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(221)).await.unwrap();
        let actor = tagger();

        let err = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 221,
                actor: &actor,
                manual: false,
                expected_from: Some(220),
                changes: ItemChanges::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { from: 221, to: 221, .. }));
        assert!(err.to_string().contains("moved from 220 to 221 concurrently"));
        assert_eq!(storage.require_item(&item.id).await.unwrap().updated_at, item.updated_at);
    }

    #[tokio::test]
    async fn detach_run_clears_the_run_pointer() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(599)).await.unwrap();
        let run = storage
            .create_run(&item.id, pipewright_shared::RunTrigger::Manual)
            .await
            .unwrap();
        storage.set_item_run(&item.id, Some(&run.id)).await.unwrap();
        let actor = Actor::User("ops".into());

        let moved = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 220,
                actor: &actor,
                manual: true,
                expected_from: None,
                changes: ItemChanges {
                    detach_run: true,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(moved.status_code, 220);
        assert!(moved.current_run_id.is_none());
    }

    #[tokio::test]
    async fn same_stage_transition_is_legal_without_history() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(220)).await.unwrap();
        let actor = tagger();

        let moved = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 220,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges {
                    payload: Some(json!({ "title": "A post", "tags": ["rust"] })),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(moved.payload["tags"][0], "rust");
        assert!(storage.status_history(&item.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_bookkeeping_and_reset() {
        let storage = test_storage().await;
        let item = storage.enqueue_item(&new_item(221)).await.unwrap();
        let actor = tagger();
        let at = Utc::now();

        let failed = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 220,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges {
                    failure: Some(FailureRecord {
                        step: "tag".into(),
                        count: 1,
                        message: "boom".into(),
                        error_type: "unknown".into(),
                        signature: "boom".into(),
                        at,
                        retry_after: Some(at + chrono::Duration::seconds(2)),
                    }),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(failed.failure_count, 1);
        assert_eq!(failed.last_failed_step.as_deref(), Some("tag"));
        assert_eq!(failed.last_error_message.as_deref(), Some("boom"));
        assert!(failed.retry_after.is_some());

        let retried = storage
            .transition_item(&TransitionRequest {
                item_id: &item.id,
                to: 221,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges {
                    clear_failures: true,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(retried.failure_count, 0);
        assert!(retried.retry_after.is_none());
        assert_eq!(retried.last_error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn transition_of_missing_item_is_not_found() {
        let storage = test_storage().await;
        let actor = tagger();
        let err = storage
            .transition_item(&TransitionRequest {
                item_id: "nope",
                to: 221,
                actor: &actor,
                manual: false,
                expected_from: None,
                changes: ItemChanges::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }
}
