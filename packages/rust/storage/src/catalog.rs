//! Stage catalogue and transition graph tables.

use libsql::params;
use pipewright_shared::{PipelineError, Result, StatusCode, StatusEntry, TransitionEdge};

use crate::{Storage, col_i64, col_opt_str, col_str};

impl Storage {
    /// All known stages, ordered by code.
    pub async fn list_statuses(&self) -> Result<Vec<StatusEntry>> {
        let mut rows = self
            .conn
            .query("SELECT code, name FROM statuses ORDER BY code", params![])
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(StatusEntry {
                code: col_i64(&row, 0)?,
                name: col_str(&row, 1)?,
            });
        }
        Ok(results)
    }

    /// Every edge of the stage graph, automatic and manual.
    pub async fn list_transitions(&self) -> Result<Vec<TransitionEdge>> {
        let mut rows = self
            .conn
            .query(
                "SELECT from_status, to_status, is_manual, description
                 FROM state_transitions
                 ORDER BY from_status, to_status, is_manual",
                params![],
            )
            .await
            .map_err(PipelineError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(PipelineError::storage)? {
            results.push(TransitionEdge {
                from: col_i64(&row, 0)?,
                to: col_i64(&row, 1)?,
                manual: col_i64(&row, 2)? != 0,
                description: col_opt_str(&row, 3),
            });
        }
        Ok(results)
    }

    /// Add a stage, or rename an existing code.
    pub async fn upsert_status(&self, code: StatusCode, name: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO statuses (code, name) VALUES (?1, ?2)
                 ON CONFLICT(code) DO UPDATE SET name = excluded.name",
                params![code, name],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Add an edge to the stage graph. Existing edges are left untouched.
    pub async fn insert_transition(&self, edge: &TransitionEdge) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO state_transitions (from_status, to_status, is_manual, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    edge.from,
                    edge.to,
                    edge.manual as i64,
                    edge.description.as_deref()
                ],
            )
            .await
            .map_err(PipelineError::storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use pipewright_shared::TransitionEdge;

    #[tokio::test]
    async fn seeded_catalogue_has_pipeline_stages() {
        let storage = test_storage().await;
        let statuses = storage.list_statuses().await.unwrap();

        let find = |name: &str| statuses.iter().find(|s| s.name == name).map(|s| s.code);
        assert_eq!(find("to_tag"), Some(220));
        assert_eq!(find("tagging"), Some(221));
        assert_eq!(find("to_thumbnail"), Some(230));
        assert_eq!(find("dead_letter"), Some(599));

        let codes: Vec<i64> = statuses.iter().map(|s| s.code).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);
    }

    #[tokio::test]
    async fn seeded_graph_marks_operator_edges_manual() {
        let storage = test_storage().await;
        let edges = storage.list_transitions().await.unwrap();

        let edge = |from, to| edges.iter().find(|e| e.from == from && e.to == to);
        assert!(!edge(220, 221).unwrap().manual);
        assert!(!edge(221, 599).unwrap().manual);
        assert!(edge(599, 220).unwrap().manual);
        assert!(edge(220, 230).is_none());
    }

    #[tokio::test]
    async fn custom_stages_can_be_added() {
        let storage = test_storage().await;
        storage.upsert_status(250, "to_translate").await.unwrap();
        storage.upsert_status(251, "translating").await.unwrap();
        storage
            .insert_transition(&TransitionEdge {
                from: 250,
                to: 251,
                manual: false,
                description: Some("start translation".into()),
            })
            .await
            .unwrap();

        let edges = storage.list_transitions().await.unwrap();
        let added = edges.iter().find(|e| e.from == 250).unwrap();
        assert_eq!(added.to, 251);
        assert_eq!(added.description.as_deref(), Some("start translation"));
    }
}
