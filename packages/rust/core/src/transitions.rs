//! Transition table: the legal stage graph, cached in memory.
//!
//! Same-stage transitions are always legal. Manual edges only count when
//! the caller asks for a manual transition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use tracing::{debug, instrument};

use pipewright_shared::{PipelineError, Result, StatusCode, TransitionEdge};
use pipewright_storage::Storage;

use crate::registry::StatusRegistry;

const COMPONENT: &str = "transition table";

#[derive(Debug, Default)]
struct Graph {
    automatic: BTreeMap<StatusCode, BTreeSet<StatusCode>>,
    manual: BTreeMap<StatusCode, BTreeSet<StatusCode>>,
}

impl Graph {
    fn from_edges(edges: &[TransitionEdge]) -> Self {
        let mut graph = Self::default();
        for edge in edges {
            let side = if edge.manual {
                &mut graph.manual
            } else {
                &mut graph.automatic
            };
            side.entry(edge.from).or_default().insert(edge.to);
        }
        graph
    }

    fn has_edge(&self, from: StatusCode, to: StatusCode, manual: bool) -> bool {
        let in_side = |side: &BTreeMap<StatusCode, BTreeSet<StatusCode>>| {
            side.get(&from).is_some_and(|targets| targets.contains(&to))
        };
        in_side(&self.automatic) || (manual && in_side(&self.manual))
    }
}

/// Legality queries over the stage graph.
#[derive(Debug, Default)]
pub struct TransitionTable {
    inner: RwLock<Option<Arc<Graph>>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-loaded with `edges`.
    pub fn from_edges(edges: &[TransitionEdge]) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(Graph::from_edges(edges)))),
        }
    }

    /// Load the graph if it is not loaded yet.
    pub async fn load(&self, storage: &Storage) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        self.reload(storage).await
    }

    /// Re-read the graph from the store.
    #[instrument(skip_all)]
    pub async fn reload(&self, storage: &Storage) -> Result<()> {
        let edges = storage.list_transitions().await?;
        debug!(count = edges.len(), "transition table loaded");
        let graph = Arc::new(Graph::from_edges(&edges));
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(graph);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn graph(&self) -> Result<Arc<Graph>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PipelineError::NotInitialized {
                component: COMPONENT,
            })
    }

    /// Whether `from → to` is allowed. `manual` admits manual-only edges.
    pub fn is_legal(&self, from: StatusCode, to: StatusCode, manual: bool) -> Result<bool> {
        let graph = self.graph()?;
        Ok(from == to || graph.has_edge(from, to, manual))
    }

    /// Destinations reachable in one step from `from`, ascending.
    pub fn next_states(&self, from: StatusCode, include_manual: bool) -> Result<Vec<StatusCode>> {
        let graph = self.graph()?;
        let mut targets: BTreeSet<StatusCode> =
            graph.automatic.get(&from).cloned().unwrap_or_default();
        if include_manual {
            if let Some(manual) = graph.manual.get(&from) {
                targets.extend(manual.iter().copied());
            }
        }
        Ok(targets.into_iter().collect())
    }

    /// Fail with a readable [`PipelineError::InvalidTransition`] unless the
    /// transition is legal.
    pub fn validate(
        &self,
        from: StatusCode,
        to: StatusCode,
        manual: bool,
        registry: &StatusRegistry,
    ) -> Result<()> {
        if self.is_legal(from, to, manual)? {
            return Ok(());
        }

        let label = |code: StatusCode| -> Result<String> {
            Ok(registry.name(code)?.unwrap_or_else(|| code.to_string()))
        };
        let valid = self
            .next_states(from, manual)?
            .into_iter()
            .map(&label)
            .collect::<Result<Vec<_>>>()?;

        Err(PipelineError::InvalidTransition {
            from,
            to,
            message: format!(
                "Invalid state transition: {} ({from}) → {} ({to}). Valid next states: [{}]{}",
                label(from)?,
                label(to)?,
                valid.join(", "),
                if manual { " (including manual)" } else { "" }
            ),
        })
    }

    /// No outgoing edges at all.
    pub fn is_terminal(&self, code: StatusCode) -> Result<bool> {
        Ok(self.next_states(code, true)?.is_empty())
    }

    /// No outgoing automatic edges: only an operator can move the item on.
    pub fn ends_automation(&self, code: StatusCode) -> Result<bool> {
        Ok(self.next_states(code, false)?.is_empty())
    }

    /// Render the graph as a Mermaid `stateDiagram-v2`.
    ///
    /// Automatic edges are solid; manual edges are dashed and labelled.
    /// Stages without any outgoing edge point to the final state.
    pub fn to_mermaid(&self, registry: &StatusRegistry) -> Result<String> {
        let graph = self.graph()?;
        let node = |code: StatusCode| -> Result<String> {
            Ok(registry
                .name(code)?
                .unwrap_or_else(|| format!("status_{code}")))
        };

        let mut diagram = String::from("stateDiagram-v2\n");
        for (from, targets) in &graph.automatic {
            for to in targets {
                let _ = writeln!(diagram, "    {} --> {}", node(*from)?, node(*to)?);
            }
        }
        for (from, targets) in &graph.manual {
            for to in targets {
                let _ = writeln!(diagram, "    {} -.-> {} : manual", node(*from)?, node(*to)?);
            }
        }
        for entry in registry.entries()? {
            let referenced =
                graph.automatic.values().chain(graph.manual.values()).any(|t| t.contains(&entry.code));
            if referenced && self.is_terminal(entry.code)? {
                let _ = writeln!(diagram, "    {} --> [*]", entry.name);
            }
        }
        Ok(diagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_shared::StatusEntry;

    fn edge(from: StatusCode, to: StatusCode, manual: bool) -> TransitionEdge {
        TransitionEdge {
            from,
            to,
            manual,
            description: None,
        }
    }

    fn table() -> TransitionTable {
        TransitionTable::from_edges(&[
            edge(220, 221, false),
            edge(221, 230, false),
            edge(221, 220, false),
            edge(221, 599, false),
            edge(599, 220, true),
            edge(230, 231, false),
        ])
    }

    fn registry() -> StatusRegistry {
        StatusRegistry::from_entries(
            [
                (220, "to_tag"),
                (221, "tagging"),
                (230, "to_thumbnail"),
                (231, "thumbnailing"),
                (300, "pending_review"),
                (599, "dead_letter"),
            ]
            .into_iter()
            .map(|(code, name)| StatusEntry {
                code,
                name: name.into(),
            })
            .collect(),
        )
    }

    #[test]
    fn queries_before_load_fail() {
        let table = TransitionTable::new();
        assert!(matches!(
            table.is_legal(220, 221, false),
            Err(PipelineError::NotInitialized { .. })
        ));
    }

    #[test]
    fn same_stage_always_legal() {
        let table = table();
        for code in [100, 220, 599, 12345] {
            assert!(table.is_legal(code, code, false).unwrap());
            assert!(table.is_legal(code, code, true).unwrap());
        }
    }

    #[test]
    fn pairs_outside_the_table_are_illegal() {
        let table = table();
        let codes = [220, 221, 230, 231, 300, 599];
        let known = [(220, 221), (221, 230), (221, 220), (221, 599), (230, 231)];
        for from in codes {
            for to in codes {
                if from == to || known.contains(&(from, to)) {
                    continue;
                }
                assert!(!table.is_legal(from, to, false).unwrap(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn manual_edges_need_manual_flag() {
        let table = table();
        assert!(!table.is_legal(599, 220, false).unwrap());
        assert!(table.is_legal(599, 220, true).unwrap());
        assert_eq!(table.next_states(599, false).unwrap(), Vec::<StatusCode>::new());
        assert_eq!(table.next_states(599, true).unwrap(), vec![220]);
    }

    #[test]
    fn validate_names_valid_next_states() {
        let table = table();
        let err = table.validate(221, 300, false, &registry()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: tagging (221) → pending_review (300). \
             Valid next states: [to_tag, to_thumbnail, dead_letter]"
        );

        let err = table.validate(599, 230, true, &registry()).unwrap_err();
        assert!(err.to_string().ends_with("[to_tag] (including manual)"));
        assert!(table.validate(221, 230, false, &registry()).is_ok());
    }

    #[test]
    fn terminal_and_automation_end() {
        let table = table();
        assert!(table.is_terminal(231).unwrap());
        assert!(!table.is_terminal(599).unwrap());
        assert!(table.ends_automation(599).unwrap());
        assert!(!table.ends_automation(221).unwrap());
    }

    #[test]
    fn mermaid_export() {
        let diagram = table().to_mermaid(&registry()).unwrap();
        assert!(diagram.starts_with("stateDiagram-v2\n"));
        assert!(diagram.contains("    to_tag --> tagging\n"));
        assert!(diagram.contains("    dead_letter -.-> to_tag : manual\n"));
        assert!(diagram.contains("    thumbnailing --> [*]\n"));
        assert!(!diagram.contains("pending_review"));
    }
}
