//! Work-in-progress limits per agent.

use serde::Serialize;
use tracing::debug;

use pipewright_shared::{Result, StatusCode};
use pipewright_storage::Storage;

/// Admission capacity of one agent's working stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capacity {
    pub current: u64,
    pub limit: u64,
    pub available: u64,
    pub utilization_pct: f64,
}

impl Capacity {
    pub fn new(current: u64, limit: u64) -> Self {
        let utilization_pct = if limit == 0 {
            100.0
        } else {
            (current as f64 / limit as f64 * 1000.0).round() / 10.0
        };
        Self {
            current,
            limit,
            available: limit.saturating_sub(current),
            utilization_pct,
        }
    }

    pub fn is_full(&self) -> bool {
        self.available == 0
    }
}

/// Counts in-flight items against per-agent limits.
pub struct WipController<'a> {
    storage: &'a Storage,
}

impl<'a> WipController<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Items currently sitting in `working_code`.
    pub async fn current_wip(&self, working_code: StatusCode) -> Result<u64> {
        self.storage.count_in_status(working_code).await
    }

    pub async fn check_capacity(
        &self,
        agent: &str,
        working_code: StatusCode,
        limit: u32,
    ) -> Result<Capacity> {
        let current = self.current_wip(working_code).await?;
        let capacity = Capacity::new(current, u64::from(limit));
        debug!(
            agent,
            current = capacity.current,
            limit = capacity.limit,
            available = capacity.available,
            "wip capacity"
        );
        Ok(capacity)
    }
}
