//! Core domain types for the pipeline: queue items, runs, steps, jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer code of a pipeline stage (e.g. `220` for `to_tag`).
pub type StatusCode = i64;

/// Stage code every dead-lettered item is moved to.
pub const DEAD_LETTER_CODE: StatusCode = 599;

/// Generate a new time-sortable record identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How an item entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    Manual,
    Rss,
    Sitemap,
    Discovery,
}

impl EntryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Rss => "rss",
            Self::Sitemap => "sitemap",
            Self::Discovery => "discovery",
        }
    }

    /// Parse a stored origin. Unrecognized values count as discovery.
    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "rss" => Self::Rss,
            "sitemap" => Self::Sitemap,
            _ => Self::Discovery,
        }
    }

    /// The run trigger implied by this origin.
    pub fn trigger(&self) -> RunTrigger {
        match self {
            Self::Manual => RunTrigger::Manual,
            _ => RunTrigger::Discovery,
        }
    }
}

/// What started a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Discovery,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Discovery => "discovery",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            _ => Self::Discovery,
        }
    }
}

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Status of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    /// Abandoned job reclaimed by stale-job recovery.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Identity recorded against a stage transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Agent(String),
    User(String),
    System(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(name) => write!(f, "agent:{name}"),
            Self::User(name) => write!(f, "user:{name}"),
            Self::System(name) => write!(f, "system:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog records
// ---------------------------------------------------------------------------

/// A named pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub code: StatusCode,
    pub name: String,
}

/// A legal edge of the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEdge {
    pub from: StatusCode,
    pub to: StatusCode,
    pub manual: bool,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

/// One content record travelling through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub url: Option<String>,
    pub status_code: StatusCode,
    /// Title, extracted fields and enrichment outputs.
    pub payload: serde_json::Value,
    pub origin: EntryOrigin,
    pub current_run_id: Option<String>,
    /// Consecutive failures of `last_failed_step`.
    pub failure_count: u32,
    pub last_failed_step: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_type: Option<String>,
    pub last_error_signature: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Advisory earliest retry time written after a retryable failure.
    pub retry_after: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Title from the payload, if any, clipped for display.
    pub fn title(&self) -> Option<String> {
        self.payload
            .get("title")
            .and_then(|t| t.as_str())
            .map(|t| t.chars().take(100).collect())
    }
}

/// Input for enqueueing a new item.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub url: Option<String>,
    pub status_code: StatusCode,
    pub payload: serde_json::Value,
    pub origin: EntryOrigin,
}

// ---------------------------------------------------------------------------
// Runs, steps, jobs
// ---------------------------------------------------------------------------

/// Token and cost usage reported by an agent call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// One lifecycle instance of an item moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub queue_item_id: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    /// Summary written by the last non-simulated replay.
    pub replay_validation: Option<serde_json::Value>,
    pub replayed_at: Option<DateTime<Utc>>,
}

/// One attempt of one pipeline step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_name: String,
    pub attempt: u32,
    /// `{item_id}:{step_name}:{attempt}`.
    pub idempotency_key: Option<String>,
    pub status: StepStatus,
    pub input_snapshot: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_signature: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A batch invocation of one named agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJob {
    pub id: String,
    pub agent_name: String,
    pub status: JobStatus,
    pub total_items: u32,
    pub processed_items: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub current_item_id: Option<String>,
    pub current_item_title: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
