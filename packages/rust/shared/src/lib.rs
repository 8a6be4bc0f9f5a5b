//! Shared types, error model, and configuration for Pipewright.
//!
//! This crate is the foundation depended on by all other Pipewright crates.
//! It provides:
//! - [`PipelineError`], the unified error type, and [`StepError`] for agent failures
//! - Domain types ([`QueueItem`], [`PipelineRun`], [`StepRun`], [`AgentJob`])
//! - Configuration ([`AppConfig`], [`AgentSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentSettings, AppConfig, DefaultsConfig, builtin_agents, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_config,
};
pub use error::{PipelineError, Result, StepError};
pub use types::{
    Actor, AgentJob, DEAD_LETTER_CODE, EntryOrigin, JobStatus, NewQueueItem, PipelineRun,
    QueueItem, RunStatus, RunTrigger, StatusCode, StatusEntry, StepRun, StepStatus,
    TransitionEdge, Usage, new_id,
};
