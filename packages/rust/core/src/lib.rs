//! Core pipeline logic for Pipewright.
//!
//! Stage catalogue and transition graph, error classification, WIP
//! admission, run/step tracing, the per-agent batch orchestrator and
//! structural replay of recorded runs.

pub mod agent;
pub mod classify;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod tracer;
pub mod transitions;
pub mod wip;

pub use agent::{Agent, AgentOutput, CommandAgent};
pub use orchestrator::{
    AgentBatchConfig, BatchOutcome, BatchProgress, ItemOutcome, Orchestrator,
    OrchestratorSettings, SilentProgress, SkipReason,
};
pub use registry::StatusRegistry;
pub use replay::{ReplayEngine, ReplayOptions, RerunOutcome, RerunReport};
pub use transitions::TransitionTable;
pub use wip::{Capacity, WipController};
