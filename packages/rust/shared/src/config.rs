//! Application configuration for Pipewright.
//!
//! User config lives at `~/.pipewright/pipewright.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pipewright.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pipewright";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "pipewright.db";

/// WIP limit for the built-in agents.
const BUILTIN_WIP_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Config structs (matching pipewright.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Agent definitions keyed by agent name. Entries here replace the
    /// built-in definition of the same name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSettings>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file. Defaults to `~/.pipewright/pipewright.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,

    /// Items requested per batch when the caller does not say.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Deadline for a single agent call.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Age after which a running job is considered abandoned.
    #[serde(default = "default_stale_job_minutes")]
    pub stale_job_minutes: u64,

    /// Consecutive same-step failures before an item is dead-lettered.
    #[serde(default = "default_dead_letter_threshold")]
    pub dead_letter_threshold: u32,

    /// WIP limit for agents that do not set their own.
    #[serde(default = "default_wip_limit")]
    pub default_wip_limit: u32,

    /// Replay success rate (percent) a sampled capability test must reach.
    #[serde(default = "default_replay_target_pct")]
    pub replay_target_pct: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            batch_limit: default_batch_limit(),
            agent_timeout_secs: default_agent_timeout_secs(),
            stale_job_minutes: default_stale_job_minutes(),
            dead_letter_threshold: default_dead_letter_threshold(),
            default_wip_limit: default_wip_limit(),
            replay_target_pct: default_replay_target_pct(),
        }
    }
}

fn default_batch_limit() -> u32 {
    10
}
fn default_agent_timeout_secs() -> u64 {
    90
}
fn default_stale_job_minutes() -> u64 {
    30
}
fn default_dead_letter_threshold() -> u32 {
    3
}
fn default_wip_limit() -> u32 {
    10
}
fn default_replay_target_pct() -> f64 {
    100.0
}

impl DefaultsConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn stale_job_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_minutes * 60)
    }
}

/// `[agents.<name>]` entry. Stage fields hold status **names**, resolved
/// through the status registry at batch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Step name recorded in step runs (e.g. `tag`).
    pub step_name: String,
    /// Stage the agent picks work from.
    pub ready_status: String,
    /// Stage an item sits in while the agent works on it.
    pub working_status: String,
    /// Stage an item moves to on success.
    pub next_status: String,
    /// Maximum items in the working stage at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
    /// Argv of the external agent process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl AgentSettings {
    fn builtin(step: &str, ready: &str, working: &str, next: &str) -> Self {
        Self {
            step_name: step.into(),
            ready_status: ready.into(),
            working_status: working.into(),
            next_status: next.into(),
            wip_limit: Some(BUILTIN_WIP_LIMIT),
            command: Vec::new(),
        }
    }
}

/// The agents every installation knows about.
pub fn builtin_agents() -> BTreeMap<String, AgentSettings> {
    BTreeMap::from([
        (
            "screener".to_string(),
            AgentSettings::builtin("screen", "to_score", "scoring", "to_summarize"),
        ),
        (
            "summarizer".to_string(),
            AgentSettings::builtin("summarize", "to_summarize", "summarizing", "to_tag"),
        ),
        (
            "tagger".to_string(),
            AgentSettings::builtin("tag", "to_tag", "tagging", "to_thumbnail"),
        ),
        (
            "thumbnailer".to_string(),
            AgentSettings::builtin("thumbnail", "to_thumbnail", "thumbnailing", "pending_review"),
        ),
    ])
}

impl AppConfig {
    /// All agents: built-ins overlaid with configured entries.
    pub fn all_agents(&self) -> BTreeMap<String, AgentSettings> {
        let mut agents = builtin_agents();
        agents.extend(self.agents.clone());
        agents
    }

    /// Settings for one agent, if it is known.
    pub fn agent(&self, name: &str) -> Option<AgentSettings> {
        self.agents
            .get(name)
            .cloned()
            .or_else(|| builtin_agents().remove(name))
    }

    /// WIP limit for an agent; unknown agents get the conservative default.
    pub fn wip_limit(&self, agent: &str) -> u32 {
        self.agent(agent)
            .and_then(|a| a.wip_limit)
            .unwrap_or(self.defaults.default_wip_limit)
    }

    /// Resolve the database path, falling back to the config directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.defaults.database_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pipewright/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pipewright/pipewright.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values that would make the orchestrator misbehave.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.agent_timeout_secs == 0 {
        return Err(PipelineError::config("agent_timeout_secs must be > 0"));
    }
    if config.defaults.dead_letter_threshold == 0 {
        return Err(PipelineError::config("dead_letter_threshold must be > 0"));
    }
    for (name, agent) in &config.agents {
        if agent.ready_status == agent.working_status {
            return Err(PipelineError::config(format!(
                "agent '{name}': ready_status and working_status must differ"
            )));
        }
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig {
        agents: builtin_agents(),
        ..AppConfig::default()
    };
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("agent_timeout_secs = 90"));
        assert!(toml_str.contains("dead_letter_threshold = 3"));
    }

    #[test]
    fn config_with_agents() {
        let toml_str = r#"
[defaults]
default_wip_limit = 4

[agents.tagger]
step_name = "tag"
ready_status = "to_tag"
working_status = "tagging"
next_status = "to_thumbnail"
wip_limit = 7
command = ["bun", "run", "agents/tagger.ts"]

[agents.translator]
step_name = "translate"
ready_status = "to_translate"
working_status = "translating"
next_status = "pending_review"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        validate_config(&config).expect("valid");
        assert_eq!(config.wip_limit("tagger"), 7);
        assert_eq!(config.wip_limit("translator"), 4);
        assert_eq!(config.wip_limit("summarizer"), 50);
        assert_eq!(config.wip_limit("nobody"), 4);
        assert_eq!(config.agent("tagger").map(|a| a.command.len()), Some(3));
        assert_eq!(config.all_agents().len(), 5);
    }

    #[test]
    fn unknown_agent_gets_conservative_default() {
        let config = AppConfig::default();
        assert_eq!(config.wip_limit("mystery"), 10);
        assert!(config.agent("mystery").is_none());
    }

    #[test]
    fn builtin_tagger_stages() {
        let tagger = AppConfig::default().agent("tagger").expect("builtin");
        assert_eq!(tagger.ready_status, "to_tag");
        assert_eq!(tagger.working_status, "tagging");
        assert_eq!(tagger.next_status, "to_thumbnail");
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.defaults.agent_timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("agent_timeout_secs"));
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut config = AppConfig::default();
        config.defaults.database_path = Some("/tmp/pw.db".into());
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/pw.db"));
    }
}
