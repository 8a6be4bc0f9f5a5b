//! Agent seam: the unit of work the orchestrator runs for each item.
//!
//! An [`Agent`] takes a queue item and either produces output, rejects the
//! item as bad data, or fails with a [`StepError`]. [`CommandAgent`] drives
//! an external process over a one-shot JSON-lines protocol on stdin/stdout:
//!
//! ```text
//! → {"id":"…","url":"…","status_code":220,"payload":{…}}
//! ← {"type":"result","output":{…},"usage":{"tokens":812,"cost_usd":0.0004}}
//! ← {"type":"rejected","reason":"not an article"}
//! ← {"type":"error","message":"upstream 503","status":503}
//! ```

use std::future::Future;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use pipewright_shared::{PipelineError, QueueItem, Result, StepError, StatusCode, Usage};

/// Successful outcome of one agent call.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    /// Output to merge into the item's payload.
    Completed { output: Value, usage: Option<Usage> },
    /// The item is bad data; it is not retried and does not advance.
    Rejected { reason: String },
}

impl AgentOutput {
    pub fn completed(output: Value) -> Self {
        Self::Completed {
            output,
            usage: None,
        }
    }
}

/// One pipeline agent (summarizer, tagger, …).
pub trait Agent: Send + Sync {
    /// Process one item.
    fn run(
        &self,
        item: &QueueItem,
    ) -> impl Future<Output = std::result::Result<AgentOutput, StepError>> + Send;

    /// Fold `output` into the item's `payload`. Object outputs are merged
    /// key by key; anything else leaves the payload untouched.
    fn merge(&self, payload: &mut Value, output: &Value) {
        merge_shallow(payload, output);
    }
}

/// Copy each top-level key of `output` into `payload`.
pub fn merge_shallow(payload: &mut Value, output: &Value) {
    let Some(fields) = output.as_object() else {
        return;
    };
    if !payload.is_object() {
        *payload = Value::Object(Default::default());
    }
    if let Some(target) = payload.as_object_mut() {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess agent
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    id: &'a str,
    url: Option<&'a str>,
    status_code: StatusCode,
    payload: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentReply {
    Result {
        #[serde(default)]
        output: Value,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Rejected {
        #[serde(default)]
        reason: String,
    },
    Error {
        message: String,
        #[serde(default)]
        status: Option<u16>,
    },
}

/// Runs a configured program once per item.
///
/// The process receives the item as one JSON line on stdin and must print
/// one JSON reply line on stdout. stderr is inherited so agent logs reach
/// the operator. The child is killed if the call is dropped (e.g. on
/// timeout).
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    /// Build from an argv; the first element is the program.
    pub fn new(name: impl Into<String>, argv: &[String]) -> Result<Self> {
        let name = name.into();
        let (program, args) = argv.split_first().ok_or_else(|| {
            PipelineError::config(format!("agent '{name}' has no command configured"))
        })?;
        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, item: &QueueItem) -> std::result::Result<AgentOutput, StepError> {
        let request = AgentRequest {
            id: &item.id,
            url: item.url.as_deref(),
            status_code: item.status_code,
            payload: &item.payload,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| StepError::new(format!("failed to encode agent request: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepError::new(format!(
                    "failed to spawn agent '{}': {e}. Is `{}` installed?",
                    self.name, self.program
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StepError::new("failed to capture agent stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::new("failed to capture agent stdout"))?;

        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| StepError::new(format!("failed to write to agent stdin: {e}")))?;
        drop(stdin);

        let mut reply = String::new();
        BufReader::new(stdout)
            .read_line(&mut reply)
            .await
            .map_err(|e| StepError::new(format!("agent read error: {e}")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| StepError::new(format!("agent wait error: {e}")))?;
        debug!(agent = %self.name, item_id = %item.id, ?status, "agent exited");

        if reply.trim().is_empty() {
            return Err(StepError::new(format!(
                "agent '{}' exited without a reply ({status})",
                self.name
            )));
        }
        if !status.success() {
            warn!(agent = %self.name, ?status, "agent exited with failure after replying");
        }

        parse_reply(reply.trim())
    }
}

fn parse_reply(line: &str) -> std::result::Result<AgentOutput, StepError> {
    let reply: AgentReply = serde_json::from_str(line).map_err(|e| {
        StepError::new(format!(
            "malformed agent reply: {e} (got: {})",
            line.chars().take(200).collect::<String>()
        ))
    })?;
    match reply {
        AgentReply::Result { output, usage } => Ok(AgentOutput::Completed { output, usage }),
        AgentReply::Rejected { reason } => Ok(AgentOutput::Rejected { reason }),
        AgentReply::Error { message, status } => Err(StepError { message, status }),
    }
}

impl Agent for CommandAgent {
    fn run(
        &self,
        item: &QueueItem,
    ) -> impl Future<Output = std::result::Result<AgentOutput, StepError>> + Send {
        self.call(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_shared::EntryOrigin;
    use serde_json::json;

    fn item() -> QueueItem {
        QueueItem {
            id: "item-1".into(),
            url: Some("https://example.com/post".into()),
            status_code: 220,
            payload: json!({ "title": "Post" }),
            origin: EntryOrigin::Rss,
            current_run_id: None,
            failure_count: 0,
            last_failed_step: None,
            last_error_message: None,
            last_error_type: None,
            last_error_signature: None,
            last_error_at: None,
            retry_after: None,
            discovered_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn shallow_merge_overwrites_top_level_keys() {
        let mut payload = json!({ "title": "Post", "tags": ["old"] });
        merge_shallow(&mut payload, &json!({ "tags": ["rust"], "score": 0.9 }));
        assert_eq!(payload, json!({ "title": "Post", "tags": ["rust"], "score": 0.9 }));

        merge_shallow(&mut payload, &json!("not an object"));
        assert_eq!(payload["title"], "Post");
    }

    #[test]
    fn reply_parsing() {
        let ok = parse_reply(r#"{"type":"result","output":{"tags":["a"]},"usage":{"tokens":10}}"#)
            .unwrap();
        assert_eq!(
            ok,
            AgentOutput::Completed {
                output: json!({ "tags": ["a"] }),
                usage: Some(Usage {
                    tokens: 10,
                    cost_usd: 0.0
                }),
            }
        );

        let rejected = parse_reply(r#"{"type":"rejected","reason":"bad data"}"#).unwrap();
        assert_eq!(
            rejected,
            AgentOutput::Rejected {
                reason: "bad data".into()
            }
        );

        let err = parse_reply(r#"{"type":"error","message":"slow down","status":429}"#)
            .unwrap_err();
        assert_eq!(err.status, Some(429));

        let err = parse_reply("hello").unwrap_err();
        assert!(err.message.starts_with("malformed agent reply"));
    }

    #[test]
    fn empty_argv_is_a_config_error() {
        let err = CommandAgent::new("tagger", &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_agent_round_trip() {
        let argv: Vec<String> = [
            "sh",
            "-c",
            r#"read line; echo '{"type":"result","output":{"tags":["rust"]}}'"#,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let agent = CommandAgent::new("tagger", &argv).unwrap();

        let output = agent.run(&item()).await.unwrap();
        assert_eq!(output, AgentOutput::completed(json!({ "tags": ["rust"] })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_command_is_an_error() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "read line; exit 3".to_string()];
        let agent = CommandAgent::new("tagger", &argv).unwrap();

        let err = agent.run(&item()).await.unwrap_err();
        assert!(err.message.contains("exited without a reply"));
    }
}
