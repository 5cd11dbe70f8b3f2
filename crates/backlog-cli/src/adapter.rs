//! Subprocess adapter for the supported agent CLIs.
//!
//! The prompt always goes over stdin; the agent runs in the scratch
//! directory the executor hands us.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use backlog_core::{AgentAdapter, AgentRequest, AgentResponse, BacklogError, Result};
use clap::ValueEnum;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const CODEX_LAST_MESSAGE_FILE: &str = "codex_last_message.txt";
const STDERR_TAIL_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }
}

/// Runs one agent CLI per prompt.
#[derive(Debug, Clone)]
pub struct SubprocessAdapter {
    kind: AgentKind,
    binary: PathBuf,
}

impl SubprocessAdapter {
    /// Adapter for `kind`; the binary defaults to the agent's name on PATH.
    pub fn new(kind: AgentKind, binary: Option<PathBuf>) -> Self {
        Self {
            kind,
            binary: binary.unwrap_or_else(|| PathBuf::from(kind.as_str())),
        }
    }

    /// Arguments after the binary for one call in `working_dir`.
    pub fn args(&self, model: Option<&str>, working_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = match self.kind {
            AgentKind::Claude => vec!["-p".into(), "--output-format".into(), "json".into()],
            AgentKind::Codex => vec![
                "--ask-for-approval".into(),
                "never".into(),
                "exec".into(),
                "--json".into(),
                "--cd".into(),
                working_dir.display().to_string(),
                "--sandbox".into(),
                "read-only".into(),
                "--skip-git-repo-check".into(),
            ],
            AgentKind::Gemini => vec![
                "--output-format".into(),
                "json".into(),
                "--approval-mode".into(),
                "default".into(),
            ],
        };
        if let Some(model) = model {
            args.push("--model".into());
            args.push(model.to_string());
        }
        if self.kind == AgentKind::Codex {
            args.push("--output-last-message".into());
            args.push(working_dir.join(CODEX_LAST_MESSAGE_FILE).display().to_string());
            args.push("-".into());
        }
        args
    }

    fn last_message(&self, stdout: &str, working_dir: &Path) -> String {
        match self.kind {
            AgentKind::Claude => claude_last_message(stdout),
            AgentKind::Gemini => gemini_last_message(stdout),
            AgentKind::Codex => std::fs::read_to_string(working_dir.join(CODEX_LAST_MESSAGE_FILE))
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AgentAdapter for SubprocessAdapter {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse> {
        let args = self.args(request.model.as_deref(), &request.working_dir);
        debug!(binary = %self.binary.display(), agent = self.kind.as_str(), "spawning agent");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BacklogError::AgentInvocation(format!(
                    "could not launch {} ({}): {e}",
                    self.kind.as_str(),
                    self.binary.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A closed pipe means the agent exited early; its exit status says why.
            let _ = stdin.write_all(request.prompt.as_bytes()).await;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BacklogError::AgentInvocation(format!("waiting for agent failed: {e}")))?;
        let raw_events = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(BacklogError::AgentInvocation(format!(
                "{} exited with {}: {}",
                self.kind.as_str(),
                output.status,
                tail(&stderr, STDERR_TAIL_CHARS)
            )));
        }

        Ok(AgentResponse {
            last_message: self.last_message(&raw_events, &request.working_dir),
            raw_events,
            stderr,
        })
    }

    fn identity(&self) -> Value {
        json!({
            "adapter": "subprocess",
            "agent": self.kind.as_str(),
            "binary": self.binary.display().to_string(),
        })
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    text.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}

fn json_lines(stdout: &str) -> impl Iterator<Item = Value> + '_ {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(Value::is_object)
}

/// Final text from `claude -p`: the `result` of a single JSON object, or
/// the last `result` / assistant text event of a stream.
pub fn claude_last_message(stdout: &str) -> String {
    if let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(stdout) {
        if let Some(Value::String(result)) = doc.get("result") {
            return result.clone();
        }
    }
    let mut last = String::new();
    for event in json_lines(stdout) {
        match event.get("type").and_then(Value::as_str) {
            Some("result") => {
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    if !result.trim().is_empty() {
                        last = result.to_string();
                    }
                }
            }
            Some("assistant") => {
                let text: String = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .collect()
                    })
                    .unwrap_or_default();
                if !text.is_empty() {
                    last = text;
                }
            }
            _ => {}
        }
    }
    last
}

/// Final text from `gemini --output-format json`, falling back to the last
/// contiguous run of assistant message deltas in a stream.
pub fn gemini_last_message(stdout: &str) -> String {
    if let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(stdout) {
        if let Some(Value::String(response)) = doc.get("response") {
            return response.clone();
        }
    }
    let mut last = String::new();
    let mut current = String::new();
    for event in json_lines(stdout) {
        let is_assistant = event.get("type").and_then(Value::as_str) == Some("message")
            && event.get("role").and_then(Value::as_str) == Some("assistant");
        if is_assistant {
            if let Some(content) = event.get("content").and_then(Value::as_str) {
                current.push_str(content);
            }
        } else if !current.is_empty() {
            last = std::mem::take(&mut current);
        }
    }
    if !current.is_empty() {
        last = current;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_single_object() {
        let out = r#"{"type":"result","result":"[{\"title\":\"x\"}]"}"#;
        assert_eq!(claude_last_message(out), r#"[{"title":"x"}]"#);
    }

    #[test]
    fn claude_stream_prefers_latest_text() {
        let out = [
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use"},{"type":"text","text":"sec"},{"type":"text","text":"ond"}]}}"#,
            "not json",
        ]
        .join("\n");
        assert_eq!(claude_last_message(&out), "second");

        let with_result = format!("{out}\n{}", r#"{"type":"result","result":"final"}"#);
        assert_eq!(claude_last_message(&with_result), "final");
    }

    #[test]
    fn gemini_single_object_and_stream() {
        assert_eq!(gemini_last_message(r#"{"response":"done"}"#), "done");
        let stream = [
            r#"{"type":"message","role":"assistant","content":"draft"}"#,
            r#"{"type":"tool_use","tool_name":"read_file"}"#,
            r#"{"type":"message","role":"assistant","content":"[1,"}"#,
            r#"{"type":"message","role":"assistant","content":"2]"}"#,
        ]
        .join("\n");
        assert_eq!(gemini_last_message(&stream), "[1,2]");
    }

    #[test]
    fn codex_reads_prompt_from_stdin_and_writes_last_message() {
        let adapter = SubprocessAdapter::new(AgentKind::Codex, None);
        let args = adapter.args(Some("o4"), Path::new("/tmp/ws"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "o4"));
        assert!(args.windows(2).any(|w| w[0] == "--sandbox" && w[1] == "read-only"));
        assert!(args.iter().any(|a| a.ends_with(CODEX_LAST_MESSAGE_FILE)));
    }

    #[test]
    fn identity_names_binary() {
        let adapter = SubprocessAdapter::new(AgentKind::Claude, Some(PathBuf::from("/opt/claude")));
        let id = adapter.identity();
        assert_eq!(id["agent"], "claude");
        assert_eq!(id["binary"], "/opt/claude");
    }

    #[tokio::test]
    async fn missing_binary_is_an_invocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SubprocessAdapter::new(
            AgentKind::Gemini,
            Some(PathBuf::from("/nonexistent/definitely-not-gemini")),
        );
        let err = adapter
            .invoke(AgentRequest {
                agent: "gemini".into(),
                prompt: "hello".into(),
                model: None,
                working_dir: dir.path().to_path_buf(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BacklogError::AgentInvocation(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail(" short ", 10), "short");
    }
}
