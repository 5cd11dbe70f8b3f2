//! Prompt/repair executor.
//!
//! Every call persists its prompt, raw event stream, last message and
//! stderr under the unit's artifact directory, whether the call succeeds
//! or not. Ticket-producing prompts get exactly one repair attempt when
//! the first answer cannot be parsed.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::adapter::{AgentAdapter, AgentRequest};
use crate::cache::fs::write_text;
use crate::domain::error::{BacklogError, Result};
use crate::domain::ticket::{parse_ticket_list, RawTicket};
use crate::metrics::METRICS;
use crate::prompts::render_repair_prompt;

/// Parsed result of a ticket-producing prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketRun {
    pub tickets: Vec<RawTicket>,
    pub errors: Vec<String>,
    pub repaired: bool,
}

/// Runs prompts through an [`AgentAdapter`] and records artifacts.
#[derive(Clone)]
pub struct PromptExecutor {
    adapter: Arc<dyn AgentAdapter>,
    agent: String,
    model: Option<String>,
}

impl PromptExecutor {
    pub fn new(adapter: Arc<dyn AgentAdapter>, agent: impl Into<String>, model: Option<String>) -> Self {
        Self {
            adapter,
            agent: agent.into(),
            model,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn adapter(&self) -> &Arc<dyn AgentAdapter> {
        &self.adapter
    }

    /// Run one prompt and return the agent's last message.
    ///
    /// Writes `{tag}.prompt.txt` before the call, then
    /// `{tag}.raw_events.jsonl`, `{tag}.last_message.txt` and
    /// `{tag}.stderr.txt`. Adapter failures come back as
    /// [`BacklogError::AgentInvocation`] with the error text in stderr.
    #[instrument(skip(self, out_dir, prompt), fields(agent = %self.agent, tag = %tag))]
    pub async fn run_prompt(&self, out_dir: &Path, tag: &str, prompt: &str) -> Result<String> {
        std::fs::create_dir_all(out_dir)?;
        write_text(&out_dir.join(format!("{tag}.prompt.txt")), prompt)?;

        let workspace = tempfile::Builder::new().prefix("backlog_").tempdir()?;
        let request = AgentRequest {
            agent: self.agent.clone(),
            prompt: prompt.to_string(),
            model: self.model.clone(),
            working_dir: workspace.path().to_path_buf(),
        };

        METRICS.inc_agent_calls();
        let outcome = self.adapter.invoke(request).await;
        drop(workspace);

        match outcome {
            Ok(response) => {
                write_text(&out_dir.join(format!("{tag}.raw_events.jsonl")), &response.raw_events)?;
                write_text(&out_dir.join(format!("{tag}.last_message.txt")), &response.last_message)?;
                write_text(&out_dir.join(format!("{tag}.stderr.txt")), &response.stderr)?;
                debug!(chars = response.last_message.len(), "agent responded");
                Ok(response.last_message)
            }
            Err(e) => {
                let message = match e {
                    BacklogError::AgentInvocation(message) => message,
                    other => other.to_string(),
                };
                write_text(&out_dir.join(format!("{tag}.stderr.txt")), &message)?;
                warn!(code = "agent_invocation_failed", error = %message, "agent call failed");
                Err(BacklogError::AgentInvocation(message))
            }
        }
    }

    /// Run a ticket prompt, repairing once on parse errors.
    ///
    /// The repair prompt quotes the raw answer and its parse errors and is
    /// sent under tag `{tag}.repair`. Repaired tickets replace the first
    /// answer only when the repair produced at least one ticket; a failed
    /// repair call is recorded as an error and the first answer's tickets
    /// are kept.
    pub async fn run_ticket_prompt(
        &self,
        out_dir: &Path,
        tag: &str,
        prompt: &str,
        max_tickets: usize,
    ) -> Result<TicketRun> {
        let raw = self.run_prompt(out_dir, tag, prompt).await?;
        let (tickets, errors) = parse_ticket_list(&raw);
        if errors.is_empty() || raw.trim().is_empty() {
            return Ok(TicketRun {
                tickets,
                errors,
                repaired: false,
            });
        }

        METRICS.inc_repairs();
        debug!(tag = %tag, errors = errors.len(), "attempting output repair");
        let repair_prompt = render_repair_prompt(&raw, &errors, max_tickets);
        let repaired_raw = match self
            .run_prompt(out_dir, &format!("{tag}.repair"), &repair_prompt)
            .await
        {
            Ok(text) => text,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Keep whatever the first answer yielded.
                let mut all_errors = errors;
                all_errors.push(format!("repair: {e}"));
                return Ok(TicketRun {
                    tickets,
                    errors: all_errors,
                    repaired: false,
                });
            }
        };
        let (repaired, repair_errors) = parse_ticket_list(&repaired_raw);
        if repaired.is_empty() {
            let mut all_errors = errors;
            all_errors.extend(repair_errors.into_iter().map(|e| format!("repair: {e}")));
            return Ok(TicketRun {
                tickets,
                errors: all_errors,
                repaired: false,
            });
        }
        Ok(TicketRun {
            tickets: repaired,
            errors: repair_errors,
            repaired: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOOD: &str = r#"[{"title":"T","evidence_atom_ids":["a"],"proposed_fix":"f"}]"#;

    #[tokio::test]
    async fn persists_artifacts_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant("hello"));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let out = exec.run_prompt(dir.path(), "miner_001", "the prompt").await.unwrap();
        assert_eq!(out, "hello");
        assert_eq!(adapter.calls(), 1);
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("miner_001.prompt.txt"), "the prompt");
        assert_eq!(read("miner_001.last_message.txt"), "hello");
        assert!(read("miner_001.raw_events.jsonl").contains("hello"));
        assert_eq!(read("miner_001.stderr.txt"), "");
    }

    #[tokio::test]
    async fn failure_writes_prompt_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exec = PromptExecutor::new(Arc::new(ScriptedAdapter::failing("exit 2")), "codex", None);
        let err = exec.run_prompt(dir.path(), "t", "p").await.unwrap_err();
        assert!(matches!(err, BacklogError::AgentInvocation(ref m) if m == "exit 2"));
        assert!(dir.path().join("t.prompt.txt").is_file());
        assert_eq!(std::fs::read_to_string(dir.path().join("t.stderr.txt")).unwrap(), "exit 2");
    }

    #[tokio::test]
    async fn repairs_once_on_unparseable_output() {
        let dir = tempfile::tempdir().unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        let counter = n.clone();
        let adapter = Arc::new(ScriptedAdapter::new(move |_| {
            Ok(if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                "Sorry, here are my thoughts.".to_string()
            } else {
                GOOD.to_string()
            })
        }));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let run = exec.run_ticket_prompt(dir.path(), "m", "p", 4).await.unwrap();
        assert!(run.repaired);
        assert_eq!(run.tickets.len(), 1);
        assert_eq!(adapter.calls(), 2);
        let repair_prompt = std::fs::read_to_string(dir.path().join("m.repair.prompt.txt")).unwrap();
        assert!(repair_prompt.contains("Sorry, here are my thoughts."));
        assert!(repair_prompt.contains("could not locate a JSON ticket array"));
    }

    #[tokio::test]
    async fn no_repair_for_valid_or_empty_answers() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant("[]"));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let run = exec.run_ticket_prompt(dir.path(), "m", "p", 4).await.unwrap();
        assert!(run.tickets.is_empty() && run.errors.is_empty() && !run.repaired);

        let adapter = Arc::new(ScriptedAdapter::constant("   "));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let run = exec.run_ticket_prompt(dir.path(), "e", "p", 4).await.unwrap();
        assert_eq!(run.errors, vec!["empty output"]);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn failed_repair_call_keeps_first_answer_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        let counter = n.clone();
        let adapter = Arc::new(ScriptedAdapter::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(r#"[{"title":"T","evidence_atom_ids":["a"],"proposed_fix":"f"},{"title":""}]"#.to_string())
            } else {
                Err(BacklogError::AgentInvocation("agent exited with status 1".into()))
            }
        }));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let run = exec.run_ticket_prompt(dir.path(), "m", "p", 4).await.unwrap();
        assert_eq!(adapter.calls(), 2);
        assert!(!run.repaired);
        assert_eq!(run.tickets.len(), 1);
        assert_eq!(run.tickets[0].title, "T");
        assert!(run
            .errors
            .iter()
            .any(|e| e.starts_with("repair: ") && e.contains("status 1")));
    }

    #[tokio::test]
    async fn persistent_failure_keeps_both_error_sets() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant("no json here"));
        let exec = PromptExecutor::new(adapter.clone(), "claude", None);
        let run = exec.run_ticket_prompt(dir.path(), "m", "p", 4).await.unwrap();
        assert!(!run.repaired && run.tickets.is_empty());
        assert!(run.errors.iter().any(|e| e.starts_with("repair: ")));
        assert_eq!(adapter.calls(), 2);
    }
}
