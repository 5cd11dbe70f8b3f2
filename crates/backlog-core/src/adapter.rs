//! Agent adapter seam.
//!
//! Concrete adapters (subprocess wrappers around agent CLIs) live outside
//! this crate; the engine only sees [`AgentAdapter`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::error::Result;

/// One generative call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub agent: String,
    pub prompt: String,
    pub model: Option<String>,
    /// Scratch directory the agent runs in; removed after the call.
    pub working_dir: PathBuf,
}

/// What the agent produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    /// Final assistant message; this is what gets parsed.
    pub last_message: String,
    /// Raw event stream (JSONL for CLIs that stream events).
    pub raw_events: String,
    pub stderr: String,
}

impl AgentResponse {
    pub fn text(last_message: impl Into<String>) -> Self {
        Self {
            last_message: last_message.into(),
            ..Default::default()
        }
    }
}

/// Blocking call into a generative agent.
///
/// Guarantees:
/// - `invoke` either returns the agent's response or an
///   `AgentInvocation` error; it never panics on agent failure.
/// - `identity` is stable for a given adapter configuration and is folded
///   into every cache manifest, so switching binaries invalidates caches.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse>;

    fn identity(&self) -> Value {
        json!({})
    }
}
