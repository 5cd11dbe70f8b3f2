//! In-memory test doubles for the adapter and store seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{AgentAdapter, AgentRequest, AgentResponse};
use crate::cache::{CacheError, CacheResult, ResultStore};
use crate::domain::error::{BacklogError, Result};

type Responder = Box<dyn Fn(&AgentRequest) -> Result<String> + Send + Sync>;

/// Adapter that answers from a closure and counts invocations.
pub struct ScriptedAdapter {
    responder: Responder,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(responder: impl Fn(&AgentRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answer `text`.
    pub fn constant(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Always fail with an `AgentInvocation` error.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| Err(BacklogError::AgentInvocation(message.clone())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let text = (self.responder)(&request)?;
        Ok(AgentResponse {
            raw_events: json!({"type": "message", "text": text}).to_string(),
            last_message: text,
            stderr: String::new(),
        })
    }

    fn identity(&self) -> Value {
        json!({"adapter": "scripted"})
    }
}

/// Result store kept in a map. `None` marks a corrupt entry.
#[derive(Default)]
pub struct MemoryResultStore {
    entries: Mutex<HashMap<String, Option<Value>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key` unreadable.
    pub fn corrupt(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), None);
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl ResultStore for MemoryResultStore {
    fn read(&self, key: &str) -> CacheResult<Option<Value>> {
        let entries = self.entries.lock().map_err(|_| CacheError::Corrupt {
            key: key.to_string(),
            reason: "store lock poisoned".into(),
        })?;
        match entries.get(key) {
            None => Ok(None),
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: "marked corrupt".into(),
            }),
        }
    }

    fn write(&self, key: &str, value: &Value) -> CacheResult<()> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Corrupt {
            key: key.to_string(),
            reason: "store lock poisoned".into(),
        })?;
        entries.insert(key.to_string(), Some(value.clone()));
        Ok(())
    }
}
