//! The agent contract and the validated state-access wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use wunsch_core::{AgentHistoryEntry, StateMap};

use crate::error::AgentError;
use crate::registry::AgentSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// One-shot action, run synchronously within the progress cycle.
    Do,
    /// Periodic observer.
    Monitor,
    /// Periodic with an explicit stop signal.
    Poll,
    /// Periodic reactive; flushed one final time on stop.
    Think,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentKind::Do => "do",
            AgentKind::Monitor => "monitor",
            AgentKind::Poll => "poll",
            AgentKind::Think => "think",
        };
        f.write_str(s)
    }
}

/// The surface an agent sees of the want it runs on. Implemented by the
/// runtime's live want; parent access resolves through the builder on every
/// call and falls back to global state when the want has no owner.
pub trait AgentHost: Send + Sync {
    fn want_id(&self) -> Uuid;
    fn want_name(&self) -> String;
    fn is_achieved(&self) -> bool;

    fn get_state(&self, key: &str) -> Option<Value>;
    fn store_state(&self, key: &str, value: Value);
    fn merge_state(&self, updates: StateMap);

    fn get_parent_state(&self, key: &str) -> Option<Value>;
    fn store_parent_state(&self, key: &str, value: Value);
    fn merge_parent_state(&self, updates: StateMap);

    fn record_agent_run(&self, entry: AgentHistoryEntry);
}

/// An agent implementation. Concrete agents are external collaborators; the
/// runtime owns only this lifecycle contract.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> AgentKind;
    /// Names of the capabilities this agent provides.
    fn capabilities(&self) -> Vec<String>;

    async fn run(&self, host: Arc<dyn AgentHost>) -> Result<(), AgentError>;
}

/// Wraps a host with the agent's declared state-access specification.
/// Writes to undeclared keys are logged but allowed, matching the
/// compatibility contract for older capability files.
pub struct ValidatedHost {
    inner: Arc<dyn AgentHost>,
    agent_name: String,
    spec: AgentSpec,
}

impl ValidatedHost {
    pub fn new(inner: Arc<dyn AgentHost>, agent_name: impl Into<String>, spec: AgentSpec) -> Self {
        Self {
            inner,
            agent_name: agent_name.into(),
            spec,
        }
    }

    fn check_state_key(&self, key: &str) {
        if !self.spec.allowed_state.is_empty() && !self.spec.allowed_state.contains(key) {
            warn!(
                agent = %self.agent_name,
                key,
                "agent writes state field outside its capability spec"
            );
        }
    }

    fn check_parent_key(&self, key: &str) {
        if !self.spec.allowed_parent_state.is_empty() && !self.spec.allowed_parent_state.contains(key)
        {
            warn!(
                agent = %self.agent_name,
                key,
                "agent writes parent state field outside its capability spec"
            );
        }
    }
}

impl AgentHost for ValidatedHost {
    fn want_id(&self) -> Uuid {
        self.inner.want_id()
    }

    fn want_name(&self) -> String {
        self.inner.want_name()
    }

    fn is_achieved(&self) -> bool {
        self.inner.is_achieved()
    }

    fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.get_state(key)
    }

    fn store_state(&self, key: &str, value: Value) {
        self.check_state_key(key);
        self.inner.store_state(key, value);
    }

    fn merge_state(&self, updates: StateMap) {
        for key in updates.keys() {
            self.check_state_key(key);
        }
        self.inner.merge_state(updates);
    }

    fn get_parent_state(&self, key: &str) -> Option<Value> {
        self.inner.get_parent_state(key)
    }

    fn store_parent_state(&self, key: &str, value: Value) {
        self.check_parent_key(key);
        self.inner.store_parent_state(key, value);
    }

    fn merge_parent_state(&self, updates: StateMap) {
        for key in updates.keys() {
            self.check_parent_key(key);
        }
        self.inner.merge_parent_state(updates);
    }

    fn record_agent_run(&self, entry: AgentHistoryEntry) {
        self.inner.record_agent_run(entry);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory host used across this crate's tests.
    pub struct MemoryHost {
        pub id: Uuid,
        pub state: Mutex<StateMap>,
        pub parent_state: Mutex<StateMap>,
        pub runs: Mutex<Vec<AgentHistoryEntry>>,
        pub achieved: std::sync::atomic::AtomicBool,
    }

    impl MemoryHost {
        pub fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                state: Mutex::new(StateMap::new()),
                parent_state: Mutex::new(StateMap::new()),
                runs: Mutex::new(Vec::new()),
                achieved: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl AgentHost for MemoryHost {
        fn want_id(&self) -> Uuid {
            self.id
        }

        fn want_name(&self) -> String {
            "memory".into()
        }

        fn is_achieved(&self) -> bool {
            self.achieved.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn get_state(&self, key: &str) -> Option<Value> {
            self.state.lock().get(key).cloned()
        }

        fn store_state(&self, key: &str, value: Value) {
            self.state.lock().insert(key.to_string(), value);
        }

        fn merge_state(&self, updates: StateMap) {
            wunsch_core::merge_into(&mut self.state.lock(), updates);
        }

        fn get_parent_state(&self, key: &str) -> Option<Value> {
            self.parent_state.lock().get(key).cloned()
        }

        fn store_parent_state(&self, key: &str, value: Value) {
            self.parent_state.lock().insert(key.to_string(), value);
        }

        fn merge_parent_state(&self, updates: StateMap) {
            wunsch_core::merge_into(&mut self.parent_state.lock(), updates);
        }

        fn record_agent_run(&self, entry: AgentHistoryEntry) {
            self.runs.lock().push(entry);
        }
    }
}
