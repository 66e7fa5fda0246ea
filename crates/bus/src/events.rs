//! Unified runtime event bus.
//!
//! Event kinds fall into three processing modes:
//! - **async**: fire and forget, one task per subscriber, errors logged;
//! - **sync**: invoked in subscriber order on the emitter's task, responses
//!   collected and returned;
//! - **blocking**: sync semantics where the caller must hold all responses
//!   before proceeding (channel synchronization points).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    ParameterChange,
    OwnerChildState,
    OwnerCompletion,
    PreExecution,
    MonitorAgent,
    ChannelEnd,
    StatusChange,
    ProcessEnd,
    ChannelSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Async,
    Sync,
    Blocking,
}

/// Base fields carried by every event.
#[derive(Debug, Clone)]
pub struct EventMeta {
    pub source: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub priority: i32,
}

impl EventMeta {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            timestamp: Utc::now(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    StateChange {
        meta: EventMeta,
        key: String,
        old: Option<Value>,
        new: Value,
    },
    ParameterChange {
        meta: EventMeta,
        name: String,
        value: Value,
    },
    OwnerChildState {
        meta: EventMeta,
        child_name: String,
        updates: Value,
    },
    OwnerCompletion {
        meta: EventMeta,
        child_name: String,
    },
    PreExecution {
        meta: EventMeta,
    },
    MonitorAgent {
        meta: EventMeta,
        agent_name: String,
    },
    ChannelEnd {
        meta: EventMeta,
        topic: String,
    },
    StatusChange {
        meta: EventMeta,
        old: String,
        new: String,
    },
    ProcessEnd {
        meta: EventMeta,
    },
    ChannelSync {
        meta: EventMeta,
        topic: String,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::StateChange { .. } => EventKind::StateChange,
            RuntimeEvent::ParameterChange { .. } => EventKind::ParameterChange,
            RuntimeEvent::OwnerChildState { .. } => EventKind::OwnerChildState,
            RuntimeEvent::OwnerCompletion { .. } => EventKind::OwnerCompletion,
            RuntimeEvent::PreExecution { .. } => EventKind::PreExecution,
            RuntimeEvent::MonitorAgent { .. } => EventKind::MonitorAgent,
            RuntimeEvent::ChannelEnd { .. } => EventKind::ChannelEnd,
            RuntimeEvent::StatusChange { .. } => EventKind::StatusChange,
            RuntimeEvent::ProcessEnd { .. } => EventKind::ProcessEnd,
            RuntimeEvent::ChannelSync { .. } => EventKind::ChannelSync,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        match self.kind() {
            EventKind::StateChange
            | EventKind::ParameterChange
            | EventKind::OwnerChildState
            | EventKind::OwnerCompletion => DispatchMode::Async,
            EventKind::PreExecution
            | EventKind::MonitorAgent
            | EventKind::ChannelEnd
            | EventKind::StatusChange
            | EventKind::ProcessEnd => DispatchMode::Sync,
            EventKind::ChannelSync => DispatchMode::Blocking,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            RuntimeEvent::StateChange { meta, .. }
            | RuntimeEvent::ParameterChange { meta, .. }
            | RuntimeEvent::OwnerChildState { meta, .. }
            | RuntimeEvent::OwnerCompletion { meta, .. }
            | RuntimeEvent::PreExecution { meta }
            | RuntimeEvent::MonitorAgent { meta, .. }
            | RuntimeEvent::ChannelEnd { meta, .. }
            | RuntimeEvent::StatusChange { meta, .. }
            | RuntimeEvent::ProcessEnd { meta }
            | RuntimeEvent::ChannelSync { meta, .. } => meta,
        }
    }
}

/// What a subscriber tells the emitter to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionControl {
    #[default]
    Continue,
    Skip,
    Terminate,
    Block,
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct EventResponse {
    pub control: ExecutionControl,
    pub handled: bool,
    pub error: Option<String>,
}

impl EventResponse {
    pub fn handled() -> Self {
        Self {
            control: ExecutionControl::Continue,
            handled: true,
            error: None,
        }
    }
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &RuntimeEvent) -> EventResponse;
}

/// Ordered subscriber lists per event kind.
pub struct SubscriptionSystem {
    subscribers: parking_lot::RwLock<HashMap<EventKind, Vec<Arc<dyn EventSubscriber>>>>,
}

impl SubscriptionSystem {
    pub fn new() -> Self {
        Self {
            subscribers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, kind: EventKind, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    pub fn unsubscribe(&self, kind: EventKind, name: &str) {
        if let Some(list) = self.subscribers.write().get_mut(&kind) {
            list.retain(|s| s.name() != name);
        }
    }

    /// Route an event by its kind's processing mode. Async events return an
    /// empty response list; sync and blocking events return one response per
    /// subscriber in order.
    pub async fn emit(&self, event: RuntimeEvent) -> Vec<EventResponse> {
        let targets: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        match event.mode() {
            DispatchMode::Async => {
                for subscriber in targets {
                    let event = event.clone();
                    tokio::spawn(async move {
                        let response = subscriber.handle(&event).await;
                        if let Some(err) = response.error {
                            warn!(
                                subscriber = subscriber.name(),
                                error = %err,
                                "async event handler failed"
                            );
                        }
                    });
                }
                Vec::new()
            }
            DispatchMode::Sync | DispatchMode::Blocking => {
                let mut responses = Vec::with_capacity(targets.len());
                for subscriber in targets {
                    responses.push(subscriber.handle(&event).await);
                }
                responses
            }
        }
    }
}

impl Default for SubscriptionSystem {
    fn default() -> Self {
        Self::new()
    }
}
