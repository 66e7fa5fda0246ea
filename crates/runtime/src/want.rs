//! The live want: declarative model plus runtime machinery.
//!
//! State written during a progress cycle is staged in a pending map and
//! committed atomically at `end_progress_cycle`; readers always see
//! pending-then-state. Control, stop and input channels live here; the
//! progression loop in [`crate::progression`] drives them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wunsch_agent::{
    background_key, default_interval, spawn_background, AgentHost, AgentKind, AgentRegistry,
    BackgroundAgent, DoExecutor, ValidatedHost,
};
use wunsch_bus::{
    topic_for_labels, Broker, BusMessage, EventMeta, RuntimeEvent, SubscriptionSystem,
    TransportPacket,
};
use wunsch_core::{
    is_internal_key, is_zero_value, merge_into, state as state_keys, AgentHistoryEntry,
    ConnectivityMetadata, LogHistoryEntry, Metadata, ParameterHistoryEntry, Paths,
    StateHistoryEntry, StateMap, WantConfig, WantHistory, WantSpec, WantStatus,
};

use crate::builder::BuilderCore;
use crate::error::ProgressError;
use crate::global::GlobalState;
use crate::snapshot::WantSnapshot;

pub const DEFAULT_EXEC_INTERVAL: Duration = Duration::from_millis(10);
const CONTROL_BUF: usize = 16;

/// Commands routed to a want's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Suspend,
    Resume,
    Stop,
    Restart,
}

/// The dynamic-dispatch seam for concrete want types.
#[async_trait::async_trait]
pub trait Progressable: Send + Sync {
    async fn initialize(&self, _want: &Arc<Want>) -> Result<(), ProgressError> {
        Ok(())
    }

    fn is_achieved(&self, want: &Arc<Want>) -> bool;

    async fn progress(&self, want: &Arc<Want>) -> Result<(), ProgressError>;

    async fn on_delete(&self, _want: &Arc<Want>) {}
}

struct StateInner {
    state: StateMap,
    pending: StateMap,
    pending_params: StateMap,
    pending_logs: Vec<String>,
    preserve_pending: bool,
}

pub struct Want {
    id: Uuid,
    name: String,
    metadata: RwLock<Metadata>,
    spec: RwLock<WantSpec>,
    status: RwLock<WantStatus>,
    connectivity: RwLock<ConnectivityMetadata>,
    state: Mutex<StateInner>,
    pub history: WantHistory,
    paths: RwLock<Paths>,
    inputs: tokio::sync::Mutex<IndexMap<String, mpsc::Receiver<TransportPacket>>>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlCommand>>,
    stop_tx: watch::Sender<bool>,
    suspended: AtomicBool,
    task_active: AtomicBool,
    cycle: AtomicU64,
    exec_interval: Duration,
    background: tokio::sync::Mutex<HashMap<String, BackgroundAgent>>,
    do_executor: DoExecutor,
    /// Signaled on child completion and on child writes into parent state.
    pub notify: Notify,
    completed_children: Mutex<HashSet<String>>,
    runtime: OnceLock<Weak<BuilderCore>>,
    broker: Arc<Broker>,
    events: Arc<SubscriptionSystem>,
    agents: Arc<AgentRegistry>,
    global: Arc<GlobalState>,
}

impl Want {
    pub fn new(
        config: WantConfig,
        connectivity: ConnectivityMetadata,
        broker: Arc<Broker>,
        events: Arc<SubscriptionSystem>,
        agents: Arc<AgentRegistry>,
        global: Arc<GlobalState>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUF);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: config.metadata.id,
            name: config.metadata.name.clone(),
            metadata: RwLock::new(config.metadata),
            spec: RwLock::new(config.spec),
            status: RwLock::new(WantStatus::Idle),
            connectivity: RwLock::new(connectivity),
            state: Mutex::new(StateInner {
                state: config.state,
                pending: StateMap::new(),
                pending_params: StateMap::new(),
                pending_logs: Vec::new(),
                preserve_pending: false,
            }),
            history: WantHistory::new(),
            paths: RwLock::new(Paths::default()),
            inputs: tokio::sync::Mutex::new(IndexMap::new()),
            control_tx,
            control_rx: tokio::sync::Mutex::new(control_rx),
            stop_tx,
            suspended: AtomicBool::new(false),
            task_active: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            exec_interval: DEFAULT_EXEC_INTERVAL,
            background: tokio::sync::Mutex::new(HashMap::new()),
            do_executor: DoExecutor::new(),
            notify: Notify::new(),
            completed_children: Mutex::new(HashSet::new()),
            runtime: OnceLock::new(),
            broker,
            events,
            agents,
            global,
        })
    }

    pub(crate) fn attach_runtime(&self, core: Weak<BuilderCore>) {
        let _ = self.runtime.set(core);
    }

    pub(crate) fn runtime_core(&self) -> Option<Arc<BuilderCore>> {
        self.runtime.get()?.upgrade()
    }

    // ── Identity and metadata ─────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> String {
        self.metadata.read().type_name.clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    pub fn update_metadata<F: FnOnce(&mut Metadata)>(&self, f: F) {
        let mut md = self.metadata.write();
        f(&mut md);
        md.updated_at = Utc::now();
    }

    pub fn labels(&self) -> wunsch_core::LabelMap {
        self.metadata.read().labels.clone()
    }

    /// The topic this want publishes on, derived from its own labels.
    pub fn topic(&self) -> String {
        topic_for_labels(&self.metadata.read().labels)
    }

    pub fn spec(&self) -> WantSpec {
        self.spec.read().clone()
    }

    pub fn update_spec<F: FnOnce(&mut WantSpec)>(&self, f: F) {
        f(&mut self.spec.write());
    }

    pub fn connectivity(&self) -> ConnectivityMetadata {
        *self.connectivity.read()
    }

    pub fn exec_interval(&self) -> Duration {
        self.exec_interval
    }

    // ── Status ────────────────────────────────────────────────────────

    pub fn status(&self) -> WantStatus {
        *self.status.read()
    }

    /// Direct status write without event emission, for use inside reconcile
    /// phases where the write lock is already held.
    pub(crate) fn set_status_quiet(&self, status: WantStatus) {
        *self.status.write() = status;
    }

    /// Transition status and emit the synchronous `StatusChange` event.
    /// Entering `achieved` forces the completion invariants with a direct
    /// store before anything can observe the new status.
    pub async fn transition_status(&self, new: WantStatus) {
        let old = {
            let mut status = self.status.write();
            let old = *status;
            if old == new {
                return;
            }
            *status = new;
            old
        };
        if new == WantStatus::Achieved {
            self.force_completion_state();
        }
        info!(want = %self.name, from = %old, to = %new, "status change");
        self.events
            .emit(RuntimeEvent::StatusChange {
                meta: EventMeta::new(self.name.clone(), self.name.clone()),
                old: old.to_string(),
                new: new.to_string(),
            })
            .await;
    }

    fn force_completion_state(&self) {
        let mut inner = self.state.lock();
        inner
            .state
            .insert(state_keys::ACHIEVING_PERCENTAGE.into(), Value::from(100));
        inner
            .pending
            .insert(state_keys::ACHIEVING_PERCENTAGE.into(), Value::from(100));
        inner
            .state
            .insert(state_keys::COMPLETED.into(), Value::Bool(true));
        inner
            .pending
            .insert(state_keys::COMPLETED.into(), Value::Bool(true));
    }

    // ── State batching ────────────────────────────────────────────────

    /// Write a key to both committed state and the pending batch, skipping
    /// the write entirely when the value is unchanged.
    pub fn store_state(&self, key: &str, value: Value) {
        let old = {
            let mut inner = self.state.lock();
            let unchanged = inner.state.get(key) == Some(&value)
                && inner.pending.get(key).map_or(true, |p| p == &value);
            if unchanged {
                return;
            }
            let old = inner.state.get(key).cloned();
            inner.state.insert(key.to_string(), value.clone());
            inner.pending.insert(key.to_string(), value.clone());
            old
        };
        self.emit_state_change(key, old, value);
    }

    /// Stage updates into the pending batch only. Mapping values deep-merge
    /// over the current pending-then-state view; pending wins on conflict.
    pub fn merge_state(&self, updates: StateMap) {
        let mut inner = self.state.lock();
        for (key, value) in updates {
            let base = inner
                .pending
                .get(&key)
                .or_else(|| inner.state.get(&key))
                .cloned();
            let merged = match base {
                Some(mut existing) if existing.is_object() && value.is_object() => {
                    wunsch_core::deep_merge_value(&mut existing, value);
                    existing
                }
                _ => value,
            };
            inner.pending.insert(key, merged);
        }
    }

    /// Pending-first read.
    pub fn get_state(&self, key: &str) -> Option<Value> {
        let inner = self.state.lock();
        inner
            .pending
            .get(key)
            .or_else(|| inner.state.get(key))
            .cloned()
    }

    /// Committed state overlaid with the pending batch.
    pub fn state_snapshot(&self) -> StateMap {
        let inner = self.state.lock();
        let mut out = inner.state.clone();
        for (k, v) in &inner.pending {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn set_preserve_pending(&self, preserve: bool) {
        self.state.lock().preserve_pending = preserve;
    }

    /// Stage a parameter change; flushed to history at cycle end.
    pub fn update_param(&self, name: &str, value: Value) {
        self.spec
            .write()
            .params
            .insert(name.to_string(), value.clone());
        self.state
            .lock()
            .pending_params
            .insert(name.to_string(), value.clone());
        self.spawn_emit(RuntimeEvent::ParameterChange {
            meta: EventMeta::new(self.name.clone(), self.name.clone()),
            name: name.to_string(),
            value,
        });
    }

    /// Stage a log line for this cycle; flushed as one history entry and one
    /// tracing line per newline at cycle end.
    pub fn log(&self, line: impl Into<String>) {
        self.state.lock().pending_logs.push(line.into());
    }

    pub fn begin_progress_cycle(&self) {
        self.cycle.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.state.lock();
        if !inner.preserve_pending {
            inner.pending.clear();
        }
        inner.pending_params.clear();
        inner.pending_logs.clear();
    }

    /// Commit the pending batch atomically and flush history.
    pub fn end_progress_cycle(&self) {
        let status = self.status();
        let final_result_field = self.spec.read().final_result_field.clone();

        let mut inner = self.state.lock();

        if status == WantStatus::Achieved {
            inner
                .pending
                .insert(state_keys::ACHIEVING_PERCENTAGE.into(), Value::from(100));
            inner
                .pending
                .insert(state_keys::COMPLETED.into(), Value::Bool(true));
        }

        if let Some(field) = final_result_field {
            let value = inner
                .pending
                .get(&field)
                .or_else(|| inner.state.get(&field))
                .cloned();
            if let Some(value) = value {
                if !is_zero_value(&value) {
                    inner
                        .pending
                        .insert(state_keys::FINAL_RESULT.into(), value);
                }
            }
        }

        let had_changes = !inner.pending.is_empty();
        let pending: Vec<(String, Value)> = inner.pending.drain(..).collect();
        for (k, v) in pending {
            inner.state.insert(k, v);
        }

        if had_changes {
            let mut visible = inner.state.clone();
            visible.retain(|k, _| !is_internal_key(k));
            self.history.state.append(StateHistoryEntry {
                timestamp: Utc::now(),
                state: visible,
            });
        }

        if !inner.pending_params.is_empty() {
            let params: StateMap = inner.pending_params.drain(..).collect();
            self.history.parameters.append(ParameterHistoryEntry {
                timestamp: Utc::now(),
                params,
            });
        }

        if !inner.pending_logs.is_empty() {
            let lines: Vec<String> = inner.pending_logs.drain(..).collect();
            drop(inner);
            for line in &lines {
                info!(want = %self.name, "{line}");
            }
            self.history.logs.append(LogHistoryEntry {
                timestamp: Utc::now(),
                lines: lines.join("\n"),
            });
        }
    }

    fn emit_state_change(&self, key: &str, old: Option<Value>, new: Value) {
        self.spawn_emit(RuntimeEvent::StateChange {
            meta: EventMeta::new(self.name.clone(), self.name.clone()),
            key: key.to_string(),
            old,
            new,
        });
    }

    /// Emit an async-mode event without awaiting; quietly drops outside a
    /// runtime (pure unit tests).
    fn spawn_emit(&self, event: RuntimeEvent) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let events = self.events.clone();
            handle.spawn(async move {
                events.emit(event).await;
            });
        }
    }

    // ── Errors ────────────────────────────────────────────────────────

    pub fn set_config_error(&self, message: &str) {
        warn!(want = %self.name, error = message, "config error");
        self.store_state("error", Value::String(message.to_string()));
        self.set_status_quiet(WantStatus::ConfigError);
    }

    pub fn set_module_error(&self, message: &str) {
        tracing::error!(want = %self.name, error = message, "module error");
        self.store_state("error", Value::String(message.to_string()));
        self.set_status_quiet(WantStatus::ModuleError);
    }

    pub fn set_failed(&self, message: &str) {
        tracing::error!(want = %self.name, error = message, "failed");
        self.store_state("error", Value::String(message.to_string()));
        self.set_status_quiet(WantStatus::Failed);
    }

    /// Recoverable-error recovery path used by config updates.
    pub fn clear_config_error(&self) {
        if self.status() == WantStatus::ConfigError {
            let mut inner = self.state.lock();
            inner.state.shift_remove("error");
            inner.pending.shift_remove("error");
            drop(inner);
            self.set_status_quiet(WantStatus::Idle);
        }
    }

    // ── Publishing and consuming ──────────────────────────────────────

    /// Publish a payload to this want's own topic.
    pub async fn provide(&self, payload: Value) -> Result<(), wunsch_bus::BusError> {
        self.broker.publish(&self.topic(), BusMessage::new(payload)).await
    }

    /// Publish the stream terminator on this want's topic.
    pub async fn provide_done(&self) -> Result<(), wunsch_bus::BusError> {
        let topic = self.topic();
        let result = self.broker.publish(&topic, BusMessage::done()).await;
        self.events
            .emit(RuntimeEvent::ChannelEnd {
                meta: EventMeta::new(self.name.clone(), String::new()),
                topic,
            })
            .await;
        result
    }

    /// Receive the next packet from any input path.
    ///
    /// `timeout_ms < 0` waits indefinitely (until stop), `0` polls once,
    /// `> 0` bounds the wait. Returns the providing path name with the
    /// packet.
    pub async fn use_input(&self, timeout_ms: i64) -> Option<(String, TransportPacket)> {
        let deadline = if timeout_ms > 0 {
            Some(tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            {
                let mut inputs = self.inputs.lock().await;
                for (name, rx) in inputs.iter_mut() {
                    if let Ok(packet) = rx.try_recv() {
                        return Some((name.clone(), packet));
                    }
                }
            }
            if timeout_ms == 0 {
                return None;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
            }
            if *stop_rx.borrow() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                _ = stop_rx.changed() => return None,
            }
        }
    }

    /// Register an input path fed by a pub/sub adapter. Duplicate path names
    /// are ignored.
    pub(crate) async fn add_input(
        &self,
        provider_name: &str,
        topic: &str,
        rx: mpsc::Receiver<TransportPacket>,
    ) {
        let mut inputs = self.inputs.lock().await;
        if inputs.contains_key(provider_name) {
            return;
        }
        inputs.insert(provider_name.to_string(), rx);
        debug!(want = %self.name, provider = provider_name, topic, "input connected");
    }

    pub(crate) fn set_paths(&self, paths: Paths) {
        *self.paths.write() = paths;
    }

    pub fn paths(&self) -> Paths {
        self.paths.read().clone()
    }

    // ── Control ───────────────────────────────────────────────────────

    pub fn control_sender(&self) -> mpsc::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    pub fn send_control(&self, cmd: ControlCommand) {
        if self.control_tx.try_send(cmd).is_err() {
            warn!(want = %self.name, ?cmd, "control channel full, command dropped");
        }
    }

    pub(crate) async fn try_recv_control(&self) -> Option<ControlCommand> {
        self.control_rx.lock().await.try_recv().ok()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn set_task_active(&self, active: bool) -> bool {
        self.task_active.swap(active, Ordering::SeqCst)
    }

    pub fn is_task_active(&self) -> bool {
        self.task_active.load(Ordering::SeqCst)
    }

    // ── Agents ────────────────────────────────────────────────────────

    /// Reconcile declared capabilities with running agents: Do agents run
    /// once synchronously, persistent kinds start exactly once per
    /// `kind-name-wantid`.
    pub async fn execute_agents(self: &Arc<Self>) {
        let requires = self.spec.read().requires.clone();
        for tag in requires {
            let agents = self.agents.agents_for_requirement(&tag);
            if agents.is_empty() {
                debug!(want = %self.name, requirement = %tag, "no agent satisfies requirement");
                continue;
            }
            for agent in agents {
                let spec = self.agents.agent_spec(agent.name());
                let host: Arc<dyn AgentHost> = Arc::new(ValidatedHost::new(
                    self.clone() as Arc<dyn AgentHost>,
                    agent.name(),
                    spec,
                ));
                match agent.kind() {
                    AgentKind::Do => {
                        if let Err(err) = self.do_executor.run(&agent, &host).await {
                            // transient: recorded in agent history, never fails the want
                            debug!(want = %self.name, agent = agent.name(), error = %err, "do agent error");
                        }
                    }
                    kind => {
                        let key = background_key(kind, agent.name(), self.id);
                        let mut background = self.background.lock().await;
                        if !background.contains_key(&key) {
                            let driver =
                                spawn_background(agent.clone(), host, default_interval(kind));
                            background.insert(key, driver);
                        }
                    }
                }
            }
        }
    }

    pub async fn stop_background_agents(&self) {
        self.do_executor.cancel_all();
        let drained: Vec<BackgroundAgent> = {
            let mut background = self.background.lock().await;
            background.drain().map(|(_, v)| v).collect()
        };
        for driver in drained {
            driver.stop().await;
        }
    }

    // ── Parent access ─────────────────────────────────────────────────

    /// Resolve the controller owner through the builder. Never cached: owner
    /// references may change between calls.
    pub fn parent_want(&self) -> Option<Arc<Want>> {
        let owner_id = self.metadata.read().controller_owner()?.id;
        let core = self.runtime.get()?.upgrade()?;
        core.want_by_id(owner_id)
    }

    pub fn get_parent_state(&self, key: &str) -> Option<Value> {
        match self.parent_want() {
            Some(parent) => parent.get_state(key),
            None => self.global.get(key),
        }
    }

    pub fn store_parent_state(&self, key: &str, value: Value) {
        let mut updates = StateMap::new();
        updates.insert(key.to_string(), value);
        self.merge_parent_state(updates);
    }

    /// Deep-merge into the parent's committed state and wake its
    /// `stateNotify` waiters. Falls back to global state without a parent.
    pub fn merge_parent_state(&self, updates: StateMap) {
        match self.parent_want() {
            Some(parent) => {
                parent.apply_child_merge(updates.clone());
                parent.notify.notify_waiters();
                self.spawn_emit(RuntimeEvent::OwnerChildState {
                    meta: EventMeta::new(self.name.clone(), parent.name().to_string()),
                    child_name: self.name.clone(),
                    updates: serde_json::to_value(updates).unwrap_or(Value::Null),
                });
            }
            None => self.global.merge(updates),
        }
    }

    fn apply_child_merge(&self, updates: StateMap) {
        let mut inner = self.state.lock();
        merge_into(&mut inner.state, updates);
    }

    /// Called when an owned child reaches `achieved`.
    pub(crate) fn record_child_completed(&self, child_name: &str) {
        self.completed_children.lock().insert(child_name.to_string());
        self.notify.notify_waiters();
    }

    pub fn completed_children(&self) -> HashSet<String> {
        self.completed_children.lock().clone()
    }

    // ── Serialization ─────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> WantSnapshot {
        WantSnapshot {
            metadata: self.metadata(),
            spec: self.spec(),
            status: self.status(),
            state: self.state_snapshot(),
            history: self.history.to_snapshot(),
        }
    }

    /// SHA-256 ETag over the want's observable identity and state.
    pub fn hash(&self) -> String {
        let metadata = serde_json::to_value(self.metadata()).unwrap_or(Value::Null);
        let spec = serde_json::to_value(self.spec()).unwrap_or(Value::Null);
        let status = serde_json::to_value(self.status()).unwrap_or(Value::Null);
        let state = serde_json::to_value(self.state_snapshot()).unwrap_or(Value::Null);
        wunsch_core::want_hash(&metadata, &spec, &status, &state)
    }

    pub(crate) fn events(&self) -> &Arc<SubscriptionSystem> {
        &self.events
    }
}

impl AgentHost for Want {
    fn want_id(&self) -> Uuid {
        self.id
    }

    fn want_name(&self) -> String {
        self.name.clone()
    }

    fn is_achieved(&self) -> bool {
        self.status() == WantStatus::Achieved
    }

    fn get_state(&self, key: &str) -> Option<Value> {
        Want::get_state(self, key)
    }

    fn store_state(&self, key: &str, value: Value) {
        Want::store_state(self, key, value);
    }

    fn merge_state(&self, updates: StateMap) {
        Want::merge_state(self, updates);
    }

    fn get_parent_state(&self, key: &str) -> Option<Value> {
        Want::get_parent_state(self, key)
    }

    fn store_parent_state(&self, key: &str, value: Value) {
        Want::store_parent_state(self, key, value);
    }

    fn merge_parent_state(&self, updates: StateMap) {
        Want::merge_parent_state(self, updates);
    }

    fn record_agent_run(&self, entry: AgentHistoryEntry) {
        self.history.agents.append(entry);
    }
}

impl std::fmt::Debug for Want {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Want")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
