//! The chain builder: reconciles declared config against running wants.
//!
//! A single reconcile-loop task drains the operations queue and timed ticks,
//! then runs five phases under one exclusive lock: compile (config diff →
//! runtime wants), connect (label-selector matching → pub/sub adapter
//! paths), start (idle wants with satisfied connectivity), access (state
//! field → accessor index) and correlate (derived peer coupling).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wunsch_agent::AgentRegistry;
use wunsch_bus::{spawn_adapter, topic_for_labels, Broker, SubscriptionSystem};
use wunsch_core::{
    detect_config_changes, labels_match, md5_hex, ChangeEvent, ConnectivityMetadata,
    CorrelationRef, LabelMap, LabelSelector, PathInfo, Paths, WantConfig, WantStatus, WantTypeDef,
};

use crate::config::{apply_type_def, load_config, load_type_defs};
use crate::error::RuntimeError;
use crate::global::GlobalState;
use crate::ops::{QueuedOperation, WantOperation};
use crate::progression::spawn_progression_loop;
use crate::registry::{NoopProgressable, TypeRegistry, WantFactory};
use crate::snapshot::{write_snapshot, MemorySnapshot};
use crate::target::TargetFactory;
use crate::want::{ControlCommand, Progressable, Want};

const RECONCILE_TICK: Duration = Duration::from_millis(100);
const STATS_TICK: Duration = Duration::from_secs(1);
const OP_QUEUE_BUF: usize = 64;
const TRIGGER_BUF: usize = 64;

pub(crate) enum Trigger {
    Reconcile,
    CheckCompletedRetrigger,
}

struct RuntimeWant {
    want: Arc<Want>,
    progressable: Arc<dyn Progressable>,
    task: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct ReconcileState {
    /// Live wants by name. Names are unique; duplicates are rejected on add.
    wants: IndexMap<String, RuntimeWant>,
    config: Vec<WantConfig>,
    last_config: Vec<WantConfig>,
    /// (topic, consumer) pairs with a live subscription + adapter.
    adapters: HashSet<(String, String)>,
    /// `k=v` label → ids of wants selecting it through `using`.
    label_users: HashMap<String, HashSet<Uuid>>,
    /// State field path → accessor want ids.
    access_index: HashMap<String, Vec<Uuid>>,
    compiled_once: bool,
}

/// Construction options for a [`Builder`].
#[derive(Default, Clone)]
pub struct BuilderOptions {
    pub memory_dir: Option<PathBuf>,
    pub types_dir: Option<PathBuf>,
    pub capabilities_dir: Option<PathBuf>,
    pub global_state_file: Option<PathBuf>,
    /// Batch mode: reload this config when its content hash changes.
    pub watch_config: Option<PathBuf>,
}

pub struct BuilderCore {
    state: tokio::sync::RwLock<ReconcileState>,
    /// Secondary id index for parent lookups; never requires the reconcile
    /// lock, so wants can resolve owners from inside a reconcile pass.
    index: parking_lot::RwLock<HashMap<Uuid, Arc<Want>>>,
    types: TypeRegistry,
    type_defs: parking_lot::RwLock<HashMap<String, WantTypeDef>>,
    agents: Arc<AgentRegistry>,
    broker: Arc<Broker>,
    events: Arc<SubscriptionSystem>,
    global: Arc<GlobalState>,
    op_tx: mpsc::Sender<QueuedOperation>,
    trigger_tx: mpsc::Sender<Trigger>,
    shutdown_tx: watch::Sender<bool>,
    execution_id: Uuid,
    options: BuilderOptions,
    snapshot_hash: Mutex<Option<String>>,
    watch_hash: Mutex<Option<String>>,
    completed: Mutex<HashSet<Uuid>>,
}

/// Public handle around the reconciler core.
pub struct Builder {
    core: Arc<BuilderCore>,
    receivers: Mutex<Option<(mpsc::Receiver<QueuedOperation>, mpsc::Receiver<Trigger>)>>,
}

/// Terminal tally produced by [`Builder::run_until_settled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub achieved: usize,
    pub failed: usize,
}

impl Builder {
    pub fn new(options: BuilderOptions) -> Self {
        let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_BUF);
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUF);
        let (shutdown_tx, _) = watch::channel(false);

        let global = Arc::new(match &options.global_state_file {
            Some(path) => GlobalState::with_file(path.clone()),
            None => GlobalState::new(),
        });

        let agents = Arc::new(AgentRegistry::new());
        if let Some(dir) = &options.capabilities_dir {
            match wunsch_agent::load_capabilities_dir(dir) {
                Ok(caps) => agents.register_capabilities(caps),
                Err(err) => warn!(error = %err, "capability directory load failed"),
            }
        }

        let type_defs = options
            .types_dir
            .as_deref()
            .map(load_type_defs)
            .unwrap_or_default();

        let core = Arc::new(BuilderCore {
            state: tokio::sync::RwLock::new(ReconcileState::default()),
            index: parking_lot::RwLock::new(HashMap::new()),
            types: TypeRegistry::new(),
            type_defs: parking_lot::RwLock::new(type_defs),
            agents,
            broker: Arc::new(Broker::new()),
            events: Arc::new(SubscriptionSystem::new()),
            global,
            op_tx,
            trigger_tx,
            shutdown_tx,
            execution_id: Uuid::new_v4(),
            options,
            snapshot_hash: Mutex::new(None),
            watch_hash: Mutex::new(None),
            completed: Mutex::new(HashSet::new()),
        });

        // built-in parent type
        core.types.register("target", Arc::new(TargetFactory));

        Self {
            core,
            receivers: Mutex::new(Some((op_rx, trigger_rx))),
        }
    }

    /// Spawn the reconcile loop. Call once.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let (op_rx, trigger_rx) = self
            .receivers
            .lock()
            .take()
            .expect("builder already started");
        let core = self.core.clone();
        tokio::spawn(async move {
            core.reconcile_loop(op_rx, trigger_rx).await;
        })
    }

    pub fn register_want_type(&self, type_name: impl Into<String>, factory: Arc<dyn WantFactory>) {
        self.core.types.register(type_name, factory);
    }

    pub fn agent_registry(&self) -> &Arc<AgentRegistry> {
        &self.core.agents
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.core.broker
    }

    pub fn events(&self) -> &Arc<SubscriptionSystem> {
        &self.core.events
    }

    pub fn global(&self) -> &Arc<GlobalState> {
        &self.core.global
    }

    pub fn execution_id(&self) -> Uuid {
        self.core.execution_id
    }

    // ── Operations queue ──────────────────────────────────────────────

    /// Queue an operation and wait for its acknowledgement.
    pub async fn queue_acked(&self, op: WantOperation) -> Result<(), RuntimeError> {
        let (queued, rx) = QueuedOperation::acked(op);
        self.core
            .op_tx
            .send(queued)
            .await
            .map_err(|_| RuntimeError::ShuttingDown)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(RuntimeError::Config(wunsch_core::CoreError::InvalidConfig(
                msg,
            ))),
            Err(_) => Err(RuntimeError::ShuttingDown),
        }
    }

    /// Queue an operation without waiting.
    pub async fn queue(&self, op: WantOperation) -> Result<(), RuntimeError> {
        self.core
            .op_tx
            .send(QueuedOperation::fire_and_forget(op))
            .await
            .map_err(|_| RuntimeError::ShuttingDown)
    }

    pub async fn queue_want_add(&self, wants: Vec<WantConfig>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Add(wants)).await
    }

    pub async fn queue_want_delete(&self, ids: Vec<Uuid>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Delete(ids)).await
    }

    pub async fn queue_want_suspend(&self, ids: Vec<Uuid>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Suspend(ids)).await
    }

    pub async fn queue_want_resume(&self, ids: Vec<Uuid>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Resume(ids)).await
    }

    pub async fn queue_want_stop(&self, ids: Vec<Uuid>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Stop(ids)).await
    }

    pub async fn queue_want_start(&self, ids: Vec<Uuid>) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::Start(ids)).await
    }

    pub async fn queue_want_add_label(
        &self,
        id: Uuid,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::AddLabel {
            id,
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn queue_want_remove_label(
        &self,
        id: Uuid,
        key: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.queue_acked(WantOperation::RemoveLabel {
            id,
            key: key.into(),
        })
        .await
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn want_by_id(&self, id: Uuid) -> Option<Arc<Want>> {
        self.core.want_by_id(id)
    }

    pub async fn want(&self, name: &str) -> Option<Arc<Want>> {
        self.core
            .state
            .read()
            .await
            .wants
            .get(name)
            .map(|rw| rw.want.clone())
    }

    pub async fn want_names(&self) -> Vec<String> {
        self.core.state.read().await.wants.keys().cloned().collect()
    }

    pub async fn snapshot_now(&self) -> MemorySnapshot {
        self.core.build_snapshot().await
    }

    /// Update a parameter on a parent want and propagate it to children
    /// whose mapped parameter names match.
    pub async fn update_target_parameter(
        &self,
        target_name: &str,
        param: &str,
        value: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        let target = self
            .want(target_name)
            .await
            .ok_or_else(|| RuntimeError::UnknownWantName(target_name.to_string()))?;
        crate::target::propagate_parameter(&self.core, &target, param, value).await;
        Ok(())
    }

    /// Wait until every non-system want is terminal (batch completion).
    pub async fn run_until_settled(&self, timeout: Duration) -> Result<RunSummary, RuntimeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let summary = {
                let state = self.core.state.read().await;
                let tracked: Vec<&RuntimeWant> = state
                    .wants
                    .values()
                    .filter(|rw| !rw.want.metadata().is_system_want)
                    .collect();
                let total = tracked.len();
                let achieved = tracked
                    .iter()
                    .filter(|rw| rw.want.status() == WantStatus::Achieved)
                    .count();
                let terminal = tracked
                    .iter()
                    .filter(|rw| rw.want.status().is_terminal())
                    .count();
                let failed = terminal - achieved;
                (total > 0 && terminal == total).then_some(RunSummary {
                    total,
                    achieved,
                    failed,
                })
            };
            if let Some(summary) = summary {
                return Ok(summary);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Config(wunsch_core::CoreError::InvalidConfig(
                    "run did not settle before the timeout".into(),
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Graceful teardown: stop every want, join their tasks, stop background
    /// agents, write a last snapshot and close the broker.
    pub async fn shutdown(&self) {
        let _ = self.core.shutdown_tx.send(true);

        let mut tasks = Vec::new();
        {
            let mut state = self.core.state.write().await;
            for rw in state.wants.values_mut() {
                rw.want.stop();
                if let Some(task) = rw.task.take() {
                    tasks.push(task);
                }
            }
        }
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("progression task did not stop in time");
            }
        }
        {
            let state = self.core.state.read().await;
            for rw in state.wants.values() {
                rw.want.stop_background_agents().await;
            }
        }
        self.core.write_snapshot_if_changed().await;
        self.core.broker.close().await;
        info!("builder shut down");
    }
}

impl BuilderCore {
    pub(crate) fn want_by_id(&self, id: Uuid) -> Option<Arc<Want>> {
        self.index.read().get(&id).cloned()
    }

    pub(crate) async fn want_by_name(&self, name: &str) -> Option<Arc<Want>> {
        // best-effort: used from inside want tasks while a reconcile may be
        // running, so never block on the write lock
        match self.state.try_read() {
            Ok(state) => state.wants.get(name).map(|rw| rw.want.clone()),
            Err(_) => self
                .index
                .read()
                .values()
                .find(|w| w.name() == name)
                .cloned(),
        }
    }

    /// Children whose controller owner is the given want.
    pub(crate) fn wants_owned_by(&self, owner: Uuid) -> Vec<Arc<Want>> {
        self.index
            .read()
            .values()
            .filter(|w| {
                w.metadata()
                    .owner_references
                    .iter()
                    .any(|r| r.controller && r.id == owner)
            })
            .cloned()
            .collect()
    }

    pub(crate) async fn enqueue(&self, op: QueuedOperation) {
        if self.op_tx.send(op).await.is_err() {
            warn!("operation queue closed");
        }
    }

    /// Called by progression loops when a want achieves.
    pub(crate) fn mark_completed(&self, id: Uuid) {
        self.completed.lock().insert(id);
        let _ = self.trigger_tx.try_send(Trigger::CheckCompletedRetrigger);
    }

    // ── Reconcile loop ────────────────────────────────────────────────

    async fn reconcile_loop(
        self: Arc<Self>,
        mut op_rx: mpsc::Receiver<QueuedOperation>,
        mut trigger_rx: mpsc::Receiver<Trigger>,
    ) {
        let mut reconcile_tick = tokio::time::interval(RECONCILE_TICK);
        let mut stats_tick = tokio::time::interval(STATS_TICK);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(execution_id = %self.execution_id, "reconcile loop started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(op) = op_rx.recv() => {
                    self.process_operation(op).await;
                    self.reconcile().await;
                }
                Some(trigger) = trigger_rx.recv() => match trigger {
                    Trigger::Reconcile => self.reconcile().await,
                    Trigger::CheckCompletedRetrigger => {
                        self.check_completed_retrigger().await;
                    }
                },
                _ = reconcile_tick.tick() => {
                    self.maybe_reload_watched_config().await;
                    self.reconcile().await;
                }
                _ = stats_tick.tick() => {
                    self.write_snapshot_if_changed().await;
                }
            }
        }
        info!("reconcile loop stopped");
    }

    async fn process_operation(self: &Arc<Self>, op: QueuedOperation) {
        let result = match &op.op {
            WantOperation::Add(configs) => self.op_add(configs.clone()).await,
            WantOperation::Delete(ids) => self.op_delete(ids).await,
            WantOperation::Suspend(ids) => {
                self.route_control(ids, ControlCommand::Suspend);
                Ok(())
            }
            WantOperation::Resume(ids) => {
                self.route_control(ids, ControlCommand::Resume);
                Ok(())
            }
            WantOperation::Stop(ids) => {
                self.route_control(ids, ControlCommand::Stop);
                Ok(())
            }
            WantOperation::Start(ids) => self.op_start(ids).await,
            WantOperation::AddLabel { id, key, value } => {
                self.op_label(*id, key, Some(value.clone()))
            }
            WantOperation::RemoveLabel { id, key } => self.op_label(*id, key, None),
        };
        if let Err(err) = &result {
            warn!(error = %err, "operation failed");
        }
        op.ack(result);
    }

    async fn op_add(&self, mut configs: Vec<WantConfig>) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;
        for config in &mut configs {
            config.ensure_id();
            let name = &config.metadata.name;
            if state.wants.contains_key(name)
                || state.config.iter().any(|c| &c.metadata.name == name)
            {
                return Err(RuntimeError::DuplicateName(name.clone()));
            }
            state.config.push(config.clone());
        }
        Ok(())
    }

    async fn op_delete(self: &Arc<Self>, ids: &[Uuid]) -> Result<(), RuntimeError> {
        let mut state = self.state.write().await;
        for id in ids {
            self.remove_want_cascade(&mut state, *id).await;
        }
        Ok(())
    }

    async fn op_start(&self, ids: &[Uuid]) -> Result<(), RuntimeError> {
        for id in ids {
            let want = self
                .want_by_id(*id)
                .ok_or(RuntimeError::UnknownWant(*id))?;
            if want.is_task_active() {
                want.send_control(ControlCommand::Restart);
            } else {
                // restarted by the next start phase
                want.set_status_quiet(WantStatus::Idle);
            }
        }
        Ok(())
    }

    fn op_label(
        &self,
        id: Uuid,
        key: &str,
        value: Option<String>,
    ) -> Result<(), RuntimeError> {
        let want = self.want_by_id(id).ok_or(RuntimeError::UnknownWant(id))?;
        want.update_metadata(|md| match &value {
            Some(v) => {
                md.labels.insert(key.to_string(), v.clone());
            }
            None => {
                md.labels.remove(key);
            }
        });
        Ok(())
    }

    fn route_control(&self, ids: &[Uuid], cmd: ControlCommand) {
        for id in ids {
            match self.want_by_id(*id) {
                Some(want) => want.send_control(cmd),
                None => warn!(%id, ?cmd, "control for unknown want"),
            }
        }
    }

    /// One completion sweep: achieved dependents of freshly-completed
    /// providers go back to idle so the start phase re-runs them.
    async fn check_completed_retrigger(&self) {
        let completed: Vec<Uuid> = self.completed.lock().drain().collect();
        if completed.is_empty() {
            return;
        }
        let state = self.state.read().await;
        for id in completed {
            let Some(provider) = self.want_by_id(id) else {
                continue;
            };
            for (k, v) in provider.labels() {
                let Some(users) = state.label_users.get(&format!("{k}={v}")) else {
                    continue;
                };
                for user_id in users {
                    if let Some(user) = self.want_by_id(*user_id) {
                        if user.status() == WantStatus::Achieved && !user.is_task_active() {
                            debug!(want = %user.name(), provider = %provider.name(), "retrigger on provider completion");
                            user.set_status_quiet(WantStatus::Idle);
                        }
                    }
                }
            }
        }
        drop(state);
        let _ = self.trigger_tx.try_send(Trigger::Reconcile);
    }

    // ── Reconciliation phases ─────────────────────────────────────────

    pub(crate) async fn reconcile(self: &Arc<Self>) {
        let mut state = self.state.write().await;
        self.compile_phase(&mut state).await;
        self.connect_phase(&mut state).await;
        self.start_phase(&mut state);
        self.access_phase(&mut state);
        self.correlate_phase(&mut state);
    }

    /// Phase 1: align the runtime want set with declared config.
    async fn compile_phase(self: &Arc<Self>, state: &mut ReconcileState) {
        if !state.compiled_once {
            for config in state.config.clone() {
                if let Err(err) = self.add_want(state, config) {
                    warn!(error = %err, "initial want add failed");
                }
            }
            state.compiled_once = true;
        } else {
            let new_config = state.config.clone();
            for event in detect_config_changes(&state.last_config, &new_config) {
                match event {
                    ChangeEvent::Added(config) => {
                        if let Err(err) = self.add_want(state, config) {
                            warn!(error = %err, "want add failed");
                        }
                    }
                    ChangeEvent::Updated { new, .. } => self.sync_want_update(state, new),
                    ChangeEvent::Deleted(config) => {
                        self.remove_want_cascade(state, config.metadata.id).await;
                    }
                }
            }
        }

        // sweep: wants declared in config but missing from the runtime
        // (asynchronous adds land here)
        for config in state.config.clone() {
            if !state.wants.contains_key(&config.metadata.name) {
                if let Err(err) = self.add_want(state, config) {
                    warn!(error = %err, "sweep add failed");
                }
            }
        }

        // deep copy so later in-place edits cannot alias change detection
        state.last_config = state.config.clone();
    }

    fn add_want(
        self: &Arc<Self>,
        state: &mut ReconcileState,
        mut config: WantConfig,
    ) -> Result<(), RuntimeError> {
        config.ensure_id();
        let name = config.metadata.name.clone();
        if state.wants.contains_key(&name) {
            return Err(RuntimeError::DuplicateName(name));
        }

        let type_def = self.type_def(&config.metadata.type_name);
        if let Some(def) = &type_def {
            apply_type_def(&mut config, def);
        }
        let connectivity = type_def
            .map(|d| d.connect)
            .unwrap_or_else(ConnectivityMetadata::default);

        let want = Want::new(
            config.clone(),
            connectivity,
            self.broker.clone(),
            self.events.clone(),
            self.agents.clone(),
            self.global.clone(),
        );
        want.attach_runtime(Arc::downgrade(self));

        let progressable = match self.types.create(&config) {
            Some(p) => p,
            None => {
                want.set_config_error(&format!(
                    "unknown want type: {}",
                    config.metadata.type_name
                ));
                Arc::new(NoopProgressable)
            }
        };

        // keep config and runtime aligned for wants added directly
        if !state.config.iter().any(|c| c.metadata.id == config.metadata.id) {
            state.config.push(config);
        }

        self.index.write().insert(want.id(), want.clone());
        info!(want = %name, id = %want.id(), "want added");
        state.wants.insert(
            name,
            RuntimeWant {
                want,
                progressable,
                task: None,
            },
        );
        Ok(())
    }

    /// Apply an in-place config update to an existing runtime want,
    /// preserving the embedded want instance.
    fn sync_want_update(&self, state: &mut ReconcileState, new: WantConfig) {
        let Some(rw) = state
            .wants
            .values()
            .find(|rw| rw.want.id() == new.metadata.id)
        else {
            return;
        };
        let want = &rw.want;
        debug!(want = %want.name(), "syncing config update");
        want.update_spec(|spec| *spec = new.spec.clone());
        want.update_metadata(|md| {
            md.labels = new.metadata.labels.clone();
            md.owner_references = new.metadata.owner_references.clone();
        });
        want.clear_config_error();
        // allow a terminal want with fresh config to run again
        if want.status().is_terminal() && !want.is_task_active() {
            want.set_status_quiet(WantStatus::Idle);
        }
    }

    /// Remove a want and everything it owns, recursively.
    async fn remove_want_cascade(&self, state: &mut ReconcileState, id: Uuid) {
        let mut doomed = vec![id];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let owner = doomed[cursor];
            cursor += 1;
            for rw in state.wants.values() {
                let md = rw.want.metadata();
                if md.owner_references.iter().any(|r| r.id == owner)
                    && !doomed.contains(&md.id)
                {
                    doomed.push(md.id);
                }
            }
        }

        // children first
        for id in doomed.iter().rev() {
            let Some(name) = state
                .wants
                .values()
                .find(|rw| rw.want.id() == *id)
                .map(|rw| rw.want.name().to_string())
            else {
                continue;
            };
            let Some(mut rw) = state.wants.shift_remove(&name) else {
                continue;
            };
            info!(want = %name, "deleting want");
            rw.want.set_status_quiet(WantStatus::Deleting);
            rw.progressable.on_delete(&rw.want).await;
            rw.want.stop();
            rw.want.stop_background_agents().await;
            if let Some(task) = rw.task.take() {
                // the stop channel ends the loop on its next iteration
                drop(task);
            }

            let stale: Vec<(String, String)> = state
                .adapters
                .iter()
                .filter(|(_, consumer)| consumer == &name)
                .cloned()
                .collect();
            for (topic, consumer) in stale {
                let _ = self.broker.unsubscribe(&topic, &consumer).await;
                state.adapters.remove(&(topic, consumer));
            }

            self.index.write().remove(id);
            state.config.retain(|c| c.metadata.id != *id);
            self.completed.lock().remove(id);
        }
    }

    /// Phase 2: derive topology. Every consumer-side path is a pub/sub
    /// adapter channel; direct want-to-want channels are never created.
    async fn connect_phase(&self, state: &mut ReconcileState) {
        self.auto_connect(state);

        let wants: Vec<(Uuid, String, Arc<Want>)> = state
            .wants
            .values()
            .map(|rw| (rw.want.id(), rw.want.name().to_string(), rw.want.clone()))
            .collect();

        let mut new_paths: HashMap<Uuid, Paths> = wants
            .iter()
            .map(|(id, _, _)| (*id, Paths::default()))
            .collect();
        state.label_users.clear();

        for (consumer_id, consumer_name, consumer) in &wants {
            let selectors: Vec<LabelSelector> = consumer.spec().using;
            for selector in &selectors {
                for (k, v) in selector {
                    state
                        .label_users
                        .entry(format!("{k}={v}"))
                        .or_default()
                        .insert(*consumer_id);
                }
                for (provider_id, provider_name, provider) in &wants {
                    if provider_id == consumer_id {
                        continue;
                    }
                    let provider_labels: LabelMap = provider.labels();
                    if !labels_match(selector, &provider_labels) {
                        continue;
                    }
                    let topic = topic_for_labels(&provider_labels);
                    let key = (topic.clone(), consumer_name.clone());
                    if !state.adapters.contains(&key) {
                        match self.broker.subscribe(&topic, consumer_name).await {
                            Ok(subscription) => {
                                let rx = spawn_adapter(subscription);
                                consumer.add_input(provider_name, &topic, rx).await;
                                state.adapters.insert(key);
                            }
                            Err(err) => {
                                warn!(topic = %topic, consumer = %consumer_name, error = %err, "subscribe failed");
                                continue;
                            }
                        }
                    }

                    let paths = new_paths.get_mut(consumer_id).expect("consumer paths");
                    if !paths.in_paths.iter().any(|p| &p.name == provider_name) {
                        paths.in_paths.push(PathInfo {
                            channel: topic.clone(),
                            name: provider_name.clone(),
                            active: true,
                        });
                    }
                    let paths = new_paths.get_mut(provider_id).expect("provider paths");
                    if !paths.out_paths.iter().any(|p| &p.name == consumer_name) {
                        paths.out_paths.push(PathInfo {
                            channel: topic,
                            name: consumer_name.clone(),
                            active: true,
                        });
                    }
                }
            }
        }

        for (id, _, want) in &wants {
            want.set_paths(new_paths.remove(id).unwrap_or_default());

            // connectivity validation is warn-only here; the progression
            // loop enforces it as a precondition
            let paths = want.paths();
            let connectivity = want.connectivity();
            if !connectivity.satisfied_by(paths.in_paths.len(), paths.out_paths.len()) {
                debug!(
                    want = %want.name(),
                    inputs = paths.in_paths.len(),
                    outputs = paths.out_paths.len(),
                    "connectivity not yet satisfied"
                );
            }
        }
    }

    /// Role-based auto-connection: wants that share an `approval_id`
    /// parameter are labeled with it, and coordinators select peers by it.
    fn auto_connect(&self, state: &mut ReconcileState) {
        for rw in state.wants.values() {
            let want = &rw.want;
            let Some(approval) = want
                .spec()
                .params
                .get("approval_id")
                .and_then(|v| v.as_str().map(str::to_string))
            else {
                continue;
            };
            let labels = want.labels();
            if labels.get("approval_id") != Some(&approval) {
                want.update_metadata(|md| {
                    md.labels.insert("approval_id".into(), approval.clone());
                });
            }
            if labels.get("role").map(String::as_str) == Some("coordinator") {
                let mut selector = LabelSelector::new();
                selector.insert("approval_id".into(), approval.clone());
                let already = want
                    .spec()
                    .using
                    .iter()
                    .any(|s| s.get("approval_id") == Some(&approval) && s.len() == 1);
                if !already {
                    want.update_spec(|spec| spec.using.push(selector));
                }
            }
        }
    }

    /// Phase 3: start idle wants whose connectivity is satisfied.
    fn start_phase(self: &Arc<Self>, state: &mut ReconcileState) {
        for rw in state.wants.values_mut() {
            if rw.want.status() != WantStatus::Idle {
                continue;
            }
            let paths = rw.want.paths();
            let connectivity = rw.want.connectivity();
            if !connectivity.satisfied_by(paths.in_paths.len(), paths.out_paths.len()) {
                continue;
            }
            if rw.want.set_task_active(true) {
                // already running
                continue;
            }
            rw.want.set_status_quiet(WantStatus::Reaching);
            info!(want = %rw.want.name(), "starting progression loop");
            rw.task = Some(spawn_progression_loop(
                rw.want.clone(),
                rw.progressable.clone(),
                Arc::downgrade(self),
            ));
        }
    }

    /// Phase 4: rebuild the state-access dictionary.
    fn access_phase(&self, state: &mut ReconcileState) {
        state.access_index.clear();
        for rw in state.wants.values() {
            let want = &rw.want;
            let id = want.id();
            let spec = want.spec();

            for subscription in &spec.state_subscriptions {
                state
                    .access_index
                    .entry(subscription.clone())
                    .or_default()
                    .push(id);
            }

            if let Some(owner) = want.metadata().controller_owner().cloned() {
                for tag in &spec.requires {
                    for agent in self.agents.agents_for_requirement(tag) {
                        let agent_spec = self.agents.agent_spec(agent.name());
                        for field in agent_spec.allowed_parent_state {
                            state
                                .access_index
                                .entry(format!("{}/{}", owner.id, field))
                                .or_default()
                                .push(id);
                        }
                    }
                }
            }

            for key in want.state_snapshot().keys() {
                if wunsch_core::is_internal_key(key) {
                    continue;
                }
                state
                    .access_index
                    .entry(format!("{id}/{key}"))
                    .or_default()
                    .push(id);
            }
        }
        for accessors in state.access_index.values_mut() {
            accessors.sort();
            accessors.dedup();
        }
    }

    /// Phase 5: recompute derived correlation for every want (full rescan).
    fn correlate_phase(&self, state: &mut ReconcileState) {
        let wants: Vec<(Uuid, LabelMap, Vec<LabelSelector>)> = state
            .wants
            .values()
            .map(|rw| (rw.want.id(), rw.want.labels(), rw.want.spec().using))
            .collect();

        for rw in state.wants.values() {
            let want = &rw.want;
            let id = want.id();
            let labels = want.labels();
            let using = want.spec().using;

            let mut peers: HashMap<Uuid, LabelMap> = HashMap::new();
            for (other_id, other_labels, other_using) in &wants {
                if *other_id == id {
                    continue;
                }
                let entry = peers.entry(*other_id).or_default();

                for (k, v) in &labels {
                    if other_labels.get(k) == Some(v) {
                        entry.insert(format!("{k}={v}"), String::new());
                    }
                }
                for selector in &using {
                    if labels_match(selector, other_labels) {
                        for (k, v) in selector {
                            entry.insert(format!("{k}={v}"), String::new());
                        }
                    }
                }
                for selector in other_using {
                    if labels_match(selector, &labels) {
                        for (k, v) in selector {
                            entry.insert(format!("{k}={v}"), String::new());
                        }
                    }
                }
            }

            for (field, accessors) in &state.access_index {
                if !accessors.contains(&id) {
                    continue;
                }
                for other in accessors {
                    if *other == id {
                        continue;
                    }
                    peers
                        .entry(*other)
                        .or_default()
                        .insert(format!("stateAccess/{field}"), String::new());
                }
            }

            let mut correlation: Vec<CorrelationRef> = peers
                .into_iter()
                .filter(|(_, keys)| !keys.is_empty())
                .map(|(peer_id, keys)| {
                    let rate = keys
                        .keys()
                        .map(|k| if k.starts_with("stateAccess/") { 2 } else { 1 })
                        .sum();
                    CorrelationRef {
                        peer_want_id: peer_id,
                        labels: keys,
                        rate,
                    }
                })
                .collect();
            correlation.sort_by(|a, b| b.rate.cmp(&a.rate));
            want.update_metadata(|md| md.correlation = correlation);
        }
    }

    // ── Persistence ───────────────────────────────────────────────────

    async fn build_snapshot(&self) -> MemorySnapshot {
        let state = self.state.read().await;
        MemorySnapshot {
            timestamp: Utc::now(),
            execution_id: self.execution_id,
            wants: state.wants.values().map(|rw| rw.want.to_snapshot()).collect(),
        }
    }

    async fn write_snapshot_if_changed(&self) {
        let Some(dir) = self.options.memory_dir.clone() else {
            return;
        };
        let snapshot = self.build_snapshot().await;
        let mut last_hash = self.snapshot_hash.lock().clone();
        match write_snapshot(&dir, &snapshot, &mut last_hash) {
            Ok(written) => {
                *self.snapshot_hash.lock() = last_hash;
                if written {
                    debug!("memory snapshot updated");
                }
            }
            Err(err) => warn!(error = %err, "snapshot write failed"),
        }
    }

    /// Batch mode: reload the watched config when its content changes.
    async fn maybe_reload_watched_config(&self) {
        let Some(path) = self.options.watch_config.clone() else {
            return;
        };
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        let digest = md5_hex(text.as_bytes());
        {
            let mut watch_hash = self.watch_hash.lock();
            if watch_hash.as_deref() == Some(digest.as_str()) {
                return;
            }
            *watch_hash = Some(digest);
        }
        match load_config(&path) {
            Ok(mut wants) => {
                info!(path = %path.display(), wants = wants.len(), "config reloaded");
                let mut state = self.state.write().await;
                // keep ids stable across reloads by matching names
                for want in &mut wants {
                    if want.metadata.id.is_nil() {
                        if let Some(previous) = state
                            .last_config
                            .iter()
                            .find(|c| c.metadata.name == want.metadata.name)
                        {
                            want.metadata.id = previous.metadata.id;
                        }
                    }
                }
                // owned children never appear in the file; carry them over
                // so a reload does not cascade-delete recipe instances
                let children: Vec<WantConfig> = state
                    .config
                    .iter()
                    .filter(|c| {
                        !c.metadata.owner_references.is_empty()
                            && !wants.iter().any(|w| w.metadata.name == c.metadata.name)
                    })
                    .cloned()
                    .collect();
                wants.extend(children);
                state.config = wants;
            }
            Err(err) => warn!(path = %path.display(), error = %err, "config reload failed"),
        }
    }

    fn type_def(&self, type_name: &str) -> Option<WantTypeDef> {
        if let Some(def) = self.type_defs.read().get(type_name) {
            return Some(def.clone());
        }
        // lazy reload: a definition may have appeared since startup
        let dir = self.options.types_dir.as_deref()?;
        let defs = load_type_defs(dir);
        let found = defs.get(type_name).cloned();
        *self.type_defs.write() = defs;
        found
    }
}
