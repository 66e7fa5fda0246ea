//! The built-in parent want type.
//!
//! A target expands its recipe into child wants on the first progress call,
//! then aggregates child completion: it recomputes `achieving_percentage`
//! as children achieve, emits exactly one completion packet upstream, and
//! assembles the final result from the recipe's result specs.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wunsch_core::{state as state_keys, OwnerReference, StateMap};
use wunsch_recipe::ResultSpec;

use crate::builder::BuilderCore;
use crate::error::ProgressError;
use crate::ops::{QueuedOperation, WantOperation};
use crate::registry::WantFactory;
use crate::want::{Progressable, Want};

/// Label injected onto every recipe child.
pub const OWNER_LABEL: &str = "owner";
pub const OWNER_NAME_LABEL: &str = "owner-name";
/// State flag guarding the single upstream completion packet.
const COMPLETION_SENT: &str = "completion_packet_sent";

/// How long a woken aggregation pass keeps collecting before recomputing,
/// so bursts of child updates coalesce into one pass.
const PIGGYBACK_WINDOW: std::time::Duration = std::time::Duration::from_millis(100);
/// Upper bound on one blocking wait for child activity.
const WAIT_SLICE: std::time::Duration = std::time::Duration::from_millis(200);

pub struct TargetFactory;

impl WantFactory for TargetFactory {
    fn create(&self, _config: &wunsch_core::WantConfig) -> Arc<dyn Progressable> {
        Arc::new(TargetProgressable::new())
    }
}

#[derive(Default)]
struct TargetInner {
    spawned: bool,
    children: Vec<String>,
    result_specs: Vec<ResultSpec>,
}

pub struct TargetProgressable {
    inner: Mutex<TargetInner>,
}

impl TargetProgressable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TargetInner::default()),
        }
    }

    /// Phase 1: expand the recipe and submit children asynchronously.
    async fn spawn_children(&self, want: &Arc<Want>) -> Result<(), ProgressError> {
        let spec = want.spec();
        let Some(recipe_ref) = spec.recipe else {
            return Err(ProgressError::Config(
                "target wants require spec.recipe".into(),
            ));
        };

        let recipe = wunsch_recipe::load_recipe(Path::new(&recipe_ref.path))
            .map_err(|e| ProgressError::Config(e.to_string()))?;

        // recipe-ref params first, then the target's own matching params win
        let mut overrides = recipe_ref.params.clone();
        for (k, v) in &spec.params {
            if recipe.parameters.contains_key(k) {
                overrides.insert(k.clone(), v.clone());
            }
        }

        let instantiated = wunsch_recipe::instantiate(&recipe, &overrides)
            .map_err(|e| ProgressError::Config(e.to_string()))?;

        let owner_name_value = format!("{}-{}", want.name(), want.id());
        let mut children = instantiated.wants;
        for child in &mut children {
            child.metadata.id = Uuid::new_v4();
            child.metadata.owner_references =
                vec![OwnerReference::controller(want.name(), want.id())];
            child
                .metadata
                .labels
                .insert(OWNER_LABEL.into(), "child".into());
            child
                .metadata
                .labels
                .insert(OWNER_NAME_LABEL.into(), owner_name_value.clone());
            // scope sibling selectors to this instance
            for selector in &mut child.spec.using {
                selector.insert(OWNER_NAME_LABEL.into(), owner_name_value.clone());
            }
        }

        let names: Vec<String> = children
            .iter()
            .map(|c| c.metadata.name.clone())
            .collect();
        info!(target = %want.name(), children = names.len(), "spawning recipe children");

        let core = want
            .runtime_core()
            .ok_or_else(|| ProgressError::Module("target has no runtime".into()))?;
        core.enqueue(QueuedOperation::fire_and_forget(WantOperation::Add(
            children,
        )))
        .await;

        want.store_state("children_count", json!(names.len()));
        want.store_state(state_keys::ACHIEVING_PERCENTAGE, json!(0));

        let mut inner = self.inner.lock();
        inner.spawned = true;
        inner.children = names;
        inner.result_specs = instantiated.result;
        Ok(())
    }

    /// Phase 2: block on child activity, then recompute aggregation.
    async fn aggregate(&self, want: &Arc<Want>) -> Result<(), ProgressError> {
        let (children, result_specs) = {
            let inner = self.inner.lock();
            (inner.children.clone(), inner.result_specs.clone())
        };
        if children.is_empty() {
            return Err(ProgressError::Config("recipe produced no children".into()));
        }

        // wake on child state merges and completions; bounded so control
        // signals stay responsive
        tokio::select! {
            _ = want.notify.notified() => {
                tokio::time::sleep(PIGGYBACK_WINDOW).await;
            }
            _ = tokio::time::sleep(WAIT_SLICE) => {}
        }

        let completed = want.completed_children();
        let achieved = children
            .iter()
            .filter(|name| completed.contains(*name))
            .count();
        let percentage = (achieved * 100) / children.len();
        want.store_state(state_keys::ACHIEVING_PERCENTAGE, json!(percentage));
        debug!(target = %want.name(), achieved, total = children.len(), percentage, "aggregation pass");

        if achieved == children.len()
            && want.get_state(COMPLETION_SENT) != Some(json!(true))
        {
            let _ = want
                .provide(json!({
                    "completed": true,
                    "source": want.name(),
                    "children": children.len(),
                }))
                .await;
            let _ = want.provide_done().await;
            want.store_state(COMPLETION_SENT, json!(true));
            self.compute_result(want, &children, &result_specs).await;
        }
        Ok(())
    }

    /// Assemble the final result: recipe result specs when present, summed
    /// numeric child results otherwise.
    async fn compute_result(
        &self,
        want: &Arc<Want>,
        children: &[String],
        result_specs: &[ResultSpec],
    ) {
        let Some(core) = want.runtime_core() else {
            return;
        };

        if !result_specs.is_empty() {
            for (i, spec) in result_specs.iter().enumerate() {
                let Some(field) = spec.field() else {
                    continue;
                };
                let Some(child) = core.want_by_name(&spec.want_name).await else {
                    warn!(target = %want.name(), child = %spec.want_name, "result spec names unknown child");
                    continue;
                };
                let Some(value) = child.get_state(field) else {
                    warn!(target = %want.name(), child = %spec.want_name, field, "result field missing on child");
                    continue;
                };
                want.store_state(&format!("{}_{}", spec.want_name, field), value.clone());
                if i == 0 {
                    want.store_state("result", value);
                }
            }
            return;
        }

        // fallback: sum whatever numeric final results the children produced
        let mut sum = 0.0;
        let mut counted = 0;
        for name in children {
            let Some(child) = core.want_by_name(name).await else {
                continue;
            };
            if let Some(v) = child
                .get_state(state_keys::FINAL_RESULT)
                .and_then(|v| v.as_f64())
            {
                sum += v;
                counted += 1;
            }
        }
        if counted > 0 {
            want.store_state("result", json!(sum));
        }
    }
}

impl Default for TargetProgressable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Progressable for TargetProgressable {
    fn is_achieved(&self, want: &Arc<Want>) -> bool {
        let inner = self.inner.lock();
        if !inner.spawned || inner.children.is_empty() {
            return false;
        }
        let completed = want.completed_children();
        inner
            .children
            .iter()
            .all(|name| completed.contains(name))
            && want.get_state(COMPLETION_SENT) == Some(json!(true))
    }

    async fn progress(&self, want: &Arc<Want>) -> Result<(), ProgressError> {
        let spawned = self.inner.lock().spawned;
        if !spawned {
            self.spawn_children(want).await
        } else {
            self.aggregate(want).await
        }
    }

    async fn on_delete(&self, want: &Arc<Want>) {
        debug!(target = %want.name(), "target deleted");
    }
}

/// Push a parameter change down to the children that understand it.
/// A child accepts the parent's name verbatim, or the `primary_`-stripped
/// form when it declares that parameter.
pub(crate) async fn propagate_parameter(
    core: &Arc<BuilderCore>,
    target: &Arc<Want>,
    param: &str,
    value: Value,
) {
    target.update_param(param, value.clone());

    for child in core.wants_owned_by(target.id()) {
        let child_params: StateMap = child.spec().params;
        let mapped = if child_params.contains_key(param) {
            Some(param.to_string())
        } else {
            param
                .strip_prefix("primary_")
                .filter(|rest| child_params.contains_key(*rest))
                .map(str::to_string)
        };
        if let Some(child_param) = mapped {
            debug!(target = %target.name(), child = %child.name(), param = %child_param, "parameter propagated");
            child.update_param(&child_param, value.clone());
        }
    }
}
