//! Declared configuration: want sets, per-type definitions and the
//! structural diff that drives reconciliation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::StateMap;
use crate::types::{ConnectivityMetadata, Metadata, WantSpec};

pub use crate::types::RecipeRef;

/// One declared want: the unit the reconciler diffs and materializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WantConfig {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: WantSpec,
    /// Initial state, merged over the type's state defaults.
    #[serde(default)]
    pub state: StateMap,
}

impl WantConfig {
    pub fn new(metadata: Metadata, spec: WantSpec) -> Self {
        Self {
            metadata,
            spec,
            state: StateMap::new(),
        }
    }

    /// Assign a fresh id when the config omitted one.
    pub fn ensure_id(&mut self) -> Uuid {
        if self.metadata.id.is_nil() {
            self.metadata.id = Uuid::new_v4();
        }
        self.metadata.id
    }
}

/// A config file: a set of wants or a top-level recipe reference, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub wants: Vec<WantConfig>,
    #[serde(default)]
    pub recipe: Option<RecipeRef>,
}

impl Config {
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if !self.wants.is_empty() && self.recipe.is_some() {
            return Err(crate::error::CoreError::InvalidConfig(
                "config must declare either `wants` or `recipe`, not both".into(),
            ));
        }
        if self.wants.is_empty() && self.recipe.is_none() {
            return Err(crate::error::CoreError::InvalidConfig(
                "config declares neither `wants` nor `recipe`".into(),
            ));
        }
        Ok(())
    }
}

/// Per-type definition loaded from the types directory: state defaults,
/// connectivity bounds and default capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantTypeDef {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub connect: ConnectivityMetadata,
    #[serde(default)]
    pub final_result_field: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Classification of one want between two config generations.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added(WantConfig),
    Updated { old: WantConfig, new: WantConfig },
    Deleted(WantConfig),
}

/// Structural equality on the fields that matter for reconciliation:
/// params, using selectors, when-clause, owner references and labels.
pub fn structurally_equal(a: &WantConfig, b: &WantConfig) -> bool {
    a.spec.params == b.spec.params
        && a.spec.using == b.spec.using
        && a.spec.when == b.spec.when
        && a.metadata.owner_references == b.metadata.owner_references
        && a.metadata.labels == b.metadata.labels
}

/// Diff two config generations by want id.
pub fn detect_config_changes(old: &[WantConfig], new: &[WantConfig]) -> Vec<ChangeEvent> {
    let old_by_id: std::collections::HashMap<Uuid, &WantConfig> =
        old.iter().map(|w| (w.metadata.id, w)).collect();
    let new_ids: std::collections::HashSet<Uuid> =
        new.iter().map(|w| w.metadata.id).collect();

    let mut events = Vec::new();
    for want in new {
        match old_by_id.get(&want.metadata.id) {
            None => events.push(ChangeEvent::Added(want.clone())),
            Some(prev) if !structurally_equal(prev, want) => events.push(ChangeEvent::Updated {
                old: (*prev).clone(),
                new: want.clone(),
            }),
            Some(_) => {}
        }
    }
    for want in old {
        if !new_ids.contains(&want.metadata.id) {
            events.push(ChangeEvent::Deleted(want.clone()));
        }
    }
    events
}
