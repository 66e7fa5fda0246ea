//! Declarative data model for wants: metadata, spec, status and topology.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::StateMap;

/// Label maps are kept sorted so topic derivation and hashing are
/// deterministic without an extra normalization step.
pub type LabelMap = BTreeMap<String, String>;

/// A `using` entry: every key/value pair must be present on a provider's
/// labels for the selector to match.
pub type LabelSelector = BTreeMap<String, String>;

/// Reference from a child want to the want that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub id: Uuid,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    /// Controller reference as injected onto recipe children.
    pub fn controller(name: impl Into<String>, id: Uuid) -> Self {
        Self {
            kind: "Want".to_string(),
            name: name.into(),
            id,
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Derived coupling between two wants, recomputed on every reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationRef {
    pub peer_want_id: Uuid,
    /// The shared coupling keys (`k=v` labels, `stateAccess/<path>` fields).
    pub labels: LabelMap,
    pub rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Unique and immutable once assigned. Configs may omit it; the builder
    /// assigns one on add.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub labels: LabelMap,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_system_want: bool,
    #[serde(default)]
    pub order_key: Option<String>,
    #[serde(default)]
    pub correlation: Vec<CorrelationRef>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            type_name: type_name.into(),
            labels: LabelMap::new(),
            owner_references: Vec::new(),
            updated_at: Utc::now(),
            is_system_want: false,
            order_key: None,
            correlation: Vec::new(),
        }
    }

    /// The owner reference marked as controller, if any. At most one
    /// reference may carry `controller == true`.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Reference to a recipe file, optionally overriding parameter defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeRef {
    pub path: String,
    #[serde(default)]
    pub params: StateMap,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantSpec {
    #[serde(default)]
    pub params: StateMap,
    /// Provider selectors. Any want whose labels satisfy one of these
    /// becomes an input of this want.
    #[serde(default)]
    pub using: Vec<LabelSelector>,
    /// Capability names resolved against the agent registry.
    #[serde(default)]
    pub requires: Vec<String>,
    /// State field paths this want observes (`<want-name>/<field>`).
    #[serde(default)]
    pub state_subscriptions: Vec<String>,
    #[serde(default)]
    pub notification_filters: Vec<String>,
    #[serde(default)]
    pub when: Option<serde_json::Value>,
    #[serde(default)]
    pub recipe: Option<RecipeRef>,
    /// State field copied into `final_result` on achievement.
    #[serde(default)]
    pub final_result_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum WantStatus {
    #[default]
    Idle,
    Initializing,
    Reaching,
    Suspended,
    Achieved,
    Failed,
    Terminated,
    Deleting,
    ConfigError,
    ModuleError,
    PrepareAgent,
    WaitingUserAction,
}

impl WantStatus {
    /// Terminal statuses never leave on their own; only a restart or config
    /// update can move a want out of them (and only from `ConfigError`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WantStatus::Achieved
                | WantStatus::Failed
                | WantStatus::Terminated
                | WantStatus::ModuleError
        )
    }
}

impl std::fmt::Display for WantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WantStatus::Idle => "idle",
            WantStatus::Initializing => "initializing",
            WantStatus::Reaching => "reaching",
            WantStatus::Suspended => "suspended",
            WantStatus::Achieved => "achieved",
            WantStatus::Failed => "failed",
            WantStatus::Terminated => "terminated",
            WantStatus::Deleting => "deleting",
            WantStatus::ConfigError => "configError",
            WantStatus::ModuleError => "moduleError",
            WantStatus::PrepareAgent => "prepareAgent",
            WantStatus::WaitingUserAction => "waitingUserAction",
        };
        f.write_str(s)
    }
}

/// Connectivity bounds for a want type. `-1` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityMetadata {
    #[serde(default)]
    pub required_inputs: i32,
    #[serde(default = "unbounded")]
    pub max_inputs: i32,
    #[serde(default)]
    pub required_outputs: i32,
    #[serde(default = "unbounded")]
    pub max_outputs: i32,
}

pub const UNBOUNDED: i32 = -1;

fn unbounded() -> i32 {
    UNBOUNDED
}

impl Default for ConnectivityMetadata {
    fn default() -> Self {
        Self {
            required_inputs: 0,
            max_inputs: UNBOUNDED,
            required_outputs: 0,
            max_outputs: UNBOUNDED,
        }
    }
}

impl ConnectivityMetadata {
    /// Whether the given in/out path counts satisfy the required bounds.
    pub fn satisfied_by(&self, inputs: usize, outputs: usize) -> bool {
        if (inputs as i32) < self.required_inputs {
            return false;
        }
        if (outputs as i32) < self.required_outputs {
            return false;
        }
        if self.max_inputs != UNBOUNDED && (inputs as i32) > self.max_inputs {
            return false;
        }
        if self.max_outputs != UNBOUNDED && (outputs as i32) > self.max_outputs {
            return false;
        }
        true
    }
}

/// One resolved connection on a want: the pub/sub topic it rides on and the
/// peer want it connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    /// Pub/sub topic (serialized provider labels).
    pub channel: String,
    /// Peer want name; used for de-duplication.
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paths {
    #[serde(default)]
    pub in_paths: Vec<PathInfo>,
    #[serde(default)]
    pub out_paths: Vec<PathInfo>,
}

/// True when every key/value of `selector` appears on `labels`.
pub fn labels_match(selector: &LabelSelector, labels: &LabelMap) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| labels.get(k).map(|lv| lv == v).unwrap_or(false))
}
