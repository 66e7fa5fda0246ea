//! Capability definitions loaded from external YAML files.
//!
//! A capability names a behavior, the tags it `gives`, and the state fields
//! agents providing it are allowed to touch (on the want itself and on its
//! parent).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessType {
    Read,
    Update,
    ReadUpdate,
}

impl AccessType {
    pub fn allows_write(self) -> bool {
        matches!(self, AccessType::Update | AccessType::ReadUpdate)
    }
}

/// One state field a capability grants access to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateAccess {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub description: String,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub gives: Vec<String>,
    #[serde(default)]
    pub state_access: Vec<StateAccess>,
    #[serde(default)]
    pub parent_state_access: Vec<StateAccess>,
}

/// Capability file shape: one or more capabilities per document.
#[derive(Debug, Deserialize)]
struct CapabilityFile {
    #[serde(default)]
    capabilities: Vec<Capability>,
}

/// Walk a directory for `*.yaml` capability files. Unparseable files are
/// logged and skipped so one bad file never takes down registration.
pub fn load_capabilities_dir(dir: &Path) -> Result<Vec<Capability>, AgentError> {
    let mut out: HashMap<String, Capability> = HashMap::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            continue;
        }
        let text = std::fs::read_to_string(path)?;
        match serde_yaml::from_str::<CapabilityFile>(&text) {
            Ok(file) => {
                for cap in file.capabilities {
                    debug!(capability = %cap.name, file = %path.display(), "loaded capability");
                    out.insert(cap.name.clone(), cap);
                }
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping unparseable capability file");
            }
        }
    }
    Ok(out.into_values().collect())
}
