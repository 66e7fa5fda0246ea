//! Periodic memory snapshots: full want serialization to YAML, skipped when
//! the content digest is unchanged since the last write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use wunsch_core::history::HistorySnapshot;
use wunsch_core::{md5_hex, Metadata, StateMap, WantConfig, WantSpec, WantStatus};

use crate::error::RuntimeError;

/// Full serialization of one want.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantSnapshot {
    pub metadata: Metadata,
    pub spec: WantSpec,
    pub status: WantStatus,
    pub state: StateMap,
    #[serde(default)]
    pub history: HistorySnapshot,
}

impl WantSnapshot {
    /// Reduce to a declarable config (used by `--restore`).
    pub fn into_config(self) -> WantConfig {
        WantConfig {
            metadata: self.metadata,
            spec: self.spec,
            state: self.state,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub execution_id: Uuid,
    pub wants: Vec<WantSnapshot>,
}

impl MemorySnapshot {
    pub fn into_configs(self) -> Vec<WantConfig> {
        self.wants.into_iter().map(WantSnapshot::into_config).collect()
    }
}

/// Write `memory-<execution_id>.yaml` plus a `memory-latest.yaml` copy.
/// Returns whether anything was written; an unchanged digest skips the
/// write entirely.
pub fn write_snapshot(
    dir: &Path,
    snapshot: &MemorySnapshot,
    last_hash: &mut Option<String>,
) -> Result<bool, RuntimeError> {
    let text = serde_yaml::to_string(snapshot)?;
    let digest = md5_hex(text.as_bytes());
    if last_hash.as_deref() == Some(digest.as_str()) {
        return Ok(false);
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("memory-{}.yaml", snapshot.execution_id));
    std::fs::write(&path, &text)?;

    let latest = dir.join("memory-latest.yaml");
    if let Err(err) = std::fs::write(&latest, &text) {
        warn!(path = %latest.display(), error = %err, "latest snapshot write failed");
    }

    *last_hash = Some(digest);
    debug!(path = %path.display(), wants = snapshot.wants.len(), "memory snapshot written");
    Ok(true)
}

pub fn load_snapshot(path: &Path) -> Result<MemorySnapshot, RuntimeError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Path of the rolling latest snapshot inside a memory directory.
pub fn latest_snapshot_path(dir: &Path) -> PathBuf {
    dir.join("memory-latest.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wunsch_core::Metadata;

    fn sample() -> MemorySnapshot {
        let mut state = StateMap::new();
        state.insert("count".into(), json!(3));
        MemorySnapshot {
            timestamp: Utc::now(),
            execution_id: Uuid::new_v4(),
            wants: vec![WantSnapshot {
                metadata: Metadata::new("a", "sequence"),
                spec: WantSpec::default(),
                status: WantStatus::Reaching,
                state,
                history: HistorySnapshot::default(),
            }],
        }
    }

    #[test]
    fn write_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample();
        let mut hash = None;
        assert!(write_snapshot(dir.path(), &snapshot, &mut hash).unwrap());

        let loaded = load_snapshot(&latest_snapshot_path(dir.path())).unwrap();
        assert_eq!(loaded.execution_id, snapshot.execution_id);
        assert_eq!(loaded.wants[0].metadata.name, "a");
        assert_eq!(loaded.wants[0].state["count"], json!(3));
    }

    #[test]
    fn unchanged_snapshot_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample();
        let mut hash = None;
        assert!(write_snapshot(dir.path(), &snapshot, &mut hash).unwrap());
        assert!(!write_snapshot(dir.path(), &snapshot, &mut hash).unwrap());
    }

    #[test]
    fn snapshot_reduces_to_configs() {
        let configs = sample().into_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].state["count"], json!(3));
    }
}
