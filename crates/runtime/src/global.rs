//! Process-wide key/value state with YAML persistence.
//!
//! Used as the fallback for parent-state access on wants without an owner,
//! and for cross-want shared values. Every write persists, guarded by an
//! MD5 digest so unchanged content never touches the disk.

use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use wunsch_core::{md5_hex, merge_into, StateMap};

pub struct GlobalState {
    state: RwLock<StateMap>,
    path: Mutex<Option<PathBuf>>,
    last_hash: Mutex<Option<String>>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StateMap::new()),
            path: Mutex::new(None),
            last_hash: Mutex::new(None),
        }
    }

    /// Attach a backing file; existing content is loaded immediately.
    pub fn with_file(path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<StateMap>(&text) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable global state file, starting empty");
                    StateMap::new()
                }
            },
            Err(_) => StateMap::new(),
        };
        Self {
            state: RwLock::new(state),
            path: Mutex::new(Some(path)),
            last_hash: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    pub fn get_all(&self) -> StateMap {
        self.state.read().clone()
    }

    pub fn store(&self, key: &str, value: Value) {
        self.state.write().insert(key.to_string(), value);
        self.persist();
    }

    /// Deep-merge on mapping values, overwrite otherwise.
    pub fn merge(&self, updates: StateMap) {
        merge_into(&mut self.state.write(), updates);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = self.path.lock().clone() else {
            return;
        };
        let snapshot = self.state.read().clone();
        let text = match serde_yaml::to_string(&snapshot) {
            Ok(t) => t,
            Err(err) => {
                warn!(error = %err, "global state serialization failed");
                return;
            }
        };
        let digest = md5_hex(text.as_bytes());
        {
            let mut last = self.last_hash.lock();
            if last.as_deref() == Some(digest.as_str()) {
                return;
            }
            *last = Some(digest);
        }
        if let Err(err) = std::fs::write(&path, text) {
            warn!(path = %path.display(), error = %err, "global state write failed");
        } else {
            debug!(path = %path.display(), "global state persisted");
        }
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}
