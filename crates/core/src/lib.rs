pub mod config;
pub mod error;
pub mod hash;
pub mod history;
pub mod ring;
pub mod state;
pub mod types;

pub use config::{
    detect_config_changes, structurally_equal, ChangeEvent, Config, WantConfig, WantTypeDef,
};
pub use error::CoreError;
pub use hash::{md5_hex, sha256_hex, want_hash};
pub use history::{
    AgentHistoryEntry, AgentRunStatus, LogHistoryEntry, ParameterHistoryEntry, StateHistoryEntry,
    WantHistory,
};
pub use ring::RingBuffer;
pub use state::{deep_merge_value, is_internal_key, is_zero_value, merge_into, StateMap};
pub use types::{
    labels_match, ConnectivityMetadata, CorrelationRef, LabelMap, LabelSelector, Metadata,
    OwnerReference, PathInfo, Paths, RecipeRef, WantSpec, WantStatus, UNBOUNDED,
};
