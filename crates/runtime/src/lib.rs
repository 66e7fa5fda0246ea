pub mod builder;
pub mod config;
pub mod error;
pub mod global;
pub mod ops;
pub mod progression;
pub mod registry;
pub mod snapshot;
pub mod target;
pub mod want;

pub use builder::{Builder, BuilderOptions, RunSummary};
pub use config::{load_config, load_type_defs};
pub use error::{ProgressError, RuntimeError};
pub use global::GlobalState;
pub use ops::WantOperation;
pub use registry::{NoopProgressable, WantFactory};
pub use snapshot::{load_snapshot, MemorySnapshot, WantSnapshot};
pub use target::TargetProgressable;
pub use want::{ControlCommand, Progressable, Want};
