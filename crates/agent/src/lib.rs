pub mod agent;
pub mod capability;
pub mod driver;
pub mod error;
pub mod executor;
pub mod registry;

pub use agent::{Agent, AgentHost, AgentKind, ValidatedHost};
pub use capability::{load_capabilities_dir, AccessType, Capability, StateAccess};
pub use driver::{background_key, default_interval, spawn_background, BackgroundAgent};
pub use error::AgentError;
pub use executor::DoExecutor;
pub use registry::{AgentRegistry, AgentSpec};
