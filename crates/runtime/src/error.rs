use thiserror::Error;

/// Errors surfaced by the reconciler and its public operations API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config error: {0}")]
    Config(#[from] wunsch_core::CoreError),

    #[error("recipe error: {0}")]
    Recipe(#[from] wunsch_recipe::RecipeError),

    #[error("bus error: {0}")]
    Bus(#[from] wunsch_bus::BusError),

    #[error("duplicate want name: {0}")]
    DuplicateName(String),

    #[error("no want with id {0}")]
    UnknownWant(uuid::Uuid),

    #[error("no want named {0}")]
    UnknownWantName(String),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// Outcome taxonomy of one `progress` call, mapped onto want status by the
/// progression loop:
/// - `Config` is recoverable: the want parks in `configError` until its
///   spec changes or it is restarted;
/// - `Module` is an implementation bug and terminal for the want;
/// - `Failed` is an explicit terminal failure set by the want type.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("config error: {0}")]
    Config(String),

    #[error("module error: {0}")]
    Module(String),

    #[error("failed: {0}")]
    Failed(String),
}
