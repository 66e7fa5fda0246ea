use thiserror::Error;

/// Errors raised by the agent lifecycle layer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capability file error: {0}")]
    CapabilityParse(#[from] serde_yaml::Error),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error("agent execution cancelled")]
    Cancelled,
}
