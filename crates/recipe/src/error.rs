use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("I/O error reading recipe: {0}")]
    Io(#[from] std::io::Error),

    #[error("recipe parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown recipe parameter: {0}")]
    UnknownParameter(String),

    #[error("recipe produces no wants")]
    Empty,
}
