use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("No publishable file found")]
    Detection,

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Build timed out after {0} seconds")]
    BuildTimeout(u64),

    #[error("Build produced no output: {0}")]
    MissingOutput(String),

    #[error("Materialization failed: {0}")]
    Materialization(String),

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
