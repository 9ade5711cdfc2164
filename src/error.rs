//! Top-level error types for the bridge.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Queue substrate errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job {id}: {reason}")]
    InvalidJob { id: String, reason: String },
}

/// Agent subprocess errors. The `Failed` message is what ends up in the
/// dead-letter record and the in-thread failure notice.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn Claude CLI at {path}: {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}
