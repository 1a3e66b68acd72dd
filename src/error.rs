use crate::protocol as proto;

/// Errors surfaced by the operations a host calls explicitly
/// (persisting, loading and applying configuration).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// The key-value store could not be read or written.
    #[error("Store error for key '{key}': {source}")]
    Store {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be encoded or decoded.
    #[error("Cannot (de)serialize record: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A configuration update could not be parsed.
    #[error("Invalid configuration update: {0}")]
    Json(#[from] serde_json::Error),
}

/// The result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
