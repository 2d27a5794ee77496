//! Error types for HostMesh

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(String),

    // Addressing Errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Version Errors
    #[error("Invalid version compatibility pattern: {0}")]
    InvalidVersionPattern(String),

    #[error("Incompatible versions: local {local}, remote {remote}")]
    IncompatibleVersion { local: String, remote: String },

    #[error("Too many active versions ({}), at most {cap} allowed", .versions.join(", "))]
    TooManyVersions { versions: Vec<String>, cap: usize },

    // Internal Errors
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error must end the local process when it surfaces during
    /// mesh establishment
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleVersion { .. } | Error::TooManyVersions { .. }
        )
    }
}
