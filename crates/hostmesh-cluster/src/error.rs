//! Cluster error types

use hostmesh_core::types::HostId;
use hostmesh_crypto::CryptoError;
use hostmesh_messaging::WireError;
use thiserror::Error;

use crate::coordinator::CoordinateError;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Host not found: {0}")]
    HostNotFound(HostId),

    #[error("Duplicate host id admitted: {0}")]
    DuplicateHost(HostId),

    #[error("Mailbox already registered for {0}")]
    DuplicateMailbox(String),

    #[error("No mailbox id generated for {0}")]
    UnknownMailbox(String),

    #[error("Join rejected: {reason}")]
    JoinRejected { reason: String, may_retry: bool },

    #[error("Join timed out: {0}")]
    JoinTimeout(String),

    #[error("No coordinator reachable: {0}")]
    CoordinatorUnreachable(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Clock skew of {skew_ms} ms exceeds maximum {max_ms} ms")]
    ClockSkew { skew_ms: i64, max_ms: i64 },

    #[error("Expected leader host id 0, got {0}")]
    LeaderHostId(HostId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Host messenger is shutting down")]
    ShuttingDown,

    #[error("Host messenger has not joined a mesh yet")]
    NotStarted,

    #[error("Coordinate store error: {0}")]
    Coordinate(#[from] CoordinateError),

    #[error(transparent)]
    Core(#[from] hostmesh_core::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Whether this error must end the local process
    pub fn is_fatal(&self) -> bool {
        match self {
            ClusterError::JoinRejected { may_retry, .. } => !may_retry,
            ClusterError::ClockSkew { .. }
            | ClusterError::DuplicateHost(_)
            | ClusterError::LeaderHostId(_)
            | ClusterError::Coordinate(_) => true,
            ClusterError::Core(e) => e.is_fatal(),
            ClusterError::Wire(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ClusterError::JoinRejected {
            reason: "bad version".into(),
            may_retry: false
        }
        .is_fatal());
        assert!(!ClusterError::JoinRejected {
            reason: "paused".into(),
            may_retry: true
        }
        .is_fatal());
        assert!(ClusterError::ClockSkew {
            skew_ms: 500,
            max_ms: 200
        }
        .is_fatal());
        assert!(ClusterError::Wire(WireError::UnknownType(99)).is_fatal());
        assert!(!ClusterError::HostNotFound(3).is_fatal());
    }
}
