//! Error types for the failover control plane.

use thiserror::Error;

/// Errors produced by the failover daemon.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration validation failures (fail fast at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient cloud fabric failures (log and skip, never change role)
    #[error("Cloud fabric error: {0}")]
    Fabric(#[from] crate::fabric::FabricError),

    /// Authoritative takeover failures (claiming the floating identity)
    #[error("Takeover failed: {0}")]
    Takeover(String),

    /// Replication transport failures (log and retry next interval)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Application-level RPC failures reported by the peer
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Local data plane failures (log and retry next interval)
    #[error("Data plane error: {0}")]
    DataPlane(String),

    /// Wire protocol framing and codec failures
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::wire::FrameError),

    /// Impossible state combinations
    #[error("Internal error: {0}")]
    Internal(String),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors (data-plane payloads)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding errors (wire messages)
    #[error("Binary encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        Self::Configuration(message.to_string())
    }

    /// Create a new takeover error
    pub fn takeover<T: std::fmt::Display>(message: T) -> Self {
        Self::Takeover(message.to_string())
    }

    /// Create a new transport error
    pub fn transport<T: std::fmt::Display>(message: T) -> Self {
        Self::Transport(message.to_string())
    }

    /// Create a new RPC error
    pub fn rpc<T: std::fmt::Display>(message: T) -> Self {
        Self::Rpc(message.to_string())
    }

    /// Create a new data plane error
    pub fn data_plane<T: std::fmt::Display>(message: T) -> Self {
        Self::DataPlane(message.to_string())
    }

    /// Check if this error indicates a temporary condition that may be retried
    /// on the next tick without any role change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fabric(_)
                | Self::Transport(_)
                | Self::Rpc(_)
                | Self::DataPlane(_)
                | Self::Io(_)
        )
    }
}

/// A specialized `Result` type for failover operations
pub type Result<T> = std::result::Result<T, Error>;
