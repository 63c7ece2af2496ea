//! Error types for the VIRTA broker

use thiserror::Error;

// Re-export the codec error from virta-core.
pub use virta_core::EventError;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Main error type for the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Configuration parse or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend could not be initialized (connection, auth, bad arguments).
    /// Fatal: the orchestrator exits on this.
    #[error("backend initialization error: {0}")]
    BackendInit(String),

    /// Transient transport failure against the backend store
    #[error("backend transport error: {0}")]
    Transport(String),

    /// Produce was attempted while the backend is draining
    #[error("rejecting events due to backend closing")]
    Closing,

    /// The in-memory buffer did not accept the event in time
    #[error("failed to add the event to the buffer after {timeout:?}")]
    BufferFull { timeout: std::time::Duration },

    /// A subscription with this name already exists
    #[error("subscription for {0:?} already exists")]
    DuplicateSubscription(String),

    /// Subscription bounds could not be resolved
    #[error("subscription bounds could not be resolved: {0}")]
    Bounds(String),

    /// CloudEvent could not be (de)serialized at a backend boundary
    #[error("serialization error: {0}")]
    Serialization(#[from] EventError),

    /// Status store write failure
    #[error("status write error: {0}")]
    Status(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
