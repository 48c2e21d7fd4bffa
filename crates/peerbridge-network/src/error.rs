//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame failed header validation
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Payload would exceed the maximum UDP datagram
    #[error("Message too large: {size} bytes (max payload {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Operation requires a running transport
    #[error("Transport not running")]
    NotRunning,

    /// A peer connection already exists
    #[error("Already connected to a peer")]
    AlreadyConnected,

    /// STUN discovery failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// Signaling channel failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// TUN device error
    #[error("TUN device error: {0}")]
    TunError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
