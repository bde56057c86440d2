//! Error types for the telemetry bridge
//!
//! Every recoverable condition (queue full, broker unreachable, publish
//! failure, malformed command) is handled inside the component that owns it.
//! `BridgeError` only surfaces at the edges: startup, configuration and
//! producer calls with an oversized payload.

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for telemetry bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Queue initialization failed: {0}")]
    QueueInit(#[from] QueueError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Create payload-too-large error
    pub fn payload_too_large(len: usize, max: usize) -> Self {
        Self::PayloadTooLarge { len, max }
    }

    /// Whether the error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::QueueInit(_) | BridgeError::Config(_))
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
