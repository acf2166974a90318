use std::time::Duration;

use thiserror::Error;

use crate::event_bus::broker::BrokerError;

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {timeout:?} waiting for event '{kind}'")]
    Timeout { kind: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, EventBusError>;

impl EventBusError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EventBusError::Configuration(message.into())
    }

    pub fn invalid_event(message: impl Into<String>) -> Self {
        EventBusError::InvalidEvent(message.into())
    }

    /// Programmer errors are thrown to the caller; everything else degrades.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            EventBusError::Configuration(_) | EventBusError::InvalidEvent(_)
        )
    }
}
