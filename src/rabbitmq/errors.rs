// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker unreachable or connection closed. Recovered by the reconnect loop.
    #[error("Broker connection error: {0}")]
    ConnectionError(String),

    #[error("Broker channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    /// Transient send failure. Recovered through the retry queue.
    #[error("Broker publish error: {0}")]
    PublishError(String),

    #[error("Broker consume error: {0}")]
    ConsumeError(String),

    #[error("Broker acknowledge error: {0}")]
    AckError(String),

    /// Caller processing failed for a released batch.
    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Retry queue full ({capacity} envelopes), evicted oldest")]
    QueueOverflow { capacity: usize },

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Errors that mean the connection itself is gone, as opposed to a
    /// single operation failing on a healthy connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionError(_)
                | BrokerError::ChannelError(_)
                | BrokerError::TimeoutError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            BrokerError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            BrokerError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            BrokerError::PublishError(error_text)
        } else if lowered.contains("consume") {
            BrokerError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            BrokerError::AckError(error_text)
        } else {
            BrokerError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_: Elapsed) -> Self {
        BrokerError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<std::num::ParseIntError> for BrokerError {
    fn from(err: std::num::ParseIntError) -> Self {
        BrokerError::Configuration(format!("Parse error: {}", err))
    }
}

impl From<std::num::ParseFloatError> for BrokerError {
    fn from(err: std::num::ParseFloatError) -> Self {
        BrokerError::Configuration(format!("Parse error: {}", err))
    }
}

impl From<anyhow::Error> for BrokerError {
    fn from(error: anyhow::Error) -> Self {
        BrokerError::HandlerError(format!("{:#}", error))
    }
}
