//! Error types for mqlink
//!
//! Transports report every broker fault through this type. The producer and
//! consumer loops absorb these errors and retry; none reach the application.

use thiserror::Error;

/// Main error type for mqlink operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Opening the transport connection failed
    #[error("Failed to dial broker: {0}")]
    Dial(String),

    /// Opening a channel on a live connection failed
    #[error("Failed to open channel: {0}")]
    ChannelOpen(String),

    /// Declaring the target queue failed
    #[error("Failed to declare queue {queue}: {reason}")]
    QueueDeclare { queue: String, reason: String },

    /// Switching the channel into publisher-confirm mode failed
    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmMode(String),

    /// The publish call itself failed (not a nack)
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Registering a consumer on a queue failed
    #[error("Failed to register consumer on {queue}: {reason}")]
    Consume { queue: String, reason: String },

    /// Acknowledging a delivery failed
    #[error("Ack failed: {0}")]
    Ack(String),

    /// Closing a channel or connection failed
    #[error("Close failed: {0}")]
    Close(String),

    /// The channel or its connection is already closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// The queue has not been declared on the broker
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for mqlink operations
pub type Result<T> = std::result::Result<T, Error>;
