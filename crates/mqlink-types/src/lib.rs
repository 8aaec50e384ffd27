//! mqlink Types - Shared domain types for the producer/consumer client
//!
//! This crate contains the types passed between the transport layer and
//! the delivery/consume loops.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;

// Re-export commonly used types
pub use config::{BackoffSchedule, ClientConfig, ExhaustionPolicy};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use message::{DeliveryTag, InboundMessage, MessageId, PendingMessage};
