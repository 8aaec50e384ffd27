//! mqlink Transport - Broker collaborator interfaces
//!
//! The producer and consumer loops only talk to a broker through the
//! traits in [`traits`]. Backends:
//! - In-memory broker (default, for development/testing)
//! - RabbitMQ over AMQP 0-9-1 (`amqp` feature)

pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

// Re-exports
pub use traits::{
    Channel, Connection, ConsumeOptions, Deliveries, PendingConfirm, PublishOptions, QueueOptions,
    Transport,
};

#[cfg(feature = "memory")]
pub use memory::{BrokerStats, Fault, MemoryBroker};

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
