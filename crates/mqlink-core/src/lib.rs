//! mqlink Core - Reliable producer and consumer loops
//!
//! This crate contains:
//! - ConnectionFactory: connect-until-success with a cyclic backoff
//! - Producer: backlog plus a confirmed-publish delivery loop
//! - Consumer: receive loop with manual acknowledgement and reconnect
//!
//! Delivery is at-least-once; idempotency is left to the application.

pub mod backoff;
pub mod connection;
pub mod consumer;
pub mod handler;
pub mod producer;

// Re-exports
pub use backoff::Backoff;
pub use connection::{ConnectionFactory, Session};
pub use consumer::Consumer;
pub use handler::Handler;
pub use producer::Producer;
pub use tokio_util::sync::CancellationToken;
