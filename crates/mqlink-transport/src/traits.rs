//! Transport trait definitions
//!
//! Defines the interface every broker backend must implement. A
//! [`Connection`] owns the [`Channel`]s opened on it; once a connection
//! reports closed, none of its channels may be used again.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use mqlink_types::{DeliveryTag, InboundMessage, Result};

/// Stream of deliveries for one consumer registration. Ends when the
/// channel or connection it was registered on goes away.
pub type Deliveries = BoxStream<'static, InboundMessage>;

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// Per-publish properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl PublishOptions {
    /// Persistent delivery with the given content type
    pub fn persistent(content_type: impl Into<String>) -> Self {
        Self {
            persistent: true,
            content_type: Some(content_type.into()),
        }
    }
}

/// Consumer registration flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Broker considers a message consumed as soon as it is sent
    pub auto_ack: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    /// Manual acknowledgement, non-exclusive
    pub fn manual_ack(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            auto_ack: false,
            exclusive: false,
        }
    }
}

/// Outstanding broker confirmation for one publish
pub struct PendingConfirm {
    outcome: BoxFuture<'static, bool>,
}

impl PendingConfirm {
    /// Wrap a future resolving to `true` on ack and `false` on nack
    pub fn new(outcome: impl Future<Output = bool> + Send + 'static) -> Self {
        Self {
            outcome: outcome.boxed(),
        }
    }

    /// A confirmation that has already been decided
    pub fn settled(acked: bool) -> Self {
        Self::new(futures::future::ready(acked))
    }

    /// Wait for the broker's decision. `true` means acked.
    pub async fn wait(self) -> bool {
        self.outcome.await
    }
}

impl std::fmt::Debug for PendingConfirm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConfirm").finish_non_exhaustive()
    }
}

/// Opens connections to a broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate a connection
    async fn dial(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// An open broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel on this connection
    async fn open_channel(&self) -> Result<Box<dyn Channel>>;

    /// Close the connection and every channel on it
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A logical sub-connection used for publishing and consuming
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue (idempotent)
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Switch the channel into publisher-confirm mode
    async fn enable_confirms(&self) -> Result<()>;

    /// Publish to a queue through the default exchange
    async fn publish_confirmed(
        &self,
        queue: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<PendingConfirm>;

    /// Register a consumer on a queue
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Deliveries>;

    /// Acknowledge a single delivery
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
