//! In-memory broker backend
//!
//! A single-process stand-in for a real broker, for development and
//! testing. Queues, unacked deliveries and publish history live in memory.
//! Faults can be injected per operation so reconnect and retry paths can
//! be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use mqlink_types::{DeliveryTag, Error, InboundMessage, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::traits::{
    Channel, Connection, ConsumeOptions, Deliveries, PendingConfirm, PublishOptions, QueueOptions,
    Transport,
};

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `Transport::dial` returns an error
    Dial,
    /// `Connection::open_channel` returns an error
    ChannelOpen,
    /// `Channel::declare_queue` returns an error
    Declare,
    /// `Channel::enable_confirms` returns an error
    ConfirmMode,
    /// `Channel::publish_confirmed` returns an error
    Publish,
    /// The publish succeeds but the broker nacks it
    Nack,
    /// `Channel::consume` returns an error
    Consume,
}

/// Counters of broker operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub dials: u64,
    pub channels_opened: u64,
    pub publish_attempts: u64,
    pub nacks: u64,
    pub acks: u64,
    pub consumers_registered: u64,
}

/// A delivery sent to a consumer and not yet acknowledged
struct Unacked {
    payload: Bytes,
    /// Closed token of the channel the delivery went out on
    channel: CancellationToken,
}

/// Internal queue data structure
struct QueueData {
    options: QueueOptions,
    /// Messages waiting for a consumer, with their redelivered flag
    ready: VecDeque<(Bytes, bool)>,
    /// Delivered, awaiting ack
    unacked: HashMap<DeliveryTag, Unacked>,
    /// Every confirmed publish, in order
    published: Vec<Bytes>,
    /// Every acknowledged delivery tag, in order
    acked: Vec<DeliveryTag>,
    notify: Arc<Notify>,
}

impl QueueData {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            published: Vec::new(),
            acked: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

struct BrokerState {
    /// Queues stored by name
    queues: DashMap<String, QueueData>,
    /// Remaining injected failures per operation
    faults: Mutex<HashMap<Fault, u32>>,
    /// Closed tokens of every connection handed out
    connections: Mutex<Vec<CancellationToken>>,
    stats: Mutex<BrokerStats>,
    next_tag: AtomicU64,
}

/// In-memory broker; clones share the same state
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create a new, empty broker
    pub fn new() -> Self {
        info!("Initializing in-memory broker");
        Self {
            state: Arc::new(BrokerState {
                queues: DashMap::new(),
                faults: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                stats: Mutex::new(BrokerStats::default()),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    // ==================== Fault Injection ====================

    /// Make the next `times` calls of an operation fail
    pub fn inject(&self, fault: Fault, times: u32) {
        *self.state.faults.lock().entry(fault).or_insert(0) += times;
    }

    /// Close every open connection from the broker side
    pub fn sever_connections(&self) {
        let connections = std::mem::take(&mut *self.state.connections.lock());
        info!(count = connections.len(), "Severing all connections");
        for token in connections {
            token.cancel();
        }
        self.requeue_orphans();
    }

    fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.state.faults.lock();
        match faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    // ==================== Inspection ====================

    /// Operation counters so far
    pub fn stats(&self) -> BrokerStats {
        *self.state.stats.lock()
    }

    /// Connections handed out and not yet closed by either side
    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|token| !token.is_cancelled())
            .count()
    }

    /// Whether a queue has been declared
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Options the queue was first declared with
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state.queues.get(name).map(|q| q.options)
    }

    /// Every confirmed publish to a queue, in broker order
    pub fn published(&self, name: &str) -> Vec<Bytes> {
        self.state
            .queues
            .get(name)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    /// Every acknowledged delivery tag on a queue, in ack order
    pub fn acked(&self, name: &str) -> Vec<DeliveryTag> {
        self.state
            .queues
            .get(name)
            .map(|q| q.acked.clone())
            .unwrap_or_default()
    }

    /// Messages waiting for a consumer
    pub fn ready_count(&self, name: &str) -> usize {
        self.state.queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged
    pub fn unacked_count(&self, name: &str) -> usize {
        self.state.queues.get(name).map_or(0, |q| q.unacked.len())
    }

    /// Declare a queue and put a message on it, bypassing any channel
    pub fn enqueue(&self, name: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let mut queue = self
            .state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueData::new(QueueOptions::durable()));
        queue.published.push(payload.clone());
        queue.ready.push_back((payload, false));
        queue.notify.notify_one();
    }

    // ==================== Internals ====================

    fn bump(&self, update: impl FnOnce(&mut BrokerStats)) {
        update(&mut self.state.stats.lock());
    }

    /// Return deliveries whose channel has closed to the front of their queue
    fn requeue_orphans(&self) {
        for mut queue in self.state.queues.iter_mut() {
            let mut orphaned: Vec<DeliveryTag> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel.is_cancelled())
                .map(|(tag, _)| *tag)
                .collect();
            if orphaned.is_empty() {
                continue;
            }
            // Highest tag first so the oldest delivery ends up at the front
            orphaned.sort_unstable_by(|a, b| b.cmp(a));
            for tag in orphaned {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    queue.ready.push_front((unacked.payload, true));
                    queue.notify.notify_one();
                }
            }
            debug!(queue = %queue.key(), "Requeued unacked deliveries");
        }
    }

    fn take_ready(
        &self,
        name: &str,
        channel: &CancellationToken,
        auto_ack: bool,
    ) -> Option<InboundMessage> {
        let mut queue = self.state.queues.get_mut(name)?;
        let (payload, redelivered) = queue.ready.pop_front()?;
        let tag = DeliveryTag(self.state.next_tag.fetch_add(1, Ordering::Relaxed));
        if !auto_ack {
            queue.unacked.insert(
                tag,
                Unacked {
                    payload: payload.clone(),
                    channel: channel.clone(),
                },
            );
        }
        debug!(queue = %name, delivery_tag = %tag, "Message delivered");
        Some(InboundMessage {
            payload,
            delivery_tag: tag,
            redelivered,
        })
    }

    fn queue_notify(&self, name: &str) -> Option<Arc<Notify>> {
        self.state.queues.get(name).map(|q| Arc::clone(&q.notify))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self, url: &str) -> Result<Box<dyn Connection>> {
        self.bump(|s| s.dials += 1);
        if self.take_fault(Fault::Dial) {
            return Err(Error::Dial(format!("connection refused: {url}")));
        }

        let closed = CancellationToken::new();
        {
            let mut connections = self.state.connections.lock();
            connections.retain(|token| !token.is_cancelled());
            connections.push(closed.clone());
        }
        debug!("Connection opened");

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            closed,
        }))
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelOpen("connection is closed".to_string()));
        }
        if self.broker.take_fault(Fault::ChannelOpen) {
            return Err(Error::ChannelOpen("channel limit reached".to_string()));
        }
        self.broker.bump(|s| s.channels_opened += 1);

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            closed: self.closed.child_token(),
            confirms: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Close("connection already closed".to_string()));
        }
        self.closed.cancel();
        self.broker.requeue_orphans();
        debug!("Connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    broker: MemoryBroker,
    /// Child of the owning connection's token
    closed: CancellationToken,
    confirms: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        if self.broker.take_fault(Fault::Declare) {
            return Err(Error::QueueDeclare {
                queue: name.to_string(),
                reason: "access refused".to_string(),
            });
        }

        self.broker
            .state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = %name, durable = options.durable, "Queue declared");
                QueueData::new(options)
            });
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.ensure_open()?;
        if self.broker.take_fault(Fault::ConfirmMode) {
            return Err(Error::ConfirmMode("not supported".to_string()));
        }
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        payload: Bytes,
        _options: &PublishOptions,
    ) -> Result<PendingConfirm> {
        self.ensure_open()?;
        self.broker.bump(|s| s.publish_attempts += 1);
        if self.broker.take_fault(Fault::Publish) {
            return Err(Error::Publish("channel error".to_string()));
        }
        if !self.confirms.load(Ordering::Acquire) {
            return Err(Error::Publish("channel is not in confirm mode".to_string()));
        }
        if self.broker.take_fault(Fault::Nack) {
            self.broker.bump(|s| s.nacks += 1);
            debug!(queue = %queue, "Message nacked");
            return Ok(PendingConfirm::settled(false));
        }

        let mut data = self
            .broker
            .state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        data.published.push(payload.clone());
        data.ready.push_back((payload, false));
        data.notify.notify_one();
        debug!(queue = %queue, "Message published");

        Ok(PendingConfirm::settled(true))
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Deliveries> {
        self.ensure_open()?;
        if self.broker.take_fault(Fault::Consume) {
            return Err(Error::Consume {
                queue: queue.to_string(),
                reason: "resource locked".to_string(),
            });
        }
        let notify = self.broker.queue_notify(queue).ok_or_else(|| Error::Consume {
            queue: queue.to_string(),
            reason: "no such queue".to_string(),
        })?;
        self.broker.bump(|s| s.consumers_registered += 1);
        info!(queue = %queue, consumer_tag = %options.consumer_tag, "Consumer registered");

        let state = ConsumerState {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            closed: self.closed.clone(),
            notify,
            auto_ack: options.auto_ack,
        };

        let deliveries = futures::stream::unfold(state, |state| async move {
            loop {
                if state.closed.is_cancelled() {
                    return None;
                }
                if let Some(message) =
                    state
                        .broker
                        .take_ready(&state.queue, &state.closed, state.auto_ack)
                {
                    return Some((message, state));
                }
                tokio::select! {
                    _ = state.closed.cancelled() => return None,
                    _ = state.notify.notified() => {}
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        for mut queue in self.broker.state.queues.iter_mut() {
            if queue.unacked.remove(&tag).is_some() {
                queue.acked.push(tag);
                self.broker.bump(|s| s.acks += 1);
                debug!(queue = %queue.key(), delivery_tag = %tag, "Message acknowledged");
                return Ok(());
            }
        }
        Err(Error::Ack(format!("unknown delivery tag {tag}")))
    }

    async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.closed.cancel();
        self.broker.requeue_orphans();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct ConsumerState {
    broker: MemoryBroker,
    queue: String,
    closed: CancellationToken,
    notify: Arc<Notify>,
    auto_ack: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_channel(broker: &MemoryBroker) -> (Box<dyn Connection>, Box<dyn Channel>) {
        let conn = broker.dial("memory://test").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.declare_queue("test", QueueOptions::durable()).await.unwrap();
        channel.enable_confirms().await.unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        let options = PublishOptions::persistent("text/plain");
        let confirm = channel
            .publish_confirmed("test", Bytes::from("Hello!"), &options)
            .await
            .unwrap();
        assert!(confirm.wait().await);

        let mut deliveries = channel
            .consume("test", ConsumeOptions::manual_ack("c1"))
            .await
            .unwrap();
        let message = deliveries.next().await.unwrap();
        assert_eq!(message.payload_as_str(), Some("Hello!"));
        assert!(!message.redelivered);
        assert_eq!(broker.unacked_count("test"), 1);

        channel.ack(message.delivery_tag).await.unwrap();
        assert_eq!(broker.acked("test"), vec![message.delivery_tag]);
        assert_eq!(broker.unacked_count("test"), 0);
    }

    #[tokio::test]
    async fn test_publish_requires_confirm_mode() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("memory://test").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.declare_queue("test", QueueOptions::durable()).await.unwrap();

        let result = channel
            .publish_confirmed("test", Bytes::from("x"), &PublishOptions::persistent("text/plain"))
            .await;
        assert!(matches!(result, Err(Error::Publish(_))));
    }

    #[tokio::test]
    async fn test_injected_nack() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        broker.inject(Fault::Nack, 1);

        let options = PublishOptions::persistent("text/plain");
        let first = channel.publish_confirmed("test", Bytes::from("x"), &options).await.unwrap();
        assert!(!first.wait().await);
        let second = channel.publish_confirmed("test", Bytes::from("x"), &options).await.unwrap();
        assert!(second.wait().await);

        assert_eq!(broker.published("test").len(), 1);
        assert_eq!(broker.stats().nacks, 1);
        assert_eq!(broker.stats().publish_attempts, 2);
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open_channel(&broker).await;
        broker.enqueue("test", "first");
        broker.enqueue("test", "second");

        let mut deliveries = channel
            .consume("test", ConsumeOptions::manual_ack("c1"))
            .await
            .unwrap();
        deliveries.next().await.unwrap();
        deliveries.next().await.unwrap();
        assert_eq!(broker.unacked_count("test"), 2);

        channel.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked_count("test"), 0);
        assert_eq!(broker.ready_count("test"), 2);

        let replacement = conn.open_channel().await.unwrap();
        let mut again = replacement
            .consume("test", ConsumeOptions::manual_ack("c2"))
            .await
            .unwrap();
        let redelivered = again.next().await.unwrap();
        assert_eq!(redelivered.payload_as_str(), Some("first"));
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_sever_closes_channels() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open_channel(&broker).await;

        broker.sever_connections();
        assert!(conn.is_closed());
        assert!(channel.is_closed());
        assert!(matches!(channel.ack(DeliveryTag(1)).await, Err(Error::ChannelClosed)));
        assert!(conn.open_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connections_are_pruned() {
        let broker = MemoryBroker::new();
        for _ in 0..5 {
            let conn = broker.dial("memory://test").await.unwrap();
            conn.close().await.unwrap();
        }
        let conn = broker.dial("memory://test").await.unwrap();

        assert_eq!(broker.state.connections.lock().len(), 1);
        assert_eq!(broker.open_connections(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_injected_dial_failures() {
        let broker = MemoryBroker::new();
        broker.inject(Fault::Dial, 2);

        assert!(broker.dial("memory://test").await.is_err());
        assert!(broker.dial("memory://test").await.is_err());
        assert!(broker.dial("memory://test").await.is_ok());
        assert_eq!(broker.stats().dials, 3);
    }
}
