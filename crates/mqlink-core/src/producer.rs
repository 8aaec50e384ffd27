//! Producer - backlog plus confirmed-publish delivery loop
//!
//! Application tasks enqueue with [`Producer::send_bytes`]; a single
//! [`Producer::run_with`] loop drains the backlog in FIFO order and
//! publishes each message with broker confirmation. A message is only
//! released once the broker acks it (or the exhaustion policy says
//! otherwise), so later messages never overtake an unresolved one.

use std::sync::Arc;

use bytes::Bytes;
use mqlink_transport::{PublishOptions, QueueOptions, Transport};
use mqlink_types::{ClientConfig, Endpoint, ExhaustionPolicy, PendingMessage, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::connection::{ConnectionFactory, Session};

/// A backlog entry. In synchronous mode the sender waits on `taken`.
struct Envelope {
    message: PendingMessage,
    taken: Option<oneshot::Sender<()>>,
}

impl Envelope {
    fn accept(self) -> PendingMessage {
        if let Some(taken) = self.taken {
            let _ = taken.send(());
        }
        self.message
    }
}

/// Result of one delivery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Exhausted,
    Cancelled,
}

/// Reliable publisher bound to one queue
pub struct Producer {
    endpoint: Endpoint,
    backlog: mpsc::Sender<Envelope>,
    synchronous: bool,
    delivery: Mutex<Delivery>,
}

impl Producer {
    /// Create a producer that reconnects on the config's backoff schedule
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        config: ClientConfig,
    ) -> Result<Self> {
        let factory = ConnectionFactory::new(transport, config.backoff.clone());
        Self::with_factory(factory, endpoint, config)
    }

    /// Create a producer sharing an existing connection factory
    pub fn with_factory(
        factory: ConnectionFactory,
        endpoint: Endpoint,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;

        let synchronous = config.backlog == 0;
        let (backlog, receiver) = mpsc::channel(config.backlog.max(1));

        Ok(Self {
            endpoint: endpoint.clone(),
            backlog,
            synchronous,
            delivery: Mutex::new(Delivery {
                publish_options: PublishOptions::persistent(config.content_type.clone()),
                backoff: Backoff::new(config.backoff.clone()),
                endpoint,
                factory,
                config,
                receiver,
                session: None,
                in_flight: None,
            }),
        })
    }

    /// The queue this producer publishes to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Enqueue raw bytes.
    ///
    /// Waits while the backlog is full. With a zero backlog, waits until
    /// the delivery loop has taken the message.
    pub async fn send_bytes(&self, payload: impl Into<Bytes>) {
        let message = PendingMessage::new(payload);
        let id = message.id;

        let (taken, handed_over) = if self.synchronous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // The receiver lives inside `self`, so the channel cannot be closed here
        if self.backlog.send(Envelope { message, taken }).await.is_err() {
            error!(
                queue = %self.endpoint.queue,
                message_id = %id,
                "Backlog closed, message discarded"
            );
            return;
        }
        debug!(queue = %self.endpoint.queue, message_id = %id, "Message enqueued");

        if let Some(handed_over) = handed_over {
            let _ = handed_over.await;
        }
    }

    /// Enqueue UTF-8 text
    pub async fn send_string(&self, text: impl Into<String>) {
        self.send_bytes(Bytes::from(text.into())).await
    }

    /// Messages enqueued and not yet taken by the delivery loop
    pub fn pending(&self) -> usize {
        self.backlog.max_capacity() - self.backlog.capacity()
    }

    /// Run the delivery loop until `token` is cancelled.
    ///
    /// Only one loop runs at a time; a second call waits for the first to
    /// return. A message still unresolved at cancellation is kept and is
    /// the first one delivered by the next call.
    pub async fn run_with(&self, token: &CancellationToken) {
        let span = info_span!("producer", queue = %self.endpoint.queue);
        let mut delivery = self.delivery.lock().await;
        delivery.run(token).instrument(span).await
    }

    /// Close the current connection, if any. Waits for a running loop to stop.
    ///
    /// `run_with` already closes its connection when it returns; this is a
    /// no-op afterwards.
    pub async fn close(&self) {
        let mut delivery = self.delivery.lock().await;
        if let Some(session) = delivery.session.take() {
            info!(queue = %self.endpoint.queue, "Closing producer connection");
            session.close().await;
        }
    }
}

/// State owned by the delivery loop
struct Delivery {
    endpoint: Endpoint,
    factory: ConnectionFactory,
    config: ClientConfig,
    publish_options: PublishOptions,
    receiver: mpsc::Receiver<Envelope>,
    session: Option<Session>,
    in_flight: Option<PendingMessage>,
    backoff: Backoff,
}

impl Delivery {
    async fn run(&mut self, token: &CancellationToken) {
        info!("Producer started");

        loop {
            let message = match self.in_flight.take() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    envelope = self.receiver.recv() => match envelope {
                        Some(envelope) => envelope.accept(),
                        None => break,
                    },
                },
            };

            match self.publish(&message, token).await {
                Outcome::Acked => {
                    self.backoff.reset();
                    debug!(
                        message_id = %message.id,
                        latency_ms = message.age().num_milliseconds(),
                        "Message delivered"
                    );
                }
                Outcome::Cancelled => {
                    self.in_flight = Some(message);
                    break;
                }
                Outcome::Exhausted => {
                    if self.settle_exhausted(&message).await {
                        continue;
                    }
                    self.in_flight = Some(message);
                    let delay = self.backoff.next_delay();
                    warn!(
                        delay_secs = delay.as_secs_f64(),
                        "Delivery failed, retrying the same message in {:?} ...",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        info!(pending = self.in_flight.is_some(), "Producer is stopping ...");
    }

    /// Apply the exhaustion policy. `true` means the message is finished with.
    async fn settle_exhausted(&mut self, message: &PendingMessage) -> bool {
        match self.config.exhaustion.clone() {
            ExhaustionPolicy::Retry => false,
            ExhaustionPolicy::Drop => {
                error!(message_id = %message.id, "Publish retries exhausted, dropping message");
                true
            }
            ExhaustionPolicy::DeadLetter(queue) => self.dead_letter(message, &queue).await,
        }
    }

    async fn dead_letter(&mut self, message: &PendingMessage, queue: &str) -> bool {
        let result = {
            let session = live_session(&mut self.session, &self.factory, &self.endpoint).await;
            publish_dead_letter(session, queue, message, &self.publish_options).await
        };

        match result {
            Ok(true) => {
                warn!(
                    message_id = %message.id,
                    dead_letter = %queue,
                    "Message moved to dead-letter queue"
                );
                true
            }
            Ok(false) => {
                warn!(message_id = %message.id, dead_letter = %queue, "Dead-letter publish nacked");
                false
            }
            Err(e) => {
                self.session = None;
                error!(
                    message_id = %message.id,
                    dead_letter = %queue,
                    error = %e,
                    "Dead-letter publish failed"
                );
                false
            }
        }
    }

    /// Up to `max_retry + 1` confirmed publish attempts
    async fn publish(&mut self, message: &PendingMessage, token: &CancellationToken) -> Outcome {
        let max_retry = self.config.max_retry;
        let attempts = u64::from(max_retry) + 1;

        for attempt in 1..=attempts {
            if attempt > 1 && token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let result = {
                let session = live_session(&mut self.session, &self.factory, &self.endpoint).await;
                session
                    .channel
                    .publish_confirmed(
                        &self.endpoint.queue,
                        message.payload.clone(),
                        &self.publish_options,
                    )
                    .await
            };

            let confirm = match result {
                Ok(confirm) => confirm,
                Err(e) => {
                    // Assume the link is broken; drop it without closing
                    self.session = None;
                    error!(message_id = %message.id, error = %e, "Publish failed");
                    warn!(attempt, max_retry, "Failed to publish a message, retrying ...");
                    continue;
                }
            };

            if confirm.wait().await {
                debug!(message_id = %message.id, attempt, "Message acked by server");
                return Outcome::Acked;
            }

            warn!(
                message_id = %message.id,
                attempt,
                max_retry,
                "Message nacked by server, retrying ..."
            );
            tokio::time::sleep(self.config.nack_pause()).await;
        }

        Outcome::Exhausted
    }
}

/// The current session, reconnecting first if there is none or it has closed
async fn live_session<'a>(
    slot: &'a mut Option<Session>,
    factory: &ConnectionFactory,
    endpoint: &Endpoint,
) -> &'a Session {
    let session = match slot.take() {
        Some(session) if session.is_open() => session,
        Some(stale) => {
            debug!("Discarding closed session");
            stale.close().await;
            factory.reconnect(endpoint).await
        }
        None => factory.reconnect(endpoint).await,
    };
    slot.insert(session)
}

async fn publish_dead_letter(
    session: &Session,
    queue: &str,
    message: &PendingMessage,
    options: &PublishOptions,
) -> Result<bool> {
    session
        .channel
        .declare_queue(queue, QueueOptions::durable())
        .await?;
    let confirm = session
        .channel
        .publish_confirmed(queue, message.payload.clone(), options)
        .await?;
    Ok(confirm.wait().await)
}
