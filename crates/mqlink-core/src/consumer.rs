//! Consumer - receive loop with manual acknowledgement
//!
//! Each pass of the outer loop drops the previous session, reconnects and
//! registers a consumer; the inner loop hands every delivery to the
//! [`Handler`] and acks it when the handler returns `true`. When the
//! delivery stream ends the outer loop starts over.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use mqlink_transport::{ConsumeOptions, Deliveries, Transport};
use mqlink_types::{BackoffSchedule, Endpoint, InboundMessage};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::connection::{ConnectionFactory, Session};
use crate::handler::Handler;

/// Why the inner receive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Cancelled,
    StreamClosed,
    AckFailed,
}

/// Reliable receiver bound to one queue
pub struct Consumer {
    endpoint: Endpoint,
    factory: ConnectionFactory,
    session: Mutex<Option<Session>>,
}

impl Consumer {
    /// Create a consumer that reconnects on the given schedule
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        schedule: BackoffSchedule,
    ) -> Self {
        Self::with_factory(ConnectionFactory::new(transport, schedule), endpoint)
    }

    /// Create a consumer sharing an existing connection factory
    pub fn with_factory(factory: ConnectionFactory, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            factory,
            session: Mutex::new(None),
        }
    }

    /// The queue this consumer reads from
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Receive until `token` is cancelled.
    ///
    /// A handler panic counts as `false`: the message is left unacked and
    /// consumption continues.
    pub async fn run_with<H: Handler>(&self, token: &CancellationToken, handler: H) {
        let span = info_span!("consumer", queue = %self.endpoint.queue);
        self.run(token, &handler).instrument(span).await
    }

    /// Close the current connection, if any. Waits for a running loop to stop.
    ///
    /// `run_with` already closes its connection when it returns; this is a
    /// no-op afterwards.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            info!(queue = %self.endpoint.queue, "Closing consumer connection");
            session.close().await;
        }
    }

    async fn run<H: Handler>(&self, token: &CancellationToken, handler: &H) {
        let mut slot = self.session.lock().await;
        let queue = self.endpoint.queue.as_str();

        loop {
            if token.is_cancelled() {
                break;
            }
            if let Some(previous) = slot.take() {
                previous.close().await;
            }

            info!("Start connecting ...");
            let session = self.factory.reconnect(&self.endpoint).await;

            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4().simple());
            let registered = session
                .channel
                .consume(queue, ConsumeOptions::manual_ack(consumer_tag.clone()))
                .await;
            let deliveries = match registered {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(error = %e, "Consumer registration failed");
                    warn!("Failed to register a consumer, retrying ...");
                    *slot = Some(session);
                    continue;
                }
            };

            info!(consumer_tag = %consumer_tag, "Start message receiving ...");
            let ended = receive(&session, deliveries, token, handler).await;
            *slot = Some(session);
            info!(reason = ?ended, "Finish message receiving");

            if ended == Ended::Cancelled {
                break;
            }
        }

        if let Some(session) = slot.take() {
            session.close().await;
        }
        info!("Consumer is stopping ...");
    }
}

async fn receive<H: Handler>(
    session: &Session,
    mut deliveries: Deliveries,
    token: &CancellationToken,
    handler: &H,
) -> Ended {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return Ended::Cancelled,
            next = deliveries.next() => match next {
                Some(message) => message,
                None => return Ended::StreamClosed,
            },
        };

        let InboundMessage {
            payload,
            delivery_tag,
            redelivered,
        } = message;

        if !invoke(handler, payload).await {
            debug!(delivery_tag = %delivery_tag, redelivered, "Message left unacknowledged");
            continue;
        }

        if let Err(e) = session.channel.ack(delivery_tag).await {
            error!(delivery_tag = %delivery_tag, error = %e, "Ack failed");
            return Ended::AckFailed;
        }
        debug!(delivery_tag = %delivery_tag, redelivered, "Message acknowledged");
    }
}

/// Run the handler, turning a panic into `false`
async fn invoke<H: Handler>(handler: &H, payload: bytes::Bytes) -> bool {
    match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(acknowledge) => acknowledge,
        Err(panic) => {
            error!(
                panic = %panic_message(panic.as_ref()),
                "Handler panicked, message left unacknowledged"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
