//! ConnectionFactory - connect until success
//!
//! Opens a connection and channel, declares the target queue durable and
//! enables publisher confirms. Any failure tears down what was opened,
//! sleeps for the next step of the backoff schedule and starts over.
//!
//! `reconnect` takes no cancellation token: a connect attempt is never
//! abandoned halfway, so a caller shutting down may wait for the current
//! attempt (and its backoff sleep) to finish.

use std::sync::Arc;

use mqlink_transport::{Channel, Connection, QueueOptions, Transport};
use mqlink_types::{BackoffSchedule, Endpoint, Result};
use tracing::{error, info, warn};

use crate::backoff::Backoff;

/// An open connection together with the one channel used on it
pub struct Session {
    pub connection: Box<dyn Connection>,
    pub channel: Box<dyn Channel>,
}

impl Session {
    /// Both halves are still usable
    pub fn is_open(&self) -> bool {
        !self.channel.is_closed() && !self.connection.is_closed()
    }

    /// Close channel then connection; failures are logged, not returned
    pub async fn close(self) {
        close_channel(self.channel.as_ref()).await;
        close_connection(self.connection.as_ref()).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_open())
            .finish()
    }
}

async fn close_channel(channel: &dyn Channel) {
    if channel.is_closed() {
        return;
    }
    if let Err(e) = channel.close().await {
        error!(error = %e, "Error closing channel");
    }
}

async fn close_connection(connection: &dyn Connection) {
    if connection.is_closed() {
        return;
    }
    if let Err(e) = connection.close().await {
        error!(error = %e, "Error closing connection");
    }
}

/// Produces ready-to-use [`Session`]s for an endpoint
#[derive(Clone)]
pub struct ConnectionFactory {
    transport: Arc<dyn Transport>,
    schedule: BackoffSchedule,
}

impl ConnectionFactory {
    /// Create a factory retrying on the given schedule
    pub fn new(transport: Arc<dyn Transport>, schedule: BackoffSchedule) -> Self {
        Self {
            transport,
            schedule,
        }
    }

    /// The schedule used between failed attempts
    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Connect, retrying forever. Returns only on success.
    pub async fn reconnect(&self, endpoint: &Endpoint) -> Session {
        let mut backoff = Backoff::new(self.schedule.clone());
        let url = endpoint.redacted_url();

        loop {
            match self.connect(endpoint).await {
                Ok(session) => {
                    info!(queue = %endpoint.queue, url = %url, "Connected");
                    return session;
                }
                Err(e) => {
                    error!(
                        queue = %endpoint.queue,
                        url = %url,
                        error = %e,
                        "Connect attempt failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            warn!(
                queue = %endpoint.queue,
                url = %url,
                delay_secs = delay.as_secs_f64(),
                "Failed to connect, retrying in {:?} ...",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connect attempt; whatever was opened is closed again on failure
    async fn connect(&self, endpoint: &Endpoint) -> Result<Session> {
        let connection = self.transport.dial(&endpoint.url).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(connection.as_ref()).await;
                return Err(e);
            }
        };

        if let Err(e) = prepare(channel.as_ref(), &endpoint.queue).await {
            Session {
                connection,
                channel,
            }
            .close()
            .await;
            return Err(e);
        }

        Ok(Session {
            connection,
            channel,
        })
    }
}

async fn prepare(channel: &dyn Channel, queue: &str) -> Result<()> {
    channel.declare_queue(queue, QueueOptions::durable()).await?;
    channel.enable_confirms().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqlink_transport::{Fault, MemoryBroker};
    use std::time::Duration;
    use tokio::time::Instant;

    fn factory(broker: &MemoryBroker) -> ConnectionFactory {
        ConnectionFactory::new(Arc::new(broker.clone()), BackoffSchedule::default())
    }

    #[tokio::test]
    async fn test_reconnect_declares_durable_queue() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new("orders", "memory://local");

        let session = factory(&broker).reconnect(&endpoint).await;
        assert!(session.is_open());
        assert_eq!(broker.queue_options("orders"), Some(QueueOptions::durable()));
        assert_eq!(broker.stats().dials, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_follows_schedule() {
        let broker = MemoryBroker::new();
        broker.inject(Fault::Dial, 2);
        let endpoint = Endpoint::new("orders", "memory://local");

        let start = Instant::now();
        let session = factory(&broker).reconnect(&endpoint).await;
        let elapsed = start.elapsed();

        assert!(session.is_open());
        assert_eq!(broker.stats().dials, 3);
        // 1s then 4s
        assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_survives_every_stage() {
        let broker = MemoryBroker::new();
        broker.inject(Fault::ChannelOpen, 1);
        broker.inject(Fault::Declare, 1);
        broker.inject(Fault::ConfirmMode, 1);
        let endpoint = Endpoint::new("orders", "memory://local");

        let start = Instant::now();
        let session = factory(&broker).reconnect(&endpoint).await;

        assert!(session.is_open());
        assert_eq!(broker.stats().dials, 4);
        // 1 + 4 + 9
        assert!(start.elapsed() >= Duration::from_secs(14));
    }

    #[tokio::test]
    async fn test_session_closed_by_broker() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new("orders", "memory://local");
        let session = factory(&broker).reconnect(&endpoint).await;

        broker.sever_connections();
        assert!(!session.is_open());
        assert!(session.channel.is_closed());

        // Both halves already closed; nothing left to do
        session.close().await;
    }
}
