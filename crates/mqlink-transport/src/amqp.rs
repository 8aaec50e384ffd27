//! RabbitMQ backend over AMQP 0-9-1
//!
//! Thin adapter from the transport traits onto `lapin`. Publishes go
//! through the default exchange with the queue name as routing key.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use mqlink_types::{DeliveryTag, Error, InboundMessage, Result};
use tracing::warn;

use crate::traits::{
    Channel, Connection, ConsumeOptions, Deliveries, PendingConfirm, PublishOptions, QueueOptions,
    Transport,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Dials RabbitMQ brokers with `lapin`
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    /// Create a transport with default connection properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with custom connection properties
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn dial(&self, url: &str) -> Result<Box<dyn Connection>> {
        let inner = lapin::Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        Ok(Box::new(AmqpConnection { inner }))
    }
}

/// Open `lapin` connection
pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        let inner = self
            .inner
            .create_channel()
            .await
            .map_err(|e| Error::ChannelOpen(e.to_string()))?;
        Ok(Box::new(AmqpChannel { inner }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| Error::Close(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }
}

/// Open `lapin` channel
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::QueueDeclare {
                queue: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::ConfirmMode(e.to_string()))
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<PendingConfirm> {
        let mut properties = BasicProperties::default();
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(content_type) = &options.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }

        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        Ok(PendingConfirm::new(async move {
            match confirm.await {
                Ok(confirmation) => confirmation.is_ack(),
                Err(e) => {
                    warn!(error = %e, "Confirmation lost");
                    false
                }
            }
        }))
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Deliveries> {
        let consume = BasicConsumeOptions {
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, &options.consumer_tag, consume, FieldTable::default())
            .await
            .map_err(|e| Error::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let deliveries = futures::stream::unfold(consumer, |mut consumer| async move {
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    let message = InboundMessage {
                        payload: Bytes::from(delivery.data),
                        delivery_tag: DeliveryTag(delivery.delivery_tag),
                        redelivered: delivery.redelivered,
                    };
                    Some((message, consumer))
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    None
                }
                None => None,
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.inner
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| Error::Close(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }
}
