//! Handler - application logic invoked for every inbound message

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

/// Decides whether an inbound message is acknowledged.
///
/// Returning `true` acks the delivery; `false` leaves it unacknowledged so
/// the broker can redeliver it once the channel goes away.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> bool;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn handle(&self, payload: Bytes) -> bool {
        (self)(payload).await
    }
}
