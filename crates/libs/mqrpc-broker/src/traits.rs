use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::*;

/// Connection-level broker operations.
///
/// Implementations must allow concurrent `publish` calls from many tasks.
/// Use `Arc<dyn Broker>` as the shared handle type.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Redeclaring an identical definition is a no-op;
    /// a differing one fails with [`BrokerError::PreconditionFailed`].
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a queue, with the same idempotency rules as exchanges.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange. Both must exist.
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish a message. Messages no binding matches are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Open an isolated consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Consumer>, BrokerError>;
}

/// A single manual-ack consumer channel with a prefetch of one.
#[async_trait]
pub trait Consumer: Send {
    fn consumer_tag(&self) -> &str;

    /// Wait for the next delivery. Returns `None` once the queue or the
    /// connection is gone. Cancel safe.
    async fn next(&mut self) -> Option<Delivery>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery, optionally putting it back at the head of the queue.
    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
