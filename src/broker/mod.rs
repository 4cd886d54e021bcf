//! Broker client
//!
//! The pipeline talks to the broker through two small traits so the
//! publisher and consumer loop are independent of the wire client:
//!
//! - [`Connector`] performs exactly one connection attempt per call. It never
//!   retries; retrying is the supervisor's job.
//! - [`BrokerConnection`] is a live, exclusively-owned connection with one
//!   channel. It is never shared between components or concurrent calls.
//!
//! [`amqp`] is the RabbitMQ implementation. Tests use an in-memory broker
//! that models durable queues, prefetch and redelivery.

pub mod amqp;
#[cfg(test)]
pub mod memory;
pub mod message;

use async_trait::async_trait;

use crate::utils::RelayResult;

pub use amqp::{AmqpConnection, AmqpConnector};
pub use message::{DeliveryRecord, Message};

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject this delivery.
    pub tag: u64,
    pub body: Vec<u8>,
    /// Set by the broker when this message was delivered before and not
    /// acknowledged.
    pub redelivered: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: BrokerConnection;

    /// Opens one connection. Fails with `RelayError::Connection`.
    async fn connect(&self) -> RelayResult<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send {
    /// Declares `queue`. Redeclaring with the same `durable` flag is a no-op;
    /// a conflicting flag fails with `RelayError::QueueConflict`.
    async fn declare_queue(&mut self, queue: &str, durable: bool) -> RelayResult<()>;

    /// Publishes `body` to `queue` through the default exchange and returns
    /// once the broker has confirmed it. `persistent` asks the broker to
    /// write the message to disk.
    async fn publish(&mut self, queue: &str, body: &[u8], persistent: bool) -> RelayResult<()>;

    /// Caps the number of unacknowledged deliveries the broker will push.
    async fn set_prefetch(&mut self, count: u16) -> RelayResult<()>;

    /// Starts consuming `queue` with manual acknowledgment.
    async fn consume(&mut self, queue: &str) -> RelayResult<()>;

    /// Waits for the next delivery. `Ok(None)` means the broker ended the
    /// subscription.
    async fn next_delivery(&mut self) -> RelayResult<Option<Delivery>>;

    async fn ack(&mut self, tag: u64) -> RelayResult<()>;

    /// Negative acknowledgment. With `requeue` the broker redelivers the
    /// message.
    async fn reject(&mut self, tag: u64, requeue: bool) -> RelayResult<()>;

    /// Closes the connection. Unacknowledged deliveries return to the queue.
    async fn close(&mut self) -> RelayResult<()>;
}
