//! Broker client seam.
//!
//! The producer and the per-topic consumers only talk to the broker through
//! these traits. A [`Broker`] is an explicitly owned resource handed to the
//! messaging service at construction; it builds one producer transport and
//! one consumer-group client per consumer.
//!
//! - [`kafka::KafkaBroker`]: rdkafka-backed implementation (feature `messaging-kafka`)
//! - [`memory::MemoryBroker`]: in-process implementation for tests and local runs

#[cfg(feature = "messaging-kafka")]
pub mod kafka;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::error::BrokerError;
use crate::messaging::message::{InboundMessage, OutboundRecord, RecordMetadata};

#[cfg(feature = "messaging-kafka")]
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

/// Resolves once the broker acknowledges (or rejects) an enqueued record
pub type PendingDelivery = BoxFuture<'static, Result<RecordMetadata, BrokerError>>;

/// Factory for broker connections
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    fn producer_transport(
        &self,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn ProducerTransport>, BrokerError>;

    fn consumer_group(
        &self,
        group_id: &str,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn ConsumerGroupClient>, BrokerError>;
}

/// Outbound side of a broker connection
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Enqueue a record for sending. Returns once the client accepted the
    /// record; the returned future tracks the broker acknowledgement.
    async fn send(&self, record: OutboundRecord) -> Result<PendingDelivery, BrokerError>;

    /// Wait for every enqueued record to be delivered or failed
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// A consumer-group membership for one group id
#[async_trait]
pub trait ConsumerGroupClient: Send + Sync {
    fn group_id(&self) -> &str;

    /// Join (or rejoin) the group for `topic` and open a session over the
    /// partitions assigned to this member.
    async fn join(&self, topic: &str) -> Result<Box<dyn GroupSession>, BrokerError>;

    /// Leave the group and release the connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One generation of group membership
#[async_trait]
pub trait GroupSession: Send {
    fn member_id(&self) -> &str;

    /// Partitions currently claimed by this member
    fn assignment(&self) -> Vec<i32>;

    /// Next delivered message. `None` means the session ended (rebalance)
    /// and the caller should rejoin.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, BrokerError>>;

    /// Advance the commit checkpoint past `message`
    fn mark_processed(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Hand `message` back to the broker; its partition rewinds so it is
    /// delivered again before anything after it.
    fn release(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;
}
