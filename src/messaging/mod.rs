//! Broker-backed user event messaging.
//!
//! Business code publishes [`EventEnvelope`]s through the [`Producer`] and
//! receives them through [`MessageHandler`]s that a [`HandlerFactory`]
//! supplies to the [`MessagingService`]. The broker itself sits behind the
//! [`broker::Broker`] seam: Kafka in production, [`MemoryBroker`] in tests.

pub mod broker;
pub mod codec;
pub mod consumer;
pub mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod manager;
pub mod message;
pub mod producer;
pub mod router;
pub mod service;

#[cfg(feature = "messaging-kafka")]
pub use broker::KafkaBroker;
pub use broker::{Broker, MemoryBroker};
pub use codec::SerializationFormat;
pub use consumer::{ConsumerState, ConsumerStats, TopicConsumer};
pub use context::{CancelHandle, Context};
pub use error::{BrokerError, MessagingError, MessagingResult};
pub use events::{EventEnvelope, EventKind, EventPayload};
pub use handler::{FnHandler, HandlerFactory, LoggingHandler, LoggingHandlerFactory, MessageHandler};
pub use manager::ConsumerManager;
pub use message::{InboundMessage, OutboundRecord, RecordMetadata};
pub use producer::{Producer, ProducerStats};
pub use router::TopicRouter;
pub use service::MessagingService;
