use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a broker client (transport level)
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("outbound queue is full")]
    QueueFull,

    #[error("broker client is closed")]
    Closed,

    #[cfg(feature = "messaging-kafka")]
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl BrokerError {
    pub fn transport(message: impl Into<String>) -> Self {
        BrokerError::Transport(message.into())
    }
}

/// Errors surfaced by the messaging subsystem
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("failed to deserialize message: {0}")]
    Deserialization(String),

    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("broker did not acknowledge publish within {}s", .0.as_secs())]
    PublishTimeout(Duration),

    #[error("outbound queue did not accept message within {}s", .0.as_secs())]
    EnqueueTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("producer is closed")]
    ProducerClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid consumer state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    #[error("more than one handler registered for topic '{0}'")]
    DuplicateTopic(String),

    #[error("handler factory failed: {0}")]
    HandlerFactory(String),

    #[error("background task failed: {0}")]
    Worker(String),

    #[error("shutdown failed: {}", ShutdownErrors(.0))]
    Shutdown(Vec<MessagingError>),
}

impl MessagingError {
    pub fn config(message: impl Into<String>) -> Self {
        MessagingError::Config(message.into())
    }

    /// Whether a caller of the synchronous publish path may reasonably retry
    pub fn is_retryable(&self) -> bool {
        match self {
            MessagingError::Broker(BrokerError::Closed) => false,
            MessagingError::Broker(_) => true,
            MessagingError::PublishTimeout(_) => true,
            MessagingError::EnqueueTimeout(_) => true,
            _ => false,
        }
    }

    /// Whether the error is a publish/enqueue timeout rather than a broker error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MessagingError::PublishTimeout(_) | MessagingError::EnqueueTimeout(_)
        )
    }

    /// Fold a list of shutdown failures into a single result
    pub fn aggregate(errors: Vec<MessagingError>) -> Result<(), MessagingError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MessagingError::Shutdown(errors))
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(error: serde_json::Error) -> Self {
        MessagingError::Serialization(error.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MessagingError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        MessagingError::Serialization(error.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MessagingError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        MessagingError::Deserialization(error.to_string())
    }
}

struct ShutdownErrors<'a>(&'a [MessagingError]);

impl fmt::Display for ShutdownErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
