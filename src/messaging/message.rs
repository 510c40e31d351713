use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::messaging::codec::SerializationFormat;
use crate::messaging::error::MessagingError;
use crate::messaging::events::{EventEnvelope, EventKind};

pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_EVENT_ID: &str = "event_id";
pub const HEADER_REQUEST_ID: &str = "request_id";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_SOURCE: &str = "source";
pub const HEADER_SCHEMA_VERSION: &str = "schema_version";

/// A serialized record on its way to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Where the broker stored an acknowledged record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A broker-delivered record, owned by the consumer processing it
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_ID)
    }

    /// Event kind named by the `event_type` header
    pub fn event_kind(&self) -> Result<EventKind, MessagingError> {
        let name = self
            .header(HEADER_EVENT_TYPE)
            .ok_or_else(|| MessagingError::UnknownEventKind("<missing event_type header>".into()))?;
        name.parse()
    }

    /// Decode the payload with the codec named by the `content-type` header
    pub fn decode_event(&self) -> Result<EventEnvelope, MessagingError> {
        SerializationFormat::from_content_type(self.header(HEADER_CONTENT_TYPE)).decode(&self.payload)
    }

    /// `topic:partition:offset`, handy for log lines
    pub fn position(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}
