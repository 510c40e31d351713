use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::messaging::error::MessagingError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// Message serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl SerializationFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            SerializationFormat::Json => CONTENT_TYPE_JSON,
            SerializationFormat::MessagePack => CONTENT_TYPE_MSGPACK,
        }
    }

    /// Format named by a `content-type` header; unknown or missing means JSON
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(value) if value.eq_ignore_ascii_case(CONTENT_TYPE_MSGPACK) => {
                SerializationFormat::MessagePack
            }
            _ => SerializationFormat::Json,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MessagingError> {
        match self {
            SerializationFormat::Json => Ok(serde_json::to_vec(value)?),
            SerializationFormat::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MessagingError> {
        match self {
            SerializationFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| MessagingError::Deserialization(e.to_string())),
            SerializationFormat::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

impl std::str::FromStr for SerializationFormat {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationFormat::Json),
            "msgpack" | "messagepack" => Ok(SerializationFormat::MessagePack),
            other => Err(MessagingError::config(format!(
                "unsupported serialization format: {}",
                other
            ))),
        }
    }
}
