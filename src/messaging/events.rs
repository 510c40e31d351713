use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messaging::error::MessagingError;

/// Schema version stamped on every envelope
pub const SCHEMA_VERSION: &str = "1.0";

/// Service name used when the configuration does not name one
pub const DEFAULT_SOURCE: &str = "user-service";

/// The closed set of user event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Registered,
    LoggedIn,
    PasswordChanged,
    StatusChanged,
    Deleted,
    Updated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Registered,
        EventKind::LoggedIn,
        EventKind::PasswordChanged,
        EventKind::StatusChanged,
        EventKind::Deleted,
        EventKind::Updated,
    ];

    /// Dotted event name carried in the `event_type` header and payload
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Registered => "user.registered",
            EventKind::LoggedIn => "user.logged_in",
            EventKind::PasswordChanged => "user.password_changed",
            EventKind::StatusChanged => "user.status_changed",
            EventKind::Deleted => "user.deleted",
            EventKind::Updated => "user.updated",
        }
    }

    /// Symbolic key looked up in the topic route table
    pub fn route_key(&self) -> &'static str {
        match self {
            EventKind::Registered => "user_registered",
            EventKind::LoggedIn => "user_logged_in",
            EventKind::PasswordChanged => "user_password_changed",
            EventKind::StatusChanged => "user_status_changed",
            EventKind::Deleted => "user_deleted",
            EventKind::Updated => "user_updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = MessagingError;

    /// Accepts the dotted name, the route key, or the bare variant name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| {
                normalized == kind.as_str()
                    || normalized == kind.route_key()
                    || Some(normalized.as_str()) == kind.route_key().strip_prefix("user_")
            })
            .ok_or_else(|| MessagingError::UnknownEventKind(s.to_string()))
    }
}

/// Variant-specific event fields. The variant tag is serialized inline as
/// `event_type`, so the wire document stays flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    #[serde(rename = "user.registered")]
    Registered { username: String, email: String },

    #[serde(rename = "user.logged_in")]
    LoggedIn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip_address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },

    #[serde(rename = "user.password_changed")]
    PasswordChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed_by: Option<String>,
    },

    #[serde(rename = "user.status_changed")]
    StatusChanged {
        old_status: String,
        new_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "user.deleted")]
    Deleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "user.updated")]
    Updated {
        changed_fields: HashMap<String, serde_json::Value>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Registered { .. } => EventKind::Registered,
            EventPayload::LoggedIn { .. } => EventKind::LoggedIn,
            EventPayload::PasswordChanged { .. } => EventKind::PasswordChanged,
            EventPayload::StatusChanged { .. } => EventKind::StatusChanged,
            EventPayload::Deleted { .. } => EventKind::Deleted,
            EventPayload::Updated { .. } => EventKind::Updated,
        }
    }
}

/// Immutable user event envelope.
///
/// The id and timestamp are assigned once at construction. The kind is
/// derived from the payload variant, so a kind can never be paired with the
/// wrong payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    timestamp: DateTime<Utc>,
    schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    subject_id: String,
    #[serde(flatten)]
    payload: EventPayload,
}

impl EventEnvelope {
    /// Create a new event about `subject_id`
    pub fn new(subject_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: None,
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
            request_id: None,
            subject_id: subject_id.into(),
            payload,
        }
    }

    pub fn registered(
        subject_id: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self::new(
            subject_id,
            EventPayload::Registered {
                username: username.into(),
                email: email.into(),
            },
        )
    }

    pub fn logged_in(
        subject_id: impl Into<String>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self::new(
            subject_id,
            EventPayload::LoggedIn {
                ip_address,
                user_agent,
            },
        )
    }

    pub fn password_changed(subject_id: impl Into<String>, changed_by: Option<String>) -> Self {
        Self::new(subject_id, EventPayload::PasswordChanged { changed_by })
    }

    pub fn status_changed(
        subject_id: impl Into<String>,
        old_status: impl Into<String>,
        new_status: impl Into<String>,
    ) -> Self {
        Self::new(
            subject_id,
            EventPayload::StatusChanged {
                old_status: old_status.into(),
                new_status: new_status.into(),
                reason: None,
            },
        )
    }

    pub fn deleted(
        subject_id: impl Into<String>,
        deleted_by: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self::new(subject_id, EventPayload::Deleted { deleted_by, reason })
    }

    pub fn updated(
        subject_id: impl Into<String>,
        changed_fields: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(subject_id, EventPayload::Updated { changed_fields })
    }

    /// Attach a correlation id (consumes the event; the id is unchanged)
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Name the originating service. Events left without one get the
    /// producer's configured source when published.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Key used for partitioning: all events about one user share a partition
    pub fn partition_key(&self) -> &str {
        &self.subject_id
    }
}
