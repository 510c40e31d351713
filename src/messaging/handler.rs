//! Handler capability and factory.
//!
//! The messaging layer only knows these two traits; business code supplies
//! the implementations when the service is constructed.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::context::Context;
use crate::messaging::error::MessagingResult;
use crate::messaging::events::{EventKind, EventPayload};
use crate::messaging::message::InboundMessage;

/// Processes messages from one topic on behalf of one consumer group.
///
/// Delivery is at-least-once: a message is redelivered until `handle`
/// returns `Ok`, so implementations must tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Route key or physical topic this handler consumes
    fn topic_name(&self) -> &str;

    /// Consumer group; an empty name means the configured default group
    fn consumer_group(&self) -> &str;

    async fn handle(&self, ctx: &Context, message: &InboundMessage) -> anyhow::Result<()>;
}

/// Builds the handler set for a service
pub trait HandlerFactory: Send + Sync {
    fn create_handlers(&self, config: &MessagingConfig)
        -> MessagingResult<Vec<Arc<dyn MessageHandler>>>;
}

/// A fixed handler list acts as its own factory
impl HandlerFactory for Vec<Arc<dyn MessageHandler>> {
    fn create_handlers(
        &self,
        _config: &MessagingConfig,
    ) -> MessagingResult<Vec<Arc<dyn MessageHandler>>> {
        Ok(self.clone())
    }
}

/// Closure signature wrapped by [`FnHandler`]
pub type HandlerFn =
    Arc<dyn Fn(Context, InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handler backed by an async closure
#[derive(Clone)]
pub struct FnHandler {
    topic: String,
    group: String,
    handler: HandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(topic: impl Into<String>, group: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            topic: topic.into(),
            group: group.into(),
            handler: Arc::new(move |ctx, message| handler(ctx, message).boxed()),
        }
    }
}

#[async_trait]
impl MessageHandler for FnHandler {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn consumer_group(&self) -> &str {
        &self.group
    }

    async fn handle(&self, ctx: &Context, message: &InboundMessage) -> anyhow::Result<()> {
        (self.handler)(ctx.clone(), message.clone()).await
    }
}

/// Decodes each message and logs the event it carries
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    topic: String,
    group: String,
}

impl LoggingHandler {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
        }
    }

    /// One handler per event kind, all in `group`
    pub fn for_all_kinds(group: &str) -> Vec<Arc<dyn MessageHandler>> {
        EventKind::ALL
            .iter()
            .map(|kind| Arc::new(Self::new(kind.route_key(), group)) as Arc<dyn MessageHandler>)
            .collect()
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn consumer_group(&self) -> &str {
        &self.group
    }

    async fn handle(&self, ctx: &Context, message: &InboundMessage) -> anyhow::Result<()> {
        // An undecodable record would never succeed on redelivery; log and move on.
        let event = match message.decode_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    position = %message.position(),
                    error = %e,
                    "skipping undecodable message"
                );
                return Ok(());
            }
        };

        match message.event_kind() {
            Ok(kind) if kind != event.kind() => warn!(
                position = %message.position(),
                header = %kind,
                payload = %event.kind(),
                "event_type header does not match payload"
            ),
            Ok(_) => {}
            Err(e) => debug!(position = %message.position(), error = %e, "no usable event_type header"),
        }

        let detail = match event.payload() {
            EventPayload::Registered { username, email } => format!("{} <{}>", username, email),
            EventPayload::StatusChanged {
                old_status,
                new_status,
                ..
            } => format!("{} -> {}", old_status, new_status),
            EventPayload::Updated { changed_fields } => {
                let mut fields: Vec<&str> = changed_fields.keys().map(String::as_str).collect();
                fields.sort_unstable();
                fields.join(",")
            }
            _ => String::new(),
        };

        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event_id = %event.id(),
            event_type = %event.kind(),
            subject_id = %event.subject_id(),
            request_id = ctx.request_id().unwrap_or("-"),
            detail = %detail,
            "received user event"
        );
        Ok(())
    }
}

/// Logs every message on the given route keys, using the configured group
#[derive(Debug, Clone, Default)]
pub struct LoggingHandlerFactory {
    topics: Vec<String>,
}

impl LoggingHandlerFactory {
    /// An empty topic list means every event kind
    pub fn new(topics: Vec<String>) -> Self {
        Self { topics }
    }
}

impl HandlerFactory for LoggingHandlerFactory {
    fn create_handlers(
        &self,
        config: &MessagingConfig,
    ) -> MessagingResult<Vec<Arc<dyn MessageHandler>>> {
        if self.topics.is_empty() {
            return Ok(LoggingHandler::for_all_kinds(&config.consumer_group));
        }

        Ok(self
            .topics
            .iter()
            .map(|topic| {
                Arc::new(LoggingHandler::new(topic.as_str(), config.consumer_group.as_str()))
                    as Arc<dyn MessageHandler>
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::events::EventEnvelope;
    use crate::messaging::message::HEADER_EVENT_TYPE;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            topic: "user_registered".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload,
            headers: HashMap::new(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = FnHandler::new("user_registered", "g", move |ctx, _message| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(ctx.request_id(), Some("r-1"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let ctx = Context::background().with_request_id("r-1");
        handler.handle(&ctx, &message(vec![])).await.unwrap();
        handler.handle(&ctx, &message(vec![])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.topic_name(), "user_registered");
        assert_eq!(handler.consumer_group(), "g");
    }

    #[tokio::test]
    async fn test_logging_handler_tolerates_garbage() {
        let handler = LoggingHandler::new("user_registered", "g");
        let result = handler
            .handle(&Context::background(), &message(b"not json".to_vec()))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_mismatched_event_type_header() {
        let event = EventEnvelope::registered("u1", "alice", "a@x.com");
        let mut inbound = message(serde_json::to_vec(&event).unwrap());
        inbound
            .headers
            .insert(HEADER_EVENT_TYPE.to_string(), "user.exploded".to_string());

        let handler = LoggingHandler::new("user_registered", "g");
        assert!(handler.handle(&Context::background(), &inbound).await.is_ok());
        assert!(inbound.event_kind().is_err());
    }

    #[test]
    fn test_logging_factory_defaults_to_every_kind() {
        let config = MessagingConfig::default();
        let handlers = LoggingHandlerFactory::default()
            .create_handlers(&config)
            .unwrap();

        assert_eq!(handlers.len(), EventKind::ALL.len());
        assert!(handlers
            .iter()
            .all(|h| h.consumer_group() == config.consumer_group));

        let picked = LoggingHandlerFactory::new(vec!["user_deleted".into()])
            .create_handlers(&config)
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].topic_name(), "user_deleted");
    }
}
