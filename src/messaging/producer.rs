//! Event producer.
//!
//! Two publish paths share serialization and routing:
//!
//! - [`Producer::publish_sync`] waits for the broker acknowledgement, bounded
//!   by the sync timeout and the caller's [`Context`].
//! - [`Producer::publish_async`] only waits for the record to enter the
//!   bounded outbound queue. A dispatcher task hands queued records to the
//!   transport in order and routes each delivery outcome to one of two
//!   drainer tasks (successes, failures) which log and count them.
//!
//! Async failures never reach the caller; they are visible through
//! [`ProducerMetrics`] and the logs only.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::broker::ProducerTransport;
use crate::messaging::codec::SerializationFormat;
use crate::messaging::context::{CancelHandle, Context};
use crate::messaging::error::{BrokerError, MessagingError, MessagingResult};
use crate::messaging::events::{EventEnvelope, EventKind};
use crate::messaging::message::{
    OutboundRecord, RecordMetadata, HEADER_CONTENT_TYPE, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_REQUEST_ID, HEADER_SCHEMA_VERSION, HEADER_SOURCE, HEADER_TIMESTAMP,
};
use crate::messaging::router::TopicRouter;

/// Producer counters
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    sent: AtomicU64,
    failed: AtomicU64,
    async_succeeded: AtomicU64,
    async_failed: AtomicU64,
}

/// Point-in-time copy of [`ProducerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    /// Synchronous publishes acknowledged by the broker
    pub sent: u64,
    /// Synchronous publishes that returned an error
    pub failed: u64,
    pub async_succeeded: u64,
    pub async_failed: u64,
}

impl ProducerMetrics {
    pub fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            async_succeeded: self.async_succeeded.load(Ordering::Relaxed),
            async_failed: self.async_failed.load(Ordering::Relaxed),
        }
    }
}

struct AsyncFailure {
    topic: String,
    error: BrokerError,
}

struct Workers {
    dispatcher: JoinHandle<()>,
    success_drainer: JoinHandle<()>,
    error_drainer: JoinHandle<()>,
}

/// Publishes user events to the broker.
///
/// Must be created from within a Tokio runtime: construction spawns the
/// dispatcher and the two drainer tasks.
pub struct Producer {
    transport: Arc<dyn ProducerTransport>,
    router: TopicRouter,
    format: SerializationFormat,
    source: String,
    sync_timeout: Duration,
    enqueue_timeout: Duration,
    flush_timeout: Duration,
    metrics: Arc<ProducerMetrics>,
    outbound: RwLock<Option<mpsc::Sender<OutboundRecord>>>,
    workers: Mutex<Option<Workers>>,
    lifecycle: Context,
    shutdown: CancelHandle,
    closed: AtomicBool,
}

impl Producer {
    pub fn new(transport: Arc<dyn ProducerTransport>, config: &MessagingConfig) -> Self {
        let metrics = Arc::new(ProducerMetrics::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(config.producer.channel_buffer_size.max(1));
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let workers = Workers {
            dispatcher: tokio::spawn(dispatch(
                Arc::clone(&transport),
                outbound_rx,
                success_tx,
                failure_tx,
            )),
            success_drainer: tokio::spawn(drain_successes(success_rx, Arc::clone(&metrics))),
            error_drainer: tokio::spawn(drain_failures(failure_rx, Arc::clone(&metrics))),
        };

        let (lifecycle, shutdown) = Context::background().with_cancel();

        Self {
            transport,
            router: TopicRouter::new(config.topics.clone()),
            format: config.serialization_format,
            source: config.source.clone(),
            sync_timeout: config.producer.sync_timeout(),
            enqueue_timeout: config.producer.enqueue_timeout(),
            flush_timeout: config.producer.flush_timeout(),
            metrics,
            outbound: RwLock::new(Some(outbound_tx)),
            workers: Mutex::new(Some(workers)),
            lifecycle,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish and wait for the broker acknowledgement.
    ///
    /// Returns the broker's error verbatim on rejection,
    /// [`MessagingError::PublishTimeout`] when neither an ack nor an error
    /// arrives within the sync window, and [`MessagingError::Cancelled`] when
    /// `ctx` is cancelled first.
    pub async fn publish_sync(
        &self,
        ctx: &Context,
        event: &EventEnvelope,
    ) -> MessagingResult<RecordMetadata> {
        let result = self.publish_sync_inner(ctx, event).await;

        match &result {
            Ok(metadata) => {
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %event.id(),
                    event_type = %event.kind(),
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "event published"
                );
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %event.id(),
                    event_type = %event.kind(),
                    error = %e,
                    "synchronous publish failed"
                );
            }
        }

        result
    }

    async fn publish_sync_inner(
        &self,
        ctx: &Context,
        event: &EventEnvelope,
    ) -> MessagingResult<RecordMetadata> {
        self.ensure_open()?;
        if ctx.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let record = self.prepare(ctx, event)?;
        let window = self.sync_timeout;

        tokio::select! {
            outcome = self.send_and_wait(record) => outcome.map_err(MessagingError::from),
            _ = tokio::time::sleep(window) => Err(MessagingError::PublishTimeout(window)),
            _ = ctx.cancelled() => Err(MessagingError::Cancelled),
        }
    }

    async fn send_and_wait(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
        let delivery = self.transport.send(record).await?;
        delivery.await
    }

    /// Publish without waiting for the broker.
    ///
    /// Returns once the record is in the outbound queue. Fails with
    /// [`MessagingError::EnqueueTimeout`] if the queue stays full for the
    /// enqueue window.
    pub async fn publish_async(&self, ctx: &Context, event: &EventEnvelope) -> MessagingResult<()> {
        self.ensure_open()?;
        if ctx.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let record = self.prepare(ctx, event)?;
        let sender = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(MessagingError::ProducerClosed)?;
        let window = self.enqueue_timeout;

        tokio::select! {
            sent = sender.send(record) => {
                sent.map_err(|_| MessagingError::ProducerClosed)?;
                debug!(event_id = %event.id(), event_type = %event.kind(), "event queued");
                Ok(())
            }
            _ = tokio::time::sleep(window) => Err(MessagingError::EnqueueTimeout(window)),
            _ = ctx.cancelled() => Err(MessagingError::Cancelled),
            _ = self.lifecycle.cancelled() => Err(MessagingError::ProducerClosed),
        }
    }

    /// Stop accepting events, deliver everything already queued and wait for
    /// the background tasks. Calling it again is a no-op.
    pub async fn close(&self) -> MessagingResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("closing producer");
        self.shutdown.cancel();
        // the dispatcher drains the queue and exits once every sender is gone
        self.outbound.write().await.take();

        let mut errors = Vec::new();
        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            let handles = [
                ("dispatcher", workers.dispatcher),
                ("success drainer", workers.success_drainer),
                ("error drainer", workers.error_drainer),
            ];
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    errors.push(MessagingError::Worker(format!("producer {}: {}", name, e)));
                }
            }
        }

        if let Err(e) = self.transport.flush(self.flush_timeout).await {
            errors.push(e.into());
        }

        let stats = self.metrics.snapshot();
        info!(
            sent = stats.sent,
            failed = stats.failed,
            async_succeeded = stats.async_succeeded,
            async_failed = stats.async_failed,
            "producer closed"
        );

        MessagingError::aggregate(errors)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> ProducerStats {
        self.metrics.snapshot()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Topic an event of this kind is published to
    pub fn topic_for(&self, kind: EventKind) -> &str {
        self.router.topic_for(kind)
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            Err(MessagingError::ProducerClosed)
        } else {
            Ok(())
        }
    }

    /// Configured service name stamped on events that do not carry one
    pub fn source(&self) -> &str {
        &self.source
    }

    fn prepare(&self, ctx: &Context, event: &EventEnvelope) -> MessagingResult<OutboundRecord> {
        let event = match event.source() {
            Some(_) => Cow::Borrowed(event),
            None => Cow::Owned(event.clone().with_source(self.source.as_str())),
        };
        let source = event.source().unwrap_or(self.source.as_str());
        let payload = self.format.encode(event.as_ref())?;

        let mut headers = HashMap::new();
        headers.insert(
            HEADER_CONTENT_TYPE.to_string(),
            self.format.content_type().to_string(),
        );
        headers.insert(HEADER_EVENT_TYPE.to_string(), event.kind().as_str().to_string());
        headers.insert(HEADER_EVENT_ID.to_string(), event.id().to_string());
        headers.insert(HEADER_TIMESTAMP.to_string(), event.timestamp().to_rfc3339());
        headers.insert(HEADER_SOURCE.to_string(), source.to_string());
        headers.insert(
            HEADER_SCHEMA_VERSION.to_string(),
            event.schema_version().to_string(),
        );
        if let Some(request_id) = event.request_id().or(ctx.request_id()) {
            headers.insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
        }

        Ok(OutboundRecord {
            topic: self.router.topic_for(event.kind()).to_string(),
            key: Some(event.partition_key().to_string()),
            payload,
            headers,
        })
    }
}

async fn dispatch(
    transport: Arc<dyn ProducerTransport>,
    mut outbound: mpsc::Receiver<OutboundRecord>,
    successes: mpsc::UnboundedSender<RecordMetadata>,
    failures: mpsc::UnboundedSender<AsyncFailure>,
) {
    let mut pending = FuturesUnordered::new();

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(record) = next else { break };
                let topic = record.topic.clone();
                match transport.send(record).await {
                    Ok(delivery) => {
                        pending.push(delivery.map(move |outcome| (topic, outcome)).boxed());
                    }
                    Err(error) => {
                        let _ = failures.send(AsyncFailure { topic, error });
                    }
                }
            }
            Some((topic, outcome)) = pending.next(), if !pending.is_empty() => {
                route_outcome(&successes, &failures, topic, outcome);
            }
        }
    }

    while let Some((topic, outcome)) = pending.next().await {
        route_outcome(&successes, &failures, topic, outcome);
    }
    debug!("producer dispatcher stopped");
}

fn route_outcome(
    successes: &mpsc::UnboundedSender<RecordMetadata>,
    failures: &mpsc::UnboundedSender<AsyncFailure>,
    topic: String,
    outcome: Result<RecordMetadata, BrokerError>,
) {
    match outcome {
        Ok(metadata) => {
            let _ = successes.send(metadata);
        }
        Err(error) => {
            let _ = failures.send(AsyncFailure { topic, error });
        }
    }
}

async fn drain_successes(
    mut successes: mpsc::UnboundedReceiver<RecordMetadata>,
    metrics: Arc<ProducerMetrics>,
) {
    while let Some(metadata) = successes.recv().await {
        metrics.async_succeeded.fetch_add(1, Ordering::Relaxed);
        debug!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "async publish acknowledged"
        );
    }
}

async fn drain_failures(
    mut failures: mpsc::UnboundedReceiver<AsyncFailure>,
    metrics: Arc<ProducerMetrics>,
) {
    while let Some(failure) = failures.recv().await {
        metrics.async_failed.fetch_add(1, Ordering::Relaxed);
        error!(topic = %failure.topic, error = %failure.error, "async publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::{Broker, MemoryBroker, PendingDelivery};
    use crate::messaging::events::DEFAULT_SOURCE;
    use async_trait::async_trait;

    fn producer_for(broker: &MemoryBroker, config: &MessagingConfig) -> Producer {
        Producer::new(broker.producer_transport(config).unwrap(), config)
    }

    /// Accepts nothing: every send hangs
    struct StalledTransport;

    #[async_trait]
    impl ProducerTransport for StalledTransport {
        async fn send(&self, _record: OutboundRecord) -> Result<PendingDelivery, BrokerError> {
            std::future::pending().await
        }

        async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_sync_sets_headers_and_key() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());
        let event = EventEnvelope::registered("u1", "alice", "a@x.com");

        let ctx = Context::background().with_request_id("req-42");
        let metadata = producer.publish_sync(&ctx, &event).await.unwrap();
        assert_eq!(metadata.topic, "user_registered");
        assert_eq!(metadata.partition, broker.partition_for("u1"));

        let stored = broker.records("user_registered");
        assert_eq!(stored.len(), 1);
        let message = &stored[0];
        assert_eq!(message.header(HEADER_EVENT_TYPE), Some("user.registered"));
        assert_eq!(message.header(HEADER_CONTENT_TYPE), Some("application/json"));
        assert_eq!(message.header(HEADER_REQUEST_ID), Some("req-42"));
        assert_eq!(message.header(HEADER_EVENT_ID), Some(event.id().to_string().as_str()));
        assert_eq!(message.key.as_deref(), Some(b"u1".as_slice()));
        assert_eq!(producer.metrics().sent, 1);
    }

    #[tokio::test]
    async fn test_event_request_id_wins_over_context() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());
        let event = EventEnvelope::password_changed("u1", None).with_request_id("from-event");

        let ctx = Context::background().with_request_id("from-ctx");
        producer.publish_sync(&ctx, &event).await.unwrap();

        let stored = broker.records("user_password_changed");
        assert_eq!(stored[0].request_id(), Some("from-event"));
    }

    #[tokio::test]
    async fn test_broker_error_is_returned_verbatim() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());
        broker.fail_next_deliveries(1);

        let err = producer
            .publish_sync(&Context::background(), &EventEnvelope::deleted("u1", None, None))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MessagingError::Broker(BrokerError::Transport(ref m)) if m == "injected delivery failure"
        ));
        assert!(!err.is_timeout());
        assert_eq!(producer.metrics().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_publish_times_out() {
        let broker = MemoryBroker::new();
        broker.set_ack_delay(Some(Duration::from_secs(120)));
        let producer = producer_for(&broker, &MessagingConfig::default());

        let err = producer
            .publish_sync(&Context::background(), &EventEnvelope::logged_in("u1", None, None))
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::PublishTimeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_sync_publish_observes_cancellation() {
        let broker = MemoryBroker::new();
        broker.set_ack_delay(Some(Duration::from_secs(120)));
        let producer = producer_for(&broker, &MessagingConfig::default());

        let (ctx, handle) = Context::background().with_cancel();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let err = producer
            .publish_sync(&ctx, &EventEnvelope::logged_in("u1", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_async_publish_is_delivered_by_close() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());
        let ctx = Context::background();

        for i in 0..10 {
            let event = EventEnvelope::status_changed("u9", format!("s{}", i), format!("s{}", i + 1));
            producer.publish_async(&ctx, &event).await.unwrap();
        }
        producer.close().await.unwrap();

        assert_eq!(broker.records("user_status_changed").len(), 10);
        let stats = producer.metrics();
        assert_eq!(stats.async_succeeded, 10);
        assert_eq!(stats.async_failed, 0);
    }

    #[tokio::test]
    async fn test_async_failures_are_counted_not_returned() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());
        broker.fail_next_deliveries(1);

        let result = producer
            .publish_async(&Context::background(), &EventEnvelope::deleted("u1", None, None))
            .await;
        assert!(result.is_ok());

        producer.close().await.unwrap();
        assert_eq!(producer.metrics().async_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_enqueue_times_out_when_queue_is_full() {
        let mut config = MessagingConfig::default();
        config.producer.channel_buffer_size = 1;
        let producer = Producer::new(Arc::new(StalledTransport), &config);
        let ctx = Context::background();
        let event = EventEnvelope::password_changed("u1", None);

        // first record is held by the dispatcher, second fills the queue
        producer.publish_async(&ctx, &event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.publish_async(&ctx, &event).await.unwrap();

        let err = producer.publish_async(&ctx, &event).await.unwrap_err();
        assert!(matches!(err, MessagingError::EnqueueTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_publish_after_close_is_rejected() {
        let broker = MemoryBroker::new();
        let producer = producer_for(&broker, &MessagingConfig::default());

        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert!(producer.is_closed());

        let event = EventEnvelope::registered("u1", "alice", "a@x.com");
        let ctx = Context::background();
        assert!(matches!(
            producer.publish_sync(&ctx, &event).await,
            Err(MessagingError::ProducerClosed)
        ));
        assert!(matches!(
            producer.publish_async(&ctx, &event).await,
            Err(MessagingError::ProducerClosed)
        ));
    }

    #[tokio::test]
    async fn test_msgpack_content_type_header() {
        let broker = MemoryBroker::new();
        let mut config = MessagingConfig::default();
        config.serialization_format = SerializationFormat::MessagePack;
        let producer = producer_for(&broker, &config);

        let event = EventEnvelope::registered("u1", "alice", "a@x.com");
        producer.publish_sync(&Context::background(), &event).await.unwrap();

        let stored = &broker.records("user_registered")[0];
        assert_eq!(stored.header(HEADER_CONTENT_TYPE), Some("application/msgpack"));
        assert_eq!(
            stored.decode_event().unwrap(),
            event.with_source(DEFAULT_SOURCE)
        );
    }

    #[tokio::test]
    async fn test_configured_source_is_stamped_on_events() {
        let broker = MemoryBroker::new();
        let mut config = MessagingConfig::default();
        config.source = "billing-service".into();
        let producer = producer_for(&broker, &config);
        let ctx = Context::background();

        let event = EventEnvelope::registered("u1", "alice", "a@x.com");
        producer.publish_sync(&ctx, &event).await.unwrap();
        let explicit = EventEnvelope::registered("u2", "bob", "b@x.com").with_source("signup");
        producer.publish_sync(&ctx, &explicit).await.unwrap();

        let stored = broker.records("user_registered");
        let stamped = stored
            .iter()
            .find(|m| m.key.as_deref() == Some(b"u1".as_slice()))
            .unwrap();
        assert_eq!(stamped.header(HEADER_SOURCE), Some("billing-service"));
        let decoded = stamped.decode_event().unwrap();
        assert_eq!(decoded.source(), Some("billing-service"));
        assert_eq!(decoded.id(), event.id());

        let kept = stored
            .iter()
            .find(|m| m.key.as_deref() == Some(b"u2".as_slice()))
            .unwrap();
        assert_eq!(kept.header(HEADER_SOURCE), Some("signup"));
        assert_eq!(kept.decode_event().unwrap().source(), Some("signup"));
    }
}
