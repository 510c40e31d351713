//! Per-topic consumer.
//!
//! One [`TopicConsumer`] binds one handler to one topic under one consumer
//! group and owns a single worker task. The worker joins the group, reads
//! messages in partition order and calls the handler for each of them, one
//! at a time. A message is marked processed only after the handler returned
//! `Ok`; on failure it is released back to the broker and delivered again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::config::ConsumerSettings;
use crate::messaging::broker::{ConsumerGroupClient, GroupSession};
use crate::messaging::context::{CancelHandle, Context};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::handler::MessageHandler;
use crate::messaging::message::InboundMessage;

/// Lifecycle of a [`TopicConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    sessions: AtomicU64,
    join_failures: AtomicU64,
}

/// Point-in-time copy of [`ConsumerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    /// Messages marked processed
    pub processed: u64,
    /// Handler failures (each one leads to a redelivery)
    pub failed: u64,
    /// Group sessions opened
    pub sessions: u64,
    pub join_failures: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            join_failures: self.join_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TopicConsumer {
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    client: Arc<dyn ConsumerGroupClient>,
    rejoin_backoff: Duration,
    redelivery_backoff: Duration,
    metrics: Arc<ConsumerMetrics>,
    state: Mutex<ConsumerState>,
    cancel: Mutex<Option<CancelHandle>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TopicConsumer {
    pub fn new(
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        client: Arc<dyn ConsumerGroupClient>,
        settings: &ConsumerSettings,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: client.group_id().to_string(),
            handler,
            client,
            rejoin_backoff: settings.rejoin_backoff(),
            redelivery_backoff: settings.redelivery_backoff(),
            metrics: Arc::new(ConsumerMetrics::default()),
            state: Mutex::new(ConsumerState::Created),
            cancel: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> ConsumerState {
        *lock(&self.state)
    }

    pub fn metrics(&self) -> ConsumerStats {
        self.metrics.snapshot()
    }

    /// Spawn the worker. The worker stops when `ctx` or [`Self::signal_stop`]
    /// cancels it.
    pub fn start(&self, ctx: &Context) -> MessagingResult<()> {
        {
            let mut state = lock(&self.state);
            if *state != ConsumerState::Created {
                return Err(MessagingError::InvalidState {
                    operation: "start".to_string(),
                    state: state.to_string(),
                });
            }
            *state = ConsumerState::Running;
        }

        let (worker_ctx, cancel) = ctx.with_cancel();
        *lock(&self.cancel) = Some(cancel);

        let worker = ConsumeLoop {
            topic: self.topic.clone(),
            group: self.group.clone(),
            handler: Arc::clone(&self.handler),
            client: Arc::clone(&self.client),
            metrics: Arc::clone(&self.metrics),
            rejoin_backoff: self.rejoin_backoff,
            redelivery_backoff: self.redelivery_backoff,
        };
        *lock(&self.worker) = Some(tokio::spawn(worker.run(worker_ctx)));

        info!(topic = %self.topic, group = %self.group, "consumer started");
        Ok(())
    }

    /// Raise the cancellation signal without waiting
    pub fn signal_stop(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConsumerState::Created | ConsumerState::Running => {
                    *state = ConsumerState::Stopping
                }
                ConsumerState::Stopping | ConsumerState::Stopped => {}
            }
        }
        if let Some(cancel) = lock(&self.cancel).as_ref() {
            cancel.cancel();
        }
    }

    /// Wait for the worker to exit. The message in progress, if any, is
    /// finished first.
    pub async fn wait(&self) -> MessagingResult<()> {
        let worker = lock(&self.worker).take();
        match worker {
            Some(handle) => handle.await.map_err(|e| {
                MessagingError::Worker(format!("consumer for topic '{}': {}", self.topic, e))
            }),
            None => Ok(()),
        }
    }

    /// Leave the consumer group and release the client
    pub async fn close(&self) -> MessagingResult<()> {
        if self.state() == ConsumerState::Stopped {
            return Ok(());
        }

        let result = self.client.close().await.map_err(MessagingError::from);
        *lock(&self.state) = ConsumerState::Stopped;

        match &result {
            Ok(()) => info!(topic = %self.topic, group = %self.group, "consumer stopped"),
            Err(e) => warn!(topic = %self.topic, group = %self.group, error = %e, "consumer close failed"),
        }
        result
    }

    /// signal, wait, close
    pub async fn stop(&self) -> MessagingResult<()> {
        self.signal_stop();

        let mut errors = Vec::new();
        if let Err(e) = self.wait().await {
            errors.push(e);
        }
        if let Err(e) = self.close().await {
            errors.push(e);
        }
        MessagingError::aggregate(errors)
    }
}

enum SessionEnd {
    Cancelled,
    Rebalanced,
    Failed,
}

struct ConsumeLoop {
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    client: Arc<dyn ConsumerGroupClient>,
    metrics: Arc<ConsumerMetrics>,
    rejoin_backoff: Duration,
    redelivery_backoff: Duration,
}

impl ConsumeLoop {
    async fn run(self, ctx: Context) {
        while !ctx.is_cancelled() {
            let joined = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                joined = self.client.join(&self.topic) => joined,
            };

            let mut session = match joined {
                Ok(session) => session,
                Err(e) => {
                    ConsumerMetrics::bump(&self.metrics.join_failures);
                    warn!(
                        topic = %self.topic,
                        group = %self.group,
                        error = %e,
                        backoff_ms = self.rejoin_backoff.as_millis() as u64,
                        "failed to join consumer group, retrying"
                    );
                    if !pause(&ctx, self.rejoin_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            ConsumerMetrics::bump(&self.metrics.sessions);
            info!(
                topic = %self.topic,
                group = %self.group,
                member = %session.member_id(),
                partitions = ?session.assignment(),
                "consumer session setup"
            );

            let end = self.consume(&ctx, session.as_mut()).await;

            info!(
                topic = %self.topic,
                group = %self.group,
                member = %session.member_id(),
                "consumer session cleanup"
            );

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Rebalanced => continue,
                SessionEnd::Failed => {
                    if !pause(&ctx, self.rejoin_backoff).await {
                        break;
                    }
                }
            }
        }

        debug!(topic = %self.topic, group = %self.group, "consumer worker exited");
    }

    async fn consume(&self, ctx: &Context, session: &mut dyn GroupSession) -> SessionEnd {
        loop {
            // cancellation wins over a ready message: no new work after stop
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => return SessionEnd::Cancelled,
                next = session.next_message() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(topic = %self.topic, group = %self.group, error = %e, "poll failed");
                    return SessionEnd::Failed;
                }
                None => {
                    debug!(topic = %self.topic, group = %self.group, "session ended by rebalance");
                    return SessionEnd::Rebalanced;
                }
            };

            ConsumerMetrics::bump(&self.metrics.received);
            if !self.process(ctx, session, message).await {
                return SessionEnd::Cancelled;
            }
        }
    }

    /// Returns false when cancellation was observed while backing off
    async fn process(
        &self,
        ctx: &Context,
        session: &mut dyn GroupSession,
        message: InboundMessage,
    ) -> bool {
        let message_ctx = match message.request_id() {
            Some(request_id) => ctx.with_request_id(request_id),
            None => ctx.clone(),
        };

        match self.handler.handle(&message_ctx, &message).await {
            Ok(()) => {
                match session.mark_processed(&message) {
                    Ok(()) => ConsumerMetrics::bump(&self.metrics.processed),
                    Err(e) => warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "failed to mark message processed"
                    ),
                }
                true
            }
            Err(e) => {
                ConsumerMetrics::bump(&self.metrics.failed);
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    group = %self.group,
                    error = %format!("{:#}", e),
                    "handler failed, message left for redelivery"
                );

                let keep_going = pause(ctx, self.redelivery_backoff).await;
                if let Err(e) = session.release(&message) {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "failed to release message"
                    );
                }
                keep_going
            }
        }
    }
}

/// Sleep unless cancelled first; false means cancelled
async fn pause(ctx: &Context, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = ctx.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::MessagingConfig;
    use crate::messaging::broker::{Broker, MemoryBroker};
    use crate::messaging::handler::FnHandler;
    use crate::messaging::message::OutboundRecord;
    use std::collections::HashMap;

    fn fast_settings() -> ConsumerSettings {
        ConsumerSettings {
            rejoin_backoff_ms: 10,
            redelivery_backoff_ms: 1,
            ..ConsumerSettings::default()
        }
    }

    fn consumer_with(broker: &MemoryBroker, handler: FnHandler) -> TopicConsumer {
        let client = broker
            .consumer_group("test-group", &MessagingConfig::default())
            .unwrap();
        TopicConsumer::new("t", Arc::new(handler), client, &fast_settings())
    }

    fn seed(broker: &MemoryBroker, count: usize) {
        for i in 0..count {
            broker.produce(OutboundRecord {
                topic: "t".into(),
                key: Some("k".into()),
                payload: i.to_string().into_bytes(),
                headers: HashMap::new(),
            });
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let broker = MemoryBroker::new();
        let consumer = consumer_with(&broker, FnHandler::new("t", "g", |_, _| async { Ok(()) }));
        assert_eq!(consumer.state(), ConsumerState::Created);

        consumer.start(&Context::background()).unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);

        let err = consumer.start(&Context::background()).unwrap_err();
        assert!(matches!(err, MessagingError::InvalidState { ref state, .. } if state == "running"));

        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_processes_and_marks_each_message() {
        let broker = MemoryBroker::with_partitions(1);
        seed(&broker, 3);
        let consumer = consumer_with(&broker, FnHandler::new("t", "g", |_, _| async { Ok(()) }));

        consumer.start(&Context::background()).unwrap();
        eventually(|| consumer.metrics().processed == 3).await;
        consumer.stop().await.unwrap();

        assert_eq!(broker.committed_offset("test-group", "t", 0), Some(3));
        let stats = consumer.metrics();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.sessions, 1);
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered_before_the_next() {
        let broker = MemoryBroker::with_partitions(1);
        seed(&broker, 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handler = FnHandler::new("t", "g", move |_, message: InboundMessage| {
            let log = Arc::clone(&log);
            async move {
                let attempts = {
                    let mut log = lock(&log);
                    log.push(message.offset);
                    log.iter().filter(|o| **o == message.offset).count()
                };
                if message.offset == 0 && attempts <= 2 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        });
        let consumer = consumer_with(&broker, handler);

        consumer.start(&Context::background()).unwrap();
        eventually(|| consumer.metrics().processed == 2).await;
        consumer.stop().await.unwrap();

        assert_eq!(*lock(&seen), vec![0, 0, 0, 1]);
        assert_eq!(consumer.metrics().failed, 2);
        assert_eq!(broker.committed_offset("test-group", "t", 0), Some(2));
    }

    #[tokio::test]
    async fn test_join_failures_are_retried() {
        let broker = MemoryBroker::with_partitions(1);
        broker.fail_next_joins(3);
        seed(&broker, 1);
        let consumer = consumer_with(&broker, FnHandler::new("t", "g", |_, _| async { Ok(()) }));

        consumer.start(&Context::background()).unwrap();
        eventually(|| consumer.metrics().processed == 1).await;
        consumer.stop().await.unwrap();

        let stats = consumer.metrics();
        assert_eq!(stats.join_failures, 3);
        assert_eq!(stats.sessions, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_rejoins_and_processes() {
        let broker = MemoryBroker::with_partitions(1);
        broker.fail_next_polls(1);
        seed(&broker, 1);
        let consumer = consumer_with(&broker, FnHandler::new("t", "g", |_, _| async { Ok(()) }));

        consumer.start(&Context::background()).unwrap();
        eventually(|| consumer.metrics().processed == 1).await;
        consumer.stop().await.unwrap();

        let stats = consumer.metrics();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.join_failures, 0);
        assert_eq!(stats.received, 1);
        assert_eq!(broker.committed_offset("test-group", "t", 0), Some(1));
    }

    #[tokio::test]
    async fn test_parent_context_cancels_worker() {
        let broker = MemoryBroker::new();
        let consumer = consumer_with(&broker, FnHandler::new("t", "g", |_, _| async { Ok(()) }));
        let (ctx, cancel) = Context::background().with_cancel();

        consumer.start(&ctx).unwrap();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), consumer.wait())
            .await
            .expect("worker should exit after cancellation")
            .unwrap();
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_id_header_reaches_handler_context() {
        let broker = MemoryBroker::with_partitions(1);
        let mut headers = HashMap::new();
        headers.insert("request_id".to_string(), "req-7".to_string());
        broker.produce(OutboundRecord {
            topic: "t".into(),
            key: None,
            payload: vec![],
            headers,
        });

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let handler = FnHandler::new("t", "g", move |ctx: Context, _| {
            let slot = Arc::clone(&slot);
            async move {
                *lock(&slot) = ctx.request_id().map(str::to_string);
                Ok(())
            }
        });
        let consumer = consumer_with(&broker, handler);

        consumer.start(&Context::background()).unwrap();
        eventually(|| consumer.metrics().processed == 1).await;
        consumer.stop().await.unwrap();

        assert_eq!(lock(&seen).as_deref(), Some("req-7"));
    }
}
