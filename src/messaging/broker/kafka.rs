//! rdkafka-backed broker (feature `messaging-kafka`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::broker::{
    Broker, ConsumerGroupClient, GroupSession, PendingDelivery, ProducerTransport,
};
use crate::messaging::error::BrokerError;
use crate::messaging::message::{InboundMessage, OutboundRecord, RecordMetadata};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects producers and consumer groups to a Kafka cluster
#[derive(Debug, Default, Clone)]
pub struct KafkaBroker;

impl KafkaBroker {
    pub fn new() -> Self {
        Self
    }
}

impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn producer_transport(
        &self,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn ProducerTransport>, BrokerError> {
        let producer: FutureProducer = producer_client_config(config).create()?;

        info!(
            brokers = %config.bootstrap_servers(),
            client_id = %config.client_id,
            idempotent = config.producer.idempotent,
            "kafka producer created"
        );

        Ok(Arc::new(KafkaTransport {
            producer,
            max_retries: config.producer.max_retries,
            retry_backoff: config.producer.retry_backoff(),
        }))
    }

    fn consumer_group(
        &self,
        group_id: &str,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn ConsumerGroupClient>, BrokerError> {
        let context = GroupContext {
            group_id: group_id.to_string(),
        };
        let consumer: StreamConsumer<GroupContext> =
            consumer_client_config(group_id, config).create_with_context(context)?;

        Ok(Arc::new(KafkaGroupClient {
            consumer: Arc::new(consumer),
            group_id: group_id.to_string(),
            member_id: format!("{}@{}", config.client_id, group_id),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Producer settings: idempotent, acks from config, bounded retries
pub fn producer_client_config(config: &MessagingConfig) -> ClientConfig {
    let settings = &config.producer;
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set("enable.idempotence", settings.idempotent.to_string())
        .set("acks", &settings.acks)
        .set("retries", settings.max_retries.to_string())
        .set("retry.backoff.ms", settings.retry_backoff_ms.to_string())
        .set("compression.type", settings.compression.as_str())
        .set("batch.size", settings.batch_size.to_string())
        .set("linger.ms", settings.linger_ms.to_string())
        .set(
            "message.timeout.ms",
            settings.sync_timeout().as_millis().to_string(),
        );

    for (key, value) in &settings.extra {
        client_config.set(key, value);
    }

    client_config
}

/// Consumer settings: offsets are stored only for processed messages and
/// committed periodically by the client.
pub fn consumer_client_config(group_id: &str, config: &MessagingConfig) -> ClientConfig {
    let settings = &config.consumer;
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.commit.interval.ms",
            settings.auto_commit_interval_ms.to_string(),
        )
        .set("session.timeout.ms", settings.session_timeout_ms.to_string())
        .set("auto.offset.reset", settings.auto_offset_reset.as_str())
        .set("enable.partition.eof", "false");

    for (key, value) in &settings.extra {
        client_config.set(key, value);
    }

    client_config
}

struct KafkaTransport {
    producer: FutureProducer,
    max_retries: u32,
    retry_backoff: Duration,
}

impl KafkaTransport {
    fn build_record<'a>(record: &'a OutboundRecord) -> FutureRecord<'a, str, [u8]> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let mut future_record: FutureRecord<'a, str, [u8]> = FutureRecord::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(headers);

        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        future_record
    }
}

#[async_trait]
impl ProducerTransport for KafkaTransport {
    async fn send(&self, record: OutboundRecord) -> Result<PendingDelivery, BrokerError> {
        let mut delay = self.retry_backoff;
        let mut attempt = 0;

        // The local queue rejecting a record is retried with backoff; any
        // other enqueue error goes straight back to the caller.
        let delivery = loop {
            match self.producer.send_result(Self::build_record(&record)) {
                Ok(delivery) => break delivery,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _))
                    if attempt < self.max_retries =>
                {
                    attempt += 1;
                    warn!(
                        topic = %record.topic,
                        attempt,
                        max_retries = self.max_retries,
                        "producer queue full, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.retry_backoff * 10);
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    return Err(BrokerError::QueueFull);
                }
                Err((error, _)) => return Err(error.into()),
            }
        };

        let topic = record.topic;
        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(RecordMetadata {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((error, _message))) => Err(BrokerError::from(error)),
                Err(_) => Err(BrokerError::transport(
                    "delivery report dropped before completion",
                )),
            }
        }
        .boxed())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::transport(format!("flush task failed: {}", e)))??;
        Ok(())
    }
}

/// Logs offset commits made by the client on behalf of the group
struct GroupContext {
    group_id: String,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(
                group = %self.group_id,
                partitions = offsets.count(),
                "offsets committed"
            ),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(error) => warn!(group = %self.group_id, error = %error, "offset commit failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

struct KafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    group_id: String,
    member_id: String,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerGroupClient for KafkaGroupClient {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(&self, topic: &str) -> Result<Box<dyn GroupSession>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        self.consumer.subscribe(&[topic])?;

        Ok(Box::new(KafkaSession {
            consumer: Arc::clone(&self.consumer),
            topic: topic.to_string(),
            member_id: self.member_id.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let group_id = self.group_id.clone();
        tokio::task::spawn_blocking(move || {
            match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
                Err(error) => return Err(BrokerError::from(error)),
            }
            consumer.unsubscribe();
            debug!(group = %group_id, "kafka consumer left group");
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::transport(format!("close task failed: {}", e)))?
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    topic: String,
    member_id: String,
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn assignment(&self) -> Vec<i32> {
        self.consumer
            .assignment()
            .map(|list| {
                list.elements_for_topic(&self.topic)
                    .iter()
                    .map(|element| element.partition())
                    .collect()
            })
            .unwrap_or_default()
    }

    // Rebalances are handled inside the client, so a Kafka session only ends
    // when the consumer is closed.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, BrokerError>> {
        match self.consumer.recv().await {
            Ok(message) => {
                let headers = message
                    .headers()
                    .map(|headers| {
                        headers
                            .iter()
                            .filter_map(|header| {
                                header.value.map(|value| {
                                    (
                                        header.key.to_string(),
                                        String::from_utf8_lossy(value).into_owned(),
                                    )
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(Ok(InboundMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    headers,
                    timestamp: message
                        .timestamp()
                        .to_millis()
                        .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
                }))
            }
            Err(error) => Some(Err(error.into())),
        }
    }

    fn mark_processed(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.store_offsets(&offsets)?;
        Ok(())
    }

    fn release(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }
}
