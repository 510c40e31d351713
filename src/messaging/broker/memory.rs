//! In-process broker for tests and local runs.
//!
//! Topics are split into a fixed number of partitions; records with a key
//! land on the partition chosen by hashing the key, so per-key order holds.
//! Consumer groups track members, a generation counter and committed offsets.
//! A member joining or leaving bumps the generation, which ends every open
//! session of that group (a rebalance); partitions are then split
//! round-robin between the members that rejoin.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::infrastructure::config::{MessagingConfig, OffsetReset};
use crate::messaging::broker::{
    Broker, ConsumerGroupClient, GroupSession, PendingDelivery, ProducerTransport,
};
use crate::messaging::error::BrokerError;
use crate::messaging::message::{InboundMessage, OutboundRecord, RecordMetadata};

pub const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    members: Vec<String>,
    committed: HashMap<i32, i64>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    // keyed by (group id, topic)
    groups: HashMap<(String, String), GroupState>,
    failing_joins: usize,
    failing_polls: usize,
    failing_deliveries: usize,
    ack_delay: Option<Duration>,
    round_robin: usize,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    partitions: usize,
    next_member: AtomicU64,
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn partition_for_key(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// In-process broker shared by every client it creates
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                partitions: partitions.max(1),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.shared.partitions
    }

    /// Partition a record with this key is written to
    pub fn partition_for(&self, key: &str) -> i32 {
        partition_for_key(key, self.shared.partitions) as i32
    }

    /// Make the next `count` join attempts fail with a transport error
    pub fn fail_next_joins(&self, count: usize) {
        lock_state(&self.shared).failing_joins = count;
    }

    /// Make the next `count` polls of any open session fail with a transport error
    pub fn fail_next_polls(&self, count: usize) {
        lock_state(&self.shared).failing_polls = count;
    }

    /// Make the next `count` sends be rejected by the broker at ack time
    pub fn fail_next_deliveries(&self, count: usize) {
        lock_state(&self.shared).failing_deliveries = count;
    }

    /// Delay every acknowledgement by `delay` (records are still stored at once)
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        lock_state(&self.shared).ack_delay = delay;
    }

    /// Append a record directly, bypassing any producer
    pub fn produce(&self, record: OutboundRecord) -> RecordMetadata {
        let metadata = {
            let mut state = lock_state(&self.shared);
            Self::append(&mut state, self.shared.partitions, record)
        };
        self.shared.changed.notify_waiters();
        metadata
    }

    /// Every record of `topic`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<InboundMessage> {
        let state = lock_state(&self.shared);
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .flat_map(|(partition, records)| {
                        records.iter().enumerate().map(move |(offset, record)| {
                            to_inbound(topic, partition as i32, offset as i64, record)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `partition` of `topic`, if it committed one
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = lock_state(&self.shared);
        state
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Current members of `group` on `topic`
    pub fn members(&self, group: &str, topic: &str) -> Vec<String> {
        let state = lock_state(&self.shared);
        state
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    fn append(state: &mut State, partitions: usize, record: OutboundRecord) -> RecordMetadata {
        let partition = match &record.key {
            Some(key) => partition_for_key(key, partitions),
            None => {
                let partition = state.round_robin % partitions;
                state.round_robin = state.round_robin.wrapping_add(1);
                partition
            }
        };

        let log = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions]);

        log[partition].push(StoredRecord {
            key: record.key,
            payload: record.payload,
            headers: record.headers,
            timestamp: Utc::now(),
        });

        RecordMetadata {
            topic: record.topic,
            partition: partition as i32,
            offset: (log[partition].len() - 1) as i64,
        }
    }
}

impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn producer_transport(
        &self,
        _config: &MessagingConfig,
    ) -> Result<Arc<dyn ProducerTransport>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn consumer_group(
        &self,
        group_id: &str,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn ConsumerGroupClient>, BrokerError> {
        let member = self.shared.next_member.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryGroupClient {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            member_id: format!("{}-member-{}", group_id, member),
            offset_reset: config.consumer.auto_offset_reset,
            topics: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
}

impl MemoryProducer {
    fn store(&self, record: OutboundRecord) -> (Result<RecordMetadata, BrokerError>, Option<Duration>) {
        let mut state = lock_state(&self.shared);
        let delay = state.ack_delay;
        if state.failing_deliveries > 0 {
            state.failing_deliveries -= 1;
            return (
                Err(BrokerError::transport("injected delivery failure")),
                delay,
            );
        }
        (Ok(MemoryBroker::append(&mut state, self.shared.partitions, record)), delay)
    }
}

#[async_trait]
impl ProducerTransport for MemoryProducer {
    async fn send(&self, record: OutboundRecord) -> Result<PendingDelivery, BrokerError> {
        let (outcome, delay) = self.store(record);
        if outcome.is_ok() {
            self.shared.changed.notify_waiters();
        }

        Ok(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
        .boxed())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Consumer-group membership against a [`MemoryBroker`]
pub struct MemoryGroupClient {
    shared: Arc<Shared>,
    group_id: String,
    member_id: String,
    offset_reset: OffsetReset,
    topics: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryGroupClient {
    fn open_session(&self, topic: &str) -> Result<MemorySession, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut state = lock_state(&self.shared);
        if state.failing_joins > 0 {
            state.failing_joins -= 1;
            return Err(BrokerError::transport("injected join failure"));
        }

        let partitions = self.shared.partitions;
        let log_lengths: Vec<i64> = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
            .iter()
            .map(|records| records.len() as i64)
            .collect();

        let group = state
            .groups
            .entry((self.group_id.clone(), topic.to_string()))
            .or_default();

        let mut rebalanced = false;
        if !group.members.contains(&self.member_id) {
            group.members.push(self.member_id.clone());
            group.generation += 1;
            rebalanced = true;
        }

        let mut members = group.members.clone();
        members.sort();
        let index = members
            .iter()
            .position(|m| m == &self.member_id)
            .unwrap_or(0);

        let assigned: Vec<i32> = (0..partitions)
            .filter(|p| p % members.len() == index)
            .map(|p| p as i32)
            .collect();

        let cursors = assigned
            .iter()
            .map(|p| {
                let start = group.committed.get(p).copied().unwrap_or(match self.offset_reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => log_lengths[*p as usize],
                });
                (*p, start)
            })
            .collect();

        let session = MemorySession {
            shared: Arc::clone(&self.shared),
            group_id: self.group_id.clone(),
            topic: topic.to_string(),
            member_id: self.member_id.clone(),
            generation: group.generation,
            assigned,
            cursors,
            next_index: 0,
        };
        drop(state);

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());

        if rebalanced {
            self.shared.changed.notify_waiters();
        }
        Ok(session)
    }

    fn leave(&self) {
        let topics: Vec<String> = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut state = lock_state(&self.shared);
        for topic in topics {
            if let Some(group) = state.groups.get_mut(&(self.group_id.clone(), topic)) {
                let before = group.members.len();
                group.members.retain(|m| m != &self.member_id);
                if group.members.len() != before {
                    group.generation += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerGroupClient for MemoryGroupClient {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(&self, topic: &str) -> Result<Box<dyn GroupSession>, BrokerError> {
        let session = self.open_session(topic)?;
        debug!(
            group = %self.group_id,
            member = %self.member_id,
            topic = %topic,
            generation = session.generation,
            partitions = ?session.assigned,
            "joined consumer group"
        );
        Ok(Box::new(session))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.leave();
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

enum Poll {
    Ended,
    Idle,
    Delivered(InboundMessage),
}

struct MemorySession {
    shared: Arc<Shared>,
    group_id: String,
    topic: String,
    member_id: String,
    generation: u64,
    assigned: Vec<i32>,
    cursors: HashMap<i32, i64>,
    next_index: usize,
}

impl MemorySession {
    fn group_key(&self) -> (String, String) {
        (self.group_id.clone(), self.topic.clone())
    }

    fn poll_once(&mut self) -> Poll {
        let shared = Arc::clone(&self.shared);
        let state = lock_state(&shared);

        let current = match state.groups.get(&self.group_key()) {
            Some(group) => {
                group.generation == self.generation && group.members.contains(&self.member_id)
            }
            None => false,
        };
        if !current {
            return Poll::Ended;
        }

        let Some(log) = state.topics.get(&self.topic) else {
            return Poll::Idle;
        };

        let count = self.assigned.len();
        for step in 0..count {
            let index = (self.next_index + step) % count;
            let partition = self.assigned[index];
            let cursor = self.cursors.get(&partition).copied().unwrap_or(0);

            if let Some(record) = log[partition as usize].get(cursor as usize) {
                self.cursors.insert(partition, cursor + 1);
                self.next_index = (index + 1) % count;
                return Poll::Delivered(to_inbound(&self.topic, partition, cursor, record));
            }
        }
        Poll::Idle
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn assignment(&self) -> Vec<i32> {
        self.assigned.clone()
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, BrokerError>> {
        let shared = Arc::clone(&self.shared);
        {
            let mut state = lock_state(&shared);
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                return Some(Err(BrokerError::transport("injected poll failure")));
            }
        }

        loop {
            let notified = shared.changed.notified();
            tokio::pin!(notified);
            // register before polling so a concurrent append cannot be missed
            notified.as_mut().enable();

            match self.poll_once() {
                Poll::Ended => return None,
                Poll::Delivered(message) => return Some(Ok(message)),
                Poll::Idle => notified.await,
            }
        }
    }

    fn mark_processed(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        let key = self.group_key();
        let mut state = lock_state(&self.shared);
        let group = state
            .groups
            .get_mut(&key)
            .filter(|g| g.generation == self.generation)
            .ok_or_else(|| {
                BrokerError::transport(format!(
                    "generation {} of group '{}' is stale, partition {} was revoked",
                    self.generation, self.group_id, message.partition
                ))
            })?;

        let next = message.offset + 1;
        let committed = group.committed.entry(message.partition).or_insert(0);
        if next > *committed {
            *committed = next;
        }
        Ok(())
    }

    fn release(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        match self.cursors.get_mut(&message.partition) {
            Some(cursor) => {
                if message.offset < *cursor {
                    *cursor = message.offset;
                }
                Ok(())
            }
            None => Err(BrokerError::transport(format!(
                "partition {} is not assigned to {}",
                message.partition, self.member_id
            ))),
        }
    }
}

fn to_inbound(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: record.key.as_ref().map(|k| k.as_bytes().to_vec()),
        payload: record.payload.clone(),
        headers: record.headers.clone(),
        timestamp: Some(record.timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, key: &str, body: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: Some(key.to_string()),
            payload: body.as_bytes().to_vec(),
            headers: HashMap::new(),
        }
    }

    async fn next(session: &mut Box<dyn GroupSession>) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(1), session.next_message())
            .await
            .expect("message expected")
            .expect("session ended unexpectedly")
            .expect("transport error")
    }

    #[test]
    fn test_same_key_same_partition() {
        let broker = MemoryBroker::with_partitions(4);
        let first = broker.produce(record("t", "user-1", "a"));
        let second = broker.produce(record("t", "user-1", "b"));

        assert_eq!(first.partition, second.partition);
        assert_eq!(first.partition, broker.partition_for("user-1"));
        assert_eq!(second.offset, first.offset + 1);
        assert_eq!(broker.records("t").len(), 2);
    }

    #[tokio::test]
    async fn test_session_delivers_in_partition_order() {
        let broker = MemoryBroker::with_partitions(1);
        for i in 0..5 {
            broker.produce(record("t", "k", &i.to_string()));
        }

        let client = broker
            .consumer_group("g", &MessagingConfig::default())
            .unwrap();
        let mut session = client.join("t").await.unwrap();

        for i in 0..5 {
            let message = next(&mut session).await;
            assert_eq!(message.offset, i);
            assert_eq!(message.payload, i.to_string().into_bytes());
        }
    }

    #[tokio::test]
    async fn test_release_redelivers_and_mark_commits() {
        let broker = MemoryBroker::with_partitions(1);
        broker.produce(record("t", "k", "first"));
        broker.produce(record("t", "k", "second"));

        let client = broker
            .consumer_group("g", &MessagingConfig::default())
            .unwrap();
        let mut session = client.join("t").await.unwrap();

        let first = next(&mut session).await;
        session.release(&first).unwrap();
        let again = next(&mut session).await;
        assert_eq!(again.offset, first.offset);
        assert_eq!(broker.committed_offset("g", "t", 0), None);

        session.mark_processed(&again).unwrap();
        assert_eq!(broker.committed_offset("g", "t", 0), Some(1));

        let second = next(&mut session).await;
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_rejoin_resumes_from_committed_offset() {
        let broker = MemoryBroker::with_partitions(1);
        broker.produce(record("t", "k", "a"));
        broker.produce(record("t", "k", "b"));

        let config = MessagingConfig::default();
        let client = broker.consumer_group("g", &config).unwrap();
        let mut session = client.join("t").await.unwrap();
        let first = next(&mut session).await;
        session.mark_processed(&first).unwrap();
        client.close().await.unwrap();

        let replacement = broker.consumer_group("g", &config).unwrap();
        let mut session = replacement.join("t").await.unwrap();
        let message = next(&mut session).await;
        assert_eq!(message.offset, 1);
    }

    #[tokio::test]
    async fn test_new_member_triggers_rebalance() {
        let broker = MemoryBroker::with_partitions(2);
        let config = MessagingConfig::default();

        let a = broker.consumer_group("g", &config).unwrap();
        let mut session_a = a.join("t").await.unwrap();
        assert_eq!(session_a.assignment(), vec![0, 1]);

        let b = broker.consumer_group("g", &config).unwrap();
        let session_b = b.join("t").await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(1), session_a.next_message())
            .await
            .expect("old session should end");
        assert!(ended.is_none());

        let session_a = a.join("t").await.unwrap();
        let mut split = session_a.assignment();
        split.extend(session_b.assignment());
        split.sort();
        assert_eq!(split, vec![0, 1]);
        assert_eq!(session_a.assignment().len(), 1);
        assert_eq!(broker.members("g", "t").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_join_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_joins(2);
        let client = broker
            .consumer_group("g", &MessagingConfig::default())
            .unwrap();

        assert!(client.join("t").await.is_err());
        assert!(client.join("t").await.is_err());
        assert!(client.join("t").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_poll_failure_keeps_position() {
        let broker = MemoryBroker::with_partitions(1);
        broker.produce(record("t", "k", "a"));
        broker.fail_next_polls(1);

        let client = broker
            .consumer_group("g", &MessagingConfig::default())
            .unwrap();
        let mut session = client.join("t").await.unwrap();

        let failed = session.next_message().await.expect("session ended unexpectedly");
        assert!(matches!(failed, Err(BrokerError::Transport(ref m)) if m == "injected poll failure"));

        let mut session = client.join("t").await.unwrap();
        let message = next(&mut session).await;
        assert_eq!(message.offset, 0);
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let broker = MemoryBroker::with_partitions(1);
        broker.produce(record("t", "k", "old"));

        let mut config = MessagingConfig::default();
        config.consumer.auto_offset_reset = OffsetReset::Latest;
        let client = broker.consumer_group("g", &config).unwrap();
        let mut session = client.join("t").await.unwrap();

        broker.produce(record("t", "k", "new"));
        let message = next(&mut session).await;
        assert_eq!(message.payload, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_closed_client_cannot_join() {
        let broker = MemoryBroker::new();
        let client = broker
            .consumer_group("g", &MessagingConfig::default())
            .unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.join("t").await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_delivery_failure_injection() {
        let broker = MemoryBroker::new();
        let transport = broker
            .producer_transport(&MessagingConfig::default())
            .unwrap();
        broker.fail_next_deliveries(1);

        let pending = transport.send(record("t", "k", "x")).await.unwrap();
        assert!(pending.await.is_err());
        assert!(broker.records("t").is_empty());

        let pending = transport.send(record("t", "k", "y")).await.unwrap();
        let metadata = pending.await.unwrap();
        assert_eq!(metadata.topic, "t");
        assert_eq!(broker.records("t").len(), 1);
    }
}
