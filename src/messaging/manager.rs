use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, info};

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::broker::Broker;
use crate::messaging::consumer::{ConsumerStats, TopicConsumer};
use crate::messaging::context::Context;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::handler::MessageHandler;
use crate::messaging::router::TopicRouter;

/// Supervises one [`TopicConsumer`] per handler, keyed by physical topic.
///
/// Each consumer runs and fails on its own: a wedged handler on one topic
/// does not hold up consumption of another.
pub struct ConsumerManager {
    consumers: BTreeMap<String, Arc<TopicConsumer>>,
    router: TopicRouter,
}

impl ConsumerManager {
    /// Build a consumer for every handler. Two handlers resolving to the same
    /// topic are rejected.
    pub fn new(
        handlers: Vec<Arc<dyn MessageHandler>>,
        broker: &dyn Broker,
        config: &MessagingConfig,
    ) -> MessagingResult<Self> {
        let router = TopicRouter::new(config.topics.clone());
        let mut consumers = BTreeMap::new();

        for handler in handlers {
            let topic = router.resolve(handler.topic_name()).to_string();
            if consumers.contains_key(&topic) {
                return Err(MessagingError::DuplicateTopic(topic));
            }

            let group = match handler.consumer_group().trim() {
                "" => config.consumer_group.as_str(),
                group => group,
            };
            let client = broker.consumer_group(group, config)?;

            let consumer = TopicConsumer::new(topic.as_str(), handler, client, &config.consumer);
            consumers.insert(topic, Arc::new(consumer));
        }

        Ok(Self { consumers, router })
    }

    /// Start every consumer. A consumer that fails to start is logged and
    /// skipped; the others start regardless.
    pub fn start(&self, ctx: &Context) {
        for (topic, consumer) in &self.consumers {
            if let Err(e) = consumer.start(ctx) {
                error!(topic = %topic, group = %consumer.group(), error = %e, "failed to start consumer");
            }
        }
        info!(consumers = self.consumers.len(), "consumer manager started");
    }

    /// Cancel every consumer, wait for all workers, then close every client.
    /// Errors are collected; no step is skipped because another failed.
    pub async fn stop(&self) -> MessagingResult<()> {
        for consumer in self.consumers.values() {
            consumer.signal_stop();
        }

        let mut errors = Vec::new();

        let waited = join_all(self.consumers.values().map(|consumer| consumer.wait())).await;
        errors.extend(waited.into_iter().filter_map(Result::err));

        let closed = join_all(self.consumers.values().map(|consumer| consumer.close())).await;
        errors.extend(closed.into_iter().filter_map(Result::err));

        info!(
            consumers = self.consumers.len(),
            errors = errors.len(),
            "consumer manager stopped"
        );
        MessagingError::aggregate(errors)
    }

    /// Look up a consumer by physical topic or route key
    pub fn get_consumer(&self, topic: &str) -> Option<Arc<TopicConsumer>> {
        self.consumers
            .get(topic)
            .or_else(|| self.consumers.get(self.router.resolve(topic)))
            .cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    pub fn stats(&self) -> Vec<(String, ConsumerStats)> {
        self.consumers
            .iter()
            .map(|(topic, consumer)| (topic.clone(), consumer.metrics()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
