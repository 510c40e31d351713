use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::infrastructure::config::MessagingConfig;
use crate::messaging::broker::Broker;
use crate::messaging::consumer::TopicConsumer;
use crate::messaging::context::Context;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::handler::HandlerFactory;
use crate::messaging::manager::ConsumerManager;
use crate::messaging::producer::Producer;

/// Producer plus consumer manager over one broker.
///
/// The producer is ready as soon as the service is built; consumers run
/// between [`MessagingService::start`] and [`MessagingService::stop`].
pub struct MessagingService {
    config: MessagingConfig,
    broker: Arc<dyn Broker>,
    producer: Arc<Producer>,
    consumers: Arc<ConsumerManager>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MessagingService {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: MessagingConfig,
        broker: Arc<dyn Broker>,
        factory: &dyn HandlerFactory,
    ) -> MessagingResult<Self> {
        config.validate()?;

        let handlers = factory.create_handlers(&config)?;
        let transport = broker.producer_transport(&config)?;
        let producer = Arc::new(Producer::new(transport, &config));
        let consumers = Arc::new(ConsumerManager::new(handlers, broker.as_ref(), &config)?);

        info!(
            broker = broker.name(),
            brokers = %config.bootstrap_servers(),
            consumers = consumers.len(),
            "messaging service created"
        );

        Ok(Self {
            config,
            broker,
            producer,
            consumers,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start every consumer
    pub fn start(&self, ctx: &Context) -> MessagingResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MessagingError::InvalidState {
                operation: "start".to_string(),
                state: "stopped".to_string(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::InvalidState {
                operation: "start".to_string(),
                state: "running".to_string(),
            });
        }

        self.consumers.start(ctx);
        info!(topics = ?self.consumers.topics(), "messaging service started");
        Ok(())
    }

    /// Stop the consumers, then close the producer. Both steps always run;
    /// their errors are combined. Calling it again is a no-op.
    pub async fn stop(&self) -> MessagingResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        for result in [self.consumers.stop().await, self.producer.close().await] {
            match result {
                Ok(()) => {}
                Err(MessagingError::Shutdown(nested)) => errors.extend(nested),
                Err(e) => errors.push(e),
            }
        }

        info!(errors = errors.len(), "messaging service stopped");
        MessagingError::aggregate(errors)
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    pub fn consumers(&self) -> &Arc<ConsumerManager> {
        &self.consumers
    }

    pub fn get_consumer(&self, topic: &str) -> Option<Arc<TopicConsumer>> {
        self.consumers.get_consumer(topic)
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }
}
