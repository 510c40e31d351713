use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use user_events::cli::args::{Args, BrokerKind, Command, ConsumeArgs, PublishArgs};
use user_events::infrastructure::config::{ConfigLoader, MessagingConfig};
use user_events::infrastructure::logging::{setup_logging, LogOutput, LoggingConfig};
use user_events::messaging::{
    Broker, Context, LoggingHandlerFactory, MemoryBroker, MessageHandler, MessagingService,
    TopicRouter,
};

#[cfg(feature = "messaging-kafka")]
fn kafka_broker() -> anyhow::Result<Arc<dyn Broker>> {
    Ok(Arc::new(user_events::messaging::KafkaBroker::new()))
}

#[cfg(not(feature = "messaging-kafka"))]
fn kafka_broker() -> anyhow::Result<Arc<dyn Broker>> {
    anyhow::bail!("Kafka support not enabled. Rebuild with the 'messaging-kafka' feature or pass --broker memory.")
}

fn create_broker(kind: BrokerKind) -> anyhow::Result<Arc<dyn Broker>> {
    match kind {
        BrokerKind::Kafka => kafka_broker(),
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}

fn print_topics(config: &MessagingConfig) {
    let router = TopicRouter::new(config.topics.clone());
    for (kind, topic) in router.table() {
        println!("{:<24} {:<24} {}", kind.as_str(), kind.route_key(), topic);
    }
}

async fn handle_publish(
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    publish: &PublishArgs,
) -> anyhow::Result<()> {
    let event = publish.build_event()?;
    let no_handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
    let service = MessagingService::new(config, broker, &no_handlers)?;
    let producer = service.producer();
    let ctx = Context::background();

    let outcome = if publish.async_publish {
        producer.publish_async(&ctx, &event).await.map(|()| {
            println!("queued {} ({})", event.id(), event.kind());
        })
    } else {
        producer.publish_sync(&ctx, &event).await.map(|metadata| {
            println!(
                "published {} ({}) to {}:{}:{}",
                event.id(),
                event.kind(),
                metadata.topic,
                metadata.partition,
                metadata.offset
            );
        })
    };

    // 先停止服务，确保异步队列中的消息已发送
    service.stop().await?;
    outcome?;
    Ok(())
}

async fn handle_consume(
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    consume: &ConsumeArgs,
) -> anyhow::Result<()> {
    let factory = LoggingHandlerFactory::new(consume.topics.clone());
    let service = MessagingService::new(config, broker, &factory)?;

    service.start(&Context::background())?;
    info!(topics = ?service.consumers().topics(), "consuming, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    service.stop().await?;
    for (topic, stats) in service.consumers().stats() {
        info!(
            topic = %topic,
            received = stats.received,
            processed = stats.processed,
            failed = stats.failed,
            "consumer summary"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging(LoggingConfig {
        level: if args.verbose { Level::DEBUG } else { Level::INFO },
        format: args.log_format,
        output: LogOutput::Stderr,
        ..LoggingConfig::default()
    })?;

    let config = ConfigLoader::standard(args.config.clone()).load()?;

    match &args.command {
        Command::Topics => {
            print_topics(&config);
            Ok(())
        }
        Command::Publish(publish) => handle_publish(create_broker(args.broker)?, config, publish).await,
        Command::Consume(consume) => handle_consume(create_broker(args.broker)?, config, consume).await,
    }
}
