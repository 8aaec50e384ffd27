//! mqlink demo - produce to and consume from a queue
//!
//! `produce` sends a timestamped message every interval, `consume` logs
//! every message it receives, `loopback` runs both against the in-memory
//! broker. Each command stops after `--duration` seconds or on Ctrl-C.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use mqlink_core::{CancellationToken, Consumer, Producer};
use mqlink_transport::{MemoryBroker, Transport};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "mqlink")]
#[command(about = "Reliable producer/consumer demos")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Queue name (overrides MQLINK_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Broker URL (overrides MQLINK_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log filter, e.g. `info` or `mqlink_core=debug`
    #[arg(long, default_value = "info", global = true, env = "RUST_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message every interval
    Produce {
        /// Seconds to run
        #[arg(long, default_value_t = 18)]
        duration: u64,
        /// Milliseconds between messages
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Log every received message and acknowledge it
    Consume {
        /// Seconds to run
        #[arg(long, default_value_t = 15)]
        duration: u64,
    },
    /// Produce and consume through the in-memory broker
    Loopback {
        /// Messages to send
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let mut settings = Settings::load()?;
    if let Some(queue) = cli.queue {
        settings.queue = queue;
    }
    if let Some(url) = cli.url {
        settings.url = url;
    }
    settings.client.validate()?;

    match cli.command {
        Commands::Produce {
            duration,
            interval_ms,
        } => {
            let transport = broker_transport()?;
            produce(
                transport,
                &settings,
                Duration::from_secs(duration),
                Duration::from_millis(interval_ms),
            )
            .await
        }
        Commands::Consume { duration } => {
            let transport = broker_transport()?;
            consume(transport, &settings, Duration::from_secs(duration)).await
        }
        Commands::Loopback { count } => loopback(&settings, count).await,
    }
}

fn init_logging(filter: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| "mqlink=info,mqlink_core=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(feature = "amqp")]
fn broker_transport() -> anyhow::Result<Arc<dyn Transport>> {
    Ok(Arc::new(mqlink_transport::AmqpTransport::new()))
}

#[cfg(not(feature = "amqp"))]
fn broker_transport() -> anyhow::Result<Arc<dyn Transport>> {
    anyhow::bail!("built without the `amqp` feature; only `loopback` is available")
}

/// Cancel the returned token after `duration` or on Ctrl-C
fn stop_after(duration: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(duration) => info!("Demo time is up"),
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
        trigger.cancel();
    });
    token
}

// ==================== Commands ====================

async fn produce(
    transport: Arc<dyn Transport>,
    settings: &Settings,
    duration: Duration,
    interval: Duration,
) -> anyhow::Result<()> {
    let producer = Arc::new(Producer::new(
        transport,
        settings.endpoint(),
        settings.client.clone(),
    )?);
    let token = stop_after(duration);

    let ticker = {
        let producer = Arc::clone(&producer);
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                let message = format!("Hello World --- {}", chrono::Utc::now().to_rfc3339());
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = producer.send_string(message.clone()) => info!(%message, "Enqueued"),
                }
            }
            info!("Demo ticker is stopping");
        })
    };

    producer.run_with(&token).await;
    ticker.await?;
    producer.close().await;
    info!(pending = producer.pending(), "Demo is ending ...");
    Ok(())
}

async fn consume(
    transport: Arc<dyn Transport>,
    settings: &Settings,
    duration: Duration,
) -> anyhow::Result<()> {
    let consumer = Consumer::new(transport, settings.endpoint(), settings.client.backoff.clone());
    let token = stop_after(duration);

    consumer
        .run_with(&token, |payload: Bytes| async move {
            info!(message = %String::from_utf8_lossy(&payload), "Received a message");
            true
        })
        .await;
    consumer.close().await;
    Ok(())
}

async fn loopback(settings: &Settings, count: usize) -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let endpoint = settings.endpoint();
    let producer = Arc::new(Producer::new(
        Arc::new(broker.clone()),
        endpoint.clone(),
        settings.client.clone(),
    )?);
    let consumer = Arc::new(Consumer::new(
        Arc::new(broker.clone()),
        endpoint,
        settings.client.backoff.clone(),
    ));
    let token = CancellationToken::new();
    let (received_tx, mut received_rx) = tokio::sync::mpsc::unbounded_channel();

    let producer_task = {
        let producer = Arc::clone(&producer);
        let token = token.clone();
        tokio::spawn(async move { producer.run_with(&token).await })
    };
    let consumer_task = {
        let consumer = Arc::clone(&consumer);
        let token = token.clone();
        tokio::spawn(async move {
            consumer
                .run_with(&token, move |payload: Bytes| {
                    let _ = received_tx.send(payload);
                    async { true }
                })
                .await
        })
    };

    for i in 0..count {
        producer.send_string(format!("loopback {i}")).await;
    }
    for _ in 0..count {
        if let Some(payload) = received_rx.recv().await {
            info!(message = %String::from_utf8_lossy(&payload), "Received a message");
        }
    }

    token.cancel();
    producer_task.await?;
    consumer_task.await?;

    let stats = broker.stats();
    info!(
        published = stats.publish_attempts,
        acked = stats.acks,
        "Loopback finished"
    );
    Ok(())
}
