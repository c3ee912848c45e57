//! # Vigil Bridge - Streaming Bridge Daemon
//!
//! Binds the Kafka consumer and the Pub/Sub publisher to the streaming bridge
//! and runs it until a shutdown signal arrives. SIGINT and SIGTERM both
//! trigger a graceful drain: polling stops, the publish loop gets up to 30
//! seconds to empty the buffer, acknowledged offsets are committed one last
//! time, and the process exits 0. Fatal initialisation errors exit non-zero.
//!
//! ## Usage
//!
//! ```bash
//! KAFKA_BROKERS=broker:9092 KAFKA_TOPIC=trades \
//! PROJECT_ID=surv-int PUBSUB_TOPIC=trades-out \
//! vigil-bridge
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::clock::SystemClock;
use vigil_core::config::BridgeConfig;
use vigil_stream::{KafkaBridgeConsumer, PubSubPublisher, StreamingBridge};

/// Command-line arguments for the bridge daemon
#[derive(Parser, Debug)]
#[command(name = "vigil-bridge")]
#[command(about = "Kafka to Pub/Sub streaming bridge")]
struct Args {
    /// Print the resolved configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = BridgeConfig::from_env().context("load bridge configuration")?;

    if args.check_config {
        println!("{config:#?}");
        return Ok(());
    }

    let consumer = Arc::new(
        KafkaBridgeConsumer::new(&config)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("create kafka consumer")?,
    );
    let publisher = Arc::new(
        PubSubPublisher::new(&config, std::env::var("PUBSUB_AUTH_TOKEN").ok())
            .context("create pub/sub publisher")?,
    );

    let bridge = StreamingBridge::new(config, consumer, publisher, Arc::new(SystemClock));

    let shutdown = bridge.shutdown_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    bridge.run().await
}
