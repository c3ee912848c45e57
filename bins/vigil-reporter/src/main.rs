//! # Vigil Reporter - Regulatory Reporting Service
//!
//! HTTP service in front of the reference cache and the regulator submitter.
//! Construction is a plain function returning a router, so the binary here is
//! wiring only: configuration, the warehouse client, the outbound transport,
//! an initial cache load, the periodic refresh task, and the listener.
//!
//! ## Endpoints
//!
//! - `GET  /health` - 200 healthy / 503 degraded (stale cache)
//! - `POST /submit` - submit one regulatory event
//! - `POST /admin/refresh-cache?force=true|false`
//! - `GET  /admin/cache-status`
//!
//! ## Usage
//!
//! ```bash
//! REGULATOR_API_URL=https://regulator.example/api/reports \
//! REGULATOR_API_KEY=... \
//! vigil-reporter
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::clock::SystemClock;
use vigil_core::config::ReporterConfig;
use vigil_core::warehouse::memory::MemoryWarehouse;
use vigil_report::submit::HttpTransport;
use vigil_report::{build_reporter, http::spawn_refresh_task, router};

/// Command-line arguments for the reporter service
#[derive(Parser, Debug)]
#[command(name = "vigil-reporter")]
#[command(about = "Regulatory reporter HTTP service")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ReporterConfig::from_env().context("load reporter configuration")?;

    // The managed-warehouse adapter is injected by the deployment image; this
    // binary bundles the embedded engine for local runs.
    let warehouse = Arc::new(MemoryWarehouse::new());
    let transport = Arc::new(
        HttpTransport::new(
            config.regulator_api_url.clone(),
            config.regulator_api_key.clone(),
        )
        .context("create regulator transport")?,
    );

    let reporter = build_reporter(&config, warehouse, transport, Arc::new(SystemClock)).await;
    let refresh_task = spawn_refresh_task(
        &reporter.cache,
        Duration::from_secs(config.refresh_interval_seconds),
    );

    let app = router(reporter);
    let addr = format!("{}:{}", args.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "reporter listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serve reporter")?;

    refresh_task.abort();
    Ok(())
}
