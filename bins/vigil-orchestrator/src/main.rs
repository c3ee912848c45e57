//! # Vigil Orchestrator - Batch Pipeline Runner
//!
//! Runs the surveillance batch pipeline to completion, once per invocation:
//! validate landing files, run the warehouse transformation build, archive the
//! artifacts this run validated, generate the partner extract at the
//! configured hour, and write health markers. Scheduling (and the guarantee
//! that only one instance runs at a time) belongs to the deployment, not this
//! binary.
//!
//! ## Usage
//!
//! ```bash
//! LANDING_PATH=gs://surv-int/landing \
//! ARCHIVE_PATH=gs://surv-int/archive \
//! FAILED_PATH=gs://surv-int/failed \
//! TABLE_CONFIG_PATH=/app/source_specs \
//! vigil-orchestrator
//!
//! # Enable debug logging
//! RUST_LOG=debug vigil-orchestrator
//! ```
//!
//! Exit code 0 means every file validated and the transformation build was
//! clean; anything else exits 1.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_batch::dbt::DbtRunner;
use vigil_batch::extract::ExtractGenerator;
use vigil_batch::Orchestrator;
use vigil_core::audit::AuditWriter;
use vigil_core::clock::{SharedClock, SystemClock};
use vigil_core::config::{LoaderBackend, PipelineConfig};
use vigil_core::spec::SpecRegistry;
use vigil_core::storage::Storage;
use vigil_core::warehouse::memory::MemoryWarehouse;
use vigil_core::warehouse::SharedWarehouse;
use vigil_validate::Validator;

/// Command-line arguments for the batch pipeline runner
#[derive(Parser, Debug)]
#[command(name = "vigil-orchestrator")]
#[command(about = "Surveillance batch pipeline runner")]
struct Args {
    /// Override the source specs directory (defaults to TABLE_CONFIG_PATH)
    #[arg(long)]
    specs_dir: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "pipeline failed");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();
    let config = PipelineConfig::from_env()?;

    let specs_dir = args
        .specs_dir
        .unwrap_or_else(|| config.table_config_path.clone());
    let registry = Arc::new(SpecRegistry::load_dir(&specs_dir)?);

    let storage = Storage::from_paths(
        &config.landing_path,
        &config.staging_path,
        &config.archive_path,
        &config.failed_path,
        &config.extracts_path,
        &config.health_path,
    )?;
    let warehouse = build_warehouse(&config)?;
    let clock: SharedClock = Arc::new(SystemClock);
    let audit = AuditWriter::new(warehouse.clone(), config.control_dataset.clone());

    let validator = Validator::new(
        storage.clone(),
        registry,
        audit.clone(),
        clock.clone(),
        config.workers,
    );
    let dbt = DbtRunner::new(
        config.dbt_project_dir.clone(),
        config.dbt_profiles_dir.clone(),
        config.dbt_target.clone(),
        config.dbt_timeout_seconds,
        audit,
    );
    let extract = ExtractGenerator::new(
        warehouse,
        storage.clone(),
        clock.clone(),
        config.extract_format,
        config.extract_window_days,
        std::env::var("EXTRACT_TABLE").ok(),
    );

    let orchestrator = Orchestrator::new(
        storage,
        clock,
        validator,
        dbt,
        extract,
        config.extract_hour,
    );

    // Ctrl-C cancels cooperatively: in-flight files finish, pending ones are
    // skipped, and the run still archives what it validated.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling run");
            cancel_on_signal.cancel();
        }
    });

    let outcome = orchestrator.run(&cancel).await?;
    Ok(outcome.exit_code())
}

fn build_warehouse(config: &PipelineConfig) -> Result<SharedWarehouse> {
    match config.backend {
        LoaderBackend::DuckDb => {
            info!("using the embedded in-process warehouse engine");
            Ok(Arc::new(MemoryWarehouse::new()))
        }
        LoaderBackend::BigQuery => {
            // The managed-warehouse adapter ships with the deployment image
            // and is injected there; this binary only bundles the embedded
            // engine.
            anyhow::bail!("the BigQuery warehouse adapter is not bundled in this binary")
        }
    }
}
