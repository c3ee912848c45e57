//! Phase sequencing for one batch run.
//!
//! Phases run strictly in order: validation, transformation, archival,
//! extract (only at the configured UTC hour), health markers. A
//! transformation failure does not short-circuit archival; the files were
//! validated and staged in this run, and leaving them behind would reprocess
//! them next run. Overall success requires a clean validation and a clean
//! transformation build.

use chrono::Timelike;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_core::clock::{artifact_timestamp, SharedClock};
use vigil_core::storage::Storage;
use vigil_validate::{ValidationRun, Validator};

use crate::archive::{archive_validated, ArchiveResult};
use crate::dbt::{DbtResult, DbtRunner};
use crate::extract::{ExtractGenerator, ExtractResult};
use crate::health::{write_markers, RunMarker};

/// Everything one run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub validation: ValidationRun,
    pub transformation: DbtResult,
    pub archival: ArchiveResult,
    pub extract: Option<ExtractResult>,
}

impl RunOutcome {
    /// Process exit code: zero only for a fully clean run.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

/// Sequences the batch pipeline phases.
pub struct Orchestrator {
    storage: Storage,
    clock: SharedClock,
    validator: Validator,
    dbt: DbtRunner,
    extract: ExtractGenerator,
    extract_hour: u32,
}

impl Orchestrator {
    pub fn new(
        storage: Storage,
        clock: SharedClock,
        validator: Validator,
        dbt: DbtRunner,
        extract: ExtractGenerator,
        extract_hour: u32,
    ) -> Orchestrator {
        Orchestrator {
            storage,
            clock,
            validator,
            dbt,
            extract,
            extract_hour,
        }
    }

    /// Run the pipeline once, end to end.
    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunOutcome> {
        let started = self.clock.monotonic();
        let run_id = format!("run_{}", artifact_timestamp(self.clock.now_utc()));
        info!(run_id, "pipeline started");

        // Phase 1: validation.
        info!(run_id, step = "validation", "step started");
        let validation = self.validator.run(&run_id, cancel).await?;
        if validation.files_failed > 0 {
            warn!(
                passed = validation.files_passed,
                failed = validation.files_failed,
                "validation had failures"
            );
        }
        gauge!("surveillance.files.passed", validation.files_passed as f64);
        gauge!("surveillance.files.failed", validation.files_failed as f64);
        gauge!("surveillance.rows.validated", validation.total_rows as f64);

        // Phase 2: transformation build.
        info!(run_id, step = "transformation", "step started");
        let transformation = self.dbt.run().await;
        if !transformation.success {
            error!(errors = ?transformation.errors, "transformation build failed");
            counter!("surveillance.pipeline.dbt_failures", 1);
            // Archival still runs: these files must not be reprocessed.
        }
        gauge!(
            "surveillance.rows.processed",
            transformation.rows_affected as f64
        );

        // Phase 3: archive exactly what this run validated.
        info!(run_id, step = "archive", "step started");
        let archival = archive_validated(
            &self.storage,
            &validation.validated_output_paths,
            self.clock.now_utc(),
        )
        .await?;

        // Phase 4: extract, only at the configured hour.
        let current_hour = self.clock.now_utc().hour();
        let extract = if current_hour == self.extract_hour {
            info!(run_id, step = "extract", "step started");
            match self.extract.run().await {
                Ok(result) => {
                    gauge!("surveillance.extract.rows", result.row_count as f64);
                    Some(result)
                }
                Err(e) => {
                    error!(error = %e, "extract generation failed");
                    None
                }
            }
        } else {
            info!(current_hour, extract_hour = self.extract_hour, "extract skipped");
            None
        };

        // Phase 5: markers and final metrics.
        let success = validation.files_failed == 0 && transformation.success;
        let duration = started.elapsed().as_secs_f64();
        let marker = RunMarker {
            run_id: run_id.clone(),
            timestamp: self.clock.now_utc(),
            success,
            files_passed: validation.files_passed,
            files_failed: validation.files_failed,
            rows_validated: validation.total_rows,
            rows_quarantined: validation.quarantined_rows,
            transformation_success: transformation.success,
            models_failed: transformation.models_failed,
            files_archived: archival.files_moved,
            extract_rows: extract.as_ref().map(|e| e.row_count),
            duration_seconds: duration,
        };
        write_markers(&self.storage, &marker).await;

        counter!("surveillance.pipeline.runs", 1);
        if !success {
            counter!("surveillance.pipeline.failures", 1);
        }
        info!(run_id, success, duration_seconds = duration, "pipeline complete");

        Ok(RunOutcome {
            run_id,
            success,
            validation,
            transformation,
            archival,
            extract,
        })
    }
}
