//! The file validation engine.
//!
//! Lists the landing area, matches each object to a source spec (first match
//! in registry order wins), parses and validates, reconciles control-file
//! counts, stages a verified parquet artifact, and only then deletes the
//! source object. Each file is independent: a worker pool of `workers` tasks
//! processes files end-to-end with no cross-file ordering guarantee.
//!
//! The run result carries `validated_output_paths`, the set of staging paths
//! whose artifact was verified at the moment the source was deleted. The
//! batch orchestrator archives exactly this set and nothing else.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_core::audit::{AuditWriter, ValidationAudit};
use vigil_core::clock::{artifact_timestamp, SharedClock};
use vigil_core::spec::{ControlFileSpec, SourceSpec, SpecRegistry};
use vigil_core::storage::{Area, Storage};

use crate::control::expected_row_count;
use crate::parsers::parse_and_validate;
use crate::rules::compile_rules;
use crate::staging::stage_rows;

/// Result of validating a single file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub source_name: String,
    pub file_path: String,
    pub passed: bool,
    pub row_count: i64,
    pub expected_row_count: Option<i64>,
    pub failure_reason: Option<String>,
    pub quarantined_rows: i64,
    pub output_path: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub duration_seconds: f64,
}

/// Result of a whole validation run.
#[derive(Debug)]
pub struct ValidationRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub files_passed: usize,
    pub files_failed: usize,
    pub total_rows: i64,
    pub quarantined_rows: i64,
    /// Staging-relative paths of verified artifacts produced by this run.
    pub validated_output_paths: BTreeSet<String>,
    pub outcomes: Vec<FileOutcome>,
}

impl ValidationRun {
    pub fn all_passed(&self) -> bool {
        self.files_failed == 0
    }
}

struct Processed {
    row_count: i64,
    quarantined_rows: i64,
    expected_row_count: Option<i64>,
    staged_full: String,
    file_size_bytes: i64,
}

/// Validates landing files against the spec registry.
#[derive(Clone)]
pub struct Validator {
    storage: Storage,
    registry: Arc<SpecRegistry>,
    audit: AuditWriter,
    clock: SharedClock,
    workers: usize,
}

impl Validator {
    pub fn new(
        storage: Storage,
        registry: Arc<SpecRegistry>,
        audit: AuditWriter,
        clock: SharedClock,
        workers: usize,
    ) -> Validator {
        Validator {
            storage,
            registry,
            audit,
            clock,
            workers: workers.max(1),
        }
    }

    /// Validate every data file currently in landing.
    pub async fn run(&self, run_id: &str, cancel: &CancellationToken) -> Result<ValidationRun> {
        let started_at = self.clock.now_utc();
        let listed = self
            .storage
            .list(Area::Landing)
            .await
            .context("list landing area")?;

        let mut files = Vec::new();
        for meta in listed {
            let Some(rel) = self.storage.relative(Area::Landing, &meta.location) else {
                continue;
            };
            if rel.ends_with('/') || self.is_sidecar(&rel) {
                continue;
            }
            files.push(rel);
        }
        info!(count = files.len(), run_id, "files found in landing");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();
        for rel in files {
            let this = self.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                // Cooperative cancellation at the file boundary: files already
                // in flight complete, pending ones are skipped.
                if cancel.is_cancelled() {
                    return None;
                }
                Some(this.validate_file(rel).await)
            });
        }

        let mut run = ValidationRun {
            run_id: run_id.to_string(),
            started_at,
            files_passed: 0,
            files_failed: 0,
            total_rows: 0,
            quarantined_rows: 0,
            validated_output_paths: BTreeSet::new(),
            outcomes: Vec::new(),
        };

        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "validation worker panicked");
                    run.files_failed += 1;
                    continue;
                }
            };

            self.audit
                .log_validation(ValidationAudit {
                    run_id: run_id.to_string(),
                    source_name: outcome.source_name.clone(),
                    file_path: outcome.file_path.clone(),
                    file_size_bytes: outcome.file_size_bytes,
                    row_count: outcome.row_count,
                    expected_row_count: outcome.expected_row_count,
                    passed: outcome.passed,
                    failure_reason: outcome.failure_reason.clone(),
                    quarantined_rows: outcome.quarantined_rows,
                    output_path: outcome.output_path.clone(),
                    duration_seconds: outcome.duration_seconds,
                })
                .await;

            if outcome.passed {
                run.files_passed += 1;
                run.total_rows += outcome.row_count;
                run.quarantined_rows += outcome.quarantined_rows;
                if let Some(path) = &outcome.output_path {
                    if let Some(rel) = path.strip_prefix(&format!(
                        "{}/",
                        self.storage.prefix(Area::Staging)
                    )) {
                        run.validated_output_paths.insert(rel.to_string());
                    }
                }
                counter!("surveillance.files.passed", 1);
            } else {
                run.files_failed += 1;
                counter!("surveillance.files.failed", 1);
                warn!(
                    file = %outcome.file_path,
                    reason = outcome.failure_reason.as_deref().unwrap_or("unknown"),
                    "file validation failed"
                );
            }
            run.outcomes.push(outcome);
        }

        counter!("surveillance.rows.validated", run.total_rows as u64);
        counter!("surveillance.rows.quarantined", run.quarantined_rows as u64);
        info!(
            run_id,
            passed = run.files_passed,
            failed = run.files_failed,
            rows = run.total_rows,
            "validation run complete"
        );
        Ok(run)
    }

    /// Sidecar control files are consumed next to their data file, never
    /// validated on their own.
    fn is_sidecar(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.registry.iter().any(|spec| match &spec.control_file {
            Some(ControlFileSpec::SidecarXml { pattern, .. })
            | Some(ControlFileSpec::SidecarCsv { pattern, .. }) => glob::Pattern::new(pattern)
                .map(|p| p.matches(rel) || p.matches(name))
                .unwrap_or(false),
            _ => false,
        })
    }

    async fn validate_file(&self, rel: String) -> FileOutcome {
        let start = self.clock.monotonic();
        let file_path = format!("{}/{}", self.storage.prefix(Area::Landing), rel);

        let Some(spec) = self.registry.match_path(&rel).cloned() else {
            return self
                .fail_file(
                    &rel,
                    "unknown",
                    file_path,
                    None,
                    None,
                    format!("No matching source spec for path: {rel}"),
                    start,
                )
                .await;
        };

        match self.process_file(&spec, &rel).await {
            Ok(processed) => FileOutcome {
                source_name: spec.name.clone(),
                file_path,
                passed: true,
                row_count: processed.row_count,
                expected_row_count: processed.expected_row_count,
                failure_reason: None,
                quarantined_rows: processed.quarantined_rows,
                output_path: Some(processed.staged_full),
                file_size_bytes: Some(processed.file_size_bytes),
                duration_seconds: start.elapsed().as_secs_f64(),
            },
            Err(e) => {
                self.fail_file(
                    &rel,
                    &spec.name,
                    file_path,
                    None,
                    None,
                    format!("{e:#}"),
                    start,
                )
                .await
            }
        }
    }

    async fn process_file(&self, spec: &SourceSpec, rel: &str) -> Result<Processed> {
        let bytes = self
            .storage
            .get(Area::Landing, rel)
            .await
            .context("download source object")?;
        let file_size_bytes = bytes.len() as i64;

        let rules = compile_rules(&spec.validation.row_level);
        let now = self.clock.now_utc();
        let parsed = parse_and_validate(&bytes, spec, &rules, now)?;

        let check = expected_row_count(&self.storage, spec, rel, parsed.trailer_count).await?;
        if let Some(expected) = check.expected {
            let got = parsed.rows.len() as i64;
            if got != expected {
                bail!("Row count mismatch: expected {expected}, got {got}");
            }
        }

        if !parsed.quarantined.is_empty() {
            let quarantine_rel = format!("{rel}_{}.jsonl", artifact_timestamp(now));
            let content = parsed
                .quarantined
                .iter()
                .map(|q| q.to_jsonl())
                .collect::<Vec<_>>()
                .join("\n");
            self.storage
                .put(Area::Quarantine, &quarantine_rel, Bytes::from(content))
                .await
                .with_context(|| format!("write quarantine file {quarantine_rel}"))?;
            info!(
                file = rel,
                rows = parsed.quarantined.len(),
                quarantine = %quarantine_rel,
                "rows quarantined"
            );
        }

        let staged = stage_rows(&self.storage, rel, &parsed.rows, &spec.schema, now).await?;
        let staged_full = format!("{}/{}", self.storage.prefix(Area::Staging), staged.rel_path);

        // The artifact is verified; the source can go. A concurrent delete
        // racing us counts as done.
        self.storage
            .delete(Area::Landing, rel)
            .await
            .context("delete source object")?;

        if let Some(sidecar) = &check.sidecar_rel {
            if let Err(e) = self.storage.delete(Area::Landing, sidecar).await {
                warn!(sidecar, error = %e, "failed to remove consumed control sidecar");
            }
        }

        Ok(Processed {
            row_count: parsed.rows.len() as i64,
            quarantined_rows: parsed.quarantined.len() as i64,
            expected_row_count: check.expected,
            staged_full,
            file_size_bytes,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_file(
        &self,
        rel: &str,
        source_name: &str,
        file_path: String,
        file_size_bytes: Option<i64>,
        expected_row_count: Option<i64>,
        reason: String,
        start: std::time::Instant,
    ) -> FileOutcome {
        let ts = artifact_timestamp(self.clock.now_utc());
        let failed_rel = format!("{rel}_{ts}");
        let mut output_path = None;

        match self.storage.copy(Area::Landing, rel, Area::Failed, &failed_rel).await {
            Ok(()) => {
                let note = format!("Failure reason: {reason}\nTimestamp: {ts}");
                if let Err(e) = self
                    .storage
                    .put(
                        Area::Failed,
                        &format!("{failed_rel}.error.txt"),
                        Bytes::from(note),
                    )
                    .await
                {
                    warn!(file = rel, error = %e, "failed to write error note");
                }
                if let Err(e) = self.storage.delete(Area::Landing, rel).await {
                    warn!(file = rel, error = %e, "failed to delete rejected source");
                }
                output_path = Some(format!("{}/{}", self.storage.prefix(Area::Failed), failed_rel));
            }
            Err(e) => {
                // Copy failed: keep the source in landing so the next run can
                // retry, and record the double fault.
                error!(file = rel, error = %e, "failed to copy rejected file to failed area");
            }
        }

        FileOutcome {
            source_name: source_name.to_string(),
            file_path,
            passed: false,
            row_count: 0,
            expected_row_count,
            failure_reason: Some(reason),
            quarantined_rows: 0,
            output_path,
            file_size_bytes,
            duration_seconds: start.elapsed().as_secs_f64(),
        }
    }
}
