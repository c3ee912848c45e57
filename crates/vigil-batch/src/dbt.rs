//! External transformation runner.
//!
//! Runs `dbt build` as a subprocess with a hard timeout, captures both output
//! streams, and mines `target/run_results.json` for per-model outcomes. Every
//! model gets an audit row in `control.dbt_runs`. The build is clean when the
//! process exited zero and no model reported an error; `pass` and `success`
//! both count as clean model statuses.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use vigil_core::audit::{AuditWriter, DbtRunAudit};

/// Keep only this much of a stream tail in logs.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Result of one transformation build.
#[derive(Debug, Clone)]
pub struct DbtResult {
    pub success: bool,
    pub rows_affected: i64,
    pub models_run: usize,
    pub models_failed: usize,
    pub errors: Vec<String>,
    pub invocation_id: String,
}

#[derive(Debug, Deserialize)]
struct RunResultsFile {
    #[serde(default)]
    results: Vec<ModelResult>,
}

/// One entry of `run_results.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelResult {
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    execution_time: Option<f64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    adapter_response: Option<AdapterResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AdapterResponse {
    #[serde(default)]
    rows_affected: Option<i64>,
    #[serde(default)]
    bytes_processed: Option<i64>,
}

/// Runs the transformation build and logs results.
pub struct DbtRunner {
    program: String,
    project_dir: String,
    profiles_dir: String,
    target: String,
    timeout: Duration,
    audit: AuditWriter,
}

impl DbtRunner {
    pub fn new(
        project_dir: String,
        profiles_dir: String,
        target: String,
        timeout_seconds: u64,
        audit: AuditWriter,
    ) -> DbtRunner {
        DbtRunner {
            program: "dbt".to_string(),
            project_dir,
            profiles_dir,
            target,
            timeout: Duration::from_secs(timeout_seconds),
            audit,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_program(mut self, program: &str) -> DbtRunner {
        self.program = program.to_string();
        self
    }

    /// Run the build and return aggregated results. Never panics; a missing
    /// binary or timeout comes back as a failed result.
    pub async fn run(&self) -> DbtResult {
        let invocation_id = Uuid::new_v4().to_string();
        info!(
            program = %self.program,
            project_dir = %self.project_dir,
            target = %self.target,
            "transformation build starting"
        );

        let mut command = Command::new(&self.program);
        command
            .arg("build")
            .arg("--project-dir")
            .arg(&self.project_dir)
            .arg("--profiles-dir")
            .arg(&self.profiles_dir)
            .arg("--target")
            .arg(&self.target)
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A dropped future must not leave an orphaned build running.
            .kill_on_drop(true);

        let exit_ok = match command.spawn() {
            Ok(child) => {
                match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                    Ok(Ok(output)) => {
                        if !output.status.success() {
                            let stderr = String::from_utf8_lossy(&output.stderr);
                            error!(tail = tail(&stderr), "transformation build errors");
                        }
                        output.status.success()
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "transformation build failed to complete");
                        false
                    }
                    Err(_) => {
                        error!(
                            timeout_seconds = self.timeout.as_secs(),
                            "transformation build timed out and was killed"
                        );
                        false
                    }
                }
            }
            Err(e) => {
                error!(program = %self.program, error = %e, "failed to spawn transformation runner");
                false
            }
        };

        let results = self.read_run_results();
        let result = aggregate(&results, exit_ok, &invocation_id);

        for model in &results {
            let status = model.status.clone().unwrap_or_else(|| "unknown".to_string());
            let adapter = model.adapter_response.clone().unwrap_or_default();
            self.audit
                .log_dbt_run(DbtRunAudit {
                    run_id: Uuid::new_v4().to_string(),
                    invocation_id: invocation_id.clone(),
                    model_name: model
                        .unique_id
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    status: status.clone(),
                    rows_affected: adapter.rows_affected.unwrap_or(0),
                    execution_time_seconds: model.execution_time.unwrap_or(0.0),
                    bytes_processed: adapter.bytes_processed,
                    error_message: if status == "error" {
                        model.message.clone()
                    } else {
                        None
                    },
                })
                .await;
        }

        info!(
            success = result.success,
            models_run = result.models_run,
            models_failed = result.models_failed,
            rows_affected = result.rows_affected,
            "transformation build complete"
        );
        result
    }

    fn read_run_results(&self) -> Vec<ModelResult> {
        let path = Path::new(&self.project_dir)
            .join("target")
            .join("run_results.json");
        match std::fs::read_to_string(&path) {
            Ok(text) => parse_run_results(&text),
            Err(_) => {
                warn!(path = %path.display(), "run_results.json not found");
                Vec::new()
            }
        }
    }
}

fn parse_run_results(text: &str) -> Vec<ModelResult> {
    match serde_json::from_str::<RunResultsFile>(text) {
        Ok(file) => file.results,
        Err(e) => {
            error!(error = %e, "run_results.json parse error");
            Vec::new()
        }
    }
}

fn aggregate(results: &[ModelResult], exit_ok: bool, invocation_id: &str) -> DbtResult {
    let mut models_run = 0;
    let mut models_failed = 0;
    let mut rows_affected = 0;
    let mut errors = Vec::new();

    for model in results {
        let name = model.unique_id.as_deref().unwrap_or("unknown");
        match model.status.as_deref() {
            Some("success") | Some("pass") => {
                models_run += 1;
                rows_affected += model
                    .adapter_response
                    .as_ref()
                    .and_then(|a| a.rows_affected)
                    .unwrap_or(0);
            }
            Some("error") => {
                models_failed += 1;
                errors.push(format!(
                    "{name}: {}",
                    model.message.as_deref().unwrap_or("unknown error")
                ));
            }
            _ => {}
        }
    }

    DbtResult {
        success: exit_ok && models_failed == 0,
        rows_affected,
        models_run,
        models_failed,
        errors,
        invocation_id: invocation_id.to_string(),
    }
}

fn tail(text: &str) -> &str {
    let start = text.len().saturating_sub(OUTPUT_TAIL_CHARS);
    // Stay on a char boundary.
    let mut start = start;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_core::warehouse::memory::MemoryWarehouse;

    const RUN_RESULTS: &str = r#"{
        "results": [
            {
                "unique_id": "model.surveillance.stg_trades",
                "status": "success",
                "execution_time": 1.5,
                "adapter_response": {"rows_affected": 120}
            },
            {
                "unique_id": "model.surveillance.fct_orders",
                "status": "error",
                "execution_time": 0.2,
                "message": "relation does not exist"
            },
            {
                "unique_id": "test.surveillance.not_null_trades",
                "status": "pass",
                "execution_time": 0.1
            }
        ]
    }"#;

    #[test]
    fn aggregates_model_statuses() {
        let results = parse_run_results(RUN_RESULTS);
        assert_eq!(results.len(), 3);

        let outcome = aggregate(&results, true, "inv");
        assert!(!outcome.success);
        assert_eq!(outcome.models_run, 2);
        assert_eq!(outcome.models_failed, 1);
        assert_eq!(outcome.rows_affected, 120);
        assert!(outcome.errors[0].contains("fct_orders"));

        // A clean exit with clean models is a success.
        let clean = parse_run_results(
            r#"{"results": [{"unique_id": "m", "status": "success"}]}"#,
        );
        assert!(aggregate(&clean, true, "inv").success);
        // A non-zero exit fails even without model errors.
        assert!(!aggregate(&clean, false, "inv").success);
    }

    #[test]
    fn malformed_run_results_is_empty_not_fatal() {
        assert!(parse_run_results("{ nope").is_empty());
        assert!(parse_run_results("{}").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_result() {
        let wh = Arc::new(MemoryWarehouse::new());
        let runner = DbtRunner::new(
            "/tmp".into(),
            "/tmp".into(),
            "int".into(),
            5,
            AuditWriter::new(wh.clone(), "control"),
        )
        .with_program("vigil-no-such-binary");

        let result = runner.run().await;
        assert!(!result.success);
        assert_eq!(result.models_run, 0);
    }

    #[tokio::test]
    async fn audit_rows_written_per_model() {
        let wh = Arc::new(MemoryWarehouse::new());
        let dir = std::env::temp_dir().join(format!("vigil-dbt-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("target")).unwrap();
        std::fs::write(dir.join("target/run_results.json"), RUN_RESULTS).unwrap();

        let runner = DbtRunner::new(
            dir.to_string_lossy().into_owned(),
            dir.to_string_lossy().into_owned(),
            "int".into(),
            5,
            AuditWriter::new(wh.clone(), "control"),
        )
        .with_program("true");

        let result = runner.run().await;
        // Exit was clean but one model errored.
        assert!(!result.success);

        let audits = wh.rows("control.dbt_runs").await;
        assert_eq!(audits.len(), 3);
        assert!(audits.iter().any(|row| {
            row["status"] == vigil_core::Value::Str("error".into())
                && row.contains_key("error_message")
        }));

        std::fs::remove_dir_all(dir).ok();
    }
}
