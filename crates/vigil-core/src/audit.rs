//! Control-table audit writers.
//!
//! Every file validation, transformation model, regulatory submission and
//! dead-lettered event leaves a row in the `control` dataset. Audit writes are
//! never allowed to take a pipeline run down: failures are logged and
//! swallowed.

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::value::{Row, Value};
use crate::warehouse::SharedWarehouse;

/// One `control.validation_runs` row.
#[derive(Debug, Clone)]
pub struct ValidationAudit {
    pub run_id: String,
    pub source_name: String,
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub row_count: i64,
    pub expected_row_count: Option<i64>,
    pub passed: bool,
    pub failure_reason: Option<String>,
    pub quarantined_rows: i64,
    pub output_path: Option<String>,
    pub duration_seconds: f64,
}

/// One `control.dbt_runs` row.
#[derive(Debug, Clone)]
pub struct DbtRunAudit {
    pub run_id: String,
    pub invocation_id: String,
    pub model_name: String,
    pub status: String,
    pub rows_affected: i64,
    pub execution_time_seconds: f64,
    pub bytes_processed: Option<i64>,
    pub error_message: Option<String>,
}

/// One `control.regulatory_submissions` row.
#[derive(Debug, Clone)]
pub struct SubmissionAudit {
    pub submission_id: String,
    pub event_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub regulator_reference: Option<String>,
    pub submission_latency_seconds: f64,
    pub status: String,
    pub report_type: String,
    pub report_payload_hash: String,
    pub retry_count: i64,
}

/// One `control.regulatory_dead_letter` row.
#[derive(Debug, Clone)]
pub struct DeadLetterAudit {
    pub dead_letter_id: String,
    pub event_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: String,
    pub retry_count: i64,
    pub last_error: String,
    pub event_payload: String,
}

/// Writes audit rows to the control dataset.
#[derive(Clone)]
pub struct AuditWriter {
    warehouse: SharedWarehouse,
    dataset: String,
}

impl AuditWriter {
    pub fn new(warehouse: SharedWarehouse, dataset: impl Into<String>) -> AuditWriter {
        AuditWriter {
            warehouse,
            dataset: dataset.into(),
        }
    }

    pub async fn log_validation(&self, audit: ValidationAudit) {
        let mut row = Row::new();
        set(&mut row, "run_id", Value::Str(audit.run_id));
        set(&mut row, "run_timestamp", Value::Ts(Utc::now()));
        set(&mut row, "source_name", Value::Str(audit.source_name));
        set(&mut row, "file_path", Value::Str(audit.file_path));
        set_opt(&mut row, "file_size_bytes", audit.file_size_bytes.map(Value::Int));
        set(&mut row, "row_count", Value::Int(audit.row_count));
        set_opt(
            &mut row,
            "expected_row_count",
            audit.expected_row_count.map(Value::Int),
        );
        set(&mut row, "passed", Value::Bool(audit.passed));
        set_opt(&mut row, "failure_reason", audit.failure_reason.map(Value::Str));
        set(&mut row, "quarantined_rows", Value::Int(audit.quarantined_rows));
        set_opt(&mut row, "output_path", audit.output_path.map(Value::Str));
        set(
            &mut row,
            "duration_seconds",
            Value::Float(audit.duration_seconds),
        );
        self.insert("validation_runs", row).await;
    }

    pub async fn log_dbt_run(&self, audit: DbtRunAudit) {
        let mut row = Row::new();
        set(&mut row, "run_id", Value::Str(audit.run_id));
        set(&mut row, "run_timestamp", Value::Ts(Utc::now()));
        set(&mut row, "invocation_id", Value::Str(audit.invocation_id));
        set(&mut row, "model_name", Value::Str(audit.model_name));
        set(&mut row, "status", Value::Str(audit.status));
        set(&mut row, "rows_affected", Value::Int(audit.rows_affected));
        set(
            &mut row,
            "execution_time_seconds",
            Value::Float(audit.execution_time_seconds),
        );
        set_opt(
            &mut row,
            "bytes_processed",
            audit.bytes_processed.map(Value::Int),
        );
        set_opt(&mut row, "error_message", audit.error_message.map(Value::Str));
        self.insert("dbt_runs", row).await;
    }

    pub async fn log_submission(&self, audit: SubmissionAudit) {
        let mut row = Row::new();
        set(&mut row, "submission_id", Value::Str(audit.submission_id));
        set(&mut row, "event_id", Value::Str(audit.event_id));
        set(&mut row, "event_timestamp", Value::Ts(audit.event_timestamp));
        set(&mut row, "submitted_at", Value::Ts(audit.submitted_at));
        set_opt(
            &mut row,
            "regulator_reference",
            audit.regulator_reference.map(Value::Str),
        );
        set(
            &mut row,
            "submission_latency_seconds",
            Value::Float(audit.submission_latency_seconds),
        );
        set(&mut row, "status", Value::Str(audit.status));
        set(&mut row, "report_type", Value::Str(audit.report_type));
        set(
            &mut row,
            "report_payload_hash",
            Value::Str(audit.report_payload_hash),
        );
        set(&mut row, "retry_count", Value::Int(audit.retry_count));
        self.insert("regulatory_submissions", row).await;
    }

    pub async fn log_dead_letter(&self, audit: DeadLetterAudit) {
        let mut row = Row::new();
        set(&mut row, "dead_letter_id", Value::Str(audit.dead_letter_id));
        set(&mut row, "event_id", Value::Str(audit.event_id));
        set(&mut row, "event_timestamp", Value::Ts(audit.event_timestamp));
        set(&mut row, "failed_at", Value::Ts(audit.failed_at));
        set(&mut row, "failure_reason", Value::Str(audit.failure_reason));
        set(&mut row, "retry_count", Value::Int(audit.retry_count));
        set(&mut row, "last_error", Value::Str(audit.last_error));
        set(&mut row, "event_payload", Value::Str(audit.event_payload));
        self.insert("regulatory_dead_letter", row).await;
    }

    async fn insert(&self, table: &str, row: Row) {
        let table = format!("{}.{}", self.dataset, table);
        match self.warehouse.append_rows(&table, std::slice::from_ref(&row)).await {
            Ok(()) => debug!(table, "control row inserted"),
            // Never fatal: a pipeline run must not die on audit bookkeeping.
            Err(e) => error!(table, error = %e, "control table insert failed"),
        }
    }
}

fn set(row: &mut Row, key: &str, value: Value) {
    row.insert(key.to_string(), value);
}

fn set_opt(row: &mut Row, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        row.insert(key.to_string(), value);
    }
}
