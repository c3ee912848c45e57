//! Format parsers.
//!
//! Each parser turns a landed payload into validated rows plus quarantine
//! records, running every row through the field-level checks and row rules.
//! Parsing is strict about file structure (a malformed file fails whole) but
//! lenient about individual rows (a bad row is quarantined, the file
//! survives).

use chrono::{DateTime, Utc};

use vigil_core::spec::{ControlFileSpec, SourceFormat, SourceSpec};
use vigil_core::value::Row;

use crate::rules::CompiledRule;

mod csv;
mod json;
mod xml;

/// Errors that fail a whole file.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Malformed(String),
}

/// One quarantined row.
#[derive(Debug, Clone)]
pub struct QuarantinedRow {
    pub row_number: usize,
    pub raw_content: serde_json::Value,
    pub failure_reason: String,
}

impl QuarantinedRow {
    /// The JSONL line written to the quarantine area.
    pub fn to_jsonl(&self) -> String {
        serde_json::json!({
            "row_number": self.row_number,
            "raw_content": self.raw_content,
            "failure_reason": self.failure_reason,
        })
        .to_string()
    }
}

/// Result of parsing and validating one file.
#[derive(Debug, Default)]
pub struct ParseOutput {
    pub rows: Vec<Row>,
    pub quarantined: Vec<QuarantinedRow>,
    /// Expected row count read from a trailer record, when configured.
    pub trailer_count: Option<i64>,
}

/// Parse a payload according to its spec and validate every row.
pub fn parse_and_validate(
    bytes: &[u8],
    spec: &SourceSpec,
    rules: &[CompiledRule],
    now: DateTime<Utc>,
) -> Result<ParseOutput, ParseError> {
    match spec.source.format {
        SourceFormat::Csv => csv::parse(bytes, spec, rules, now),
        SourceFormat::Json | SourceFormat::Jsonl => json::parse(bytes, spec, rules, now),
        SourceFormat::Xml => xml::parse(bytes, spec, rules, now),
        SourceFormat::Parquet => Err(ParseError::Unsupported("parquet".to_string())),
    }
}

/// Trailer column index, when this spec uses a trailer control record.
pub(crate) fn trailer_column(spec: &SourceSpec) -> Option<usize> {
    match &spec.control_file {
        Some(ControlFileSpec::Trailer { row_count_column }) => Some(*row_count_column),
        _ => None,
    }
}
