//! CSV parsing.
//!
//! A header row is required; data rows are numbered from 2 so quarantine
//! records line up with what an operator sees in a text editor. Empty fields
//! are equivalent to NULL. When the spec declares a trailer control record,
//! the last data row carries the expected count and is removed before
//! validation.

use chrono::{DateTime, Utc};

use vigil_core::spec::SourceSpec;
use vigil_core::value::{Row, Value};

use crate::rowcheck::{check_row, RowVerdict};
use crate::rules::CompiledRule;

use super::{trailer_column, ParseError, ParseOutput, QuarantinedRow};

pub(super) fn parse(
    bytes: &[u8],
    spec: &SourceSpec,
    rules: &[CompiledRule],
    now: DateTime<Utc>,
) -> Result<ParseOutput, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(spec.source.delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Malformed(format!("CSV header error: {e}")))?
        .clone();
    if headers.is_empty() {
        return Err(ParseError::Malformed("CSV file has no header row".to_string()));
    }

    let mut records = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| ParseError::Malformed(format!("CSV read error: {e}")))?;
        // Header is line 1, first data row is line 2.
        records.push((offset + 2, record));
    }

    let mut output = ParseOutput::default();

    if let Some(column) = trailer_column(spec) {
        let (_, trailer) = records
            .pop()
            .ok_or_else(|| ParseError::Malformed("Failed to process trailer: file has no data rows".to_string()))?;
        let cell = trailer.get(column).ok_or_else(|| {
            ParseError::Malformed(format!(
                "Failed to process trailer: no column {column} in trailer record"
            ))
        })?;
        let count = cell.trim().parse::<i64>().map_err(|e| {
            ParseError::Malformed(format!("Failed to process trailer: {e}"))
        })?;
        output.trailer_count = Some(count);
    }

    for (row_num, record) in records {
        let raw: Row = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let cell = record.get(i).unwrap_or("");
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::Str(cell.to_string())
                };
                (header.to_string(), value)
            })
            .collect();

        match check_row(&raw, &spec.schema, rules, row_num, true, now) {
            RowVerdict::Accept(cleaned) => output.rows.push(cleaned),
            RowVerdict::Reject(reason) => output.quarantined.push(QuarantinedRow {
                row_number: row_num,
                raw_content: vigil_core::value::row_to_json(&raw),
                failure_reason: reason,
            }),
        }
    }

    Ok(output)
}
