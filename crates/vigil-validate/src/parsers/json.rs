//! JSON and JSONL parsing.
//!
//! The payload is either a top-level array of objects or newline-delimited
//! objects; the variant is autodetected from the first non-whitespace byte.
//! Values arrive typed, so no text conversion runs; nullability, allowed
//! values, bounds and rules still apply.

use chrono::{DateTime, Utc};

use vigil_core::spec::SourceSpec;
use vigil_core::value::{Row, Value};

use crate::rowcheck::{check_row, RowVerdict};
use crate::rules::CompiledRule;

use super::{ParseError, ParseOutput, QuarantinedRow};

pub(super) fn parse(
    bytes: &[u8],
    spec: &SourceSpec,
    rules: &[CompiledRule],
    now: DateTime<Utc>,
) -> Result<ParseOutput, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Malformed(format!("JSON payload is not valid UTF-8: {e}")))?;

    let items: Vec<serde_json::Value> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text)
            .map_err(|e| ParseError::Malformed(format!("JSON parse error: {e}")))?
    } else {
        let mut items = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let item = serde_json::from_str(line).map_err(|e| {
                ParseError::Malformed(format!("JSONL parse error on line {}: {e}", line_no + 1))
            })?;
            items.push(item);
        }
        items
    };

    let mut output = ParseOutput::default();
    for (row_num, item) in items.iter().enumerate() {
        let row_num = row_num + 1;
        let object = item.as_object().ok_or_else(|| {
            ParseError::Malformed(format!("JSON row {row_num} is not an object"))
        })?;

        let raw: Row = object
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();

        match check_row(&raw, &spec.schema, rules, row_num, false, now) {
            RowVerdict::Accept(cleaned) => output.rows.push(cleaned),
            RowVerdict::Reject(reason) => output.quarantined.push(QuarantinedRow {
                row_number: row_num,
                raw_content: item.clone(),
                failure_reason: reason,
            }),
        }
    }

    Ok(output)
}
