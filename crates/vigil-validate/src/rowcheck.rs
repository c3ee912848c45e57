//! Field-level row validation.
//!
//! Runs the declared-schema checks for one row: nullability, canonical type
//! conversion for text-bearing formats, allowed values, and min/max bounds,
//! then the spec's row-level rules. The result is either a cleaned row holding
//! only declared fields or a rejection reason for the quarantine record.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tracing::warn;

use vigil_core::spec::{FieldSpec, FieldType};
use vigil_core::value::{Row, Value};

use crate::rules::{evaluate_all, CompiledRule};

/// Verdict for one row.
#[derive(Debug)]
pub enum RowVerdict {
    Accept(Row),
    Reject(String),
}

/// Validate and clean one row against the declared schema and rules.
///
/// `convert_strings` is set for CSV and XML sources, whose cells arrive as
/// text; JSON sources carry typed values already and pass through unconverted.
pub fn check_row(
    raw: &Row,
    fields: &[FieldSpec],
    rules: &[CompiledRule],
    row_num: usize,
    convert_strings: bool,
    now: DateTime<Utc>,
) -> RowVerdict {
    let mut cleaned = Row::new();

    for field in fields {
        let value = raw.get(&field.name).cloned().unwrap_or(Value::Null);

        if is_nullish(&value) {
            if !field.nullable {
                return RowVerdict::Reject(format!(
                    "Required field '{}' is null at row {row_num}",
                    field.name
                ));
            }
            cleaned.insert(field.name.clone(), Value::Null);
            continue;
        }

        let value = if convert_strings {
            match &value {
                Value::Str(text) => match convert_text(text, field.field_type) {
                    Ok(converted) => converted,
                    Err(e) => {
                        return RowVerdict::Reject(format!(
                            "Type conversion failed for '{}' at row {row_num}: {e}",
                            field.name
                        ))
                    }
                },
                other => other.clone(),
            }
        } else {
            value
        };

        if let Some(allowed) = &field.allowed_values {
            let member = allowed.iter().any(|candidate| {
                let candidate = Value::from_json(candidate);
                value
                    .compare(&candidate)
                    .is_some_and(|ord| ord.is_eq())
            });
            if !member {
                return RowVerdict::Reject(format!(
                    "Field '{}' value '{value}' not in allowed values at row {row_num}",
                    field.name
                ));
            }
        }

        if let Some(min) = &field.min_value {
            let min = Value::from_json(min);
            if value.compare(&min).is_some_and(|ord| ord.is_lt()) {
                return RowVerdict::Reject(format!(
                    "Field '{}' value '{value}' below minimum {min} at row {row_num}",
                    field.name
                ));
            }
        }
        if let Some(max) = &field.max_value {
            let max = Value::from_json(max);
            if value.compare(&max).is_some_and(|ord| ord.is_gt()) {
                return RowVerdict::Reject(format!(
                    "Field '{}' value '{value}' above maximum {max} at row {row_num}",
                    field.name
                ));
            }
        }

        cleaned.insert(field.name.clone(), value);
    }

    let (errors, warnings) = evaluate_all(rules, &cleaned, row_num, now);
    for message in &warnings {
        warn!(row = row_num, "{message}");
    }
    if !errors.is_empty() {
        return RowVerdict::Reject(errors.join("; "));
    }

    RowVerdict::Accept(cleaned)
}

fn is_nullish(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Str(s) => s.is_empty(),
        _ => false,
    }
}

/// Canonical text parse for one declared type.
pub fn convert_text(text: &str, field_type: FieldType) -> Result<Value, String> {
    match field_type {
        FieldType::String | FieldType::Time | FieldType::Datetime | FieldType::Bytes
        | FieldType::Json => Ok(Value::Str(text.to_string())),
        FieldType::Int64 => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| e.to_string()),
        FieldType::Float64 => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| e.to_string()),
        FieldType::Numeric => BigDecimal::from_str(text.trim())
            .map(Value::Dec)
            .map_err(|e| e.to_string()),
        FieldType::Bool => Ok(Value::Bool(matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ))),
        FieldType::Timestamp => Value::parse_timestamp(text.trim())
            .map(Value::Ts)
            .ok_or_else(|| format!("invalid timestamp '{text}'")),
        FieldType::Date => Value::parse_date(text.trim())
            .map(Value::Date)
            .ok_or_else(|| format!("invalid date '{text}'")),
    }
}
