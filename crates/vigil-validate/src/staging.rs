//! Parquet staging artifacts.
//!
//! Accepted rows are encoded as a parquet file using the spec schema and
//! uploaded to the staging area under the source's parent path with a UTC
//! timestamp in the name. The write is verified by re-reading the remote
//! object's metadata before the caller is allowed to delete the source:
//! a missing or empty artifact means the source stays in landing and the next
//! run retries.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::{info, warn};

use vigil_core::clock::artifact_timestamp;
use vigil_core::spec::{FieldSpec, FieldType};
use vigil_core::storage::{Area, Storage};
use vigil_core::value::{Row, Value};

/// Artifacts smaller than this per row usually mean a truncated write.
const MIN_BYTES_PER_ROW: u64 = 10;

/// A verified staging artifact.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    /// Path relative to the staging area.
    pub rel_path: String,
    pub size_bytes: i64,
}

/// Encode rows with the spec schema and upload a verified artifact.
pub async fn stage_rows(
    storage: &Storage,
    data_rel: &str,
    rows: &[Row],
    fields: &[FieldSpec],
    now: DateTime<Utc>,
) -> Result<StagedArtifact> {
    let bytes = encode_parquet(rows, fields)?;

    let rel_path = staged_name(data_rel, now);
    storage
        .put(Area::Staging, &rel_path, bytes)
        .await
        .with_context(|| format!("upload staging artifact {rel_path}"))?;

    // Verify the remote object before anyone deletes the source.
    let meta = storage
        .head(Area::Staging, &rel_path)
        .await
        .with_context(|| format!("staging artifact {rel_path} missing after upload"))?;
    if meta.size == 0 {
        bail!("staging artifact {rel_path} is empty after upload");
    }
    if !rows.is_empty() {
        let per_row = meta.size as u64 / rows.len() as u64;
        if per_row < MIN_BYTES_PER_ROW {
            warn!(
                artifact = rel_path,
                bytes_per_row = per_row,
                "staging artifact suspiciously small"
            );
        }
    }

    info!(artifact = %rel_path, rows = rows.len(), size = meta.size, "staged artifact verified");
    Ok(StagedArtifact {
        rel_path,
        size_bytes: meta.size as i64,
    })
}

/// `trades/trades_20240115.csv` -> `trades/trades_20240115_<ts>.parquet`
fn staged_name(data_rel: &str, now: DateTime<Utc>) -> String {
    let (parent, name) = match data_rel.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, data_rel),
    };
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    let file = format!("{stem}_{}.parquet", artifact_timestamp(now));
    match parent {
        Some(parent) => format!("{parent}/{file}"),
        None => file,
    }
}

/// Encode rows as parquet using the declared schema.
pub fn encode_parquet(rows: &[Row], fields: &[FieldSpec]) -> Result<Bytes> {
    let mut arrow_fields = Vec::with_capacity(fields.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());

    for field in fields {
        let (data_type, array) = build_column(rows, field);
        arrow_fields.push(Field::new(&field.name, data_type, true));
        columns.push(array);
    }

    let schema = Arc::new(Schema::new(arrow_fields));
    let batch = RecordBatch::try_new(schema.clone(), columns).context("build record batch")?;

    let mut out = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer =
        ArrowWriter::try_new(&mut out, schema, Some(props)).context("create parquet writer")?;
    writer.write(&batch).context("write parquet batch")?;
    writer.close().context("close parquet writer")?;

    Ok(Bytes::from(out))
}

fn build_column(rows: &[Row], field: &FieldSpec) -> (DataType, ArrayRef) {
    match field.field_type {
        FieldType::Int64 => {
            let values: Vec<Option<i64>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    Some(Value::Int(v)) => Some(*v),
                    _ => None,
                })
                .collect();
            (DataType::Int64, Arc::new(Int64Array::from(values)))
        }
        FieldType::Float64 => {
            let values: Vec<Option<f64>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    Some(Value::Float(v)) => Some(*v),
                    Some(Value::Int(v)) => Some(*v as f64),
                    _ => None,
                })
                .collect();
            (DataType::Float64, Arc::new(Float64Array::from(values)))
        }
        FieldType::Bool => {
            let values: Vec<Option<bool>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    Some(Value::Bool(v)) => Some(*v),
                    _ => None,
                })
                .collect();
            (DataType::Boolean, Arc::new(BooleanArray::from(values)))
        }
        FieldType::Timestamp => {
            let values: Vec<Option<i64>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    Some(Value::Ts(ts)) => Some(ts.timestamp_micros()),
                    Some(Value::Str(s)) => Value::parse_timestamp(s).map(|ts| ts.timestamp_micros()),
                    _ => None,
                })
                .collect();
            let array = TimestampMicrosecondArray::from(values).with_timezone("UTC");
            (
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                Arc::new(array),
            )
        }
        FieldType::Date => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
            let values: Vec<Option<i32>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    Some(Value::Date(d)) => {
                        Some(d.signed_duration_since(epoch).num_days() as i32)
                    }
                    Some(Value::Str(s)) => Value::parse_date(s)
                        .map(|d| d.signed_duration_since(epoch).num_days() as i32),
                    _ => None,
                })
                .collect();
            (DataType::Date32, Arc::new(Date32Array::from(values)))
        }
        // Strings, decimals, and the text-shaped types keep their exact text.
        _ => {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| match row.get(&field.name) {
                    None | Some(Value::Null) => None,
                    Some(other) => Some(other.to_string()),
                })
                .collect();
            (DataType::Utf8, Arc::new(StringArray::from(values)))
        }
    }
}
