//! # Vigil Load - Schema-Drift Warehouse Loader
//!
//! Ingests tabular batches into warehouse tables without ever running a schema
//! migration. Producers add and remove columns at will; the loader absorbs the
//! difference:
//!
//! - Columns the table already knows load normally.
//! - Unknown columns are packed into a JSON object and stored in the reserved
//!   `_extra` string column, so new attributes are queryable immediately via
//!   JSON extraction.
//! - Columns the table expects but the batch lacks are filled with NULL.
//!
//! Every loaded row is tagged with a `_load_id`, and each load writes exactly
//! one `load_metadata` row. That pair is the traceability anchor joining raw
//! warehouse rows back to their source objects.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use vigil_core::clock::SharedClock;
use vigil_core::value::{Row, Value};
use vigil_core::warehouse::SharedWarehouse;

/// Reserved column names. Never treated as user columns.
pub const LOAD_ID_COLUMN: &str = "_load_id";
pub const EXTRA_COLUMN: &str = "_extra";

/// Table holding one metadata row per load.
pub const METADATA_TABLE: &str = "load_metadata";

/// Metadata captured for one load operation.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub load_id: String,
    pub filename: String,
    pub table: String,
    pub row_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Loads batches into warehouse tables, absorbing schema drift.
#[derive(Clone)]
pub struct DriftLoader {
    warehouse: SharedWarehouse,
    clock: SharedClock,
}

impl DriftLoader {
    pub fn new(warehouse: SharedWarehouse, clock: SharedClock) -> DriftLoader {
        DriftLoader { warehouse, clock }
    }

    /// Load one batch into `table` and record its metadata row.
    pub async fn load(&self, rows: &[Row], table: &str, filename: &str) -> Result<LoadResult> {
        let load_id = Uuid::new_v4().to_string();
        let started_at = self.clock.now_utc();

        let batch_columns: BTreeSet<String> = rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .filter(|name| !name.starts_with('_'))
            .collect();

        let existing = self
            .warehouse
            .table_columns(table)
            .await
            .with_context(|| format!("describe table {table}"))?;

        let prepared = match existing {
            None => {
                // First load: the batch defines the baseline schema.
                let mut columns: Vec<String> = batch_columns.iter().cloned().collect();
                columns.push(LOAD_ID_COLUMN.to_string());
                columns.push(EXTRA_COLUMN.to_string());
                self.warehouse
                    .create_table(table, &columns)
                    .await
                    .with_context(|| format!("create table {table}"))?;

                rows.iter()
                    .map(|row| {
                        let mut out: Row = batch_columns
                            .iter()
                            .map(|col| {
                                (col.clone(), row.get(col).cloned().unwrap_or(Value::Null))
                            })
                            .collect();
                        out.insert(LOAD_ID_COLUMN.to_string(), Value::Str(load_id.clone()));
                        out.insert(EXTRA_COLUMN.to_string(), Value::Null);
                        out
                    })
                    .collect::<Vec<_>>()
            }
            Some(existing) => {
                let existing: BTreeSet<String> = existing.into_iter().collect();
                let known: Vec<&String> =
                    batch_columns.iter().filter(|c| existing.contains(*c)).collect();
                let new: Vec<&String> =
                    batch_columns.iter().filter(|c| !existing.contains(*c)).collect();
                let missing: Vec<&String> =
                    existing.iter().filter(|c| !batch_columns.contains(*c)).collect();

                if !new.is_empty() {
                    info!(table, columns = ?new, "new columns captured in _extra");
                }
                for column in &missing {
                    info!(table, column = %column, "missing column filled with NULL");
                }

                rows.iter()
                    .map(|row| {
                        let mut out = Row::new();
                        for col in &known {
                            out.insert(
                                (*col).clone(),
                                row.get(*col).cloned().unwrap_or(Value::Null),
                            );
                        }
                        for col in &missing {
                            out.insert((*col).clone(), Value::Null);
                        }
                        let extra = if new.is_empty() {
                            Value::Null
                        } else {
                            let object: serde_json::Map<String, serde_json::Value> = new
                                .iter()
                                .filter_map(|col| {
                                    row.get(*col).map(|v| ((*col).clone(), v.to_json()))
                                })
                                .collect();
                            Value::Str(serde_json::Value::Object(object).to_string())
                        };
                        out.insert(EXTRA_COLUMN.to_string(), extra);
                        out.insert(LOAD_ID_COLUMN.to_string(), Value::Str(load_id.clone()));
                        out
                    })
                    .collect::<Vec<_>>()
            }
        };

        self.warehouse
            .append_rows(table, &prepared)
            .await
            .with_context(|| format!("append rows to {table}"))?;

        let completed_at = self.clock.now_utc();
        let result = LoadResult {
            load_id: load_id.clone(),
            filename: filename.to_string(),
            table: table.to_string(),
            row_count: rows.len() as i64,
            started_at,
            completed_at,
        };
        self.record_metadata(&result).await?;

        info!(
            table,
            filename,
            load_id = %load_id,
            rows = result.row_count,
            "load complete"
        );
        Ok(result)
    }

    /// Exactly one metadata row per load. A failure here is a real failure:
    /// rows without their metadata anchor are untraceable.
    async fn record_metadata(&self, result: &LoadResult) -> Result<()> {
        let mut row = Row::new();
        row.insert("load_id".to_string(), Value::Str(result.load_id.clone()));
        row.insert("filename".to_string(), Value::Str(result.filename.clone()));
        row.insert("table_name".to_string(), Value::Str(result.table.clone()));
        row.insert("row_count".to_string(), Value::Int(result.row_count));
        row.insert("started_at".to_string(), Value::Ts(result.started_at));
        row.insert("completed_at".to_string(), Value::Ts(result.completed_at));

        self.warehouse
            .append_rows(METADATA_TABLE, std::slice::from_ref(&row))
            .await
            .context("record load metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_core::clock::SystemClock;
    use vigil_core::warehouse::memory::MemoryWarehouse;
    use vigil_core::warehouse::Warehouse;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Str(v.to_string())))
            .collect()
    }

    fn loader(wh: &Arc<MemoryWarehouse>) -> DriftLoader {
        DriftLoader::new(wh.clone(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn first_load_defines_baseline_schema() {
        let wh = Arc::new(MemoryWarehouse::new());
        let result = loader(&wh)
            .load(
                &[row(&[("a", "1"), ("b", "2")])],
                "raw_trades",
                "trades_20240115.csv",
            )
            .await
            .unwrap();

        assert_eq!(result.row_count, 1);
        assert_eq!(
            wh.table_columns("raw_trades").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let rows = wh.rows("raw_trades").await;
        assert_eq!(rows[0][EXTRA_COLUMN], Value::Null);
        assert_eq!(
            rows[0][LOAD_ID_COLUMN],
            Value::Str(result.load_id.clone())
        );
    }

    #[tokio::test]
    async fn drifted_columns_go_to_extra() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        l.load(&[row(&[("a", "1"), ("b", "2")])], "raw_trades", "day1.csv")
            .await
            .unwrap();

        l.load(
            &[row(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")])],
            "raw_trades",
            "day2.csv",
        )
        .await
        .unwrap();

        let rows = wh.rows("raw_trades").await;
        let drifted = &rows[1];
        assert_eq!(drifted["a"], Value::Str("1".into()));
        assert_eq!(drifted["b"], Value::Str("2".into()));
        assert!(!drifted.contains_key("c"));
        let extra = drifted[EXTRA_COLUMN].as_str().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(extra).unwrap();
        assert_eq!(parsed, serde_json::json!({"c": "3", "d": "4"}));

        // The user-visible schema did not change.
        assert_eq!(
            wh.table_columns("raw_trades").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn missing_columns_fill_with_null() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        l.load(&[row(&[("a", "1"), ("b", "2")])], "raw_trades", "day1.csv")
            .await
            .unwrap();
        l.load(&[row(&[("a", "9")])], "raw_trades", "day3.csv")
            .await
            .unwrap();

        let rows = wh.rows("raw_trades").await;
        assert_eq!(rows[1]["a"], Value::Str("9".into()));
        assert_eq!(rows[1]["b"], Value::Null);
        assert_eq!(rows[1][EXTRA_COLUMN], Value::Null);
    }

    #[tokio::test]
    async fn one_metadata_row_per_load() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let first = l
            .load(&[row(&[("a", "1")]), row(&[("a", "2")])], "raw_trades", "f1.csv")
            .await
            .unwrap();
        let second = l
            .load(&[row(&[("a", "3")])], "raw_trades", "f2.csv")
            .await
            .unwrap();

        let metadata = wh.rows(METADATA_TABLE).await;
        assert_eq!(metadata.len(), 2);
        assert_ne!(first.load_id, second.load_id);
        assert_eq!(metadata[0]["row_count"], Value::Int(2));
        assert_eq!(metadata[1]["filename"], Value::Str("f2.csv".into()));

        // Every data row carries exactly one of the two load ids.
        let data = wh.rows("raw_trades").await;
        for row in data {
            let id = row[LOAD_ID_COLUMN].as_str().unwrap();
            assert!(id == first.load_id || id == second.load_id);
        }
    }
}
