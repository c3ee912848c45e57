//! Partner extract generation.
//!
//! Materialises the rolling-window query into a temp table, exports the rows
//! to the extracts area as gzip JSON-lines or Avro, and drops the temp table
//! on every exit path. The temp table exists so a partial export never leaves
//! half a result set looking like the real thing.

use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use vigil_core::clock::SharedClock;
use vigil_core::config::ExtractFormat;
use vigil_core::storage::{Area, Storage};
use vigil_core::value::{row_to_json, Row, Value};
use vigil_core::warehouse::SharedWarehouse;

/// Default source table; deployments override via `EXTRACT_TABLE`.
pub const DEFAULT_EXTRACT_TABLE: &str = "consumer.markets_extract";

/// Result of extract generation.
#[derive(Debug, Clone)]
pub struct ExtractResult {
    pub output_path: String,
    pub row_count: i64,
    pub size_bytes: i64,
}

/// Generates the rolling-window extract for the surveillance partner.
pub struct ExtractGenerator {
    warehouse: SharedWarehouse,
    storage: Storage,
    clock: SharedClock,
    format: ExtractFormat,
    window_days: i64,
    extract_table: String,
}

impl ExtractGenerator {
    pub fn new(
        warehouse: SharedWarehouse,
        storage: Storage,
        clock: SharedClock,
        format: ExtractFormat,
        window_days: i64,
        extract_table: Option<String>,
    ) -> ExtractGenerator {
        ExtractGenerator {
            warehouse,
            storage,
            clock,
            format,
            window_days,
            extract_table: extract_table.unwrap_or_else(|| DEFAULT_EXTRACT_TABLE.to_string()),
        }
    }

    pub async fn run(&self) -> Result<ExtractResult> {
        let today = self.clock.now_utc().date_naive();
        let cutoff = today - ChronoDuration::days(self.window_days);

        let rows = self
            .warehouse
            .query(
                &format!(
                    "SELECT * FROM {} WHERE trade_date >= ?",
                    self.extract_table
                ),
                &[Value::Date(cutoff)],
            )
            .await
            .with_context(|| format!("query extract window from {}", self.extract_table))?;

        info!(
            row_count = rows.len(),
            window_days = self.window_days,
            source_table = %self.extract_table,
            "extract starting"
        );

        // Materialise into a temp table, export, and drop the table no
        // matter how the export went.
        let temp_table = format!("control._extract_temp_{}", today.format("%Y%m%d"));
        let columns = column_set(&rows);
        self.warehouse
            .create_table(&temp_table, &columns)
            .await
            .with_context(|| format!("create temp table {temp_table}"))?;

        let exported = self.materialise_and_export(&temp_table, &rows, today).await;

        if let Err(e) = self.warehouse.drop_table(&temp_table).await {
            warn!(table = %temp_table, error = %e, "temp table cleanup failed");
        }

        let (output_rel, size_bytes) = exported?;
        let output_path = format!("{}/{}", self.storage.prefix(Area::Extracts), output_rel);
        info!(
            output_path = %output_path,
            row_count = rows.len(),
            size_bytes,
            "extract complete"
        );
        Ok(ExtractResult {
            output_path,
            row_count: rows.len() as i64,
            size_bytes,
        })
    }

    async fn materialise_and_export(
        &self,
        temp_table: &str,
        rows: &[Row],
        today: chrono::NaiveDate,
    ) -> Result<(String, i64)> {
        self.warehouse
            .append_rows(temp_table, rows)
            .await
            .with_context(|| format!("materialise into {temp_table}"))?;

        let (extension, bytes) = match self.format {
            ExtractFormat::Jsonl => ("jsonl.gz", encode_jsonl_gz(rows)?),
            ExtractFormat::Avro => ("avro", encode_avro(rows)?),
        };

        let output_rel = format!("{today}/markets_extract_{today}.{extension}");
        self.storage
            .put(Area::Extracts, &output_rel, bytes)
            .await
            .with_context(|| format!("upload extract {output_rel}"))?;

        let meta = self
            .storage
            .head(Area::Extracts, &output_rel)
            .await
            .context("verify extract upload")?;
        Ok((output_rel, meta.size as i64))
    }
}

fn column_set(rows: &[Row]) -> Vec<String> {
    let set: BTreeSet<String> = rows.iter().flat_map(|row| row.keys().cloned()).collect();
    set.into_iter().collect()
}

fn encode_jsonl_gz(rows: &[Row]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for row in rows {
        encoder
            .write_all(row_to_json(row).to_string().as_bytes())
            .context("gzip write")?;
        encoder.write_all(b"\n").context("gzip write")?;
    }
    Ok(Bytes::from(encoder.finish().context("gzip finish")?))
}

fn encode_avro(rows: &[Row]) -> Result<Bytes> {
    let columns = column_set(rows);
    let fields: Vec<serde_json::Value> = columns
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "type": ["null", "string"],
                "default": null,
            })
        })
        .collect();
    let schema_json = serde_json::json!({
        "type": "record",
        "name": "markets_extract",
        "fields": fields,
    });
    let schema = apache_avro::Schema::parse(&schema_json).context("build avro schema")?;

    let mut writer = apache_avro::Writer::new(&schema, Vec::new());
    for row in rows {
        let mut record =
            apache_avro::types::Record::new(&schema).context("build avro record")?;
        for column in &columns {
            let value: Option<String> = match row.get(column) {
                None | Some(Value::Null) => None,
                Some(other) => Some(other.to_string()),
            };
            record.put(column, value);
        }
        writer.append(record).context("append avro record")?;
    }
    Ok(Bytes::from(writer.into_inner().context("finish avro file")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use vigil_core::clock::SystemClock;
    use vigil_core::warehouse::memory::MemoryWarehouse;
    use vigil_core::warehouse::Warehouse;

    fn trade_row(date: &str, symbol: &str) -> Row {
        [
            (
                "trade_date".to_string(),
                Value::Date(date.parse().unwrap()),
            ),
            ("symbol".to_string(), Value::Str(symbol.to_string())),
        ]
        .into_iter()
        .collect()
    }

    async fn seeded_warehouse() -> Arc<MemoryWarehouse> {
        let wh = Arc::new(MemoryWarehouse::new());
        let today = chrono::Utc::now().date_naive();
        let recent = today - ChronoDuration::days(1);
        let old = today - ChronoDuration::days(30);
        wh.seed(
            DEFAULT_EXTRACT_TABLE,
            vec![
                trade_row(&recent.to_string(), "VOD"),
                trade_row(&old.to_string(), "BP"),
            ],
        )
        .await;
        wh
    }

    #[tokio::test]
    async fn jsonl_extract_applies_window_and_cleans_temp_table() {
        let wh = seeded_warehouse().await;
        let storage = Storage::in_memory();
        let generator = ExtractGenerator::new(
            wh.clone(),
            storage.clone(),
            Arc::new(SystemClock),
            ExtractFormat::Jsonl,
            7,
            None,
        );

        let result = generator.run().await.unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.output_path.ends_with(".jsonl.gz"));
        assert!(result.size_bytes > 0);

        // Temp table was dropped.
        let today = chrono::Utc::now().date_naive().format("%Y%m%d");
        let temp = format!("control._extract_temp_{today}");
        assert_eq!(wh.table_columns(&temp).await.unwrap(), None);

        // The artifact decompresses to one JSON line with the recent trade.
        let listed = storage.list(Area::Extracts).await.unwrap();
        let rel = storage.relative(Area::Extracts, &listed[0].location).unwrap();
        let bytes = storage.get(Area::Extracts, &rel).await.unwrap();
        let mut text = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut text).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("VOD"));
    }

    #[tokio::test]
    async fn avro_extract_encodes_all_rows() {
        let wh = seeded_warehouse().await;
        let storage = Storage::in_memory();
        let generator = ExtractGenerator::new(
            wh,
            storage.clone(),
            Arc::new(SystemClock),
            ExtractFormat::Avro,
            60,
            None,
        );

        let result = generator.run().await.unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.output_path.ends_with(".avro"));

        let listed = storage.list(Area::Extracts).await.unwrap();
        let rel = storage.relative(Area::Extracts, &listed[0].location).unwrap();
        let bytes = storage.get(Area::Extracts, &rel).await.unwrap();
        let reader = apache_avro::Reader::new(&bytes[..]).unwrap();
        assert_eq!(reader.count(), 2);
    }

    #[tokio::test]
    async fn temp_table_dropped_even_when_export_fails() {
        let wh = Arc::new(MemoryWarehouse::new());
        // Column name with a dash is not a legal Avro name; schema build fails
        // after the temp table was created.
        wh.seed(
            DEFAULT_EXTRACT_TABLE,
            vec![[
                (
                    "trade_date".to_string(),
                    Value::Date(chrono::Utc::now().date_naive()),
                ),
                ("bad-name".to_string(), Value::Str("x".into())),
            ]
            .into_iter()
            .collect()],
        )
        .await;

        let generator = ExtractGenerator::new(
            wh.clone(),
            Storage::in_memory(),
            Arc::new(SystemClock),
            ExtractFormat::Avro,
            7,
            None,
        );

        assert!(generator.run().await.is_err());
        let today = chrono::Utc::now().date_naive().format("%Y%m%d");
        let temp = format!("control._extract_temp_{today}");
        assert_eq!(wh.table_columns(&temp).await.unwrap(), None);
    }
}
