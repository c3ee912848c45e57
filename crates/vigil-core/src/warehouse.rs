//! Warehouse access seam.
//!
//! Components talk to the warehouse through a deliberately narrow interface:
//! run a parameterised query, bulk-append rows, describe a table, create or
//! drop one. Production deployments bind this to the managed warehouse engine;
//! the in-memory engine below backs tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::value::{Row, Value};

/// Errors from warehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("warehouse error: {0}")]
    Backend(String),
}

/// Narrow warehouse contract shared by every component.
///
/// Implementations must be safe for concurrent use; one client instance is
/// shared across tasks.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run a parameterised query. Placeholders are positional `?`.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, WarehouseError>;

    /// Bulk-append rows to a named table, creating it when absent.
    async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<(), WarehouseError>;

    /// User columns of a table (names starting with `_` excluded), or `None`
    /// when the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, WarehouseError>;

    /// Create a table with the given column names.
    async fn create_table(&self, table: &str, columns: &[String]) -> Result<(), WarehouseError>;

    /// Drop a table. Dropping a missing table is not an error.
    async fn drop_table(&self, table: &str) -> Result<(), WarehouseError>;
}

pub type SharedWarehouse = Arc<dyn Warehouse>;

pub mod memory {
    //! In-memory warehouse engine.
    //!
    //! Supports the query shapes the platform actually issues: a projection,
    //! `FROM <table>`, AND-joined conditions (`col = ?`, `col >= ?`,
    //! `col IS [NOT] NULL`, ...) and `LIMIT n`. Anything fancier belongs in a
    //! real engine.

    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Default)]
    struct TableData {
        columns: Vec<String>,
        rows: Vec<Row>,
    }

    /// In-process warehouse for tests and local runs.
    #[derive(Debug, Default)]
    pub struct MemoryWarehouse {
        tables: Mutex<HashMap<String, TableData>>,
    }

    impl MemoryWarehouse {
        pub fn new() -> MemoryWarehouse {
            MemoryWarehouse::default()
        }

        /// Seed a table directly, bypassing SQL. Test convenience.
        pub async fn seed(&self, table: &str, rows: Vec<Row>) {
            let mut tables = self.tables.lock().await;
            let entry = tables.entry(table.to_string()).or_default();
            for row in &rows {
                for key in row.keys() {
                    if !entry.columns.iter().any(|c| c == key) {
                        entry.columns.push(key.clone());
                    }
                }
            }
            entry.rows.extend(rows);
        }

        /// All rows of a table, in append order. Test convenience.
        pub async fn rows(&self, table: &str) -> Vec<Row> {
            let tables = self.tables.lock().await;
            tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Warehouse for MemoryWarehouse {
        async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, WarehouseError> {
            let parsed = ParsedQuery::parse(sql)?;
            let tables = self.tables.lock().await;
            let table = tables
                .get(&parsed.table)
                .ok_or_else(|| WarehouseError::TableNotFound(parsed.table.clone()))?;

            let mut param_iter = params.iter();
            let mut bound = Vec::with_capacity(parsed.conditions.len());
            for cond in &parsed.conditions {
                let value = if cond.takes_param() {
                    Some(
                        param_iter
                            .next()
                            .ok_or_else(|| {
                                WarehouseError::Query("not enough parameters".to_string())
                            })?
                            .clone(),
                    )
                } else {
                    None
                };
                bound.push((cond, value));
            }

            let mut out = Vec::new();
            for row in &table.rows {
                if bound.iter().all(|(cond, value)| cond.matches(row, value.as_ref())) {
                    out.push(parsed.project(row));
                    if let Some(limit) = parsed.limit {
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
            }
            Ok(out)
        }

        async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<(), WarehouseError> {
            let mut tables = self.tables.lock().await;
            let entry = tables.entry(table.to_string()).or_default();
            for row in rows {
                for key in row.keys() {
                    if !entry.columns.iter().any(|c| c == key) {
                        entry.columns.push(key.clone());
                    }
                }
            }
            entry.rows.extend(rows.iter().cloned());
            Ok(())
        }

        async fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, WarehouseError> {
            let tables = self.tables.lock().await;
            Ok(tables.get(table).map(|t| {
                t.columns
                    .iter()
                    .filter(|c| !c.starts_with('_'))
                    .cloned()
                    .collect()
            }))
        }

        async fn create_table(&self, table: &str, columns: &[String]) -> Result<(), WarehouseError> {
            let mut tables = self.tables.lock().await;
            tables.insert(
                table.to_string(),
                TableData {
                    columns: columns.to_vec(),
                    rows: Vec::new(),
                },
            );
            Ok(())
        }

        async fn drop_table(&self, table: &str) -> Result<(), WarehouseError> {
            let mut tables = self.tables.lock().await;
            tables.remove(table);
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum CmpOp {
        Eq,
        Ne,
        Ge,
        Le,
        Gt,
        Lt,
    }

    #[derive(Debug)]
    enum Condition {
        IsNull(String),
        IsNotNull(String),
        Compare(String, CmpOp),
    }

    impl Condition {
        fn takes_param(&self) -> bool {
            matches!(self, Condition::Compare(..))
        }

        fn matches(&self, row: &Row, param: Option<&Value>) -> bool {
            match self {
                Condition::IsNull(col) => row.get(col).map(Value::is_null).unwrap_or(true),
                Condition::IsNotNull(col) => {
                    row.get(col).map(|v| !v.is_null()).unwrap_or(false)
                }
                Condition::Compare(col, op) => {
                    let Some(cell) = row.get(col) else { return false };
                    let Some(param) = param else { return false };
                    let Some(ord) = cell.compare(param) else { return false };
                    match op {
                        CmpOp::Eq => ord.is_eq(),
                        CmpOp::Ne => ord.is_ne(),
                        CmpOp::Ge => ord.is_ge(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Lt => ord.is_lt(),
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    enum Projection {
        All,
        Columns(Vec<String>),
        Literal(i64),
    }

    #[derive(Debug)]
    struct ParsedQuery {
        projection: Projection,
        table: String,
        conditions: Vec<Condition>,
        limit: Option<usize>,
    }

    impl ParsedQuery {
        fn parse(sql: &str) -> Result<ParsedQuery, WarehouseError> {
            let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
            let lower = normalized.to_ascii_lowercase();

            let select_at = lower
                .find("select ")
                .ok_or_else(|| WarehouseError::Query(format!("unsupported query: {sql}")))?;
            let from_at = lower
                .find(" from ")
                .ok_or_else(|| WarehouseError::Query(format!("unsupported query: {sql}")))?;

            let projection_raw = normalized[select_at + 7..from_at].trim();
            let projection = if projection_raw == "*" {
                Projection::All
            } else if let Ok(lit) = projection_raw.parse::<i64>() {
                Projection::Literal(lit)
            } else {
                Projection::Columns(
                    projection_raw
                        .split(',')
                        .map(|c| c.trim().to_string())
                        .collect(),
                )
            };

            let rest = &normalized[from_at + 6..];
            let rest_lower = &lower[from_at + 6..];

            let (table_part, tail, tail_lower) = match rest_lower.find(" where ") {
                Some(at) => (&rest[..at], &rest[at + 7..], &rest_lower[at + 7..]),
                None => (rest, "", ""),
            };

            let mut limit = None;
            let mut table = table_part.trim();
            if tail.is_empty() {
                if let Some(at) = rest_lower.find(" limit ") {
                    table = rest[..at].trim();
                    limit = rest[at + 7..].trim().parse::<usize>().ok();
                }
            }

            let (where_part, where_limit) = match tail_lower.find(" limit ") {
                Some(at) => (&tail[..at], tail[at + 7..].trim().parse::<usize>().ok()),
                None => (tail, None),
            };
            if where_limit.is_some() {
                limit = where_limit;
            }

            let mut conditions = Vec::new();
            if !where_part.trim().is_empty() {
                for clause in split_case_insensitive(where_part, " and ") {
                    conditions.push(parse_condition(clause.trim())?);
                }
            }

            Ok(ParsedQuery {
                projection,
                table: table.to_string(),
                conditions,
                limit,
            })
        }

        fn project(&self, row: &Row) -> Row {
            match &self.projection {
                Projection::All => row.clone(),
                Projection::Literal(lit) => {
                    let mut out = Row::new();
                    out.insert(lit.to_string(), Value::Int(*lit));
                    out
                }
                Projection::Columns(cols) => cols
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect(),
            }
        }
    }

    fn split_case_insensitive<'a>(text: &'a str, sep: &str) -> Vec<&'a str> {
        let lower = text.to_ascii_lowercase();
        let mut parts = Vec::new();
        let mut start = 0;
        while let Some(at) = lower[start..].find(sep) {
            parts.push(&text[start..start + at]);
            start += at + sep.len();
        }
        parts.push(&text[start..]);
        parts
    }

    fn parse_condition(clause: &str) -> Result<Condition, WarehouseError> {
        let lower = clause.to_ascii_lowercase();
        if let Some(col) = lower.strip_suffix(" is not null") {
            return Ok(Condition::IsNotNull(clause[..col.len()].trim().to_string()));
        }
        if let Some(col) = lower.strip_suffix(" is null") {
            return Ok(Condition::IsNull(clause[..col.len()].trim().to_string()));
        }
        for (text, op) in [
            (">=", CmpOp::Ge),
            ("<=", CmpOp::Le),
            ("!=", CmpOp::Ne),
            (">", CmpOp::Gt),
            ("<", CmpOp::Lt),
            ("=", CmpOp::Eq),
        ] {
            if let Some(at) = clause.find(text) {
                let col = clause[..at].trim().to_string();
                let rhs = clause[at + text.len()..].trim();
                if rhs != "?" {
                    return Err(WarehouseError::Query(format!(
                        "only positional parameters are supported, got '{clause}'"
                    )));
                }
                return Ok(Condition::Compare(col, op));
            }
        }
        Err(WarehouseError::Query(format!(
            "unsupported condition: {clause}"
        )))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn row(pairs: &[(&str, Value)]) -> Row {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        }

        #[tokio::test]
        async fn filters_on_equality_and_null() {
            let wh = MemoryWarehouse::new();
            wh.seed(
                "snapshots.traders_snapshot",
                vec![
                    row(&[
                        ("trader_id", Value::Str("T1".into())),
                        ("trader_name", Value::Str("Ada".into())),
                        ("dbt_valid_to", Value::Null),
                    ]),
                    row(&[
                        ("trader_id", Value::Str("T1".into())),
                        ("trader_name", Value::Str("Old Ada".into())),
                        ("dbt_valid_to", Value::Str("2023-01-01".into())),
                    ]),
                ],
            )
            .await;

            let rows = wh
                .query(
                    "SELECT trader_id, trader_name FROM snapshots.traders_snapshot \
                     WHERE trader_id = ? AND dbt_valid_to IS NULL LIMIT 1",
                    &[Value::Str("T1".into())],
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["trader_name"], Value::Str("Ada".into()));
        }

        #[tokio::test]
        async fn select_literal_for_existence_probe() {
            let wh = MemoryWarehouse::new();
            wh.seed(
                "control.regulatory_submissions",
                vec![row(&[("event_id", Value::Str("abc".into()))])],
            )
            .await;

            let hit = wh
                .query(
                    "SELECT 1 FROM control.regulatory_submissions WHERE event_id = ? LIMIT 1",
                    &[Value::Str("abc".into())],
                )
                .await
                .unwrap();
            assert_eq!(hit.len(), 1);

            let miss = wh
                .query(
                    "SELECT 1 FROM control.regulatory_submissions WHERE event_id = ? LIMIT 1",
                    &[Value::Str("zzz".into())],
                )
                .await
                .unwrap();
            assert!(miss.is_empty());
        }

        #[tokio::test]
        async fn range_condition_on_dates() {
            let wh = MemoryWarehouse::new();
            wh.seed(
                "consumer.markets_extract",
                vec![
                    row(&[("trade_date", Value::Date("2024-01-10".parse().unwrap()))]),
                    row(&[("trade_date", Value::Date("2024-01-01".parse().unwrap()))]),
                ],
            )
            .await;

            let rows = wh
                .query(
                    "SELECT * FROM consumer.markets_extract WHERE trade_date >= ?",
                    &[Value::Date("2024-01-08".parse().unwrap())],
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
        }

        #[tokio::test]
        async fn table_columns_hide_internal() {
            let wh = MemoryWarehouse::new();
            wh.create_table(
                "raw_trades",
                &[
                    "a".to_string(),
                    "b".to_string(),
                    "_load_id".to_string(),
                    "_extra".to_string(),
                ],
            )
            .await
            .unwrap();

            assert_eq!(
                wh.table_columns("raw_trades").await.unwrap(),
                Some(vec!["a".to_string(), "b".to_string()])
            );
            assert_eq!(wh.table_columns("absent").await.unwrap(), None);
        }
    }
}
