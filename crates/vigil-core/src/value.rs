//! Dynamically typed row values.
//!
//! Parsed files and warehouse query results are rows keyed by field name. Cells
//! are `Value` variants rather than a fixed struct so the same row model can
//! carry any source schema, survive schema drift, and round-trip through JSON
//! for quarantine records and the `_extra` sidecar column.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A single parsed row, keyed by field name.
pub type Row = BTreeMap<String, Value>;

/// A dynamically typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    /// Exact decimal for NUMERIC columns; preserved as text in columnar output.
    Dec(BigDecimal),
    Bool(bool),
    Ts(DateTime<Utc>),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the string payload, if this is a string cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two values of compatible types.
    ///
    /// Int/Float/Dec cross-compare numerically. Incompatible types return
    /// `None` and the caller decides how strict to be.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Dec(a), Dec(b)) => Some(a.cmp(b)),
            (Dec(a), Int(b)) => Some(a.cmp(&BigDecimal::from(*b))),
            (Int(a), Dec(b)) => Some(BigDecimal::from(*a).cmp(b)),
            (Dec(a), Float(b)) => BigDecimal::try_from(*b).ok().map(|b| a.cmp(&b)),
            (Float(a), Dec(b)) => BigDecimal::try_from(*a).ok().map(|a| a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Ts(a), Ts(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Render to a JSON value for quarantine records and `_extra` payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(v) => serde_json::Value::Number((*v).into()),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Dec(d) => serde_json::Value::String(d.to_string()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Ts(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
        }
    }

    /// Build a value from a JSON cell (JSON/JSONL sources, `_extra` decode).
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            // Nested structures are kept as their JSON text
            other => Value::Str(other.to_string()),
        }
    }

    /// Parse an ISO-8601 timestamp, accepting `Z`, explicit offsets, or a
    /// naive datetime treated as UTC.
    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()?;
        Some(DateTime::from_naive_utc_and_offset(naive, Utc))
    }

    pub fn parse_date(s: &str) -> Option<NaiveDate> {
        NaiveDate::from_str(s).ok()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Dec(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Ts(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Date(d) => write!(f, "{d}"),
        }
    }
}

/// Render a row as a JSON object.
pub fn row_to_json(row: &Row) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

/// Canonical JSON rendering: object keys sorted recursively, no whitespace.
///
/// Payload hashes must be stable across processes, so the rendering cannot
/// depend on insertion order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cross_comparisons() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Dec(BigDecimal::from_str("1.50").unwrap()).compare(&Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Str("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn timestamp_accepts_zulu_and_offset() {
        let a = Value::parse_timestamp("2024-01-15T10:30:00Z").unwrap();
        let b = Value::parse_timestamp("2024-01-15T10:30:00+00:00").unwrap();
        let c = Value::parse_timestamp("2024-01-15T10:30:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(Value::parse_timestamp("not a time").is_none());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": [3, {"z": 1, "y": 2}]}}"#).unwrap();
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":[3,{"y":2,"z":1}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_is_insertion_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
