//! Declarative source specifications.
//!
//! One YAML document per logical source describes where its files land, how to
//! parse them, the expected schema, row-level validation rules, and an optional
//! control file carrying the authoritative row count. The registry loads every
//! document under a directory tree and matches landed objects to specs by glob,
//! first match wins in load order.
//!
//! # Example document
//!
//! ```yaml
//! name: murex_trades
//! source:
//!   path_pattern: "trades/trades_*.csv"
//!   format: csv
//! schema:
//!   - name: trade_id
//!     type: STRING
//!     nullable: false
//!   - name: quantity
//!     type: FLOAT64
//! validation:
//!   row_level:
//!     - rule: "quantity > 0"
//!       severity: error
//! control_file:
//!   type: trailer
//!   row_count_column: 1
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Errors raised while loading or matching source specs.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("failed to read spec file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse spec file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate spec name '{0}'")]
    DuplicateName(String),
    #[error("invalid path pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Supported source file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Json,
    Jsonl,
    Xml,
    Parquet,
}

/// Column types, mirroring the warehouse type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Int64,
    Float64,
    Numeric,
    Bool,
    Timestamp,
    Date,
    Time,
    Datetime,
    Bytes,
    Json,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int64 | FieldType::Float64 | FieldType::Numeric)
    }
}

/// Rule severity. Only `error` failures quarantine a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

/// Where and how files for this source arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    /// Glob against the object path with the landing prefix stripped.
    pub path_pattern: String,
    pub format: SourceFormat,

    /// CSV delimiter, single byte. Defaults to a comma.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Declared text encoding. Only utf-8 is currently honoured.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// XML element that delimits one row. May carry a namespace prefix
    /// (`ns:Trade`) which must resolve via `xml_config.namespaces`.
    #[serde(default)]
    pub row_element: Option<String>,
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// One declared schema field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub allowed_values: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub min_value: Option<serde_json::Value>,
    #[serde(default)]
    pub max_value: Option<serde_json::Value>,
    /// Child-element path for XML sources.
    #[serde(default)]
    pub xpath: Option<String>,
}

fn default_nullable() -> bool {
    true
}

/// One row-level validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule: String,
    #[serde(default)]
    pub severity: Severity,
}

/// Row-level validation section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub row_level: Vec<RuleSpec>,
}

/// Control-file variants providing the authoritative row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFileSpec {
    /// Companion XML object; row count read via an element path.
    SidecarXml { pattern: String, xpath_row_count: String },
    /// Companion single-row CSV; row count in a named column.
    SidecarCsv { pattern: String, row_count_field: String },
    /// Last data row carries the count and is removed before staging.
    Trailer { row_count_column: usize },
}

/// XML namespace configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmlConfig {
    /// Prefix -> namespace URI.
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
}

/// A complete source specification document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub source: SourceSection,
    pub schema: Vec<FieldSpec>,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub control_file: Option<ControlFileSpec>,
    #[serde(default)]
    pub xml_config: Option<XmlConfig>,
}

impl SourceSpec {
    /// Parse a single YAML document.
    pub fn from_yaml(path: &Path, text: &str) -> Result<SourceSpec, SpecError> {
        serde_yaml::from_str(text).map_err(|source| SpecError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Static validation of this document.
    ///
    /// Returns hard errors and advisory warnings; mirrors what the spec
    /// linter binary reports.
    pub fn lint(&self) -> LintReport {
        let mut report = LintReport::default();

        if self.name.trim().is_empty() {
            report.errors.push("spec name is empty".to_string());
        }
        if self.source.path_pattern.trim().is_empty() {
            report.errors.push("source.path_pattern is empty".to_string());
        }
        if let Err(e) = glob::Pattern::new(&self.source.path_pattern) {
            report
                .errors
                .push(format!("invalid path_pattern '{}': {e}", self.source.path_pattern));
        }
        if self.schema.is_empty() {
            report.errors.push("schema is empty".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.schema {
            if field.name.trim().is_empty() {
                report.errors.push("schema field with empty name".to_string());
                continue;
            }
            if !seen.insert(field.name.as_str()) {
                report
                    .errors
                    .push(format!("duplicate field name: {}", field.name));
            }
            if (field.min_value.is_some() || field.max_value.is_some())
                && !field.field_type.is_numeric()
            {
                report.errors.push(format!(
                    "field '{}' has min/max_value but type is {:?}",
                    field.name, field.field_type
                ));
            }
            if self.source.format == SourceFormat::Xml && field.xpath.is_none() {
                report
                    .errors
                    .push(format!("XML field '{}' missing 'xpath'", field.name));
            }
        }

        if self.source.format == SourceFormat::Xml && self.source.row_element.is_none() {
            report
                .errors
                .push("XML format requires 'row_element' in source config".to_string());
        }

        // A rule text that appears under both severities is ill-formed.
        let mut by_text: BTreeMap<&str, Severity> = BTreeMap::new();
        for rule in &self.validation.row_level {
            match by_text.get(rule.rule.as_str()) {
                Some(prev) if *prev != rule.severity => {
                    report.errors.push(format!(
                        "rule '{}' declared with both error and warning severity",
                        rule.rule
                    ));
                }
                _ => {
                    by_text.insert(rule.rule.as_str(), rule.severity);
                }
            }
        }

        if let Some(ControlFileSpec::SidecarXml { xpath_row_count, .. }) = &self.control_file {
            if xpath_row_count.trim().is_empty() {
                report
                    .warnings
                    .push("sidecar_xml control file has an empty xpath_row_count".to_string());
            }
        }
        if let Some(ControlFileSpec::SidecarCsv { row_count_field, .. }) = &self.control_file {
            if row_count_field.trim().is_empty() {
                report
                    .warnings
                    .push("sidecar_csv control file has an empty row_count_field".to_string());
            }
        }

        report
    }
}

/// Outcome of linting a spec document.
#[derive(Debug, Default)]
pub struct LintReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl LintReport {
    pub fn is_clean(&self, strict: bool) -> bool {
        self.errors.is_empty() && (!strict || self.warnings.is_empty())
    }
}

/// All loaded source specs, in matching order.
#[derive(Debug, Clone)]
pub struct SpecRegistry {
    specs: Vec<(glob::Pattern, SourceSpec)>,
}

impl SpecRegistry {
    /// Load every `*.yaml` under a directory tree.
    ///
    /// Files are visited in sorted path order so first-match-wins behaviour
    /// is deterministic across runs.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<SpecRegistry, SpecError> {
        let paths = spec_files(dir)?;

        let mut specs: Vec<(glob::Pattern, SourceSpec)> = Vec::new();
        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(|source| SpecError::Io {
                path: path.clone(),
                source,
            })?;
            let spec = SourceSpec::from_yaml(&path, &text)?;
            if specs.iter().any(|(_, s)| s.name == spec.name) {
                return Err(SpecError::DuplicateName(spec.name));
            }
            let pattern = compile_pattern(&spec.source.path_pattern)?;
            debug!(name = %spec.name, path = %path.display(), "loaded source spec");
            specs.push((pattern, spec));
        }

        info!(count = specs.len(), "source specs loaded");
        Ok(SpecRegistry { specs })
    }

    /// Build a registry directly from documents (tests, embedded specs).
    pub fn from_specs(specs: Vec<SourceSpec>) -> Result<SpecRegistry, SpecError> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = compile_pattern(&spec.source.path_pattern)?;
            out.push((pattern, spec));
        }
        Ok(SpecRegistry { specs: out })
    }

    /// Match an object path (landing prefix already stripped) to a spec.
    pub fn match_path(&self, object_path: &str) -> Option<&SourceSpec> {
        self.specs
            .iter()
            .find(|(pattern, _)| pattern.matches(object_path))
            .map(|(_, spec)| spec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceSpec> {
        self.specs.iter().map(|(_, s)| s)
    }
}

/// Patterns may be written against the full landing layout; the well-known
/// prefix is stripped so they match the paths the lister yields.
fn compile_pattern(pattern: &str) -> Result<glob::Pattern, SpecError> {
    let stripped = pattern.strip_prefix("landing/").unwrap_or(pattern);
    glob::Pattern::new(stripped).map_err(|source| SpecError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Every spec document under a directory tree, in sorted path order.
pub fn spec_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, SpecError> {
    let mut paths = Vec::new();
    collect_yaml(dir.as_ref(), &mut paths)?;
    paths.sort();
    Ok(paths)
}

fn collect_yaml(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SpecError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SpecError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SpecError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRADES_SPEC: &str = r#"
name: murex_trades
source:
  path_pattern: "landing/trades/trades_*.csv"
  format: csv
schema:
  - name: trade_id
    type: STRING
    nullable: false
  - name: quantity
    type: FLOAT64
    min_value: 0
validation:
  row_level:
    - rule: "quantity > 0"
      severity: error
    - rule: "side in ('BUY', 'SELL')"
      severity: warning
control_file:
  type: trailer
  row_count_column: 1
"#;

    #[test]
    fn parses_full_document() {
        let spec = SourceSpec::from_yaml(Path::new("trades.yaml"), TRADES_SPEC).unwrap();
        assert_eq!(spec.name, "murex_trades");
        assert_eq!(spec.source.format, SourceFormat::Csv);
        assert_eq!(spec.source.delimiter, ',');
        assert!(!spec.schema[0].nullable);
        assert!(spec.schema[1].nullable);
        assert_eq!(spec.validation.row_level.len(), 2);
        assert!(matches!(
            spec.control_file,
            Some(ControlFileSpec::Trailer { row_count_column: 1 })
        ));
        assert!(spec.lint().is_clean(true));
    }

    #[test]
    fn first_match_wins_with_landing_prefix_stripped() {
        let generic: SourceSpec = serde_yaml::from_str(
            r#"
name: generic_trades
source:
  path_pattern: "trades/*.csv"
  format: csv
schema:
  - name: trade_id
    type: STRING
"#,
        )
        .unwrap();
        let specific = SourceSpec::from_yaml(Path::new("t.yaml"), TRADES_SPEC).unwrap();

        let registry = SpecRegistry::from_specs(vec![specific, generic]).unwrap();
        let hit = registry.match_path("trades/trades_20240115.csv").unwrap();
        assert_eq!(hit.name, "murex_trades");
        let fallback = registry.match_path("trades/eod.csv").unwrap();
        assert_eq!(fallback.name, "generic_trades");
        assert!(registry.match_path("positions/p.csv").is_none());
    }

    #[test]
    fn lint_flags_min_max_on_string_and_missing_row_element() {
        let spec: SourceSpec = serde_yaml::from_str(
            r#"
name: bad
source:
  path_pattern: "x/*.xml"
  format: xml
schema:
  - name: a
    type: STRING
    min_value: 1
  - name: a
    type: STRING
"#,
        )
        .unwrap();
        let report = spec.lint();
        assert!(report.errors.iter().any(|e| e.contains("min/max_value")));
        assert!(report.errors.iter().any(|e| e.contains("duplicate field")));
        assert!(report.errors.iter().any(|e| e.contains("row_element")));
        assert!(report.errors.iter().any(|e| e.contains("missing 'xpath'")));
    }

    #[test]
    fn lint_rejects_conflicting_severities() {
        let spec: SourceSpec = serde_yaml::from_str(
            r#"
name: s
source:
  path_pattern: "x/*.csv"
  format: csv
schema:
  - name: a
    type: STRING
validation:
  row_level:
    - rule: "a is not null"
      severity: error
    - rule: "a is not null"
      severity: warning
"#,
        )
        .unwrap();
        assert!(!spec.lint().is_clean(false));
    }
}
