//! # Vigil Validate - File Validation Engine
//!
//! Matches landed objects against declarative source specs, parses CSV/JSON/XML
//! payloads, enforces schema and row-level rules, reconciles control-file row
//! counts, and persists accepted rows as parquet artifacts in the staging area.
//!
//! The engine keeps exactly-once file semantics by verifying every staging
//! write before the source object is deleted: a file either reaches staging
//! and leaves landing, or stays in landing for the next run. Rejected files
//! move to the failed area with an error note; rows that fail validation in an
//! otherwise good file are quarantined as JSONL without failing the file.
//!
//! ## Pipeline per file
//!
//! ```text
//! landed -> matched -> parsed -> validated -> staged(verified) -> source deleted
//!             |           |          |             |
//!          unmatched   parse err  count mismatch  write race
//!             `-----------+----------+-------------> failed/  (+ .error.txt)
//! ```

/// Row-level rule grammar: parser and evaluator
pub mod rules;

/// Field-level checks and type conversion
pub mod rowcheck;

/// Format parsers (CSV, JSON/JSONL, XML)
pub mod parsers;

/// Control-file row count reconciliation
pub mod control;

/// Parquet staging artifacts with verified writes
pub mod staging;

/// The validation engine
pub mod validator;

pub use validator::{FileOutcome, ValidationRun, Validator};
