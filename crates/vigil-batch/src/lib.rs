//! # Vigil Batch - Pipeline Orchestration
//!
//! A hermetic per-run coordinator for the batch pipeline: validate landing
//! files, run the warehouse transformation build, archive exactly the staging
//! artifacts this run validated, optionally generate the partner extract, and
//! leave health markers behind.
//!
//! The load-bearing invariant: a file is archived only if it was validated in
//! the same run. The archiver receives the run's `validated_output_paths` and
//! moves nothing else, so artifacts staged by a run that started later are
//! left alone. A transformation failure never skips archival; re-validating
//! already-staged files would double-load them.

/// Phase sequencing and the run outcome
pub mod orchestrator;

/// External transformation runner (dbt-style subprocess)
pub mod dbt;

/// Archival of validated staging artifacts
pub mod archive;

/// Partner extract generation
pub mod extract;

/// Health markers
pub mod health;

pub use orchestrator::{Orchestrator, RunOutcome};
