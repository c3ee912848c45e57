//! # Vigil Core - Surveillance Platform Core Library
//!
//! This crate provides the foundational types, traits, and abstractions shared by
//! every component of the Vigil surveillance data platform. It defines the row value
//! model, the source specification documents, and the storage/warehouse seams that
//! the validation engine, batch orchestrator, streaming bridge, and reporter are
//! built against.
//!
//! ## Key Components
//!
//! - **Row Values**: Dynamically typed row cells (`Value`) and rows keyed by field name
//! - **Source Specs**: Declarative per-source documents (format, schema, rules, control file)
//! - **Storage**: Logical bucket areas (landing, staging, archive, failed, ...) over `object_store`
//! - **Warehouse**: Narrow query/append/describe interface with an in-memory engine for tests
//! - **Audit**: Control-table writers that never fail a pipeline run
//! - **Configuration**: Environment-driven configuration for each binary
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use vigil_core::spec::SpecRegistry;
//! use vigil_core::storage::Storage;
//!
//! # fn example() -> anyhow::Result<()> {
//! let registry = SpecRegistry::load_dir("source_specs")?;
//! let storage = Storage::in_memory();
//! # Ok(())
//! # }
//! ```

use anyhow::Result;

/// Dynamically typed row cells and canonical JSON rendering
pub mod value;

/// Declarative source specification documents and the spec registry
pub mod spec;

/// Logical object-store areas with retry and verified moves
pub mod storage;

/// Warehouse query/append/describe seam and the in-memory engine
pub mod warehouse;

/// Control-table audit writers
pub mod audit;

/// Environment-driven configuration
pub mod config;

/// Wall-clock and monotonic time abstraction
pub mod clock;

pub use value::{Row, Value};

/// Error types shared across the Vigil workspace
///
/// Component crates define their own narrow error enums; this type exists for
/// seams where a caller only needs a broad category plus context.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Configuration was missing or malformed at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// An object-store operation failed after retries
    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    /// A warehouse operation failed
    #[error(transparent)]
    Warehouse(#[from] warehouse::WarehouseError),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used at orchestration seams
pub type VigilResult<T> = Result<T, VigilError>;
