//! # Vigil Report - Regulatory Reporting Service
//!
//! Low-latency submission of regulatory events, backed by a process-local
//! reference-data cache. Submissions are idempotent: every event gets a
//! deterministic id derived from its business identity, duplicates are
//! answered without a second outbound call, and deliveries that exhaust their
//! retry budget are dead-lettered with the original payload.
//!
//! The cache holds five independent maps refreshed together from warehouse
//! snapshots. Refresh builds new maps off to the side and swaps the live
//! snapshot atomically; a reader never observes one map from the old world
//! and another from the new. Individual misses fall back to single-key
//! warehouse queries with a short deadline and repopulate only the map they
//! missed in.

/// Reference-data cache with atomic refresh and cache-aside fallback
pub mod cache;

/// Idempotent retrying submission and dead-lettering
pub mod submit;

/// HTTP surface (health, submit, admin)
pub mod http;

pub use cache::{CacheStatus, ReferenceCache, RefreshOutcome};
pub use http::{build_reporter, router, Reporter};
pub use submit::{
    generate_event_id, SubmitResult, SubmitStatus, SubmitTransport, Submitter, TransportFailure,
    TransportResponse,
};
