//! Archival of validated staging artifacts.
//!
//! Moves every staging object named in the run's validated set to
//! `archive/<YYYY-MM-DD>/<HHMM>/<original path>`. Staging objects not in the
//! set belong to a run that started after this one; they are skipped and
//! picked up by their own run's archival.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use vigil_core::storage::{Area, Storage};

/// Result of one archival pass.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub files_moved: usize,
    pub files_skipped: usize,
    pub archive_prefix: String,
}

/// Move this run's validated artifacts into the dated archive layout.
pub async fn archive_validated(
    storage: &Storage,
    validated: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Result<ArchiveResult> {
    let archive_prefix = format!("{}/{}", now.format("%Y-%m-%d"), now.format("%H%M"));

    let mut files_moved = 0;
    let mut files_skipped = 0;

    let listed = storage.list(Area::Staging).await.context("list staging area")?;
    for meta in listed {
        let Some(rel) = storage.relative(Area::Staging, &meta.location) else {
            continue;
        };
        if !validated.contains(&rel) {
            // Arrived after this run began; not ours to move.
            debug!(artifact = %rel, "skipping staging object outside this run");
            files_skipped += 1;
            continue;
        }

        let destination = format!("{archive_prefix}/{rel}");
        storage
            .move_object(Area::Staging, &rel, Area::Archive, &destination)
            .await
            .with_context(|| format!("archive {rel}"))?;
        debug!(source = %rel, destination = %destination, "file archived");
        files_moved += 1;
    }

    info!(
        files_moved,
        files_skipped,
        archive_prefix = %archive_prefix,
        "archive complete"
    );
    Ok(ArchiveResult {
        files_moved,
        files_skipped,
        archive_prefix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    #[tokio::test]
    async fn moves_only_validated_artifacts() {
        let storage = Storage::in_memory();
        for name in ["trades/a.parquet", "trades/b.parquet", "late/c.parquet"] {
            storage
                .put(Area::Staging, name, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let validated: BTreeSet<String> =
            ["trades/a.parquet", "trades/b.parquet"].iter().map(|s| s.to_string()).collect();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 6, 30, 0).unwrap();

        let result = archive_validated(&storage, &validated, now).await.unwrap();
        assert_eq!(result.files_moved, 2);
        assert_eq!(result.files_skipped, 1);
        assert_eq!(result.archive_prefix, "2024-01-15/0630");

        // Validated artifacts moved; the late arrival stayed in staging.
        assert!(storage
            .exists(Area::Archive, "2024-01-15/0630/trades/a.parquet")
            .await
            .unwrap());
        assert!(!storage.exists(Area::Staging, "trades/a.parquet").await.unwrap());
        assert!(storage.exists(Area::Staging, "late/c.parquet").await.unwrap());
    }

    #[tokio::test]
    async fn empty_set_moves_nothing() {
        let storage = Storage::in_memory();
        storage
            .put(Area::Staging, "trades/a.parquet", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let result =
            archive_validated(&storage, &BTreeSet::new(), Utc::now()).await.unwrap();
        assert_eq!(result.files_moved, 0);
        assert_eq!(result.files_skipped, 1);
    }
}
