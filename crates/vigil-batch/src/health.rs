//! Run health markers.
//!
//! Every run writes a JSON marker to `_health/latest.json` (overwritten) and
//! `_health/runs/<run_id>.json` (append-only history). Monitoring reads the
//! latest marker; incident review walks the history. Marker writes never fail
//! a run.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use vigil_core::storage::{Area, Storage};

/// The health marker document.
#[derive(Debug, Clone, Serialize)]
pub struct RunMarker {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub files_passed: usize,
    pub files_failed: usize,
    pub rows_validated: i64,
    pub rows_quarantined: i64,
    pub transformation_success: bool,
    pub models_failed: usize,
    pub files_archived: usize,
    pub extract_rows: Option<i64>,
    pub duration_seconds: f64,
}

/// Write both markers; failures are logged and swallowed.
pub async fn write_markers(storage: &Storage, marker: &RunMarker) {
    let body = match serde_json::to_vec_pretty(marker) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            warn!(error = %e, "failed to serialise health marker");
            return;
        }
    };

    if let Err(e) = storage.put(Area::Health, "latest.json", body.clone()).await {
        warn!(error = %e, "failed to write latest health marker");
    }
    let run_marker = format!("runs/{}.json", marker.run_id);
    if let Err(e) = storage.put(Area::Health, &run_marker, body).await {
        warn!(error = %e, "failed to write run health marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_latest_and_run_marker() {
        let storage = Storage::in_memory();
        let marker = RunMarker {
            run_id: "run_20240115_060000".into(),
            timestamp: Utc::now(),
            success: true,
            files_passed: 3,
            files_failed: 0,
            rows_validated: 42,
            rows_quarantined: 1,
            transformation_success: true,
            models_failed: 0,
            files_archived: 3,
            extract_rows: None,
            duration_seconds: 12.5,
        };

        write_markers(&storage, &marker).await;

        let latest = storage.get(Area::Health, "latest.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&latest).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["files_passed"], 3);

        assert!(storage
            .exists(Area::Health, "runs/run_20240115_060000.json")
            .await
            .unwrap());
    }
}
