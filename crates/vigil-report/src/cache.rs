//! Reference-data cache.
//!
//! Five maps, one snapshot. Refresh executes the read-only reference queries,
//! builds complete replacement maps, and swaps the live snapshot pointer in
//! one motion; reader critical sections are a pointer clone. Lookups that miss
//! fall back to a parameterised single-key query with a short deadline and
//! write back only to the map that missed. Counterparty-by-id and
//! counterparty-by-name are deliberately disjoint caches: the same entity may
//! live in both, but neither lookup path ever populates the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use vigil_core::clock::SharedClock;
use vigil_core::value::{Row, Value};
use vigil_core::warehouse::SharedWarehouse;

const TRADERS_QUERY: &str = "SELECT trader_id, trader_name, desk_id, compliance_officer \
     FROM snapshots.traders_snapshot WHERE dbt_valid_to IS NULL";
const COUNTERPARTIES_QUERY: &str = "SELECT counterparty_id, counterparty_name, lei, country \
     FROM snapshots.counterparties_snapshot WHERE dbt_valid_to IS NULL";
const INSTRUMENTS_QUERY: &str =
    "SELECT instrument_id, symbol, isin, asset_class, currency FROM curation.dim_instrument";
const BOOKS_QUERY: &str = "SELECT book_id, book_name, desk_id, legal_entity \
     FROM snapshots.books_snapshot WHERE dbt_valid_to IS NULL";

/// One generation of reference data.
///
/// The maps carry interior locks so cache-aside insertions can write into the
/// current generation; replacing the generation itself is the outer pointer
/// swap.
#[derive(Debug, Default)]
pub struct ReferenceSnapshot {
    traders: RwLock<HashMap<String, Row>>,
    counterparties_by_id: RwLock<HashMap<String, Row>>,
    counterparties_by_name: RwLock<HashMap<String, Row>>,
    instruments: RwLock<HashMap<String, Row>>,
    books: RwLock<HashMap<String, Row>>,
    last_refresh: Option<DateTime<Utc>>,
}

/// Result of a refresh request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RefreshOutcome {
    Success {
        duration_seconds: f64,
        counts: CacheCounts,
        refreshed_at: DateTime<Utc>,
    },
    Skipped {
        reason: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheCounts {
    pub traders: usize,
    pub counterparties_by_id: usize,
    pub counterparties_by_name: usize,
    pub instruments: usize,
    pub books: usize,
}

/// Cache status for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub last_refresh: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub refresh_in_progress: bool,
    pub counts: CacheCounts,
}

/// Process-local reference cache with single-writer refresh.
pub struct ReferenceCache {
    warehouse: SharedWarehouse,
    clock: SharedClock,
    snapshot: RwLock<Arc<ReferenceSnapshot>>,
    refresh_in_progress: AtomicBool,
    miss_timeout: Duration,
    stale_threshold_seconds: i64,
}

impl ReferenceCache {
    pub fn new(
        warehouse: SharedWarehouse,
        clock: SharedClock,
        miss_timeout: Duration,
        stale_threshold_seconds: i64,
    ) -> ReferenceCache {
        ReferenceCache {
            warehouse,
            clock,
            snapshot: RwLock::new(Arc::new(ReferenceSnapshot::default())),
            refresh_in_progress: AtomicBool::new(false),
            miss_timeout,
            stale_threshold_seconds,
        }
    }

    /// Current snapshot; the critical section is the pointer clone.
    fn current(&self) -> Arc<ReferenceSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rebuild every map from the warehouse and swap the snapshot.
    ///
    /// A refresh already in flight turns a non-forced request into a no-op.
    /// On failure the previous snapshot stays live.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
            && !force
        {
            return RefreshOutcome::Skipped {
                reason: "refresh_in_progress".to_string(),
            };
        }

        let started = self.clock.monotonic();
        let outcome = self.refresh_inner().await;
        self.refresh_in_progress.store(false, Ordering::SeqCst);

        match outcome {
            Ok(counts) => {
                let refreshed_at = self.clock.now_utc();
                let duration = started.elapsed().as_secs_f64();
                info!(
                    duration_seconds = duration,
                    traders = counts.traders,
                    counterparties = counts.counterparties_by_id,
                    instruments = counts.instruments,
                    books = counts.books,
                    "cache refreshed"
                );
                RefreshOutcome::Success {
                    duration_seconds: duration,
                    counts,
                    refreshed_at,
                }
            }
            Err(e) => {
                error!(error = %e, "cache refresh failed, keeping previous snapshot");
                RefreshOutcome::Error { error: format!("{e:#}") }
            }
        }
    }

    async fn refresh_inner(&self) -> anyhow::Result<CacheCounts> {
        let traders = index_by(self.warehouse.query(TRADERS_QUERY, &[]).await?, "trader_id");

        let counterparty_rows = self.warehouse.query(COUNTERPARTIES_QUERY, &[]).await?;
        let counterparties_by_id = index_by(counterparty_rows.clone(), "counterparty_id");
        let mut counterparties_by_name: HashMap<String, Row> = HashMap::new();
        for row in counterparty_rows {
            // First writer wins so a name collision cannot silently remap.
            if let Some(name) = key_of(&row, "counterparty_name") {
                counterparties_by_name.entry(name).or_insert(row);
            }
        }

        let instruments = index_by(
            self.warehouse.query(INSTRUMENTS_QUERY, &[]).await?,
            "instrument_id",
        );
        let books = index_by(self.warehouse.query(BOOKS_QUERY, &[]).await?, "book_id");

        let counts = CacheCounts {
            traders: traders.len(),
            counterparties_by_id: counterparties_by_id.len(),
            counterparties_by_name: counterparties_by_name.len(),
            instruments: instruments.len(),
            books: books.len(),
        };

        let fresh = Arc::new(ReferenceSnapshot {
            traders: RwLock::new(traders),
            counterparties_by_id: RwLock::new(counterparties_by_id),
            counterparties_by_name: RwLock::new(counterparties_by_name),
            instruments: RwLock::new(instruments),
            books: RwLock::new(books),
            last_refresh: Some(self.clock.now_utc()),
        });

        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        Ok(counts)
    }

    pub async fn get_trader(&self, trader_id: &str) -> Option<Row> {
        self.lookup(
            trader_id,
            |snapshot| &snapshot.traders,
            "SELECT trader_id, trader_name, desk_id, compliance_officer \
             FROM snapshots.traders_snapshot WHERE trader_id = ? AND dbt_valid_to IS NULL LIMIT 1",
            "traders",
        )
        .await
    }

    pub async fn get_counterparty(&self, counterparty_id: &str) -> Option<Row> {
        self.lookup(
            counterparty_id,
            |snapshot| &snapshot.counterparties_by_id,
            "SELECT counterparty_id, counterparty_name, lei, country \
             FROM snapshots.counterparties_snapshot \
             WHERE counterparty_id = ? AND dbt_valid_to IS NULL LIMIT 1",
            "counterparties_by_id",
        )
        .await
    }

    pub async fn get_counterparty_by_name(&self, counterparty_name: &str) -> Option<Row> {
        self.lookup(
            counterparty_name,
            |snapshot| &snapshot.counterparties_by_name,
            "SELECT counterparty_id, counterparty_name, lei, country \
             FROM snapshots.counterparties_snapshot \
             WHERE counterparty_name = ? AND dbt_valid_to IS NULL LIMIT 1",
            "counterparties_by_name",
        )
        .await
    }

    pub async fn get_instrument(&self, instrument_id: &str) -> Option<Row> {
        self.lookup(
            instrument_id,
            |snapshot| &snapshot.instruments,
            "SELECT instrument_id, symbol, isin, asset_class, currency \
             FROM curation.dim_instrument WHERE instrument_id = ? LIMIT 1",
            "instruments",
        )
        .await
    }

    /// Cache-aside: snapshot map first, then a bounded single-key query.
    /// A database hit repopulates only the map that missed.
    async fn lookup(
        &self,
        key: &str,
        map: impl Fn(&ReferenceSnapshot) -> &RwLock<HashMap<String, Row>>,
        sql: &str,
        table: &str,
    ) -> Option<Row> {
        let snapshot = self.current();
        if let Some(hit) = read(map(&snapshot)).get(key) {
            return Some(hit.clone());
        }

        warn!(table, key, "cache miss, falling back to warehouse");
        let params = [Value::Str(key.to_string())];
        let query = self.warehouse.query(sql, &params);
        match tokio::time::timeout(self.miss_timeout, query).await {
            Ok(Ok(rows)) => {
                let row = rows.into_iter().next()?;
                map(&snapshot)
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(key.to_string(), row.clone());
                Some(row)
            }
            Ok(Err(e)) => {
                error!(table, key, error = %e, "cache fallback query failed");
                None
            }
            Err(_) => {
                error!(table, key, "cache fallback query timed out");
                None
            }
        }
    }

    pub fn status(&self) -> CacheStatus {
        let snapshot = self.current();
        let is_stale = snapshot.last_refresh.is_some_and(|at| {
            (self.clock.now_utc() - at).num_seconds() > self.stale_threshold_seconds
        });
        let status = CacheStatus {
            last_refresh: snapshot.last_refresh,
            is_stale,
            refresh_in_progress: self.refresh_in_progress.load(Ordering::SeqCst),
            counts: CacheCounts {
                traders: read(&snapshot.traders).len(),
                counterparties_by_id: read(&snapshot.counterparties_by_id).len(),
                counterparties_by_name: read(&snapshot.counterparties_by_name).len(),
                instruments: read(&snapshot.instruments).len(),
                books: read(&snapshot.books).len(),
            },
        };
        status
    }

    #[cfg(test)]
    pub(crate) fn test_snapshot(&self) -> Arc<ReferenceSnapshot> {
        self.current()
    }

    #[cfg(test)]
    pub(crate) fn test_set_refresh_in_progress(&self, value: bool) {
        self.refresh_in_progress.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl ReferenceSnapshot {
    pub(crate) fn counterparty_by_id(&self, key: &str) -> Option<Row> {
        read(&self.counterparties_by_id).get(key).cloned()
    }

    pub(crate) fn counterparty_by_name(&self, key: &str) -> Option<Row> {
        read(&self.counterparties_by_name).get(key).cloned()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn key_of(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(Value::Null) | None => None,
        Some(value) => {
            let key = value.to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        }
    }
}

fn index_by(rows: Vec<Row>, column: &str) -> HashMap<String, Row> {
    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(key) = key_of(&row, column) {
            map.insert(key, row);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::clock::SystemClock;
    use vigil_core::warehouse::memory::MemoryWarehouse;
    use vigil_core::warehouse::Warehouse;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Str(v.to_string())))
            .collect()
    }

    async fn seed_counterparties(wh: &MemoryWarehouse, rows: Vec<Row>) {
        wh.seed("snapshots.counterparties_snapshot", rows).await;
    }

    fn cache(wh: &Arc<MemoryWarehouse>) -> ReferenceCache {
        ReferenceCache::new(
            wh.clone(),
            Arc::new(SystemClock),
            Duration::from_secs(5),
            600,
        )
    }

    async fn seed_all(wh: &Arc<MemoryWarehouse>) {
        wh.seed(
            "snapshots.traders_snapshot",
            vec![row(&[
                ("trader_id", "T1"),
                ("trader_name", "Ada"),
                ("desk_id", "D1"),
                ("compliance_officer", "Grace"),
            ])],
        )
        .await;
        seed_counterparties(
            wh,
            vec![row(&[
                ("counterparty_id", "C1"),
                ("counterparty_name", "Acme"),
                ("lei", "LEI1"),
                ("country", "GB"),
            ])],
        )
        .await;
        wh.seed(
            "curation.dim_instrument",
            vec![row(&[
                ("instrument_id", "I1"),
                ("symbol", "VOD"),
                ("isin", "GB00BH4HKS39"),
                ("asset_class", "EQUITY"),
                ("currency", "GBP"),
            ])],
        )
        .await;
        wh.seed(
            "snapshots.books_snapshot",
            vec![row(&[("book_id", "B1"), ("book_name", "Flow")])],
        )
        .await;
    }

    #[tokio::test]
    async fn refresh_populates_all_maps() {
        let wh = Arc::new(MemoryWarehouse::new());
        seed_all(&wh).await;
        let cache = cache(&wh);

        match cache.refresh(false).await {
            RefreshOutcome::Success { counts, .. } => {
                assert_eq!(counts.traders, 1);
                assert_eq!(counts.counterparties_by_id, 1);
                assert_eq!(counts.counterparties_by_name, 1);
                assert_eq!(counts.instruments, 1);
                assert_eq!(counts.books, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(cache.get_trader("T1").await.is_some());
        assert!(cache.get_instrument("I1").await.is_some());
        assert!(!cache.status().is_stale);
    }

    #[tokio::test]
    async fn snapshot_swap_is_atomic_across_maps() {
        let wh = Arc::new(MemoryWarehouse::new());
        seed_counterparties(
            &wh,
            vec![row(&[("counterparty_id", "C1"), ("counterparty_name", "Acme")])],
        )
        .await;
        wh.seed("snapshots.traders_snapshot", vec![]).await;
        wh.seed("curation.dim_instrument", vec![]).await;
        wh.seed("snapshots.books_snapshot", vec![]).await;

        let cache = cache(&wh);
        cache.refresh(false).await;
        let old_generation = cache.test_snapshot();

        // New reference data arrives and a refresh swaps the snapshot.
        seed_counterparties(
            &wh,
            vec![row(&[("counterparty_id", "C2"), ("counterparty_name", "Borg")])],
        )
        .await;
        cache.refresh(false).await;
        let new_generation = cache.test_snapshot();

        // A reader holding the old generation sees the old world in BOTH
        // counterparty maps; a reader on the new generation sees both updates.
        assert!(old_generation.counterparty_by_id("C2").is_none());
        assert!(old_generation.counterparty_by_name("Borg").is_none());
        assert!(new_generation.counterparty_by_id("C2").is_some());
        assert!(new_generation.counterparty_by_name("Borg").is_some());
    }

    #[tokio::test]
    async fn concurrent_refresh_is_skipped_unless_forced() {
        let wh = Arc::new(MemoryWarehouse::new());
        seed_all(&wh).await;
        let cache = cache(&wh);

        cache.test_set_refresh_in_progress(true);
        assert!(matches!(
            cache.refresh(false).await,
            RefreshOutcome::Skipped { .. }
        ));
        assert!(matches!(
            cache.refresh(true).await,
            RefreshOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_snapshot() {
        let wh = Arc::new(MemoryWarehouse::new());
        seed_all(&wh).await;
        let cache = cache(&wh);
        cache.refresh(false).await;

        // Break the warehouse by removing a reference table.
        wh.drop_table("snapshots.traders_snapshot").await.unwrap();
        assert!(matches!(
            cache.refresh(false).await,
            RefreshOutcome::Error { .. }
        ));

        // Previous data still serves.
        assert!(cache.get_trader("T1").await.is_some());
        assert!(!cache.status().refresh_in_progress);
    }

    #[tokio::test]
    async fn cache_aside_updates_only_its_own_map() {
        let wh = Arc::new(MemoryWarehouse::new());
        seed_all(&wh).await;
        let cache = cache(&wh);
        // No refresh: every map starts empty, so lookups go cache-aside.

        assert!(cache.get_counterparty("C1").await.is_some());

        // Remove the backing table; the by-id entry must now come from the
        // cache while the by-name map proves it was never cross-populated.
        wh.drop_table("snapshots.counterparties_snapshot").await.unwrap();
        assert!(cache.get_counterparty("C1").await.is_some());
        assert!(cache.get_counterparty_by_name("Acme").await.is_none());
    }

    #[tokio::test]
    async fn name_collisions_keep_first_writer() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed("snapshots.traders_snapshot", vec![]).await;
        wh.seed("curation.dim_instrument", vec![]).await;
        wh.seed("snapshots.books_snapshot", vec![]).await;
        seed_counterparties(
            &wh,
            vec![
                row(&[("counterparty_id", "C1"), ("counterparty_name", "Acme")]),
                row(&[("counterparty_id", "C2"), ("counterparty_name", "Acme")]),
            ],
        )
        .await;

        let cache = cache(&wh);
        cache.refresh(false).await;

        let hit = cache.get_counterparty_by_name("Acme").await.unwrap();
        assert_eq!(hit["counterparty_id"], Value::Str("C1".into()));
        // Both ids remain reachable through the by-id map.
        assert!(cache.get_counterparty("C2").await.is_some());
    }
}
