//! Logical object-store areas.
//!
//! All components address storage through well-known areas rather than raw
//! bucket paths: `landing/` for producer drops, `staging/` for validated
//! columnar artifacts, `archive/` for processed originals, `failed/` for
//! rejections (with `quarantined/` nested under it for bad rows), `extracts/`
//! for partner deliveries and `_health/` for run markers.
//!
//! Moves are copy-then-delete: buckets have no atomic rename, so the copy is
//! verified before the source goes away. Deleting an object that is already
//! gone counts as success; a concurrent deleter reaching it first leaves the
//! system in the state we wanted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectMeta, ObjectStore};
use tracing::{debug, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Errors from area-level storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {path}")]
    NotFound { path: String },
    #[error("invalid storage path: {0}")]
    Path(String),
    #[error(transparent)]
    Store(object_store::Error),
}

impl From<object_store::Error> for StorageError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound { path },
            other => StorageError::Store(other),
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Logical storage areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Landing,
    Staging,
    Archive,
    Failed,
    Quarantine,
    Extracts,
    Health,
}

/// Resolved prefix for each area within one object store.
#[derive(Debug, Clone)]
pub struct AreaPaths {
    pub landing: StorePath,
    pub staging: StorePath,
    pub archive: StorePath,
    pub failed: StorePath,
    pub quarantine: StorePath,
    pub extracts: StorePath,
    pub health: StorePath,
}

/// Object storage addressed by logical area.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn ObjectStore>,
    areas: AreaPaths,
}

impl Storage {
    pub fn new(store: Arc<dyn ObjectStore>, areas: AreaPaths) -> Storage {
        Storage { store, areas }
    }

    /// In-memory storage with the default layout. Used by tests and local
    /// dry runs.
    pub fn in_memory() -> Storage {
        Storage::new(
            Arc::new(InMemory::new()),
            AreaPaths {
                landing: StorePath::from("landing"),
                staging: StorePath::from("staging"),
                archive: StorePath::from("archive"),
                failed: StorePath::from("failed"),
                quarantine: StorePath::from("failed/quarantined"),
                extracts: StorePath::from("extracts"),
                health: StorePath::from("_health"),
            },
        )
    }

    /// Build storage from configured area paths.
    ///
    /// `gs://bucket/prefix` and `s3://bucket/prefix` select the matching cloud
    /// backend (credentials from the environment, as the SDKs expect); plain
    /// paths select the local filesystem. All areas must live in the same
    /// bucket so copy-based moves stay server-side.
    pub fn from_paths(
        landing: &str,
        staging: &str,
        archive: &str,
        failed: &str,
        extracts: &str,
        health: &str,
    ) -> Result<Storage, StorageError> {
        let (scheme, bucket, landing_prefix) = split_url(landing)?;

        let store: Arc<dyn ObjectStore> = match scheme {
            Some("gs") => Arc::new(
                object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket.clone().unwrap_or_default())
                    .build()
                    .map_err(StorageError::Store)?,
            ),
            Some("s3") => Arc::new(
                object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(bucket.clone().unwrap_or_default())
                    .build()
                    .map_err(StorageError::Store)?,
            ),
            Some(other) => {
                return Err(StorageError::Path(format!("unsupported scheme '{other}'")))
            }
            None => Arc::new(object_store::local::LocalFileSystem::new()),
        };

        let prefix_for = |raw: &str| -> Result<StorePath, StorageError> {
            let (s, b, prefix) = split_url(raw)?;
            if s != scheme || b != bucket {
                return Err(StorageError::Path(format!(
                    "area '{raw}' is not in the same bucket as the landing area"
                )));
            }
            if scheme.is_none() {
                local_prefix(&prefix)
            } else {
                Ok(StorePath::from(prefix))
            }
        };

        let failed_prefix = prefix_for(failed)?;
        let quarantine = StorePath::from(format!("{failed_prefix}/quarantined"));
        Ok(Storage::new(
            store,
            AreaPaths {
                landing: if scheme.is_none() {
                    local_prefix(&landing_prefix)?
                } else {
                    StorePath::from(landing_prefix)
                },
                staging: prefix_for(staging)?,
                archive: prefix_for(archive)?,
                failed: failed_prefix,
                quarantine,
                extracts: prefix_for(extracts)?,
                health: prefix_for(health)?,
            },
        ))
    }

    pub fn prefix(&self, area: Area) -> &StorePath {
        match area {
            Area::Landing => &self.areas.landing,
            Area::Staging => &self.areas.staging,
            Area::Archive => &self.areas.archive,
            Area::Failed => &self.areas.failed,
            Area::Quarantine => &self.areas.quarantine,
            Area::Extracts => &self.areas.extracts,
            Area::Health => &self.areas.health,
        }
    }

    /// Full object path for a relative path within an area.
    pub fn full_path(&self, area: Area, rel: &str) -> StorePath {
        StorePath::from(format!("{}/{}", self.prefix(area), rel.trim_matches('/')))
    }

    /// Relative path of a full object path within an area, if it belongs there.
    pub fn relative(&self, area: Area, full: &StorePath) -> Option<String> {
        let prefix = format!("{}/", self.prefix(area));
        full.as_ref().strip_prefix(&prefix).map(str::to_string)
    }

    /// List every object in an area.
    pub async fn list(&self, area: Area) -> Result<Vec<ObjectMeta>, StorageError> {
        let prefix = self.prefix(area).clone();
        self.with_retry("list", || async {
            self.store
                .list(Some(&prefix))
                .try_collect::<Vec<_>>()
                .await
        })
        .await
    }

    pub async fn get(&self, area: Area, rel: &str) -> Result<Bytes, StorageError> {
        let path = self.full_path(area, rel);
        self.with_retry("get", || async {
            self.store.get(&path).await?.bytes().await
        })
        .await
    }

    pub async fn put(&self, area: Area, rel: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.full_path(area, rel);
        self.with_retry("put", || {
            let bytes = bytes.clone();
            let path = path.clone();
            async move {
                self.store.put(&path, bytes).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn head(&self, area: Area, rel: &str) -> Result<ObjectMeta, StorageError> {
        let path = self.full_path(area, rel);
        self.with_retry("head", || async { self.store.head(&path).await })
            .await
    }

    pub async fn exists(&self, area: Area, rel: &str) -> Result<bool, StorageError> {
        match self.head(area, rel).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete an object. An object that is already gone counts as deleted.
    pub async fn delete(&self, area: Area, rel: &str) -> Result<(), StorageError> {
        let path = self.full_path(area, rel);
        match self
            .with_retry("delete", || async { self.store.delete(&path).await })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(path = %path, "delete raced with another deleter");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Copy an object across areas.
    pub async fn copy(
        &self,
        from: Area,
        from_rel: &str,
        to: Area,
        to_rel: &str,
    ) -> Result<(), StorageError> {
        let src = self.full_path(from, from_rel);
        let dst = self.full_path(to, to_rel);
        self.with_retry("copy", || async { self.store.copy(&src, &dst).await })
            .await
    }

    /// Move = copy then delete. The delete only runs once the copy succeeded.
    pub async fn move_object(
        &self,
        from: Area,
        from_rel: &str,
        to: Area,
        to_rel: &str,
    ) -> Result<(), StorageError> {
        self.copy(from, from_rel, to, to_rel).await?;
        self.delete(from, from_rel).await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, object_store::Error>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < RETRY_ATTEMPTS && is_transient(&e) => {
                    warn!(op, attempt, error = %e, "transient storage error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(e: &object_store::Error) -> bool {
    matches!(e, object_store::Error::Generic { .. })
}

/// Split `scheme://bucket/prefix` into its parts. Plain paths return no scheme.
fn split_url(raw: &str) -> Result<(Option<&'static str>, Option<String>, String), StorageError> {
    for scheme in ["gs", "s3"] {
        if let Some(rest) = raw.strip_prefix(&format!("{scheme}://")) {
            let (bucket, prefix) = rest
                .split_once('/')
                .ok_or_else(|| StorageError::Path(format!("'{raw}' has no path after bucket")))?;
            return Ok((
                Some(match scheme {
                    "gs" => "gs",
                    _ => "s3",
                }),
                Some(bucket.to_string()),
                prefix.trim_matches('/').to_string(),
            ));
        }
    }
    if let Some((scheme, _)) = raw.split_once("://") {
        return Err(StorageError::Path(format!("unsupported scheme '{scheme}'")));
    }
    Ok((None, None, raw.to_string()))
}

fn local_prefix(raw: &str) -> Result<StorePath, StorageError> {
    let path = std::path::Path::new(raw);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| StorageError::Path(e.to_string()))?
            .join(path)
    };
    StorePath::from_absolute_path(&abs)
        .map_err(|e| StorageError::Path(format!("{}: {e}", abs.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_head_roundtrip() {
        let storage = Storage::in_memory();
        storage
            .put(Area::Landing, "trades/a.csv", Bytes::from_static(b"id\n1\n"))
            .await
            .unwrap();

        let bytes = storage.get(Area::Landing, "trades/a.csv").await.unwrap();
        assert_eq!(&bytes[..], b"id\n1\n");

        let meta = storage.head(Area::Landing, "trades/a.csv").await.unwrap();
        assert_eq!(meta.size, 5);

        let listed = storage.list(Area::Landing).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            storage.relative(Area::Landing, &listed[0].location).as_deref(),
            Some("trades/a.csv")
        );
    }

    #[tokio::test]
    async fn move_copies_then_deletes() {
        let storage = Storage::in_memory();
        storage
            .put(Area::Staging, "trades/a.parquet", Bytes::from_static(b"x"))
            .await
            .unwrap();

        storage
            .move_object(Area::Staging, "trades/a.parquet", Area::Archive, "2024-01-15/0600/trades/a.parquet")
            .await
            .unwrap();

        assert!(!storage.exists(Area::Staging, "trades/a.parquet").await.unwrap());
        assert!(storage
            .exists(Area::Archive, "2024-01-15/0600/trades/a.parquet")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_success() {
        let storage = Storage::in_memory();
        storage.delete(Area::Landing, "never-there.csv").await.unwrap();
    }

    #[test]
    fn split_url_variants() {
        let (scheme, bucket, prefix) = split_url("gs://surv-landing/landing").unwrap();
        assert_eq!(scheme, Some("gs"));
        assert_eq!(bucket.as_deref(), Some("surv-landing"));
        assert_eq!(prefix, "landing");

        let (scheme, bucket, prefix) = split_url("/data/landing").unwrap();
        assert_eq!(scheme, None);
        assert!(bucket.is_none());
        assert_eq!(prefix, "/data/landing");

        assert!(split_url("ftp://x/y").is_err());
    }
}
