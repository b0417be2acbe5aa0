//! Backing object store
//!
//! Whole-object storage with etag compare-and-swap writes and per-object
//! leases:
//!
//! - exclusive leases never expire and conflict with any live lease
//! - shared leases expire after their ttl and coexist with each other
//!
//! Two implementations share one in-process [`LeaseTable`]:
//! [`MemoryBackingStore`] for embedding and tests, [`FileBackingStore`] for
//! snapshot files under a root directory.

use crate::error::GraphError;
use crate::types::{new_id, now};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Opaque concurrency token of a stored object.
pub type ETag = String;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object '{0}' is leased by another holder")]
    Locked(String),

    #[error("etag mismatch on '{path}': expected {expected:?}, found {actual:?}")]
    Conflict {
        path: String,
        expected: Option<ETag>,
        actual: Option<ETag>,
    },

    #[error("lease '{0}' not found")]
    LeaseNotFound(String),

    #[error("lease '{0}' is no longer held")]
    LeaseLost(String),

    #[error("invalid object path '{0}'")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for GraphError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Locked(_) | StoreError::Conflict { .. } | StoreError::LeaseLost(_) => {
                GraphError::Conflict(e.to_string())
            }
            StoreError::LeaseNotFound(_) => GraphError::NotFound(e.to_string()),
            StoreError::InvalidPath(_) => GraphError::BadRequest(e.to_string()),
            StoreError::Io(e) => GraphError::Io(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseKind {
    Exclusive,
    Shared,
}

impl LeaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseKind::Exclusive => "exclusive",
            LeaseKind::Shared => "shared",
        }
    }
}

/// Time-bound ownership token over one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub object_id: String,
    pub kind: LeaseKind,
    pub created: DateTime<Utc>,
    /// `None` never expires.
    pub ttl: Option<Duration>,
}

impl Lease {
    pub fn new(object_id: &str, kind: LeaseKind, ttl: Option<Duration>) -> Self {
        Lease {
            lease_id: new_id(),
            object_id: object_id.to_string(),
            kind,
            created: now(),
            ttl,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created.checked_add_signed(ttl)
    }

    /// Valid while `now < created + ttl`.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now())
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        match (self.ttl, self.expires_at()) {
            (None, _) => true,
            (Some(_), Some(expires)) => at < expires,
            // ttl too large to represent
            (Some(_), None) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: ETag,
}

/// Storage contract the access layer runs against.
///
/// `set` with `expected_etag = None` only succeeds while the object does not
/// exist. A supplied lease must still be held; without one, a live exclusive
/// lease held by someone else rejects the call.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get(&self, path: &str, lease: Option<&Lease>) -> StoreResult<Option<StoredObject>>;

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
        lease: Option<&Lease>,
    ) -> StoreResult<ETag>;

    async fn acquire_exclusive(&self, path: &str, force: bool) -> StoreResult<Lease>;

    async fn acquire_shared(&self, path: &str, ttl: Duration) -> StoreResult<Lease>;

    /// Drop every lease on `path`, returning how many were broken.
    async fn break_lease(&self, path: &str) -> StoreResult<usize>;

    async fn release(&self, lease: &Lease) -> StoreResult<()>;
}

/// In-process lease bookkeeping, keyed by object path.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: Mutex<HashMap<String, Vec<Lease>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_exclusive(&self, path: &str, force: bool) -> StoreResult<Lease> {
        let mut leases = self.leases.lock();
        prune(&mut leases, path);

        if let Some(live) = leases.get(path) {
            if !force {
                return Err(StoreError::Locked(path.to_string()));
            }
            info!(path, broken = live.len(), "forcing exclusive lease");
        }

        let lease = Lease::new(path, LeaseKind::Exclusive, None);
        leases.insert(path.to_string(), vec![lease.clone()]);
        debug!(path, lease_id = %lease.lease_id, "exclusive lease acquired");
        Ok(lease)
    }

    pub fn acquire_shared(&self, path: &str, ttl: Duration) -> StoreResult<Lease> {
        let mut leases = self.leases.lock();
        prune(&mut leases, path);

        let live = leases.entry(path.to_string()).or_default();
        if live.iter().any(|l| l.kind == LeaseKind::Exclusive) {
            return Err(StoreError::Locked(path.to_string()));
        }

        let lease = Lease::new(path, LeaseKind::Shared, Some(ttl));
        live.push(lease.clone());
        debug!(path, lease_id = %lease.lease_id, ttl_ms = ttl.as_millis() as u64, "shared lease acquired");
        Ok(lease)
    }

    pub fn break_lease(&self, path: &str) -> usize {
        let broken = self.leases.lock().remove(path).map(|l| l.len()).unwrap_or(0);
        if broken > 0 {
            info!(path, broken, "leases broken");
        }
        broken
    }

    pub fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut leases = self.leases.lock();
        let held = leases
            .get_mut(&lease.object_id)
            .ok_or_else(|| StoreError::LeaseNotFound(lease.lease_id.clone()))?;

        let before = held.len();
        held.retain(|l| l.lease_id != lease.lease_id);
        if held.len() == before {
            return Err(StoreError::LeaseNotFound(lease.lease_id.clone()));
        }
        if held.is_empty() {
            leases.remove(&lease.object_id);
        }
        debug!(path = %lease.object_id, lease_id = %lease.lease_id, "lease released");
        Ok(())
    }

    /// Verify the caller may touch `path`.
    pub fn check(&self, path: &str, lease: Option<&Lease>) -> StoreResult<()> {
        let mut leases = self.leases.lock();
        prune(&mut leases, path);
        let live = leases.get(path).map(Vec::as_slice).unwrap_or_default();

        match lease {
            Some(lease) => {
                if lease.object_id == path && live.iter().any(|l| l.lease_id == lease.lease_id) {
                    Ok(())
                } else {
                    Err(StoreError::LeaseLost(lease.lease_id.clone()))
                }
            }
            None if live.iter().any(|l| l.kind == LeaseKind::Exclusive) => {
                Err(StoreError::Locked(path.to_string()))
            }
            None => Ok(()),
        }
    }

    /// Live leases on `path`.
    pub fn leases(&self, path: &str) -> Vec<Lease> {
        let mut leases = self.leases.lock();
        prune(&mut leases, path);
        leases.get(path).cloned().unwrap_or_default()
    }

    /// Number of paths with at least one live lease entry.
    pub fn tracked_paths(&self) -> usize {
        self.leases.lock().len()
    }
}

/// Drop expired leases on `path`, forgetting the path once none are left.
fn prune(leases: &mut HashMap<String, Vec<Lease>>, path: &str) {
    let at = now();
    if let Some(live) = leases.get_mut(path) {
        live.retain(|l| l.is_valid_at(at));
        if live.is_empty() {
            leases.remove(path);
        }
    }
}

/// Objects and leases held in memory.
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    leases: LeaseTable,
    version: AtomicU64,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    fn next_etag(&self) -> ETag {
        format!("{:08x}", self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn get(&self, path: &str, lease: Option<&Lease>) -> StoreResult<Option<StoredObject>> {
        self.leases.check(path, lease)?;
        Ok(self.objects.lock().get(path).cloned())
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
        lease: Option<&Lease>,
    ) -> StoreResult<ETag> {
        self.leases.check(path, lease)?;

        let mut objects = self.objects.lock();
        let actual = objects.get(path).map(|o| o.etag.clone());
        if actual.as_deref() != expected_etag {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected_etag.map(str::to_string),
                actual,
            });
        }

        let etag = self.next_etag();
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn acquire_exclusive(&self, path: &str, force: bool) -> StoreResult<Lease> {
        self.leases.acquire_exclusive(path, force)
    }

    async fn acquire_shared(&self, path: &str, ttl: Duration) -> StoreResult<Lease> {
        self.leases.acquire_shared(path, ttl)
    }

    async fn break_lease(&self, path: &str) -> StoreResult<usize> {
        Ok(self.leases.break_lease(path))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.leases.release(lease)
    }
}

/// Objects stored as files under `root`; the etag is the hex SHA-256 of the
/// file contents. Writes go to a temporary file renamed over the target.
#[derive(Debug)]
pub struct FileBackingStore {
    root: PathBuf,
    leases: LeaseTable,
    write_gate: tokio::sync::Mutex<()>,
}

impl FileBackingStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FileBackingStore {
            root: root.as_ref().to_path_buf(),
            leases: LeaseTable::new(),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn read(&self, file: &Path) -> StoreResult<Option<StoredObject>> {
        match tokio::fs::read(file).await {
            Ok(data) => {
                let etag = file_etag(&data);
                Ok(Some(StoredObject { data, etag }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_etag(data: &[u8]) -> ETag {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn get(&self, path: &str, lease: Option<&Lease>) -> StoreResult<Option<StoredObject>> {
        let file = self.resolve(path)?;
        self.leases.check(path, lease)?;
        self.read(&file).await
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
        lease: Option<&Lease>,
    ) -> StoreResult<ETag> {
        let file = self.resolve(path)?;
        self.leases.check(path, lease)?;

        let _gate = self.write_gate.lock().await;

        let actual = self.read(&file).await?.map(|o| o.etag);
        if actual.as_deref() != expected_etag {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected_etag.map(str::to_string),
                actual,
            });
        }

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let etag = file_etag(&data);
        let temp = file.with_extension(format!("tmp-{}", new_id()));
        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &file).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(path, etag = %etag, bytes = data.len(), "object written");
        Ok(etag)
    }

    async fn acquire_exclusive(&self, path: &str, force: bool) -> StoreResult<Lease> {
        self.resolve(path)?;
        self.leases.acquire_exclusive(path, force)
    }

    async fn acquire_shared(&self, path: &str, ttl: Duration) -> StoreResult<Lease> {
        self.resolve(path)?;
        self.leases.acquire_shared(path, ttl)
    }

    async fn break_lease(&self, path: &str) -> StoreResult<usize> {
        Ok(self.leases.break_lease(path))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.leases.release(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lease_validity() {
        let lease = Lease::new("g", LeaseKind::Shared, Some(Duration::from_secs(60)));
        assert!(lease.is_valid());
        assert!(!lease.is_valid_at(lease.created + chrono::Duration::seconds(61)));

        let exclusive = Lease::new("g", LeaseKind::Exclusive, None);
        assert!(exclusive.is_valid_at(exclusive.created + chrono::Duration::days(3650)));
    }

    #[test]
    fn test_lease_compatibility() {
        let table = LeaseTable::new();
        let s1 = table.acquire_shared("g", Duration::from_secs(60)).unwrap();
        let _s2 = table.acquire_shared("g", Duration::from_secs(60)).unwrap();
        assert_eq!(table.leases("g").len(), 2);

        assert!(matches!(table.acquire_exclusive("g", false), Err(StoreError::Locked(_))));

        let exclusive = table.acquire_exclusive("g", true).unwrap();
        assert_eq!(table.leases("g"), vec![exclusive.clone()]);
        assert!(matches!(table.check("g", Some(&s1)), Err(StoreError::LeaseLost(_))));
        assert!(matches!(table.check("g", None), Err(StoreError::Locked(_))));
        assert!(matches!(
            table.acquire_shared("g", Duration::from_secs(1)),
            Err(StoreError::Locked(_))
        ));

        table.release(&exclusive).unwrap();
        assert!(matches!(table.release(&exclusive), Err(StoreError::LeaseNotFound(_))));
        assert!(table.check("g", None).is_ok());
    }

    #[test]
    fn test_expired_shared_leases_are_pruned() {
        let table = LeaseTable::new();
        table.acquire_shared("g", Duration::from_millis(0)).unwrap();
        assert!(table.leases("g").is_empty());
        assert!(table.acquire_exclusive("g", false).is_ok());
    }

    #[test]
    fn test_unleased_lookups_leave_no_entries() {
        let table = LeaseTable::new();
        for i in 0..50 {
            let path = format!("graphs/g{}.json", i);
            assert!(table.check(&path, None).is_ok());
            assert!(table.leases(&path).is_empty());
        }
        assert_eq!(table.tracked_paths(), 0);

        let lease = table.acquire_shared("g", Duration::from_millis(0)).unwrap();
        assert_eq!(table.tracked_paths(), 1);
        assert!(table.check("g", Some(&lease)).is_err());
        assert_eq!(table.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_compare_and_swap() {
        let store = MemoryBackingStore::new();
        assert!(store.get("g", None).await.unwrap().is_none());

        let e1 = store.set("g", b"one".to_vec(), None, None).await.unwrap();
        assert!(matches!(
            store.set("g", b"again".to_vec(), None, None).await,
            Err(StoreError::Conflict { .. })
        ));

        let e2 = store.set("g", b"two".to_vec(), Some(&e1), None).await.unwrap();
        assert_ne!(e1, e2);
        assert!(matches!(
            store.set("g", b"stale".to_vec(), Some(&e1), None).await,
            Err(StoreError::Conflict { .. })
        ));

        let object = store.get("g", None).await.unwrap().unwrap();
        assert_eq!(object.data, b"two");
        assert_eq!(object.etag, e2);
    }

    #[tokio::test]
    async fn test_exclusive_lease_blocks_unleased_writers() {
        let store = MemoryBackingStore::new();
        let lease = store.acquire_exclusive("g", false).await.unwrap();

        assert!(matches!(
            store.set("g", b"x".to_vec(), None, None).await,
            Err(StoreError::Locked(_))
        ));
        store.set("g", b"x".to_vec(), None, Some(&lease)).await.unwrap();

        assert_eq!(store.break_lease("g").await.unwrap(), 1);
        assert!(matches!(
            store.get("g", Some(&lease)).await,
            Err(StoreError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileBackingStore::new(dir.path());

        let etag = store
            .set("graphs/g1.json", b"{}".to_vec(), None, None)
            .await
            .unwrap();
        let object = store.get("graphs/g1.json", None).await.unwrap().unwrap();
        assert_eq!(object.etag, etag);
        assert!(dir.path().join("graphs/g1.json").exists());

        assert!(matches!(
            store.set("graphs/g1.json", b"[]".to_vec(), Some("bogus"), None).await,
            Err(StoreError::Conflict { .. })
        ));
        store
            .set("graphs/g1.json", b"[]".to_vec(), Some(&etag), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = FileBackingStore::new(dir.path());
        for path in ["../outside.json", "/abs.json", ""] {
            assert!(matches!(store.get(path, None).await, Err(StoreError::InvalidPath(_))), "{}", path);
        }
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let conflict: GraphError = StoreError::Conflict {
            path: "g".into(),
            expected: None,
            actual: Some("1".into()),
        }
        .into();
        assert!(conflict.is_conflict());
        let missing: GraphError = StoreError::LeaseNotFound("x".into()).into();
        assert!(missing.is_not_found());
    }
}
