//! Lease-mediated access to a graph snapshot
//!
//! Two strategies front the same [`LeaseScope`]:
//!
//! - [`ExclusiveAccess`] holds one non-expiring lease between `start` and
//!   `stop`, for a process that owns the graph outright.
//! - [`SharedAccess`] opens a short-lived scope per unit of work: shared
//!   lease, fresh load, work, etag-checked save, release.
//!
//! Saves are compare-and-swap on the etag observed at load time. A rejected
//! save is a `Conflict`; reloading and retrying is up to the caller.
//!
//! Using a scope without a lease, starting twice, or failing to acquire after
//! breaking a foreign lease are broken operating assumptions and panic.

use crate::change_log::{ChangeTraceSink, MemoryChangeLog, TracingChangeSink};
use crate::config::GraphConfig;
use crate::context::RequestContext;
use crate::error::{GraphError, Result};
use crate::gql_executor::{GraphEngine, QueryResult};
use crate::graph::GraphMap;
use crate::metrics::LeaseMetrics;
use crate::snapshot::{JsonSnapshotFactory, Snapshot, SnapshotFactory};
use crate::store::{BackingStore, ETag, Lease, LeaseKind, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Load/save operations bound to one lease on one object.
pub struct LeaseScope {
    store: Arc<dyn BackingStore>,
    factory: Arc<dyn SnapshotFactory>,
    metrics: Arc<LeaseMetrics>,
    path: String,
    lease: Option<Lease>,
    /// Etag of the last load or save; `None` while the object is absent.
    etag: Option<ETag>,
}

impl LeaseScope {
    pub fn new(
        store: Arc<dyn BackingStore>,
        factory: Arc<dyn SnapshotFactory>,
        metrics: Arc<LeaseMetrics>,
        path: &str,
        lease: Lease,
    ) -> Self {
        LeaseScope {
            store,
            factory,
            metrics,
            path: path.to_string(),
            lease: Some(lease),
            etag: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn held_lease(&self) -> &Lease {
        match &self.lease {
            Some(lease) => lease,
            None => panic!("lease scope for '{}' used without a lease", self.path),
        }
    }

    pub async fn load_snapshot(&mut self, ctx: &RequestContext) -> Result<Snapshot> {
        let lease = self.held_lease();
        let object = ctx
            .run(async { self.store.get(&self.path, Some(lease)).await.map_err(GraphError::from) })
            .await?;

        let snapshot = match object {
            Some(object) => Snapshot {
                data: object.data,
                etag: Some(object.etag),
            },
            None => Snapshot::default(),
        };
        debug!(path = %self.path, bytes = snapshot.data.len(), etag = ?snapshot.etag, "snapshot loaded");

        self.etag = snapshot.etag.clone();
        Ok(snapshot)
    }

    pub async fn load(&mut self, ctx: &RequestContext) -> Result<GraphMap> {
        let snapshot = self.load_snapshot(ctx).await?;
        let mut map = self.factory.create_from_bytes(&snapshot.data)?;
        map.recompute_stats();
        Ok(map)
    }

    /// Write `data` if the stored etag still matches the last one observed.
    pub async fn save_snapshot(&mut self, ctx: &RequestContext, data: Vec<u8>) -> Result<ETag> {
        let lease = self.held_lease();
        let expected = self.etag.as_deref();
        let bytes = data.len();

        let written = ctx
            .run(async { Ok(self.store.set(&self.path, data, expected, Some(lease)).await) })
            .await?;

        match written {
            Ok(etag) => {
                debug!(path = %self.path, bytes, etag = %etag, "snapshot saved");
                self.etag = Some(etag.clone());
                Ok(etag)
            }
            Err(e @ StoreError::Conflict { .. }) => {
                self.metrics.record_save_conflict();
                warn!(path = %self.path, error = %e, "snapshot save rejected");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&mut self, ctx: &RequestContext, map: &GraphMap) -> Result<ETag> {
        let data = self.factory.to_bytes(map)?;
        self.save_snapshot(ctx, data).await
    }

    /// Give the lease back. Releasing an already released scope is a no-op.
    ///
    /// A cancelled release keeps the lease; it is returned when the scope
    /// drops.
    pub async fn release(&mut self, ctx: &RequestContext) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        let outcome = ctx.run(async { Ok(self.store.release(&lease).await) }).await;
        let released = match outcome {
            Ok(released) => released,
            Err(e) => {
                self.lease = Some(lease);
                return Err(e);
            }
        };

        match released {
            Ok(()) => {
                self.metrics.record_release(lease.kind);
                debug!(path = %self.path, lease_id = %lease.lease_id, "lease released");
                Ok(())
            }
            // Expired or broken in the meantime: nothing left to give back
            Err(StoreError::LeaseNotFound(_)) => {
                self.metrics.record_release(lease.kind);
                debug!(path = %self.path, lease_id = %lease.lease_id, "lease already gone");
                Ok(())
            }
            Err(e) => {
                self.lease = Some(lease);
                Err(e.into())
            }
        }
    }
}

impl Drop for LeaseScope {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                path = %self.path,
                lease_id = %lease.lease_id,
                "lease scope dropped outside a runtime, lease left to expire"
            );
            return;
        };

        debug!(path = %self.path, lease_id = %lease.lease_id, "lease scope dropped, releasing");
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let path = std::mem::take(&mut self.path);
        runtime.spawn(async move {
            match store.release(&lease).await {
                Ok(()) | Err(StoreError::LeaseNotFound(_)) => metrics.record_release(lease.kind),
                Err(e) => warn!(path = %path, lease_id = %lease.lease_id, error = %e, "release on drop failed"),
            }
        });
    }
}

/// Process-lifetime exclusive ownership of one graph snapshot.
pub struct ExclusiveAccess {
    store: Arc<dyn BackingStore>,
    factory: Arc<dyn SnapshotFactory>,
    metrics: Arc<LeaseMetrics>,
    path: String,
    force: bool,
    scope: tokio::sync::Mutex<Option<LeaseScope>>,
}

impl ExclusiveAccess {
    pub fn new(store: Arc<dyn BackingStore>, path: &str, metrics: Arc<LeaseMetrics>) -> Self {
        ExclusiveAccess {
            store,
            factory: Arc::new(JsonSnapshotFactory::new()),
            metrics,
            path: path.to_string(),
            force: false,
            scope: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(
        store: Arc<dyn BackingStore>,
        graph_id: &str,
        config: &GraphConfig,
        metrics: Arc<LeaseMetrics>,
    ) -> Self {
        Self::new(store, &config.object_path(graph_id), metrics)
            .with_factory(Arc::new(JsonSnapshotFactory::from_config(&config.snapshot)))
            .with_force(config.access.force_exclusive)
    }

    pub fn with_factory(mut self, factory: Arc<dyn SnapshotFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Break foreign leases on the first attempt.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    pub async fn is_started(&self) -> bool {
        self.scope.lock().await.is_some()
    }

    /// Acquire the exclusive lease.
    ///
    /// A concurrent `start`/`stop` is rejected with `Conflict`. If another
    /// holder owns the object, its lease is broken once and acquisition
    /// retried; a second failure panics.
    ///
    /// # Panics
    ///
    /// When called again without an intervening [`stop`](Self::stop).
    pub async fn start(&self, ctx: &RequestContext) -> Result<()> {
        let mut gate = self
            .scope
            .try_lock()
            .map_err(|_| GraphError::Conflict(format!("exclusive access to '{}' is busy", self.path)))?;

        if gate.is_some() {
            panic!("exclusive access to '{}' started twice", self.path);
        }

        let first = ctx
            .run(async { Ok(self.store.acquire_exclusive(&self.path, self.force).await) })
            .await?;

        let lease = match first {
            Ok(lease) => lease,
            Err(StoreError::Locked(_)) => {
                warn!(path = %self.path, "object leased elsewhere, breaking lease");
                let broken = ctx
                    .run(async { self.store.break_lease(&self.path).await.map_err(GraphError::from) })
                    .await?;
                self.metrics.record_break();
                info!(path = %self.path, broken, "foreign leases broken");

                let retry = ctx
                    .run(async { Ok(self.store.acquire_exclusive(&self.path, false).await) })
                    .await?;
                match retry {
                    Ok(lease) => lease,
                    Err(e) => panic!(
                        "exclusive lease on '{}' unavailable after breaking foreign leases: {}",
                        self.path, e
                    ),
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.metrics.record_acquire(LeaseKind::Exclusive);
        info!(path = %self.path, lease_id = %lease.lease_id, "exclusive access started");

        *gate = Some(LeaseScope::new(
            self.store.clone(),
            self.factory.clone(),
            self.metrics.clone(),
            &self.path,
            lease,
        ));
        Ok(())
    }

    /// Release the lease. Stopping a stopped instance is a no-op.
    pub async fn stop(&self, ctx: &RequestContext) -> Result<()> {
        let mut gate = self
            .scope
            .try_lock()
            .map_err(|_| GraphError::Conflict(format!("exclusive access to '{}' is busy", self.path)))?;

        let Some(mut scope) = gate.take() else {
            debug!(path = %self.path, "exclusive access not started");
            return Ok(());
        };

        scope.release(ctx).await?;
        info!(path = %self.path, "exclusive access stopped");
        Ok(())
    }

    /// # Panics
    ///
    /// When the instance has not been started.
    pub async fn load(&self, ctx: &RequestContext) -> Result<GraphMap> {
        let mut gate = self.scope.lock().await;
        self.started(&mut gate).load(ctx).await
    }

    pub async fn load_snapshot(&self, ctx: &RequestContext) -> Result<Snapshot> {
        let mut gate = self.scope.lock().await;
        self.started(&mut gate).load_snapshot(ctx).await
    }

    /// # Panics
    ///
    /// When the instance has not been started.
    pub async fn save(&self, ctx: &RequestContext, map: &GraphMap) -> Result<ETag> {
        let mut gate = self.scope.lock().await;
        self.started(&mut gate).save(ctx, map).await
    }

    fn started<'a>(&self, gate: &'a mut Option<LeaseScope>) -> &'a mut LeaseScope {
        match gate {
            Some(scope) => scope,
            None => panic!("exclusive access to '{}' used before start", self.path),
        }
    }
}

/// Per-unit-of-work shared access to one graph snapshot.
pub struct SharedAccess {
    store: Arc<dyn BackingStore>,
    factory: Arc<dyn SnapshotFactory>,
    sink: Arc<dyn ChangeTraceSink>,
    metrics: Arc<LeaseMetrics>,
    path: String,
    ttl: Duration,
}

impl SharedAccess {
    pub fn new(store: Arc<dyn BackingStore>, path: &str, metrics: Arc<LeaseMetrics>) -> Self {
        SharedAccess {
            store,
            factory: Arc::new(JsonSnapshotFactory::new()),
            sink: Arc::new(TracingChangeSink),
            metrics,
            path: path.to_string(),
            ttl: GraphConfig::default().access.shared_lease_ttl(),
        }
    }

    pub fn from_config(
        store: Arc<dyn BackingStore>,
        graph_id: &str,
        config: &GraphConfig,
        metrics: Arc<LeaseMetrics>,
    ) -> Self {
        Self::new(store, &config.object_path(graph_id), metrics)
            .with_factory(Arc::new(JsonSnapshotFactory::from_config(&config.snapshot)))
            .with_ttl(config.access.shared_lease_ttl())
    }

    pub fn with_factory(mut self, factory: Arc<dyn SnapshotFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeTraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    /// Take a shared lease and load the latest committed snapshot.
    pub async fn open_scope(&self, ctx: &RequestContext) -> Result<SharedScope> {
        let lease = ctx
            .run(async { self.store.acquire_shared(&self.path, self.ttl).await.map_err(GraphError::from) })
            .await?;
        self.metrics.record_acquire(LeaseKind::Shared);
        debug!(path = %self.path, lease_id = %lease.lease_id, "shared scope opened");

        let mut scope = LeaseScope::new(
            self.store.clone(),
            self.factory.clone(),
            self.metrics.clone(),
            &self.path,
            lease,
        );

        match scope.load(ctx).await {
            Ok(map) => {
                let pending = Arc::new(MemoryChangeLog::new());
                Ok(SharedScope {
                    scope,
                    engine: GraphEngine::with_map(map).with_sink(pending.clone()),
                    pending,
                    sink: self.sink.clone(),
                    dirty: false,
                })
            }
            Err(e) => {
                if let Err(release) = scope.release(&RequestContext::new()).await {
                    warn!(path = %self.path, error = %release, "release after failed load");
                }
                Err(e)
            }
        }
    }
}

/// A loaded graph under a shared lease.
///
/// Change records of executed batches are held back until [`save`](Self::save)
/// lands them in the store, then handed to the access's sink. Dropping the
/// scope releases its lease.
pub struct SharedScope {
    scope: LeaseScope,
    engine: GraphEngine,
    /// Records of batches not saved yet.
    pending: Arc<MemoryChangeLog>,
    sink: Arc<dyn ChangeTraceSink>,
    dirty: bool,
}

impl SharedScope {
    pub fn execute(&mut self, query: &str) -> Result<QueryResult> {
        let result = self.engine.execute(query)?;
        self.dirty |= result.is_mutation();
        Ok(result)
    }

    pub fn map(&self) -> &GraphMap {
        self.engine.map()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.scope.lease()
    }

    /// Whether committed changes are waiting to be saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub async fn save(&mut self, ctx: &RequestContext) -> Result<ETag> {
        let etag = self.scope.save(ctx, self.engine.map()).await?;
        self.dirty = false;

        let records = self.pending.records();
        self.pending.clear();
        if !records.is_empty() {
            if let Err(e) = self.sink.append(&records) {
                error!(path = %self.scope.path(), etag = %etag, records = records.len(), error = %e, "saved changes not traced");
                return Err(e);
            }
        }
        Ok(etag)
    }

    pub async fn close(mut self, ctx: &RequestContext) -> Result<()> {
        if self.dirty {
            debug!(
                path = %self.scope.path(),
                discarded = self.pending.len(),
                "shared scope closed with unsaved changes"
            );
        }
        self.scope.release(ctx).await
    }
}
