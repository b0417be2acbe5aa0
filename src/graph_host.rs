//! Query submission surface
//!
//! [`GraphHost`] serializes all mutation of a graph through one tokio worker
//! per graph id. The worker is spawned on first use and owns everything
//! about the graph:
//!
//! ```text
//! execute(graph_id, query) ──► mpsc queue ──► worker
//!                                              │ ExclusiveAccess (lease held for life)
//!                                              │ GraphEngine (authoritative map)
//!                              ◄── oneshot ────┘ save after each mutating batch
//! ```
//!
//! A mutating batch reaches the change-trace sink only after its snapshot
//! save lands; a failed save aborts the batch. With `save_after_mutation`
//! off, batches are traced at once and the worker saves on shutdown.
//!
//! [`SharedGraphClient`] offers the same [`GraphClient`] surface without a
//! resident worker: every call opens a shared-lease scope, executes, saves
//! if anything changed and releases.

use crate::access::{ExclusiveAccess, SharedAccess};
use crate::change_log::{ChangeTraceSink, TracingChangeSink};
use crate::config::GraphConfig;
use crate::context::RequestContext;
use crate::error::{GraphError, Result};
use crate::gql_executor::{GraphEngine, QueryResult};
use crate::metrics::LeaseMetrics;
use crate::store::BackingStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn execute(&self, query: &str, ctx: &RequestContext) -> Result<QueryResult>;
}

enum WorkItem {
    Execute {
        query: String,
        ctx: RequestContext,
        reply: oneshot::Sender<Result<QueryResult>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

fn worker_gone(graph_id: &str) -> GraphError {
    GraphError::Store(format!("worker for graph '{}' has stopped", graph_id))
}

/// Single-writer executor keyed by graph id.
#[derive(Clone)]
pub struct GraphHost {
    store: Arc<dyn BackingStore>,
    config: Arc<GraphConfig>,
    metrics: Arc<LeaseMetrics>,
    sink: Arc<dyn ChangeTraceSink>,
    workers: Arc<DashMap<String, mpsc::Sender<WorkItem>>>,
    spawn_gate: Arc<Mutex<()>>,
}

impl GraphHost {
    pub fn new(store: Arc<dyn BackingStore>, config: GraphConfig) -> Result<Self> {
        config.validate()?;
        Ok(GraphHost {
            store,
            config: Arc::new(config),
            metrics: Arc::new(LeaseMetrics::new()?),
            sink: Arc::new(TracingChangeSink),
            workers: Arc::new(DashMap::new()),
            spawn_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Change-trace sink handed to every worker spawned afterwards.
    pub fn with_sink(mut self, sink: Arc<dyn ChangeTraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn graph(&self, graph_id: &str) -> HostedGraph {
        HostedGraph {
            host: self.clone(),
            graph_id: graph_id.to_string(),
        }
    }

    /// Graph ids with a running worker, sorted.
    pub fn active_graphs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn execute(&self, graph_id: &str, query: &str, ctx: &RequestContext) -> Result<QueryResult> {
        ctx.check()?;
        let sender = self.worker(graph_id, ctx).await?;

        let (reply, response) = oneshot::channel();
        let item = WorkItem::Execute {
            query: query.to_string(),
            ctx: ctx.clone(),
            reply,
        };
        ctx.run(async { sender.send(item).await.map_err(|_| worker_gone(graph_id)) })
            .await?;

        ctx.run(async { response.await.map_err(|_| worker_gone(graph_id)) })
            .await?
    }

    /// Stop the graph's worker, releasing its exclusive lease. No-op when the
    /// graph has no worker.
    pub async fn shutdown_graph(&self, graph_id: &str) -> Result<()> {
        let _gate = self.spawn_gate.lock().await;

        let Some((_, sender)) = self.workers.remove(graph_id) else {
            return Ok(());
        };

        let (reply, response) = oneshot::channel();
        if sender.send(WorkItem::Shutdown { reply }).await.is_err() {
            debug!(graph_id, "worker already stopped");
            return Ok(());
        }
        response.await.map_err(|_| worker_gone(graph_id))?
    }

    /// Stop every worker; the first failure is reported after all have stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.workers.iter().map(|entry| entry.key().clone()).collect();

        let mut first_error = None;
        for graph_id in ids {
            if let Err(e) = self.shutdown_graph(&graph_id).await {
                warn!(graph_id = %graph_id, error = %e, "graph shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker(&self, graph_id: &str, ctx: &RequestContext) -> Result<mpsc::Sender<WorkItem>> {
        if let Some(sender) = self.live_sender(graph_id) {
            return Ok(sender);
        }

        let _gate = self.spawn_gate.lock().await;
        if let Some(sender) = self.live_sender(graph_id) {
            return Ok(sender);
        }

        let access = ExclusiveAccess::from_config(self.store.clone(), graph_id, &self.config, self.metrics.clone());
        access.start(ctx).await?;

        let map = match access.load(ctx).await {
            Ok(map) => map,
            Err(e) => {
                if let Err(stop) = access.stop(&RequestContext::new()).await {
                    warn!(graph_id, error = %stop, "stop after failed load");
                }
                return Err(e);
            }
        };

        let (sender, queue) = mpsc::channel(self.config.host.queue_depth);
        let worker = GraphWorker {
            graph_id: graph_id.to_string(),
            access,
            engine: GraphEngine::with_map(map).with_sink(self.sink.clone()),
            save_after_mutation: self.config.host.save_after_mutation,
            dirty: false,
        };
        tokio::spawn(worker.run(queue));

        self.workers.insert(graph_id.to_string(), sender.clone());
        Ok(sender)
    }

    fn live_sender(&self, graph_id: &str) -> Option<mpsc::Sender<WorkItem>> {
        self.workers
            .get(graph_id)
            .map(|sender| sender.value().clone())
            .filter(|sender| !sender.is_closed())
    }
}

struct GraphWorker {
    graph_id: String,
    access: ExclusiveAccess,
    engine: GraphEngine,
    save_after_mutation: bool,
    /// Committed batches not saved yet.
    dirty: bool,
}

impl GraphWorker {
    async fn run(mut self, mut queue: mpsc::Receiver<WorkItem>) {
        info!(graph_id = %self.graph_id, "graph worker started");

        while let Some(item) = queue.recv().await {
            match item {
                WorkItem::Execute { query, ctx, reply } => {
                    let result = self.execute(&query, &ctx).await;
                    if reply.send(result).is_err() {
                        debug!(graph_id = %self.graph_id, "caller went away before reply");
                    }
                }
                WorkItem::Shutdown { reply } => {
                    let _ = reply.send(self.stop().await);
                    return;
                }
            }
        }

        // Every sender dropped without a shutdown request
        if let Err(e) = self.stop().await {
            warn!(graph_id = %self.graph_id, error = %e, "stop after queue closed");
        }
    }

    /// Save outstanding changes, then release the lease. The lease is given
    /// back even when the save fails.
    async fn stop(&mut self) -> Result<()> {
        let ctx = RequestContext::new();
        let saved = if self.dirty {
            match self.access.save(&ctx, self.engine.map()).await {
                Ok(etag) => {
                    self.dirty = false;
                    debug!(graph_id = %self.graph_id, etag = %etag, "unsaved changes written on stop");
                    Ok(())
                }
                Err(e) => {
                    warn!(graph_id = %self.graph_id, error = %e, "unsaved changes lost on stop");
                    Err(e)
                }
            }
        } else {
            Ok(())
        };

        let stopped = self.access.stop(&ctx).await;
        info!(graph_id = %self.graph_id, "graph worker stopped");
        saved.and(stopped)
    }

    async fn execute(&mut self, query: &str, ctx: &RequestContext) -> Result<QueryResult> {
        ctx.check()?;
        let staged = self.engine.stage(query)?;

        if !staged.is_mutation() {
            return self.engine.commit(staged);
        }
        if !self.save_after_mutation {
            let result = self.engine.commit(staged)?;
            self.dirty = true;
            return Ok(result);
        }

        if let Err(e) = self.access.save(ctx, self.engine.map()).await {
            let reverted = self.engine.abort(staged);
            warn!(graph_id = %self.graph_id, reverted, error = %e, "save failed, batch aborted");
            self.reload().await;
            return Err(e);
        }

        match self.engine.commit(staged) {
            Ok(result) => Ok(result),
            Err(e) => {
                // The snapshot already holds the batch; follow the store
                warn!(graph_id = %self.graph_id, error = %e, "saved batch not traced");
                self.reload().await;
                Err(e)
            }
        }
    }

    /// Fall back to whatever the store holds now.
    async fn reload(&mut self) {
        match self.access.load(&RequestContext::new()).await {
            Ok(map) => {
                self.engine.replace_map(map);
            }
            Err(e) => {
                warn!(graph_id = %self.graph_id, error = %e, "reload failed");
            }
        }
    }
}

/// One graph of a [`GraphHost`].
#[derive(Clone)]
pub struct HostedGraph {
    host: GraphHost,
    graph_id: String,
}

impl HostedGraph {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }
}

#[async_trait]
impl GraphClient for HostedGraph {
    async fn execute(&self, query: &str, ctx: &RequestContext) -> Result<QueryResult> {
        self.host.execute(&self.graph_id, query, ctx).await
    }
}

/// Per-call shared-lease access.
pub struct SharedGraphClient {
    access: SharedAccess,
}

impl SharedGraphClient {
    pub fn new(access: SharedAccess) -> Self {
        SharedGraphClient { access }
    }

    pub fn from_config(
        store: Arc<dyn BackingStore>,
        graph_id: &str,
        config: &GraphConfig,
        metrics: Arc<LeaseMetrics>,
    ) -> Self {
        Self::new(SharedAccess::from_config(store, graph_id, config, metrics))
    }

    pub fn access(&self) -> &SharedAccess {
        &self.access
    }
}

#[async_trait]
impl GraphClient for SharedGraphClient {
    async fn execute(&self, query: &str, ctx: &RequestContext) -> Result<QueryResult> {
        let mut scope = self.access.open_scope(ctx).await?;

        let outcome = match scope.execute(query) {
            Ok(result) if result.is_mutation() => scope.save(ctx).await.map(|_| result),
            other => other,
        };

        // The lease goes back even when the caller cancelled
        let closed = scope.close(&RequestContext::new()).await;
        let result = outcome?;
        closed?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;
    use crate::error::ErrorKind;
    use crate::store::{Lease, MemoryBackingStore, StoreError, StoreResult, StoredObject};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryBackingStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl BackingStore for FailingStore {
        async fn get(&self, path: &str, lease: Option<&Lease>) -> StoreResult<Option<StoredObject>> {
            self.inner.get(path, lease).await
        }

        async fn set(
            &self,
            path: &str,
            data: Vec<u8>,
            expected_etag: Option<&str>,
            lease: Option<&Lease>,
        ) -> StoreResult<String> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.inner.set(path, data, expected_etag, lease).await
        }

        async fn acquire_exclusive(&self, path: &str, force: bool) -> StoreResult<Lease> {
            self.inner.acquire_exclusive(path, force).await
        }

        async fn acquire_shared(&self, path: &str, ttl: Duration) -> StoreResult<Lease> {
            self.inner.acquire_shared(path, ttl).await
        }

        async fn break_lease(&self, path: &str) -> StoreResult<usize> {
            self.inner.break_lease(path).await
        }

        async fn release(&self, lease: &Lease) -> StoreResult<()> {
            self.inner.release(lease).await
        }
    }

    #[tokio::test]
    async fn test_failed_save_is_not_traced() {
        let store = Arc::new(FailingStore::default());
        let log = Arc::new(MemoryChangeLog::new());
        let host = GraphHost::new(store.clone(), GraphConfig::default())
            .unwrap()
            .with_sink(log.clone());
        let ctx = RequestContext::new();

        host.execute("g", "add node key=kept;", &ctx).await.unwrap();
        assert_eq!(log.len(), 1);

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = host.execute("g", "add node key=lost;", &ctx).await.unwrap_err();
        assert!(matches!(err, GraphError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(log.len(), 1);

        store.fail_writes.store(false, Ordering::SeqCst);
        let result = host.execute("g", "select (*);", &ctx).await.unwrap();
        let keys: Vec<&str> = result.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["kept"]);

        // Replaying the log reproduces exactly what the store holds
        let mut replayed = crate::graph::GraphMap::new();
        crate::change_log::replay(&mut replayed, &log.records()).unwrap();
        assert_eq!(replayed.node_count(), 1);
        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_saves_flush_on_shutdown() {
        let store = Arc::new(MemoryBackingStore::new());
        let mut config = GraphConfig::default();
        config.host.save_after_mutation = false;
        let ctx = RequestContext::new();

        let host = GraphHost::new(store.clone(), config.clone()).unwrap();
        host.execute("g", "add node key=a;", &ctx).await.unwrap();
        assert!(!store.contains("graphs/g.json"));
        host.shutdown().await.unwrap();
        assert!(store.contains("graphs/g.json"));

        let restarted = GraphHost::new(store.clone(), config).unwrap();
        let result = restarted.execute("g", "select (*);", &ctx).await.unwrap();
        assert_eq!(result.nodes.len(), 1);

        // Dropping every handle closes the queue; the worker saves on its way out
        restarted.execute("g", "add node key=b;", &ctx).await.unwrap();
        drop(restarted);
        for _ in 0..100 {
            if store.leases().leases("graphs/g.json").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let check = GraphHost::new(store, GraphConfig::default()).unwrap();
        let result = check.execute("g", "select (*);", &ctx).await.unwrap();
        assert_eq!(result.nodes.len(), 2);
        check.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_persists_mutations() {
        let store = Arc::new(MemoryBackingStore::new());
        let host = GraphHost::new(store.clone(), GraphConfig::default()).unwrap();
        let ctx = RequestContext::new();

        host.execute("g1", "add node key=node1;", &ctx).await.unwrap();
        assert_eq!(host.active_graphs(), vec!["g1".to_string()]);
        assert!(store.contains("graphs/g1.json"));

        let result = host.execute("g1", "select (key=node1);", &ctx).await.unwrap();
        assert_eq!(result.nodes.len(), 1);

        host.shutdown().await.unwrap();
        assert!(host.active_graphs().is_empty());
        assert_eq!(host.metrics().snapshot().active_exclusive, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_reports_error_and_keeps_worker() {
        let host = GraphHost::new(Arc::new(MemoryBackingStore::new()), GraphConfig::default()).unwrap();
        let ctx = RequestContext::new();

        let err = host.execute("g", "add node key=a; add nod key=b;", &ctx).await.unwrap_err();
        assert!(err.is_bad_request());

        host.execute("g", "add node key=a;", &ctx).await.unwrap();
        host.shutdown_graph("g").await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_client_round_trip() {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        let config = GraphConfig::default();
        let metrics = Arc::new(LeaseMetrics::new().unwrap());
        let client = SharedGraphClient::from_config(store, "g", &config, metrics.clone());
        let ctx = RequestContext::new();

        client.execute("add node key=a, tags=t1;", &ctx).await.unwrap();
        let result = client.execute("select (t1);", &ctx).await.unwrap();
        assert!(result.node("a").is_some());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_shared, 0);
        assert_eq!(snapshot.acquired_total, 2);
    }
}
