#![allow(dead_code)]

use async_trait::async_trait;
use gridload::prelude::*;
use gridload::replicator::BackupEntry;
use gridload::task::LoadRequest;
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub const CACHE: &str = "numbers";

/// `key-000` to `key-{count - 1}` with the key number as value.
pub fn numbered_store(count: usize) -> MemoryStore {
    MemoryStore::from_records((0..count).map(|i| (format!("key-{i:03}"), json!(i))))
}

/// Three ranges: below `key-100`, below `key-200` and the rest.
pub fn thirds() -> KeyAffinity {
    KeyAffinity::Range {
        split_points: vec!["key-100".into(), "key-200".into()],
    }
}

pub fn fast_retries() -> LoaderConfig {
    LoaderConfig::builder()
        .retry_base_delay(Duration::from_millis(1))
        .retry_max_delay(Duration::from_millis(4))
        .cancel_grace(Duration::from_millis(500))
        .build()
        .unwrap()
}

pub fn cluster_with<S: DataStore>(ids: &[&str], backups: usize, store: Arc<S>) -> Arc<InProcessCluster> {
    let cluster = InProcessCluster::new(fast_retries());
    for id in ids {
        cluster.add_node(*id, store.clone());
    }
    cluster
        .define_cache(
            CacheConfig::builder()
                .name(CACHE)
                .affinity(thirds())
                .backups(backups)
                .build()
                .unwrap(),
        )
        .unwrap();
    cluster
}

pub fn id(id: &str) -> NodeId {
    NodeId::from(id)
}

/// Yields `fail_after` records of the inner scan, then a read error.
pub struct FailingStore {
    pub inner:      MemoryStore,
    pub fail_after: usize,
}

#[async_trait]
impl DataStore for FailingStore {
    async fn scan(&self, request: ScanRequest, cancel: CancellationToken) -> Result<RecordStream, StoreError> {
        let records = self.inner.scan(request, cancel).await?;
        let failure = tokio_stream::once(Err(StoreError::Read(format!(
            "connection lost after {} records",
            self.fail_after
        ))));
        Ok(Box::pin(records.take(self.fail_after).chain(failure)))
    }
}

/// Delays every record of the inner scan. Counts scans that have released their resources.
pub struct SlowStore {
    pub inner:    MemoryStore,
    pub delay:    Duration,
    pub released: Arc<AtomicUsize>,
}

impl SlowStore {
    pub fn new(inner: MemoryStore, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStore for SlowStore {
    async fn scan(&self, request: ScanRequest, cancel: CancellationToken) -> Result<RecordStream, StoreError> {
        let mut records = self.inner.scan(request, cancel.clone()).await?;
        let (tx, rx) = mpsc::channel(1);
        let delay = self.delay;
        let released = self.released.clone();

        tokio::spawn(async move {
            while let Some(record) = records.next().await {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            released.fetch_add(1, Ordering::SeqCst);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Passes everything through to the inner transport, counting the calls.
pub struct CountingTransport {
    pub inner: Arc<dyn NodeTransport>,
    pub calls: AtomicUsize,
}

impl CountingTransport {
    pub fn new(inner: Arc<dyn NodeTransport>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeTransport for CountingTransport {
    async fn dispatch_load(&self, node: &NodeId, request: LoadRequest) -> Result<NodeLoadResult, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.dispatch_load(node, request).await
    }

    async fn cancel_load(&self, node: &NodeId, load_id: LoadId) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel_load(node, load_id).await
    }

    async fn push_backup(&self, node: &NodeId, entry: BackupEntry) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.push_backup(node, entry).await
    }

    async fn fetch_entry(&self, node: &NodeId, cache: &str, key: &str) -> Result<Option<RecordValue>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_entry(node, cache, key).await
    }
}

/// Passes everything through to the inner transport, except that load requests sent to `silent` are never answered.
pub struct SilentTransport {
    pub inner:  Arc<dyn NodeTransport>,
    pub silent: NodeId,
}

#[async_trait]
impl NodeTransport for SilentTransport {
    async fn dispatch_load(&self, node: &NodeId, request: LoadRequest) -> Result<NodeLoadResult, TransportError> {
        if node == &self.silent {
            return std::future::pending().await;
        }
        self.inner.dispatch_load(node, request).await
    }

    async fn cancel_load(&self, node: &NodeId, load_id: LoadId) -> Result<(), TransportError> {
        self.inner.cancel_load(node, load_id).await
    }

    async fn push_backup(&self, node: &NodeId, entry: BackupEntry) -> Result<(), TransportError> {
        self.inner.push_backup(node, entry).await
    }

    async fn fetch_entry(&self, node: &NodeId, cache: &str, key: &str) -> Result<Option<RecordValue>, TransportError> {
        self.inner.fetch_entry(node, cache, key).await
    }
}
