use moka::future::Cache;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::config::LoaderConfig;
use crate::loader::LocalLoader;
use crate::replicator::BackupEntry;
use crate::replicator::BackupReplicator;
use crate::task::LoadRequest;
use crate::task::NodeLoadResult;
use crate::traits::DataStore;
use crate::traits::NodeTransport;
use crate::types::LoadId;
use crate::types::NodeId;
use crate::types::RecordValue;

/// Storage of one cache on one node: primary and backup copies alike.
pub type LocalCache = Cache<String, RecordValue>;

// Cancels that arrived before their load are remembered this long.
const EARLY_CANCEL_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct LoadRegistry {
    running:         HashMap<LoadId, CancellationToken>,
    cancelled_early: HashMap<LoadId, Instant>,
}

impl LoadRegistry {
    fn start(&mut self, load_id: LoadId) -> CancellationToken {
        let token = CancellationToken::new();
        if self.cancelled_early.remove(&load_id).is_some() {
            token.cancel();
        }
        self.running.insert(load_id, token.clone());
        token
    }

    fn cancel(&mut self, load_id: LoadId) -> bool {
        if let Some(token) = self.running.get(&load_id) {
            token.cancel();
            return true;
        }
        self.cancelled_early
            .retain(|_, received| received.elapsed() < EARLY_CANCEL_TTL);
        self.cancelled_early.insert(load_id, Instant::now());
        false
    }
}

// Unregisters a local load however its future ends, including when it gets dropped.
struct RunningGuard<'a> {
    registry: &'a Mutex<LoadRegistry>,
    load_id:  LoadId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().running.remove(&self.load_id);
    }
}

/// A cluster member. Holds its partitions of every cache in node-local storage and executes the load and backup
/// messages addressed to it.
pub struct CacheNode {
    id:     NodeId,
    store:  Arc<dyn DataStore>,
    config: LoaderConfig,
    caches: RwLock<HashMap<String, LocalCache>>,
    loads:  Mutex<LoadRegistry>,
}

impl Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("id", &self.id)
            .field("caches", &self.caches.read().keys().collect::<Vec<_>>())
            .field("active_loads", &self.loads.lock().running.len())
            .finish()
    }
}

impl CacheNode {
    pub fn new(id: NodeId, store: Arc<dyn DataStore>, config: LoaderConfig) -> Self {
        Self {
            id,
            store,
            config,
            caches: RwLock::new(HashMap::new()),
            loads: Mutex::new(LoadRegistry::default()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Local storage of `cache`, created on first use.
    pub fn cache(&self, cache: &str) -> LocalCache {
        if let Some(local) = self.caches.read().get(cache) {
            return local.clone();
        }

        self.caches
            .write()
            .entry(cache.to_string())
            .or_insert_with(|| Cache::builder().name(cache).build())
            .clone()
    }

    /// Runs the local part of a load. `peers` is how this node reaches the backups of its partitions.
    #[instrument(level = "trace", skip_all, fields(node = %self.id, load_id = %request.load_id))]
    pub async fn handle_load(&self, request: LoadRequest, peers: Arc<dyn NodeTransport>) -> NodeLoadResult {
        // A cancel may have overtaken the request.
        let cancel = self.loads.lock().start(request.load_id);
        let _guard = RunningGuard {
            registry: &self.loads,
            load_id:  request.load_id,
        };

        let loader = LocalLoader::new(
            self.id.clone(),
            self.store.clone(),
            self.cache(&request.task.cache),
            Arc::new(BackupReplicator::new(peers, self.config.clone())),
            self.config.clone(),
        );
        loader.run(&request, cancel).await
    }

    /// Asks a local load to stop. A load which hasn't started yet is stopped as soon as it does. Returns `false` if no
    /// load with the id runs here.
    pub fn handle_cancel(&self, load_id: LoadId) -> bool {
        let running = self.loads.lock().cancel(load_id);
        if running {
            debug!("Node {} cancelling load {load_id}", self.id);
        }
        else {
            trace!("Node {} has no running load {load_id}, remembering the cancel", self.id);
        }
        running
    }

    /// Stores a backup copy sent by the primary of its partition.
    pub async fn handle_backup(&self, entry: BackupEntry) {
        self.cache(&entry.cache).insert(entry.key, entry.value).await;
    }

    pub async fn get_local(&self, cache: &str, key: &str) -> Option<RecordValue> {
        let local = self.caches.read().get(cache).cloned()?;
        local.get(key).await
    }

    /// Number of entries of `cache` held by this node, backups included.
    pub fn local_len(&self, cache: &str) -> usize {
        self.caches
            .read()
            .get(cache)
            .map_or(0, |local| local.iter().count())
    }

    pub fn active_loads(&self) -> usize {
        self.loads.lock().running.len()
    }
}
