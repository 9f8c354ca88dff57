use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::config::CacheConfig;
use crate::config::LoaderConfig;
use crate::coordinator::BroadcastCoordinator;
use crate::error::LoadError;
use crate::error::MembershipError;
use crate::error::TransportError;
use crate::node::CacheNode;
use crate::partition::assign_partitions;
use crate::partition::TopologySnapshot;
use crate::reader::CacheReader;
use crate::replicator::BackupEntry;
use crate::task::LoadRequest;
use crate::task::NodeLoadResult;
use crate::traits::DataStore;
use crate::traits::Membership;
use crate::traits::NodeTransport;
use crate::types::LoadId;
use crate::types::NodeId;
use crate::types::RecordValue;

// Every message is encoded and decoded on its way, the same as it would be between processes.
fn wire<T: Serialize + DeserializeOwned>(message: &T) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(&serde_json::to_vec(message)?)?)
}

#[derive(Debug)]
struct Member {
    node:      Arc<CacheNode>,
    reachable: AtomicBool,
}

/// A cluster living in a single process.
///
/// Provides both the membership view and the transport between its nodes. Nodes can be marked unreachable, in which
/// case messages addressed to them fail as they would on a partitioned network. Adding or removing nodes and
/// defining caches bumps the topology version.
#[derive(Debug)]
pub struct InProcessCluster {
    myself:  Weak<InProcessCluster>,
    config:  LoaderConfig,
    members: RwLock<BTreeMap<NodeId, Arc<Member>>>,
    caches:  RwLock<HashMap<String, CacheConfig>>,
    version: AtomicU64,
}

impl InProcessCluster {
    pub fn new(config: LoaderConfig) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            config,
            members: RwLock::new(BTreeMap::new()),
            caches: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn topology_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Starts a node reading from `store`. Replaces a node with the same id.
    pub fn add_node<N: Into<NodeId>>(&self, id: N, store: Arc<dyn DataStore>) -> Arc<CacheNode> {
        let id = id.into();
        let node = Arc::new(CacheNode::new(id.clone(), store, self.config.clone()));
        self.members.write().insert(
            id.clone(),
            Arc::new(Member {
                node:      node.clone(),
                reachable: AtomicBool::new(true),
            }),
        );
        let version = self.bump_version();
        info!("Node {id} joined, topology v{version}");
        node
    }

    pub fn remove_node(&self, id: &NodeId) -> Option<Arc<CacheNode>> {
        let member = self.members.write().remove(id)?;
        let version = self.bump_version();
        info!("Node {id} left, topology v{version}");
        Some(member.node.clone())
    }

    /// Makes a node drop (`false`) or accept (`true`) every message addressed to it.
    pub fn set_reachable(&self, id: &NodeId, reachable: bool) {
        if let Some(member) = self.members.read().get(id) {
            debug!("Node {id} is now {}", if reachable { "reachable" } else { "unreachable" });
            member.reachable.store(reachable, Ordering::Release);
        }
    }

    pub fn define_cache(&self, config: CacheConfig) -> Result<(), LoadError> {
        config.validate()?;
        let name = config.name().clone();
        self.caches.write().insert(name.clone(), config);
        let version = self.bump_version();
        debug!("Cache '{name}' defined, topology v{version}");
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<CacheNode>> {
        self.members.read().get(id).map(|m| m.node.clone())
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<CacheNode>> {
        self.members.read().values().map(|m| m.node.clone()).collect()
    }

    pub fn coordinator(self: &Arc<Self>) -> Result<BroadcastCoordinator, LoadError> {
        BroadcastCoordinator::new(self.clone(), self.clone(), self.config.clone())
    }

    pub fn reader(self: &Arc<Self>) -> CacheReader {
        CacheReader::new(self.clone(), self.clone())
    }

    fn member(&self, id: &NodeId) -> Result<Arc<Member>, TransportError> {
        let member = self
            .members
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownNode(id.clone()))?;
        if !member.reachable.load(Ordering::Acquire) {
            return Err(TransportError::Unreachable(id.clone()));
        }
        Ok(member)
    }
}

#[async_trait]
impl Membership for InProcessCluster {
    async fn topology(&self, cache: &str) -> Result<TopologySnapshot, MembershipError> {
        let config = self
            .caches
            .read()
            .get(cache)
            .cloned()
            .ok_or_else(|| MembershipError::UnknownCache(cache.to_string()))?;
        let members: Vec<NodeId> = self.members.read().keys().cloned().collect();

        Ok(assign_partitions(
            cache,
            self.topology_version(),
            config.affinity(),
            &members,
            config.backups(),
        ))
    }
}

#[async_trait]
impl NodeTransport for InProcessCluster {
    #[instrument(level = "trace", skip(self, request), fields(load_id = %request.load_id))]
    async fn dispatch_load(&self, node: &NodeId, request: LoadRequest) -> Result<NodeLoadResult, TransportError> {
        let member = self.member(node)?;
        let request = wire(&request)?;
        let peers: Arc<dyn NodeTransport> = self
            .myself
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable(node.clone()))?;

        // The load runs on the node, not in the caller's future: a caller giving up doesn't stop it.
        let handle = tokio::spawn({
            let member = member.clone();
            async move { member.node.handle_load(request, peers).await }
        });
        let result = handle.await.map_err(|err| TransportError::NodeFailed {
            node:   node.clone(),
            reason: err.to_string(),
        })?;

        // A node cut off while loading never gets its report through.
        if !member.reachable.load(Ordering::Acquire) {
            return Err(TransportError::Unreachable(node.clone()));
        }
        wire(&result)
    }

    async fn cancel_load(&self, node: &NodeId, load_id: LoadId) -> Result<(), TransportError> {
        let member = self.member(node)?;
        member.node.handle_cancel(wire(&load_id)?);
        Ok(())
    }

    async fn push_backup(&self, node: &NodeId, entry: BackupEntry) -> Result<(), TransportError> {
        let member = self.member(node)?;
        member.node.handle_backup(wire(&entry)?).await;
        Ok(())
    }

    async fn fetch_entry(&self, node: &NodeId, cache: &str, key: &str) -> Result<Option<RecordValue>, TransportError> {
        let member = self.member(node)?;
        wire(&member.node.get_local(cache, key).await)
    }
}
