use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

use crate::filter::RecordFilter;
use crate::filter::StoreArgs;
use crate::partition::TopologySnapshot;
use crate::types::LoadId;
use crate::types::NodeId;

// Stands in for deadlines too far away to represent. Still decades ahead.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + timeout`, saturating to a far-future instant. `Duration::MAX` reads as "no timeout".
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// What to load: the target cache, which store records to import and the store's own arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTask {
    pub cache:  String,
    pub filter: RecordFilter,
    pub args:   StoreArgs,
}

impl LoadTask {
    pub fn new<S: Into<String>>(cache: S) -> Self {
        Self {
            cache:  cache.into(),
            filter: RecordFilter::All,
            args:   StoreArgs::default(),
        }
    }

    pub fn filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn args(mut self, args: StoreArgs) -> Self {
        self.args = args;
        self
    }
}

/// A caller's request to load a cache, bounded by `timeout`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadCacheRequest {
    pub cache:   String,
    pub filter:  RecordFilter,
    pub args:    StoreArgs,
    pub timeout: Duration,
}

impl LoadCacheRequest {
    pub fn new<S: Into<String>>(cache: S, timeout: Duration) -> Self {
        Self {
            cache: cache.into(),
            filter: RecordFilter::All,
            args: StoreArgs::default(),
            timeout,
        }
    }

    pub fn filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn args(mut self, args: StoreArgs) -> Self {
        self.args = args;
        self
    }

    pub fn task(&self) -> LoadTask {
        LoadTask {
            cache:  self.cache.clone(),
            filter: self.filter.clone(),
            args:   self.args.clone(),
        }
    }
}

/// The message an owning node receives. It carries the topology snapshot the coordinator resolved so that no node
/// consults ownership on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub load_id:  LoadId,
    pub task:     LoadTask,
    pub topology: TopologySnapshot,
    /// Nodes stop on their own once this much time has passed since they received the request.
    pub timeout:  Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum NodeStatus {
    Success,
    StoreReadFailure,
    Cancelled,
    /// The node never reported back.
    Timeout,
}

/// Per-node outcome of a load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLoadResult {
    pub node:                 NodeId,
    pub status:               NodeStatus,
    /// Entries committed on this node as primary.
    pub loaded:               u64,
    /// Entries that ended up missing from at least one of their backups.
    pub degraded_replication: u64,
    pub elapsed:              Duration,
    pub error:                Option<String>,
}

impl NodeLoadResult {
    pub fn success(node: NodeId, loaded: u64, degraded_replication: u64, elapsed: Duration) -> Self {
        Self {
            node,
            status: NodeStatus::Success,
            loaded,
            degraded_replication,
            elapsed,
            error: None,
        }
    }

    /// A node that stopped early, keeping whatever it loaded.
    pub fn partial<S: ToString>(
        node: NodeId,
        status: NodeStatus,
        loaded: u64,
        degraded_replication: u64,
        elapsed: Duration,
        detail: S,
    ) -> Self {
        Self {
            node,
            status,
            loaded,
            degraded_replication,
            elapsed,
            error: Some(detail.to_string()),
        }
    }

    pub fn timeout<S: ToString>(node: NodeId, elapsed: Duration, detail: S) -> Self {
        Self {
            node,
            status: NodeStatus::Timeout,
            loaded: 0,
            degraded_replication: 0,
            elapsed,
            error: Some(detail.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}
