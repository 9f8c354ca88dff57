use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;
use strum::Display;
use tracing::warn;

use crate::task::NodeLoadResult;
use crate::task::NodeStatus;
use crate::types::LoadId;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum OverallStatus {
    Success,
    PartialFailure,
}

/// Result of a cluster-wide load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub load_id:                    LoadId,
    pub cache:                      String,
    pub status:                     OverallStatus,
    /// Entries committed across all owning nodes as primaries.
    pub loaded_count:               u64,
    pub degraded_replication_count: u64,
    pub per_node:                   BTreeMap<NodeId, NodeLoadResult>,
    pub elapsed:                    Duration,
    pub topology_version:           u64,
}

impl LoadOutcome {
    /// The outcome of a load with nothing to do.
    pub fn empty(load_id: LoadId, cache: &str, topology_version: u64) -> Self {
        Self {
            load_id,
            cache: cache.to_string(),
            status: OverallStatus::Success,
            loaded_count: 0,
            degraded_replication_count: 0,
            per_node: BTreeMap::new(),
            elapsed: Duration::ZERO,
            topology_version,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OverallStatus::Success
    }

    /// Nodes which did not report `Success`. These are the ones to hand over to a reload.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.per_node
            .values()
            .filter(|r| !r.is_success())
            .map(|r| r.node.clone())
            .collect()
    }
}

/// Collects per-node reports of one load. Every expected node ends up with exactly one result: the first report
/// counts, and nodes that never report are recorded as timed out.
#[derive(Debug)]
pub struct CompletionAggregator {
    load_id:          LoadId,
    cache:            String,
    topology_version: u64,
    started:          Instant,
    pending:          BTreeSet<NodeId>,
    results:          BTreeMap<NodeId, NodeLoadResult>,
}

impl CompletionAggregator {
    pub fn new<I>(load_id: LoadId, cache: &str, topology_version: u64, expected: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        Self {
            load_id,
            cache: cache.to_string(),
            topology_version,
            started: Instant::now(),
            pending: expected.into_iter().collect(),
            results: BTreeMap::new(),
        }
    }

    /// Records a node's report. Returns `false` for reports from nodes that were not expected or already reported.
    pub fn record(&mut self, result: NodeLoadResult) -> bool {
        if !self.pending.remove(&result.node) {
            warn!(
                "Ignoring report of node {} for load {}: not awaited",
                result.node, self.load_id
            );
            return false;
        }
        self.results.insert(result.node.clone(), result);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &BTreeSet<NodeId> {
        &self.pending
    }

    /// Gives up on every node which hasn't reported yet.
    pub fn expire_pending<S: ToString>(&mut self, detail: S) {
        let elapsed = self.started.elapsed();
        let detail = detail.to_string();
        for node in std::mem::take(&mut self.pending) {
            self.results
                .insert(node.clone(), NodeLoadResult::timeout(node, elapsed, &detail));
        }
    }

    pub fn finish(mut self) -> LoadOutcome {
        if !self.pending.is_empty() {
            self.expire_pending("no report received");
        }

        let loaded_count = self.results.values().map(|r| r.loaded).sum();
        let degraded_replication_count = self.results.values().map(|r| r.degraded_replication).sum();
        let status = if self.results.values().all(|r| r.status == NodeStatus::Success) {
            OverallStatus::Success
        }
        else {
            OverallStatus::PartialFailure
        };

        LoadOutcome {
            load_id: self.load_id,
            cache: self.cache,
            status,
            loaded_count,
            degraded_replication_count,
            per_node: self.results,
            elapsed: self.started.elapsed(),
            topology_version: self.topology_version,
        }
    }
}
