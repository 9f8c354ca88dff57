use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::config::LoaderConfig;
use crate::node::LocalCache;
use crate::replicator::BackupEntry;
use crate::replicator::BackupReplicator;
use crate::replicator::ReplicationBacklog;
use crate::task::deadline_after;
use crate::task::LoadRequest;
use crate::task::NodeLoadResult;
use crate::task::NodeStatus;
use crate::traits::DataStore;
use crate::traits::ScanRequest;
use crate::types::NodeId;
use crate::types::PartitionId;

enum Stop {
    Exhausted,
    StoreFailure(String),
    Cancelled(&'static str),
}

/// Streams one node's share of a load from the store into the node's partitions.
///
/// Records are consumed one at a time in scan order. Only records of partitions this node is primary for are kept;
/// each of them is upserted locally, which makes it readable right away, and then queued for its backups. The result
/// is emitted only after the replication backlog is drained, or abandoned on cancel or deadline.
pub struct LocalLoader {
    node:       NodeId,
    store:      Arc<dyn DataStore>,
    local:      LocalCache,
    replicator: Arc<BackupReplicator>,
    config:     LoaderConfig,
}

impl LocalLoader {
    pub fn new(
        node: NodeId,
        store: Arc<dyn DataStore>,
        local: LocalCache,
        replicator: Arc<BackupReplicator>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            node,
            store,
            local,
            replicator,
            config,
        }
    }

    #[instrument(level = "trace", skip(self, request, cancel), fields(node = %self.node, load_id = %request.load_id))]
    pub async fn run(&self, request: &LoadRequest, cancel: CancellationToken) -> NodeLoadResult {
        let started = Instant::now();
        let deadline = deadline_after(started, request.timeout);
        let topology = &request.topology;

        let partitions = topology.primary_partitions(&self.node);
        if partitions.is_empty() {
            debug!("Node {} is primary for no partition of '{}'", self.node, request.task.cache);
            return NodeLoadResult::success(self.node.clone(), 0, 0, started.elapsed());
        }
        let owned: HashSet<PartitionId> = partitions.iter().copied().collect();

        // Cancelling the load also cancels the scan, and the scan is cancelled on its own once we stop reading.
        let scan_cancel = cancel.child_token();
        let scan = ScanRequest {
            cache: request.task.cache.clone(),
            filter: request.task.filter.clone(),
            args: request.task.args.clone(),
            affinity: topology.affinity.clone(),
            partitions,
            batch_size: self.config.batch_size(),
        };

        let mut stream = match self.store.scan(scan, scan_cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Node {} could not open a scan of '{}': {err}", self.node, request.task.cache);
                return NodeLoadResult::partial(
                    self.node.clone(),
                    NodeStatus::StoreReadFailure,
                    0,
                    0,
                    started.elapsed(),
                    err,
                );
            }
        };

        let mut backlog = ReplicationBacklog::new(self.replicator.clone(), self.config.replication_workers());
        let mut loaded = 0u64;
        let mut foreign = 0u64;

        let stop = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled("load cancelled"),
                _ = tokio::time::sleep_until(deadline) => break Stop::Cancelled("load deadline reached"),
                next = stream.next() => next,
            };

            let record = match next {
                None => break Stop::Exhausted,
                Some(Err(err)) => break Stop::StoreFailure(err.to_string()),
                Some(Ok(record)) => record,
            };

            let partition = topology.partition_of(&record.key);
            if !owned.contains(&partition) {
                // Stores are free to ignore the ownership hint.
                foreign += 1;
                continue;
            }

            self.local.insert(record.key.clone(), record.value.clone()).await;
            loaded += 1;

            let backups = topology.backups_of(partition);
            if backups.is_empty() {
                continue;
            }

            let entry = BackupEntry {
                load_id: request.load_id,
                cache: request.task.cache.clone(),
                partition,
                key: record.key,
                value: record.value,
            };
            if !backlog.submit(entry, backups.to_vec(), &cancel, deadline).await {
                break Stop::Cancelled(if cancel.is_cancelled() {
                    "load cancelled"
                }
                else {
                    "load deadline reached"
                });
            }
        };

        scan_cancel.cancel();
        drop(stream);

        // Pending backup pushes are bound by the same cancel and deadline as the scan.
        let drained = match stop {
            Stop::Cancelled(reason) => Err(reason),
            _ => tokio::select! {
                biased;
                degraded = backlog.drain() => Ok(degraded),
                _ = cancel.cancelled() => Err("load cancelled"),
                _ = tokio::time::sleep_until(deadline) => Err("load deadline reached"),
            },
        };

        let (status, detail, degraded) = match (stop, drained) {
            (_, Err(reason)) => (NodeStatus::Cancelled, Some(reason.to_string()), backlog.abort().await),
            (Stop::StoreFailure(err), Ok(degraded)) => (NodeStatus::StoreReadFailure, Some(err), degraded),
            (_, Ok(degraded)) => (NodeStatus::Success, None, degraded),
        };

        if degraded > 0 {
            warn!(
                "Node {}: {degraded} entr{} of '{}' lack full backup coverage",
                self.node,
                if degraded == 1 { "y" } else { "ies" },
                request.task.cache
            );
        }
        debug!(
            "Node {} finished loading '{}': status={status} loaded={loaded} skipped={foreign} in {:?}",
            self.node,
            request.task.cache,
            started.elapsed()
        );

        match detail {
            None => NodeLoadResult::success(self.node.clone(), loaded, degraded, started.elapsed()),
            Some(detail) => {
                NodeLoadResult::partial(self.node.clone(), status, loaded, degraded, started.elapsed(), detail)
            }
        }
    }
}
