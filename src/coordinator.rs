use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::aggregator::CompletionAggregator;
use crate::aggregator::LoadOutcome;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::partition::PartitionOwnerResolver;
use crate::partition::TopologySnapshot;
use crate::task::deadline_after;
use crate::task::LoadCacheRequest;
use crate::task::LoadRequest;
use crate::task::NodeLoadResult;
use crate::traits::Membership;
use crate::traits::NodeTransport;
use crate::types::LoadId;
use crate::types::NodeId;

/// Entry point of a cluster-wide load.
///
/// A load resolves the owners of the cache once, sends one [`LoadRequest`] to every owning node in parallel and
/// collects their reports until all are in or the request's timeout expires. Nodes are never retried implicitly;
/// see [`BroadcastCoordinator::reload_nodes`] for retrying the ones that failed.
///
/// The last `cancel_grace` of the timeout (at most half of it) is reserved for winding down. Once the rest has
/// passed, or the load is aborted, the coordinator sends a cancel message to every node which hasn't reported yet and
/// keeps listening for their `Cancelled` reports until the grace period or the timeout runs out. Nodes still silent
/// after that are recorded as `Timeout`. A load therefore never outlives its timeout.
pub struct BroadcastCoordinator {
    resolver:  PartitionOwnerResolver,
    transport: Arc<dyn NodeTransport>,
    config:    LoaderConfig,
    shutdown:  CancellationToken,
}

impl BroadcastCoordinator {
    pub fn new(
        membership: Arc<dyn Membership>,
        transport: Arc<dyn NodeTransport>,
        config: LoaderConfig,
    ) -> Result<Self, LoadError> {
        config.validate()?;
        Ok(Self {
            resolver: PartitionOwnerResolver::new(membership),
            transport,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub async fn load_cache(&self, request: LoadCacheRequest) -> Result<LoadOutcome, LoadError> {
        self.load_cache_with_cancel(request, CancellationToken::new()).await
    }

    /// Same as [`load_cache`](Self::load_cache), but the load is aborted once `cancel` fires.
    pub async fn load_cache_with_cancel(
        &self,
        request: LoadCacheRequest,
        cancel: CancellationToken,
    ) -> Result<LoadOutcome, LoadError> {
        let ownership = self.resolver.resolve(&request.cache).await?;
        self.broadcast(request, ownership.snapshot, ownership.owners, cancel)
            .await
    }

    /// Loads again on the listed nodes only. Nodes which no longer own a partition of the cache are skipped.
    ///
    /// Loading is an upsert, so repeating it over entries that made it the first time is harmless.
    pub async fn reload_nodes(&self, request: LoadCacheRequest, nodes: &[NodeId]) -> Result<LoadOutcome, LoadError> {
        let ownership = self.resolver.resolve(&request.cache).await?;
        let targets: BTreeSet<NodeId> = nodes
            .iter()
            .filter(|node| {
                let owns = ownership.owners.contains(*node);
                if !owns {
                    debug!("Skipping reload on {node}: it owns no partition of '{}'", request.cache);
                }
                owns
            })
            .cloned()
            .collect();
        self.broadcast(request, ownership.snapshot, targets, CancellationToken::new())
            .await
    }

    /// Aborts every load in progress. Loads started afterwards are aborted right away.
    pub fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[instrument(level = "trace", skip_all, fields(cache = %request.cache, nodes = targets.len()))]
    async fn broadcast(
        &self,
        request: LoadCacheRequest,
        snapshot: Arc<TopologySnapshot>,
        targets: BTreeSet<NodeId>,
        cancel: CancellationToken,
    ) -> Result<LoadOutcome, LoadError> {
        let load_id = LoadId::new();

        if targets.is_empty() {
            info!("Nothing to load into '{}': no owning nodes", request.cache);
            return Ok(LoadOutcome::empty(load_id, &request.cache, snapshot.version));
        }

        let started = Instant::now();
        let deadline = deadline_after(started, request.timeout);
        let reserve = self.config.cancel_grace().min(request.timeout / 2);
        let cancel_at = deadline_after(started, request.timeout - reserve);
        let load_request = LoadRequest {
            load_id,
            task: request.task(),
            topology: (*snapshot).clone(),
            timeout: request.timeout,
        };
        let mut aggregator =
            CompletionAggregator::new(load_id, &request.cache, snapshot.version, targets.iter().cloned());

        let mut dispatches = JoinSet::new();
        for node in targets {
            let transport = self.transport.clone();
            let load_request = load_request.clone();
            dispatches.spawn(async move {
                let started = Instant::now();
                match transport.dispatch_load(&node, load_request).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!("Load {load_id} could not reach node {node}: {err}");
                        NodeLoadResult::timeout(node, started.elapsed(), err)
                    }
                }
            });
        }

        let interrupted = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some("load aborted"),
                _ = self.shutdown.cancelled() => break Some("coordinator shut down"),
                _ = tokio::time::sleep_until(cancel_at) => break Some("load timed out"),
                joined = dispatches.join_next() => match joined {
                    Some(joined) => Self::collect(&mut aggregator, joined),
                    None => break None,
                },
            }
        };

        if let Some(reason) = interrupted {
            self.wind_down(load_id, reason, deadline, &mut aggregator, &mut dispatches)
                .await;
        }

        let outcome = aggregator.finish();
        info!(
            "Load {load_id} of '{}' finished: {} with {} entries from {} node(s) in {:?}",
            outcome.cache,
            outcome.status,
            outcome.loaded_count,
            outcome.per_node.len(),
            outcome.elapsed
        );
        if outcome.degraded_replication_count > 0 {
            warn!(
                "Load {load_id}: {} entries are missing from some of their backups",
                outcome.degraded_replication_count
            );
        }

        Ok(outcome)
    }

    async fn wind_down(
        &self,
        load_id: LoadId,
        reason: &str,
        deadline: Instant,
        aggregator: &mut CompletionAggregator,
        dispatches: &mut JoinSet<NodeLoadResult>,
    ) {
        warn!(
            "Load {load_id}: {reason}, cancelling {} pending node(s)",
            aggregator.pending().len()
        );

        for node in aggregator.pending().iter().cloned() {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.cancel_load(&node, load_id).await {
                    debug!("Cancel of load {load_id} not delivered to {node}: {err}");
                }
            });
        }

        let grace = deadline_after(Instant::now(), self.config.cancel_grace()).min(deadline);
        while !aggregator.is_complete() {
            tokio::select! {
                _ = tokio::time::sleep_until(grace) => break,
                joined = dispatches.join_next() => match joined {
                    Some(joined) => Self::collect(aggregator, joined),
                    None => break,
                },
            }
        }

        dispatches.abort_all();
        aggregator.expire_pending(reason);
    }

    fn collect(aggregator: &mut CompletionAggregator, joined: Result<NodeLoadResult, JoinError>) {
        match joined {
            Ok(result) => {
                debug!(
                    "Node {} reported {}: {} loaded, {} degraded",
                    result.node, result.status, result.loaded, result.degraded_replication
                );
                aggregator.record(result);
            }
            Err(err) => {
                // The node is left pending and ends up as timed out.
                warn!("A dispatch task failed: {err}");
            }
        }
    }
}
