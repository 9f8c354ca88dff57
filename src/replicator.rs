//! Pushing loaded entries to the backup nodes of their partitions.
//!
//! A push that keeps failing never fails the load: after `replication_attempts` tries the entry is counted as
//! degraded and the load goes on. The backlog of pushes is bounded by a semaphore, which is also what keeps the
//! loader from reading further ahead of replication than `replication_workers` entries.

use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tracing::warn;

use crate::config::LoaderConfig;
use crate::error::TransportError;
use crate::traits::NodeTransport;
use crate::types::LoadId;
use crate::types::NodeId;
use crate::types::PartitionId;
use crate::types::RecordValue;

/// The backup push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub load_id:   LoadId,
    pub cache:     String,
    pub partition: PartitionId,
    pub key:       String,
    pub value:     RecordValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Complete,
    /// Backups that never acknowledged the entry.
    Degraded { missing: Vec<NodeId> },
}

pub struct BackupReplicator {
    transport: Arc<dyn NodeTransport>,
    config:    LoaderConfig,
}

impl BackupReplicator {
    pub fn new(transport: Arc<dyn NodeTransport>, config: LoaderConfig) -> Self {
        Self { transport, config }
    }

    pub async fn replicate(&self, entry: &BackupEntry, backups: &[NodeId]) -> ReplicationOutcome {
        let mut missing = Vec::new();
        for backup in backups {
            if let Err(err) = self.push_with_retry(backup, entry).await {
                warn!(
                    "Giving up on backup {backup} for key '{}' of cache '{}': {err}",
                    entry.key, entry.cache
                );
                missing.push(backup.clone());
            }
        }

        if missing.is_empty() {
            ReplicationOutcome::Complete
        }
        else {
            ReplicationOutcome::Degraded { missing }
        }
    }

    async fn push_with_retry(&self, backup: &NodeId, entry: &BackupEntry) -> Result<(), TransportError> {
        let attempts = self.config.replication_attempts().max(1);
        let mut attempt = 0;

        let push_timeout = self.config.push_timeout();

        loop {
            let pushed = match timeout(push_timeout, self.transport.push_backup(backup, entry.clone())).await {
                Ok(pushed) => pushed,
                Err(_) => Err(TransportError::TimedOut {
                    node:  backup.clone(),
                    after: push_timeout,
                }),
            };
            match pushed {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(err);
                    }
                    let delay = self.config.retry_delay(attempt - 1);
                    let jitter_ms = rand::random::<u64>() % (delay.as_millis() as u64 / 2 + 1);
                    trace!("Backup push to {backup} failed ({err}), attempt {attempt}/{attempts}");
                    tokio::time::sleep(delay + std::time::Duration::from_millis(jitter_ms)).await;
                }
            }
        }
    }
}

/// Replication sub-tasks of one local load.
pub struct ReplicationBacklog {
    replicator: Arc<BackupReplicator>,
    permits:    Arc<Semaphore>,
    tasks:      JoinSet<ReplicationOutcome>,
    degraded:   u64,
}

impl ReplicationBacklog {
    pub fn new(replicator: Arc<BackupReplicator>, workers: usize) -> Self {
        Self {
            replicator,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            degraded: 0,
        }
    }

    /// Queues pushes of `entry` to `backups`, waiting for a free worker first. Returns `false` without queueing when
    /// `cancel` fires or `deadline` passes while waiting; the entry is then counted as degraded.
    pub async fn submit(
        &mut self,
        entry: BackupEntry,
        backups: Vec<NodeId>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> bool {
        self.reap();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
            // The semaphore is never closed.
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit
        else {
            // Already stored locally, so its backups miss it.
            self.degraded += 1;
            return false;
        };

        let replicator = self.replicator.clone();
        self.tasks.spawn(async move {
            let outcome = replicator.replicate(&entry, &backups).await;
            drop(permit);
            outcome
        });
        true
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.count(joined.ok());
        }
    }

    fn count(&mut self, outcome: Option<ReplicationOutcome>) {
        match outcome {
            Some(ReplicationOutcome::Complete) => (),
            Some(ReplicationOutcome::Degraded { .. }) | None => self.degraded += 1,
        }
    }

    /// Waits for every queued push. Returns the number of degraded entries.
    ///
    /// Cancel safe: pushes already counted stay counted if the future is dropped, the rest can still be drained or
    /// aborted.
    pub async fn drain(&mut self) -> u64 {
        while let Some(joined) = self.tasks.join_next().await {
            self.count(joined.ok());
        }
        self.degraded
    }

    /// Stops queued pushes. Entries whose push got interrupted count as degraded.
    pub async fn abort(&mut self) -> u64 {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            self.count(joined.ok());
        }
        self.degraded
    }
}
