use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::error::LoadError;
use crate::partition::PartitionOwnerResolver;
use crate::traits::Membership;
use crate::traits::NodeTransport;
use crate::types::RecordValue;

/// Key lookups against a cache spread over the cluster.
///
/// A lookup goes to the primary of the key's partition first and falls back to its backups in order. Entries are
/// visible as soon as a node commits them, so reads during a load see whatever has been loaded so far.
pub struct CacheReader {
    resolver:  PartitionOwnerResolver,
    transport: Arc<dyn NodeTransport>,
}

impl CacheReader {
    pub fn new(membership: Arc<dyn Membership>, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            resolver: PartitionOwnerResolver::new(membership),
            transport,
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get(&self, cache: &str, key: &str) -> Result<Option<RecordValue>, LoadError> {
        let ownership = self.resolver.resolve(cache).await?;
        let snapshot = ownership.snapshot;
        let Some(assignment) = snapshot.assignment(snapshot.partition_of(key))
        else {
            return Ok(None);
        };

        for node in std::iter::once(&assignment.primary).chain(assignment.backups.iter()) {
            match self.transport.fetch_entry(node, cache, key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => (),
                Err(err) => debug!("Lookup of '{key}' on {node} failed: {err}"),
            }
        }

        Ok(None)
    }
}
