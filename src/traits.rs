use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::MembershipError;
use crate::error::StoreError;
use crate::error::TransportError;
use crate::filter::RecordFilter;
use crate::filter::StoreArgs;
use crate::partition::KeyAffinity;
use crate::partition::TopologySnapshot;
use crate::replicator::BackupEntry;
use crate::task::LoadRequest;
use crate::task::NodeLoadResult;
use crate::types::LoadId;
use crate::types::NodeId;
use crate::types::PartitionId;
use crate::types::RecordValue;
use crate::types::StoreRecord;

pub type RecordStream = Pin<Box<dyn Stream<Item = Result<StoreRecord, StoreError>> + Send>>;

/// What a node asks its store for.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub cache:      String,
    pub filter:     RecordFilter,
    pub args:       StoreArgs,
    pub affinity:   KeyAffinity,
    /// Partitions the scanning node is primary for. Stores able to read by range may skip everything else.
    pub partitions: Vec<PartitionId>,
    /// Records the store may buffer ahead of the consumer.
    pub batch_size: usize,
}

// The external persistent store. Read-only from the point of view of this crate.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Opens a scan. The returned stream must stop producing, and release whatever it holds, once `cancel` fires or
    /// the stream is dropped.
    async fn scan(&self, request: ScanRequest, cancel: CancellationToken) -> Result<RecordStream, StoreError>;
}

#[async_trait]
pub trait Membership: Send + Sync + 'static {
    /// Ownership of every partition of `cache` as of one instant.
    async fn topology(&self, cache: &str) -> Result<TopologySnapshot, MembershipError>;
}

/// Node-addressed messaging. Implementations deliver each call to the named node exactly once; retry policy belongs
/// to the callers.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Runs a local load on `node` and returns its report.
    async fn dispatch_load(&self, node: &NodeId, request: LoadRequest) -> Result<NodeLoadResult, TransportError>;

    async fn cancel_load(&self, node: &NodeId, load_id: LoadId) -> Result<(), TransportError>;

    async fn push_backup(&self, node: &NodeId, entry: BackupEntry) -> Result<(), TransportError>;

    async fn fetch_entry(&self, node: &NodeId, cache: &str, key: &str) -> Result<Option<RecordValue>, TransportError>;
}
