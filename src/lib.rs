//! # gridload
//!
//! Coordinated bulk loading of a partitioned in-memory cache from a persistent store.
//!
//! A cache is split into partitions, each owned by one primary node and replicated to a number of backup nodes.
//! Loading it means every node streams from the store only the records of the partitions it is primary for, keeps
//! them locally and pushes copies to the partitions' backups. The crate takes care of the coordination:
//!
//! - resolving which nodes own the cache, from one versioned [`TopologySnapshot`](partition::TopologySnapshot);
//! - broadcasting the load to all owners in parallel and collecting their reports within a deadline;
//! - streaming store records into node-local storage with bounded memory;
//! - replicating loaded entries to backups with retries;
//! - aggregating per-node reports into a [`LoadOutcome`], which tells exactly which nodes failed and how.
//!
//! A load is an upsert. It can be repeated, entirely or for the failed nodes only, without changing the result.
//! Entries are readable as soon as their node commits them; a load is not a transaction.
//!
//! # The Collaborators
//!
//! The crate is agnostic of the store, of cluster membership and of the network. Each is a trait:
//!
//! - [`DataStore`] scans records in a cancellable stream;
//! - [`Membership`] provides topology snapshots;
//! - [`NodeTransport`] delivers load, cancel, backup and lookup messages to nodes by their [`NodeId`].
//!
//! [`InProcessCluster`](cluster::InProcessCluster) implements the last two over a set of
//! [`CacheNode`](node::CacheNode)s living in one process, and [`MemoryStore`](store::MemoryStore) is an in-memory
//! store.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::from_records((0..1000).map(|i| (format!("key-{i}"), json!(i)))));
//! let cluster = InProcessCluster::new(LoaderConfig::default());
//! for id in ["n1", "n2", "n3"] {
//!     cluster.add_node(id, store.clone());
//! }
//! cluster.define_cache(CacheConfig::builder().name("numbers").backups(1).build()?)?;
//!
//! let outcome = cluster
//!     .coordinator()?
//!     .load_cache(LoadCacheRequest::new("numbers", Duration::from_secs(30)))
//!     .await?;
//! if !outcome.is_success() {
//!     let retry = cluster
//!         .coordinator()?
//!         .reload_nodes(LoadCacheRequest::new("numbers", Duration::from_secs(30)), &outcome.failed_nodes())
//!         .await?;
//! }
//! ```

pub mod aggregator;
pub mod cluster;
pub mod config;
pub mod coordinator;
#[cfg(feature = "demo")]
pub mod demo;
pub mod error;
pub mod filter;
pub mod loader;
pub mod node;
pub mod partition;
pub mod reader;
pub mod replicator;
pub mod store;
pub mod task;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use aggregator::LoadOutcome;
#[doc(inline)]
pub use coordinator::BroadcastCoordinator;
#[doc(inline)]
pub use traits::DataStore;
#[doc(inline)]
pub use traits::Membership;
#[doc(inline)]
pub use traits::NodeTransport;
#[doc(inline)]
pub use types::NodeId;

pub mod prelude {
    pub use crate::aggregator::LoadOutcome;
    pub use crate::aggregator::OverallStatus;
    pub use crate::cluster::InProcessCluster;
    pub use crate::config::CacheConfig;
    pub use crate::config::LoaderConfig;
    pub use crate::coordinator::BroadcastCoordinator;
    pub use crate::error::*;
    pub use crate::filter::CmpOp;
    pub use crate::filter::Operand;
    pub use crate::filter::RecordFilter;
    pub use crate::filter::StoreArgs;
    pub use crate::node::CacheNode;
    pub use crate::partition::KeyAffinity;
    pub use crate::reader::CacheReader;
    pub use crate::store::MemoryStore;
    pub use crate::task::LoadCacheRequest;
    pub use crate::task::NodeLoadResult;
    pub use crate::task::NodeStatus;
    pub use crate::traits::*;
    pub use crate::types::*;
}
