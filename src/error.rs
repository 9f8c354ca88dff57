use std::time::Duration;
use thiserror::Error;

use crate::types::NodeId;

/// Errors surfaced to the caller of a cluster-wide load. Anything that happens on an individual node is reported
/// through its [`NodeLoadResult`](crate::task::NodeLoadResult) instead.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("topology of cache '{cache}' is unavailable: {reason}")]
    TopologyUnavailable { cache: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),

    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("node {0} is not a cluster member")]
    UnknownNode(NodeId),

    #[error("cache '{cache}' is not defined on node {node}")]
    UnknownCache { node: NodeId, cache: String },

    #[error("node {node} did not answer within {after:?}")]
    TimedOut { node: NodeId, after: Duration },

    #[error("node {node} failed to handle the message: {reason}")]
    NodeFailed { node: NodeId, reason: String },

    #[error("message encoding failed: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("cache '{0}' is not defined in the cluster")]
    UnknownCache(String),

    #[error("cluster membership is unavailable: {0}")]
    Unavailable(String),

    #[error("inconsistent topology snapshot: {0}")]
    Inconsistent(String),
}
