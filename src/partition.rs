//! Partitioning of a cache's key space and resolution of partition owners.
//!
//! Ownership is never consulted as live state. A load fetches one [`TopologySnapshot`] up front, checks it for
//! consistency and ships it to every owning node, so all participants agree on who is primary for what.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::error::LoadError;
use crate::error::MembershipError;
use crate::traits::Membership;
use crate::types::NodeId;
use crate::types::PartitionId;

/// How keys map onto partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAffinity {
    /// `hash(key) % partitions`.
    Hash { partitions: u32 },
    /// `n` strictly increasing split points make `n + 1` contiguous ranges. Partition `i` holds keys in
    /// `[split_points[i - 1], split_points[i])`.
    Range { split_points: Vec<String> },
}

impl KeyAffinity {
    pub fn partition_count(&self) -> u32 {
        match self {
            Self::Hash { partitions } => *partitions,
            Self::Range { split_points } => split_points.len() as u32 + 1,
        }
    }

    pub fn partition_of(&self, key: &str) -> PartitionId {
        match self {
            Self::Hash { partitions } => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % (*partitions).max(1) as u64) as PartitionId
            }
            Self::Range { split_points } => split_points.partition_point(|split| split.as_str() <= key) as PartitionId,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Hash { partitions } if *partitions == 0 => Err("hash affinity needs at least one partition".into()),
            Self::Hash { .. } => Ok(()),
            Self::Range { split_points } => {
                if split_points.windows(2).any(|w| w[0] >= w[1]) {
                    Err("range split points must be strictly increasing".into())
                }
                else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition: PartitionId,
    pub primary:   NodeId,
    /// Ordered; the first entry is the preferred replica for reads.
    pub backups:   Vec<NodeId>,
}

/// Ownership of every partition of one cache as of a single instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub cache:       String,
    pub version:     u64,
    pub affinity:    KeyAffinity,
    pub members:     Vec<NodeId>,
    /// Indexed by partition id.
    pub assignments: Vec<PartitionAssignment>,
}

impl TopologySnapshot {
    pub fn partition_of(&self, key: &str) -> PartitionId {
        self.affinity.partition_of(key)
    }

    pub fn assignment(&self, partition: PartitionId) -> Option<&PartitionAssignment> {
        self.assignments.get(partition as usize)
    }

    pub fn backups_of(&self, partition: PartitionId) -> &[NodeId] {
        self.assignment(partition).map_or(&[], |a| a.backups.as_slice())
    }

    pub fn primary_partitions(&self, node: &NodeId) -> Vec<PartitionId> {
        self.assignments
            .iter()
            .filter(|a| &a.primary == node)
            .map(|a| a.partition)
            .collect()
    }

    /// Nodes that are primary for at least one partition.
    pub fn owners(&self) -> BTreeSet<NodeId> {
        self.assignments.iter().map(|a| a.primary.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), MembershipError> {
        let expected = self.affinity.partition_count() as usize;
        if self.assignments.is_empty() {
            // A cache nobody hosts is legal; it simply has nothing to load.
            return Ok(());
        }
        if self.assignments.len() != expected {
            return Err(MembershipError::Inconsistent(format!(
                "{} partitions assigned out of {expected}",
                self.assignments.len()
            )));
        }

        let members: HashSet<&NodeId> = self.members.iter().collect();
        for (idx, assignment) in self.assignments.iter().enumerate() {
            if assignment.partition as usize != idx {
                return Err(MembershipError::Inconsistent(format!(
                    "partition {} listed at position {idx}",
                    assignment.partition
                )));
            }
            if !members.contains(&assignment.primary) {
                return Err(MembershipError::Inconsistent(format!(
                    "primary {} of partition {idx} is not a member",
                    assignment.primary
                )));
            }
            let mut seen = HashSet::new();
            for backup in &assignment.backups {
                if backup == &assignment.primary {
                    return Err(MembershipError::Inconsistent(format!(
                        "backup {backup} of partition {idx} is also its primary"
                    )));
                }
                if !seen.insert(backup) {
                    return Err(MembershipError::Inconsistent(format!(
                        "partition {idx} lists backup {backup} more than once"
                    )));
                }
                if !members.contains(backup) {
                    return Err(MembershipError::Inconsistent(format!(
                        "backup {backup} of partition {idx} is not a member"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Round-robin placement: members are sorted by id, partition `p` goes to member `p % n` and its backups to the
/// next members in ring order.
pub fn assign_partitions(
    cache: &str,
    version: u64,
    affinity: &KeyAffinity,
    members: &[NodeId],
    backups: usize,
) -> TopologySnapshot {
    let mut members = members.to_vec();
    members.sort();
    members.dedup();

    let assignments = if members.is_empty() {
        Vec::new()
    }
    else {
        let n = members.len();
        let backups = backups.min(n - 1);
        (0..affinity.partition_count())
            .map(|partition| {
                let primary_idx = partition as usize % n;
                PartitionAssignment {
                    partition,
                    primary: members[primary_idx].clone(),
                    backups: (1..=backups).map(|i| members[(primary_idx + i) % n].clone()).collect(),
                }
            })
            .collect()
    };

    TopologySnapshot {
        cache: cache.to_string(),
        version,
        affinity: affinity.clone(),
        members,
        assignments,
    }
}

/// The set of owning nodes of a cache, together with the snapshot it was derived from.
#[derive(Debug, Clone)]
pub struct Ownership {
    pub snapshot: Arc<TopologySnapshot>,
    pub owners:   BTreeSet<NodeId>,
}

pub struct PartitionOwnerResolver {
    membership: Arc<dyn Membership>,
}

impl PartitionOwnerResolver {
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self { membership }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn resolve(&self, cache: &str) -> Result<Ownership, LoadError> {
        let unavailable = |err: MembershipError| LoadError::TopologyUnavailable {
            cache:  cache.to_string(),
            reason: err.to_string(),
        };

        let snapshot = self.membership.topology(cache).await.map_err(unavailable)?;
        snapshot.validate().map_err(unavailable)?;

        let owners = snapshot.owners();
        debug!(
            "Resolved cache '{cache}' at topology v{}: {} owner(s) of {} partition(s)",
            snapshot.version,
            owners.len(),
            snapshot.assignments.len()
        );

        Ok(Ownership {
            snapshot: Arc::new(snapshot),
            owners,
        })
    }
}
