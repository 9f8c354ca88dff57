use fieldx::fxstruct;
use std::time::Duration;

use crate::error::LoadError;
use crate::partition::KeyAffinity;

/// Tunables of the load path, shared by coordinators and the nodes running local loads.
///
/// ```ignore
/// let config = LoaderConfig::builder()
///     .batch_size(1024)
///     .replication_workers(8)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[fxstruct(no_new, default(off), builder, get(copy))]
pub struct LoaderConfig {
    /// Capacity of the channel between a store scan and the local loader. Together with `replication_workers` it
    /// bounds how many records a node holds in flight.
    #[fieldx(default(512))]
    batch_size: usize,

    /// Concurrent backup pushes per node.
    #[fieldx(default(4))]
    replication_workers: usize,

    /// Attempts per backup before an entry is declared degraded.
    #[fieldx(default(3))]
    replication_attempts: u32,

    #[fieldx(default(Duration::from_millis(50)))]
    retry_base_delay: Duration,

    #[fieldx(default(Duration::from_secs(1)))]
    retry_max_delay: Duration,

    /// Bound of a single backup push attempt. An attempt that takes longer counts as failed.
    #[fieldx(default(Duration::from_secs(2)))]
    push_timeout: Duration,

    /// How long a coordinator keeps collecting `Cancelled` reports after a load timed out or was aborted.
    #[fieldx(default(Duration::from_millis(200)))]
    cancel_grace: Duration,
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.batch_size == 0 {
            return Err(LoadError::Config("batch_size must be at least 1".into()));
        }
        if self.replication_workers == 0 {
            return Err(LoadError::Config("replication_workers must be at least 1".into()));
        }
        if self.replication_attempts == 0 {
            return Err(LoadError::Config("replication_attempts must be at least 1".into()));
        }
        if self.push_timeout.is_zero() {
            return Err(LoadError::Config("push_timeout must not be zero".into()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(LoadError::Config(format!(
                "retry_base_delay ({:?}) exceeds retry_max_delay ({:?})",
                self.retry_base_delay, self.retry_max_delay
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::builder().build().expect("every LoaderConfig field has a default")
    }
}

/// Static description of a cache: its name, how keys map to partitions and how many backup copies it keeps.
#[derive(Debug, Clone)]
#[fxstruct(no_new, default(off), builder)]
pub struct CacheConfig {
    #[fieldx(get, builder(into))]
    name: String,

    #[fieldx(get, default(KeyAffinity::Hash { partitions: 256 }))]
    affinity: KeyAffinity,

    #[fieldx(get(copy), default(1))]
    backups: usize,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.name.is_empty() {
            return Err(LoadError::Config("cache name must not be empty".into()));
        }
        self.affinity.validate().map_err(LoadError::Config)
    }
}
