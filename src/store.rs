use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::StoreError;
use crate::traits::DataStore;
use crate::traits::RecordStream;
use crate::traits::ScanRequest;
use crate::types::PartitionId;
use crate::types::RecordValue;
use crate::types::StoreRecord;

/// An ordered in-memory store. Used as the backing store of the demo and as a stand-in for a database in tests.
///
/// Scans run in a producer task that reads the map in chunks of `batch_size`, so a scan never clones the whole
/// store and the map stays writable while it runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<String, RecordValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I, K>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, RecordValue)>,
        K: Into<String>,
    {
        let store = Self::new();
        {
            let mut guard = store.records.write();
            for (key, value) in records {
                guard.insert(key.into(), value);
            }
        }
        store
    }

    pub fn put<K: Into<String>>(&self, key: K, value: RecordValue) {
        self.records.write().insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn next_chunk(&self, after: Option<&str>, size: usize) -> Vec<(String, RecordValue)> {
        let guard = self.records.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        guard
            .range::<str, _>((lower, Bound::Unbounded))
            .take(size)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn produce(
        self,
        request: ScanRequest,
        tx: mpsc::Sender<Result<StoreRecord, StoreError>>,
        cancel: CancellationToken,
    ) {
        let owned: HashSet<PartitionId> = request.partitions.iter().copied().collect();
        let chunk_size = request.batch_size.max(1);
        let mut cursor: Option<String> = None;
        let mut scanned = 0u64;
        let mut sent = 0u64;

        'scan: loop {
            if cancel.is_cancelled() {
                break;
            }

            let chunk = self.next_chunk(cursor.as_deref(), chunk_size);
            let Some((last_key, _)) = chunk.last()
            else {
                break;
            };
            cursor = Some(last_key.clone());

            for (key, value) in chunk {
                if request.args.limit.is_some_and(|limit| scanned >= limit) {
                    break 'scan;
                }
                scanned += 1;

                if !owned.contains(&request.affinity.partition_of(&key))
                    || !request.filter.matches(&key, &value, &request.args)
                {
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'scan,
                    outcome = tx.send(Ok(StoreRecord::new(key, value))) => {
                        if outcome.is_err() {
                            // The consumer went away.
                            break 'scan;
                        }
                        sent += 1;
                    }
                }
            }
        }

        trace!("Scan of '{}' finished: scanned={scanned} sent={sent}", request.cache);
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn scan(&self, request: ScanRequest, cancel: CancellationToken) -> Result<RecordStream, StoreError> {
        let (tx, rx) = mpsc::channel(request.batch_size.max(1));
        tokio::spawn(self.clone().produce(request, tx, cancel));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
