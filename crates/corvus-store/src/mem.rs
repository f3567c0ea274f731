//! In-memory store used by tests and engine-less nodes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;

use crate::kv::{
    decode_key, BinlogEntry, BinlogOp, KvStore, Snapshot, StoreError, WriteBatch, WriteOp,
};

/// BTreeMap-backed [`KvStore`]. Snapshots clone the map, which is fine at
/// test scale and keeps the point-in-time semantics honest.
pub struct MemStore {
    store_id: u32,
    data: RwLock<BTreeMap<Vec<u8>, Bytes>>,
    binlog: Mutex<Vec<BinlogEntry>>,
    next_binlog_id: AtomicU64,
}

impl MemStore {
    pub fn new(store_id: u32) -> Self {
        Self {
            store_id,
            data: RwLock::new(BTreeMap::new()),
            binlog: Mutex::new(Vec::new()),
            next_binlog_id: AtomicU64::new(1),
        }
    }

    /// Number of live keys, across all chunks.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MemSnapshot {
    data: BTreeMap<Vec<u8>, Bytes>,
    binlog_pos: u64,
}

impl Snapshot for MemSnapshot {
    fn scan_range<'a>(
        &'a self,
        begin: &[u8],
        end: &[u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        let begin = begin.to_vec();
        let end = end.to_vec();
        Box::new(
            self.data
                .range(begin..end)
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    fn binlog_pos(&self) -> u64 {
        self.binlog_pos
    }
}

impl KvStore for MemStore {
    fn store_id(&self) -> u32 {
        self.store_id
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(self.highest_binlog_id());
        }
        // Data map and binlog are updated under both guards so readers of
        // either see a consistent prefix of mutations.
        let mut data = self.data.write().unwrap();
        let mut binlog = self.binlog.lock().unwrap();
        let mut last_id = 0;
        for op in batch.into_ops() {
            let (chunk_id, _) = decode_key(op.key())?;
            let id = self.next_binlog_id.fetch_add(1, Ordering::Relaxed);
            last_id = id;
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key.to_vec(), value.clone());
                    binlog.push(BinlogEntry {
                        id,
                        chunk_id,
                        op: BinlogOp::Put,
                        key,
                        value,
                    });
                }
                WriteOp::Del { key } => {
                    data.remove(key.as_ref());
                    binlog.push(BinlogEntry {
                        id,
                        chunk_id,
                        op: BinlogOp::Del,
                        key,
                        value: Bytes::new(),
                    });
                }
            }
        }
        Ok(last_id)
    }

    fn snapshot(&self) -> Box<dyn Snapshot> {
        let data = self.data.read().unwrap();
        let binlog_pos = self.next_binlog_id.load(Ordering::Relaxed) - 1;
        Box::new(MemSnapshot {
            data: data.clone(),
            binlog_pos,
        })
    }

    fn delete_range(&self, begin: &[u8], end: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap();
        let doomed: Vec<Vec<u8>> = data
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            data.remove(&k);
        }
        Ok(())
    }

    fn delete_files_in_range(&self, _begin: &[u8], _end: &[u8]) -> Result<(), StoreError> {
        // No file-granular storage in memory.
        Ok(())
    }

    fn compact_range(&self, _begin: &[u8], _end: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn binlog_since(&self, after: u64, limit: usize) -> Result<Vec<BinlogEntry>, StoreError> {
        let binlog = self.binlog.lock().unwrap();
        // Entries are appended in id order; binary search for the cut.
        let start = binlog.partition_point(|e| e.id <= after);
        Ok(binlog[start..].iter().take(limit).cloned().collect())
    }

    fn highest_binlog_id(&self) -> u64 {
        self.next_binlog_id.load(Ordering::Relaxed) - 1
    }
}
