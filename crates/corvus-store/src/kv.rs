//! The storage contract and the chunk-prefixed key layout.

use bytes::{BufMut, Bytes, BytesMut};

/// Number of hash slots; chunk ids share this space.
const CLUSTER_SLOTS: u32 = 16384;

/// Errors surfaced by storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The engine is temporarily unable to accept the operation.
    #[error("store {0} busy")]
    Busy(u32),

    /// A key did not carry the expected chunk prefix.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// The requested binlog position has been recycled.
    #[error("binlog position {pos} no longer available on store {store_id}")]
    BinlogGone { store_id: u32, pos: u64 },

    /// Engine-level failure, with context from the adapter.
    #[error("storage engine error: {0}")]
    Engine(String),
}

/// Encodes a user key under its chunk: 2-byte big-endian chunk id, then the
/// raw key bytes. Big-endian keeps BTree/engine ordering aligned with chunk
/// order, so a slot is exactly one contiguous range.
pub fn encode_key(chunk_id: u16, key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + key.len());
    buf.put_u16(chunk_id);
    buf.put_slice(key);
    buf.freeze()
}

/// Splits an encoded key back into chunk id and user key.
pub fn decode_key(encoded: &[u8]) -> Result<(u16, &[u8]), StoreError> {
    if encoded.len() < 2 {
        return Err(StoreError::MalformedKey(format!(
            "{} bytes, need at least 2",
            encoded.len()
        )));
    }
    let chunk = u16::from_be_bytes([encoded[0], encoded[1]]);
    Ok((chunk, &encoded[2..]))
}

/// Half-open `[begin, end)` byte bounds covering slots
/// `slot_start..=slot_end` inclusive.
pub fn slot_range_bounds(slot_start: u16, slot_end: u16) -> (Vec<u8>, Vec<u8>) {
    debug_assert!(slot_start <= slot_end);
    let begin = (slot_start).to_be_bytes().to_vec();
    // slot_end + 1 never overflows u16: CLUSTER_SLOTS is 0x4000.
    let end = (slot_end + 1).to_be_bytes().to_vec();
    (begin, end)
}

/// A single mutation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Bytes, value: Bytes },
    Del { key: Bytes },
}

impl WriteOp {
    pub fn key(&self) -> &Bytes {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Del { key } => key,
        }
    }
}

/// An atomic group of mutations. Keys must already be chunk-encoded.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Bytes, value: Bytes) -> &mut Self {
        self.ops.push(WriteOp::Put { key, value });
        self
    }

    pub fn del(&mut self, key: Bytes) -> &mut Self {
        self.ops.push(WriteOp::Del { key });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// The kind of mutation a binlog entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogOp {
    Put,
    Del,
}

/// One replicated mutation. `id` is strictly monotonic per store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEntry {
    pub id: u64,
    pub chunk_id: u16,
    pub op: BinlogOp,
    pub key: Bytes,
    pub value: Bytes,
}

/// A point-in-time read view of one store.
pub trait Snapshot: Send {
    /// Ordered scan over `[begin, end)` in encoded-key order.
    fn scan_range<'a>(
        &'a self,
        begin: &[u8],
        end: &[u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Binlog id of the last mutation visible in this snapshot.
    fn binlog_pos(&self) -> u64;
}

/// Contract every storage engine adapter must provide.
///
/// All methods are callable from any thread; engines serialize internally.
/// Higher layers serialize *conflicting* access through corvus-locks, so an
/// engine only needs per-operation atomicity, not transactional isolation.
pub trait KvStore: Send + Sync {
    fn store_id(&self) -> u32;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Applies the batch atomically and appends one binlog entry per op.
    /// Returns the binlog id of the last appended entry.
    fn write(&self, batch: WriteBatch) -> Result<u64, StoreError>;

    fn snapshot(&self) -> Box<dyn Snapshot>;

    /// Deletes every key in `[begin, end)` as a single engine operation.
    fn delete_range(&self, begin: &[u8], end: &[u8]) -> Result<(), StoreError>;

    /// Hints the engine to drop whole files fully contained in the range.
    /// Engines without file-granular storage treat this as a no-op.
    fn delete_files_in_range(&self, begin: &[u8], end: &[u8]) -> Result<(), StoreError>;

    /// Requests prompt space reclamation for the range.
    fn compact_range(&self, begin: &[u8], end: &[u8]) -> Result<(), StoreError>;

    /// Mutations with binlog id strictly greater than `after`, oldest
    /// first, at most `limit` entries.
    fn binlog_since(&self, after: u64, limit: usize) -> Result<Vec<BinlogEntry>, StoreError>;

    /// Binlog id of the newest appended mutation (0 when empty).
    fn highest_binlog_id(&self) -> u64;
}

/// Fixed mapping from chunks to stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Catalog {
    kv_store_count: u32,
}

impl Catalog {
    pub fn new(kv_store_count: u32) -> Self {
        assert!(kv_store_count > 0, "need at least one kv store");
        Self { kv_store_count }
    }

    pub fn kv_store_count(&self) -> u32 {
        self.kv_store_count
    }

    pub fn store_for_chunk(&self, chunk_id: u16) -> u32 {
        chunk_id as u32 % self.kv_store_count
    }

    /// All chunk ids that live on `store_id`, ascending.
    pub fn chunks_of_store(&self, store_id: u32) -> impl Iterator<Item = u16> + '_ {
        let count = self.kv_store_count;
        (store_id..CLUSTER_SLOTS)
            .step_by(count as usize)
            .map(|c| c as u16)
    }
}
