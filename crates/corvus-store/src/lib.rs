//! corvus-store: the storage seam between the cluster core and the
//! persistent engine.
//!
//! The cluster layer never talks to a concrete engine directly. It sees:
//!
//! - [`KvStore`] — ordered key/value access with atomic write batches,
//!   point-in-time snapshots, range deletion, and a monotonic per-store
//!   binlog of mutations.
//! - [`Catalog`] — the fixed chunk→store mapping. A chunk is a slot-sized
//!   lock and placement granule; `store = chunk % kv_store_count`.
//! - [`MemStore`] — a BTreeMap-backed implementation used by the test
//!   suite and by nodes running without a persistent engine configured.
//!
//! Keys are stored with a two-byte big-endian chunk prefix so every slot
//! occupies one contiguous range, which is what makes migration snapshots
//! and GC range-deletes cheap.

mod kv;
mod mem;

pub use kv::{
    decode_key, encode_key, slot_range_bounds, BinlogEntry, BinlogOp, Catalog, KvStore, Snapshot,
    StoreError, WriteBatch, WriteOp,
};
pub use mem::MemStore;

use std::sync::Arc;

/// The set of kv stores backing one node, plus their catalog.
#[derive(Clone)]
pub struct Stores {
    stores: Vec<Arc<dyn KvStore>>,
    catalog: Catalog,
}

impl Stores {
    pub fn new(stores: Vec<Arc<dyn KvStore>>) -> Self {
        let catalog = Catalog::new(stores.len() as u32);
        Self { stores, catalog }
    }

    /// Builds `count` in-memory stores, the default for tests and for
    /// nodes started without a data engine.
    pub fn in_memory(count: u32) -> Self {
        let stores = (0..count)
            .map(|id| Arc::new(MemStore::new(id)) as Arc<dyn KvStore>)
            .collect();
        Self::new(stores)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn kv_store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    pub fn store(&self, store_id: u32) -> Option<&Arc<dyn KvStore>> {
        self.stores.get(store_id as usize)
    }

    /// The store that holds a given slot's data.
    pub fn store_for_slot(&self, slot: u16) -> &Arc<dyn KvStore> {
        &self.stores[self.catalog.store_for_chunk(slot) as usize]
    }

    /// Counts keys in one slot by scanning its prefix range.
    pub fn count_keys_in_slot(&self, slot: u16) -> Result<u64, StoreError> {
        let store = self.store_for_slot(slot);
        let (begin, end) = slot_range_bounds(slot, slot);
        let snap = store.snapshot();
        Ok(snap.scan_range(&begin, &end).count() as u64)
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("kv_store_count", &self.stores.len())
            .finish_non_exhaustive()
    }
}
