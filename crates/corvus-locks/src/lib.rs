//! corvus-locks: multi-granularity locking for corvus.
//!
//! Every conflicting access in corvus is serialized through a four-level
//! lock hierarchy: the whole node, a kv store, a chunk within a store, and
//! a single key. Intention modes (IS/IX) on ancestors compose with shared
//! and exclusive modes (S/X) on the level actually being protected, so a
//! chunk-wide migration scan and single-key writes in other chunks proceed
//! in parallel while still excluding each other where they overlap.
//!
//! The crate has two layers:
//!
//! - [`MglLockMgr`] — the sharded scheduler. Targets are plain strings;
//!   each target carries a FIFO queue with a compatibility fast path.
//! - The guard chain in [`hierarchy`] — `StoresLock`, `StoreLock`,
//!   `ChunkLock`, `KeyLock` — which acquires the right intention modes on
//!   every ancestor and releases child-before-parent on drop.
//!
//! Deadlock safety is by prevention, not detection: callers acquiring
//! multiple keys sort them with [`sort_key_targets`] first.

mod hierarchy;
mod mgl;

pub use hierarchy::{
    sort_key_targets, ChunkLock, KeyLock, SessionLocks, StoreLock, StoresLock,
    DEFAULT_LOCK_TIMEOUT_MS, SHORT_LOCK_TIMEOUT_MS,
};
pub use mgl::{LockError, LockMode, LockStatus, MglGuard, MglLockMgr};
