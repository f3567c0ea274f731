//! Scoped guard chain over the lock hierarchy.
//!
//! Targets form a tree: the empty string covers the whole node, `store_N`
//! one kv store, `store_N:C` one chunk, `store_N:C:key` one key. Acquiring
//! any level first takes the matching intention mode on every ancestor
//! (S → IS, X → IX), so a cluster-wide X (flushall-style) conflicts with
//! everything below without per-key bookkeeping.
//!
//! Guards release child-before-parent: each level's own lock is stored
//! before its parent guard, and struct fields drop in declaration order.
//! `KeyLock` additionally detaches from the session's held-key set before
//! anything is released, so the set never names a key whose ancestors are
//! already free.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::mgl::{LockError, LockMode, MglGuard, MglLockMgr};

/// Default wait budget for administrative paths (slot moves, flushes).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_600_000;

/// Wait budget for short-lived per-command acquisitions.
pub const SHORT_LOCK_TIMEOUT_MS: u64 = 1_000;

fn store_target(store_id: u32) -> String {
    format!("store_{store_id}")
}

fn chunk_target(store_id: u32, chunk_id: u32) -> String {
    format!("store_{store_id}:{chunk_id}")
}

fn key_target(store_id: u32, chunk_id: u32, key: &[u8]) -> String {
    format!(
        "store_{store_id}:{chunk_id}:{}",
        String::from_utf8_lossy(key)
    )
}

/// Sorts key coordinates into the canonical acquisition order:
/// store ascending, then chunk ascending, then key ascending.
///
/// Callers taking more than one key lock must pass their set through here
/// first; the hierarchy does no deadlock detection.
pub fn sort_key_targets(keys: &mut [(u32, u32, Vec<u8>)]) {
    keys.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
}

/// The set of key locks a session currently holds, for introspection and
/// for rejecting re-acquisition of a key the session already owns.
#[derive(Default, Clone)]
pub struct SessionLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, store_id: u32, chunk_id: u32, key: &[u8]) -> bool {
        self.held
            .lock()
            .unwrap()
            .contains(&key_target(store_id, chunk_id, key))
    }

    fn attach(&self, target: &str) {
        self.held.lock().unwrap().insert(target.to_string());
    }

    fn detach(&self, target: &str) {
        self.held.lock().unwrap().remove(target);
    }
}

/// Node-wide lock (target "").
pub struct StoresLock {
    guard: MglGuard,
}

impl StoresLock {
    pub fn acquire(
        mgr: &Arc<MglLockMgr>,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<Self, LockError> {
        let guard = mgr.acquire("", mode, timeout_ms)?;
        Ok(Self { guard })
    }

    pub fn mode(&self) -> LockMode {
        self.guard.mode()
    }
}

/// Lock on one kv store, holding the matching intention on the node level.
pub struct StoreLock {
    guard: MglGuard,
    _parent: StoresLock,
    store_id: u32,
}

impl StoreLock {
    pub fn acquire(
        mgr: &Arc<MglLockMgr>,
        store_id: u32,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<Self, LockError> {
        let parent = StoresLock::acquire(mgr, mode.parent_mode(), timeout_ms)?;
        let guard = mgr.acquire(&store_target(store_id), mode, timeout_ms)?;
        Ok(Self {
            guard,
            _parent: parent,
            store_id,
        })
    }

    pub fn store_id(&self) -> u32 {
        self.store_id
    }

    pub fn mode(&self) -> LockMode {
        self.guard.mode()
    }
}

/// Lock on one chunk, holding intentions on the store and node levels.
pub struct ChunkLock {
    guard: MglGuard,
    _parent: StoreLock,
    chunk_id: u32,
}

impl ChunkLock {
    pub fn acquire(
        mgr: &Arc<MglLockMgr>,
        store_id: u32,
        chunk_id: u32,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<Self, LockError> {
        let parent = StoreLock::acquire(mgr, store_id, mode.parent_mode(), timeout_ms)?;
        let guard = mgr.acquire(&chunk_target(store_id, chunk_id), mode, timeout_ms)?;
        Ok(Self {
            guard,
            _parent: parent,
            chunk_id,
        })
    }

    pub fn store_id(&self) -> u32 {
        self._parent.store_id()
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    pub fn mode(&self) -> LockMode {
        self.guard.mode()
    }
}

/// Lock on a single key, the leaf of the hierarchy.
pub struct KeyLock {
    // Field order is load-bearing: session detach runs in Drop, then the
    // key's own guard drops, then the ancestor chain.
    session: Option<SessionLocks>,
    target: String,
    guard: Option<MglGuard>,
    _parent: ChunkLock,
}

impl KeyLock {
    pub fn acquire(
        mgr: &Arc<MglLockMgr>,
        store_id: u32,
        chunk_id: u32,
        key: &[u8],
        mode: LockMode,
        session: Option<SessionLocks>,
        timeout_ms: u64,
    ) -> Result<Self, LockError> {
        let parent = ChunkLock::acquire(mgr, store_id, chunk_id, mode.parent_mode(), timeout_ms)?;
        let target = key_target(store_id, chunk_id, key);
        let guard = mgr.acquire(&target, mode, timeout_ms)?;
        if let Some(ref s) = session {
            s.attach(&target);
        }
        Ok(Self {
            session,
            target,
            guard: Some(guard),
            _parent: parent,
        })
    }

    pub fn mode(&self) -> LockMode {
        // guard is Some until drop
        self.guard.as_ref().map(|g| g.mode()).unwrap_or(LockMode::Is)
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Detach from the session ledger before any lock is released so the
        // ledger never lists a key whose parent intent is already gone.
        if let Some(ref s) = self.session {
            s.detach(&self.target);
        }
        self.guard.take();
    }
}
