//! The sharded multi-granularity lock scheduler.
//!
//! Targets hash onto a fixed power-of-two number of shards; each shard is a
//! mutex over a map from target to its per-target scheduler context. A
//! context keeps two FIFO lists: requests currently holding the target
//! (running) and requests waiting behind a conflict (pending), plus per-mode
//! reference counts so conflict checks are a single bitmask test.
//!
//! Admission rule: a request runs immediately only when it conflicts with no
//! running mode AND nothing is already pending. Anything else queues. On
//! release, pending requests are promoted strictly in arrival order, stopping
//! at the first incompatible one, so a waiting X can never be starved by an
//! endless stream of compatible readers.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use tracing::trace;

/// Number of independent lock shards. Must be a power of two.
const SHARD_NUM: usize = 32;

/// Lock modes, ordered so each fits a bit in the conflict masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockMode {
    /// Intention shared: a descendant will be read.
    Is = 0,
    /// Intention exclusive: a descendant will be written.
    Ix = 1,
    /// Shared access to this target and everything below it.
    S = 2,
    /// Exclusive access to this target and everything below it.
    X = 3,
}

impl LockMode {
    fn bit(self) -> u16 {
        1 << (self as u8)
    }

    /// The intention mode an ancestor must carry for this mode.
    pub fn parent_mode(self) -> LockMode {
        match self {
            LockMode::Is | LockMode::S => LockMode::Is,
            LockMode::Ix | LockMode::X => LockMode::Ix,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockMode::Is => "IS",
            LockMode::Ix => "IX",
            LockMode::S => "S",
            LockMode::X => "X",
        };
        write!(f, "{s}")
    }
}

/// `CONFLICTS[incoming] & running_modes != 0` means the incoming request
/// conflicts with at least one running holder.
const CONFLICTS: [u16; 4] = [
    // IS: only X blocks it
    1 << 3,
    // IX: S and X block it
    (1 << 2) | (1 << 3),
    // S: IX and X block it
    (1 << 1) | (1 << 3),
    // X: everything blocks it
    (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3),
];

fn is_conflict(running_modes: u16, incoming: LockMode) -> bool {
    CONFLICTS[incoming as usize] & running_modes != 0
}

/// Where a request currently stands in its target's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Not yet submitted, or already released.
    Uninited,
    /// Queued behind a conflict.
    Wait,
    /// Holding the target.
    Ok,
    /// Gave up waiting.
    Timeout,
}

/// Errors surfaced to lock callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The caller-supplied wait budget elapsed before the lock was granted.
    #[error("lock timeout on target '{target}' mode {mode}")]
    Timeout { target: String, mode: LockMode },
}

/// Shared slot a waiter blocks on until promotion or timeout.
struct WaitSlot {
    state: Mutex<LockStatus>,
    cond: Condvar,
}

impl WaitSlot {
    fn new(initial: LockStatus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        })
    }

    fn set(&self, status: LockStatus) {
        *self.state.lock().unwrap() = status;
        self.cond.notify_one();
    }

    fn get(&self) -> LockStatus {
        *self.state.lock().unwrap()
    }

    /// Blocks until the slot becomes `Ok` or the timeout elapses.
    /// Returns the final observed status (`Ok` or whatever it was left at).
    fn wait(&self, timeout: Duration) -> LockStatus {
        let guard = self.state.lock().unwrap();
        let (guard, res) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| *s != LockStatus::Ok)
            .unwrap();
        if res.timed_out() && *guard != LockStatus::Ok {
            LockStatus::Wait
        } else {
            *guard
        }
    }
}

struct QueueEntry {
    ticket: u64,
    mode: LockMode,
    slot: Arc<WaitSlot>,
}

/// Per-target scheduler state.
#[derive(Default)]
struct SchedCtx {
    running: Vec<QueueEntry>,
    pending: Vec<QueueEntry>,
    running_modes: u16,
    running_ref: [u32; 4],
}

impl SchedCtx {
    fn incr_running(&mut self, mode: LockMode) {
        self.running_ref[mode as usize] += 1;
        self.running_modes |= mode.bit();
    }

    fn decr_running(&mut self, mode: LockMode) {
        debug_assert!(self.running_ref[mode as usize] > 0);
        self.running_ref[mode as usize] -= 1;
        if self.running_ref[mode as usize] == 0 {
            self.running_modes &= !mode.bit();
        }
    }

    /// Admit or enqueue a new request. Returns the immediate status.
    fn submit(&mut self, entry: QueueEntry) -> LockStatus {
        // A non-empty pending queue forces FIFO even for compatible modes,
        // otherwise a stream of readers could starve a queued writer forever.
        if !is_conflict(self.running_modes, entry.mode) && self.pending.is_empty() {
            entry.slot.set(LockStatus::Ok);
            self.incr_running(entry.mode);
            self.running.push(entry);
            LockStatus::Ok
        } else {
            entry.slot.set(LockStatus::Wait);
            self.pending.push(entry);
            LockStatus::Wait
        }
    }

    /// Promotes pending requests in arrival order, stopping at the first
    /// one that conflicts with what is (now) running.
    fn promote(&mut self) {
        while let Some(head) = self.pending.first() {
            if is_conflict(self.running_modes, head.mode) {
                break;
            }
            let entry = self.pending.remove(0);
            self.incr_running(entry.mode);
            entry.slot.set(LockStatus::Ok);
            self.running.push(entry);
        }
    }

    /// Removes a request (running or pending) and reschedules.
    /// Returns true when the context is empty and can be dropped.
    fn remove(&mut self, ticket: u64) -> bool {
        if let Some(pos) = self.running.iter().position(|e| e.ticket == ticket) {
            let entry = self.running.remove(pos);
            self.decr_running(entry.mode);
            entry.slot.set(LockStatus::Uninited);
            // Promote on every release, not just when the target goes idle:
            // the head waiter may conflict only with the mode that just
            // left (a queued S behind a departing IX, with IS still held).
            // promote() stops at the first conflicting head, so remaining
            // holders keep their exclusion.
            self.promote();
        } else if let Some(pos) = self.pending.iter().position(|e| e.ticket == ticket) {
            let entry = self.pending.remove(pos);
            entry.slot.set(LockStatus::Uninited);
            // The removed waiter may have been the head blocker for
            // compatible requests queued behind it.
            self.promote();
        }
        self.running.is_empty() && self.pending.is_empty()
    }

    fn describe(&self, target: &str, out: &mut Vec<String>) {
        for e in &self.running {
            out.push(format!(
                "running: target={target} mode={} ticket={}",
                e.mode, e.ticket
            ));
        }
        for e in &self.pending {
            out.push(format!(
                "pending: target={target} mode={} ticket={}",
                e.mode, e.ticket
            ));
        }
    }
}

struct Shard {
    map: Mutex<HashMap<String, SchedCtx>>,
}

/// The sharded lock manager. One instance per node, shared by every session
/// and background worker.
pub struct MglLockMgr {
    shards: Vec<Shard>,
    hasher: ahash::RandomState,
    next_ticket: std::sync::atomic::AtomicU64,
    /// Handle guards use to release without borrowing the manager.
    weak_self: Weak<MglLockMgr>,
}

impl MglLockMgr {
    pub fn new() -> Arc<Self> {
        let shards = (0..SHARD_NUM)
            .map(|_| Shard {
                map: Mutex::new(HashMap::new()),
            })
            .collect();
        Arc::new_cyclic(|weak| Self {
            shards,
            hasher: ahash::RandomState::new(),
            next_ticket: std::sync::atomic::AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    fn shard_for(&self, target: &str) -> &Shard {
        let mut h = self.hasher.build_hasher();
        h.write(target.as_bytes());
        &self.shards[(h.finish() as usize) & (SHARD_NUM - 1)]
    }

    /// Acquires `target` in `mode`, waiting up to `timeout_ms`.
    ///
    /// The returned guard releases the lock on drop. A `Timeout` error means
    /// the request was withdrawn; the queue is left consistent.
    pub fn acquire(
        &self,
        target: &str,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<MglGuard, LockError> {
        let ticket = self
            .next_ticket
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let slot = WaitSlot::new(LockStatus::Uninited);

        let status = {
            let shard = self.shard_for(target);
            let mut map = shard.map.lock().unwrap();
            let ctx = map.entry(target.to_string()).or_default();
            ctx.submit(QueueEntry {
                ticket,
                mode,
                slot: Arc::clone(&slot),
            })
        };

        if status == LockStatus::Ok {
            return Ok(MglGuard {
                mgr: self.weak_self.clone(),
                target: target.to_string(),
                ticket,
                mode,
            });
        }

        trace!(target = %target, %mode, "lock contended, waiting");
        if slot.wait(Duration::from_millis(timeout_ms)) == LockStatus::Ok {
            return Ok(MglGuard {
                mgr: self.weak_self.clone(),
                target: target.to_string(),
                ticket,
                mode,
            });
        }

        // Timed out. Withdraw under the shard lock; promotion may have won
        // the race in the meantime, in which case the lock is ours after all.
        let shard = self.shard_for(target);
        let mut map = shard.map.lock().unwrap();
        if slot.get() == LockStatus::Ok {
            drop(map);
            return Ok(MglGuard {
                mgr: self.weak_self.clone(),
                target: target.to_string(),
                ticket,
                mode,
            });
        }
        if let Some(ctx) = map.get_mut(target) {
            if ctx.remove(ticket) {
                map.remove(target);
            }
        }
        Err(LockError::Timeout {
            target: target.to_string(),
            mode,
        })
    }

    fn release(&self, target: &str, ticket: u64) {
        let shard = self.shard_for(target);
        let mut map = shard.map.lock().unwrap();
        if let Some(ctx) = map.get_mut(target) {
            if ctx.remove(ticket) {
                map.remove(target);
            }
        }
    }

    /// True if any request currently holds `target`.
    ///
    /// Purely an introspection probe; the answer can be stale by the time
    /// the caller looks at it.
    pub fn is_locked(&self, target: &str) -> bool {
        let shard = self.shard_for(target);
        let map = shard.map.lock().unwrap();
        map.get(target).is_some_and(|ctx| !ctx.running.is_empty())
    }

    /// Snapshot of every running and pending request, for admin output.
    pub fn lock_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.map.lock().unwrap();
            for (target, ctx) in map.iter() {
                ctx.describe(target, &mut out);
            }
        }
        out
    }
}

/// A held lock. Dropping it releases the target and promotes waiters.
pub struct MglGuard {
    mgr: Weak<MglLockMgr>,
    target: String,
    ticket: u64,
    mode: LockMode,
}

impl MglGuard {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for MglGuard {
    fn drop(&mut self) {
        // A gone manager means the whole node is tearing down; there is
        // nothing left to release.
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.release(&self.target, self.ticket);
        }
    }
}

impl std::fmt::Debug for MglGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MglGuard")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .finish()
    }
}
