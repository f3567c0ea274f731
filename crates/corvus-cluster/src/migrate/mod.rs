//! Slot migration: moving ownership and data between nodes.
//!
//! The manager runs both roles. As the **sender** it splits a `SETSLOT
//! MIGRATING` instruction into per-store sub-tasks, admits them through a
//! resizable pool, and drives each through snapshot → binlog → commit. As
//! the **receiver** it registers importing intent on `SETSLOT IMPORTING`,
//! validates each incoming transfer's store-count handshake, and applies
//! batches atomically.
//!
//! Ownership moves only at commit: the destination claims the slots at
//! `max(srcEpoch, dstEpoch) + 1`, so any concurrent claim loses or wins by
//! plain epoch comparison. After a successful transfer the sender emits an
//! event naming the moved slots; the GC manager reclaims their data.
//!
//! Stop/restart: STOP freezes sub-tasks at batch boundaries and keeps the
//! checkpoint (slots done, binlog position); RESTART clears the stop flag
//! and parked sub-tasks resume from the checkpoint. Waiting sender
//! sub-tasks are untouched by a receiver-only stop.

mod batch;
mod receiver;
mod sender;
mod task;

pub use batch::{decode_entries, BatchEntry, MigrateBatch, XferAck, XferFrame, OP_DEL, OP_PUT};
pub use sender::XferConn;
pub use task::{MigrateTask, SharedSubTask, SubTaskInfo, TaskId, TaskState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use corvus_store::Stores;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use crate::ratelimit::RateLimiter;
use crate::slots::SlotBitmap;
use crate::topology::{ClusterState, NodeName};
use crate::ClusterError;

/// Ack message a stopping receiver returns; the sender maps it to Stopped
/// rather than Fail so the checkpoint survives.
pub(crate) const RECEIVER_STOPPED: &str = "receiver stopped";

/// Migration tuning. Batch size and rate are changeable at runtime.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub snapshot_batch_size_kb: usize,
    pub rate_limit_mb: u64,
    pub network_timeout: Duration,
    /// Binlog entries the receiver may trail by before commit is allowed.
    pub binlog_lag_threshold: u64,
    /// Binlog entries read per tailing iteration.
    pub binlog_iter: usize,
    pub sender_threads: usize,
    pub receiver_threads: usize,
    /// Gate on starting a task whose slots overlap a recent one.
    pub wait_time_if_exists_migrate_task: Duration,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            snapshot_batch_size_kb: 16,
            rate_limit_mb: 32,
            network_timeout: Duration::from_secs(5),
            binlog_lag_threshold: 10,
            binlog_iter: 512,
            sender_threads: 5,
            receiver_threads: 5,
            wait_time_if_exists_migrate_task: Duration::from_secs(600),
        }
    }
}

/// Opens transfer streams to a destination node. The server installs a TCP
/// connector; tests wire managers together directly.
pub trait Connector: Send + Sync {
    fn connect(&self, dst_addr: &str) -> Result<XferConn, ClusterError>;
}

/// Observer of transfer flush boundaries, for tests and metrics.
pub trait MigrateObserver: Send + Sync {
    fn on_batch_sent(&self, _task: &TaskId, _entries: u64, _bytes: u64) {}
    fn on_batch_applied(&self, _task: &TaskId, _entries: u64) {}
}

/// Notifications the server reacts to (GC, config persistence).
#[derive(Debug, Clone)]
pub enum MigrateEvent {
    /// Sender side: ownership transferred; reclaim these slots.
    TaskDone { task_id: TaskId, slots: SlotBitmap },
    /// Sender side: the task gave up.
    TaskFailed { task_id: TaskId },
    /// Receiver side: all stores transferred; slots claimed locally.
    ImportDone { task_id: TaskId, slots: SlotBitmap },
}

/// Receiver-side task bookkeeping.
struct ImportTask {
    src: NodeName,
    /// The full expected slot set (importing intent at first Hello).
    slots: SlotBitmap,
    sub_tasks: Vec<SharedSubTask>,
    stop: Arc<AtomicBool>,
    finalized: bool,
}

/// Redirect decision for a key in a migrating slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateRedirect {
    /// Slot not involved in any migration here.
    None,
    /// Slot is streaming out but still served locally; the binlog tail
    /// forwards every local mutation to `dst`.
    Migrating { dst: NodeName },
    /// Slot has been committed away; clients must go to `dst`.
    Moved { dst: NodeName },
}

pub struct MigrateManager {
    state: Arc<RwLock<ClusterState>>,
    stores: Stores,
    config: Mutex<MigrateConfig>,
    connector: Arc<dyn Connector>,
    limiter: Arc<RateLimiter>,
    sender_sem: Mutex<Arc<Semaphore>>,
    receiver_sem: Mutex<Arc<Semaphore>>,
    tasks: Mutex<HashMap<TaskId, Arc<Mutex<MigrateTask>>>>,
    imports: Mutex<HashMap<TaskId, Arc<Mutex<ImportTask>>>>,
    /// Slots accepted for import but not yet claimed.
    importing_intent: Mutex<Vec<(NodeName, SlotBitmap)>>,
    next_task_seq: AtomicU64,
    observer: Mutex<Option<Arc<dyn MigrateObserver>>>,
    events: mpsc::Sender<MigrateEvent>,
    /// Handle the spawned transfer tasks use to reach back into the
    /// manager without keeping it alive forever.
    weak_self: Weak<MigrateManager>,
}

impl MigrateManager {
    pub fn new(
        state: Arc<RwLock<ClusterState>>,
        stores: Stores,
        config: MigrateConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<MigrateEvent>,
    ) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_mb * 1024 * 1024));
        let sender_sem = Arc::new(Semaphore::new(config.sender_threads));
        let receiver_sem = Arc::new(Semaphore::new(config.receiver_threads));
        Arc::new_cyclic(|weak| Self {
            state,
            stores,
            config: Mutex::new(config),
            connector,
            limiter,
            sender_sem: Mutex::new(sender_sem),
            receiver_sem: Mutex::new(receiver_sem),
            tasks: Mutex::new(HashMap::new()),
            imports: Mutex::new(HashMap::new()),
            importing_intent: Mutex::new(Vec::new()),
            next_task_seq: AtomicU64::new(0),
            observer: Mutex::new(None),
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn set_observer(&self, observer: Arc<dyn MigrateObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn MigrateObserver>> {
        self.observer.lock().unwrap().clone()
    }

    fn emit(&self, event: MigrateEvent) {
        if self.events.try_send(event).is_err() {
            warn!("migrate event channel full or closed, dropping event");
        }
    }

    /// Resizes the sender pool; applies to sub-tasks admitted from now on.
    pub fn set_sender_threads(&self, n: usize) {
        self.config.lock().unwrap().sender_threads = n.max(1);
        *self.sender_sem.lock().unwrap() = Arc::new(Semaphore::new(n.max(1)));
    }

    pub fn set_receiver_threads(&self, n: usize) {
        self.config.lock().unwrap().receiver_threads = n.max(1);
        *self.receiver_sem.lock().unwrap() = Arc::new(Semaphore::new(n.max(1)));
    }

    pub fn set_rate_limit_mb(&self, mb: u64) {
        self.config.lock().unwrap().rate_limit_mb = mb;
        self.limiter.set_bytes_per_sec(mb * 1024 * 1024);
    }

    pub fn set_batch_size_kb(&self, kb: usize) {
        self.config.lock().unwrap().snapshot_batch_size_kb = kb.max(1);
    }

    // ---- receiver side ---------------------------------------------------

    /// Records `SETSLOT IMPORTING <src> <slots>` intent.
    pub fn prepare_import(&self, src: NodeName, slots: SlotBitmap) -> Result<(), ClusterError> {
        {
            let state = self.state.read().unwrap();
            for slot in slots.iter() {
                if state.myself_owns(slot) {
                    return Err(ClusterError::Migrate(format!(
                        "slot {slot} already owned by this node"
                    )));
                }
            }
        }
        let mut intents = self.importing_intent.lock().unwrap();
        for (_, existing) in intents.iter() {
            for slot in slots.iter() {
                if existing.test(slot) {
                    return Err(ClusterError::Migrate(format!(
                        "slot {slot} already importing"
                    )));
                }
            }
        }
        info!(src = %src, slots = slots.count(), "importing intent recorded");
        intents.push((src, slots));
        Ok(())
    }

    /// True while `slot` is accepted for import but not yet claimed.
    pub fn is_importing(&self, slot: u16) -> bool {
        self.importing_intent
            .lock()
            .unwrap()
            .iter()
            .any(|(_, slots)| slots.test(slot))
    }

    /// Handles one inbound transfer stream. The first frame must be the
    /// Hello; everything after it is applied by a spawned receiver task.
    pub fn accept(&self, mut frames: mpsc::Receiver<XferFrame>, acks: mpsc::Sender<XferAck>) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let timeout = mgr.config.lock().unwrap().network_timeout;
            let hello = match tokio::time::timeout(timeout, frames.recv()).await {
                Ok(Some(frame)) => frame,
                _ => return,
            };
            let XferFrame::Hello {
                task_id,
                store_id,
                store_count,
                slots,
            } = hello
            else {
                let _ = acks.send(XferAck::Err("expected hello".into())).await;
                return;
            };

            if store_count != mgr.stores.kv_store_count() {
                warn!(
                    theirs = store_count,
                    ours = mgr.stores.kv_store_count(),
                    "refusing transfer: kv store count mismatch"
                );
                let _ = acks
                    .send(XferAck::Err("kv store count mismatch".into()))
                    .await;
                return;
            }
            let Some(task_id) = TaskId::parse(&task_id) else {
                let _ = acks.send(XferAck::Err("bad task id".into())).await;
                return;
            };
            let Some(store) = mgr.stores.store(store_id).cloned() else {
                let _ = acks.send(XferAck::Err("bad store id".into())).await;
                return;
            };

            // Every slot must have been announced via SETSLOT IMPORTING.
            let covered = {
                let intents = mgr.importing_intent.lock().unwrap();
                slots
                    .iter()
                    .all(|s| intents.iter().any(|(_, m)| m.test(s)))
            };
            if !covered {
                let _ = acks
                    .send(XferAck::Err("slots not marked importing".into()))
                    .await;
                return;
            }

            let src = match NodeName::parse(&task_id.as_str()[..40]) {
                Ok(name) => name,
                Err(_) => {
                    let _ = acks.send(XferAck::Err("bad task id".into())).await;
                    return;
                }
            };

            let (import, sub) = mgr.register_import(&task_id, &src, store_id, &slots);
            let stop = import.lock().unwrap().stop.clone();

            let permit = {
                let sem = mgr.receiver_sem.lock().unwrap().clone();
                sem.acquire_owned().await
            };
            let Ok(_permit) = permit else { return };

            if acks.send(XferAck::Ok).await.is_err() {
                return;
            }

            let ctx = receiver::ReceiverCtx {
                task_id: task_id.clone(),
                info: Arc::clone(&sub),
                store,
                observer: mgr.observer(),
                stop,
            };
            let final_state = receiver::run_receiver(ctx, frames, acks).await;
            if final_state == TaskState::Succ {
                mgr.maybe_finalize_import(&task_id);
            }
        });
    }

    /// Finds or creates the import task and its per-store sub-task.
    fn register_import(
        &self,
        task_id: &TaskId,
        src: &NodeName,
        store_id: u32,
        slots: &SlotBitmap,
    ) -> (Arc<Mutex<ImportTask>>, SharedSubTask) {
        let mut imports = self.imports.lock().unwrap();
        let import = imports
            .entry(task_id.clone())
            .or_insert_with(|| {
                // Expected set: everything announced for this source.
                let expected = {
                    let intents = self.importing_intent.lock().unwrap();
                    let mut all = SlotBitmap::new();
                    for (from, m) in intents.iter() {
                        if from == src {
                            all.union_with(m);
                        }
                    }
                    all
                };
                Arc::new(Mutex::new(ImportTask {
                    src: src.clone(),
                    slots: expected,
                    sub_tasks: Vec::new(),
                    stop: Arc::new(AtomicBool::new(false)),
                    finalized: false,
                }))
            })
            .clone();
        drop(imports);

        let mut task = import.lock().unwrap();
        let existing = task
            .sub_tasks
            .iter()
            .find(|s| s.lock().unwrap().store_id == store_id)
            .cloned();
        let sub = match existing {
            Some(sub) => sub,
            None => {
                let sub = SubTaskInfo::new(store_id, slots.clone());
                task.sub_tasks.push(Arc::clone(&sub));
                sub
            }
        };
        drop(task);
        (import, sub)
    }

    /// Claims the imported slots once every expected store has committed.
    fn maybe_finalize_import(&self, task_id: &TaskId) {
        let Some(import) = self.imports.lock().unwrap().get(task_id).cloned() else {
            return;
        };
        let mut task = import.lock().unwrap();
        if task.finalized {
            return;
        }
        let mut done = SlotBitmap::new();
        for sub in &task.sub_tasks {
            let sub = sub.lock().unwrap();
            if sub.state == TaskState::Succ {
                done.union_with(&sub.slots);
            }
        }
        if done != task.slots {
            return;
        }
        task.finalized = true;
        let slots = task.slots.clone();
        let src = task.src.clone();
        drop(task);

        let mut state = self.state.write().unwrap();
        let src_epoch = state
            .lookup_node(&src)
            .map(|n| n.config_epoch)
            .unwrap_or(0);
        let new_epoch = src_epoch.max(state.myself().config_epoch) + 1;
        state.observe_epoch(new_epoch);
        state.myself_mut().config_epoch = new_epoch;
        let myself = state.myself_name().clone();
        for slot in slots.iter() {
            state.take_slot(&myself, slot);
        }
        drop(state);

        let mut intents = self.importing_intent.lock().unwrap();
        for (_, m) in intents.iter_mut() {
            for slot in slots.iter() {
                m.clear(slot);
            }
        }
        intents.retain(|(_, m)| !m.is_empty());
        drop(intents);

        info!(task = %task_id, epoch = new_epoch, slots = slots.count(), "import finalized");
        self.emit(MigrateEvent::ImportDone {
            task_id: task_id.clone(),
            slots,
        });
    }

    // ---- sender side -----------------------------------------------------

    /// Starts migrating `slots` to `dst`: one sub-task per store holding
    /// any of them. Refuses when an overlapping task exists or finished
    /// more recently than the configured wait.
    pub fn start_migration(
        &self,
        dst: NodeName,
        slots: SlotBitmap,
        now: u64,
    ) -> Result<TaskId, ClusterError> {
        let dst_addr = {
            let state = self.state.read().unwrap();
            for slot in slots.iter() {
                if !state.myself_owns(slot) {
                    return Err(ClusterError::Migrate(format!(
                        "slot {slot} is not owned by this node"
                    )));
                }
            }
            let dst_node = state
                .lookup_node(&dst)
                .ok_or_else(|| ClusterError::UnknownNode(dst.as_str().to_string()))?;
            if !dst_node.is_master() {
                return Err(ClusterError::Migrate("destination is not a master".into()));
            }
            // Transfers ride the cluster bus, not the client port.
            format!("{}:{}", dst_node.ip, dst_node.cport)
        };

        let mut tasks = self.tasks.lock().unwrap();
        let wait = self
            .config
            .lock()
            .unwrap()
            .wait_time_if_exists_migrate_task
            .as_millis() as u64;
        for task in tasks.values() {
            let task = task.lock().unwrap();
            let overlaps = slots.iter().any(|s| task.slots.test(s));
            if !overlaps {
                continue;
            }
            let busy = task.states().iter().any(|s| !s.is_terminal());
            let too_recent = task.finished != 0 && now.saturating_sub(task.finished) < wait;
            if busy || too_recent {
                return Err(ClusterError::Migrate(format!(
                    "an overlapping migrate task exists ({}), retry later",
                    task.id
                )));
            }
        }

        let myself = self.state.read().unwrap().myself_name().clone();
        let seq = self.next_task_seq.fetch_add(1, Ordering::Relaxed);
        let id = TaskId::new(&myself, seq);
        let (stop_tx, _) = watch::channel(false);

        let catalog = *self.stores.catalog();
        let mut sub_tasks = Vec::new();
        for store_id in 0..self.stores.kv_store_count() {
            let store_slots = sender::slots_on_store(&catalog, &slots, store_id);
            if store_slots.is_empty() {
                continue;
            }
            sub_tasks.push(SubTaskInfo::new(store_id, store_slots));
        }
        if sub_tasks.is_empty() {
            return Err(ClusterError::Migrate("no slots to migrate".into()));
        }

        let task = Arc::new(Mutex::new(MigrateTask {
            id: id.clone(),
            dst: dst.clone(),
            slots: slots.clone(),
            sub_tasks: sub_tasks.clone(),
            stop: stop_tx,
            finalized: false,
            created: now,
            finished: 0,
        }));
        tasks.insert(id.clone(), Arc::clone(&task));
        drop(tasks);

        info!(task = %id, dst = %dst, stores = sub_tasks.len(), slots = slots.count(), "migration task created");
        for sub in sub_tasks {
            self.spawn_sender_subtask(id.clone(), Arc::clone(&task), sub, dst_addr.clone());
        }
        Ok(id)
    }

    fn spawn_sender_subtask(
        &self,
        task_id: TaskId,
        task: Arc<Mutex<MigrateTask>>,
        info: SharedSubTask,
        dst_addr: String,
    ) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        let mut stop_rx = task.lock().unwrap().stop.subscribe();
        tokio::spawn(async move {
            loop {
                // Park while stopped; RESTART flips the flag and wakes us.
                if stop_rx.wait_for(|stopped| !*stopped).await.is_err() {
                    return;
                }
                let sem = mgr.sender_sem.lock().unwrap().clone();
                let Ok(permit) = sem.acquire_owned().await else {
                    return;
                };
                if *stop_rx.borrow() {
                    drop(permit);
                    continue;
                }

                let store_id = info.lock().unwrap().store_id;
                let Some(store) = mgr.stores.store(store_id).cloned() else {
                    return;
                };
                let (batch_bytes, timeout, lag, iter) = {
                    let cfg = mgr.config.lock().unwrap();
                    (
                        cfg.snapshot_batch_size_kb * 1024,
                        cfg.network_timeout,
                        cfg.binlog_lag_threshold,
                        cfg.binlog_iter,
                    )
                };

                let conn = match mgr.connector.connect(&dst_addr) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let mut i = info.lock().unwrap();
                        i.state = TaskState::Fail;
                        i.last_error = Some(e.to_string());
                        drop(i);
                        drop(permit);
                        mgr.on_sender_subtask_terminal(&task_id, &task);
                        return;
                    }
                };

                let ctx = sender::SenderCtx {
                    task_id: task_id.clone(),
                    info: Arc::clone(&info),
                    store,
                    store_count: mgr.stores.kv_store_count(),
                    limiter: Arc::clone(&mgr.limiter),
                    batch_max_bytes: batch_bytes,
                    network_timeout: timeout,
                    binlog_lag_threshold: lag,
                    binlog_iter: iter,
                    stop: stop_rx.clone(),
                    observer: mgr.observer(),
                };
                let final_state = sender::run_sender(ctx, conn).await;
                drop(permit);
                match final_state {
                    TaskState::Stopped => {
                        // Parked — by our own stop flag or by a stopped
                        // receiver. Either way RESTART touches the flag,
                        // which is the wake-up we wait for.
                        if stop_rx.changed().await.is_err() {
                            return;
                        }
                        continue;
                    }
                    TaskState::Succ | TaskState::Fail => {
                        mgr.on_sender_subtask_terminal(&task_id, &task);
                        return;
                    }
                    _ => return,
                }
            }
        });
    }

    fn on_sender_subtask_terminal(&self, task_id: &TaskId, task: &Arc<Mutex<MigrateTask>>) {
        let mut t = task.lock().unwrap();
        if t.finalized {
            return;
        }
        if t.any_failed() {
            t.finalized = true;
            t.finished = crate::time::now_ms();
            // Halt siblings; their checkpoints are moot now.
            let _ = t.stop.send(true);
            warn!(task = %task_id, "migration task failed");
            drop(t);
            self.emit(MigrateEvent::TaskFailed {
                task_id: task_id.clone(),
            });
            return;
        }
        if !t.all_succeeded() {
            return;
        }
        t.finalized = true;
        t.finished = crate::time::now_ms();
        let dst = t.dst.clone();
        let slots = t.slots.clone();
        drop(t);

        // Commit: the destination owns the slots at an epoch above both
        // prior claims. Our copy becomes garbage.
        let mut state = self.state.write().unwrap();
        let dst_epoch = state
            .lookup_node(&dst)
            .map(|n| n.config_epoch)
            .unwrap_or(0);
        let new_epoch = state.myself().config_epoch.max(dst_epoch) + 1;
        state.observe_epoch(new_epoch);
        if let Some(node) = state.lookup_node_mut(&dst) {
            node.config_epoch = new_epoch;
        }
        for slot in slots.iter() {
            state.take_slot(&dst, slot);
        }
        drop(state);

        info!(task = %task_id, dst = %dst, epoch = new_epoch, "migration committed");
        self.emit(MigrateEvent::TaskDone {
            task_id: task_id.clone(),
            slots,
        });
    }

    // ---- operator controls ----------------------------------------------

    /// `SETSLOT STOP <task>`: freeze a task. With `receiver_only`, only the
    /// import side is stopped; waiting sender sub-tasks stay queued.
    pub fn stop_task(&self, task_id: &TaskId, receiver_only: bool) -> bool {
        let mut hit = false;
        if !receiver_only {
            if let Some(task) = self.tasks.lock().unwrap().get(task_id) {
                let _ = task.lock().unwrap().stop.send(true);
                hit = true;
            }
        }
        if let Some(import) = self.imports.lock().unwrap().get(task_id) {
            import.lock().unwrap().stop.store(true, Ordering::SeqCst);
            hit = true;
        }
        if hit {
            info!(task = %task_id, receiver_only, "migration task stop requested");
        }
        hit
    }

    pub fn stop_all(&self) {
        for task in self.tasks.lock().unwrap().values() {
            let _ = task.lock().unwrap().stop.send(true);
        }
        for import in self.imports.lock().unwrap().values() {
            import.lock().unwrap().stop.store(true, Ordering::SeqCst);
        }
        info!("all migration tasks stop requested");
    }

    /// `SETSLOT RESTART <task>`: resume a stopped task from its checkpoint.
    /// A receiver-only stop on the sender side is untouched by design; the
    /// operator restarts the sender explicitly.
    pub fn restart_task(&self, task_id: &TaskId) -> bool {
        let mut hit = false;
        if let Some(task) = self.tasks.lock().unwrap().get(task_id) {
            let _ = task.lock().unwrap().stop.send(false);
            hit = true;
        }
        if let Some(import) = self.imports.lock().unwrap().get(task_id) {
            import.lock().unwrap().stop.store(false, Ordering::SeqCst);
            hit = true;
        }
        hit
    }

    pub fn restart_all(&self) {
        for task in self.tasks.lock().unwrap().values() {
            let _ = task.lock().unwrap().stop.send(false);
        }
        for import in self.imports.lock().unwrap().values() {
            import.lock().unwrap().stop.store(false, Ordering::SeqCst);
        }
    }

    // ---- introspection ---------------------------------------------------

    /// Sender sub-tasks still moving (waiting or running).
    pub fn migrating_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .flat_map(|t| t.lock().unwrap().states())
            .filter(|s| *s == TaskState::Start || s.is_running())
            .count()
    }

    /// Receiver sub-tasks still applying.
    pub fn importing_count(&self) -> usize {
        self.imports
            .lock()
            .unwrap()
            .values()
            .flat_map(|t| {
                let t = t.lock().unwrap();
                t.sub_tasks
                    .iter()
                    .map(|s| s.lock().unwrap().state)
                    .collect::<Vec<_>>()
            })
            .filter(|s| *s == TaskState::Start || s.is_running())
            .count()
    }

    /// Sub-task count for one task across both roles. `ignore_waiting`
    /// counts only actively running sub-tasks.
    pub fn task_num(&self, task_id: &TaskId, ignore_waiting: bool) -> usize {
        let counts = |state: TaskState| {
            if ignore_waiting {
                state.is_running()
            } else {
                state == TaskState::Start || state == TaskState::Stopped || state.is_running()
            }
        };
        let mut n = 0;
        if let Some(task) = self.tasks.lock().unwrap().get(task_id) {
            n += task
                .lock()
                .unwrap()
                .states()
                .into_iter()
                .filter(|s| counts(*s))
                .count();
        }
        if let Some(import) = self.imports.lock().unwrap().get(task_id) {
            let import = import.lock().unwrap();
            n += import
                .sub_tasks
                .iter()
                .map(|s| s.lock().unwrap().state)
                .filter(|s| counts(*s))
                .count();
        }
        n
    }

    /// Routing decision for a slot this node owns or is moving.
    pub fn redirect_for(&self, slot: u16) -> MigrateRedirect {
        let tasks = self.tasks.lock().unwrap();
        for task in tasks.values() {
            let task = task.lock().unwrap();
            if !task.slots.test(slot) {
                continue;
            }
            if task.finalized && task.all_succeeded() {
                return MigrateRedirect::Moved {
                    dst: task.dst.clone(),
                };
            }
            // During commit the slot is fenced.
            let committing = task
                .sub_tasks
                .iter()
                .any(|s| {
                    let s = s.lock().unwrap();
                    s.slots.test(slot)
                        && matches!(s.state, TaskState::Commit | TaskState::Succ)
                });
            if committing {
                return MigrateRedirect::Moved {
                    dst: task.dst.clone(),
                };
            }
            if !task.states().iter().all(|s| s.is_terminal()) {
                return MigrateRedirect::Migrating {
                    dst: task.dst.clone(),
                };
            }
        }
        MigrateRedirect::None
    }

    /// Human-readable task table for `CLUSTER SETSLOT INFO`.
    pub fn setslot_info(&self) -> String {
        let mut lines = Vec::new();
        for (id, task) in self.tasks.lock().unwrap().iter() {
            let task = task.lock().unwrap();
            for sub in &task.sub_tasks {
                let sub = sub.lock().unwrap();
                lines.push(format!(
                    "migrating task:{id} store:{} state:{} slots:{} sent:{} bytes:{}{}",
                    sub.store_id,
                    sub.state,
                    sub.slots.to_text(),
                    sub.entries_sent,
                    sub.bytes_sent,
                    sub.last_error
                        .as_ref()
                        .map(|e| format!(" error:{e}"))
                        .unwrap_or_default(),
                ));
            }
        }
        for (id, import) in self.imports.lock().unwrap().iter() {
            let import = import.lock().unwrap();
            for sub in &import.sub_tasks {
                let sub = sub.lock().unwrap();
                lines.push(format!(
                    "importing task:{id} from:{} store:{} state:{} applied:{}",
                    import.src, sub.store_id, sub.state, sub.entries_sent,
                ));
            }
        }
        lines.sort();
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ClusterNode;
    use bytes::Bytes;
    use corvus_store::{encode_key, WriteBatch};
    use std::collections::VecDeque;
    use tokio::time::{sleep, timeout};

    fn test_name(seed: u8) -> NodeName {
        NodeName::parse(&format!("{:040x}", seed as u128)).unwrap()
    }

    fn master(seed: u8, port: u16) -> ClusterNode {
        ClusterNode::new_master(test_name(seed), "127.0.0.1".into(), port, port + 10000)
    }

    /// Cluster state for a node that knows itself and one peer.
    fn state_pair(myself: u8, peer: u8) -> Arc<RwLock<ClusterState>> {
        let mut st = ClusterState::new(master(myself, 16000 + myself as u16));
        st.add_node(master(peer, 16000 + peer as u16));
        Arc::new(RwLock::new(st))
    }

    /// Connector that wires straight into a destination manager.
    struct ChannelConnector {
        dst: Arc<MigrateManager>,
    }

    impl Connector for ChannelConnector {
        fn connect(&self, _addr: &str) -> Result<XferConn, ClusterError> {
            let (frame_tx, frame_rx) = mpsc::channel(16);
            let (ack_tx, ack_rx) = mpsc::channel(16);
            self.dst.accept(frame_rx, ack_tx);
            Ok(XferConn {
                tx: frame_tx,
                rx: ack_rx,
            })
        }
    }

    /// Connector whose server ends are handed to the test to drive by hand.
    #[derive(Default)]
    struct ManualConnector {
        accepted: Mutex<VecDeque<(mpsc::Receiver<XferFrame>, mpsc::Sender<XferAck>)>>,
    }

    impl ManualConnector {
        fn take(&self) -> Option<(mpsc::Receiver<XferFrame>, mpsc::Sender<XferAck>)> {
            self.accepted.lock().unwrap().pop_front()
        }
    }

    impl Connector for ManualConnector {
        fn connect(&self, _addr: &str) -> Result<XferConn, ClusterError> {
            let (frame_tx, frame_rx) = mpsc::channel(16);
            let (ack_tx, ack_rx) = mpsc::channel(16);
            self.accepted.lock().unwrap().push_back((frame_rx, ack_tx));
            Ok(XferConn {
                tx: frame_tx,
                rx: ack_rx,
            })
        }
    }

    struct NullConnector;
    impl Connector for NullConnector {
        fn connect(&self, _addr: &str) -> Result<XferConn, ClusterError> {
            Err(ClusterError::Network("no outbound in this test".into()))
        }
    }

    fn manager(
        state: Arc<RwLock<ClusterState>>,
        stores: Stores,
        connector: Arc<dyn Connector>,
    ) -> (Arc<MigrateManager>, mpsc::Receiver<MigrateEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let mgr = MigrateManager::new(state, stores, MigrateConfig::default(), connector, tx);
        (mgr, rx)
    }

    fn put_keys(stores: &Stores, slot: u16, prefix: &str, n: usize) {
        let store = stores.store_for_slot(slot);
        let mut batch = WriteBatch::new();
        for i in 0..n {
            batch.put(
                encode_key(slot, format!("{prefix}-{i}").as_bytes()),
                Bytes::from(format!("value-{i}")),
            );
        }
        store.write(batch).unwrap();
    }

    async fn wait_done(mgr: &Arc<MigrateManager>) {
        timeout(Duration::from_secs(10), async {
            while mgr.migrating_count() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("migration did not finish");
    }

    #[tokio::test]
    async fn migration_moves_all_keys_and_ownership() {
        let slots_vec = [4310u16, 5970, 6000];
        let src_state = state_pair(1, 2);
        let dst_state = state_pair(2, 1);
        {
            let mut st = src_state.write().unwrap();
            let me = st.myself_name().clone();
            st.myself_mut().config_epoch = 3;
            for s in slots_vec {
                st.take_slot(&me, s);
            }
        }
        let src_stores = Stores::in_memory(3);
        let dst_stores = Stores::in_memory(3);
        for s in slots_vec {
            put_keys(&src_stores, s, "seed", 20);
        }

        let (dst_mgr, mut dst_events) =
            manager(Arc::clone(&dst_state), dst_stores.clone(), Arc::new(NullConnector));
        let bitmap: SlotBitmap = slots_vec.into_iter().collect();
        dst_mgr.prepare_import(test_name(1), bitmap.clone()).unwrap();
        assert!(dst_mgr.is_importing(4310));

        let (src_mgr, mut src_events) = manager(
            Arc::clone(&src_state),
            src_stores.clone(),
            Arc::new(ChannelConnector {
                dst: Arc::clone(&dst_mgr),
            }),
        );

        let id = src_mgr
            .start_migration(test_name(2), bitmap.clone(), 1_000)
            .unwrap();
        // Concurrent writes land in the binlog before any sub-task has had
        // a chance to run (current-thread runtime, no await since start).
        for s in slots_vec {
            put_keys(&src_stores, s, "live", 10);
        }

        wait_done(&src_mgr).await;

        // Conservation: every key, seed and live, is on the destination.
        let mut total = 0;
        for s in slots_vec {
            assert_eq!(src_stores.count_keys_in_slot(s).unwrap(), 30);
            total += dst_stores.count_keys_in_slot(s).unwrap();
        }
        assert_eq!(total, 90);

        // Sender committed ownership to dst with a bumped epoch.
        let st = src_state.read().unwrap();
        for s in slots_vec {
            assert_eq!(st.slot_owner_name(s), Some(&test_name(2)));
        }
        assert!(st.lookup_node(&test_name(2)).unwrap().config_epoch > 3);
        drop(st);

        // Receiver claimed the slots in its own view.
        let st = dst_state.read().unwrap();
        for s in slots_vec {
            assert!(st.myself_owns(s));
        }
        drop(st);
        assert!(!dst_mgr.is_importing(4310));

        // Events: sender reports done (GC input), receiver reports import.
        let ev = timeout(Duration::from_secs(1), src_events.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            MigrateEvent::TaskDone { task_id, slots } => {
                assert_eq!(task_id, id);
                assert_eq!(slots, bitmap);
            }
            other => panic!("expected TaskDone, got {other:?}"),
        }
        let ev = timeout(Duration::from_secs(1), dst_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, MigrateEvent::ImportDone { .. }));

        assert_eq!(src_mgr.migrating_count(), 0);
        assert_eq!(dst_mgr.importing_count(), 0);
        assert_eq!(src_mgr.task_num(&id, false), 0);
    }

    #[tokio::test]
    async fn store_count_mismatch_fails_before_data_moves() {
        let src_state = state_pair(1, 2);
        let dst_state = state_pair(2, 1);
        {
            let mut st = src_state.write().unwrap();
            let me = st.myself_name().clone();
            st.take_slot(&me, 100);
        }
        let src_stores = Stores::in_memory(3);
        let dst_stores = Stores::in_memory(2); // mismatch
        put_keys(&src_stores, 100, "seed", 5);

        let (dst_mgr, _dst_events) =
            manager(dst_state, dst_stores.clone(), Arc::new(NullConnector));
        let bitmap: SlotBitmap = [100u16].into_iter().collect();
        dst_mgr.prepare_import(test_name(1), bitmap.clone()).unwrap();

        let (src_mgr, mut src_events) = manager(
            Arc::clone(&src_state),
            src_stores.clone(),
            Arc::new(ChannelConnector { dst: dst_mgr }),
        );
        src_mgr
            .start_migration(test_name(2), bitmap, 1_000)
            .unwrap();

        let ev = timeout(Duration::from_secs(5), src_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, MigrateEvent::TaskFailed { .. }));

        // Nothing moved; ownership unchanged.
        assert_eq!(dst_stores.count_keys_in_slot(100).unwrap(), 0);
        assert!(src_state.read().unwrap().myself_owns(100));
    }

    #[tokio::test]
    async fn overlapping_task_is_gated() {
        let src_state = state_pair(1, 2);
        {
            let mut st = src_state.write().unwrap();
            let me = st.myself_name().clone();
            for s in [10u16, 11, 12] {
                st.take_slot(&me, s);
            }
        }
        let stores = Stores::in_memory(2);
        let (mgr, _events) = manager(src_state, stores, Arc::new(ManualConnector::default()));

        let first: SlotBitmap = [10u16, 11].into_iter().collect();
        mgr.start_migration(test_name(2), first, 1_000).unwrap();

        let overlap: SlotBitmap = [11u16, 12].into_iter().collect();
        let err = mgr
            .start_migration(test_name(2), overlap, 1_001)
            .unwrap_err();
        assert!(err.to_string().contains("overlapping"));

        // Disjoint slots are fine.
        let disjoint: SlotBitmap = [12u16].into_iter().collect();
        mgr.start_migration(test_name(2), disjoint, 1_002).unwrap();
    }

    #[tokio::test]
    async fn unowned_slot_refused() {
        let src_state = state_pair(1, 2);
        let (mgr, _events) = manager(
            src_state,
            Stores::in_memory(1),
            Arc::new(NullConnector),
        );
        let bitmap: SlotBitmap = [5u16].into_iter().collect();
        let err = mgr.start_migration(test_name(2), bitmap, 1_000).unwrap_err();
        assert!(err.to_string().contains("not owned"));
    }

    #[tokio::test]
    async fn import_of_owned_slot_refused() {
        let dst_state = state_pair(2, 1);
        {
            let mut st = dst_state.write().unwrap();
            let me = st.myself_name().clone();
            st.take_slot(&me, 9);
        }
        let (mgr, _events) = manager(dst_state, Stores::in_memory(1), Arc::new(NullConnector));
        let bitmap: SlotBitmap = [9u16].into_iter().collect();
        assert!(mgr.prepare_import(test_name(1), bitmap).is_err());
    }

    /// Drains one manual connection up to (not including) the commit ack.
    /// Returns (frames_receiver, ack_sender, batch_count) at the Commit frame.
    async fn drain_until_commit(
        conn: &mut (mpsc::Receiver<XferFrame>, mpsc::Sender<XferAck>),
    ) -> u32 {
        let mut batches = 0;
        loop {
            let frame = timeout(Duration::from_secs(5), conn.0.recv())
                .await
                .expect("frame timeout")
                .expect("stream closed");
            match frame {
                XferFrame::Hello { .. } => {
                    conn.1.send(XferAck::Ok).await.unwrap();
                }
                XferFrame::Batch { .. } => {
                    batches += 1;
                    conn.1.send(XferAck::Ok).await.unwrap();
                }
                XferFrame::Binlog { .. } => {
                    conn.1.send(XferAck::Ok).await.unwrap();
                }
                XferFrame::Commit => return batches,
            }
        }
    }

    #[tokio::test]
    async fn stop_checkpoints_and_restart_resumes() {
        let src_state = state_pair(1, 2);
        {
            let mut st = src_state.write().unwrap();
            let me = st.myself_name().clone();
            st.take_slot(&me, 100);
        }
        let stores = Stores::in_memory(1);
        put_keys(&stores, 100, "seed", 8);

        let connector = Arc::new(ManualConnector::default());
        let (mgr, _events) = manager(
            Arc::clone(&src_state),
            stores.clone(),
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        let bitmap: SlotBitmap = [100u16].into_iter().collect();
        let id = mgr.start_migration(test_name(2), bitmap, 1_000).unwrap();

        // Let the sub-task connect.
        sleep(Duration::from_millis(20)).await;
        let mut conn = connector.take().expect("sender connected");

        // Hello, then the first (only) snapshot batch arrives.
        match timeout(Duration::from_secs(2), conn.0.recv()).await.unwrap() {
            Some(XferFrame::Hello { store_count, .. }) => {
                assert_eq!(store_count, 1);
                conn.1.send(XferAck::Ok).await.unwrap();
            }
            other => panic!("expected hello, got {other:?}"),
        }
        let batch = timeout(Duration::from_secs(2), conn.0.recv()).await.unwrap();
        assert!(matches!(batch, Some(XferFrame::Batch { .. })));

        // Stop lands before the ack: the sender finishes this batch and
        // freezes at the next boundary.
        assert!(mgr.stop_task(&id, false));
        conn.1.send(XferAck::Ok).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while mgr.task_num(&id, true) != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sender did not stop");
        // The stopped sub-task is still tracked for restart.
        assert_eq!(mgr.task_num(&id, false), 1);
        // Mid-migration the slot routes as migrating, not moved.
        assert_eq!(
            mgr.redirect_for(100),
            MigrateRedirect::Migrating { dst: test_name(2) }
        );

        // Restart resumes from the checkpoint: the slot is already done,
        // so no snapshot batch is re-sent.
        assert!(mgr.restart_task(&id));
        sleep(Duration::from_millis(20)).await;
        let mut conn2 = connector.take().expect("sender reconnected");
        let resent_batches = drain_until_commit(&mut conn2).await;
        assert_eq!(resent_batches, 0, "checkpointed slot was re-sent");
        conn2.1.send(XferAck::Ok).await.unwrap(); // commit ack

        timeout(Duration::from_secs(5), async {
            while mgr.migrating_count() != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("restart did not complete");

        // Committed: ownership moved, slot fenced.
        assert_eq!(
            src_state.read().unwrap().slot_owner_name(100),
            Some(&test_name(2))
        );
        assert_eq!(
            mgr.redirect_for(100),
            MigrateRedirect::Moved { dst: test_name(2) }
        );
    }

    #[tokio::test]
    async fn receiver_only_stop_leaves_waiting_sender_tasks() {
        let src_state = state_pair(1, 2);
        {
            let mut st = src_state.write().unwrap();
            let me = st.myself_name().clone();
            // Slots on two different stores → two sub-tasks.
            st.take_slot(&me, 0);
            st.take_slot(&me, 1);
        }
        let stores = Stores::in_memory(2);
        put_keys(&stores, 0, "a", 3);
        put_keys(&stores, 1, "b", 3);

        let connector = Arc::new(ManualConnector::default());
        let (mgr, _events) = manager(
            src_state,
            stores,
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        mgr.set_sender_threads(1);
        let bitmap: SlotBitmap = [0u16, 1].into_iter().collect();
        let id = mgr.start_migration(test_name(2), bitmap, 1_000).unwrap();

        sleep(Duration::from_millis(20)).await;
        let mut conn = connector.take().expect("first sub-task connected");
        assert!(connector.take().is_none(), "second sub-task must be waiting");

        // Drive the first sub-task to its commit, withholding the last ack
        // so it keeps holding the pool slot.
        drain_until_commit(&mut conn).await;

        // One running, one waiting.
        assert_eq!(mgr.task_num(&id, true), 1);
        assert_eq!(mgr.task_num(&id, false), 2);

        // Receiver-only stop: a no-op on this (sender) side — the waiting
        // sub-task must not be released or stopped.
        mgr.stop_task(&id, true);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.task_num(&id, false), 2);
        assert_eq!(mgr.task_num(&id, true), 1);

        // Full stop freezes; the commit still completes at its boundary.
        mgr.stop_task(&id, false);
        conn.1.send(XferAck::Ok).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while mgr.task_num(&id, true) != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("running sub-task did not settle");

        // Restart releases the parked second sub-task.
        mgr.restart_task(&id);
        sleep(Duration::from_millis(20)).await;
        let mut conn2 = connector.take().expect("second sub-task connected");
        drain_until_commit(&mut conn2).await;
        conn2.1.send(XferAck::Ok).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while mgr.migrating_count() != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not finish after restart");
    }
}
