//! Post-migration garbage collection.
//!
//! After a slot's ownership leaves this node — migration out, a lost epoch
//! dispute, or an explicit drop — its keys are still on disk. The GC
//! manager aggregates such slots into a pending bitmap and reclaims them
//! with per-store range deletes, pacing itself between ranges so
//! foreground serving never stalls behind a giant deletion.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use corvus_store::{slot_range_bounds, Catalog, Stores};
use tracing::{debug, info, warn};

use crate::slots::SlotBitmap;
use crate::topology::ClusterState;

/// One contiguous deletion unit: consecutive slots within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRangeTask {
    pub store_id: u32,
    pub slot_start: u16,
    pub slot_end: u16,
}

/// GC behavior knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Pause between range deletes.
    pub wait_time_after_migrate: Duration,
    /// Also ask the engine to drop whole files in the range.
    pub delete_files_in_range: bool,
    /// Compact each range after deletion to reclaim space promptly.
    pub compact_after_delete: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            wait_time_after_migrate: Duration::from_secs(1),
            delete_files_in_range: true,
            compact_after_delete: false,
        }
    }
}

/// Splits a deletion bitmap into per-store contiguous range tasks.
///
/// Two slots can only share a task when they are consecutive *and* live on
/// the same store, so with more than one store most tasks cover a single
/// slot. The union of all generated tasks, intersected with each store's
/// chunks, is exactly the input bitmap.
pub fn generate_delete_range_tasks(catalog: &Catalog, slots: &SlotBitmap) -> Vec<DeleteRangeTask> {
    let mut tasks = Vec::new();
    let mut run: Option<DeleteRangeTask> = None;
    for slot in slots.iter() {
        let store_id = catalog.store_for_chunk(slot);
        match &mut run {
            Some(task) if task.store_id == store_id && task.slot_end + 1 == slot => {
                task.slot_end = slot;
            }
            _ => {
                if let Some(task) = run.take() {
                    tasks.push(task);
                }
                run = Some(DeleteRangeTask {
                    store_id,
                    slot_start: slot,
                    slot_end: slot,
                });
            }
        }
    }
    if let Some(task) = run {
        tasks.push(task);
    }
    tasks
}

/// Background reclaimer of migrated-away slot data.
pub struct GcManager {
    state: Arc<RwLock<ClusterState>>,
    stores: Stores,
    config: GcConfig,
    deleting: Mutex<SlotBitmap>,
}

impl GcManager {
    pub fn new(state: Arc<RwLock<ClusterState>>, stores: Stores, config: GcConfig) -> Self {
        Self {
            state,
            stores,
            config,
            deleting: Mutex::new(SlotBitmap::new()),
        }
    }

    /// Queues slots for deletion. Slots this node still owns are refused:
    /// GC must never touch live data.
    pub fn enqueue(&self, slots: &SlotBitmap) {
        let state = self.state.read().unwrap();
        let mut deleting = self.deleting.lock().unwrap();
        let mut accepted = 0u32;
        for slot in slots.iter() {
            if state.myself_owns(slot) {
                warn!(slot, "refusing GC of a slot still owned");
                continue;
            }
            deleting.set(slot);
            accepted += 1;
        }
        if accepted > 0 {
            info!(slots = accepted, "queued slots for GC");
        }
    }

    /// True while any queued range covering `slot` has not finished.
    pub fn is_deleting_slot(&self, slot: u16) -> bool {
        self.deleting.lock().unwrap().test(slot)
    }

    pub fn pending_count(&self) -> u32 {
        self.deleting.lock().unwrap().count()
    }

    /// Snapshot of the pending set. Slots stay marked as deleting until
    /// their range completes; the sweep clears them one task at a time.
    fn pending_snapshot(&self) -> SlotBitmap {
        self.deleting.lock().unwrap().clone()
    }

    fn finish_task(&self, task: &DeleteRangeTask) {
        let mut deleting = self.deleting.lock().unwrap();
        for slot in task.slot_start..=task.slot_end {
            deleting.clear(slot);
        }
    }

    /// Deletes everything currently queued, pacing between ranges.
    /// Returns the number of completed range tasks.
    pub async fn sweep(&self) -> usize {
        let pending = self.pending_snapshot();
        if pending.is_empty() {
            return 0;
        }
        let tasks = generate_delete_range_tasks(self.stores.catalog(), &pending);
        info!(tasks = tasks.len(), slots = pending.count(), "GC sweep starting");
        let mut done = 0;
        for task in &tasks {
            match self.delete_range_task(task) {
                Ok(()) => {
                    self.finish_task(task);
                    done += 1;
                }
                Err(e) => {
                    warn!(
                        store = task.store_id,
                        start = task.slot_start,
                        end = task.slot_end,
                        error = %e,
                        "GC range delete failed, will retry next sweep"
                    );
                }
            }
            tokio::time::sleep(self.config.wait_time_after_migrate).await;
        }
        done
    }

    /// One range delete against the owning store, with the optional
    /// file-drop and compaction follow-ups.
    fn delete_range_task(&self, task: &DeleteRangeTask) -> Result<(), corvus_store::StoreError> {
        let store = self
            .stores
            .store(task.store_id)
            .ok_or(corvus_store::StoreError::Busy(task.store_id))?;
        let (begin, end) = slot_range_bounds(task.slot_start, task.slot_end);
        debug!(
            store = task.store_id,
            start = task.slot_start,
            end = task.slot_end,
            "GC deleting range"
        );
        store.delete_range(&begin, &end)?;
        if self.config.delete_files_in_range {
            store.delete_files_in_range(&begin, &end)?;
        }
        if self.config.compact_after_delete {
            store.compact_range(&begin, &end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ClusterNode, NodeName};
    use bytes::Bytes;
    use corvus_store::{encode_key, WriteBatch};

    fn test_name(seed: u8) -> NodeName {
        NodeName::parse(&format!("{:040x}", seed as u128)).unwrap()
    }

    fn empty_state() -> Arc<RwLock<ClusterState>> {
        Arc::new(RwLock::new(ClusterState::new(ClusterNode::new_master(
            test_name(1),
            "127.0.0.1".into(),
            16000,
            26000,
        ))))
    }

    fn fill(stores: &Stores, slot: u16, keys: &[&str]) {
        let store = stores.store_for_slot(slot);
        let mut batch = WriteBatch::new();
        for k in keys {
            batch.put(encode_key(slot, k.as_bytes()), Bytes::from("v"));
        }
        store.write(batch).unwrap();
    }

    #[test]
    fn range_tasks_split_by_store() {
        let catalog = Catalog::new(2);
        // Slots 4,5,6: stores 0,1,0 — no coalescing possible across stores.
        let slots: SlotBitmap = [4u16, 5, 6].into_iter().collect();
        let tasks = generate_delete_range_tasks(&catalog, &slots);
        assert_eq!(
            tasks,
            vec![
                DeleteRangeTask { store_id: 0, slot_start: 4, slot_end: 4 },
                DeleteRangeTask { store_id: 1, slot_start: 5, slot_end: 5 },
                DeleteRangeTask { store_id: 0, slot_start: 6, slot_end: 6 },
            ]
        );
    }

    #[test]
    fn range_tasks_coalesce_single_store() {
        let catalog = Catalog::new(1);
        let slots: SlotBitmap = [10u16, 11, 12, 20, 21, 100].into_iter().collect();
        let tasks = generate_delete_range_tasks(&catalog, &slots);
        assert_eq!(
            tasks,
            vec![
                DeleteRangeTask { store_id: 0, slot_start: 10, slot_end: 12 },
                DeleteRangeTask { store_id: 0, slot_start: 20, slot_end: 21 },
                DeleteRangeTask { store_id: 0, slot_start: 100, slot_end: 100 },
            ]
        );
    }

    #[test]
    fn range_tasks_cover_input_exactly() {
        let catalog = Catalog::new(10);
        let slots: SlotBitmap = [0u16, 1, 9, 10, 11, 4310, 4311, 16383].into_iter().collect();
        let tasks = generate_delete_range_tasks(&catalog, &slots);

        let mut covered = SlotBitmap::new();
        for task in &tasks {
            for slot in task.slot_start..=task.slot_end {
                assert_eq!(catalog.store_for_chunk(slot), task.store_id);
                assert!(!covered.test(slot), "slot {slot} covered twice");
                covered.set(slot);
            }
        }
        assert_eq!(covered, slots);
    }

    #[tokio::test]
    async fn sweep_deletes_only_queued_slots() {
        let stores = Stores::in_memory(2);
        // Keys in slots 0 and 16381 must survive; 5 and 6 are reclaimed.
        fill(&stores, 0, &["keep-a", "keep-b"]);
        fill(&stores, 16381, &["keep-c"]);
        fill(&stores, 5, &["gone-a"]);
        fill(&stores, 6, &["gone-b", "gone-c"]);

        let gc = GcManager::new(
            empty_state(),
            stores.clone(),
            GcConfig {
                wait_time_after_migrate: Duration::from_millis(1),
                ..GcConfig::default()
            },
        );
        let doomed: SlotBitmap = [5u16, 6].into_iter().collect();
        gc.enqueue(&doomed);
        assert!(gc.is_deleting_slot(5));
        assert!(!gc.is_deleting_slot(0));

        let done = gc.sweep().await;
        assert_eq!(done, 2); // two stores, one range each

        assert_eq!(stores.count_keys_in_slot(5).unwrap(), 0);
        assert_eq!(stores.count_keys_in_slot(6).unwrap(), 0);
        assert_eq!(stores.count_keys_in_slot(0).unwrap(), 2);
        assert_eq!(stores.count_keys_in_slot(16381).unwrap(), 1);
        assert!(!gc.is_deleting_slot(5));
        assert_eq!(gc.pending_count(), 0);
    }

    #[tokio::test]
    async fn owned_slots_refused() {
        let state = empty_state();
        {
            let mut st = state.write().unwrap();
            let me = st.myself_name().clone();
            st.take_slot(&me, 7);
        }
        let stores = Stores::in_memory(1);
        fill(&stores, 7, &["live"]);
        let gc = GcManager::new(
            state,
            stores.clone(),
            GcConfig {
                wait_time_after_migrate: Duration::from_millis(1),
                ..GcConfig::default()
            },
        );
        let bitmap: SlotBitmap = [7u16].into_iter().collect();
        gc.enqueue(&bitmap);
        assert!(!gc.is_deleting_slot(7));
        gc.sweep().await;
        assert_eq!(stores.count_keys_in_slot(7).unwrap(), 1);
    }
}
