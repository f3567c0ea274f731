//! Receiver side of one per-store transfer.
//!
//! The manager validates the Hello frame (store-count handshake, importing
//! intent) before this runner starts. From then on every Batch/Binlog
//! frame is decoded and applied as one atomic write batch, then acked;
//! Commit flips the sub-task to Succ and acks the two-phase finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corvus_store::{KvStore, WriteBatch};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::migrate::batch::{decode_entries, XferAck, XferFrame, OP_DEL};
use crate::migrate::task::{SharedSubTask, TaskId, TaskState};
use crate::migrate::{MigrateObserver, RECEIVER_STOPPED};

pub(crate) struct ReceiverCtx {
    pub task_id: TaskId,
    pub info: SharedSubTask,
    pub store: Arc<dyn KvStore>,
    pub observer: Option<Arc<dyn MigrateObserver>>,
    /// Receiver-only stop: set by `SETSLOT STOP <task> receiverOnly`.
    pub stop: Arc<AtomicBool>,
}

impl ReceiverCtx {
    fn fail(&self, why: &str) -> TaskState {
        warn!(task = %self.task_id, store = self.store.store_id(), why, "receiver sub-task failed");
        let mut info = self.info.lock().unwrap();
        info.state = TaskState::Fail;
        info.last_error = Some(why.to_string());
        TaskState::Fail
    }
}

/// Applies one payload of entries atomically. Returns the entry count.
fn apply_payload(ctx: &ReceiverCtx, payload: &[u8]) -> Result<u64, String> {
    let entries = decode_entries(payload).map_err(|e| e.to_string())?;
    let count = entries.len() as u64;
    let mut batch = WriteBatch::new();
    for entry in entries {
        if entry.op == OP_DEL {
            batch.del(entry.key);
        } else {
            batch.put(entry.key, entry.value);
        }
    }
    ctx.store.write(batch).map_err(|e| e.to_string())?;
    Ok(count)
}

/// Consumes transfer frames until Commit, stream end, or failure.
pub(crate) async fn run_receiver(
    ctx: ReceiverCtx,
    mut frames: mpsc::Receiver<XferFrame>,
    acks: mpsc::Sender<XferAck>,
) -> TaskState {
    ctx.info.lock().unwrap().state = TaskState::Snapshot;

    while let Some(frame) = frames.recv().await {
        if ctx.stop.load(Ordering::SeqCst) {
            info!(task = %ctx.task_id, "receiver stopping at batch boundary");
            ctx.info.lock().unwrap().state = TaskState::Stopped;
            let _ = acks.send(XferAck::Err(RECEIVER_STOPPED.into())).await;
            return TaskState::Stopped;
        }
        match frame {
            XferFrame::Hello { .. } => {
                let _ = acks.send(XferAck::Err("unexpected second hello".into())).await;
                return ctx.fail("unexpected second hello");
            }
            XferFrame::Batch { payload, .. } => match apply_payload(&ctx, &payload) {
                Ok(count) => {
                    {
                        let mut info = ctx.info.lock().unwrap();
                        info.entries_sent += count;
                        info.bytes_sent += payload.len() as u64;
                    }
                    if let Some(obs) = &ctx.observer {
                        obs.on_batch_applied(&ctx.task_id, count);
                    }
                    if acks.send(XferAck::Ok).await.is_err() {
                        return ctx.fail("ack stream closed");
                    }
                }
                Err(why) => {
                    let _ = acks.send(XferAck::Err(why.clone())).await;
                    return ctx.fail(&why);
                }
            },
            XferFrame::Binlog { payload } => {
                ctx.info.lock().unwrap().state = TaskState::Binlog;
                match apply_payload(&ctx, &payload) {
                    Ok(count) => {
                        {
                            let mut info = ctx.info.lock().unwrap();
                            info.entries_sent += count;
                            info.bytes_sent += payload.len() as u64;
                        }
                        if let Some(obs) = &ctx.observer {
                            obs.on_batch_applied(&ctx.task_id, count);
                        }
                        if acks.send(XferAck::Ok).await.is_err() {
                            return ctx.fail("ack stream closed");
                        }
                    }
                    Err(why) => {
                        let _ = acks.send(XferAck::Err(why.clone())).await;
                        return ctx.fail(&why);
                    }
                }
            }
            XferFrame::Commit => {
                ctx.info.lock().unwrap().state = TaskState::Succ;
                let _ = acks.send(XferAck::Ok).await;
                debug!(task = %ctx.task_id, store = ctx.store.store_id(), "receiver sub-task committed");
                return TaskState::Succ;
            }
        }
    }

    // Sender went away mid-transfer: keep the data (a restart resumes and
    // re-sends idempotently) but surface the interruption.
    let state = {
        let mut info = ctx.info.lock().unwrap();
        if info.state.is_terminal() {
            info.state
        } else {
            info.state = TaskState::Stopped;
            TaskState::Stopped
        }
    };
    state
}
