//! Sender side of one per-store transfer.
//!
//! Pipeline: stream a point-in-time snapshot of every migrating slot in
//! batches, then tail the binlog from the snapshot position until the lag
//! closes, then commit. The stop signal is honored only at batch
//! boundaries so the receiver never sees a torn batch; the checkpoint
//! (slots done + binlog position) makes RESTART resume instead of redo.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corvus_store::{BinlogOp, KvStore};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::migrate::batch::{MigrateBatch, XferAck, XferFrame, OP_DEL, OP_PUT};
use crate::migrate::task::{SharedSubTask, TaskId, TaskState};
use crate::migrate::MigrateObserver;
use crate::ratelimit::RateLimiter;
use crate::slots::SlotBitmap;

/// A connected transfer stream: frames out, acks back.
pub struct XferConn {
    pub tx: mpsc::Sender<XferFrame>,
    pub rx: mpsc::Receiver<XferAck>,
}

/// Everything a sender sub-task needs to run.
pub(crate) struct SenderCtx {
    pub task_id: TaskId,
    pub info: SharedSubTask,
    pub store: Arc<dyn KvStore>,
    pub store_count: u32,
    pub limiter: Arc<RateLimiter>,
    pub batch_max_bytes: usize,
    pub network_timeout: Duration,
    pub binlog_lag_threshold: u64,
    pub binlog_iter: usize,
    pub stop: watch::Receiver<bool>,
    pub observer: Option<Arc<dyn MigrateObserver>>,
}

impl SenderCtx {
    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn set_state(&self, state: TaskState) {
        self.info.lock().unwrap().state = state;
    }

    /// A receiver that stopped by operator request parks us in Stopped so
    /// the checkpoint survives; everything else is a hard failure.
    fn fail(&self, why: &str) -> TaskState {
        if why == crate::migrate::RECEIVER_STOPPED {
            info!(task = %self.task_id, store = self.store.store_id(), "sender parked: receiver stopped");
            self.info.lock().unwrap().state = TaskState::Stopped;
            return TaskState::Stopped;
        }
        warn!(task = %self.task_id, store = self.store.store_id(), why, "sender sub-task failed");
        let mut info = self.info.lock().unwrap();
        info.state = TaskState::Fail;
        info.last_error = Some(why.to_string());
        TaskState::Fail
    }
}

async fn send_and_ack(ctx: &SenderCtx, conn: &mut XferConn, frame: XferFrame) -> Result<(), String> {
    if conn.tx.send(frame).await.is_err() {
        return Err("transfer stream closed".into());
    }
    match tokio::time::timeout(ctx.network_timeout, conn.rx.recv()).await {
        Err(_) => Err("ack timeout".into()),
        Ok(None) => Err("transfer stream closed".into()),
        Ok(Some(XferAck::Err(msg))) => Err(msg),
        Ok(Some(XferAck::Ok)) => Ok(()),
    }
}

/// Runs one per-store transfer to completion, stop, or failure.
/// Returns the final state (already written to the shared info).
pub(crate) async fn run_sender(ctx: SenderCtx, mut conn: XferConn) -> TaskState {
    let (slots, slots_done, resumed_pos) = {
        let info = ctx.info.lock().unwrap();
        (info.slots.clone(), info.slots_done.clone(), info.binlog_pos)
    };

    // Handshake: the receiver refuses mismatched store topologies before
    // any data moves.
    let hello = XferFrame::Hello {
        task_id: ctx.task_id.as_str().to_string(),
        store_id: ctx.store.store_id(),
        store_count: ctx.store_count,
        slots: slots.clone(),
    };
    if let Err(why) = send_and_ack(&ctx, &mut conn, hello).await {
        return ctx.fail(&why);
    }

    // ---- snapshot phase --------------------------------------------------
    ctx.set_state(TaskState::Snapshot);
    let snapshot_pos = if resumed_pos != 0 {
        resumed_pos
    } else {
        let pos = ctx.store.snapshot().binlog_pos();
        ctx.info.lock().unwrap().binlog_pos = pos;
        pos
    };

    let todo: Vec<u16> = slots.iter().filter(|s| !slots_done.test(*s)).collect();
    let mut batch = MigrateBatch::new(ctx.batch_max_bytes);
    let mut seq = 0u64;
    for slot in todo {
        if ctx.stopped() {
            ctx.set_state(TaskState::Stopped);
            info!(task = %ctx.task_id, slot, "sender stopped at snapshot boundary");
            return TaskState::Stopped;
        }
        // Collect the slot under the snapshot, then ship with the batch
        // buffer; awaits never hold the scan iterator.
        let entries: Vec<(Bytes, Bytes)> = {
            let snap = ctx.store.snapshot();
            let (begin, end) = corvus_store::slot_range_bounds(slot, slot);
            snap.scan_range(&begin, &end).collect()
        };
        for (key, value) in entries {
            batch.add(OP_PUT, &key, &value);
            if batch.is_full() {
                if let Err(why) = flush_batch(&ctx, &mut conn, &mut batch, &mut seq).await {
                    return ctx.fail(&why);
                }
            }
        }
        // Flush at the slot boundary so the checkpoint is honest.
        if !batch.is_empty() {
            if let Err(why) = flush_batch(&ctx, &mut conn, &mut batch, &mut seq).await {
                return ctx.fail(&why);
            }
        }
        ctx.info.lock().unwrap().slots_done.set(slot);
    }

    // ---- binlog phase ----------------------------------------------------
    ctx.set_state(TaskState::Binlog);
    let mut pos = snapshot_pos.max(ctx.info.lock().unwrap().binlog_pos);
    loop {
        if ctx.stopped() {
            ctx.info.lock().unwrap().binlog_pos = pos;
            ctx.set_state(TaskState::Stopped);
            info!(task = %ctx.task_id, pos, "sender stopped at binlog boundary");
            return TaskState::Stopped;
        }
        let raw = match ctx.store.binlog_since(pos, ctx.binlog_iter) {
            Ok(raw) => raw,
            Err(e) => return ctx.fail(&format!("binlog read: {e}")),
        };
        if raw.is_empty() {
            break;
        }
        pos = raw.last().map(|e| e.id).unwrap_or(pos);
        let relevant: Vec<_> = raw
            .iter()
            .filter(|e| slots.test(e.chunk_id))
            .collect();
        if !relevant.is_empty() {
            let mut log_batch = MigrateBatch::new(ctx.batch_max_bytes);
            for entry in &relevant {
                let op = match entry.op {
                    BinlogOp::Put => OP_PUT,
                    BinlogOp::Del => OP_DEL,
                };
                log_batch.add(op, &entry.key, &entry.value);
            }
            let (payload, count) = log_batch.take();
            ctx.limiter.throttle(payload.len() as u64).await;
            let bytes = payload.len() as u64;
            if let Err(why) = send_and_ack(&ctx, &mut conn, XferFrame::Binlog { payload }).await {
                return ctx.fail(&why);
            }
            let mut info = ctx.info.lock().unwrap();
            info.bytes_sent += bytes;
            info.entries_sent += count as u64;
            info.binlog_pos = pos;
            drop(info);
            if let Some(obs) = &ctx.observer {
                obs.on_batch_sent(&ctx.task_id, count as u64, bytes);
            }
        } else {
            ctx.info.lock().unwrap().binlog_pos = pos;
        }

        let lag = ctx.store.highest_binlog_id().saturating_sub(pos);
        if lag <= ctx.binlog_lag_threshold {
            break;
        }
    }

    // ---- commit ----------------------------------------------------------
    // From here the router fences writes to these slots, so one final drain
    // makes the receiver strictly current.
    ctx.set_state(TaskState::Commit);
    let raw = match ctx.store.binlog_since(pos, usize::MAX) {
        Ok(raw) => raw,
        Err(e) => return ctx.fail(&format!("final drain: {e}")),
    };
    let relevant: Vec<_> = raw.iter().filter(|e| slots.test(e.chunk_id)).collect();
    if !relevant.is_empty() {
        let mut log_batch = MigrateBatch::new(ctx.batch_max_bytes);
        for entry in &relevant {
            let op = match entry.op {
                BinlogOp::Put => OP_PUT,
                BinlogOp::Del => OP_DEL,
            };
            log_batch.add(op, &entry.key, &entry.value);
        }
        let (payload, count) = log_batch.take();
        if let Err(why) = send_and_ack(&ctx, &mut conn, XferFrame::Binlog { payload }).await {
            return ctx.fail(&why);
        }
        let mut info = ctx.info.lock().unwrap();
        info.entries_sent += count as u64;
    }
    if let Some(last) = raw.last() {
        ctx.info.lock().unwrap().binlog_pos = last.id;
    }

    if let Err(why) = send_and_ack(&ctx, &mut conn, XferFrame::Commit).await {
        return ctx.fail(&why);
    }
    ctx.set_state(TaskState::Succ);
    debug!(task = %ctx.task_id, store = ctx.store.store_id(), "sender sub-task committed");
    TaskState::Succ
}

async fn flush_batch(
    ctx: &SenderCtx,
    conn: &mut XferConn,
    batch: &mut MigrateBatch,
    seq: &mut u64,
) -> Result<(), String> {
    let (payload, count) = batch.take();
    let bytes = payload.len() as u64;
    ctx.limiter.throttle(bytes).await;
    *seq += 1;
    send_and_ack(
        ctx,
        conn,
        XferFrame::Batch {
            seq: *seq,
            payload,
        },
    )
    .await?;
    let mut info = ctx.info.lock().unwrap();
    info.bytes_sent += bytes;
    info.entries_sent += count as u64;
    drop(info);
    if let Some(obs) = &ctx.observer {
        obs.on_batch_sent(&ctx.task_id, count as u64, bytes);
    }
    Ok(())
}

/// Slots of `all` that live on `store_id` under `catalog`.
pub(crate) fn slots_on_store(
    catalog: &corvus_store::Catalog,
    all: &SlotBitmap,
    store_id: u32,
) -> SlotBitmap {
    all.iter()
        .filter(|s| catalog.store_for_chunk(*s) == store_id)
        .collect()
}
