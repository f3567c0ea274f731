//! Migration transfer frames and the batch payload codec.
//!
//! A transfer is a stream of [`XferFrame`]s from sender to receiver, each
//! answered by one [`XferAck`]. The batch payload packs key/value entries
//! as `op u8 | klen u32 | key | vlen u32 | value`, prefixed by an entry
//! count; the receiver applies one payload as one atomic write batch.
//!
//! In-process the frames travel over channels; the server's bridge encodes
//! them with `encode`/`decode` and adds outer length framing on TCP.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::slots::{SlotBitmap, SLOT_BITMAP_BYTES};
use crate::ClusterError;

/// Entry op: a live key/value from a snapshot or a binlog put.
pub const OP_PUT: u8 = 0;
/// Entry op: a binlog deletion (value is empty).
pub const OP_DEL: u8 = 1;

const FRAME_HELLO: u8 = 1;
const FRAME_BATCH: u8 = 2;
const FRAME_BINLOG: u8 = 3;
const FRAME_COMMIT: u8 = 4;

const ACK_OK: u8 = 0;
const ACK_ERR: u8 = 1;

/// Sender → receiver protocol frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferFrame {
    /// Opens the transfer for one store; validated before any data moves.
    Hello {
        task_id: String,
        store_id: u32,
        store_count: u32,
        slots: SlotBitmap,
    },
    /// One snapshot batch; applied atomically by the receiver.
    Batch { seq: u64, payload: Bytes },
    /// Tailed binlog mutations for the migrating slots.
    Binlog { payload: Bytes },
    /// Final drain done; receiver acks and both sides finish.
    Commit,
}

/// Receiver → sender acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferAck {
    Ok,
    Err(String),
}

impl XferFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            XferFrame::Hello {
                task_id,
                store_id,
                store_count,
                slots,
            } => {
                buf.put_u8(FRAME_HELLO);
                buf.put_u8(task_id.len() as u8);
                buf.put_slice(task_id.as_bytes());
                buf.put_u32_le(*store_id);
                buf.put_u32_le(*store_count);
                buf.put_slice(slots.as_bytes());
            }
            XferFrame::Batch { seq, payload } => {
                buf.put_u8(FRAME_BATCH);
                buf.put_u64_le(*seq);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            XferFrame::Binlog { payload } => {
                buf.put_u8(FRAME_BINLOG);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            XferFrame::Commit => buf.put_u8(FRAME_COMMIT),
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ClusterError> {
        let tag = take_u8(&mut buf)?;
        match tag {
            FRAME_HELLO => {
                let idlen = take_u8(&mut buf)? as usize;
                let id_raw = take_bytes(&mut buf, idlen)?;
                let task_id = String::from_utf8(id_raw)
                    .map_err(|_| ClusterError::BadMessage("non-utf8 task id".into()))?;
                let store_id = take_u32(&mut buf)?;
                let store_count = take_u32(&mut buf)?;
                let raw = take_bytes(&mut buf, SLOT_BITMAP_BYTES)?;
                let slots = SlotBitmap::from_bytes(&raw)
                    .map_err(|e| ClusterError::BadMessage(e.to_string()))?;
                Ok(XferFrame::Hello {
                    task_id,
                    store_id,
                    store_count,
                    slots,
                })
            }
            FRAME_BATCH => {
                let seq = take_u64(&mut buf)?;
                let len = take_u32(&mut buf)? as usize;
                let payload = Bytes::from(take_bytes(&mut buf, len)?);
                Ok(XferFrame::Batch { seq, payload })
            }
            FRAME_BINLOG => {
                let len = take_u32(&mut buf)? as usize;
                let payload = Bytes::from(take_bytes(&mut buf, len)?);
                Ok(XferFrame::Binlog { payload })
            }
            FRAME_COMMIT => Ok(XferFrame::Commit),
            other => Err(ClusterError::BadMessage(format!(
                "unknown transfer frame {other}"
            ))),
        }
    }
}

impl XferAck {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            XferAck::Ok => buf.put_u8(ACK_OK),
            XferAck::Err(msg) => {
                buf.put_u8(ACK_ERR);
                buf.put_u32_le(msg.len() as u32);
                buf.put_slice(msg.as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ClusterError> {
        match take_u8(&mut buf)? {
            ACK_OK => Ok(XferAck::Ok),
            ACK_ERR => {
                let len = take_u32(&mut buf)? as usize;
                let raw = take_bytes(&mut buf, len)?;
                Ok(XferAck::Err(String::from_utf8_lossy(&raw).into_owned()))
            }
            other => Err(ClusterError::BadMessage(format!("unknown ack {other}"))),
        }
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ClusterError> {
    if buf.is_empty() {
        return Err(ClusterError::BadMessage("truncated transfer frame".into()));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, ClusterError> {
    if buf.len() < 4 {
        return Err(ClusterError::BadMessage("truncated transfer frame".into()));
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, ClusterError> {
    if buf.len() < 8 {
        return Err(ClusterError::BadMessage("truncated transfer frame".into()));
    }
    Ok(buf.get_u64_le())
}

fn take_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>, ClusterError> {
    if buf.len() < n {
        return Err(ClusterError::BadMessage("truncated transfer frame".into()));
    }
    let out = buf[..n].to_vec();
    buf.advance(n);
    Ok(out)
}

/// One decoded batch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub op: u8,
    pub key: Bytes,
    pub value: Bytes,
}

/// Accumulates entries up to a byte budget, then ships as one payload.
pub struct MigrateBatch {
    buf: BytesMut,
    count: u32,
    max_bytes: usize,
}

impl MigrateBatch {
    pub fn new(max_bytes: usize) -> Self {
        let mut buf = BytesMut::with_capacity(max_bytes.min(1 << 20) + 4);
        buf.put_u32_le(0); // count backfilled on take
        Self {
            buf,
            count: 0,
            max_bytes,
        }
    }

    pub fn add(&mut self, op: u8, key: &[u8], value: &[u8]) {
        self.buf.put_u8(op);
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self.count += 1;
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// Finishes the payload and resets the batch for reuse.
    /// Returns the payload and its entry count.
    pub fn take(&mut self) -> (Bytes, u32) {
        let count = self.count;
        self.buf[0..4].copy_from_slice(&count.to_le_bytes());
        let payload = self.buf.split().freeze();
        self.buf.put_u32_le(0);
        self.count = 0;
        (payload, count)
    }
}

/// Decodes a batch payload back into entries.
pub fn decode_entries(payload: &[u8]) -> Result<Vec<BatchEntry>, ClusterError> {
    let mut buf = payload;
    let count = take_u32(&mut buf)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let op = take_u8(&mut buf)?;
        if op != OP_PUT && op != OP_DEL {
            return Err(ClusterError::BadMessage(format!("unknown entry op {op}")));
        }
        let klen = take_u32(&mut buf)? as usize;
        let key = Bytes::from(take_bytes(&mut buf, klen)?);
        let vlen = take_u32(&mut buf)? as usize;
        let value = Bytes::from(take_bytes(&mut buf, vlen)?);
        out.push(BatchEntry { op, key, value });
    }
    if !buf.is_empty() {
        return Err(ClusterError::BadMessage("trailing bytes in batch".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_fills_and_resets() {
        let mut batch = MigrateBatch::new(64);
        assert!(batch.is_empty());
        batch.add(OP_PUT, b"key-1", b"value-1");
        batch.add(OP_PUT, b"key-2", b"value-2");
        assert_eq!(batch.len(), 2);
        batch.add(OP_PUT, b"key-3", b"a-much-longer-value-to-cross-the-line");
        assert!(batch.is_full());

        let (payload, count) = batch.take();
        assert_eq!(count, 3);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);

        let entries = decode_entries(&payload).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, Bytes::from_static(b"key-1"));
        assert_eq!(entries[2].value.len(), 38);

        // Reusable after take.
        batch.add(OP_DEL, b"key-4", b"");
        let (payload, count) = batch.take();
        assert_eq!(count, 1);
        let entries = decode_entries(&payload).unwrap();
        assert_eq!(entries[0].op, OP_DEL);
    }

    #[test]
    fn entries_reject_garbage() {
        assert!(decode_entries(&[]).is_err());
        // count says 1 but nothing follows
        assert!(decode_entries(&1u32.to_le_bytes()).is_err());
        // bad op
        let mut payload = 1u32.to_le_bytes().to_vec();
        payload.push(9);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        assert!(decode_entries(&payload).is_err());
    }

    #[test]
    fn frames_roundtrip() {
        let frames = vec![
            XferFrame::Hello {
                task_id: "f".repeat(42),
                store_id: 3,
                store_count: 10,
                slots: [1u16, 2, 3].into_iter().collect(),
            },
            XferFrame::Batch {
                seq: 7,
                payload: Bytes::from_static(b"\x00\x00\x00\x00"),
            },
            XferFrame::Binlog {
                payload: Bytes::from_static(b"\x00\x00\x00\x00"),
            },
            XferFrame::Commit,
        ];
        for frame in frames {
            let decoded = XferFrame::decode(&frame.encode()).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn acks_roundtrip() {
        for ack in [XferAck::Ok, XferAck::Err("store count mismatch".into())] {
            let decoded = XferAck::decode(&ack.encode()).unwrap();
            assert_eq!(ack, decoded);
        }
    }

    #[test]
    fn truncated_frames_rejected() {
        let good = XferFrame::Hello {
            task_id: "a".repeat(42),
            store_id: 0,
            store_count: 1,
            slots: SlotBitmap::new(),
        }
        .encode();
        assert!(XferFrame::decode(&good[..good.len() - 1]).is_err());
        assert!(XferFrame::decode(&[]).is_err());
        assert!(XferFrame::decode(&[0xff]).is_err());
    }
}
