//! Binary wire format for the cluster bus.
//!
//! Every bus message is one framed envelope:
//!
//! ```text
//! "RCmb" | totlen u32 | ver u16 | port u16 | type u16 | count u16   (16 B)
//! currentEpoch u64 | configEpoch u64 | offset u64
//! sender 40 B | slots 2048 B | slaveof 40 B (zeros = none)
//! myIp 46 B nul-padded | cport u16 | flags u16 | state u8 | mflags 3 B
//! payload...
//! ```
//!
//! Multi-byte integers are little-endian. `count` is the number of gossip
//! entries for PING/PONG/MEET and zero otherwise. Decoding is strictly
//! length-checked; a truncated or oversized frame, a bad signature, or an
//! unknown type is rejected without panicking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::slots::{SlotBitmap, SLOT_BITMAP_BYTES};
use crate::topology::{NodeName, NODE_NAME_LEN};
use crate::ClusterError;

/// Frame signature.
pub const MSG_SIGNATURE: [u8; 4] = *b"RCmb";

/// Protocol version this node speaks.
pub const PROTO_VER: u16 = 1;

/// Fixed envelope prefix length.
pub const MSG_PREFIX_LEN: usize = 16;

/// Bytes reserved for the sender IP field.
const IP_FIELD_LEN: usize = 46;

/// Maximum gossip entries accepted in one frame. Far above the
/// `min(3, n-2)` + failing-nodes payload any correct sender produces.
const MAX_GOSSIP_ENTRIES: usize = 1024;

/// Manual-failover force bit in `mflags[0]`: the auth request bypasses the
/// data-age check because the operator asked for it.
pub const MFLAG0_FORCEACK: u8 = 1 << 0;

/// `mflags[0]` bit set on MFSTART acks while the master has writes paused.
pub const MFLAG0_PAUSED: u8 = 1 << 1;

/// Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    AuthRequest = 5,
    AuthAck = 6,
    Update = 7,
    MfStart = 8,
}

impl MsgType {
    fn from_wire(v: u16) -> Result<Self, ClusterError> {
        Ok(match v {
            0 => MsgType::Ping,
            1 => MsgType::Pong,
            2 => MsgType::Meet,
            3 => MsgType::Fail,
            4 => MsgType::Publish,
            5 => MsgType::AuthRequest,
            6 => MsgType::AuthAck,
            7 => MsgType::Update,
            8 => MsgType::MfStart,
            other => return Err(ClusterError::BadMessage(format!("unknown type {other}"))),
        })
    }

    /// True for the three membership messages that carry gossip entries.
    pub fn carries_gossip(self) -> bool {
        matches!(self, MsgType::Ping | MsgType::Pong | MsgType::Meet)
    }
}

/// Sender identity and view, present on every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub port: u16,
    pub cport: u16,
    pub current_epoch: u64,
    pub config_epoch: u64,
    /// Sender's replication offset.
    pub offset: u64,
    pub sender: NodeName,
    /// Slots the sender claims to own.
    pub slots: SlotBitmap,
    /// Sender's master when it is a slave.
    pub slaveof: Option<NodeName>,
    pub my_ip: String,
    pub flags: u16,
    /// Sender's cluster health: 0 = ok, 1 = down.
    pub state: u8,
    pub mflags: [u8; 3],
}

/// One gossiped third-party record inside PING/PONG/MEET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub name: NodeName,
    /// Seconds, truncated from the sender's millisecond clock.
    pub ping_sent: u32,
    pub pong_received: u32,
    pub ip: String,
    pub port: u16,
    pub cport: u16,
    pub flags: u16,
}

/// Per-type payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgData {
    /// PING/PONG/MEET: third-party membership records.
    Gossip(Vec<GossipEntry>),
    /// FAIL broadcast naming the failed node.
    Fail { name: NodeName },
    /// Cross-cluster pub/sub relay.
    Publish { channel: Bytes, message: Bytes },
    /// Authoritative slot claim pushed at a stale peer.
    Update {
        config_epoch: u64,
        name: NodeName,
        slots: SlotBitmap,
    },
    /// No payload beyond the header.
    Empty,
}

/// A complete bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMsg {
    pub mtype: MsgType,
    pub header: MsgHeader,
    pub data: MsgData,
}

// ---- length-checked readers ---------------------------------------------

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), ClusterError> {
    if buf.len() < n {
        return Err(ClusterError::BadMessage(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], what: &str) -> Result<u8, ClusterError> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], what: &str) -> Result<u16, ClusterError> {
    need(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut &[u8], what: &str) -> Result<u32, ClusterError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8], what: &str) -> Result<u64, ClusterError> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut &[u8], n: usize, what: &str) -> Result<Vec<u8>, ClusterError> {
    need(buf, n, what)?;
    let out = buf[..n].to_vec();
    buf.advance(n);
    Ok(out)
}

fn get_name(buf: &mut &[u8], what: &str) -> Result<NodeName, ClusterError> {
    let raw = get_bytes(buf, NODE_NAME_LEN, what)?;
    let mut arr = [0u8; NODE_NAME_LEN];
    arr.copy_from_slice(&raw);
    NodeName::from_wire(&arr)
}

/// A 40-byte name field that may be all zeros (meaning "none").
fn get_opt_name(buf: &mut &[u8], what: &str) -> Result<Option<NodeName>, ClusterError> {
    let raw = get_bytes(buf, NODE_NAME_LEN, what)?;
    if raw.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let mut arr = [0u8; NODE_NAME_LEN];
    arr.copy_from_slice(&raw);
    Ok(Some(NodeName::from_wire(&arr)?))
}

fn get_ip(buf: &mut &[u8], what: &str) -> Result<String, ClusterError> {
    let raw = get_bytes(buf, IP_FIELD_LEN, what)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(|s| s.to_string())
        .map_err(|_| ClusterError::BadMessage(format!("non-utf8 ip in {what}")))
}

fn put_ip(buf: &mut BytesMut, ip: &str) {
    let bytes = ip.as_bytes();
    let n = bytes.len().min(IP_FIELD_LEN);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, IP_FIELD_LEN - n);
}

fn put_opt_name(buf: &mut BytesMut, name: &Option<NodeName>) {
    match name {
        Some(n) => buf.put_slice(&n.as_wire()),
        None => buf.put_bytes(0, NODE_NAME_LEN),
    }
}

// ---- encode / decode -----------------------------------------------------

impl ClusterMsg {
    /// Serializes the message into one framed buffer.
    pub fn encode(&self) -> Bytes {
        let count = match &self.data {
            MsgData::Gossip(entries) => entries.len() as u16,
            _ => 0,
        };

        let mut buf = BytesMut::with_capacity(2300);
        buf.put_slice(&MSG_SIGNATURE);
        buf.put_u32_le(0); // totlen backfilled below
        buf.put_u16_le(PROTO_VER);
        buf.put_u16_le(self.header.port);
        buf.put_u16_le(self.mtype as u16);
        buf.put_u16_le(count);

        let h = &self.header;
        buf.put_u64_le(h.current_epoch);
        buf.put_u64_le(h.config_epoch);
        buf.put_u64_le(h.offset);
        buf.put_slice(&h.sender.as_wire());
        buf.put_slice(h.slots.as_bytes());
        put_opt_name(&mut buf, &h.slaveof);
        put_ip(&mut buf, &h.my_ip);
        buf.put_u16_le(h.cport);
        buf.put_u16_le(h.flags);
        buf.put_u8(h.state);
        buf.put_slice(&h.mflags);

        match &self.data {
            MsgData::Gossip(entries) => {
                for e in entries {
                    buf.put_slice(&e.name.as_wire());
                    buf.put_u32_le(e.ping_sent);
                    buf.put_u32_le(e.pong_received);
                    put_ip(&mut buf, &e.ip);
                    buf.put_u16_le(e.port);
                    buf.put_u16_le(e.cport);
                    buf.put_u16_le(e.flags);
                }
            }
            MsgData::Fail { name } => buf.put_slice(&name.as_wire()),
            MsgData::Publish { channel, message } => {
                buf.put_u32_le(channel.len() as u32);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(channel);
                buf.put_slice(message);
            }
            MsgData::Update {
                config_epoch,
                name,
                slots,
            } => {
                buf.put_u64_le(*config_epoch);
                buf.put_slice(&name.as_wire());
                buf.put_slice(slots.as_bytes());
            }
            MsgData::Empty => {}
        }

        let totlen = buf.len() as u32;
        buf[4..8].copy_from_slice(&totlen.to_le_bytes());
        buf.freeze()
    }

    /// Decodes one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ClusterError> {
        let mut buf = frame;
        let sig = get_bytes(&mut buf, 4, "signature")?;
        if sig != MSG_SIGNATURE {
            return Err(ClusterError::BadMessage("bad signature".into()));
        }
        let totlen = get_u32(&mut buf, "totlen")? as usize;
        if totlen != frame.len() {
            return Err(ClusterError::BadMessage(format!(
                "totlen {totlen} != frame length {}",
                frame.len()
            )));
        }
        let ver = get_u16(&mut buf, "version")?;
        if ver != PROTO_VER {
            return Err(ClusterError::BadMessage(format!("unsupported version {ver}")));
        }
        let port = get_u16(&mut buf, "port")?;
        let mtype = MsgType::from_wire(get_u16(&mut buf, "type")?)?;
        let count = get_u16(&mut buf, "count")? as usize;
        if count > MAX_GOSSIP_ENTRIES {
            return Err(ClusterError::BadMessage(format!(
                "gossip count {count} exceeds limit"
            )));
        }

        let current_epoch = get_u64(&mut buf, "currentEpoch")?;
        let config_epoch = get_u64(&mut buf, "configEpoch")?;
        let offset = get_u64(&mut buf, "offset")?;
        let sender = get_name(&mut buf, "sender")?;
        let slots_raw = get_bytes(&mut buf, SLOT_BITMAP_BYTES, "slots")?;
        let slots = SlotBitmap::from_bytes(&slots_raw)
            .map_err(|e| ClusterError::BadMessage(e.to_string()))?;
        let slaveof = get_opt_name(&mut buf, "slaveof")?;
        let my_ip = get_ip(&mut buf, "myIp")?;
        let cport = get_u16(&mut buf, "cport")?;
        let flags = get_u16(&mut buf, "flags")?;
        let state = get_u8(&mut buf, "state")?;
        let mflags_raw = get_bytes(&mut buf, 3, "mflags")?;
        let mflags = [mflags_raw[0], mflags_raw[1], mflags_raw[2]];

        let header = MsgHeader {
            port,
            cport,
            current_epoch,
            config_epoch,
            offset,
            sender,
            slots,
            slaveof,
            my_ip,
            flags,
            state,
            mflags,
        };

        let data = match mtype {
            MsgType::Ping | MsgType::Pong | MsgType::Meet => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = get_name(&mut buf, "gossip name")?;
                    let ping_sent = get_u32(&mut buf, "gossip ping")?;
                    let pong_received = get_u32(&mut buf, "gossip pong")?;
                    let ip = get_ip(&mut buf, "gossip ip")?;
                    let gport = get_u16(&mut buf, "gossip port")?;
                    let gcport = get_u16(&mut buf, "gossip cport")?;
                    let gflags = get_u16(&mut buf, "gossip flags")?;
                    entries.push(GossipEntry {
                        name,
                        ping_sent,
                        pong_received,
                        ip,
                        port: gport,
                        cport: gcport,
                        flags: gflags,
                    });
                }
                MsgData::Gossip(entries)
            }
            MsgType::Fail => MsgData::Fail {
                name: get_name(&mut buf, "fail name")?,
            },
            MsgType::Publish => {
                let clen = get_u32(&mut buf, "channel len")? as usize;
                let mlen = get_u32(&mut buf, "message len")? as usize;
                let channel = Bytes::from(get_bytes(&mut buf, clen, "channel")?);
                let message = Bytes::from(get_bytes(&mut buf, mlen, "message")?);
                MsgData::Publish { channel, message }
            }
            MsgType::Update => {
                let config_epoch = get_u64(&mut buf, "update epoch")?;
                let name = get_name(&mut buf, "update name")?;
                let raw = get_bytes(&mut buf, SLOT_BITMAP_BYTES, "update slots")?;
                let slots = SlotBitmap::from_bytes(&raw)
                    .map_err(|e| ClusterError::BadMessage(e.to_string()))?;
                MsgData::Update {
                    config_epoch,
                    name,
                    slots,
                }
            }
            MsgType::AuthRequest | MsgType::AuthAck | MsgType::MfStart => MsgData::Empty,
        };

        if !buf.is_empty() {
            return Err(ClusterError::BadMessage(format!(
                "{} trailing bytes",
                buf.len()
            )));
        }

        Ok(ClusterMsg {
            mtype,
            header,
            data,
        })
    }
}
