//! corvus-cluster: distributed coordination for corvus.
//!
//! This crate is the cluster-management core of a sharded, replicated,
//! Redis-compatible key-value store:
//!
//! - **Slot management**: 16384 hash slots, CRC16 key mapping, bitmap and
//!   range forms ([`slots`])
//! - **Membership**: the node arena, epochs, fail reports, and the
//!   nodes.conf persistence format ([`topology`])
//! - **Gossip**: the RCmb bus wire format and the PING/PONG/MEET/FAIL/
//!   UPDATE protocol with quorum failure detection ([`message`], [`gossip`])
//! - **Failover**: offset-ranked slave elections with one-vote-per-epoch
//!   masters, plus manual handoff ([`failover`])
//! - **Migration**: per-store snapshot + binlog-tail slot transfer with
//!   stop/restart checkpoints and epoch-bumped commit ([`migrate`])
//! - **GC**: paced range-deletion of migrated-away slot data ([`gc`])
//!
//! Everything protocol-shaped is sans-io: engines return frames to send
//! and the server owns the sockets, timers, and task spawning.

pub mod error;
pub mod failover;
pub mod gc;
pub mod gossip;
pub mod message;
pub mod migrate;
pub mod ratelimit;
pub mod slots;
pub mod time;
pub mod topology;

pub use error::ClusterError;
pub use failover::{is_data_age_too_large, FailoverConfig, FailoverCtl, FailoverPhase};
pub use gc::{generate_delete_range_tasks, DeleteRangeTask, GcConfig, GcManager};
pub use gossip::{ClusterEvent, GossipConfig, GossipEngine, Outbound};
pub use message::{ClusterMsg, GossipEntry, MsgData, MsgHeader, MsgType};
pub use migrate::{
    Connector, MigrateConfig, MigrateEvent, MigrateManager, MigrateObserver, MigrateRedirect,
    TaskId, TaskState, XferAck, XferConn, XferFrame,
};
pub use ratelimit::RateLimiter;
pub use slots::{key_slot, parse_slot_token, SlotBitmap, SlotRange, CLUSTER_SLOTS};
pub use topology::{
    ClusterHealth, ClusterNode, ClusterState, NodeFlags, NodeName, SlotsReplyEntry,
};
