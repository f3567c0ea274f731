//! Gossip engine: membership dissemination and failure detection.
//!
//! The engine is sans-io. A control loop in the server owns the bus socket
//! and a 100 ms interval; each tick it calls [`GossipEngine::tick`] and
//! sends whatever frames come back, and for every inbound frame it calls
//! [`GossipEngine::handle_message`] and sends the replies. Replies to PING
//! are produced inside the same call — never deferred to a later tick.
//!
//! Failure detection: a master silent past `node_timeout` is marked PFAIL
//! locally. PFAIL/FAIL flags ride along in gossip entries; every sighting
//! from a master counts as one fail report. When strictly more than half of
//! the known masters agree and our own timer concurs, the target is marked
//! FAIL and a FAIL broadcast makes the verdict cluster-wide.

use std::sync::{Arc, RwLock};

use rand::seq::IteratorRandom;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::message::{ClusterMsg, GossipEntry, MsgData, MsgHeader, MsgType};
use crate::slots::SlotBitmap;
use crate::topology::{ClusterHealth, ClusterNode, ClusterState, NodeFlags, NodeName};

/// Gossip timing knobs.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// PFAIL/FAIL detection threshold.
    pub node_timeout_ms: u64,
    /// Control loop period.
    pub tick_interval_ms: u64,
    /// When our master's slots all migrate to another node, follow the new
    /// owner automatically.
    pub slave_reconf_enabled: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 15_000,
            tick_interval_ms: 100,
            slave_reconf_enabled: true,
        }
    }
}

impl GossipConfig {
    /// Handshake nodes that never answered are discarded after this long.
    pub fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout_ms.max(1_000)
    }
}

/// Notifications for the rest of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node was confirmed FAIL (by local quorum or a FAIL broadcast).
    NodeFailed(NodeName),
    /// A previously failed node is healthy again.
    NodeRecovered(NodeName),
    /// A higher-epoch claim took these slots away from myself. The GC
    /// manager owns reclaiming their data.
    MyselfLostSlots(Vec<u16>),
    /// A new node completed its handshake.
    NodeJoined(NodeName),
}

/// An outbound frame: bus address (`ip:cport`) and the message for it.
pub type Outbound = (String, ClusterMsg);

/// The gossip protocol engine. Shares [`ClusterState`] with the rest of the
/// node; all mutation happens in short critical sections.
pub struct GossipEngine {
    state: Arc<RwLock<ClusterState>>,
    config: GossipConfig,
    events: mpsc::Sender<ClusterEvent>,
}

impl GossipEngine {
    pub fn new(
        state: Arc<RwLock<ClusterState>>,
        config: GossipConfig,
        events: mpsc::Sender<ClusterEvent>,
    ) -> Self {
        Self {
            state,
            config,
            events,
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    fn emit(&self, event: ClusterEvent) {
        if self.events.try_send(event).is_err() {
            warn!("cluster event channel full or closed, dropping event");
        }
    }

    /// Builds the header every outbound message carries.
    pub fn build_header(state: &ClusterState, offset: u64) -> MsgHeader {
        let myself = state.myself();
        MsgHeader {
            port: myself.port,
            cport: myself.cport,
            current_epoch: state.current_epoch,
            config_epoch: myself.config_epoch,
            offset,
            sender: myself.name.clone(),
            slots: myself.slots.clone(),
            slaveof: myself.master.clone(),
            my_ip: myself.ip.clone(),
            flags: myself.flags.0,
            state: match state.health() {
                ClusterHealth::Ok => 0,
                ClusterHealth::Down => 1,
            },
            mflags: [0, 0, 0],
        }
    }

    /// Picks the gossip section for a PING/PONG/MEET: `min(3, n-2)` random
    /// healthy nodes plus every PFAIL/FAIL node we know about.
    fn gossip_entries(state: &ClusterState) -> Vec<GossipEntry> {
        let myself = state.myself_name();
        let candidates: Vec<&ClusterNode> = state
            .nodes()
            .filter(|n| &n.name != myself && !n.flags.contains(NodeFlags::HANDSHAKE))
            .collect();

        let wanted = state.node_count().saturating_sub(2).min(3);
        let mut rng = rand::rng();
        let mut chosen: Vec<&ClusterNode> = candidates
            .iter()
            .copied()
            .filter(|n| !n.flags.is_pfailing() && !n.is_failing())
            .choose_multiple(&mut rng, wanted);

        // Failing nodes always ride along so suspicion spreads fast.
        chosen.extend(
            candidates
                .iter()
                .copied()
                .filter(|n| n.flags.is_pfailing() || n.is_failing()),
        );

        chosen
            .into_iter()
            .map(|n| GossipEntry {
                name: n.name.clone(),
                ping_sent: (n.ping_sent / 1000) as u32,
                pong_received: (n.pong_received / 1000) as u32,
                ip: n.ip.clone(),
                port: n.port,
                cport: n.cport,
                flags: n.flags.0,
            })
            .collect()
    }

    fn message(state: &ClusterState, mtype: MsgType, offset: u64) -> ClusterMsg {
        let data = if mtype.carries_gossip() {
            MsgData::Gossip(Self::gossip_entries(state))
        } else {
            MsgData::Empty
        };
        ClusterMsg {
            mtype,
            header: Self::build_header(state, offset),
            data,
        }
    }

    fn bus_addr(node: &ClusterNode) -> String {
        format!("{}:{}", node.ip, node.cport)
    }
}

/// Slots currently owned by myself's master (0 when myself is a master).
fn my_master_slot_count(state: &ClusterState) -> u32 {
    state
        .myself()
        .master
        .as_ref()
        .and_then(|m| state.lookup_node(m))
        .map(|n| n.slots.count())
        .unwrap_or(0)
}

impl GossipEngine {

    /// One control-loop tick. `repl_offset` is myself's current replication
    /// offset, advertised in every header.
    pub fn tick(&self, now: u64, repl_offset: u64) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut state = self.state.write().unwrap();
        let node_timeout = self.config.node_timeout_ms;

        // Drop handshake nodes that never completed.
        let stale_handshakes: Vec<NodeName> = state
            .nodes()
            .filter(|n| {
                n.flags.contains(NodeFlags::HANDSHAKE)
                    && now.saturating_sub(n.pong_received) > self.config.handshake_timeout_ms()
            })
            .map(|n| n.name.clone())
            .collect();
        for name in stale_handshakes {
            debug!(node = %name, "dropping stale handshake node");
            state.remove_node(&name);
        }

        // Open handshakes: send MEET.
        let meet_targets: Vec<(NodeName, String)> = state
            .nodes()
            .filter(|n| n.flags.contains(NodeFlags::MEET) && n.ping_sent == 0)
            .map(|n| (n.name.clone(), Self::bus_addr(n)))
            .collect();
        for (name, addr) in meet_targets {
            let msg = Self::message(&state, MsgType::Meet, repl_offset);
            if let Some(node) = state.lookup_node_mut(&name) {
                node.ping_sent = now;
            }
            out.push((addr, msg));
        }

        // Ping the node whose pong is oldest, once it is older than half the
        // node timeout and no ping is already in flight.
        let myself = state.myself_name().clone();
        let ping_target = state
            .nodes()
            .filter(|n| {
                n.name != myself
                    && !n.flags.contains(NodeFlags::HANDSHAKE)
                    && n.ping_sent == 0
                    && now.saturating_sub(n.pong_received) > node_timeout / 2
            })
            .min_by_key(|n| n.pong_received)
            .map(|n| (n.name.clone(), Self::bus_addr(n)));
        if let Some((name, addr)) = ping_target {
            let msg = Self::message(&state, MsgType::Ping, repl_offset);
            if let Some(node) = state.lookup_node_mut(&name) {
                node.ping_sent = now;
            }
            trace!(node = %name, "gossip ping");
            out.push((addr, msg));
        }

        // Local suspicion: masters silent beyond node_timeout become PFAIL.
        let suspects: Vec<NodeName> = state
            .nodes()
            .filter(|n| {
                n.name != myself
                    && n.is_master()
                    && !n.flags.contains(NodeFlags::HANDSHAKE)
                    && !n.flags.is_pfailing()
                    && !n.is_failing()
                    && {
                        let since = if n.ping_sent != 0 {
                            now.saturating_sub(n.ping_sent)
                        } else {
                            now.saturating_sub(n.pong_received)
                        };
                        since > node_timeout
                    }
            })
            .map(|n| n.name.clone())
            .collect();
        for name in suspects {
            debug!(node = %name, "marking PFAIL (silent past node timeout)");
            if let Some(node) = state.lookup_node_mut(&name) {
                node.flags.set(NodeFlags::PFAIL);
            }
        }

        // Escalate suspicion to FAIL on quorum.
        let pfailing: Vec<NodeName> = state
            .nodes()
            .filter(|n| n.flags.is_pfailing() && !n.is_failing())
            .map(|n| n.name.clone())
            .collect();
        for name in pfailing {
            if state.fail_quorum_reached(&name, now, node_timeout) {
                state.mark_failing(&name, now);
                self.emit(ClusterEvent::NodeFailed(name.clone()));
                let fail = ClusterMsg {
                    mtype: MsgType::Fail,
                    header: Self::build_header(&state, repl_offset),
                    data: MsgData::Fail { name: name.clone() },
                };
                let peers: Vec<String> = state
                    .nodes()
                    .filter(|n| n.name != myself && !n.flags.contains(NodeFlags::HANDSHAKE))
                    .map(Self::bus_addr)
                    .collect();
                info!(node = %name, peers = peers.len(), "broadcasting FAIL");
                for addr in peers {
                    out.push((addr, fail.clone()));
                }
            }
        }

        out
    }

    /// Applies one inbound frame and returns the replies to send.
    pub fn handle_message(
        &self,
        msg: &ClusterMsg,
        from_ip: &str,
        now: u64,
        repl_offset: u64,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut state = self.state.write().unwrap();
        let header = &msg.header;

        state.observe_epoch(header.current_epoch);

        let sender_known = state.lookup_node(&header.sender).is_some();
        if !sender_known {
            match msg.mtype {
                MsgType::Meet => {
                    // MEET admits the sender unconditionally.
                    let ip = if header.my_ip.is_empty() {
                        from_ip.to_string()
                    } else {
                        header.my_ip.clone()
                    };
                    let mut node =
                        ClusterNode::new_master(header.sender.clone(), ip, header.port, header.cport);
                    node.flags = NodeFlags(header.flags);
                    node.flags.unset(NodeFlags::MYSELF);
                    node.flags.unset(NodeFlags::MEET);
                    node.flags.unset(NodeFlags::HANDSHAKE);
                    node.master = header.slaveof.clone();
                    node.pong_received = now;
                    node.config_epoch = header.config_epoch;
                    info!(node = %header.sender, "MEET from new node");
                    state.add_node(node);
                    self.emit(ClusterEvent::NodeJoined(header.sender.clone()));
                }
                MsgType::Pong | MsgType::Ping => {
                    // A handshake peer answering for the first time: match by
                    // bus address and adopt its real name.
                    let provisional = state
                        .node_by_addr(&header.my_ip, header.cport)
                        .filter(|n| n.flags.contains(NodeFlags::HANDSHAKE))
                        .map(|n| n.name.clone());
                    if let Some(old) = provisional {
                        state.rename_node(&old, header.sender.clone());
                        self.emit(ClusterEvent::NodeJoined(header.sender.clone()));
                    } else {
                        debug!(sender = %header.sender, "ignoring message from unknown sender");
                        return out;
                    }
                }
                _ => {
                    debug!(sender = %header.sender, mtype = ?msg.mtype, "unknown sender, dropping");
                    return out;
                }
            }
        }

        // Refresh the sender record from the header.
        if let Some(node) = state.lookup_node_mut(&header.sender) {
            node.port = header.port;
            node.cport = header.cport;
            if !header.my_ip.is_empty() {
                node.ip = header.my_ip.clone();
            }
            node.repl_offset = header.offset;
            node.flags.unset(NodeFlags::MEET);
            // Role tracking follows the sender's own view of itself.
            let remote = NodeFlags(header.flags);
            if remote.is_master() {
                node.flags.set(NodeFlags::MASTER);
                node.flags.unset(NodeFlags::SLAVE);
                node.master = None;
            } else if remote.is_slave() {
                node.flags.set(NodeFlags::SLAVE);
                node.flags.unset(NodeFlags::MASTER);
                node.master = header.slaveof.clone();
            }
            if remote.is_arbiter() {
                node.flags.set(NodeFlags::ARBITER);
            }
            if header.config_epoch > node.config_epoch {
                node.config_epoch = header.config_epoch;
            }
            if msg.mtype == MsgType::Pong {
                node.pong_received = now;
                node.ping_sent = 0;
                if node.flags.is_pfailing() {
                    debug!(node = %header.sender, "PFAIL cleared by pong");
                    node.flags.unset(NodeFlags::PFAIL);
                }
            }
            if node.is_failing() {
                state.clear_failure_if_needed(&header.sender, now, self.config.node_timeout_ms);
                if let Some(node) = state.lookup_node_mut(&header.sender) {
                    if !node.is_failing() {
                        // Forget the stale probe clock, or the node would be
                        // re-suspected the moment FAIL clears.
                        node.ping_sent = 0;
                        node.pong_received = now;
                        self.emit(ClusterEvent::NodeRecovered(header.sender.clone()));
                    }
                }
            }
        }

        // Slot claims embedded in the header.
        let sender_is_master = NodeFlags(header.flags).is_master();
        if sender_is_master && !header.slots.is_empty() {
            state.collision_bump_if_needed(&header.sender, header.config_epoch);
            let my_master_slots_before = my_master_slot_count(&state);
            let outcome = state.apply_slot_claim(&header.sender, header.config_epoch, &header.slots);
            if !outcome.lost_by_myself.is_empty() {
                self.emit(ClusterEvent::MyselfLostSlots(outcome.lost_by_myself.clone()));
            }
            // Our master migrated everything away: follow the new owner so
            // the replica keeps protecting live data.
            if self.config.slave_reconf_enabled
                && !outcome.applied.is_empty()
                && my_master_slots_before > 0
                && my_master_slot_count(&state) == 0
                && state.myself().flags.is_slave()
                && Some(&header.sender) != state.myself().master.as_ref()
            {
                info!(new_master = %header.sender, "master emptied by migration, reconfiguring");
                let _ = state.set_myself_slave_of(header.sender.clone());
            }
            if let Some(&stale_slot) = outcome.sender_stale.first() {
                // Teach the stale sender who really owns that slot.
                if let Some(owner) = state.node_for_slot(stale_slot) {
                    let update = ClusterMsg {
                        mtype: MsgType::Update,
                        header: Self::build_header(&state, repl_offset),
                        data: MsgData::Update {
                            config_epoch: owner.config_epoch,
                            name: owner.name.clone(),
                            slots: owner.slots.clone(),
                        },
                    };
                    out.push((format!("{}:{}", header.my_ip, header.cport), update));
                }
            }
        }

        match &msg.data {
            MsgData::Gossip(entries) => {
                self.merge_gossip(&mut state, &header.sender, entries, now);
            }
            MsgData::Fail { name } => {
                if state.lookup_node(name).is_some() && name != state.myself_name() {
                    info!(node = %name, via = %header.sender, "FAIL broadcast received");
                    state.mark_failing(name, now);
                    self.emit(ClusterEvent::NodeFailed(name.clone()));
                }
            }
            MsgData::Update {
                config_epoch,
                name,
                slots,
            } => {
                let outcome = state.apply_slot_claim(name, *config_epoch, slots);
                if !outcome.lost_by_myself.is_empty() {
                    // We were the stale claimant. Yield now; any re-claim
                    // happens only after a fresh epoch bump.
                    self.emit(ClusterEvent::MyselfLostSlots(outcome.lost_by_myself.clone()));
                }
            }
            MsgData::Publish { .. } | MsgData::Empty => {}
        }

        // PING and MEET are answered with PONG in the same drain.
        if matches!(msg.mtype, MsgType::Ping | MsgType::Meet) {
            let reply = Self::message(&state, MsgType::Pong, repl_offset);
            out.push((format!("{}:{}", header.my_ip, header.cport), reply));
        }

        out
    }

    /// Merges third-party gossip entries into the local view.
    fn merge_gossip(
        &self,
        state: &mut ClusterState,
        sender: &NodeName,
        entries: &[GossipEntry],
        now: u64,
    ) {
        let sender_is_master = state.lookup_node(sender).is_some_and(|n| n.is_master());
        for entry in entries {
            if &entry.name == state.myself_name() {
                continue;
            }
            let flags = NodeFlags(entry.flags);
            match state.lookup_node(&entry.name) {
                Some(_) => {
                    if (flags.is_pfailing() || flags.is_failing()) && sender_is_master {
                        state.add_fail_report(&entry.name, sender.clone(), now);
                        if state.fail_quorum_reached(
                            &entry.name,
                            now,
                            self.config.node_timeout_ms,
                        ) && !state
                            .lookup_node(&entry.name)
                            .is_some_and(|n| n.is_failing())
                        {
                            state.mark_failing(&entry.name, now);
                            self.emit(ClusterEvent::NodeFailed(entry.name.clone()));
                        }
                    }
                }
                None => {
                    if flags.contains(NodeFlags::HANDSHAKE) || entry.ip.is_empty() {
                        continue;
                    }
                    debug!(node = %entry.name, via = %sender, "learned node from gossip");
                    let mut node = ClusterNode::new_master(
                        entry.name.clone(),
                        entry.ip.clone(),
                        entry.port,
                        entry.cport,
                    );
                    node.flags = NodeFlags(entry.flags & !(NodeFlags::MYSELF | NodeFlags::MEET));
                    node.pong_received = now;
                    state.add_node(node);
                }
            }
        }
    }
}
