//! Cluster membership and slot-ownership state.
//!
//! One [`ClusterState`] per node holds everything gossip converges on: the
//! node arena (keyed by 40-hex-char node name — never by reference, so a
//! departed node is just an absent map entry), the slot→owner table, the
//! epoch counters, and the failure-report ledger.
//!
//! Ownership disputes are settled by `configEpoch`: the higher epoch wins a
//! slot, and an equal-epoch collision is broken toward the lexicographically
//! larger name, with the loser bumping its own epoch before it may claim
//! again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::slots::{SlotBitmap, CLUSTER_SLOTS};
use crate::ClusterError;

/// Length of a node name in characters (160 bits as lowercase hex).
pub const NODE_NAME_LEN: usize = 40;

/// A node's cluster-wide identity: 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    /// Generates a fresh random name. Done once per node lifetime; the name
    /// is persisted and survives restarts.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let name: String = (0..NODE_NAME_LEN)
            .map(|_| {
                let n: u8 = rng.random_range(0..16);
                char::from_digit(n as u32, 16).unwrap_or('0')
            })
            .collect();
        Self(name)
    }

    pub fn parse(s: &str) -> Result<Self, ClusterError> {
        if s.len() != NODE_NAME_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ClusterError::BadNodeName(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Builds a name from raw wire bytes (40 ASCII hex chars).
    pub fn from_wire(bytes: &[u8; NODE_NAME_LEN]) -> Result<Self, ClusterError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ClusterError::BadNodeName("non-utf8 node name".into()))?;
        Self::parse(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_wire(&self) -> [u8; NODE_NAME_LEN] {
        let mut out = [0u8; NODE_NAME_LEN];
        out.copy_from_slice(self.0.as_bytes());
        out
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs, like a git abbreviated hash.
        write!(f, "{}", &self.0[..8])
    }
}

/// Node status flags, one bit each, matching the wire `flags: u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeFlags(pub u16);

impl NodeFlags {
    pub const MASTER: u16 = 1 << 0;
    pub const SLAVE: u16 = 1 << 1;
    pub const MYSELF: u16 = 1 << 2;
    pub const HANDSHAKE: u16 = 1 << 3;
    pub const MEET: u16 = 1 << 4;
    pub const PFAIL: u16 = 1 << 5;
    pub const FAIL: u16 = 1 << 6;
    pub const NOFAILOVER: u16 = 1 << 7;
    pub const ARBITER: u16 = 1 << 8;

    pub fn master() -> Self {
        Self(Self::MASTER)
    }

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn unset(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    pub fn is_master(&self) -> bool {
        self.contains(Self::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.contains(Self::SLAVE)
    }

    pub fn is_failing(&self) -> bool {
        self.contains(Self::FAIL)
    }

    pub fn is_pfailing(&self) -> bool {
        self.contains(Self::PFAIL)
    }

    pub fn is_arbiter(&self) -> bool {
        self.contains(Self::ARBITER)
    }

    fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Self::MYSELF) {
            out.push("myself");
        }
        if self.contains(Self::MASTER) {
            out.push("master");
        }
        if self.contains(Self::SLAVE) {
            out.push("slave");
        }
        if self.contains(Self::ARBITER) {
            out.push("arbiter");
        }
        if self.contains(Self::FAIL) {
            out.push("fail");
        } else if self.contains(Self::PFAIL) {
            out.push("fail?");
        }
        if self.contains(Self::HANDSHAKE) {
            out.push("handshake");
        }
        if self.contains(Self::MEET) {
            out.push("meet");
        }
        if self.contains(Self::NOFAILOVER) {
            out.push("nofailover");
        }
        out
    }
}

impl std::fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "noflags")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

fn parse_flags(text: &str) -> NodeFlags {
    let mut flags = NodeFlags::default();
    for part in text.split(',') {
        match part {
            "myself" => flags.set(NodeFlags::MYSELF),
            "master" => flags.set(NodeFlags::MASTER),
            "slave" => flags.set(NodeFlags::SLAVE),
            "arbiter" => flags.set(NodeFlags::ARBITER),
            "fail" => flags.set(NodeFlags::FAIL),
            "fail?" => flags.set(NodeFlags::PFAIL),
            "handshake" => flags.set(NodeFlags::HANDSHAKE),
            "meet" => flags.set(NodeFlags::MEET),
            "nofailover" => flags.set(NodeFlags::NOFAILOVER),
            _ => {}
        }
    }
    flags
}

/// One known peer (or ourselves) in the arena.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: NodeName,
    pub ip: String,
    pub port: u16,
    /// Cluster bus port.
    pub cport: u16,
    pub flags: NodeFlags,
    pub config_epoch: u64,
    /// Slots this node owns. Empty for slaves and arbiters.
    pub slots: SlotBitmap,
    /// Set when this node is a slave: its master's name.
    pub master: Option<NodeName>,
    /// Millisecond timestamps maintained by gossip.
    pub ping_sent: u64,
    pub pong_received: u64,
    /// When FAIL was set (0 when not failing).
    pub fail_time: u64,
    /// Last advertised replication offset.
    pub repl_offset: u64,
}

impl ClusterNode {
    pub fn new_master(name: NodeName, ip: String, port: u16, cport: u16) -> Self {
        Self {
            name,
            ip,
            port,
            cport,
            flags: NodeFlags::master(),
            config_epoch: 0,
            slots: SlotBitmap::new(),
            master: None,
            ping_sent: 0,
            pong_received: 0,
            fail_time: 0,
            repl_offset: 0,
        }
    }

    /// A peer first learned through MEET: name is provisional until the
    /// handshake PONG reveals the real one.
    pub fn new_handshake(ip: String, port: u16, cport: u16, now: u64) -> Self {
        let mut node = Self::new_master(NodeName::random(), ip, port, cport);
        node.flags.set(NodeFlags::HANDSHAKE);
        node.flags.set(NodeFlags::MEET);
        node.pong_received = now;
        node
    }

    pub fn is_master(&self) -> bool {
        self.flags.is_master()
    }

    pub fn is_failing(&self) -> bool {
        self.flags.is_failing()
    }

    /// `ip:port` as clients see it.
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// One PFAIL accusation against a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailReport {
    pub reporter: NodeName,
    pub time: u64,
}

/// Overall cluster health from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Down,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Ok => write!(f, "ok"),
            ClusterHealth::Down => write!(f, "fail"),
        }
    }
}

/// One row of the CLUSTER SLOTS reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotsReplyEntry {
    pub start: u16,
    pub end: u16,
    pub master: (String, u16, NodeName),
    pub replicas: Vec<(String, u16, NodeName)>,
}

/// Result of applying a remote slot claim.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Slots reassigned to the claimer.
    pub applied: Vec<u16>,
    /// Slots where our view has a strictly newer owner: the claimer is
    /// stale and should be sent an UPDATE.
    pub sender_stale: Vec<u16>,
    /// Slots myself lost to the claimer (input to GC).
    pub lost_by_myself: Vec<u16>,
}

/// The full cluster view of one node.
pub struct ClusterState {
    myself: NodeName,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
    pub require_full_coverage: bool,
    nodes: HashMap<NodeName, ClusterNode>,
    slot_owner: Vec<Option<NodeName>>,
    fail_reports: HashMap<NodeName, Vec<FailReport>>,
}

impl ClusterState {
    /// Creates the state for a fresh node that knows only itself.
    pub fn new(myself: ClusterNode) -> Self {
        let mut flags = myself.flags;
        flags.set(NodeFlags::MYSELF);
        let name = myself.name.clone();
        let mut nodes = HashMap::new();
        nodes.insert(name.clone(), ClusterNode { flags, ..myself });
        Self {
            myself: name,
            current_epoch: 0,
            last_vote_epoch: 0,
            require_full_coverage: true,
            nodes,
            slot_owner: vec![None; CLUSTER_SLOTS as usize],
            fail_reports: HashMap::new(),
        }
    }

    pub fn myself_name(&self) -> &NodeName {
        &self.myself
    }

    pub fn myself(&self) -> &ClusterNode {
        &self.nodes[&self.myself]
    }

    pub fn myself_mut(&mut self) -> &mut ClusterNode {
        self.nodes.get_mut(&self.myself).expect("myself in arena")
    }

    pub fn lookup_node(&self, name: &NodeName) -> Option<&ClusterNode> {
        self.nodes.get(name)
    }

    pub fn lookup_node_mut(&mut self, name: &NodeName) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Finds a node by its bus endpoint; used to match MEET handshakes.
    pub fn node_by_addr(&self, ip: &str, cport: u16) -> Option<&ClusterNode> {
        self.nodes
            .values()
            .find(|n| n.ip == ip && n.cport == cport)
    }

    pub fn add_node(&mut self, node: ClusterNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Drops a node and every trace of it: owned slots, fail reports,
    /// slave links.
    pub fn remove_node(&mut self, name: &NodeName) -> Option<ClusterNode> {
        let node = self.nodes.remove(name)?;
        for owner in self.slot_owner.iter_mut() {
            if owner.as_ref() == Some(name) {
                *owner = None;
            }
        }
        self.fail_reports.remove(name);
        for reports in self.fail_reports.values_mut() {
            reports.retain(|r| &r.reporter != name);
        }
        for other in self.nodes.values_mut() {
            if other.master.as_ref() == Some(name) {
                other.master = None;
            }
        }
        Some(node)
    }

    /// Renames a handshake-era node once its PONG reveals the real name.
    pub fn rename_node(&mut self, old: &NodeName, new: NodeName) {
        if let Some(mut node) = self.nodes.remove(old) {
            debug!(old = %old.as_str(), new = %new.as_str(), "handshake resolved node name");
            node.name = new.clone();
            node.flags.unset(NodeFlags::HANDSHAKE);
            self.nodes.insert(new, node);
        }
    }

    pub fn slot_owner_name(&self, slot: u16) -> Option<&NodeName> {
        self.slot_owner[slot as usize].as_ref()
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<&ClusterNode> {
        self.slot_owner_name(slot).and_then(|n| self.nodes.get(n))
    }

    pub fn myself_owns(&self, slot: u16) -> bool {
        self.slot_owner_name(slot) == Some(&self.myself)
    }

    /// Claims a slot for a node. Fails if another node owns it; migration
    /// commit and failover use [`take_slot`](Self::take_slot) instead.
    pub fn add_slot(&mut self, name: &NodeName, slot: u16) -> Result<(), ClusterError> {
        match self.slot_owner_name(slot) {
            Some(owner) if owner != name => Err(ClusterError::SlotBusy {
                slot,
                owner: owner.as_str().to_string(),
            }),
            _ => {
                self.take_slot(name, slot);
                Ok(())
            }
        }
    }

    /// Unconditionally reassigns a slot, updating both the table and the
    /// per-node bitmaps.
    pub fn take_slot(&mut self, name: &NodeName, slot: u16) {
        if let Some(old) = self.slot_owner[slot as usize].take() {
            if let Some(node) = self.nodes.get_mut(&old) {
                node.slots.clear(slot);
            }
        }
        self.slot_owner[slot as usize] = Some(name.clone());
        if let Some(node) = self.nodes.get_mut(name) {
            node.slots.set(slot);
        }
    }

    pub fn del_slot(&mut self, slot: u16) {
        if let Some(old) = self.slot_owner[slot as usize].take() {
            if let Some(node) = self.nodes.get_mut(&old) {
                node.slots.clear(slot);
            }
        }
    }

    /// Advances the cluster epoch and returns the new value.
    pub fn bump_epoch(&mut self) -> u64 {
        self.current_epoch += 1;
        self.current_epoch
    }

    /// Adopts a higher epoch observed in gossip.
    pub fn observe_epoch(&mut self, epoch: u64) {
        if epoch > self.current_epoch {
            self.current_epoch = epoch;
        }
    }

    /// Equal-configEpoch collision: the smaller name yields by bumping.
    /// Returns true when myself bumped.
    pub fn collision_bump_if_needed(&mut self, other: &NodeName, other_config_epoch: u64) -> bool {
        let my_epoch = self.myself().config_epoch;
        if !self.myself().is_master()
            || other_config_epoch != my_epoch
            || other <= &self.myself
        {
            return false;
        }
        let new = self.bump_epoch();
        self.myself_mut().config_epoch = new;
        info!(
            epoch = new,
            other = %other.as_str(),
            "configEpoch collision, bumped to resolve"
        );
        true
    }

    /// Applies a remote claim over `slots` at `claimer_epoch`.
    pub fn apply_slot_claim(
        &mut self,
        claimer: &NodeName,
        claimer_epoch: u64,
        slots: &SlotBitmap,
    ) -> ClaimOutcome {
        let mut outcome = ClaimOutcome::default();
        for slot in slots.iter() {
            let Some(owner) = self.slot_owner_name(slot).cloned() else {
                self.take_slot(claimer, slot);
                outcome.applied.push(slot);
                continue;
            };
            if &owner == claimer {
                continue;
            }
            let owner_epoch = self
                .nodes
                .get(&owner)
                .map(|n| n.config_epoch)
                .unwrap_or(0);
            let claimer_wins = claimer_epoch > owner_epoch
                || (claimer_epoch == owner_epoch && claimer > &owner);
            if claimer_wins {
                if owner == self.myself {
                    outcome.lost_by_myself.push(slot);
                }
                self.take_slot(claimer, slot);
                outcome.applied.push(slot);
            } else {
                outcome.sender_stale.push(slot);
            }
        }
        if !outcome.lost_by_myself.is_empty() {
            warn!(
                claimer = %claimer.as_str(),
                epoch = claimer_epoch,
                slots = outcome.lost_by_myself.len(),
                "lost slots to a higher-epoch claim"
            );
        }
        outcome
    }

    // ---- failure detection ----------------------------------------------

    /// Records a PFAIL/FAIL accusation. Reports are deduplicated per
    /// reporter; the freshest accusation wins.
    pub fn add_fail_report(&mut self, target: &NodeName, reporter: NodeName, now: u64) {
        let reports = self.fail_reports.entry(target.clone()).or_default();
        if let Some(existing) = reports.iter_mut().find(|r| r.reporter == reporter) {
            existing.time = now;
        } else {
            reports.push(FailReport {
                reporter,
                time: now,
            });
        }
    }

    /// Live accusations within the sliding window of `2 × node_timeout`.
    pub fn fail_report_count(&mut self, target: &NodeName, now: u64, node_timeout_ms: u64) -> usize {
        let window = node_timeout_ms.saturating_mul(2);
        let Some(reports) = self.fail_reports.get_mut(target) else {
            return 0;
        };
        reports.retain(|r| now.saturating_sub(r.time) <= window);
        reports.len()
    }

    /// Masters counted toward failure and election quorums. Arbiters are
    /// masters without data and do count here.
    pub fn known_master_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_master()).count()
    }

    /// Masters that own at least one slot — the electorate for failover.
    pub fn voting_master_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.is_master() && !n.slots.is_empty())
            .count()
    }

    /// Quorum rule: strictly more than half of known masters, the local
    /// reporter included implicitly via its own PFAIL mark.
    pub fn fail_quorum_reached(&mut self, target: &NodeName, now: u64, node_timeout_ms: u64) -> bool {
        let needed = self.known_master_count() / 2 + 1;
        // Count remote reports plus our own suspicion.
        let mut count = self.fail_report_count(target, now, node_timeout_ms);
        if self
            .lookup_node(target)
            .is_some_and(|n| n.flags.is_pfailing())
        {
            count += 1;
        }
        count >= needed
    }

    /// Marks a node FAIL and remembers when.
    pub fn mark_failing(&mut self, name: &NodeName, now: u64) {
        if let Some(node) = self.nodes.get_mut(name) {
            if !node.flags.is_failing() {
                warn!(node = %name.as_str(), "marking node FAIL");
                node.flags.unset(NodeFlags::PFAIL);
                node.flags.set(NodeFlags::FAIL);
                node.fail_time = now;
            }
        }
        self.fail_reports.remove(name);
    }

    /// Clears FAIL when the node is provably back: immediately for slaves
    /// and slotless masters, after `node_timeout × 10` of reachability for
    /// a slot-owning master that nobody replaced.
    pub fn clear_failure_if_needed(&mut self, name: &NodeName, now: u64, node_timeout_ms: u64) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if !node.flags.is_failing() {
            return;
        }
        let slotless = node.slots.is_empty();
        if node.flags.is_slave() || slotless {
            info!(node = %name.as_str(), "clearing FAIL (reachable slave/slotless)");
            node.flags.unset(NodeFlags::FAIL);
            node.fail_time = 0;
            return;
        }
        if now.saturating_sub(node.fail_time) > node_timeout_ms.saturating_mul(10) {
            info!(node = %name.as_str(), "clearing FAIL (no takeover happened)");
            node.flags.unset(NodeFlags::FAIL);
            node.fail_time = 0;
        }
    }

    // ---- role transitions ------------------------------------------------

    /// Turns myself back into a (slotless until claimed) master.
    pub fn set_myself_master(&mut self) {
        let node = self.myself_mut();
        node.flags.unset(NodeFlags::SLAVE);
        node.flags.set(NodeFlags::MASTER);
        node.master = None;
    }

    /// Makes myself a slave of `master`.
    pub fn set_myself_slave_of(&mut self, master: NodeName) -> Result<(), ClusterError> {
        if !self.nodes.contains_key(&master) {
            return Err(ClusterError::UnknownNode(master.as_str().to_string()));
        }
        let slots: Vec<u16> = self.myself().slots.iter().collect();
        for slot in slots {
            self.del_slot(slot);
        }
        let node = self.myself_mut();
        node.flags.unset(NodeFlags::MASTER);
        node.flags.set(NodeFlags::SLAVE);
        node.master = Some(master);
        Ok(())
    }

    /// Failover victory: myself (a slave) takes over every slot of its
    /// failed master with an epoch above any conflicting claim.
    pub fn promote_myself(&mut self) -> Result<(), ClusterError> {
        let old_master = self
            .myself()
            .master
            .clone()
            .ok_or(ClusterError::NotASlave)?;
        let slots: Vec<u16> = self
            .nodes
            .get(&old_master)
            .map(|n| n.slots.iter().collect())
            .unwrap_or_default();

        let epoch = self.bump_epoch();
        self.set_myself_master();
        self.myself_mut().config_epoch = epoch;
        let myself = self.myself.clone();
        for slot in slots {
            self.take_slot(&myself, slot);
        }
        // The old master, when it returns, follows the new one.
        if let Some(old) = self.nodes.get_mut(&old_master) {
            old.flags.unset(NodeFlags::MASTER);
            old.flags.set(NodeFlags::SLAVE);
            old.master = Some(myself.clone());
        }
        // Sibling slaves follow the promoted node as well.
        for node in self.nodes.values_mut() {
            if node.master.as_ref() == Some(&old_master) && node.name != myself {
                node.master = Some(myself.clone());
            }
        }
        info!(epoch, "promoted myself to master");
        Ok(())
    }

    /// Slaves of `master`, by name.
    pub fn slaves_of(&self, master: &NodeName) -> Vec<&ClusterNode> {
        self.nodes
            .values()
            .filter(|n| n.master.as_ref() == Some(master))
            .collect()
    }

    // ---- health & replies ------------------------------------------------

    pub fn health(&self) -> ClusterHealth {
        if !self.require_full_coverage {
            return ClusterHealth::Ok;
        }
        for slot in 0..CLUSTER_SLOTS {
            match self.node_for_slot(slot) {
                None => return ClusterHealth::Down,
                Some(owner) if owner.is_failing() => return ClusterHealth::Down,
                Some(_) => {}
            }
        }
        ClusterHealth::Ok
    }

    /// CLUSTER SLOTS rows, built in one pass over the 16384-entry table
    /// instead of one pass per master.
    pub fn cluster_slots_reply(&self) -> Vec<SlotsReplyEntry> {
        let mut out = Vec::new();
        let mut run: Option<(u16, u16, NodeName)> = None;

        let mut flush = |run: &mut Option<(u16, u16, NodeName)>, out: &mut Vec<SlotsReplyEntry>| {
            if let Some((start, end, owner)) = run.take() {
                let Some(master) = self.nodes.get(&owner) else {
                    return;
                };
                let replicas = self
                    .slaves_of(&owner)
                    .iter()
                    .filter(|s| !s.is_failing())
                    .map(|s| (s.ip.clone(), s.port, s.name.clone()))
                    .collect();
                out.push(SlotsReplyEntry {
                    start,
                    end,
                    master: (master.ip.clone(), master.port, owner),
                    replicas,
                });
            }
        };

        for slot in 0..CLUSTER_SLOTS {
            match (&mut run, self.slot_owner_name(slot)) {
                (Some((_, end, owner)), Some(cur)) if owner == cur && *end + 1 == slot => {
                    *end = slot;
                }
                (r, Some(cur)) => {
                    let cur = cur.clone();
                    flush(r, &mut out);
                    *r = Some((slot, slot, cur));
                }
                (r, None) => flush(r, &mut out),
            }
        }
        flush(&mut run, &mut out);
        out
    }

    /// CLUSTER INFO body.
    pub fn cluster_info(&self) -> String {
        let assigned = self.slot_owner.iter().filter(|o| o.is_some()).count();
        let size = self.voting_master_count();
        format!(
            "cluster_enabled:1\r\n\
             cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n",
            self.health(),
            assigned,
            self.nodes.len(),
            size,
            self.current_epoch,
            self.myself().config_epoch,
        )
    }

    fn node_line(&self, node: &ClusterNode) -> String {
        let master = node
            .master
            .as_ref()
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        let slots = node.slots.to_text();
        format!(
            "{} {}:{}@{} {} {} {} {} {} connected{}{}",
            node.name.as_str(),
            node.ip,
            node.port,
            node.cport,
            node.flags,
            master,
            node.ping_sent,
            node.pong_received,
            node.config_epoch,
            if slots.is_empty() { "" } else { " " },
            slots,
        )
    }

    /// CLUSTER NODES body: one line per node, sorted by name so output is
    /// stable across calls.
    pub fn cluster_nodes(&self) -> String {
        let mut nodes: Vec<&ClusterNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
            .iter()
            .map(|n| self.node_line(n))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ---- persistence -----------------------------------------------------

    /// Serializes the state in nodes.conf form. The same state always
    /// produces the same bytes.
    pub fn to_config_text(&self) -> String {
        let mut out = format!(
            "vars currentEpoch {} lastVoteEpoch {}\n",
            self.current_epoch, self.last_vote_epoch
        );
        let mut nodes: Vec<&ClusterNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        for node in nodes {
            out.push_str(&self.node_line(node));
            out.push('\n');
        }
        out
    }

    /// Restores state from nodes.conf text. The line flagged `myself` is
    /// the node's identity; gossip reconciles everything else afterwards.
    pub fn from_config_text(text: &str) -> Result<Self, ClusterError> {
        let mut current_epoch = 0;
        let mut last_vote_epoch = 0;
        let mut saw_vars = false;
        let mut parsed: Vec<ClusterNode> = Vec::new();
        let mut myself = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("vars ") {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() != 4 || parts[0] != "currentEpoch" || parts[2] != "lastVoteEpoch" {
                    return Err(ClusterError::BadConfigLine(line.to_string()));
                }
                current_epoch = parts[1]
                    .parse()
                    .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
                last_vote_epoch = parts[3]
                    .parse()
                    .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
                saw_vars = true;
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return Err(ClusterError::BadConfigLine(line.to_string()));
            }
            let name = NodeName::parse(parts[0])?;
            let (addr, cport_str) = parts[1]
                .split_once('@')
                .ok_or_else(|| ClusterError::BadConfigLine(line.to_string()))?;
            let (ip, port_str) = addr
                .rsplit_once(':')
                .ok_or_else(|| ClusterError::BadConfigLine(line.to_string()))?;
            let port = port_str
                .parse()
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
            let cport = cport_str
                .parse()
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
            let flags = parse_flags(parts[2]);
            let master = if parts[3] == "-" {
                None
            } else {
                Some(NodeName::parse(parts[3])?)
            };
            let ping_sent = parts[4]
                .parse()
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
            let pong_received = parts[5]
                .parse()
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
            let config_epoch = parts[6]
                .parse()
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;
            // parts[7] is the link state, always "connected" on disk.
            let slots_text = parts[8..].join(" ");
            let slots = SlotBitmap::from_text(&slots_text)
                .map_err(|_| ClusterError::BadConfigLine(line.to_string()))?;

            if flags.contains(NodeFlags::MYSELF) {
                myself = Some(name.clone());
            }
            parsed.push(ClusterNode {
                name,
                ip: ip.to_string(),
                port,
                cport,
                flags,
                config_epoch,
                slots,
                master,
                ping_sent,
                pong_received,
                fail_time: 0,
                repl_offset: 0,
            });
        }

        if !saw_vars {
            return Err(ClusterError::BadConfigLine("missing vars line".into()));
        }
        let myself = myself.ok_or(ClusterError::NoMyselfInConfig)?;

        let mut slot_owner: Vec<Option<NodeName>> = vec![None; CLUSTER_SLOTS as usize];
        let mut nodes = HashMap::new();
        for node in parsed {
            for slot in node.slots.iter() {
                slot_owner[slot as usize] = Some(node.name.clone());
            }
            nodes.insert(node.name.clone(), node);
        }

        Ok(Self {
            myself,
            current_epoch,
            last_vote_epoch,
            require_full_coverage: true,
            nodes,
            slot_owner,
            fail_reports: HashMap::new(),
        })
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("myself", &self.myself.as_str())
            .field("current_epoch", &self.current_epoch)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(seed: u8) -> NodeName {
        NodeName::parse(&format!("{:040x}", seed as u128)).unwrap()
    }

    fn master(seed: u8, port: u16) -> ClusterNode {
        ClusterNode::new_master(name(seed), "127.0.0.1".into(), port, port + 10000)
    }

    fn state_with_myself(seed: u8) -> ClusterState {
        ClusterState::new(master(seed, 16000))
    }

    #[test]
    fn node_name_validation() {
        assert!(NodeName::parse(&"a".repeat(40)).is_ok());
        assert!(NodeName::parse("short").is_err());
        assert!(NodeName::parse(&"z".repeat(40)).is_err());
        let n = NodeName::random();
        assert_eq!(n.as_str().len(), 40);
        assert!(NodeName::parse(n.as_str()).is_ok());
    }

    #[test]
    fn add_slot_rejects_taken() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let me = st.myself_name().clone();
        st.add_slot(&me, 100).unwrap();
        assert!(st.myself_owns(100));
        assert!(matches!(
            st.add_slot(&name(2), 100),
            Err(ClusterError::SlotBusy { slot: 100, .. })
        ));
        // Re-adding to the same owner is idempotent.
        st.add_slot(&me, 100).unwrap();
    }

    #[test]
    fn take_slot_moves_bitmaps() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let me = st.myself_name().clone();
        st.add_slot(&me, 5).unwrap();
        st.take_slot(&name(2), 5);
        assert!(!st.myself().slots.test(5));
        assert!(st.lookup_node(&name(2)).unwrap().slots.test(5));
        assert_eq!(st.slot_owner_name(5), Some(&name(2)));
    }

    #[test]
    fn higher_epoch_wins_claim() {
        let mut st = state_with_myself(1);
        let mut other = master(2, 16001);
        other.config_epoch = 5;
        st.add_node(other);
        let me = st.myself_name().clone();
        st.myself_mut().config_epoch = 3;
        st.add_slot(&me, 7).unwrap();

        let claim: SlotBitmap = [7u16].into_iter().collect();
        let outcome = st.apply_slot_claim(&name(2), 5, &claim);
        assert_eq!(outcome.applied, vec![7]);
        assert_eq!(outcome.lost_by_myself, vec![7]);
        assert_eq!(st.slot_owner_name(7), Some(&name(2)));
    }

    #[test]
    fn lower_epoch_claim_reports_stale_sender() {
        let mut st = state_with_myself(9);
        st.add_node(master(2, 16001));
        let me = st.myself_name().clone();
        st.myself_mut().config_epoch = 10;
        st.add_slot(&me, 7).unwrap();

        let claim: SlotBitmap = [7u16].into_iter().collect();
        let outcome = st.apply_slot_claim(&name(2), 4, &claim);
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.sender_stale, vec![7]);
        assert!(st.myself_owns(7));
    }

    #[test]
    fn equal_epoch_tie_breaks_by_name() {
        // name(2) < name(9): claimer 9 beats owner 2 at equal epoch.
        let mut st = state_with_myself(2);
        st.add_node(master(9, 16001));
        let me = st.myself_name().clone();
        st.myself_mut().config_epoch = 4;
        st.lookup_node_mut(&name(9)).unwrap().config_epoch = 4;
        st.add_slot(&me, 3).unwrap();

        let claim: SlotBitmap = [3u16].into_iter().collect();
        let outcome = st.apply_slot_claim(&name(9), 4, &claim);
        assert_eq!(outcome.applied, vec![3]);

        // The reverse direction loses.
        let claim2: SlotBitmap = [3u16].into_iter().collect();
        let outcome2 = st.apply_slot_claim(&me, 4, &claim2);
        assert_eq!(outcome2.sender_stale, vec![3]);
    }

    #[test]
    fn collision_bump_only_for_smaller_name() {
        let mut st = state_with_myself(2);
        st.myself_mut().config_epoch = 4;
        st.current_epoch = 4;
        assert!(st.collision_bump_if_needed(&name(9), 4));
        assert_eq!(st.myself().config_epoch, 5);
        // Already above; the larger name never yields.
        let mut st2 = state_with_myself(9);
        st2.myself_mut().config_epoch = 4;
        assert!(!st2.collision_bump_if_needed(&name(2), 4));
    }

    #[test]
    fn fail_quorum_counts_majority_of_masters() {
        let mut st = state_with_myself(1);
        for seed in 2..=5u8 {
            st.add_node(master(seed, 16000 + seed as u16));
        }
        // 5 masters known; quorum needs 3 reporters.
        let target = name(5);
        st.lookup_node_mut(&target)
            .unwrap()
            .flags
            .set(NodeFlags::PFAIL);
        assert!(!st.fail_quorum_reached(&target, 1000, 15000));
        st.add_fail_report(&target, name(2), 1000);
        assert!(!st.fail_quorum_reached(&target, 1000, 15000));
        st.add_fail_report(&target, name(3), 1000);
        assert!(st.fail_quorum_reached(&target, 1000, 15000));
    }

    #[test]
    fn fail_reports_expire_outside_window() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let target = name(2);
        st.add_fail_report(&target, name(3), 1000);
        assert_eq!(st.fail_report_count(&target, 1000, 15000), 1);
        // 2 × node_timeout later the report is gone.
        assert_eq!(st.fail_report_count(&target, 32_000, 15000), 0);
    }

    #[test]
    fn duplicate_reporter_not_double_counted() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let target = name(2);
        st.add_fail_report(&target, name(3), 1000);
        st.add_fail_report(&target, name(3), 2000);
        assert_eq!(st.fail_report_count(&target, 2000, 15000), 1);
    }

    #[test]
    fn clear_failure_slave_immediately() {
        let mut st = state_with_myself(1);
        let mut slave = master(2, 16001);
        slave.flags.unset(NodeFlags::MASTER);
        slave.flags.set(NodeFlags::SLAVE);
        st.add_node(slave);
        st.mark_failing(&name(2), 1000);
        assert!(st.lookup_node(&name(2)).unwrap().is_failing());
        st.clear_failure_if_needed(&name(2), 1500, 15000);
        assert!(!st.lookup_node(&name(2)).unwrap().is_failing());
    }

    #[test]
    fn clear_failure_master_waits() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        st.take_slot(&name(2), 9);
        st.mark_failing(&name(2), 1000);
        st.clear_failure_if_needed(&name(2), 2000, 15000);
        assert!(st.lookup_node(&name(2)).unwrap().is_failing());
        st.clear_failure_if_needed(&name(2), 1000 + 150_001, 15000);
        assert!(!st.lookup_node(&name(2)).unwrap().is_failing());
    }

    #[test]
    fn promote_myself_takes_over() {
        let mut st = state_with_myself(3);
        let mut old = master(7, 16001);
        old.config_epoch = 2;
        st.add_node(old);
        for slot in [1u16, 2, 3] {
            st.take_slot(&name(7), slot);
        }
        st.current_epoch = 2;
        st.set_myself_slave_of(name(7)).unwrap();
        st.promote_myself().unwrap();

        assert!(st.myself().is_master());
        assert!(st.myself().config_epoch > 2);
        for slot in [1u16, 2, 3] {
            assert!(st.myself_owns(slot));
        }
        let old = st.lookup_node(&name(7)).unwrap();
        assert!(old.flags.is_slave());
        assert_eq!(old.master.as_ref(), Some(st.myself_name()));
    }

    #[test]
    fn health_tracks_coverage_and_fail() {
        let mut st = state_with_myself(1);
        assert_eq!(st.health(), ClusterHealth::Down);
        let me = st.myself_name().clone();
        for slot in 0..CLUSTER_SLOTS {
            st.take_slot(&me, slot);
        }
        assert_eq!(st.health(), ClusterHealth::Ok);

        st.require_full_coverage = false;
        st.del_slot(0);
        assert_eq!(st.health(), ClusterHealth::Ok);
        st.require_full_coverage = true;
        assert_eq!(st.health(), ClusterHealth::Down);
    }

    #[test]
    fn slots_reply_groups_runs_single_scan() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let me = st.myself_name().clone();
        for slot in 0..=8000u16 {
            st.take_slot(&me, slot);
        }
        for slot in 8001..CLUSTER_SLOTS {
            st.take_slot(&name(2), slot);
        }
        let reply = st.cluster_slots_reply();
        assert_eq!(reply.len(), 2);
        assert_eq!((reply[0].start, reply[0].end), (0, 8000));
        assert_eq!(reply[0].master.2, me);
        assert_eq!((reply[1].start, reply[1].end), (8001, 16383));
        assert_eq!(reply[1].master.2, name(2));
    }

    #[test]
    fn slots_reply_includes_replicas() {
        let mut st = state_with_myself(1);
        let me = st.myself_name().clone();
        st.take_slot(&me, 0);
        let mut slave = master(4, 16002);
        slave.flags.unset(NodeFlags::MASTER);
        slave.flags.set(NodeFlags::SLAVE);
        slave.master = Some(me.clone());
        st.add_node(slave);

        let reply = st.cluster_slots_reply();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].replicas.len(), 1);
        assert_eq!(reply[0].replicas[0].2, name(4));
    }

    #[test]
    fn config_text_roundtrip() {
        let mut st = state_with_myself(1);
        let mut peer = master(2, 16001);
        peer.config_epoch = 7;
        st.add_node(peer);
        let me = st.myself_name().clone();
        for slot in 0..=100u16 {
            st.take_slot(&me, slot);
        }
        st.take_slot(&name(2), 9000);
        st.current_epoch = 9;
        st.last_vote_epoch = 7;

        let text = st.to_config_text();
        let restored = ClusterState::from_config_text(&text).unwrap();

        assert_eq!(restored.myself_name(), st.myself_name());
        assert_eq!(restored.current_epoch, 9);
        assert_eq!(restored.last_vote_epoch, 7);
        assert_eq!(restored.node_count(), 2);
        assert!(restored.myself_owns(100));
        assert_eq!(restored.slot_owner_name(9000), Some(&name(2)));
        // Stability: serializing again is byte-identical.
        assert_eq!(restored.to_config_text(), text);
    }

    #[test]
    fn config_text_rejects_garbage() {
        assert!(ClusterState::from_config_text("").is_err());
        assert!(ClusterState::from_config_text("vars currentEpoch x lastVoteEpoch 0\n").is_err());
        // No myself line.
        let text = format!(
            "vars currentEpoch 0 lastVoteEpoch 0\n{} 127.0.0.1:1@2 master - 0 0 0 connected\n",
            "a".repeat(40)
        );
        assert!(matches!(
            ClusterState::from_config_text(&text),
            Err(ClusterError::NoMyselfInConfig)
        ));
    }

    #[test]
    fn remove_node_clears_all_traces() {
        let mut st = state_with_myself(1);
        st.add_node(master(2, 16001));
        let mut slave = master(3, 16002);
        slave.flags.unset(NodeFlags::MASTER);
        slave.flags.set(NodeFlags::SLAVE);
        slave.master = Some(name(2));
        st.add_node(slave);
        st.take_slot(&name(2), 11);
        st.add_fail_report(&name(2), name(3), 5);

        st.remove_node(&name(2));
        assert!(st.lookup_node(&name(2)).is_none());
        assert_eq!(st.slot_owner_name(11), None);
        assert_eq!(st.lookup_node(&name(3)).unwrap().master, None);
    }
}
