//! Failover: automatic slave election and operator-driven handoff.
//!
//! When a slave's master is marked FAIL, the slave schedules an election
//! attempt at `now + 500ms + jitter + rank × 1s`, where rank orders the
//! siblings by replication offset — the most up-to-date replica fires
//! first. The attempt bumps `currentEpoch`, broadcasts a vote request, and
//! wins on strictly more than half of the slot-owning masters (arbiters
//! included). Masters vote at most once per epoch; the grant is persisted
//! via `lastVoteEpoch` so a restart cannot double-vote.
//!
//! Manual failover (`CLUSTER FAILOVER`) runs the same election with the
//! force flag once the master has paused writes and the offsets match;
//! `TAKEOVER` skips voting entirely.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::gossip::{GossipEngine, Outbound};
use crate::message::{ClusterMsg, MsgData, MsgHeader, MsgType, MFLAG0_FORCEACK, MFLAG0_PAUSED};
use crate::topology::{ClusterState, NodeFlags, NodeName};

/// Failover timing and eligibility knobs.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub node_timeout_ms: u64,
    /// `cluster-slave-validity-factor`: data-age multiplier.
    pub slave_validity_factor: u64,
    /// How often a slave expects replication pings from its master.
    pub repl_ping_slave_period_ms: u64,
    /// `cluster-slave-no-failover`: never start automatic elections.
    pub no_failover: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 15_000,
            slave_validity_factor: 10,
            repl_ping_slave_period_ms: 10_000,
            no_failover: false,
        }
    }
}

/// Where an election attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    /// Nothing in progress.
    None,
    /// Attempt scheduled or vote request in flight.
    AuthorizeAsk,
    /// Quorum granted; promotion underway.
    AuthorizeOk,
    /// Promotion applied locally, announcing to the cluster.
    ReplicaAck,
    /// Election won and announced.
    Victory,
    /// Attempt expired without quorum; a retry is scheduled.
    Failed,
}

/// A slave refuses promotion when its replication stream has been silent
/// longer than `node_timeout × validity_factor + repl_ping_period`.
///
/// A factor of zero disables the check.
pub fn is_data_age_too_large(
    now: u64,
    last_repl_interaction: u64,
    node_timeout_ms: u64,
    validity_factor: u64,
    repl_ping_period_ms: u64,
) -> bool {
    if validity_factor == 0 {
        return false;
    }
    let age = now.saturating_sub(last_repl_interaction);
    age > node_timeout_ms
        .saturating_mul(validity_factor)
        .saturating_add(repl_ping_period_ms)
}

/// Rank among sibling replicas: how many have a strictly higher offset.
/// Lower rank fires earlier.
pub fn election_rank(state: &ClusterState, my_offset: u64) -> u64 {
    let Some(master) = state.myself().master.clone() else {
        return 0;
    };
    state
        .slaves_of(&master)
        .iter()
        .filter(|s| &s.name != state.myself_name() && s.repl_offset > my_offset)
        .count() as u64
}

/// Master-side pause state for a manual failover in progress.
#[derive(Debug, Clone)]
struct MfMaster {
    slave: NodeName,
    paused_until: u64,
}

/// Slave-side manual failover tracking.
#[derive(Debug, Clone)]
struct MfSlave {
    deadline: u64,
    /// Set once the master confirmed the pause; election may start when
    /// offsets match.
    master_paused: bool,
    master_offset: u64,
}

/// The failover controller. One per node; the bus dispatcher routes
/// AUTH_REQUEST/AUTH_ACK/MFSTART frames here.
pub struct FailoverCtl {
    state: Arc<RwLock<ClusterState>>,
    config: FailoverConfig,
    phase: FailoverPhase,
    /// When the scheduled vote request fires (0 = not scheduled).
    auth_time: u64,
    /// Attempt expiry; reaching it without quorum fails the attempt.
    auth_deadline: u64,
    /// Epoch this attempt is contesting.
    auth_epoch: u64,
    votes: HashSet<NodeName>,
    /// Retry back-off, doubling up to [`Self::MAX_RETRY_DELAY_MS`].
    retry_delay_ms: u64,
    force: bool,
    mf_master: Option<MfMaster>,
    mf_slave: Option<MfSlave>,
}

impl FailoverCtl {
    const MAX_RETRY_DELAY_MS: u64 = 4_000;

    pub fn new(state: Arc<RwLock<ClusterState>>, config: FailoverConfig) -> Self {
        Self {
            state,
            config,
            phase: FailoverPhase::None,
            auth_time: 0,
            auth_deadline: 0,
            auth_epoch: 0,
            votes: HashSet::new(),
            retry_delay_ms: 0,
            force: false,
            mf_master: None,
            mf_slave: None,
        }
    }

    pub fn phase(&self) -> FailoverPhase {
        self.phase
    }

    /// True while this master holds writes for a manual failover handoff.
    pub fn writes_paused(&self, now: u64) -> bool {
        self.mf_master
            .as_ref()
            .is_some_and(|mf| now < mf.paused_until)
    }

    fn reset_attempt(&mut self) {
        self.phase = FailoverPhase::None;
        self.auth_time = 0;
        self.auth_deadline = 0;
        self.votes.clear();
        self.force = false;
    }

    fn schedule_attempt(&mut self, now: u64, rank: u64) {
        let jitter: u64 = rand::rng().random_range(0..500);
        self.auth_time = now + 500 + jitter + rank * 1_000 + self.retry_delay_ms;
        self.auth_deadline = 0;
        self.votes.clear();
        self.phase = FailoverPhase::AuthorizeAsk;
        debug!(
            in_ms = self.auth_time - now,
            rank, "failover attempt scheduled"
        );
    }

    /// Drives the slave-side election. Called from the control loop.
    pub fn tick(&mut self, now: u64, my_repl_offset: u64, last_repl_interaction: u64) -> Vec<Outbound> {
        let mut out = Vec::new();
        let state_arc = self.state.clone();
        let mut state = state_arc.write().unwrap();

        let myself_is_slave = state.myself().flags.is_slave();
        let master_failing = state
            .myself()
            .master
            .as_ref()
            .and_then(|m| state.lookup_node(m))
            .is_some_and(|m| m.is_failing());

        // Manual failover: once the master paused and we caught up, force.
        let mf_ready = self.mf_slave.as_ref().is_some_and(|mf| {
            if now > mf.deadline {
                return false;
            }
            mf.master_paused && my_repl_offset >= mf.master_offset
        });
        let mf_expired = self.mf_slave.as_ref().is_some_and(|mf| now > mf.deadline);
        if mf_expired {
            warn!("manual failover timed out, rolling back");
            self.mf_slave = None;
            self.reset_attempt();
        }

        if !myself_is_slave || (!master_failing && !mf_ready && self.mf_slave.is_none()) {
            if self.phase != FailoverPhase::None && self.phase != FailoverPhase::Victory {
                self.reset_attempt();
            }
            return out;
        }
        if self.config.no_failover && self.mf_slave.is_none() {
            return out;
        }

        match self.phase {
            FailoverPhase::None | FailoverPhase::Failed => {
                if master_failing {
                    // Stale replicas stay out of automatic elections.
                    if !self.force
                        && is_data_age_too_large(
                            now,
                            last_repl_interaction,
                            self.config.node_timeout_ms,
                            self.config.slave_validity_factor,
                            self.config.repl_ping_slave_period_ms,
                        )
                    {
                        debug!("data age too large, refusing election");
                        return out;
                    }
                    let rank = election_rank(&state, my_repl_offset);
                    self.schedule_attempt(now, rank);
                } else if mf_ready {
                    self.force = true;
                    self.schedule_attempt(now, 0);
                }
            }
            FailoverPhase::AuthorizeAsk => {
                if self.auth_deadline == 0 && now >= self.auth_time {
                    // Fire the vote request.
                    let epoch = state.bump_epoch();
                    self.auth_epoch = epoch;
                    self.auth_deadline = now + 2 * self.config.node_timeout_ms;
                    let mut header = GossipEngine::build_header(&state, my_repl_offset);
                    header.current_epoch = epoch;
                    if self.force || mf_ready {
                        header.mflags[0] |= MFLAG0_FORCEACK;
                    }
                    let req = ClusterMsg {
                        mtype: MsgType::AuthRequest,
                        header,
                        data: MsgData::Empty,
                    };
                    let masters: Vec<String> = state
                        .nodes()
                        .filter(|n| n.is_master() && &n.name != state.myself_name())
                        .map(|n| format!("{}:{}", n.ip, n.cport))
                        .collect();
                    info!(epoch, voters = masters.len(), "requesting failover votes");
                    for addr in masters {
                        out.push((addr, req.clone()));
                    }
                } else if self.auth_deadline != 0 && now >= self.auth_deadline {
                    // Expired without quorum: back off and retry.
                    self.retry_delay_ms = (self.retry_delay_ms.max(500) * 2)
                        .min(Self::MAX_RETRY_DELAY_MS);
                    warn!(
                        retry_ms = self.retry_delay_ms,
                        "election expired without quorum"
                    );
                    self.phase = FailoverPhase::Failed;
                    let rank = election_rank(&state, my_repl_offset);
                    self.schedule_attempt(now, rank);
                }
            }
            FailoverPhase::AuthorizeOk | FailoverPhase::ReplicaAck | FailoverPhase::Victory => {}
        }
        out
    }

    /// Master side: evaluates a vote request. Returns the ACK to send when
    /// the vote is granted.
    pub fn handle_auth_request(&mut self, msg: &ClusterMsg, now: u64) -> Option<Outbound> {
        let header = &msg.header;
        let mut state = self.state.write().unwrap();
        state.observe_epoch(header.current_epoch);

        // Only masters with a stake vote: slot owners and arbiters.
        let myself = state.myself();
        if !myself.is_master() || (myself.slots.is_empty() && !myself.flags.is_arbiter()) {
            return None;
        }

        // One vote per epoch, across restarts.
        if state.last_vote_epoch >= header.current_epoch {
            debug!(
                requested = header.current_epoch,
                last_vote = state.last_vote_epoch,
                "refusing vote: already voted at this epoch"
            );
            return None;
        }

        let requester = state.lookup_node(&header.sender)?;
        if !requester.flags.is_slave() {
            return None;
        }
        let failed_master = requester.master.clone()?;
        let force = header.mflags[0] & MFLAG0_FORCEACK != 0;
        let master_node = state.lookup_node(&failed_master)?;
        if !master_node.is_failing() && !force {
            debug!(master = %failed_master, "refusing vote: master not FAIL");
            return None;
        }

        // Refuse when any of the claimed slots is already owned at a higher
        // configEpoch than the failed master's claim.
        let claim_epoch = master_node.config_epoch;
        let covered_higher = master_node
            .slots
            .iter()
            .filter_map(|slot| state.node_for_slot(slot))
            .any(|owner| owner.name != failed_master && owner.config_epoch > claim_epoch);
        if covered_higher {
            debug!("refusing vote: slots covered by a newer claim");
            return None;
        }

        state.last_vote_epoch = header.current_epoch;
        info!(slave = %header.sender, epoch = header.current_epoch, "granting failover vote");
        let mut ack_header = GossipEngine::build_header(&state, 0);
        ack_header.current_epoch = header.current_epoch;
        Some((
            format!("{}:{}", header.my_ip, header.cport),
            ClusterMsg {
                mtype: MsgType::AuthAck,
                header: ack_header,
                data: MsgData::Empty,
            },
        ))
    }

    /// Slave side: counts one ACK. On quorum, promotes and returns the
    /// victory announcement (a PONG to every known node).
    pub fn handle_auth_ack(&mut self, msg: &ClusterMsg, _now: u64) -> Vec<Outbound> {
        let header = &msg.header;
        let state_arc = self.state.clone();
        let mut state = state_arc.write().unwrap();
        state.observe_epoch(header.current_epoch);

        if self.phase != FailoverPhase::AuthorizeAsk || header.current_epoch < self.auth_epoch {
            return Vec::new();
        }
        let voter_ok = state
            .lookup_node(&header.sender)
            .is_some_and(|n| n.is_master() && (!n.slots.is_empty() || n.flags.is_arbiter()));
        if !voter_ok {
            return Vec::new();
        }
        self.votes.insert(header.sender.clone());

        let electorate = state
            .nodes()
            .filter(|n| n.is_master() && (!n.slots.is_empty() || n.flags.is_arbiter()))
            .count();
        let needed = electorate / 2 + 1;
        debug!(votes = self.votes.len(), needed, "vote recorded");
        if self.votes.len() < needed {
            return Vec::new();
        }

        self.phase = FailoverPhase::AuthorizeOk;
        if let Err(e) = state.promote_myself() {
            warn!(error = %e, "promotion failed after winning election");
            self.reset_attempt();
            return Vec::new();
        }
        self.phase = FailoverPhase::Victory;
        self.retry_delay_ms = 0;
        self.mf_slave = None;
        info!(epoch = state.current_epoch, "failover complete, announcing");

        // Announce the takeover so every node adopts the new claim.
        let pong = ClusterMsg {
            mtype: MsgType::Pong,
            header: GossipEngine::build_header(&state, 0),
            data: MsgData::Gossip(vec![]),
        };
        state
            .nodes()
            .filter(|n| &n.name != state.myself_name())
            .map(|n| (format!("{}:{}", n.ip, n.cport), pong.clone()))
            .collect()
    }

    /// Master side: a slave asked for a manual failover handoff. Pause
    /// writes and tell the slave where the log ends.
    pub fn handle_mfstart(&mut self, msg: &ClusterMsg, now: u64, my_repl_offset: u64) -> Option<Outbound> {
        let header = &msg.header;
        let state = self.state.read().unwrap();
        if !state.myself().is_master() {
            return None;
        }
        // One handoff at a time; a second slave must wait the pause out.
        if let Some(mf) = &self.mf_master {
            if now < mf.paused_until && mf.slave != header.sender {
                return None;
            }
        }
        let slave = state.lookup_node(&header.sender)?;
        if slave.master.as_ref() != Some(state.myself_name()) {
            return None;
        }
        info!(slave = %header.sender, "manual failover: pausing writes");
        self.mf_master = Some(MfMaster {
            slave: header.sender.clone(),
            paused_until: now + 2 * self.config.node_timeout_ms,
        });
        let mut reply_header = GossipEngine::build_header(&state, my_repl_offset);
        reply_header.mflags[0] |= MFLAG0_PAUSED;
        Some((
            format!("{}:{}", header.my_ip, header.cport),
            ClusterMsg {
                mtype: MsgType::MfStart,
                header: reply_header,
                data: MsgData::Empty,
            },
        ))
    }

    /// Slave side: the master acknowledged MFSTART (paused, offset in
    /// header).
    pub fn handle_mfstart_ack(&mut self, msg: &ClusterMsg) {
        if let Some(mf) = &mut self.mf_slave {
            if msg.header.mflags[0] & MFLAG0_PAUSED != 0 {
                mf.master_paused = true;
                mf.master_offset = msg.header.offset;
                debug!(offset = mf.master_offset, "manual failover: master paused");
            }
        }
    }

    /// Operator entry point for `CLUSTER FAILOVER [FORCE|TAKEOVER]`.
    ///
    /// Returns the MFSTART to send for the default coordinated form, or the
    /// announcement frames when TAKEOVER promotes immediately.
    pub fn start_manual(
        &mut self,
        now: u64,
        force: bool,
        takeover: bool,
    ) -> Result<Vec<Outbound>, crate::ClusterError> {
        let mut state = self.state.write().unwrap();
        if !state.myself().flags.is_slave() {
            return Err(crate::ClusterError::NotASlave);
        }
        let master = state
            .myself()
            .master
            .clone()
            .ok_or(crate::ClusterError::NotASlave)?;

        if takeover {
            // No agreement: bump past everyone and claim.
            state.promote_myself()?;
            info!("manual failover TAKEOVER complete");
            self.phase = FailoverPhase::Victory;
            let pong = ClusterMsg {
                mtype: MsgType::Pong,
                header: GossipEngine::build_header(&state, 0),
                data: MsgData::Gossip(vec![]),
            };
            return Ok(state
                .nodes()
                .filter(|n| &n.name != state.myself_name())
                .map(|n| (format!("{}:{}", n.ip, n.cport), pong.clone()))
                .collect());
        }

        if force {
            // Skip the handshake with the (presumably dead) master.
            self.force = true;
            self.mf_slave = Some(MfSlave {
                deadline: now + 2 * self.config.node_timeout_ms,
                master_paused: true,
                master_offset: 0,
            });
            return Ok(Vec::new());
        }

        let master_node = state
            .lookup_node(&master)
            .ok_or_else(|| crate::ClusterError::UnknownNode(master.as_str().to_string()))?;
        self.mf_slave = Some(MfSlave {
            deadline: now + 2 * self.config.node_timeout_ms,
            master_paused: false,
            master_offset: 0,
        });
        info!(master = %master, "manual failover: sending MFSTART");
        let header = GossipEngine::build_header(&state, 0);
        Ok(vec![(
            format!("{}:{}", master_node.ip, master_node.cport),
            ClusterMsg {
                mtype: MsgType::MfStart,
                header,
                data: MsgData::Empty,
            },
        )])
    }
}
