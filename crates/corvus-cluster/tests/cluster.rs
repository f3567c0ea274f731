//! Multi-node cluster scenarios driven over an in-memory bus.
//!
//! Each simulated node owns real engine instances (gossip + failover) and
//! a shared ClusterState; the harness routes outbound frames by bus
//! address and advances a fake millisecond clock in 100 ms ticks, exactly
//! like the server's control loop.

use std::sync::{Arc, RwLock};

use corvus_cluster::{
    ClusterHealth, ClusterMsg, ClusterNode, ClusterState, FailoverConfig, FailoverCtl,
    GossipConfig, GossipEngine, MsgType, NodeFlags, NodeName, Outbound, CLUSTER_SLOTS,
};
use tokio::sync::mpsc;

const NODE_TIMEOUT_MS: u64 = 2_000;

fn name(seed: u8) -> NodeName {
    NodeName::parse(&format!("{:040x}", seed as u128)).unwrap()
}

fn master(seed: u8) -> ClusterNode {
    let port = 16000 + seed as u16;
    ClusterNode::new_master(name(seed), "127.0.0.1".into(), port, port + 10000)
}

struct SimNode {
    addr: String,
    state: Arc<RwLock<ClusterState>>,
    gossip: GossipEngine,
    failover: FailoverCtl,
    alive: bool,
    _events: mpsc::Receiver<corvus_cluster::ClusterEvent>,
}

impl SimNode {
    fn new(state: ClusterState) -> Self {
        let addr = {
            let me = state.myself();
            format!("{}:{}", me.ip, me.cport)
        };
        let state = Arc::new(RwLock::new(state));
        let (tx, rx) = mpsc::channel(1024);
        let gossip = GossipEngine::new(
            Arc::clone(&state),
            GossipConfig {
                node_timeout_ms: NODE_TIMEOUT_MS,
                ..GossipConfig::default()
            },
            tx,
        );
        let failover = FailoverCtl::new(
            Arc::clone(&state),
            FailoverConfig {
                node_timeout_ms: NODE_TIMEOUT_MS,
                ..FailoverConfig::default()
            },
        );
        Self {
            addr,
            state,
            gossip,
            failover,
            alive: true,
            _events: rx,
        }
    }

    fn handle(&mut self, msg: &ClusterMsg, now: u64) -> Vec<Outbound> {
        match msg.mtype {
            MsgType::AuthRequest => self
                .failover
                .handle_auth_request(msg, now)
                .into_iter()
                .collect(),
            MsgType::AuthAck => self.failover.handle_auth_ack(msg, now),
            MsgType::MfStart => Vec::new(),
            _ => self.gossip.handle_message(msg, "127.0.0.1", now, 0),
        }
    }
}

/// Advances the cluster by `steps` ticks of 100 ms, delivering every frame
/// produced along the way. Returns the final clock value.
fn run_cluster(nodes: &mut [SimNode], start: u64, steps: usize) -> u64 {
    let mut now = start;
    for _ in 0..steps {
        now += 100;
        let mut pending: Vec<Outbound> = Vec::new();
        for node in nodes.iter_mut() {
            if !node.alive {
                continue;
            }
            pending.extend(node.gossip.tick(now, 0));
            // Replication is healthy in these scenarios: the data-age clock
            // always reads fresh.
            pending.extend(node.failover.tick(now, 0, now));
        }

        // Deliver until quiet; a bound guards against ping-pong storms.
        let mut hops = 0;
        while let Some((addr, msg)) = pending.pop() {
            hops += 1;
            if hops > 10_000 {
                panic!("message storm: delivery did not settle");
            }
            let Some(target) = nodes.iter_mut().find(|n| n.addr == addr) else {
                continue;
            };
            if !target.alive {
                continue;
            }
            pending.extend(target.handle(&msg, now));
        }
    }
    now
}

/// A fully-meshed cluster where every node already knows every other,
/// with roles and slots as given.
fn build_cluster(masters: &[(u8, Option<(u16, u16)>)], slaves: &[(u8, u8)]) -> Vec<SimNode> {
    let mut all_nodes: Vec<ClusterNode> = Vec::new();
    for (seed, _) in masters {
        let mut node = master(*seed);
        node.config_epoch = *seed as u64;
        all_nodes.push(node);
    }
    for (seed, master_seed) in slaves {
        let mut node = master(*seed);
        node.flags.unset(NodeFlags::MASTER);
        node.flags.set(NodeFlags::SLAVE);
        node.master = Some(name(*master_seed));
        all_nodes.push(node);
    }

    let mut sims = Vec::new();
    for me in &all_nodes {
        let mut state = ClusterState::new(me.clone());
        for other in &all_nodes {
            if other.name != me.name {
                state.add_node(other.clone());
            }
        }
        for (seed, range) in masters {
            if let Some((start, end)) = range {
                let owner = name(*seed);
                for slot in *start..=*end {
                    state.take_slot(&owner, slot);
                }
            }
        }
        state.current_epoch = masters.iter().map(|(s, _)| *s as u64).max().unwrap_or(0);
        sims.push(SimNode::new(state));
    }
    sims
}

#[test]
fn meet_converges_to_full_membership() {
    // Three fresh nodes; node 0 is told to meet the other two, as CLUSTER
    // MEET would do.
    let start = 100_000;
    let mut nodes: Vec<SimNode> = (1..=3u8)
        .map(|seed| SimNode::new(ClusterState::new(master(seed))))
        .collect();
    {
        let mut st = nodes[0].state.write().unwrap();
        st.add_node(ClusterNode::new_handshake(
            "127.0.0.1".into(),
            16002,
            26002,
            start,
        ));
        st.add_node(ClusterNode::new_handshake(
            "127.0.0.1".into(),
            16003,
            26003,
            start,
        ));
    }

    run_cluster(&mut nodes, start, 600);

    for node in &nodes {
        let st = node.state.read().unwrap();
        assert_eq!(
            st.node_count(),
            3,
            "node {} sees {} nodes",
            st.myself_name(),
            st.node_count()
        );
        // Handshakes fully resolved: every known node has a real name.
        for seed in 1..=3u8 {
            assert!(st.lookup_node(&name(seed)).is_some());
        }
        for n in st.nodes() {
            assert!(!n.flags.contains(NodeFlags::HANDSHAKE));
        }
    }
}

#[test]
fn addslots_partition_propagates() {
    // Node 1 claims 0..8000, node 2 claims 8001..16383 — each only in its
    // own view, then gossip reconciles.
    let mut nodes = build_cluster(&[(1, None), (2, None)], &[]);
    {
        let mut st = nodes[0].state.write().unwrap();
        let me = st.myself_name().clone();
        for slot in 0..=8000u16 {
            st.take_slot(&me, slot);
        }
        let epoch = st.bump_epoch();
        st.myself_mut().config_epoch = epoch;
    }
    {
        let mut st = nodes[1].state.write().unwrap();
        let me = st.myself_name().clone();
        for slot in 8001..CLUSTER_SLOTS {
            st.take_slot(&me, slot);
        }
        let epoch = st.bump_epoch();
        st.myself_mut().config_epoch = epoch;
    }

    run_cluster(&mut nodes, 100_000, 400);

    for node in &nodes {
        let st = node.state.read().unwrap();
        let reply = st.cluster_slots_reply();
        assert_eq!(reply.len(), 2, "expected two contiguous ranges");
        assert_eq!((reply[0].start, reply[0].end), (0, 8000));
        assert_eq!(reply[0].master.2, name(1));
        assert_eq!((reply[1].start, reply[1].end), (8001, 16383));
        assert_eq!(reply[1].master.2, name(2));
        assert_eq!(st.health(), ClusterHealth::Ok);
    }
}

#[test]
fn automatic_failover_promotes_best_slave() {
    // Masters 1..3 split the slot space; slaves 4→1 and 5→2. Master 1
    // dies; slave 4 must take over its slots.
    let third = CLUSTER_SLOTS / 3;
    let mut nodes = build_cluster(
        &[
            (1, Some((0, third - 1))),
            (2, Some((third, 2 * third - 1))),
            (3, Some((2 * third, CLUSTER_SLOTS - 1))),
        ],
        &[(4, 1), (5, 2)],
    );

    // Everyone has heard from everyone recently.
    let start = 100_000;
    for node in nodes.iter_mut() {
        let mut st = node.state.write().unwrap();
        let names: Vec<NodeName> = st.nodes().map(|n| n.name.clone()).collect();
        for n in names {
            st.lookup_node_mut(&n).unwrap().pong_received = start;
        }
    }

    nodes[0].alive = false;
    run_cluster(&mut nodes, start, 300);

    // The survivors agree: node 4 is a master owning node 1's old slots.
    for node in nodes.iter().filter(|n| n.alive) {
        let st = node.state.read().unwrap();
        let promoted = st.lookup_node(&name(4)).expect("node 4 known");
        assert!(
            promoted.flags.is_master(),
            "node {} still sees node 4 as {}",
            st.myself_name(),
            promoted.flags
        );
        assert_eq!(st.slot_owner_name(0), Some(&name(4)));
        assert_eq!(st.slot_owner_name(third - 1), Some(&name(4)));
        // Untouched shards keep their owners.
        assert_eq!(st.slot_owner_name(third), Some(&name(2)));
        assert_eq!(st.slot_owner_name(CLUSTER_SLOTS - 1), Some(&name(3)));
        assert_eq!(st.health(), ClusterHealth::Ok, "cluster must return to OK");
    }
}

#[test]
fn topology_survives_save_and_restore() {
    let third = CLUSTER_SLOTS / 3;
    let nodes = build_cluster(
        &[
            (1, Some((0, third - 1))),
            (2, Some((third, 2 * third - 1))),
            (3, Some((2 * third, CLUSTER_SLOTS - 1))),
        ],
        &[(4, 1), (5, 2), (6, 3)],
    );

    for node in &nodes {
        let st = node.state.read().unwrap();
        let captured: Vec<(String, String)> = {
            let mut rows: Vec<_> = st
                .nodes()
                .map(|n| (n.name.as_str().to_string(), n.slots.to_text()))
                .collect();
            rows.sort();
            rows
        };
        let text = st.to_config_text();

        let restored = ClusterState::from_config_text(&text).unwrap();
        let restored_rows: Vec<(String, String)> = {
            let mut rows: Vec<_> = restored
                .nodes()
                .map(|n| (n.name.as_str().to_string(), n.slots.to_text()))
                .collect();
            rows.sort();
            rows
        };

        assert_eq!(captured, restored_rows);
        assert_eq!(restored.myself_name(), st.myself_name());
        assert_eq!(restored.current_epoch, st.current_epoch);
        // And the round-trip is byte-stable.
        assert_eq!(restored.to_config_text(), text);
    }
}
