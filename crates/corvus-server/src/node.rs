//! Node assembly: storage, locks, cluster state, and the network rim.
//!
//! One [`Node`] owns every subsystem and the tasks that drive them:
//!
//! - the **bus listener** on `cport`, speaking two protocols told apart by
//!   their magic: `RCmb` gossip frames and `Xfer` migration streams
//! - the **client listener** on `port`, handled by [`crate::session`]
//! - the **control loop**, ticking gossip and failover every 100 ms
//! - the **event loop**, turning cluster/migrate events into GC work and
//!   nodes.conf saves
//! - the **GC loop**, sweeping reclaimed slots in the background
//!
//! Teardown is ordered: listeners first, then migration, GC, gossip, and
//! finally a config save, so no subsystem observes a half-dead neighbor.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use corvus_cluster::{
    ClusterError, ClusterEvent, ClusterMsg, ClusterNode, ClusterState, Connector, FailoverCtl,
    GcManager, GossipEngine, MigrateEvent, MigrateManager, MsgType, NodeName, Outbound,
    SlotBitmap, XferAck, XferConn, XferFrame,
};
use corvus_cluster::message::MFLAG0_PAUSED;
use corvus_cluster::time::now_ms;
use corvus_locks::MglLockMgr;
use corvus_store::Stores;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::session;

/// Everything one running node is made of.
pub struct Node {
    pub config: NodeConfig,
    pub state: Arc<RwLock<ClusterState>>,
    pub stores: Stores,
    pub locks: Arc<MglLockMgr>,
    pub migrate: Arc<MigrateManager>,
    pub gc: Arc<GcManager>,
    pub failover: Mutex<FailoverCtl>,
    pub gossip: GossipEngine,
    cluster_events: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
    migrate_events: Mutex<Option<mpsc::Receiver<MigrateEvent>>>,
    /// Last time our master was heard from, for the data-age check.
    last_master_contact: AtomicU64,
}

/// Outbound migration streams ride a fresh TCP connection to the peer's
/// bus port, bridged frame-by-frame onto the in-process channel pair.
struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, dst_addr: &str) -> Result<XferConn, ClusterError> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<XferFrame>(16);
        let (ack_tx, ack_rx) = mpsc::channel::<XferAck>(16);
        let addr = dst_addr.to_string();
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%addr, error = %e, "migration connect failed");
                    return;
                }
            };
            if stream.write_all(b"Xfer").await.is_err() {
                return;
            }
            // The transfer protocol strictly alternates frame → ack, so a
            // single task pumps both directions.
            while let Some(frame) = frame_rx.recv().await {
                let payload = frame.encode();
                if stream.write_u32_le(payload.len() as u32).await.is_err() {
                    return;
                }
                if stream.write_all(&payload).await.is_err() {
                    return;
                }
                let len = match stream.read_u32_le().await {
                    Ok(len) => len,
                    Err(_) => return,
                };
                let mut buf = vec![0u8; len as usize];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let Ok(ack) = XferAck::decode(&buf) else { return };
                if ack_tx.send(ack).await.is_err() {
                    return;
                }
            }
        });
        Ok(XferConn {
            tx: frame_tx,
            rx: ack_rx,
        })
    }
}

impl Node {
    /// Builds a node from config, restoring identity and topology from
    /// nodes.conf when present.
    pub fn bootstrap(config: NodeConfig) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let conf_path = config.nodes_conf_path();
        let mut state = if conf_path.exists() {
            let text = std::fs::read_to_string(&conf_path)?;
            let state = ClusterState::from_config_text(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            info!(
                myself = %state.myself_name(),
                nodes = state.node_count(),
                epoch = state.current_epoch,
                "restored cluster state from nodes.conf"
            );
            state
        } else {
            let name = NodeName::random();
            info!(myself = %name, "fresh node, generated identity");
            ClusterState::new(ClusterNode::new_master(
                name,
                config.bind.clone(),
                config.port,
                config.cport,
            ))
        };
        state.require_full_coverage = config.require_full_coverage && !config.single_node;
        let state = Arc::new(RwLock::new(state));

        let stores = Stores::in_memory(config.kv_store_count);
        let locks = MglLockMgr::new();

        let (cluster_tx, cluster_rx) = mpsc::channel(256);
        let (migrate_tx, migrate_rx) = mpsc::channel(256);

        let gossip = GossipEngine::new(Arc::clone(&state), config.gossip_config(), cluster_tx);
        let migrate = MigrateManager::new(
            Arc::clone(&state),
            stores.clone(),
            config.migrate_config(),
            Arc::new(TcpConnector),
            migrate_tx,
        );
        let gc = Arc::new(GcManager::new(
            Arc::clone(&state),
            stores.clone(),
            config.gc_config(),
        ));
        let failover = Mutex::new(FailoverCtl::new(
            Arc::clone(&state),
            config.failover_config(),
        ));

        let node = Arc::new(Self {
            config,
            state,
            stores,
            locks,
            migrate,
            gc,
            failover,
            gossip,
            cluster_events: Mutex::new(Some(cluster_rx)),
            migrate_events: Mutex::new(Some(migrate_rx)),
            last_master_contact: AtomicU64::new(now_ms()),
        });
        node.save_config();
        Ok(node)
    }

    /// Serializes cluster state to nodes.conf, atomically via tmp+rename.
    pub fn save_config(&self) {
        let text = self.state.read().unwrap().to_config_text();
        let path = self.config.nodes_conf_path();
        let tmp = path.with_extension("conf.tmp");
        let result = std::fs::write(&tmp, &text).and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            error!(error = %e, "failed to persist nodes.conf");
        }
    }

    /// This node's replication offset, advertised in gossip headers.
    /// With per-store binlogs the sum is a monotonic progress measure.
    pub fn repl_offset(&self) -> u64 {
        (0..self.stores.kv_store_count())
            .filter_map(|id| self.stores.store(id))
            .map(|s| s.highest_binlog_id())
            .sum()
    }

    /// True while a manual failover holds writes on this master.
    pub fn is_writes_paused(&self) -> bool {
        self.failover.lock().unwrap().writes_paused(now_ms())
    }

    /// Fire-and-forget delivery of bus frames.
    pub fn send_bus_frames(&self, frames: Vec<Outbound>) {
        for (addr, msg) in frames {
            tokio::spawn(async move {
                match TcpStream::connect(&addr).await {
                    Ok(mut stream) => {
                        if let Err(e) = stream.write_all(&msg.encode()).await {
                            debug!(%addr, error = %e, "bus send failed");
                        }
                    }
                    Err(e) => debug!(%addr, error = %e, "bus connect failed"),
                }
            });
        }
    }

    /// Runs the node until shutdown.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let bus_addr = format!("{}:{}", self.config.bind, self.config.cport);
        let client_addr = format!("{}:{}", self.config.bind, self.config.port);
        let bus_listener = TcpListener::bind(&bus_addr).await?;
        let client_listener = TcpListener::bind(&client_addr).await?;
        info!(%client_addr, %bus_addr, stores = self.config.kv_store_count, "corvus node up");

        // Bus accept loop.
        let bus_node = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match bus_listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&bus_node);
                        tokio::spawn(async move {
                            if let Err(e) = handle_bus_conn(node, stream).await {
                                debug!(%peer, error = %e, "bus connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "bus accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        // Client accept loop.
        let client_node = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match client_listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&client_node);
                        tokio::spawn(async move {
                            if let Err(e) = session::handle(node, stream).await {
                                debug!(%peer, error = %e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "client accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        // Control loop: gossip + failover ticks.
        let tick_node = Arc::clone(&self);
        tokio::spawn(async move {
            let period = Duration::from_millis(tick_node.gossip.config().tick_interval_ms);
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = now_ms();
                let offset = tick_node.repl_offset();
                let mut frames = tick_node.gossip.tick(now, offset);
                let last_contact = tick_node.last_master_contact.load(Ordering::Relaxed);
                frames.extend(
                    tick_node
                        .failover
                        .lock()
                        .unwrap()
                        .tick(now, offset, last_contact),
                );
                tick_node.send_bus_frames(frames);
            }
        });

        // Event loop: GC feeding and config persistence.
        let cluster_rx = self.cluster_events.lock().unwrap().take();
        let migrate_rx = self.migrate_events.lock().unwrap().take();
        if let (Some(cluster_rx), Some(migrate_rx)) = (cluster_rx, migrate_rx) {
            let event_node = Arc::clone(&self);
            tokio::spawn(run_events(event_node, cluster_rx, migrate_rx));
        }

        // GC sweep loop.
        let gc_node = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if gc_node.gc.pending_count() > 0 {
                    gc_node.gc.sweep().await;
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        // Orderly teardown: stop accepting, freeze migration, then flush
        // the final topology to disk. Remaining tasks die with the runtime.
        info!("shutting down: sessions, migration, gc, gossip, state");
        self.migrate.stop_all();
        self.save_config();
        Ok(())
    }
}

/// Consumes cluster and migration events.
async fn run_events(
    node: Arc<Node>,
    mut cluster_rx: mpsc::Receiver<ClusterEvent>,
    mut migrate_rx: mpsc::Receiver<MigrateEvent>,
) {
    loop {
        tokio::select! {
            event = cluster_rx.recv() => match event {
                Some(ClusterEvent::MyselfLostSlots(slots)) => {
                    let bitmap: SlotBitmap = slots.into_iter().collect();
                    node.gc.enqueue(&bitmap);
                    node.save_config();
                }
                Some(ClusterEvent::NodeFailed(name)) => {
                    warn!(node = %name, "cluster marked node failed");
                    node.save_config();
                }
                Some(ClusterEvent::NodeRecovered(_)) | Some(ClusterEvent::NodeJoined(_)) => {
                    node.save_config();
                }
                None => break,
            },
            event = migrate_rx.recv() => match event {
                Some(MigrateEvent::TaskDone { task_id, slots }) => {
                    info!(task = %task_id, "migration done, queueing GC");
                    node.gc.enqueue(&slots);
                    node.save_config();
                }
                Some(MigrateEvent::ImportDone { task_id, .. }) => {
                    info!(task = %task_id, "import done");
                    node.save_config();
                }
                Some(MigrateEvent::TaskFailed { task_id }) => {
                    warn!(task = %task_id, "migration failed");
                    node.save_config();
                }
                None => break,
            },
        }
    }
}

/// One bus connection: gossip frames or a migration stream.
async fn handle_bus_conn(node: Arc<Node>, mut stream: TcpStream) -> io::Result<()> {
    let peer_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_default();

    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    match &magic {
        b"RCmb" => handle_gossip_conn(node, stream, peer_ip, magic).await,
        b"Xfer" => handle_xfer_conn(node, stream).await,
        other => {
            debug!(?other, "unknown bus magic");
            Ok(())
        }
    }
}

/// Reads RCmb frames until the peer hangs up.
async fn handle_gossip_conn(
    node: Arc<Node>,
    mut stream: TcpStream,
    peer_ip: String,
    first_magic: [u8; 4],
) -> io::Result<()> {
    let mut magic = first_magic;
    loop {
        let totlen = stream.read_u32_le().await?;
        if !(8..=16 * 1024 * 1024).contains(&(totlen as usize)) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad totlen"));
        }
        let mut frame = Vec::with_capacity(totlen as usize);
        frame.extend_from_slice(&magic);
        frame.extend_from_slice(&totlen.to_le_bytes());
        let mut rest = vec![0u8; totlen as usize - 8];
        stream.read_exact(&mut rest).await?;
        frame.extend_from_slice(&rest);

        match ClusterMsg::decode(&frame) {
            Ok(msg) => {
                let frames = handle_bus_msg(&node, msg, &peer_ip);
                node.send_bus_frames(frames);
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed bus frame");
                return Ok(());
            }
        }

        // Next frame or EOF.
        match stream.read_exact(&mut magic).await {
            Ok(_) if &magic == b"RCmb" => continue,
            _ => return Ok(()),
        }
    }
}

/// Routes one decoded bus message to the right subsystem.
fn handle_bus_msg(node: &Arc<Node>, msg: ClusterMsg, peer_ip: &str) -> Vec<Outbound> {
    let now = now_ms();
    let offset = node.repl_offset();

    // Feed the data-age clock when our master talks to us.
    {
        let state = node.state.read().unwrap();
        if state.myself().master.as_ref() == Some(&msg.header.sender) {
            node.last_master_contact.store(now, Ordering::Relaxed);
        }
    }

    match msg.mtype {
        MsgType::AuthRequest => {
            let reply = node
                .failover
                .lock()
                .unwrap()
                .handle_auth_request(&msg, now);
            if reply.is_some() {
                // The vote is durable before it is visible.
                node.save_config();
            }
            reply.into_iter().collect()
        }
        MsgType::AuthAck => {
            let frames = node.failover.lock().unwrap().handle_auth_ack(&msg, now);
            if !frames.is_empty() {
                node.save_config();
            }
            frames
        }
        MsgType::MfStart => {
            if msg.header.mflags[0] & MFLAG0_PAUSED != 0 {
                node.failover.lock().unwrap().handle_mfstart_ack(&msg);
                Vec::new()
            } else {
                node.failover
                    .lock()
                    .unwrap()
                    .handle_mfstart(&msg, now, offset)
                    .into_iter()
                    .collect()
            }
        }
        _ => node.gossip.handle_message(&msg, peer_ip, now, offset),
    }
}

/// Bridges one inbound migration stream onto the manager's channels.
async fn handle_xfer_conn(node: Arc<Node>, mut stream: TcpStream) -> io::Result<()> {
    let (frame_tx, frame_rx) = mpsc::channel::<XferFrame>(16);
    let (ack_tx, mut ack_rx) = mpsc::channel::<XferAck>(16);
    node.migrate.accept(frame_rx, ack_tx);

    loop {
        let len = match stream.read_u32_le().await {
            Ok(len) => len,
            Err(_) => return Ok(()),
        };
        if len as usize > 64 * 1024 * 1024 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        let frame = XferFrame::decode(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if frame_tx.send(frame).await.is_err() {
            return Ok(());
        }
        let Some(ack) = ack_rx.recv().await else {
            return Ok(());
        };
        let payload = ack.encode();
        stream.write_u32_le(payload.len() as u32).await?;
        stream.write_all(&payload).await?;
    }
}
