//! Client sessions: command parsing, slot routing, and execution.
//!
//! Every command resolves its keys to slots and runs the routing policy
//! before touching storage:
//!
//! - one slot, owned here → execute under key locks
//! - one slot, owned elsewhere → `MOVED`
//! - several slots → `CROSSSLOT` unless cross-slot is permitted (config or
//!   single-node mode) and all slots are local
//! - slot migrating out → served locally until the transfer commits (the
//!   binlog tail carries every local write), then `MOVED`
//! - on a slave, writes always redirect; reads redirect unless the session
//!   sent `READONLY`
//!
//! Execution takes IS/IX intents down the lock hierarchy and S/X on the
//! keys themselves, multi-key sets in canonical order.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use corvus_cluster::{key_slot, ClusterHealth, MigrateRedirect};
use corvus_locks::{sort_key_targets, KeyLock, LockMode, SessionLocks, SHORT_LOCK_TIMEOUT_MS};
use corvus_store::{encode_key, WriteBatch};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::cluster_cmd;
use crate::node::Node;
use crate::resp::{parse_command, Reply};

/// Per-connection state.
pub struct Session {
    pub readonly: bool,
    pub locks: SessionLocks,
}

impl Session {
    pub fn new() -> Self {
        Self {
            readonly: false,
            locks: SessionLocks::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection loop: parse, dispatch, reply.
pub async fn handle(node: Arc<Node>, mut stream: TcpStream) -> std::io::Result<()> {
    let mut session = Session::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match parse_command(&buf) {
            Ok(Some((argv, consumed))) => {
                let _ = buf.split_to(consumed);
                if argv.is_empty() {
                    continue;
                }
                let reply = dispatch(&node, &mut session, &argv).await;
                stream.write_all(&reply.to_bytes()).await?;
                if argv[0].eq_ignore_ascii_case(b"quit") {
                    return Ok(());
                }
            }
            Ok(None) => {
                let n = stream.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
            }
            Err(e) => {
                let reply = Reply::Error(format!("ERR {e}"));
                stream.write_all(&reply.to_bytes()).await?;
                return Ok(());
            }
        }
    }
}

/// Executes one parsed command.
pub async fn dispatch(node: &Arc<Node>, session: &mut Session, argv: &[Bytes]) -> Reply {
    let cmd = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    trace!(%cmd, args = argv.len(), "dispatch");
    match cmd.as_str() {
        "PING" => Reply::Simple("PONG".into()),
        "ECHO" => match argv.get(1) {
            Some(msg) => Reply::Bulk(msg.clone()),
            None => arity_err("echo"),
        },
        "QUIT" => Reply::ok(),
        "READONLY" => {
            session.readonly = true;
            Reply::ok()
        }
        "READWRITE" => {
            session.readonly = false;
            Reply::ok()
        }
        "CLUSTER" => cluster_cmd::dispatch(node, argv),
        "GET" => match argv {
            [_, key] => read_one(node, session, key, |store, encoded| {
                Ok(match store.get(&encoded)? {
                    Some(value) => Reply::Bulk(value),
                    None => Reply::Nil,
                })
            }),
            _ => arity_err("get"),
        },
        "EXISTS" => match argv {
            [_, key] => read_one(node, session, key, |store, encoded| {
                Ok(Reply::Int(store.get(&encoded)?.is_some() as i64))
            }),
            _ => arity_err("exists"),
        },
        "SET" => match argv {
            [_, key, value] => write_one(node, session, key, |store, encoded| {
                let mut batch = WriteBatch::new();
                batch.put(encoded, value.clone());
                store.write(batch)?;
                Ok(Reply::ok())
            }),
            _ => arity_err("set"),
        },
        "DEL" => {
            if argv.len() < 2 {
                return arity_err("del");
            }
            del_keys(node, session, &argv[1..])
        }
        _ => Reply::Error(format!("ERR unknown command '{}'", cmd.to_ascii_lowercase())),
    }
}

fn arity_err(cmd: &str) -> Reply {
    Reply::Error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

/// Routing decision for one command's key set.
enum Route {
    /// Execute locally.
    Local,
    /// Redirect the client.
    Redirect(Reply),
}

/// Applies the slot policy from the session's point of view.
fn route(node: &Arc<Node>, session: &Session, keys: &[&Bytes], is_write: bool) -> Route {
    let state = node.state.read().unwrap();

    let mut slots: Vec<u16> = keys.iter().map(|k| key_slot(k)).collect();
    slots.sort_unstable();
    slots.dedup();

    // Slave sessions never execute writes, and reads need READONLY.
    let myself = state.myself();
    if myself.flags.is_slave() {
        if is_write || !session.readonly {
            if let Some(master) = myself.master.as_ref().and_then(|m| state.lookup_node(m)) {
                let slot = slots.first().copied().unwrap_or(0);
                return Route::Redirect(Reply::Error(format!(
                    "MOVED {slot} {}",
                    master.client_addr()
                )));
            }
        }
        // READONLY reads are served from the replica.
        return Route::Local;
    }

    if state.health() == ClusterHealth::Down && !node.config.single_node {
        return Route::Redirect(Reply::Error("CLUSTERDOWN The cluster is down".into()));
    }

    if slots.len() > 1 {
        let cross_ok = node.config.allow_cross_slot || node.config.single_node;
        if !cross_ok {
            return Route::Redirect(Reply::Error(
                "CROSSSLOT Keys in request don't hash to the same slot".into(),
            ));
        }
        // All local → execute; otherwise redirect at the first foreign slot.
        for slot in &slots {
            if !state.myself_owns(*slot) {
                let reply = match state.node_for_slot(*slot) {
                    Some(owner) => {
                        Reply::Error(format!("MOVED {slot} {}", owner.client_addr()))
                    }
                    None => Reply::Error("CLUSTERDOWN Hash slot not served".into()),
                };
                return Route::Redirect(reply);
            }
        }
        return Route::Local;
    }

    let Some(&slot) = slots.first() else {
        return Route::Local;
    };

    if !state.myself_owns(slot) {
        // Importing slots accept traffic redirected here mid-migration.
        if node.migrate.is_importing(slot) {
            return Route::Local;
        }
        let reply = match state.node_for_slot(slot) {
            Some(owner) => Reply::Error(format!("MOVED {slot} {}", owner.client_addr())),
            None => Reply::Error("CLUSTERDOWN Hash slot not served".into()),
        };
        return Route::Redirect(reply);
    }

    // Owned, but possibly on its way out. While the slot is still
    // streaming it is served locally — the binlog tail forwards whatever
    // happens here — and only a committed slot redirects.
    match node.migrate.redirect_for(slot) {
        MigrateRedirect::Moved { dst } => {
            let reply = match state.lookup_node(&dst) {
                Some(n) => Reply::Error(format!("MOVED {slot} {}", n.client_addr())),
                None => Reply::Error("CLUSTERDOWN Hash slot not served".into()),
            };
            Route::Redirect(reply)
        }
        MigrateRedirect::Migrating { .. } | MigrateRedirect::None => Route::Local,
    }
}

/// Runs a single-key read under an S key lock.
fn read_one<F>(node: &Arc<Node>, session: &Session, key: &Bytes, op: F) -> Reply
where
    F: FnOnce(&Arc<dyn corvus_store::KvStore>, Bytes) -> Result<Reply, corvus_store::StoreError>,
{
    if let Route::Redirect(reply) = route(node, session, &[key], false) {
        return reply;
    }
    let slot = key_slot(key);
    let store = node.stores.store_for_slot(slot).clone();
    let store_id = node.stores.catalog().store_for_chunk(slot);

    let _lock = match KeyLock::acquire(
        &node.locks,
        store_id,
        slot as u32,
        key,
        LockMode::S,
        Some(session.locks.clone()),
        SHORT_LOCK_TIMEOUT_MS,
    ) {
        Ok(lock) => lock,
        Err(e) => return Reply::Error(format!("ERR {e}")),
    };

    match op(&store, encode_key(slot, key)) {
        Ok(reply) => reply,
        Err(e) => Reply::Error(format!("ERR storage: {e}")),
    }
}

/// Runs a single-key write under an X key lock.
fn write_one<F>(node: &Arc<Node>, session: &Session, key: &Bytes, op: F) -> Reply
where
    F: FnOnce(&Arc<dyn corvus_store::KvStore>, Bytes) -> Result<Reply, corvus_store::StoreError>,
{
    if let Route::Redirect(reply) = route(node, session, &[key], true) {
        return reply;
    }
    if node.is_writes_paused() {
        return Reply::Error("TRYAGAIN writes paused for failover".into());
    }
    let slot = key_slot(key);
    let store = node.stores.store_for_slot(slot).clone();
    let store_id = node.stores.catalog().store_for_chunk(slot);

    let _lock = match KeyLock::acquire(
        &node.locks,
        store_id,
        slot as u32,
        key,
        LockMode::X,
        Some(session.locks.clone()),
        SHORT_LOCK_TIMEOUT_MS,
    ) {
        Ok(lock) => lock,
        Err(e) => return Reply::Error(format!("ERR {e}")),
    };

    match op(&store, encode_key(slot, key)) {
        Ok(reply) => reply,
        Err(e) => Reply::Error(format!("ERR storage: {e}")),
    }
}

/// Multi-key DEL: route as a write over all keys, then delete each under
/// X locks taken in canonical order.
fn del_keys(node: &Arc<Node>, session: &Session, keys: &[Bytes]) -> Reply {
    let refs: Vec<&Bytes> = keys.iter().collect();
    if let Route::Redirect(reply) = route(node, session, &refs, true) {
        return reply;
    }
    if node.is_writes_paused() {
        return Reply::Error("TRYAGAIN writes paused for failover".into());
    }

    let mut coords: Vec<(u32, u32, Vec<u8>)> = keys
        .iter()
        .map(|k| {
            let slot = key_slot(k);
            let store_id = node.stores.catalog().store_for_chunk(slot);
            (store_id, slot as u32, k.to_vec())
        })
        .collect();
    sort_key_targets(&mut coords);
    // A repeated key must not dead-wait on its own X lock.
    coords.dedup();

    let mut locks = Vec::with_capacity(coords.len());
    for (store_id, chunk, key) in &coords {
        match KeyLock::acquire(
            &node.locks,
            *store_id,
            *chunk,
            key,
            LockMode::X,
            Some(session.locks.clone()),
            SHORT_LOCK_TIMEOUT_MS,
        ) {
            Ok(lock) => locks.push(lock),
            Err(e) => return Reply::Error(format!("ERR {e}")),
        }
    }

    let mut removed = 0i64;
    for (_, chunk, key) in &coords {
        let slot = *chunk as u16;
        let store = node.stores.store_for_slot(slot);
        let encoded = encode_key(slot, key);
        match store.get(&encoded) {
            Ok(Some(_)) => {
                let mut batch = WriteBatch::new();
                batch.del(encoded);
                if store.write(batch).is_ok() {
                    removed += 1;
                }
            }
            Ok(None) => {}
            Err(e) => return Reply::Error(format!("ERR storage: {e}")),
        }
    }
    Reply::Int(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, NodeConfig};
    use clap::Parser;
    use corvus_cluster::{ClusterNode, NodeName, CLUSTER_SLOTS};

    fn test_node(test: &str) -> Arc<Node> {
        let dir = std::env::temp_dir()
            .join(format!("corvus-session-{}", std::process::id()))
            .join(test);
        let _ = std::fs::remove_dir_all(&dir);
        let cli = Cli::parse_from([
            "corvus",
            "--port",
            "16000",
            "--kv-store-count",
            "3",
            "--data-dir",
            dir.to_str().unwrap(),
        ]);
        let config = NodeConfig::from_cli(cli).unwrap();
        Node::bootstrap(config).unwrap()
    }

    fn own_all_slots(node: &Arc<Node>) {
        let mut st = node.state.write().unwrap();
        let me = st.myself_name().clone();
        for slot in 0..CLUSTER_SLOTS {
            st.take_slot(&me, slot);
        }
        st.myself_mut().config_epoch = 1;
    }

    fn peer_name() -> NodeName {
        NodeName::parse(&"2".repeat(40)).unwrap()
    }

    fn add_peer(node: &Arc<Node>) {
        let mut st = node.state.write().unwrap();
        st.add_node(ClusterNode::new_master(
            peer_name(),
            "127.0.0.1".into(),
            16001,
            26001,
        ));
    }

    fn argv(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    async fn run(node: &Arc<Node>, session: &mut Session, parts: &[&str]) -> Reply {
        dispatch(node, session, &argv(parts)).await
    }

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let node = test_node("roundtrip");
        own_all_slots(&node);
        let mut s = Session::new();

        assert_eq!(run(&node, &mut s, &["SET", "foo", "bar"]).await, Reply::ok());
        assert_eq!(
            run(&node, &mut s, &["GET", "foo"]).await,
            Reply::Bulk(Bytes::from("bar"))
        );
        assert_eq!(run(&node, &mut s, &["EXISTS", "foo"]).await, Reply::Int(1));

        // "foo" hashes to slot 12182; the key must be countable there.
        assert_eq!(node.stores.count_keys_in_slot(12182).unwrap(), 1);

        assert_eq!(run(&node, &mut s, &["DEL", "foo"]).await, Reply::Int(1));
        assert_eq!(run(&node, &mut s, &["GET", "foo"]).await, Reply::Nil);
        assert_eq!(run(&node, &mut s, &["DEL", "foo"]).await, Reply::Int(0));
    }

    #[tokio::test]
    async fn foreign_slot_gets_moved() {
        let node = test_node("moved");
        own_all_slots(&node);
        add_peer(&node);
        {
            let mut st = node.state.write().unwrap();
            // "foo" → slot 12182 now belongs to the peer.
            st.take_slot(&peer_name(), 12182);
            st.lookup_node_mut(&peer_name()).unwrap().config_epoch = 2;
        }
        let mut s = Session::new();
        let reply = run(&node, &mut s, &["GET", "foo"]).await;
        assert_eq!(
            reply,
            Reply::Error("MOVED 12182 127.0.0.1:16001".into())
        );
        // Writes redirect the same way.
        let reply = run(&node, &mut s, &["SET", "foo", "x"]).await;
        assert_eq!(
            reply,
            Reply::Error("MOVED 12182 127.0.0.1:16001".into())
        );
    }

    #[tokio::test]
    async fn cross_slot_policy() {
        let node = test_node("crossslot");
        own_all_slots(&node);
        let mut s = Session::new();

        // "foo" and "bar" live in different slots.
        let reply = run(&node, &mut s, &["DEL", "foo", "bar"]).await;
        assert_eq!(
            reply,
            Reply::Error("CROSSSLOT Keys in request don't hash to the same slot".into())
        );

        // Hash tags pin both keys to one slot.
        run(&node, &mut s, &["SET", "{user}:a", "1"]).await;
        run(&node, &mut s, &["SET", "{user}:b", "2"]).await;
        assert_eq!(
            run(&node, &mut s, &["DEL", "{user}:a", "{user}:b"]).await,
            Reply::Int(2)
        );
    }

    #[tokio::test]
    async fn unassigned_cluster_is_down() {
        let node = test_node("down");
        let mut s = Session::new();
        let reply = run(&node, &mut s, &["GET", "foo"]).await;
        assert_eq!(reply, Reply::Error("CLUSTERDOWN The cluster is down".into()));
    }

    #[tokio::test]
    async fn slave_reads_require_readonly() {
        let node = test_node("slave");
        add_peer(&node);
        {
            let mut st = node.state.write().unwrap();
            for slot in 0..CLUSTER_SLOTS {
                st.take_slot(&peer_name(), slot);
            }
            st.set_myself_slave_of(peer_name()).unwrap();
        }
        let mut s = Session::new();

        // Plain reads and all writes bounce to the master.
        let reply = run(&node, &mut s, &["GET", "foo"]).await;
        assert!(matches!(reply, Reply::Error(e) if e.starts_with("MOVED 12182")));
        let reply = run(&node, &mut s, &["SET", "foo", "x"]).await;
        assert!(matches!(reply, Reply::Error(e) if e.starts_with("MOVED")));

        // READONLY opens the replica for reads.
        assert_eq!(run(&node, &mut s, &["READONLY"]).await, Reply::ok());
        assert_eq!(run(&node, &mut s, &["GET", "foo"]).await, Reply::Nil);

        // READWRITE flips it back.
        assert_eq!(run(&node, &mut s, &["READWRITE"]).await, Reply::ok());
        let reply = run(&node, &mut s, &["GET", "foo"]).await;
        assert!(matches!(reply, Reply::Error(e) if e.starts_with("MOVED")));
    }

    #[tokio::test]
    async fn cluster_commands_surface() {
        let node = test_node("cluster-cmds");
        let mut s = Session::new();

        let Reply::Bulk(myid) = run(&node, &mut s, &["CLUSTER", "MYID"]).await else {
            panic!("MYID must return a bulk string");
        };
        assert_eq!(myid.len(), 40);

        assert_eq!(
            run(&node, &mut s, &["CLUSTER", "ADDSLOTS", "{0..16383}"]).await,
            Reply::ok()
        );
        let Reply::Bulk(info) = run(&node, &mut s, &["CLUSTER", "INFO"]).await else {
            panic!("INFO must return a bulk string");
        };
        let info = String::from_utf8_lossy(&info).into_owned();
        assert!(info.contains("cluster_state:ok"));
        assert!(info.contains("cluster_slots_assigned:16384"));
        assert!(info.contains("cluster_known_nodes:1"));

        assert_eq!(
            run(&node, &mut s, &["CLUSTER", "KEYSLOT", "foo"]).await,
            Reply::Int(12182)
        );

        run(&node, &mut s, &["SET", "foo", "bar"]).await;
        assert_eq!(
            run(&node, &mut s, &["CLUSTER", "COUNTKEYSINSLOT", "12182"]).await,
            Reply::Int(1)
        );

        // SLOTS: one full range owned by myself.
        let Reply::Array(rows) = run(&node, &mut s, &["CLUSTER", "SLOTS"]).await else {
            panic!("SLOTS must return an array");
        };
        assert_eq!(rows.len(), 1);
    }
}
