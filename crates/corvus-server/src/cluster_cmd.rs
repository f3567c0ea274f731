//! CLUSTER subcommand dispatch.

use std::sync::Arc;

use bytes::Bytes;
use corvus_cluster::{
    key_slot, parse_slot_token, ClusterNode, NodeFlags, NodeName, SlotBitmap, TaskId,
};
use tracing::info;

use crate::node::Node;
use crate::resp::Reply;

pub fn dispatch(node: &Arc<Node>, argv: &[Bytes]) -> Reply {
    let Some(sub) = argv.get(1) else {
        return Reply::Error("ERR wrong number of arguments for 'cluster' command".into());
    };
    let sub = String::from_utf8_lossy(sub).to_ascii_uppercase();
    let args: Vec<String> = argv[2..]
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();

    match sub.as_str() {
        "MEET" => meet(node, &args),
        "ADDSLOTS" => addslots(node, &args),
        "SETSLOT" => setslot(node, &args),
        "NODES" => Reply::Bulk(Bytes::from(node.state.read().unwrap().cluster_nodes())),
        "INFO" => Reply::Bulk(Bytes::from(node.state.read().unwrap().cluster_info())),
        "MYID" => Reply::Bulk(Bytes::from(
            node.state
                .read()
                .unwrap()
                .myself_name()
                .as_str()
                .to_string(),
        )),
        "SLOTS" => slots_reply(node),
        "KEYSLOT" => match args.first() {
            Some(key) => Reply::Int(key_slot(key.as_bytes()) as i64),
            None => Reply::Error("ERR wrong number of arguments".into()),
        },
        "COUNTKEYSINSLOT" => countkeysinslot(node, &args),
        "FAILOVER" => failover(node, &args),
        "REPLICATE" => replicate(node, &args),
        "ASARBITER" => asarbiter(node),
        other => Reply::Error(format!("ERR unknown CLUSTER subcommand '{other}'")),
    }
}

fn meet(node: &Arc<Node>, args: &[String]) -> Reply {
    let (Some(ip), Some(port)) = (args.first(), args.get(1)) else {
        return Reply::Error("ERR CLUSTER MEET requires ip and port".into());
    };
    let Ok(port) = port.parse::<u16>() else {
        return Reply::Error("ERR invalid port".into());
    };
    let cport = match args.get(2) {
        Some(c) => match c.parse::<u16>() {
            Ok(c) => c,
            Err(_) => return Reply::Error("ERR invalid bus port".into()),
        },
        None => match port.checked_add(10000) {
            Some(c) => c,
            None => return Reply::Error("ERR port leaves no room for bus port".into()),
        },
    };

    let now = corvus_cluster::time::now_ms();
    {
        let mut state = node.state.write().unwrap();
        if state.node_by_addr(ip, cport).is_some() {
            return Reply::ok();
        }
        info!(%ip, port, cport, "CLUSTER MEET");
        state.add_node(ClusterNode::new_handshake(ip.clone(), port, cport, now));
    }
    node.save_config();
    Reply::ok()
}

fn addslots(node: &Arc<Node>, args: &[String]) -> Reply {
    if args.is_empty() {
        return Reply::Error("ERR CLUSTER ADDSLOTS requires at least one slot".into());
    }
    let mut ranges = Vec::new();
    for token in args {
        match parse_slot_token(token) {
            Ok(range) => ranges.push(range),
            Err(e) => return Reply::Error(format!("ERR {e}")),
        }
    }
    {
        let mut state = node.state.write().unwrap();
        if !state.myself().is_master() {
            return Reply::Error("ERR only masters take slots".into());
        }
        let me = state.myself_name().clone();
        // Validate the whole set before touching anything.
        for range in &ranges {
            for slot in range.start..=range.end {
                if let Some(owner) = state.slot_owner_name(slot) {
                    if owner != &me {
                        return Reply::Error(format!(
                            "ERR slot {slot} is already owned by {}",
                            owner.as_str()
                        ));
                    }
                }
            }
        }
        for range in &ranges {
            for slot in range.start..=range.end {
                state.take_slot(&me, slot);
            }
        }
        // First ownership needs a config epoch to defend it.
        if state.myself().config_epoch == 0 {
            let epoch = state.bump_epoch();
            state.myself_mut().config_epoch = epoch;
        }
    }
    node.save_config();
    Reply::ok()
}

fn setslot(node: &Arc<Node>, args: &[String]) -> Reply {
    let Some(head) = args.first() else {
        return Reply::Error("ERR CLUSTER SETSLOT requires arguments".into());
    };

    // Both argument orders are accepted: the keyword-first batch form
    // (`SETSLOT IMPORTING <node> <slots...>`) and the redis-style
    // slot-first form (`SETSLOT <slot> IMPORTING <node>`).
    let reordered: Vec<String>;
    let args = if parse_slot_token(head).is_ok() {
        let (Some(verb), Some(node_id)) = (args.get(1), args.get(2)) else {
            return Reply::Error("ERR SETSLOT <slot> needs IMPORTING|MIGRATING <node-id>".into());
        };
        reordered = vec![verb.clone(), node_id.clone(), head.clone()];
        &reordered[..]
    } else {
        args
    };
    let head = &args[0];

    match head.to_ascii_uppercase().as_str() {
        "IMPORTING" => {
            let Some(src) = args.get(1) else {
                return Reply::Error("ERR IMPORTING requires a source node id".into());
            };
            let src = match NodeName::parse(src) {
                Ok(name) => name,
                Err(e) => return Reply::Error(format!("ERR {e}")),
            };
            let slots = match parse_slots(&args[2..]) {
                Ok(slots) => slots,
                Err(reply) => return reply,
            };
            match node.migrate.prepare_import(src, slots) {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::Error(format!("ERR {e}")),
            }
        }
        "MIGRATING" => {
            let Some(dst) = args.get(1) else {
                return Reply::Error("ERR MIGRATING requires a destination node id".into());
            };
            let dst = match NodeName::parse(dst) {
                Ok(name) => name,
                Err(e) => return Reply::Error(format!("ERR {e}")),
            };
            let slots = match parse_slots(&args[2..]) {
                Ok(slots) => slots,
                Err(reply) => return reply,
            };
            let now = corvus_cluster::time::now_ms();
            match node.migrate.start_migration(dst, slots, now) {
                Ok(task_id) => Reply::Bulk(Bytes::from(task_id.as_str().to_string())),
                Err(e) => Reply::Error(format!("ERR {e}")),
            }
        }
        "STOP" => {
            let Some(raw) = args.get(1) else {
                return Reply::Error("ERR STOP requires a task id".into());
            };
            let Some(task_id) = TaskId::parse(raw) else {
                return Reply::Error("ERR bad task id".into());
            };
            let receiver_only = args
                .get(2)
                .is_some_and(|a| a.eq_ignore_ascii_case("receiveronly"));
            if node.migrate.stop_task(&task_id, receiver_only) {
                Reply::ok()
            } else {
                Reply::Error("ERR no such migrate task".into())
            }
        }
        "STOPALL" => {
            node.migrate.stop_all();
            Reply::ok()
        }
        "RESTART" => {
            let Some(raw) = args.get(1) else {
                return Reply::Error("ERR RESTART requires a task id".into());
            };
            let Some(task_id) = TaskId::parse(raw) else {
                return Reply::Error("ERR bad task id".into());
            };
            if node.migrate.restart_task(&task_id) {
                Reply::ok()
            } else {
                Reply::Error("ERR no such migrate task".into())
            }
        }
        "RESTARTALL" => {
            node.migrate.restart_all();
            Reply::ok()
        }
        "INFO" => Reply::Bulk(Bytes::from(node.migrate.setslot_info())),
        other => Reply::Error(format!("ERR unknown SETSLOT form '{other}'")),
    }
}

fn parse_slots(args: &[String]) -> Result<SlotBitmap, Reply> {
    if args.is_empty() {
        return Err(Reply::Error("ERR no slots given".into()));
    }
    let mut slots = SlotBitmap::new();
    for token in args {
        let range =
            parse_slot_token(token).map_err(|e| Reply::Error(format!("ERR {e}")))?;
        for slot in range.start..=range.end {
            slots.set(slot);
        }
    }
    Ok(slots)
}

fn slots_reply(node: &Arc<Node>) -> Reply {
    let state = node.state.read().unwrap();
    let rows = state
        .cluster_slots_reply()
        .into_iter()
        .map(|entry| {
            let endpoint = |(ip, port, name): (String, u16, NodeName)| {
                Reply::Array(vec![
                    Reply::Bulk(Bytes::from(ip)),
                    Reply::Int(port as i64),
                    Reply::Bulk(Bytes::from(name.as_str().to_string())),
                ])
            };
            let mut row = vec![
                Reply::Int(entry.start as i64),
                Reply::Int(entry.end as i64),
                endpoint(entry.master),
            ];
            row.extend(entry.replicas.into_iter().map(endpoint));
            Reply::Array(row)
        })
        .collect();
    Reply::Array(rows)
}

fn countkeysinslot(node: &Arc<Node>, args: &[String]) -> Reply {
    let Some(slot) = args.first().and_then(|a| a.parse::<u16>().ok()) else {
        return Reply::Error("ERR invalid slot".into());
    };
    if slot >= corvus_cluster::CLUSTER_SLOTS {
        return Reply::Error("ERR slot out of range".into());
    }
    match node.stores.count_keys_in_slot(slot) {
        Ok(n) => Reply::Int(n as i64),
        Err(e) => Reply::Error(format!("ERR storage: {e}")),
    }
}

fn failover(node: &Arc<Node>, args: &[String]) -> Reply {
    let mode = args.first().map(|a| a.to_ascii_uppercase());
    let (force, takeover) = match mode.as_deref() {
        None => (false, false),
        Some("FORCE") => (true, false),
        Some("TAKEOVER") => (false, true),
        Some(other) => {
            return Reply::Error(format!("ERR unknown CLUSTER FAILOVER option '{other}'"))
        }
    };
    let now = corvus_cluster::time::now_ms();
    let out = {
        let mut ctl = node.failover.lock().unwrap();
        ctl.start_manual(now, force, takeover)
    };
    match out {
        Ok(frames) => {
            node.send_bus_frames(frames);
            node.save_config();
            Reply::ok()
        }
        Err(e) => Reply::Error(format!("ERR {e}")),
    }
}

fn replicate(node: &Arc<Node>, args: &[String]) -> Reply {
    let Some(raw) = args.first() else {
        return Reply::Error("ERR CLUSTER REPLICATE requires a node id".into());
    };
    let master = match NodeName::parse(raw) {
        Ok(name) => name,
        Err(e) => return Reply::Error(format!("ERR {e}")),
    };
    {
        let mut state = node.state.write().unwrap();
        if &master == state.myself_name() {
            return Reply::Error("ERR cannot replicate myself".into());
        }
        if let Err(e) = state.set_myself_slave_of(master) {
            return Reply::Error(format!("ERR {e}"));
        }
    }
    node.save_config();
    Reply::ok()
}

fn asarbiter(node: &Arc<Node>) -> Reply {
    {
        let mut state = node.state.write().unwrap();
        if !state.myself().slots.is_empty() {
            return Reply::Error("ERR a node with slots cannot become an arbiter".into());
        }
        state.set_myself_master();
        state.myself_mut().flags.set(NodeFlags::ARBITER);
    }
    node.save_config();
    Reply::ok()
}
