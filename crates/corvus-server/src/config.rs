//! Node configuration.
//!
//! CLI flags map one-to-one onto the redis-style option names from the
//! config file era (`cluster-node-timeout`, `cluster-migration-batch-size`,
//! ...). Defaults follow the upstream values.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line options for one corvus node.
#[derive(Debug, Clone, Parser)]
#[command(name = "corvus", about = "sharded redis-compatible kv store")]
pub struct Cli {
    /// Client listen address.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Client port. The cluster bus listens on port + 10000 unless
    /// --cport is given.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Cluster bus port.
    #[arg(long)]
    pub cport: Option<u16>,

    /// Directory for nodes.conf and store data.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Enable cluster mode.
    #[arg(long, default_value_t = true)]
    pub cluster_enabled: bool,

    /// PFAIL/FAIL detection threshold in milliseconds.
    #[arg(long, default_value_t = 15000)]
    pub cluster_node_timeout: u64,

    /// Data-age multiplier for slave election eligibility.
    #[arg(long, default_value_t = 10)]
    pub cluster_slave_validity_factor: u64,

    /// Whether missing slot coverage marks the cluster down.
    #[arg(long, default_value_t = true)]
    pub cluster_require_full_coverage: bool,

    /// Migration batch size in KB.
    #[arg(long, default_value_t = 16)]
    pub cluster_migration_batch_size: usize,

    /// Migration network timeout in seconds.
    #[arg(long, default_value_t = 5)]
    pub cluster_migration_timeout: u64,

    /// Migration sender pool size.
    #[arg(long, default_value_t = 5)]
    pub migrate_sender_threadnum: usize,

    /// Migration receiver pool size.
    #[arg(long, default_value_t = 5)]
    pub migrate_receive_threadnum: usize,

    /// Migration rate limit in MB/s.
    #[arg(long, default_value_t = 32)]
    pub migrate_rate_limit_mb: u64,

    /// Let slaves follow a migrated master automatically.
    #[arg(long, default_value_t = true)]
    pub slave_reconf_enabled: bool,

    /// Seconds to refuse an overlapping migrate task after one finishes.
    #[arg(long, default_value_t = 600)]
    pub wait_time_if_exists_migrate_task: u64,

    /// Seconds between GC range deletes.
    #[arg(long, default_value_t = 1)]
    pub wait_time_after_migrate: u64,

    /// Number of kv stores backing this node. Must match across the
    /// cluster for migration.
    #[arg(long, default_value_t = 10)]
    pub kv_store_count: u32,

    /// Permit multi-key commands spanning slots (all owned locally).
    #[arg(long, default_value_t = false)]
    pub allow_cross_slot: bool,

    /// Single-master mode: cross-slot always permitted.
    #[arg(long, default_value_t = false)]
    pub cluster_single_node: bool,
}

/// Validated runtime configuration derived from [`Cli`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub bind: String,
    pub port: u16,
    pub cport: u16,
    pub data_dir: PathBuf,
    pub cluster_enabled: bool,
    pub node_timeout_ms: u64,
    pub slave_validity_factor: u64,
    pub require_full_coverage: bool,
    pub migrate_batch_size_kb: usize,
    pub migrate_timeout_s: u64,
    pub migrate_sender_threads: usize,
    pub migrate_receiver_threads: usize,
    pub migrate_rate_limit_mb: u64,
    pub slave_reconf_enabled: bool,
    pub wait_time_if_exists_migrate_task_s: u64,
    pub wait_time_after_migrate_s: u64,
    pub kv_store_count: u32,
    pub allow_cross_slot: bool,
    pub single_node: bool,
}

impl NodeConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, String> {
        let cport = match cli.cport {
            Some(p) => p,
            None => cli
                .port
                .checked_add(10000)
                .ok_or_else(|| format!("port {} leaves no room for the bus port", cli.port))?,
        };
        if cli.kv_store_count == 0 {
            return Err("kv-store-count must be at least 1".into());
        }
        if cli.cluster_node_timeout < 100 {
            return Err("cluster-node-timeout below 100ms is not survivable".into());
        }
        if cli.migrate_sender_threadnum == 0 || cli.migrate_receive_threadnum == 0 {
            return Err("migration thread counts must be at least 1".into());
        }
        Ok(Self {
            bind: cli.bind,
            port: cli.port,
            cport,
            data_dir: cli.data_dir,
            cluster_enabled: cli.cluster_enabled,
            node_timeout_ms: cli.cluster_node_timeout,
            slave_validity_factor: cli.cluster_slave_validity_factor,
            require_full_coverage: cli.cluster_require_full_coverage,
            migrate_batch_size_kb: cli.cluster_migration_batch_size.max(1),
            migrate_timeout_s: cli.cluster_migration_timeout.max(1),
            migrate_sender_threads: cli.migrate_sender_threadnum,
            migrate_receiver_threads: cli.migrate_receive_threadnum,
            migrate_rate_limit_mb: cli.migrate_rate_limit_mb.max(1),
            slave_reconf_enabled: cli.slave_reconf_enabled,
            wait_time_if_exists_migrate_task_s: cli.wait_time_if_exists_migrate_task,
            wait_time_after_migrate_s: cli.wait_time_after_migrate,
            kv_store_count: cli.kv_store_count,
            allow_cross_slot: cli.allow_cross_slot,
            single_node: cli.cluster_single_node,
        })
    }

    pub fn nodes_conf_path(&self) -> PathBuf {
        self.data_dir.join("nodes.conf")
    }

    pub fn migrate_config(&self) -> corvus_cluster::MigrateConfig {
        corvus_cluster::MigrateConfig {
            snapshot_batch_size_kb: self.migrate_batch_size_kb,
            rate_limit_mb: self.migrate_rate_limit_mb,
            network_timeout: Duration::from_secs(self.migrate_timeout_s),
            sender_threads: self.migrate_sender_threads,
            receiver_threads: self.migrate_receiver_threads,
            wait_time_if_exists_migrate_task: Duration::from_secs(
                self.wait_time_if_exists_migrate_task_s,
            ),
            ..corvus_cluster::MigrateConfig::default()
        }
    }

    pub fn gossip_config(&self) -> corvus_cluster::GossipConfig {
        corvus_cluster::GossipConfig {
            node_timeout_ms: self.node_timeout_ms,
            slave_reconf_enabled: self.slave_reconf_enabled,
            ..corvus_cluster::GossipConfig::default()
        }
    }

    pub fn failover_config(&self) -> corvus_cluster::FailoverConfig {
        corvus_cluster::FailoverConfig {
            node_timeout_ms: self.node_timeout_ms,
            slave_validity_factor: self.slave_validity_factor,
            ..corvus_cluster::FailoverConfig::default()
        }
    }

    pub fn gc_config(&self) -> corvus_cluster::GcConfig {
        corvus_cluster::GcConfig {
            wait_time_after_migrate: Duration::from_secs(self.wait_time_after_migrate_s),
            ..corvus_cluster::GcConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("corvus").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_validate() {
        let cfg = NodeConfig::from_cli(cli(&[])).unwrap();
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.cport, 16379);
        assert_eq!(cfg.kv_store_count, 10);
        assert_eq!(cfg.node_timeout_ms, 15000);
    }

    #[test]
    fn explicit_cport_wins() {
        let cfg = NodeConfig::from_cli(cli(&["--port", "16000", "--cport", "26000"])).unwrap();
        assert_eq!(cfg.cport, 26000);
    }

    #[test]
    fn bus_port_overflow_rejected() {
        assert!(NodeConfig::from_cli(cli(&["--port", "60000"])).is_err());
    }

    #[test]
    fn zero_store_count_rejected() {
        assert!(NodeConfig::from_cli(cli(&["--kv-store-count", "0"])).is_err());
    }

    #[test]
    fn tiny_node_timeout_rejected() {
        assert!(NodeConfig::from_cli(cli(&["--cluster-node-timeout", "50"])).is_err());
    }

    #[test]
    fn subsystem_configs_inherit() {
        let cfg = NodeConfig::from_cli(cli(&[
            "--cluster-node-timeout",
            "5000",
            "--cluster-migration-batch-size",
            "64",
        ]))
        .unwrap();
        assert_eq!(cfg.gossip_config().node_timeout_ms, 5000);
        assert_eq!(cfg.failover_config().node_timeout_ms, 5000);
        assert_eq!(cfg.migrate_config().snapshot_batch_size_kb, 64);
    }
}
