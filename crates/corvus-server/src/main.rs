mod cluster_cmd;
mod config;
mod node;
mod resp;
mod session;

use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corvus=info".into()),
        )
        .init();

    let cli = config::Cli::parse();
    let config = match config::NodeConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    info!("corvus starting...");
    let node = match node::Node::bootstrap(config) {
        Ok(node) => node,
        Err(e) => {
            error!("bootstrap failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = node.run().await {
        error!("node exited with error: {e}");
        std::process::exit(1);
    }
}
