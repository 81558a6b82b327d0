use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;

use rumor_chain::api_server::ControlApiServer;
use rumor_chain::config::{Config, NodeConfig};
use rumor_chain::network::PeerAddress;
use rumor_chain::node::NodeRegistry;

#[derive(Parser)]
#[command(name = "rumor-node")]
#[command(about = "Gossip node with rumor mongering, private routing and a proof-of-work chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one node and its control API
    Start {
        /// Node name; a random one is picked when empty
        #[arg(long, env = "NAME", default_value = "")]
        name: String,
        #[arg(long, env = "ADDRESS", default_value = "127.0.0.1:5000")]
        gossip_addr: String,
        /// Comma separated ip:port list
        #[arg(long, env = "PEERS", default_value = "")]
        peers: String,
        #[arg(long, default_value = "8080")]
        ui_port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        api_host: String,
        /// JSON file with gossip and chain tunables
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run only the control API; nodes are started through it
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        api_host: String,
        #[arg(long, env = "SERVER_PORT", default_value = "8080")]
        api_port: u16,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::from_file(&path)?),
        None => Ok(Config::default()),
    }
}

fn random_name() -> String {
    format!("node-{:08x}", rand::random::<u32>())
}

async fn serve_until_ctrl_c(server: ControlApiServer, registry: NodeRegistry) {
    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!("control API failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    registry.stop_all().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            name,
            gossip_addr,
            peers,
            ui_port,
            api_host,
            config,
        } => {
            let tunables = load_config(config)?;
            let name = if name.is_empty() { random_name() } else { name };
            let node_config = NodeConfig::new(name, gossip_addr.parse::<PeerAddress>()?)
                .with_peers(PeerAddress::parse_list(&peers)?);

            info!("🚀 starting node {}", node_config.name);
            info!("📡 gossip address {}", node_config.gossip_addr);
            info!("🌐 control API on {}:{}", api_host, ui_port);

            let registry = NodeRegistry::new(tunables);
            registry
                .start_node(
                    &node_config.name,
                    node_config.gossip_addr,
                    node_config.peers.clone(),
                )
                .await?;

            let server = ControlApiServer::new(api_host, ui_port, registry.clone());
            serve_until_ctrl_c(server, registry).await;
        }
        Commands::Serve {
            api_host,
            api_port,
            config,
        } => {
            let registry = NodeRegistry::new(load_config(config)?);
            let server = ControlApiServer::new(api_host, api_port, registry.clone());
            serve_until_ctrl_c(server, registry).await;
        }
    }

    Ok(())
}
