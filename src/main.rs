//! Overlay peer shell
//!
//! Joins the overlay and broadcasts every line read from stdin. Commands:
//! `ping`, `state`, `status` and `exit`.

use bytes::Bytes;
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use xor_overlay::peer::config::{EntryNode, NetworkConfig, DEFAULT_PORT};
use xor_overlay::{PacketReader, PacketWriter, PeerId, PeerNetwork};

/// Searched in order when no config file is given
const CONFIG_SEARCH_PATHS: [&str; 3] = ["peer.cfg", "../peer.cfg", "../../peer.cfg"];

const FALLBACK_PORT_OFFSET: u16 = 32;
const FALLBACK_ENTRY_COUNT: u16 = 10;

#[derive(Parser)]
#[command(name = "overlay")]
#[command(version)]
#[command(about = "XOR-metric peer-to-peer overlay node", long_about = None)]
struct Cli {
    /// Bootstrap config file (default: first peer.cfg found)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Join without listening for inbound connections
    #[arg(long)]
    client_only: bool,

    /// Local peer as address:port
    #[arg(short, long)]
    local: Option<String>,

    /// Additional entry node as address:port (repeatable)
    #[arg(short, long)]
    entry: Vec<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, cli.client_only))
}

fn load_config(cli: &Cli) -> Result<NetworkConfig, Box<dyn Error>> {
    let path = cli.config.clone().or_else(|| {
        CONFIG_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    });

    let mut config = match path {
        Some(path) => {
            log::info!("Loading config {}", path.display());
            NetworkConfig::load(&path)?
        }
        None => {
            log::info!("No config file found, using local defaults");
            NetworkConfig {
                max_port_offset: FALLBACK_PORT_OFFSET,
                entry_nodes: (0..FALLBACK_ENTRY_COUNT)
                    .map(|i| EntryNode {
                        address: "localhost".to_string(),
                        port: DEFAULT_PORT + i,
                    })
                    .collect(),
                ..Default::default()
            }
        }
    };

    if let Some(local) = &cli.local {
        let (address, port) = parse_host_port(local)?;
        config.local_address = address;
        config.local_port = port;
    }
    for entry in &cli.entry {
        let (address, port) = parse_host_port(entry)?;
        config.entry_nodes.push(EntryNode { address, port });
    }

    Ok(config)
}

fn parse_host_port(value: &str) -> Result<(String, u16), Box<dyn Error>> {
    match value.rsplit_once(':') {
        Some((address, port)) => Ok((address.to_string(), port.parse()?)),
        None => Ok((value.to_string(), DEFAULT_PORT)),
    }
}

async fn run(config: NetworkConfig, client_only: bool) -> Result<(), Box<dyn Error>> {
    let network = PeerNetwork::with_config(config);
    network.set_message_handler(|source: PeerId, payload: Bytes| {
        println!("{}: {}", source.short(), message_text(payload));
    });

    let state = network.connect(client_only).await;
    println!("Local id {} ({})", network.local_id(), state);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "exit" => break,
            "ping" => {
                network.broadcast_ping();
            }
            "state" => println!("{}", network.state()),
            "status" => println!("{}", serde_json::to_string_pretty(&network.status())?),
            _ => {
                let mut writer = PacketWriter::new();
                writer.write_str(&line);
                network.broadcast(writer.as_slice());
            }
        }
    }

    network.disconnect().await;
    Ok(())
}

/// Messages are NUL-terminated strings; anything else is shown lossily
fn message_text(payload: Bytes) -> String {
    PacketReader::new(payload.clone())
        .read_str()
        .unwrap_or_else(|_| String::from_utf8_lossy(&payload).into_owned())
}
