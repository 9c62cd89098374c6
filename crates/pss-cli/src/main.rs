//! pss CLI
//!
//! Thin wrapper around pss-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Generate an identity
//! pss keygen
//!
//! # Show the topic of a protocol
//! pss topic ping 1
//!
//! # Ping between two in-process nodes across key renegotiations
//! pss simulate --send-limit 3 --messages 10 --pong
//!
//! # Run a gossip-backed node and ping a peer
//! pss node --bootstrap <endpoint_id>@<ip:port> --peer <public_key>
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iroh::{EndpointAddr, EndpointId};
use pss_core::ping::{ping_protocol, ping_topic, Ping, PingHandle};
use pss_core::{
    Client, GossipOverlay, Keypair, MemoryNetwork, PeerAddress, Pss, PssConfig, PublicKey, Topic,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// pss - encrypted topic messaging over a swarm
#[derive(Parser)]
#[command(name = "pss")]
#[command(version = "0.1.0")]
#[command(about = "pss - encrypted topic messaging over a swarm")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity key pair
    Keygen,

    /// Print the topic of a protocol name and version
    Topic {
        name: String,
        version: u32,
    },

    /// Run the ping protocol between two in-process nodes
    Simulate {
        /// Uses per session key (overrides the config file)
        #[arg(long)]
        send_limit: Option<u16>,

        /// Number of pings to send
        #[arg(short, long, default_value_t = 5)]
        messages: u32,

        /// Have the receiving side answer every ping
        #[arg(long)]
        pong: bool,
    },

    /// Run a gossip-backed node speaking the ping protocol
    Node {
        /// Identity secret as hex (a fresh one is generated when omitted)
        #[arg(long)]
        secret: Option<String>,

        /// Swarm members to join through: <endpoint_id>[@<ip:port>]
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Peers to ping: <public_key>[@<address>]
        #[arg(short, long)]
        peer: Vec<String>,

        /// Seconds between pings
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Answer every ping
        #[arg(long)]
        pong: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<PssConfig> {
    match path {
        Some(path) => PssConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(PssConfig::default()),
    }
}

/// Parse a 32-byte secret from hex
fn parse_secret(s: &str) -> Result<Keypair> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| anyhow::anyhow!("Invalid secret '{}': {}", s, e))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Secret must be 32 bytes"))?;
    Ok(Keypair::from_seed(seed))
}

/// Parse `<endpoint_id>[@<ip:port>]`
fn parse_bootstrap(s: &str) -> Result<EndpointAddr> {
    let (id, socket) = match s.split_once('@') {
        Some((id, socket)) => (id, Some(socket)),
        None => (s, None),
    };
    let id = EndpointId::from_str(id).map_err(|e| anyhow::anyhow!("Invalid endpoint id '{}': {}", id, e))?;
    let mut addr = EndpointAddr::new(id);
    if let Some(socket) = socket {
        let socket = socket
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid socket address '{}': {}", socket, e))?;
        addr = addr.with_ip_addr(socket);
    }
    Ok(addr)
}

/// Parse `<public_key>[@<address>]`; the address defaults to the key's base address
fn parse_peer(s: &str) -> Result<(PublicKey, PeerAddress)> {
    let (key, address) = match s.split_once('@') {
        Some((key, address)) => (key, Some(address)),
        None => (s, None),
    };
    let key = PublicKey::from_str(key)?;
    let address = match address {
        Some(address) => PeerAddress::from_str(address)?,
        None => PeerAddress::from_public_key(&key),
    };
    Ok((key, address))
}

fn print_identity(keypair: &Keypair) {
    let public_key = keypair.public_key();
    println!("  Public key: {}", public_key);
    println!("  Address: {}", PeerAddress::from_public_key(&public_key));
}

async fn next_ping(handle: &mut PingHandle) -> Result<pss_core::ping::PingMsg> {
    tokio::time::timeout(Duration::from_secs(10), handle.recv())
        .await
        .context("Timed out waiting for ping")?
        .context("Ping instance stopped")
}

struct SimNode {
    pss: Arc<Pss>,
    client: Client,
    ping: PingHandle,
}

fn sim_node(network: &MemoryNetwork, config: PssConfig, pong: bool) -> Result<SimNode> {
    let keypair = Keypair::generate();
    let overlay = network.join(PeerAddress::from_public_key(&keypair.public_key()));
    let pss = Pss::start(keypair, Arc::new(overlay), config)?;
    let client = Client::new(pss.clone());
    let (ping, handle) = Ping::new(pong);
    client.run_protocol(CancellationToken::new(), ping_protocol(ping))?;
    Ok(SimNode {
        pss,
        client,
        ping: handle,
    })
}

async fn simulate(mut config: PssConfig, send_limit: Option<u16>, messages: u32, pong: bool) -> Result<()> {
    if let Some(limit) = send_limit {
        config.handshake = config.handshake.with_send_limit(limit);
    }
    config.validate()?;

    let network = MemoryNetwork::new();
    let mut left = sim_node(&network, config.clone(), false)?;
    let mut right = sim_node(&network, config.clone(), pong)?;
    let topic = ping_topic();
    let right_key = right.pss.public_key();

    println!("Simulating ping over pss");
    println!("  Send limit: {}", config.handshake.send_limit);
    println!("  Topic: {}", topic);
    println!();

    left.client
        .add_pss_peer(right_key, right.pss.base_address(), topic)
        .await
        .context("Failed to add peer")?;
    info!(peer = %right_key.short(), "Simulation peer added");

    let mut keys_seen = Vec::new();
    for n in 1..=messages {
        left.ping.ping()?;
        next_ping(&mut right.ping).await?;
        if pong {
            next_ping(&mut left.ping).await?;
        }

        match left.pss.handshake().keys(&right_key, &topic).last() {
            Some(key) => {
                if !keys_seen.contains(&key.id) {
                    keys_seen.push(key.id);
                }
                println!("ping {}/{} delivered (key {}, {} uses left)", n, messages, key.id, key.remaining);
            }
            None => println!("ping {}/{} delivered (key used up)", n, messages),
        }
    }

    println!();
    println!("Delivered {}/{} pings", messages, messages);
    println!("Session keys observed: {}", keys_seen.len());

    left.client.shutdown();
    right.client.shutdown();
    left.pss.shutdown();
    right.pss.shutdown();
    Ok(())
}

async fn run_node(
    config: PssConfig,
    secret: Option<String>,
    bootstrap: Vec<String>,
    peers: Vec<String>,
    interval: u64,
    pong: bool,
) -> Result<()> {
    let keypair = match secret {
        Some(secret) => parse_secret(&secret)?,
        None => Keypair::generate(),
    };
    let bootstrap = bootstrap
        .iter()
        .map(|s| parse_bootstrap(s))
        .collect::<Result<Vec<_>>>()?;
    let peers = peers.iter().map(|s| parse_peer(s)).collect::<Result<Vec<_>>>()?;

    let address = PeerAddress::from_public_key(&keypair.public_key());
    println!("Starting pss node...");
    println!();
    println!("Identity:");
    print_identity(&keypair);

    let overlay = Arc::new(GossipOverlay::bind(address, None, bootstrap).await?);
    println!();
    println!("Swarm:");
    println!("  Endpoint: {}", overlay.endpoint_id());

    let pss = Pss::start(keypair, overlay.clone(), config)?;
    let client = Client::new(pss.clone());
    let (ping, mut handle) = Ping::new(pong);
    let cancel = CancellationToken::new();
    client.run_protocol(cancel.clone(), ping_protocol(ping))?;

    for (key, address) in peers {
        match client.add_pss_peer(key, address, ping_topic()).await {
            Ok(()) => println!("  Peer added: {}", key),
            Err(e) => {
                warn!(peer = %key.short(), error = %e, "Failed to add peer");
                println!("  Peer {} not reachable yet: {}", key, e);
            }
        }
    }

    println!();
    println!("Node is running. Press Ctrl+C to stop.");
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            _ = ticker.tick() => {
                if !client.peers(&ping_topic()).is_empty() {
                    handle.ping()?;
                }
            }
            msg = handle.recv() => match msg {
                Some(msg) if msg.pong => println!("[pong] sent at {} ms", msg.created_ms),
                Some(msg) => println!("[ping] sent at {} ms", msg.created_ms),
                None => break,
            },
        }
    }

    println!("Shutting down...");
    cancel.cancel();
    client.shutdown();
    pss.shutdown();
    overlay.shutdown().await?;
    println!("Goodbye.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Keygen => {
            let keypair = Keypair::generate();
            println!("Identity:");
            print_identity(&keypair);
            println!("  Secret: {}", hex::encode(keypair.to_bytes()));
        }

        Commands::Topic { name, version } => {
            let topic = Topic::from_protocol(&name, version);
            println!("{}", topic);
        }

        Commands::Simulate {
            send_limit,
            messages,
            pong,
        } => simulate(config, send_limit, messages, pong).await?,

        Commands::Node {
            secret,
            bootstrap,
            peer,
            interval,
            pong,
        } => run_node(config, secret, bootstrap, peer, interval, pong).await?,
    }

    Ok(())
}
