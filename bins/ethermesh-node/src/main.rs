//! Ethermesh Node Daemon
//!
//! Binds the configured UDP sockets, restores the long-term identity,
//! registers the root set, and runs the switch's ingress readers plus the
//! periodic maintenance loop until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethermesh_core::{Switch, Topology};
use ethermesh_crypto::{Identity, IdentityPublic};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod binding;
mod config;
mod handler;
mod multicast;
mod store;

use binding::UdpBindings;
use config::NodeConfig;
use handler::NodeHandler;
use multicast::DirectMulticaster;
use store::{decode_hex, encode_hex, JsonPeerStore};

/// Ethermesh - peer-to-peer virtual Ethernet overlay node
#[derive(Parser)]
#[command(name = "ethermesh-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "ethermesh.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run,

    /// Generate a new identity
    Init {
        /// Force overwrite of an existing identity
        #[arg(short, long)]
        force: bool,
    },
}

/// Wall-clock milliseconds, the time base the core runs on
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = NodeConfig::load(&cli.config)?;

    match cli.command {
        Commands::Init { force } => init_identity(&config, force),
        Commands::Run => run(config).await,
    }
}

fn init_identity(config: &NodeConfig, force: bool) -> Result<()> {
    if config.identity_path.exists() && !force {
        anyhow::bail!(
            "identity already exists at {} (use --force to replace it)",
            config.identity_path.display()
        );
    }
    let identity = Identity::generate();
    save_identity(&config.identity_path, &identity)?;
    info!(address = %identity.address(), file = %config.identity_path.display(), "identity generated");
    println!("{}", identity.address());
    Ok(())
}

async fn run(config: NodeConfig) -> Result<()> {
    let identity = Arc::new(load_or_create_identity(&config.identity_path)?);
    info!(address = %identity.address(), "starting ethermesh node");

    let store = Arc::new(JsonPeerStore::open(config.peer_cache_path.clone()));
    let topology = Arc::new(Topology::new(identity.clone(), Some(store)));

    for root in &config.roots {
        match parse_root_identity(&root.identity) {
            Ok(root_identity) => {
                let bootstrap = root.bootstrap.map(|addr| (0i64, addr));
                info!(root = %root_identity.address(), ?bootstrap, "registering root");
                topology.add_root(root_identity, bootstrap);
            }
            Err(e) => warn!(error = %e, "skipping malformed root entry"),
        }
    }

    let bindings = UdpBindings::bind(&config.listen).await?;
    info!(listening = ?bindings.local_addrs(), "sockets bound");

    let handler = NodeHandler::new(topology.clone());
    let switch = Arc::new(Switch::new(
        identity.clone(),
        topology.clone(),
        bindings.clone(),
        handler.clone(),
        Arc::new(DirectMulticaster),
        config.core.clone(),
    ));
    handler.bind_switch(switch.clone());

    bindings.spawn_readers(switch.clone());

    // Greet the roots so they learn our endpoint and identity
    for (peer, is_root) in topology.peers_with_root_flag() {
        if is_root {
            switch.send_hello(peer.address(), now_ms()).await;
        }
    }

    let maintenance = {
        let switch = switch.clone();
        let topology = topology.clone();
        tokio::spawn(async move {
            loop {
                let now = now_ms();
                let delay = switch.do_timer_tasks(now).await;
                topology.do_periodic_tasks(now);
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    maintenance.abort();
    topology.save_all();
    Ok(())
}

fn load_or_create_identity(path: &Path) -> Result<Identity> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity {}", path.display()))?;
        let stored: StoredIdentity = serde_json::from_str(&text)
            .with_context(|| format!("parsing identity {}", path.display()))?;
        let signing: [u8; 32] = decode_hex(&stored.signing)
            .and_then(|v| v.try_into().ok())
            .context("identity signing key malformed")?;
        let agreement: [u8; 32] = decode_hex(&stored.agreement)
            .and_then(|v| v.try_into().ok())
            .context("identity agreement key malformed")?;
        Ok(Identity::from_secret_keys(signing, agreement))
    } else {
        let identity = Identity::generate();
        save_identity(path, &identity)?;
        info!(address = %identity.address(), "generated new identity");
        Ok(identity)
    }
}

fn save_identity(path: &Path, identity: &Identity) -> Result<()> {
    let (signing, agreement) = identity.export_secret_keys();
    let stored = StoredIdentity {
        signing: encode_hex(&signing),
        agreement: encode_hex(&agreement),
    };
    std::fs::write(path, serde_json::to_string_pretty(&stored)?)
        .with_context(|| format!("writing identity {}", path.display()))?;
    Ok(())
}

fn parse_root_identity(hex: &str) -> Result<IdentityPublic> {
    let bytes = decode_hex(hex).context("root identity is not valid hex")?;
    IdentityPublic::unmarshal(&bytes).context("root identity does not parse")
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredIdentity {
    signing: String,
    agreement: String,
}
