//! Node configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ethermesh_core::CoreConfig;
use serde::{Deserialize, Serialize};

/// A well-known root node this node should register
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootEntry {
    /// Hex-encoded marshaled public identity (address + both public keys)
    pub identity: String,

    /// Physical endpoint to try before any path is learned
    pub bootstrap: Option<SocketAddr>,
}

/// Top-level daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP listen addresses; each gets its own reader task
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,

    /// Where the long-term identity lives
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    /// Where known peers are persisted between runs
    #[serde(default = "default_peer_cache_path")]
    pub peer_cache_path: PathBuf,

    /// Root nodes to register at startup
    #[serde(default)]
    pub roots: Vec<RootEntry>,

    /// Switch timing knobs
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_listen() -> Vec<SocketAddr> {
    vec!["0.0.0.0:9993".parse().unwrap()]
}

fn default_identity_path() -> PathBuf {
    PathBuf::from("identity.json")
}

fn default_peer_cache_path() -> PathBuf {
    PathBuf::from("peers.json")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            identity_path: default_identity_path(),
            peer_cache_path: default_peer_cache_path(),
            roots: Vec::new(),
            core: CoreConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("config {}: {}", path.display(), e))?;
        if config.listen.is_empty() {
            anyhow::bail!("config {}: at least one listen address required", path.display());
        }
        Ok(config)
    }
}
