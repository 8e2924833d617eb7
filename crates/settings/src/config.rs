//! Configuration types

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Result, SettingsError};

/// Port a fresh config listens on. Leaving it unchanged lets the node
/// auto-select the next free port at startup.
pub const DEFAULT_PORT: u16 = 8001;

/// Interface name used when the file does not set one
pub const DEFAULT_INTERFACE_NAME: &str = "hs0";

/// Broadcast topic name used when the file does not set one
pub const DEFAULT_TOPIC: &str = "p2pdb";

/// Node configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local interface settings
    #[serde(default)]
    pub interface: Interface,

    /// Peer IDs this node connects to and accepts streams from
    #[serde(default)]
    pub peers: Vec<String>,

    /// Bootstrap routing peers (format: "peer_id@multiaddr")
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Discover peers on the local network via mDNS
    #[serde(default = "default_true")]
    pub mdns: bool,

    /// Broadcast topic name
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Path the config was read from (not serialized)
    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Everything a local node needs to know about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default = "default_name")]
    pub name: String,

    /// Peer ID derived from the private key (informational)
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_port")]
    pub listen_port: u16,

    /// Base64 protobuf-encoded libp2p keypair
    #[serde(default)]
    pub private_key: String,
}

fn default_true() -> bool {
    true
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_name() -> String {
    DEFAULT_INTERFACE_NAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            name: default_name(),
            id: String::new(),
            listen_port: DEFAULT_PORT,
            private_key: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            peers: Vec::new(),
            bootstrap: Vec::new(),
            mdns: true,
            topic: default_topic(),
            path: None,
        }
    }
}

impl Config {
    /// Create a config with a freshly generated Ed25519 identity
    pub fn generate(name: &str) -> Result<Self> {
        let keypair = Keypair::generate_ed25519();
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|e| SettingsError::InvalidKey(e.to_string()))?;

        Ok(Self {
            interface: Interface {
                name: name.to_string(),
                id: PeerId::from(keypair.public()).to_string(),
                listen_port: DEFAULT_PORT,
                private_key: STANDARD.encode(encoded),
            },
            ..Default::default()
        })
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
        config.path = Some(path.to_path_buf());
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write the config, creating parent directories as needed
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Path this config was read from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Decode the node's libp2p keypair
    pub fn keypair(&self) -> Result<Keypair> {
        let bytes = STANDARD
            .decode(self.interface.private_key.trim())
            .map_err(|e| SettingsError::InvalidKey(e.to_string()))?;
        Keypair::from_protobuf_encoding(&bytes).map_err(|e| SettingsError::InvalidKey(e.to_string()))
    }

    /// Parse bootstrap entries in format "peer_id@multiaddr".
    /// Malformed entries are skipped with a warning.
    pub fn bootstrap_peers(&self) -> Vec<(PeerId, Multiaddr)> {
        self.bootstrap
            .iter()
            .filter_map(|entry| match parse_bootstrap_entry(entry) {
                Some(peer) => Some(peer),
                None => {
                    warn!(
                        "Invalid bootstrap entry: {}. Expected: <peer_id>@<multiaddr>",
                        entry
                    );
                    None
                }
            })
            .collect()
    }
}

fn parse_bootstrap_entry(entry: &str) -> Option<(PeerId, Multiaddr)> {
    let (peer_id, addr) = entry.split_once('@')?;
    let peer_id: PeerId = peer_id.trim().parse().ok()?;
    let addr: Multiaddr = addr.trim().parse().ok()?;
    Some((peer_id, addr))
}
