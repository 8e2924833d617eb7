//! Network behaviour for Discovery P2P nodes
//!
//! Kademlia is the routing handle; identify and (optionally) mDNS feed it
//! addresses. Gossipsub carries broadcast messages and libp2p-stream carries
//! the framed point-to-point protocol.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, mdns, PeerId, StreamProtocol};

use crate::{NetworkError, Result};

/// Kademlia protocol name
pub const KADEMLIA_PROTOCOL: StreamProtocol = StreamProtocol::new("/discovery-p2p/kad/1.0.0");

/// Identify protocol version string
pub const IDENTIFY_PROTOCOL: &str = "/discovery-p2p/id/1.0.0";

/// Gossipsub heartbeat
pub const GOSSIPSUB_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub gossipsub: gossipsub::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    pub fn new(keypair: &Keypair, enable_mdns: bool) -> Result<Self> {
        let peer_id = PeerId::from(keypair.public());

        let mut kademlia = kad::Behaviour::with_config(
            peer_id,
            MemoryStore::new(peer_id),
            kad::Config::new(KADEMLIA_PROTOCOL),
        );
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mdns = if enable_mdns {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| NetworkError::Transport(format!("mdns: {}", e)))?;
            Some(behaviour)
        } else {
            None
        };

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(GOSSIPSUB_HEARTBEAT)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| NetworkError::Transport(format!("gossipsub config: {}", e)))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| NetworkError::Transport(format!("gossipsub: {}", e)))?;

        Ok(Self {
            kademlia,
            identify,
            mdns: Toggle::from(mdns),
            gossipsub,
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}
