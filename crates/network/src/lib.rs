//! Discovery P2P Network
//!
//! Bring-up building blocks for a node in a fixed-membership overlay.
//!
//! ## Features
//!
//! - Listen port selection with automatic fallback for the default port
//! - Static peer directory and read-only allow-list
//! - Length-prefixed framing over authenticated libp2p streams
//! - Discovery loop that retries unreachable peers until they connect
//! - Kademlia routing, optional mDNS, gossipsub broadcast
//! - Shutdown state shared by every background task

mod behaviour;
mod broadcast;
mod discovery;
mod handler;
mod node;
mod peers;
mod port;
mod protocol;
mod shutdown;

pub use behaviour::{NodeBehaviour, NodeBehaviourEvent, KADEMLIA_PROTOCOL, IDENTIFY_PROTOCOL};
pub use broadcast::{topic_name, BroadcastMessage, DataMessage, Subscription, Topic};
pub use discovery::{
    classify_open_error, DialOutcome, Dialer, DiscoveryLoop, DiscoveryReport, StreamDialer,
    DIAL_TIMEOUT, DISCOVERY_RETRY_DELAY,
};
pub use handler::{accept_loop, handle_stream, print_frames, InboundFrame, StreamOutcome};
pub use node::{build_swarm, Host, NodeOptions, IDLE_CONNECTION_TIMEOUT, ROUTING_REFRESH_INTERVAL};
pub use peers::{AllowList, PeerDirectory, PeerRecord, PeerStatus};
pub use port::{negotiate_port, negotiate_port_with, port_is_free};
pub use protocol::{
    encode_frame, read_frame, write_frame, FrameBuffer,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, STREAM_PROTOCOL,
};
pub use shutdown::{Shutdown, ShutdownListener, ShutdownState};

// Re-export commonly used libp2p types
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId};
pub use libp2p_stream::{Control, IncomingStreams};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("could not create node, listen port {0} already in use by something else")]
    PortInUse(u16),

    #[error("failed to find open port at or above {0}")]
    NoFreePort(u16),

    #[error("listen port must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid peer ID {id:?}: {reason}")]
    InvalidPeerId { id: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Listen error: {0}")]
    Listen(String),

    #[error("Stream protocol already registered: {0}")]
    ProtocolRegistered(String),

    #[error("Host closed")]
    HostClosed,

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
