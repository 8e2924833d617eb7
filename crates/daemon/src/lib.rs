//! Discovery P2P Daemon
//!
//! Brings a node up, keeps it running and takes it down again.
//!
//! ## Components
//!
//! - **NodeService**: port selection, peer resolution, host creation,
//!   stream handler registration and background tasks
//! - **RunningNode**: handle to a node that is up, with its discovery report
//! - **ShutdownController**: turns termination signals into an orderly close
//!
//! ## Broadcast Modes
//!
//! - `Publish` - send one message per second on the node's topic
//! - `Receive` - log every message other nodes publish on the topic

mod node;
mod shutdown;

pub use node::{BroadcastMode, NodeConfig, NodeService, RunningNode, PUBLISH_INTERVAL};
pub use shutdown::{termination_signals, ShutdownController, SHUTDOWN_GRACE_PERIOD};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Network error: {0}")]
    Network(#[from] discovery_network::NetworkError),

    #[error("Settings error: {0}")]
    Settings(#[from] discovery_settings::SettingsError),

    #[error("Shutdown forced by repeated signal")]
    ForcedShutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
