//! Configured peers
//!
//! The peer set is fixed at startup. [`PeerDirectory`] decodes every
//! configured identifier once; the [`AllowList`] derived from it is the only
//! authority consulted when an inbound stream arrives.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use libp2p::PeerId;

use crate::{NetworkError, Result};

/// Connection status of a configured peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Not yet reached
    Pending,
    /// A trial stream was opened successfully
    Connected,
    /// Gave up after a non-transient failure
    Failed,
}

impl PeerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PeerStatus::Pending)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Pending => write!(f, "pending"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A configured peer: its identifier as written in the config, the decoded
/// peer ID, and its connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub peer_id: PeerId,
    pub status: PeerStatus,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>, peer_id: PeerId) -> Self {
        Self {
            id: id.into(),
            peer_id,
            status: PeerStatus::Pending,
        }
    }
}

/// Decoded peer table, in configuration order
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    records: Vec<PeerRecord>,
}

impl PeerDirectory {
    /// Decode every configured identifier.
    ///
    /// Any malformed identifier fails the whole directory. Duplicates
    /// collapse to the first occurrence.
    pub fn resolve<S: AsRef<str>>(ids: &[S]) -> Result<Self> {
        let mut records: Vec<PeerRecord> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref().trim();
            let peer_id = id.parse::<PeerId>().map_err(|e| NetworkError::InvalidPeerId {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
            if records.iter().any(|r| r.peer_id == peer_id) {
                continue;
            }
            records.push(PeerRecord::new(id, peer_id));
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[PeerRecord] {
        &self.records
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.records.iter().map(|r| r.peer_id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Build the allow-list of peers whose streams are accepted
    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.records.iter().map(|r| r.peer_id))
    }
}

/// Read-only set of peers permitted to open streams to this node.
///
/// Cloning shares the underlying set; there is no way to mutate it after
/// construction. An empty list rejects every stream.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    peers: Arc<HashSet<PeerId>>,
}

impl AllowList {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: Arc::new(peers.into_iter().collect()),
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
