//! Broadcast messages over gossipsub

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::node::HostCommand;
use crate::{NetworkError, Result};

/// Gossipsub topic for a named room
pub fn topic_name(name: &str) -> String {
    format!("chat-room:{}", name)
}

/// JSON body of every broadcast message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub message: String,
    pub sender_id: String,
    pub sender_nick: String,
}

impl DataMessage {
    pub fn new(message: impl Into<String>, sender_id: &PeerId, sender_nick: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sender_id: sender_id.to_string(),
            sender_nick: sender_nick.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| NetworkError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

/// A raw message received on a joined topic
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// Handle to a joined topic
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    commands: mpsc::Sender<HostCommand>,
}

impl Topic {
    pub(crate) fn new(name: String, commands: mpsc::Sender<HostCommand>) -> Self {
        Self { name, commands }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget publish. Delivery failures (e.g. no subscribed
    /// peers yet) are logged by the host, not returned.
    pub async fn publish(&self, data: Vec<u8>) -> Result<()> {
        self.commands
            .send(HostCommand::Publish {
                topic: self.name.clone(),
                data,
            })
            .await
            .map_err(|_| NetworkError::HostClosed)
    }

    /// Subscribe to messages published by other peers on this topic
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(HostCommand::Subscribe {
                topic: self.name.clone(),
                reply,
            })
            .await
            .map_err(|_| NetworkError::HostClosed)?;
        let messages = rx.await.map_err(|_| NetworkError::HostClosed)??;
        Ok(Subscription { messages })
    }
}

/// Stream of messages on a subscribed topic
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<BroadcastMessage>,
}

impl Subscription {
    /// Wait for the next message. `None` once the host has closed.
    pub async fn next(&mut self) -> Option<BroadcastMessage> {
        self.messages.recv().await
    }
}
