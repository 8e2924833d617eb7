//! Network host
//!
//! The swarm is owned by a single driver task. [`Host`] is a cheap clonable
//! handle to it: stream control for the framed protocol plus a command
//! channel for routing, broadcast and shutdown. Closing the host stops the
//! driver and drops the swarm, which tears down every listener, connection
//! and stream.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::{Control, IncomingStreams};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use crate::broadcast::{BroadcastMessage, Topic};
use crate::{NetworkError, Result};

/// Idle connections are closed after this long
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the routing service looks up watched peers that are not
/// connected
pub const ROUTING_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const COMMAND_CHANNEL_SIZE: usize = 64;
const SUBSCRIPTION_CHANNEL_SIZE: usize = 256;

/// Host construction options
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub listen_ip: IpAddr,
    /// TCP port; 0 lets the OS pick
    pub port: u16,
    pub mdns: bool,
    pub bootstrap: Vec<(PeerId, Multiaddr)>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            mdns: true,
            bootstrap: Vec::new(),
        }
    }
}

impl NodeOptions {
    pub fn listen_addr(&self) -> Multiaddr {
        Multiaddr::from(self.listen_ip).with(Protocol::Tcp(self.port))
    }
}

/// Build a TCP + Noise + Yamux swarm around [`NodeBehaviour`]
pub fn build_swarm(keypair: Keypair, options: &NodeOptions) -> Result<Swarm<NodeBehaviour>> {
    let behaviour = NodeBehaviour::new(&keypair, options.mdns)?;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_behaviour(|_| behaviour)
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}

#[derive(Debug)]
pub(crate) enum HostCommand {
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
        done: oneshot::Sender<()>,
    },
    Watch {
        peers: Vec<PeerId>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<BroadcastMessage>>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Shared handle to a running node
#[derive(Clone)]
pub struct Host {
    local_peer_id: PeerId,
    control: Control,
    commands: mpsc::Sender<HostCommand>,
}

impl Host {
    /// Build the swarm, start listening, seed routing with the bootstrap
    /// peers and spawn the driver task. Must be called inside a tokio
    /// runtime.
    pub fn start(keypair: Keypair, options: NodeOptions) -> Result<Self> {
        let mut swarm = build_swarm(keypair, &options)?;

        let listen_addr = options.listen_addr();
        swarm
            .listen_on(listen_addr.clone())
            .map_err(|e| NetworkError::Listen(format!("{}: {}", listen_addr, e)))?;

        for (peer, addr) in &options.bootstrap {
            swarm.behaviour_mut().kademlia.add_address(peer, addr.clone());
        }
        if !options.bootstrap.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!("Kademlia bootstrap failed: {:?}", e);
            }
        }

        Ok(Self::spawn(swarm))
    }

    /// Take ownership of an already configured swarm and drive it
    pub fn spawn(swarm: Swarm<NodeBehaviour>) -> Self {
        let local_peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();
        let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let driver = HostDriver {
            swarm,
            commands: rx,
            watched: HashSet::new(),
            subscribers: HashMap::new(),
            listen_addrs: Vec::new(),
        };
        tokio::spawn(driver.run());

        info!("Node {} started", local_peer_id);
        Self {
            local_peer_id,
            control,
            commands,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Stream control for opening framed streams
    pub fn stream_control(&self) -> Control {
        self.control.clone()
    }

    /// Register a protocol and receive its inbound streams
    pub fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams> {
        self.control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| NetworkError::ProtocolRegistered(protocol.to_string()))
    }

    /// Tell the routing table where a peer can be reached. Returns once
    /// the address is in the table, so a dial issued afterwards can use it.
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(HostCommand::AddAddress { peer, addr, done }).await?;
        rx.await.map_err(|_| NetworkError::HostClosed)
    }

    /// Keep looking these peers up in the DHT until they are connected
    pub async fn watch_peers(&self, peers: Vec<PeerId>) -> Result<()> {
        self.send(HostCommand::Watch { peers }).await
    }

    /// Join a broadcast topic
    pub fn join(&self, topic: &str) -> Topic {
        Topic::new(topic.to_string(), self.commands.clone())
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::ListenAddrs { reply }).await?;
        rx.await.map_err(|_| NetworkError::HostClosed)
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::ConnectedPeers { reply }).await?;
        rx.await.map_err(|_| NetworkError::HostClosed)
    }

    /// Stop the driver and release every listener and stream. Closing an
    /// already closed host is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.commands.send(HostCommand::Close { done }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: HostCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::HostClosed)
    }
}

struct HostDriver {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    watched: HashSet<PeerId>,
    subscribers: HashMap<TopicHash, Vec<mpsc::Sender<BroadcastMessage>>>,
    listen_addrs: Vec<Multiaddr>,
}

impl HostDriver {
    async fn run(mut self) {
        let mut refresh = tokio::time::interval(ROUTING_REFRESH_INTERVAL);

        let done = loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(done) = self.handle_command(command) {
                            break Some(done);
                        }
                    }
                    None => break None,
                },
                _ = refresh.tick() => self.refresh_routes(),
            }
        };

        let local_peer_id = *self.swarm.local_peer_id();
        drop(self);
        info!("Node {} closed", local_peer_id);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Returns the completion sender when the command is `Close`
    fn handle_command(&mut self, command: HostCommand) -> Option<oneshot::Sender<()>> {
        match command {
            HostCommand::AddAddress { peer, addr, done } => {
                self.swarm.behaviour_mut().kademlia.add_address(&peer, addr);
                let _ = done.send(());
            }
            HostCommand::Watch { peers } => {
                self.watched.extend(peers);
                self.refresh_routes();
            }
            HostCommand::Subscribe { topic, reply } => {
                let _ = reply.send(self.subscribe(&topic));
            }
            HostCommand::Publish { topic, data } => {
                let topic = IdentTopic::new(topic);
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                    debug!("Publish to {} failed: {:?}", topic, e);
                }
            }
            HostCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            HostCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            HostCommand::Close { done } => return Some(done),
        }
        None
    }

    fn subscribe(&mut self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>> {
        let topic = IdentTopic::new(topic);
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| NetworkError::Subscribe(format!("{:?}", e)))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        self.subscribers.entry(topic.hash()).or_default().push(tx);
        Ok(rx)
    }

    /// Look up every watched peer that is not currently connected
    fn refresh_routes(&mut self) {
        let pending: Vec<PeerId> = self
            .watched
            .iter()
            .filter(|peer| !self.swarm.is_connected(peer))
            .copied()
            .collect();
        for peer in pending {
            self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("Connected to {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    debug!("Disconnected from {}", peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!("Dial to {:?} failed: {}", peer_id, error);
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            NodeBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    debug!("mDNS discovered {} at {}", peer_id, addr);
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            NodeBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::GetClosestPeers(Ok(ok)),
                ..
            }) => {
                for info in ok.peers {
                    if self.watched.contains(&info.peer_id) {
                        for addr in info.addrs {
                            self.swarm.behaviour_mut().kademlia.add_address(&info.peer_id, addr);
                        }
                    }
                }
            }
            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                self.deliver(message);
            }
            _ => {}
        }
    }

    fn deliver(&mut self, message: gossipsub::Message) {
        let Some(senders) = self.subscribers.get_mut(&message.topic) else {
            return;
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let msg = BroadcastMessage {
                source: message.source,
                data: message.data.clone(),
            };
            if tx.try_send(msg).is_err() {
                warn!("Subscriber on {} lagging, dropped message", message.topic);
            }
        }
    }
}
