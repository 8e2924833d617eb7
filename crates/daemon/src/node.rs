//! Node bring-up
//!
//! [`NodeService::start`] performs every fallible startup step before any
//! background work begins, so a bad configuration fails fast and leaves
//! nothing running. The returned [`RunningNode`] owns the host, the
//! shutdown state and the background tasks.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use discovery_network::{
    accept_loop, negotiate_port, print_frames, topic_name, DataMessage, DiscoveryLoop,
    DiscoveryReport, Host, IncomingStreams, Keypair, Multiaddr, NodeOptions, PeerDirectory,
    PeerId, Shutdown, ShutdownListener, StreamDialer, Topic, DIAL_TIMEOUT,
    DISCOVERY_RETRY_DELAY, STREAM_PROTOCOL,
};
use discovery_settings::{Config, DEFAULT_PORT, DEFAULT_TOPIC};
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownController;
use crate::Result;

/// Interval between messages in publish mode
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

const FRAME_CHANNEL_SIZE: usize = 64;

/// What the node does on its broadcast topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    Publish,
    Receive,
}

/// Everything needed to bring a node up
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interface name, also the sender nickname on broadcasts
    pub name: String,
    pub keypair: Keypair,
    /// Requested listen port
    pub port: u16,
    /// Port that triggers the upward search when requested
    pub default_port: u16,
    /// Peer ID strings, in configuration order
    pub peers: Vec<String>,
    pub bootstrap: Vec<(PeerId, Multiaddr)>,
    pub mdns: bool,
    pub listen_ip: IpAddr,
    pub mode: BroadcastMode,
    /// Topic name before the `chat-room:` prefix
    pub topic: String,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, keypair: Keypair) -> Self {
        Self {
            name: name.into(),
            keypair,
            port: DEFAULT_PORT,
            default_port: DEFAULT_PORT,
            peers: Vec::new(),
            bootstrap: Vec::new(),
            mdns: true,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mode: BroadcastMode::Receive,
            topic: DEFAULT_TOPIC.to_string(),
            retry_delay: DISCOVERY_RETRY_DELAY,
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    /// Build from a configuration file
    pub fn from_settings(config: &Config, mode: BroadcastMode) -> Result<Self> {
        let mut node = Self::new(config.interface.name.clone(), config.keypair()?);
        node.port = config.interface.listen_port;
        node.peers = config.peers.clone();
        node.bootstrap = config.bootstrap_peers();
        node.mdns = config.mdns;
        node.topic = config.topic.clone();
        node.mode = mode;
        Ok(node)
    }
}

pub struct NodeService;

impl NodeService {
    /// Bring a node up.
    ///
    /// Port negotiation and peer resolution happen before the host exists;
    /// the stream handler is registered with the allow-list before
    /// discovery starts dialing.
    pub async fn start(config: NodeConfig) -> Result<RunningNode> {
        let port = negotiate_port(config.port, config.default_port)?;
        let directory = PeerDirectory::resolve(&config.peers)?;
        let allow_list = directory.allow_list();

        info!("Creating node on port {}", port);
        let options = NodeOptions {
            listen_ip: config.listen_ip,
            port,
            mdns: config.mdns,
            bootstrap: config.bootstrap.clone(),
        };
        let host = Host::start(config.keypair.clone(), options)?;

        let incoming = match Self::prepare_host(&host, &directory).await {
            Ok(incoming) => incoming,
            Err(e) => {
                let _ = host.close().await;
                return Err(e);
            }
        };

        let shutdown = Shutdown::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        tasks.push(tokio::spawn(accept_loop(
            incoming,
            allow_list,
            frames_tx,
            shutdown.listener(),
        )));
        tasks.push(tokio::spawn(print_frames(frames_rx)));

        info!("Setting up node discovery for {} peers", directory.len());
        let (report_tx, report_rx) = watch::channel(None);
        let discovery = DiscoveryLoop::new(
            StreamDialer::new(host.stream_control(), STREAM_PROTOCOL)
                .with_timeout(config.dial_timeout),
        )
        .with_retry_delay(config.retry_delay);
        let records = directory.records().to_vec();
        let listener = shutdown.listener();
        tasks.push(tokio::spawn(async move {
            let report = discovery.run(records, listener).await;
            report_tx.send_replace(Some(report));
        }));

        let topic = host.join(&topic_name(&config.topic));
        let local_peer_id = host.local_peer_id();
        let broadcast = match config.mode {
            BroadcastMode::Publish => tokio::spawn(publish_loop(
                topic,
                local_peer_id,
                config.name.clone(),
                shutdown.listener(),
            )),
            BroadcastMode::Receive => tokio::spawn(receive_loop(topic, shutdown.listener())),
        };
        tasks.push(broadcast);

        info!("Network setup complete, waiting on node discovery");
        Ok(RunningNode {
            host,
            port,
            shutdown,
            tasks,
            discovery: report_rx,
        })
    }

    async fn prepare_host(
        host: &Host,
        directory: &PeerDirectory,
    ) -> Result<IncomingStreams> {
        host.watch_peers(directory.peer_ids()).await?;
        Ok(host.accept(STREAM_PROTOCOL)?)
    }
}

/// A node that is up
pub struct RunningNode {
    host: Host,
    port: u16,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
    discovery: watch::Receiver<Option<DiscoveryReport>>,
}

impl RunningNode {
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    /// Negotiated listen port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Final discovery report, once discovery has finished
    pub fn discovery_report(&self) -> Option<DiscoveryReport> {
        self.discovery.borrow().clone()
    }

    /// Wait for discovery to finish. `None` if the discovery task went away
    /// without reporting.
    pub async fn wait_for_discovery(&self) -> Option<DiscoveryReport> {
        let mut discovery = self.discovery.clone();
        discovery.wait_for(Option::is_some).await.ok()?;
        self.discovery_report()
    }

    /// Run until the first signal, then shut down
    pub async fn run_until_shutdown<S>(self, signals: S) -> Result<()>
    where
        S: Stream<Item = ()> + Unpin,
    {
        let mut controller = self.into_controller();
        controller.run(signals).await
    }

    /// Hand the node over to a shutdown controller
    pub fn into_controller(self) -> ShutdownController {
        ShutdownController::new(self.shutdown, self.host, self.tasks)
    }
}

async fn publish_loop(topic: Topic, local_peer_id: PeerId, nick: String, mut shutdown: ShutdownListener) {
    let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
    // The first tick fires immediately
    ticker.tick().await;
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        sequence += 1;
        let message = DataMessage::new(format!("message {} from {}", sequence, nick), &local_peer_id, &nick);
        let data = match message.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode broadcast message: {}", e);
                continue;
            }
        };
        if topic.publish(data).await.is_err() {
            debug!("Host closed, publish stopped");
            break;
        }
    }
}

async fn receive_loop(topic: Topic, mut shutdown: ShutdownListener) {
    let mut subscription = match topic.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Failed to subscribe to {}: {}", topic.name(), e);
            return;
        }
    };
    info!("Subscribed to {}", topic.name());

    loop {
        let message = tokio::select! {
            message = subscription.next() => message,
            _ = shutdown.cancelled() => break,
        };
        let Some(message) = message else {
            break;
        };

        match DataMessage::from_bytes(&message.data) {
            Ok(data) => info!(
                sender = %data.sender_id,
                nick = %data.sender_nick,
                "message: {}",
                data.message
            ),
            Err(e) => debug!("Skipping undecodable message from {:?}: {}", message.source, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_network::NetworkError;
    use discovery_settings::SettingsError;

    use crate::DaemonError;

    #[test]
    fn test_node_config_defaults() {
        let config = NodeConfig::new("hs0", Keypair::generate_ed25519());
        assert_eq!(config.port, 8001);
        assert_eq!(config.default_port, 8001);
        assert_eq!(config.mode, BroadcastMode::Receive);
        assert_eq!(config.topic, "p2pdb");
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert!(config.mdns);
        assert_eq!(config.listen_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_node_config_from_settings() {
        let mut settings = Config::generate("hs1").unwrap();
        let peer = PeerId::random();
        settings.interface.listen_port = 9100;
        settings.peers = vec![peer.to_string()];
        settings.bootstrap = vec![format!("{}@/ip4/10.0.0.1/tcp/8001", peer), "garbage".to_string()];
        settings.mdns = false;
        settings.topic = "lab".to_string();

        let config = NodeConfig::from_settings(&settings, BroadcastMode::Publish).unwrap();
        assert_eq!(config.name, "hs1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.peers, vec![peer.to_string()]);
        assert_eq!(config.bootstrap.len(), 1);
        assert_eq!(config.bootstrap[0].0, peer);
        assert!(!config.mdns);
        assert_eq!(config.topic, "lab");
        assert_eq!(config.mode, BroadcastMode::Publish);
        assert_eq!(
            PeerId::from(config.keypair.public()).to_string(),
            settings.interface.id
        );
    }

    #[test]
    fn test_node_config_rejects_bad_key() {
        let mut settings = Config::generate("hs0").unwrap();
        settings.interface.private_key = "not a key".to_string();
        let result = NodeConfig::from_settings(&settings, BroadcastMode::Receive);
        assert!(matches!(
            result,
            Err(DaemonError::Settings(SettingsError::InvalidKey(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_malformed_peer_before_listening() {
        let mut config = NodeConfig::new("hs0", Keypair::generate_ed25519());
        config.listen_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.mdns = false;
        config.peers = vec!["definitely-not-a-peer-id".to_string()];

        let result = NodeService::start(config).await;
        assert!(matches!(
            result,
            Err(DaemonError::Network(NetworkError::InvalidPeerId { .. }))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_busy_custom_port() {
        let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let mut config = NodeConfig::new("hs0", Keypair::generate_ed25519());
        config.port = busy;
        config.mdns = false;

        let result = NodeService::start(config).await;
        assert!(matches!(
            result,
            Err(DaemonError::Network(NetworkError::PortInUse(p))) if p == busy
        ));
    }
}
