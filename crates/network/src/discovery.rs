//! Peer discovery loop
//!
//! Drives every configured peer from `Pending` to `Connected` or `Failed`
//! by opening a trial stream to it. Peers that cannot be reached yet are
//! retried after a fixed delay; any other failure is final. There is no
//! overall deadline: a peer that stays unreachable keeps the loop alive
//! until shutdown.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::{Control, OpenStreamError};
use tracing::{debug, info, warn};

use crate::peers::{PeerRecord, PeerStatus};
use crate::shutdown::ShutdownListener;

/// Delay between passes while some peers are still unreachable
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on a single trial dial
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// Trial stream opened (and closed again)
    Connected,
    /// Peer cannot be located or dialed right now; worth retrying
    Unreachable(String),
    /// Anything else; not retried
    Failed(String),
}

/// Opens trial connections to peers
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn probe(&self, peer: PeerId) -> DialOutcome;
}

/// [`Dialer`] that opens and immediately closes a stream on the node's
/// registered protocol.
#[derive(Clone)]
pub struct StreamDialer {
    control: Control,
    protocol: StreamProtocol,
    timeout: Duration,
}

impl StreamDialer {
    pub fn new(control: Control, protocol: StreamProtocol) -> Self {
        Self {
            control,
            protocol,
            timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for StreamDialer {
    async fn probe(&self, peer: PeerId) -> DialOutcome {
        let mut control = self.control.clone();
        let open = control.open_stream(peer, self.protocol.clone());

        match tokio::time::timeout(self.timeout, open).await {
            Err(_) => DialOutcome::Unreachable(format!("dial timed out after {:?}", self.timeout)),
            Ok(Ok(mut stream)) => {
                let _ = stream.close().await;
                DialOutcome::Connected
            }
            Ok(Err(e)) => classify_open_error(&e),
        }
    }
}

/// Map a stream-open failure onto retry policy.
pub fn classify_open_error(err: &OpenStreamError) -> DialOutcome {
    match err {
        OpenStreamError::Io(e) if is_transient(e.kind()) => DialOutcome::Unreachable(e.to_string()),
        other => DialOutcome::Failed(other.to_string()),
    }
}

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotConnected | io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
    )
}

/// Final status of every configured peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub peers: Vec<PeerRecord>,
    /// Number of passes over the working set
    pub passes: usize,
}

impl DiscoveryReport {
    pub fn status_of(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.iter().find(|r| &r.peer_id == peer).map(|r| r.status)
    }

    pub fn count(&self, status: PeerStatus) -> usize {
        self.peers.iter().filter(|r| r.status == status).count()
    }

    /// True when no peer is left `Pending`
    pub fn is_settled(&self) -> bool {
        self.peers.iter().all(|r| r.status.is_terminal())
    }
}

/// Repeatedly dials every pending peer until none remain.
pub struct DiscoveryLoop<D> {
    dialer: D,
    retry_delay: Duration,
}

impl<D: Dialer> DiscoveryLoop<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            retry_delay: DISCOVERY_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run until every peer is `Connected` or `Failed`, or until shutdown.
    ///
    /// On shutdown the remaining peers are reported as `Pending`.
    pub async fn run(&self, peers: Vec<PeerRecord>, mut shutdown: ShutdownListener) -> DiscoveryReport {
        let mut settled: Vec<PeerRecord> = Vec::with_capacity(peers.len());
        let mut working: Vec<PeerRecord> = peers;
        let mut passes = 0;

        while !working.is_empty() {
            passes += 1;
            let mut still_pending = Vec::new();

            for mut record in working.drain(..) {
                if shutdown.is_cancelled() {
                    still_pending.push(record);
                    continue;
                }

                let outcome = tokio::select! {
                    outcome = self.dialer.probe(record.peer_id) => outcome,
                    _ = shutdown.cancelled() => {
                        still_pending.push(record);
                        continue;
                    }
                };

                match outcome {
                    DialOutcome::Connected => {
                        info!("Connection to {} successful. Network ready.", record.id);
                        record.status = PeerStatus::Connected;
                        settled.push(record);
                    }
                    DialOutcome::Unreachable(reason) => {
                        debug!("Peer {} not reachable yet: {}", record.id, reason);
                        still_pending.push(record);
                    }
                    DialOutcome::Failed(reason) => {
                        warn!("Giving up on peer {}: {}", record.id, reason);
                        record.status = PeerStatus::Failed;
                        settled.push(record);
                    }
                }
            }

            working = still_pending;
            if working.is_empty() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = shutdown.cancelled() => {
                    debug!("Discovery stopped with {} peers pending", working.len());
                    settled.append(&mut working);
                    break;
                }
            }
        }

        info!(
            "Discovery finished: {} connected, {} failed, {} pending",
            settled.iter().filter(|r| r.status == PeerStatus::Connected).count(),
            settled.iter().filter(|r| r.status == PeerStatus::Failed).count(),
            settled.iter().filter(|r| r.status == PeerStatus::Pending).count(),
        );

        DiscoveryReport { peers: settled, passes }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;
    use crate::shutdown::Shutdown;

    /// Replays scripted outcomes per peer and records when each probe ran
    #[derive(Clone, Default)]
    struct ScriptedDialer {
        script: Arc<Mutex<HashMap<PeerId, VecDeque<DialOutcome>>>>,
        calls: Arc<Mutex<Vec<(PeerId, Instant)>>>,
    }

    impl ScriptedDialer {
        fn script(&self, peer: PeerId, outcomes: Vec<DialOutcome>) {
            self.script.lock().unwrap().insert(peer, outcomes.into());
        }

        fn calls_for(&self, peer: PeerId) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == peer)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn probe(&self, peer: PeerId) -> DialOutcome {
            self.calls.lock().unwrap().push((peer, Instant::now()));
            self.script
                .lock()
                .unwrap()
                .get_mut(&peer)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| DialOutcome::Unreachable("no route".into()))
        }
    }

    fn unreachable() -> DialOutcome {
        DialOutcome::Unreachable("failed to dial".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_peer_connects_after_two_delays() {
        let a = PeerId::random();
        let b = PeerId::random();
        let dialer = ScriptedDialer::default();
        dialer.script(a, vec![DialOutcome::Connected]);
        dialer.script(b, vec![unreachable(), unreachable(), DialOutcome::Connected]);

        let shutdown = Shutdown::new();
        let start = Instant::now();
        let report = DiscoveryLoop::new(dialer.clone())
            .run(
                vec![PeerRecord::new("A", a), PeerRecord::new("B", b)],
                shutdown.listener(),
            )
            .await;

        assert_eq!(report.status_of(&a), Some(PeerStatus::Connected));
        assert_eq!(report.status_of(&b), Some(PeerStatus::Connected));
        assert!(report.is_settled());
        assert_eq!(report.passes, 3);

        let a_calls = dialer.calls_for(a);
        assert_eq!(a_calls.len(), 1);
        assert_eq!(a_calls[0], start);

        let b_calls = dialer.calls_for(b);
        assert_eq!(b_calls.len(), 3);
        assert_eq!(b_calls[2] - start, DISCOVERY_RETRY_DELAY * 2);
        assert_eq!(start.elapsed(), DISCOVERY_RETRY_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let a = PeerId::random();
        let b = PeerId::random();
        let dialer = ScriptedDialer::default();
        dialer.script(a, vec![DialOutcome::Failed("protocol not supported".into())]);
        dialer.script(b, vec![DialOutcome::Connected]);

        let shutdown = Shutdown::new();
        let start = Instant::now();
        let report = DiscoveryLoop::new(dialer.clone())
            .run(
                vec![PeerRecord::new("A", a), PeerRecord::new("B", b)],
                shutdown.listener(),
            )
            .await;

        assert_eq!(report.status_of(&a), Some(PeerStatus::Failed));
        assert_eq!(report.status_of(&b), Some(PeerStatus::Connected));
        assert_eq!(dialer.calls_for(a).len(), 1);
        assert_eq!(report.passes, 1);
        // Nothing left pending, so no delay was taken
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_peer_ends_terminal() {
        let dialer = ScriptedDialer::default();
        let mut records = Vec::new();
        for i in 0..6 {
            let peer = PeerId::random();
            let mut script = vec![unreachable(); i];
            script.push(if i % 2 == 0 {
                DialOutcome::Connected
            } else {
                DialOutcome::Failed("refused by policy".into())
            });
            dialer.script(peer, script);
            records.push(PeerRecord::new(peer.to_string(), peer));
        }

        let shutdown = Shutdown::new();
        let report = DiscoveryLoop::new(dialer)
            .with_retry_delay(Duration::from_millis(100))
            .run(records, shutdown.listener())
            .await;

        assert_eq!(report.peers.len(), 6);
        assert!(report.is_settled());
        assert_eq!(report.count(PeerStatus::Connected), 3);
        assert_eq!(report.count(PeerStatus::Failed), 3);
        assert_eq!(report.passes, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_peer_set_finishes_immediately() {
        let shutdown = Shutdown::new();
        let report = DiscoveryLoop::new(ScriptedDialer::default())
            .run(Vec::new(), shutdown.listener())
            .await;
        assert!(report.peers.is_empty());
        assert_eq!(report.passes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_unbounded_retry() {
        let a = PeerId::random();
        let dialer = ScriptedDialer::default();
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();

        let task = tokio::spawn({
            let dialer = dialer.clone();
            async move {
                DiscoveryLoop::new(dialer)
                    .run(vec![PeerRecord::new("A", a)], listener)
                    .await
            }
        });

        tokio::time::sleep(DISCOVERY_RETRY_DELAY * 3 + Duration::from_secs(1)).await;
        shutdown.trigger();
        let report = task.await.unwrap();

        assert_eq!(report.status_of(&a), Some(PeerStatus::Pending));
        assert!(!report.is_settled());
        assert_eq!(dialer.calls_for(a).len(), 4);
    }

    /// Dials that never complete
    struct HangingDialer;

    #[async_trait]
    impl Dialer for HangingDialer {
        async fn probe(&self, _peer: PeerId) -> DialOutcome {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_dial_in_flight() {
        let a = PeerId::random();
        let b = PeerId::random();
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();

        let task = tokio::spawn(async move {
            DiscoveryLoop::new(HangingDialer)
                .run(
                    vec![PeerRecord::new("A", a), PeerRecord::new("B", b)],
                    listener,
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
        let report = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("discovery should stop once shutdown is triggered")
            .unwrap();

        assert_eq!(report.peers.len(), 2);
        assert_eq!(report.status_of(&a), Some(PeerStatus::Pending));
        assert_eq!(report.status_of(&b), Some(PeerStatus::Pending));
        assert_eq!(report.passes, 1);
    }

    #[test]
    fn test_classify_open_errors() {
        let dial = OpenStreamError::Io(io::Error::new(io::ErrorKind::NotConnected, "no addresses"));
        assert!(matches!(classify_open_error(&dial), DialOutcome::Unreachable(_)));

        let refused = OpenStreamError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(classify_open_error(&refused), DialOutcome::Unreachable(_)));

        let unsupported = OpenStreamError::UnsupportedProtocol(StreamProtocol::new("/x/1.0.0"));
        assert!(matches!(classify_open_error(&unsupported), DialOutcome::Failed(_)));

        let reset = OpenStreamError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(classify_open_error(&reset), DialOutcome::Failed(_)));
    }
}
