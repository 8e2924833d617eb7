//! Inbound stream handling
//!
//! Every inbound stream on [`STREAM_PROTOCOL`](crate::STREAM_PROTOCOL) is
//! checked against the [`AllowList`] before a single byte is read, then
//! decoded frame by frame until the remote closes it or an I/O error occurs.
//! Each stream owns its receive buffer; failures never leave the stream.

use std::io;

use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::PeerId;
use libp2p_stream::IncomingStreams;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::peers::AllowList;
use crate::protocol::{read_frame, MAX_FRAME_SIZE};
use crate::shutdown::ShutdownListener;

/// A decoded payload received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub peer: PeerId,
    pub payload: Vec<u8>,
}

/// How an inbound stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Peer not on the allow-list; nothing was read
    Rejected,
    /// Stream ended after delivering `frames` complete frames
    Closed { frames: usize },
}

/// Handle one inbound stream until it ends.
///
/// Streams from peers outside the allow-list are dropped unread. Otherwise
/// each complete frame is delivered on `frames`; a frame cut short by a read
/// failure is discarded.
pub async fn handle_stream<S>(
    peer: PeerId,
    mut stream: S,
    allow_list: &AllowList,
    frames: &mpsc::Sender<InboundFrame>,
) -> StreamOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !allow_list.contains(&peer) {
        drop(stream);
        return StreamOutcome::Rejected;
    }

    let mut buf = [0u8; MAX_FRAME_SIZE];
    let mut delivered = 0;

    loop {
        let payload = match read_frame(&mut stream, &mut buf).await {
            Ok(payload) => payload.to_vec(),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Stream from {} ended", peer);
                break;
            }
            Err(e) => {
                debug!("Stream from {} failed: {}", peer, e);
                break;
            }
        };

        delivered += 1;
        if frames.send(InboundFrame { peer, payload }).await.is_err() {
            debug!("Frame receiver gone, closing stream from {}", peer);
            break;
        }
    }

    let _ = stream.close().await;
    StreamOutcome::Closed { frames: delivered }
}

/// Accept inbound streams until shutdown, handling each on its own task.
pub async fn accept_loop(
    mut incoming: IncomingStreams,
    allow_list: AllowList,
    frames: mpsc::Sender<InboundFrame>,
    mut shutdown: ShutdownListener,
) {
    info!("Accepting framed streams from {} allowed peers", allow_list.len());

    loop {
        tokio::select! {
            next = incoming.next() => {
                let Some((peer, stream)) = next else {
                    debug!("Incoming stream registration dropped");
                    break;
                };
                let allow_list = allow_list.clone();
                let frames = frames.clone();
                tokio::spawn(async move {
                    if let StreamOutcome::Closed { frames } =
                        handle_stream(peer, stream, &allow_list, &frames).await
                    {
                        debug!("Stream from {} closed after {} frames", peer, frames);
                    }
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Print every delivered frame until the channel closes.
pub async fn print_frames(mut frames: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = frames.recv().await {
        info!(peer = %frame.peer, "rev: {}", String::from_utf8_lossy(&frame.payload));
    }
}
