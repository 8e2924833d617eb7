//! Point-to-point stream framing
//!
//! Wire format (per frame, no header or trailer around the stream):
//! ```text
//! [length: u16 LE][payload: length bytes]
//! ```
//! `length` never exceeds [`MAX_FRAME_SIZE`]. There is no type tag,
//! checksum or version; the stream protocol ID carries the version.

use std::io;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::StreamProtocol;

/// Protocol ID registered on the host for framed streams
pub const STREAM_PROTOCOL: StreamProtocol = StreamProtocol::new("/discovery-p2p/stream/1.0.0");

/// Largest payload a frame may carry (stays under a typical path MTU)
pub const MAX_FRAME_SIZE: usize = 1420;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Per-stream receive buffer, sized for the largest frame
pub type FrameBuffer = [u8; MAX_FRAME_SIZE];

/// Read one frame into `buf`, returning the payload slice.
///
/// Partial reads are accumulated until the full frame is present. A clean
/// end of stream before the length prefix surfaces as `UnexpectedEof`, like
/// any truncated frame.
pub async fn read_frame<'a, R>(reader: &mut R, buf: &'a mut FrameBuffer) -> io::Result<&'a [u8]>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let len = u16::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds maximum {}", len, MAX_FRAME_SIZE),
        ));
    }

    reader.read_exact(&mut buf[..len]).await?;
    Ok(&buf[..len])
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let prefix = encode_length(payload.len())?;
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Encode a whole frame into a new buffer.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let prefix = encode_length(payload.len())?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn encode_length(len: usize) -> io::Result<[u8; LENGTH_PREFIX_SIZE]> {
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload length {} exceeds maximum {}", len, MAX_FRAME_SIZE),
        ));
    }
    Ok((len as u16).to_le_bytes())
}
