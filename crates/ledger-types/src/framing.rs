//! Length-prefixed stream framing shared by node servers and the TCP transport.
//!
//! ```text
//! [4-byte big-endian length][UTF-8 JSON body]
//! ```
//!
//! A client writes one request frame; the node answers with one or more reply
//! frames (a REQACK may precede the terminal reply) and then closes.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<(), FrameError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(data.len()));
    }
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_size: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 4];
    if stream.read(&mut len_bytes[..1]).await? == 0 {
        return Ok(None);
    }
    // EOF inside the prefix is a truncated frame, not a clean close.
    stream.read_exact(&mut len_bytes[1..]).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_size {
        return Err(FrameError::TooLarge(len));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}
