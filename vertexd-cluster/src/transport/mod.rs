//! Member-to-member RPC transport
//!
//! Consensus messages travel as length-prefixed bincode frames. The
//! `RaftTransport` trait is the seam between the consensus core and
//! the wire: production uses the TCP implementation, the test suites
//! use the in-process network with partition controls.
//!
//! Delivery is best-effort and ordered per peer. Send failures are
//! retried with capped backoff inside the transport and eventually
//! dropped; the consensus protocol re-sends whatever matters.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{RaftListener, TcpTransport, TransportConfig};

use crate::consensus::{MemberId, RaftMessage};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are treated as protocol corruption.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Transport error types
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address known for member {0}")]
    UnknownMember(MemberId),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("oversized frame: {0} bytes")]
    OversizedFrame(u32),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is shut down")]
    Shutdown,
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Outbound half of the consensus RPC surface.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Hand a message to the wire. Per-peer ordering is preserved;
    /// delivery is not guaranteed.
    async fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()>;
}

/// Wire envelope: the sender identity travels with every message so
/// responses can be routed without a connection registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub from: MemberId,
    pub message: RaftMessage,
}

/// Write one `u32 length | bincode payload` frame.
pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(value)?;
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end-of-stream.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> TransportResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header);
    if length > MAX_FRAME_BYTES {
        return Err(TransportError::OversizedFrame(length));
    }

    let mut data = vec![0u8; length as usize];
    reader.read_exact(&mut data).await?;
    Ok(Some(bincode::deserialize(&data)?))
}
