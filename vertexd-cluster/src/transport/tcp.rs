//! TCP transport
//!
//! One outbound connection per peer, owned by a writer task that
//! reconnects with capped exponential backoff and resolves the peer's
//! current address from the topology on every attempt (addresses may
//! change across restarts). The listener side accepts framed
//! envelopes and forwards them into the consensus inbox.

use super::{Envelope, RaftTransport, TransportError, TransportResult, read_frame, write_frame};
use crate::consensus::{MemberId, RaftMessage};
use crate::topology::TopologyView;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Initial reconnect backoff (ms).
    pub retry_backoff_ms: u64,
    /// Backoff cap (ms).
    pub max_backoff_ms: u64,
    /// Messages queued per peer before the oldest are dropped.
    pub peer_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 50,
            max_backoff_ms: 3000, // 3 seconds
            peer_queue_depth: 1024,
        }
    }
}

/// Outbound TCP transport for one member.
pub struct TcpTransport {
    from: MemberId,
    topology: Arc<dyn TopologyView>,
    config: TransportConfig,
    peers: RwLock<HashMap<MemberId, mpsc::Sender<RaftMessage>>>,
}

impl TcpTransport {
    pub fn new(
        from: MemberId,
        topology: Arc<dyn TopologyView>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            from,
            topology,
            config,
            peers: RwLock::new(HashMap::new()),
        })
    }

    fn peer_sender(&self, to: MemberId) -> mpsc::Sender<RaftMessage> {
        if let Some(sender) = self.peers.read().get(&to) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let mut peers = self.peers.write();
        // Double-checked: another caller may have respawned it
        if let Some(sender) = peers.get(&to) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.config.peer_queue_depth);
        tokio::spawn(peer_writer(
            self.from,
            to,
            Arc::clone(&self.topology),
            self.config.clone(),
            rx,
        ));
        peers.insert(to, tx.clone());
        tx
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        let sender = self.peer_sender(to);
        // A full queue means the peer is unreachable and backlogged;
        // drop the message, consensus re-sends what matters
        if let Err(e) = sender.try_send(message) {
            debug!("Dropping message to {}: {}", to, e);
        }
        Ok(())
    }
}

/// Owns the connection to one peer: resolve, connect with backoff,
/// drain the queue.
async fn peer_writer(
    from: MemberId,
    to: MemberId,
    topology: Arc<dyn TopologyView>,
    config: TransportConfig,
    mut rx: mpsc::Receiver<RaftMessage>,
) {
    let mut backoff = Duration::from_millis(config.retry_backoff_ms);
    let max_backoff = Duration::from_millis(config.max_backoff_ms);
    let mut stream: Option<BufWriter<TcpStream>> = None;

    while let Some(message) = rx.recv().await {
        if stream.is_none() {
            let Some(info) = topology.lookup(&to) else {
                debug!("No address for {}; dropping message", to);
                continue;
            };

            match TcpStream::connect(info.address).await {
                Ok(connected) => {
                    debug!("Connected to {} at {}", to, info.address);
                    backoff = Duration::from_millis(config.retry_backoff_ms);
                    stream = Some(BufWriter::new(connected));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}; retrying in {:?}", to, e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    continue; // message dropped, consensus re-sends
                }
            }
        }

        let envelope = Envelope { from, message };
        if let Some(writer) = &mut stream {
            if let Err(e) = write_frame(writer, &envelope).await {
                warn!("Write to {} failed: {}; reconnecting", to, e);
                stream = None;
            }
        }
    }
}

/// Inbound side: accepts peer connections and forwards their frames.
pub struct RaftListener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RaftListener {
    pub async fn spawn(
        bind: SocketAddr,
        inbox: mpsc::UnboundedSender<(MemberId, RaftMessage)>,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        info!("Consensus listener on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("Peer connection from {}", peer_addr);
                        let inbox = inbox.clone();
                        tokio::spawn(handle_peer(stream, inbox));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for RaftListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_peer(stream: TcpStream, inbox: mpsc::UnboundedSender<(MemberId, RaftMessage)>) {
    let mut reader = tokio::io::BufReader::new(stream);
    loop {
        match read_frame::<_, Envelope>(&mut reader).await {
            Ok(Some(envelope)) => {
                if inbox.send((envelope.from, envelope.message)).is_err() {
                    return; // consensus core shut down
                }
            }
            Ok(None) => return, // peer closed
            Err(e) => {
                warn!("Dropping peer connection: {}", e);
                return;
            }
        }
    }
}
