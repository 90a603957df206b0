//! Catch-up source side
//!
//! Every member (core or replica) runs one of these listeners. It
//! serves two request kinds over framed connections: committed-entry
//! pulls for incremental catch-up, and full store-copy streams for
//! members whose divergence incremental replication cannot repair.

use super::types::{CatchupConfig, CatchupRequest, CatchupResponse, Result, SnapshotManifest};
use crate::raft_log::SegmentedLog;
use crate::state_machine::StateMachineAdapter;
use crate::transport::{TransportError, read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::BufWriter;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct CatchupServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl CatchupServer {
    /// Bind and start serving. `commit_index` is the watermark beyond
    /// which entries are never served: the consensus commit index on
    /// core members, the applied index on replicas serving downstream
    /// replicas.
    pub async fn spawn(
        bind: SocketAddr,
        log: Arc<SegmentedLog>,
        adapter: Arc<dyn StateMachineAdapter>,
        commit_index: Arc<AtomicU64>,
        config: CatchupConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;

        info!("Catch-up listener on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Catch-up request from {}", peer);
                        let log = Arc::clone(&log);
                        let adapter = Arc::clone(&adapter);
                        let commit_index = Arc::clone(&commit_index);
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, log, adapter, commit_index, config).await
                            {
                                debug!("Catch-up connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Catch-up accept failed: {}", e),
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

impl Drop for CatchupServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    log: Arc<SegmentedLog>,
    adapter: Arc<dyn StateMachineAdapter>,
    commit_index: Arc<AtomicU64>,
    config: CatchupConfig,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let Some(request) = read_frame::<_, CatchupRequest>(&mut reader).await? else {
        return Ok(()); // peer went away before asking anything
    };

    match request {
        CatchupRequest::Pull {
            from_index,
            store_id,
        } => {
            if adapter.identity() != Some(store_id) {
                warn!("Pull request for a foreign store refused");
                write_frame(&mut writer, &CatchupResponse::StoreIdMismatch).await?;
                return Ok(());
            }
            serve_pull(&mut writer, &log, &commit_index, &config, from_index).await
        }
        CatchupRequest::StoreCopy { store_id } => {
            if let (Some(theirs), Some(ours)) = (store_id, adapter.identity()) {
                if theirs != ours {
                    warn!("Store copy for a foreign store refused");
                    write_frame(&mut writer, &CatchupResponse::StoreIdMismatch).await?;
                    return Ok(());
                }
            }
            serve_store_copy(&mut writer, &log, &adapter, &config).await
        }
    }
}

/// Stream committed entries in batches.
async fn serve_pull<W>(
    writer: &mut W,
    log: &SegmentedLog,
    commit_index: &AtomicU64,
    config: &CatchupConfig,
    from_index: u64,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let commit = commit_index.load(Ordering::SeqCst);

    if from_index < log.oldest_available_index() {
        debug!(
            "Pull from {} refused: oldest available is {}",
            from_index,
            log.oldest_available_index()
        );
        write_frame(
            writer,
            &CatchupResponse::FallBehind {
                oldest_available: log.oldest_available_index(),
            },
        )
        .await?;
        return Ok(());
    }

    let mut next = from_index;
    loop {
        if next > commit {
            write_frame(
                writer,
                &CatchupResponse::Entries {
                    entries: Vec::new(),
                    commit_index: commit,
                    more: false,
                },
            )
            .await?;
            return Ok(());
        }

        let end = commit.min(next + config.pull_batch_size as u64 - 1);
        let entries = log.read_range(next, end)?;
        let more = end < commit;

        write_frame(
            writer,
            &CatchupResponse::Entries {
                entries,
                commit_index: commit,
                more,
            },
        )
        .await?;

        if !more {
            return Ok(());
        }
        next = end + 1;
    }
}

/// Freeze a snapshot and stream it in checksummed chunks.
async fn serve_store_copy<W>(
    writer: &mut W,
    log: &SegmentedLog,
    adapter: &Arc<dyn StateMachineAdapter>,
    config: &CatchupConfig,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let snapshot = match adapter.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            write_frame(writer, &CatchupResponse::Failed(e.to_string())).await?;
            return Err(e.into());
        }
    };

    let manifest = SnapshotManifest {
        last_included_index: snapshot.last_applied,
        last_included_term: log.entry_term(snapshot.last_applied).unwrap_or(0),
        store_id: snapshot.store_id,
        total_bytes: snapshot.bytes.len() as u64,
        checksum: crc32fast::hash(&snapshot.bytes),
    };

    info!(
        "Serving store copy: {} bytes up to index {}",
        manifest.total_bytes, manifest.last_included_index
    );
    write_frame(writer, &CatchupResponse::Manifest(manifest)).await?;

    let mut offset = 0;
    while offset < snapshot.bytes.len() {
        let end = snapshot.bytes.len().min(offset + config.chunk_size_bytes);
        let data = snapshot.bytes[offset..end].to_vec();
        let crc = crc32fast::hash(&data);
        let last = end == snapshot.bytes.len();

        write_frame(writer, &CatchupResponse::Chunk { data, crc, last }).await?;
        offset = end;
    }

    if snapshot.bytes.is_empty() {
        // Degenerate but legal: an empty store still transfers its
        // identity and watermark
        write_frame(
            writer,
            &CatchupResponse::Chunk {
                data: Vec::new(),
                crc: crc32fast::hash(&[]),
                last: true,
            },
        )
        .await?;
    }

    Ok(())
}
