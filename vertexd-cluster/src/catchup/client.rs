//! Catch-up requesting side
//!
//! Pulls committed entries from an upstream member, and when that is
//! no longer possible (the upstream pruned past us, or we are a fresh
//! member) downloads a full store snapshot. Store identity is checked
//! before any byte of a snapshot is applied; a partial download is
//! staged in a scratch directory and discarded on interruption.

use super::types::{
    CatchupConfig, CatchupError, CatchupRequest, CatchupResponse, Result, SnapshotManifest,
};
use crate::consensus::{LogEntry, LogIndex};
use crate::raft_log::SegmentedLog;
use crate::state_machine::{SnapshotData, StateMachineAdapter, StoreId};
use crate::transport::{TransportError, read_frame, write_frame};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One batch of pulled entries.
#[derive(Debug)]
pub struct PullBatch {
    pub entries: Vec<LogEntry>,
    /// Upstream's commit watermark at serve time; nothing in
    /// `entries` exceeds it.
    pub commit_index: LogIndex,
}

/// A fully received, checksum-verified snapshot awaiting install.
#[derive(Debug)]
pub struct StagedSnapshot {
    pub manifest: SnapshotManifest,
    pub data: SnapshotData,
    staging: Option<PathBuf>,
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if let Some(dir) = self.staging.take() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

#[derive(Clone)]
pub struct CatchupClient {
    config: CatchupConfig,
}

impl CatchupClient {
    pub fn new(config: CatchupConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        match timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(e.to_string()).into()),
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "connect to {} timed out",
                addr
            ))
            .into()),
        }
    }

    /// Fetch committed entries at and after `from_index`.
    pub async fn pull(
        &self,
        addr: SocketAddr,
        from_index: LogIndex,
        store_id: StoreId,
    ) -> Result<PullBatch> {
        let stream = self.connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        write_frame(
            &mut writer,
            &CatchupRequest::Pull {
                from_index,
                store_id,
            },
        )
        .await?;

        let mut entries = Vec::new();
        loop {
            let Some(response) = read_frame::<_, CatchupResponse>(&mut reader).await? else {
                return Err(CatchupError::Interrupted(
                    "stream closed mid-pull".to_string(),
                ));
            };

            match response {
                CatchupResponse::Entries {
                    entries: batch,
                    commit_index,
                    more,
                } => {
                    entries.extend(batch);
                    if !more {
                        debug!(
                            "Pulled {} entries from {} (upstream commit {})",
                            entries.len(),
                            addr,
                            commit_index
                        );
                        return Ok(PullBatch {
                            entries,
                            commit_index,
                        });
                    }
                }
                CatchupResponse::FallBehind { oldest_available } => {
                    return Err(CatchupError::FallBehind { oldest_available });
                }
                CatchupResponse::StoreIdMismatch => return Err(CatchupError::StoreIdMismatch),
                CatchupResponse::Failed(reason) => return Err(CatchupError::Remote(reason)),
                other => {
                    return Err(CatchupError::Interrupted(format!(
                        "unexpected frame during pull: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Download a full snapshot into `staging_dir`.
    ///
    /// The store identity is verified against `local_store_id` as soon
    /// as the manifest arrives, before any data is accepted. On any
    /// interruption the partial download is discarded; the caller may
    /// retry against the same or another source.
    pub async fn store_copy(
        &self,
        addr: SocketAddr,
        local_store_id: Option<StoreId>,
        staging_dir: &Path,
    ) -> Result<StagedSnapshot> {
        let stream = self.connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        write_frame(
            &mut writer,
            &CatchupRequest::StoreCopy {
                store_id: local_store_id,
            },
        )
        .await?;

        let manifest = match read_frame::<_, CatchupResponse>(&mut reader).await? {
            Some(CatchupResponse::Manifest(manifest)) => manifest,
            Some(CatchupResponse::StoreIdMismatch) => return Err(CatchupError::StoreIdMismatch),
            Some(CatchupResponse::Failed(reason)) => return Err(CatchupError::Remote(reason)),
            Some(other) => {
                return Err(CatchupError::Interrupted(format!(
                    "unexpected frame before manifest: {:?}",
                    other
                )));
            }
            None => {
                return Err(CatchupError::Interrupted(
                    "stream closed before manifest".to_string(),
                ));
            }
        };

        // Identity gate: nothing is written until this passes
        if let Some(local) = local_store_id {
            if local != manifest.store_id {
                warn!(
                    "Snapshot from {} carries store {} but ours is {}; refusing",
                    addr, manifest.store_id, local
                );
                return Err(CatchupError::StoreIdMismatch);
            }
        }

        fs::create_dir_all(staging_dir).await?;
        let staging = staging_dir.join(format!("snapshot-{}.partial", manifest.store_id));
        let result = self
            .receive_chunks(&mut reader, &manifest, &staging)
            .await;

        match result {
            Ok(bytes) => {
                // Persist the manifest beside the data for operators
                // inspecting an interrupted install
                let manifest_path = staging_dir.join("snapshot-manifest.json");
                fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?).await?;

                info!(
                    "Store copy from {} complete: {} bytes up to index {}",
                    addr, manifest.total_bytes, manifest.last_included_index
                );
                Ok(StagedSnapshot {
                    manifest,
                    data: SnapshotData {
                        last_applied: manifest.last_included_index,
                        store_id: manifest.store_id,
                        bytes,
                    },
                    staging: Some(staging_dir.to_path_buf()),
                })
            }
            Err(e) => {
                // Discard the partial snapshot
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn receive_chunks<R>(
        &self,
        reader: &mut R,
        manifest: &SnapshotManifest,
        staging: &Path,
    ) -> Result<Vec<u8>>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut file = BufWriter::new(fs::File::create(staging).await?);
        let mut bytes = Vec::with_capacity(manifest.total_bytes as usize);

        loop {
            let Some(response) = read_frame::<_, CatchupResponse>(reader).await? else {
                return Err(CatchupError::Interrupted(
                    "stream closed mid-snapshot".to_string(),
                ));
            };

            match response {
                CatchupResponse::Chunk { data, crc, last } => {
                    let actual = crc32fast::hash(&data);
                    if actual != crc {
                        return Err(CatchupError::ChecksumMismatch {
                            expected: crc,
                            actual,
                        });
                    }
                    file.write_all(&data).await?;
                    bytes.extend_from_slice(&data);

                    if last {
                        break;
                    }
                }
                CatchupResponse::Failed(reason) => return Err(CatchupError::Remote(reason)),
                other => {
                    return Err(CatchupError::Interrupted(format!(
                        "unexpected frame during snapshot: {:?}",
                        other
                    )));
                }
            }
        }
        file.flush().await?;

        if bytes.len() as u64 != manifest.total_bytes {
            return Err(CatchupError::Interrupted(format!(
                "expected {} bytes, received {}",
                manifest.total_bytes,
                bytes.len()
            )));
        }
        let actual = crc32fast::hash(&bytes);
        if actual != manifest.checksum {
            return Err(CatchupError::ChecksumMismatch {
                expected: manifest.checksum,
                actual,
            });
        }

        Ok(bytes)
    }
}

/// Install a staged snapshot: replace the store contents and, on core
/// members, reset the raft log so the next expected index follows the
/// snapshot (read replicas hold no raft log and pass `None`).
///
/// Holds the exclusive copy guard for the duration; concurrent
/// transaction starts and second installs are refused while it runs.
pub async fn install_snapshot(
    guard: &super::CopyGuard,
    adapter: &Arc<dyn StateMachineAdapter>,
    log: Option<&SegmentedLog>,
    mut staged: StagedSnapshot,
) -> Result<LogIndex> {
    let _permit = guard.try_acquire()?;

    // Same gate as the download path; a store formed between download
    // and install must not be clobbered
    if let Some(local) = adapter.identity() {
        if local != staged.manifest.store_id {
            return Err(CatchupError::StoreIdMismatch);
        }
    }

    let last_included_index = staged.manifest.last_included_index;
    let last_included_term = staged.manifest.last_included_term;

    let data = SnapshotData {
        last_applied: staged.data.last_applied,
        store_id: staged.data.store_id,
        bytes: std::mem::take(&mut staged.data.bytes),
    };
    adapter.install(data).await?;
    if let Some(log) = log {
        log.reset(last_included_index + 1, last_included_term)?;
    }

    info!(
        "Snapshot installed; log restarts at index {}",
        last_included_index + 1
    );
    Ok(last_included_index)
}
