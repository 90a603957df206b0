use super::segment::{
    check_contiguous, list_segment_files, read_segment, segment_file_name, truncate_segment_file,
    write_record, write_segment_file,
};
use super::types::{FsyncMode, LogStoreConfig, LogStoreError, PruneStrategy, Result};
use crate::consensus::{LogEntry, LogIndex, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

const META_FILE: &str = "log-meta.json";

/// Boundary below the oldest retained entry, persisted so recovery
/// knows where the log window starts after pruning or a snapshot
/// install.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LogMeta {
    prev_index: LogIndex,
    prev_term: Term,
}

struct ActiveSegment {
    first_index: LogIndex,
    bytes: u64,
    writer: BufWriter<File>,
}

struct LogInner {
    entries: BTreeMap<LogIndex, LogEntry>,
    /// Segment first-index -> file path, sorted, including the active one.
    segments: Vec<(LogIndex, PathBuf)>,
    active: Option<ActiveSegment>,
    meta: LogMeta,
    last_fsync: Instant,
}

impl LogInner {
    fn latest_index(&self) -> LogIndex {
        self.entries
            .last_key_value()
            .map(|(index, _)| *index)
            .unwrap_or(self.meta.prev_index)
    }

    fn latest_term(&self) -> Term {
        self.entries
            .last_key_value()
            .map(|(_, entry)| entry.term)
            .unwrap_or(self.meta.prev_term)
    }

    fn oldest_available_index(&self) -> LogIndex {
        self.meta.prev_index + 1
    }

    fn is_active(&self, first_index: LogIndex) -> bool {
        self.active
            .as_ref()
            .map(|a| a.first_index == first_index)
            .unwrap_or(false)
    }

    fn seal_active(&mut self) -> Result<()> {
        if let Some(active) = &mut self.active {
            active.writer.flush()?;
            active.writer.get_ref().sync_all()?;
        }
        self.active = None;
        Ok(())
    }
}

/// Durable, segmented, append-only store for the replicated log.
///
/// Appends and truncations are mutually exclusive; reads of durable
/// ranges run concurrently under the shared lock and are consistent
/// with the most recent local write.
pub struct SegmentedLog {
    config: LogStoreConfig,
    inner: RwLock<LogInner>,
}

impl SegmentedLog {
    /// Open the log directory, scanning segments and recovering from a
    /// torn tail. A corrupt record anywhere before the durable tail is
    /// an error: the member must not serve until repaired by snapshot
    /// catch-up.
    pub fn open(config: LogStoreConfig) -> Result<Self> {
        config.validate().map_err(LogStoreError::InvalidConfig)?;
        fs::create_dir_all(&config.directory)?;

        let meta = load_meta(&config)?;
        let mut entries = BTreeMap::new();
        let mut segments = Vec::new();

        let listed = list_segment_files(&config.directory)?;
        let last_position = listed.len().saturating_sub(1);

        for (position, (first_index, path)) in listed.into_iter().enumerate() {
            let mut scan = read_segment(&path)?;
            check_contiguous(&path, first_index, &scan.entries)?;

            if !scan.clean {
                if position == last_position {
                    // Crash during the last append: drop the torn tail
                    truncate_segment_file(&path, scan.valid_len)?;
                } else {
                    return Err(LogStoreError::Corrupted {
                        segment: path,
                        offset: scan.valid_len,
                    });
                }
            }

            // A prune may have persisted its boundary and crashed
            // before deleting the files it covered
            let last_in_segment = scan
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or(first_index);
            if last_in_segment <= meta.prev_index {
                warn!("Removing stale segment {:?} below the prune boundary", path);
                fs::remove_file(&path)?;
                continue;
            }

            for entry in scan.entries.drain(..) {
                if entry.index > meta.prev_index {
                    entries.insert(entry.index, entry);
                }
            }
            segments.push((first_index, path));
        }

        // The retained window must start right after the boundary and
        // have no gaps
        let mut expected = meta.prev_index + 1;
        for index in entries.keys() {
            if *index != expected {
                return Err(LogStoreError::Corrupted {
                    segment: config.directory.join(META_FILE),
                    offset: expected,
                });
            }
            expected += 1;
        }

        // Reopen the last segment for appending if it has room
        let mut active = None;
        if let Some((first_index, path)) = segments.last() {
            let len = fs::metadata(path)?.len();
            if len < config.segment_size_bytes {
                let file = OpenOptions::new().append(true).open(path)?;
                active = Some(ActiveSegment {
                    first_index: *first_index,
                    bytes: len,
                    writer: BufWriter::new(file),
                });
            }
        }

        let inner = LogInner {
            entries,
            segments,
            active,
            meta,
            last_fsync: Instant::now(),
        };

        info!(
            "Raft log opened at {:?}: window [{}, {}], {} segments",
            config.directory,
            inner.oldest_available_index(),
            inner.latest_index(),
            inner.segments.len()
        );

        Ok(Self {
            config,
            inner: RwLock::new(inner),
        })
    }

    /// Append one entry; the returned `Ok` is a durable ack under the
    /// configured fsync mode.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        self.append_batch(vec![entry])
    }

    /// Append a batch, fsyncing once at the end.
    pub fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        for entry in entries {
            self.append_locked(&mut inner, entry)?;
        }
        self.sync_locked(&mut inner)?;
        Ok(())
    }

    fn append_locked(&self, inner: &mut LogInner, entry: LogEntry) -> Result<()> {
        let expected = inner.latest_index() + 1;
        if entry.index != expected {
            return Err(LogStoreError::NonContiguous {
                expected,
                got: entry.index,
            });
        }

        if inner.active.is_none() {
            let path = self.config.directory.join(segment_file_name(entry.index));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            inner.segments.push((entry.index, path));
            inner.active = Some(ActiveSegment {
                first_index: entry.index,
                bytes: 0,
                writer: BufWriter::new(file),
            });
        }

        let active = inner.active.as_mut().expect("active segment exists");
        active.bytes += write_record(&mut active.writer, &entry)?;
        let full = active.bytes >= self.config.segment_size_bytes;

        debug!("Log append: index={}, term={}", entry.index, entry.term);
        inner.entries.insert(entry.index, entry);

        if full {
            inner.seal_active()?;
        }
        Ok(())
    }

    fn sync_locked(&self, inner: &mut LogInner) -> Result<()> {
        let Some(active) = &mut inner.active else {
            // Rotation already flushed and synced
            return Ok(());
        };

        active.writer.flush()?;
        match self.config.fsync_mode {
            FsyncMode::Always => {
                active.writer.get_ref().sync_all()?;
                inner.last_fsync = Instant::now();
            }
            FsyncMode::Periodic => {
                if inner.last_fsync.elapsed().as_millis()
                    >= self.config.fsync_interval_ms as u128
                {
                    active.writer.get_ref().sync_all()?;
                    inner.last_fsync = Instant::now();
                }
            }
            FsyncMode::Never => {}
        }
        Ok(())
    }

    /// Remove every entry at and after `from`, used to resolve
    /// replication conflicts. Replaying the same appends afterwards
    /// yields the same log contents.
    pub fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();

        if from > inner.latest_index() {
            return Ok(());
        }
        if from < inner.oldest_available_index() {
            return Err(LogStoreError::OutOfRange {
                index: from,
                oldest: inner.oldest_available_index(),
                latest: inner.latest_index(),
            });
        }

        info!(
            "Truncating log suffix from index {} (latest was {})",
            from,
            inner.latest_index()
        );

        inner.seal_active()?;
        inner.entries.split_off(&from);

        let mut kept = Vec::new();
        for (first_index, path) in std::mem::take(&mut inner.segments) {
            if first_index >= from {
                fs::remove_file(&path)?;
            } else {
                kept.push((first_index, path));
            }
        }
        inner.segments = kept;

        // The last surviving segment may still hold truncated records;
        // rewrite it with what remains and reopen it for appending
        if let Some((first_index, path)) = inner.segments.last().cloned() {
            let remaining: Vec<LogEntry> =
                inner.entries.range(first_index..).map(|(_, e)| e.clone()).collect();
            let bytes = write_segment_file(&self.config.directory, first_index, &remaining)?;

            let file = OpenOptions::new().append(true).open(&path)?;
            inner.active = Some(ActiveSegment {
                first_index,
                bytes,
                writer: BufWriter::new(file),
            });
        }

        Ok(())
    }

    /// Index of the oldest entry still retained (one past the prune
    /// boundary; equals `latest_index() + 1` when the window is empty).
    pub fn oldest_available_index(&self) -> LogIndex {
        self.inner.read().oldest_available_index()
    }

    pub fn latest_index(&self) -> LogIndex {
        self.inner.read().latest_index()
    }

    pub fn latest_term(&self) -> Term {
        self.inner.read().latest_term()
    }

    /// Term of the entry at `index`. Answers for the prune boundary
    /// itself (from persisted metadata) and for the empty-log sentinel.
    pub fn entry_term(&self, index: LogIndex) -> Option<Term> {
        let inner = self.inner.read();
        if index == inner.meta.prev_index {
            return Some(inner.meta.prev_term);
        }
        inner.entries.get(&index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.read().entries.get(&index).cloned()
    }

    /// Eagerly read a bounded range (both ends inclusive).
    pub fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read();
        if from > to {
            return Ok(Vec::new());
        }
        if from < inner.oldest_available_index() || to > inner.latest_index() {
            return Err(LogStoreError::OutOfRange {
                index: from,
                oldest: inner.oldest_available_index(),
                latest: inner.latest_index(),
            });
        }
        Ok(inner.entries.range(from..=to).map(|(_, e)| e.clone()).collect())
    }

    /// Lazy range reader; fetches in small chunks so long scans do not
    /// hold the lock against writers.
    pub fn iter_range(&self, from: LogIndex, to: LogIndex) -> LogRange<'_> {
        LogRange {
            log: self,
            next: from,
            end: to,
            buf: VecDeque::new(),
        }
    }

    /// Delete whole sealed segments up to `safe_index`, further bounded
    /// by the configured retention strategy. `safe_index` must already
    /// account for the commit/apply boundary and follower retention;
    /// this method never deletes past it. Returns the number of
    /// segments removed.
    pub fn prune(&self, safe_index: LogIndex) -> Result<usize> {
        let mut inner = self.inner.write();
        let latest = inner.latest_index();

        let floor = match self.config.prune_strategy {
            PruneStrategy::KeepNone => safe_index,
            PruneStrategy::KeepEntries(keep) => safe_index.min(latest.saturating_sub(keep)),
            PruneStrategy::KeepSegments(keep) => {
                if inner.segments.len() <= keep {
                    return Ok(0);
                }
                let boundary_first = inner.segments[inner.segments.len() - keep].0;
                safe_index.min(boundary_first.saturating_sub(1))
            }
        };

        if inner.segments.is_empty() {
            return Ok(0);
        }

        // Walk the segment prefix that is entirely below the floor
        let mut deletable = 0;
        for position in 0..inner.segments.len() {
            let (first_index, _) = inner.segments[position];
            if inner.is_active(first_index) {
                break;
            }
            let last_in_segment = match inner.segments.get(position + 1) {
                Some((next_first, _)) => next_first - 1,
                None => inner.latest_index(),
            };
            if last_in_segment <= floor {
                deletable = position + 1;
            } else {
                break;
            }
        }

        // The segment holding the log head is never deleted, even when
        // the whole window is below the floor
        deletable = deletable.min(inner.segments.len() - 1);
        if deletable == 0 {
            return Ok(0);
        }

        let (boundary_first, _) = inner.segments[deletable];
        let new_prev = boundary_first - 1;
        let new_prev_term = inner
            .entries
            .get(&new_prev)
            .map(|e| e.term)
            .unwrap_or(inner.meta.prev_term);

        // Persist the boundary first; a crash between here and the
        // deletions leaves stale segments that recovery removes
        inner.meta = LogMeta {
            prev_index: new_prev,
            prev_term: new_prev_term,
        };
        save_meta(&self.config, &inner.meta)?;

        for (_, path) in inner.segments.drain(..deletable) {
            debug!("Pruning segment {:?}", path.file_name().unwrap_or_default());
            fs::remove_file(&path)?;
        }

        let retained = inner.entries.split_off(&(new_prev + 1));
        inner.entries = retained;

        info!(
            "Pruned {} segments; window now [{}, {}]",
            deletable,
            inner.oldest_available_index(),
            inner.latest_index()
        );
        Ok(deletable)
    }

    /// Drop everything and restart the log after a snapshot install:
    /// the next expected index becomes `next_index` and consistency
    /// checks against the boundary use `prev_term`.
    pub fn reset(&self, next_index: LogIndex, prev_term: Term) -> Result<()> {
        let mut inner = self.inner.write();

        inner.active = None;
        for (_, path) in inner.segments.drain(..) {
            fs::remove_file(&path)?;
        }
        inner.entries.clear();
        inner.meta = LogMeta {
            prev_index: next_index.saturating_sub(1),
            prev_term,
        };
        save_meta(&self.config, &inner.meta)?;

        info!("Raft log reset; next expected index is {}", next_index);
        Ok(())
    }

    /// Flush and fsync any buffered appends.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(active) = &mut inner.active {
            active.writer.flush()?;
            active.writer.get_ref().sync_all()?;
            inner.last_fsync = Instant::now();
        }
        Ok(())
    }
}

/// Chunked lazy iterator over a log range.
pub struct LogRange<'a> {
    log: &'a SegmentedLog,
    next: LogIndex,
    end: LogIndex,
    buf: VecDeque<LogEntry>,
}

impl Iterator for LogRange<'_> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buf.pop_front() {
            return Some(Ok(entry));
        }
        if self.next > self.end {
            return None;
        }

        let chunk_end = self.end.min(self.next + 63);
        match self.log.read_range(self.next, chunk_end) {
            Ok(chunk) => {
                self.next = chunk_end + 1;
                self.buf = chunk.into();
                self.buf.pop_front().map(Ok)
            }
            Err(e) => {
                self.next = self.end + 1;
                Some(Err(e))
            }
        }
    }
}

fn load_meta(config: &LogStoreConfig) -> Result<LogMeta> {
    let path = config.directory.join(META_FILE);
    if !path.exists() {
        return Ok(LogMeta::default());
    }

    let file = File::open(&path)?;
    let meta = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| LogStoreError::Serialization(e.to_string()))?;
    Ok(meta)
}

fn save_meta(config: &LogStoreConfig, meta: &LogMeta) -> Result<()> {
    let path = config.directory.join(META_FILE);
    let temp_path = config.directory.join(format!("{}.tmp", META_FILE));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, meta)
        .map_err(|e| LogStoreError::Serialization(e.to_string()))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;
    Ok(())
}
