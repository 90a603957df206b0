//! Segment file operations
//!
//! Each segment is a sequence of framed records:
//! `u64 length | u32 crc32 | bincode-encoded LogEntry`. Segments are
//! named by the index of their first entry and immutable once sealed,
//! except for pruning deletion and conflict-truncation rewrites.

use super::types::{LogStoreError, Result};
use crate::consensus::{LogEntry, LogIndex};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".raft";

pub(crate) fn segment_file_name(first_index: LogIndex) -> String {
    format!("{}{:016}{}", SEGMENT_PREFIX, first_index, SEGMENT_SUFFIX)
}

pub(crate) fn parse_segment_file_name(name: &str) -> Option<LogIndex> {
    let index = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    index.parse().ok()
}

/// All segment files in the directory, sorted by first index.
pub(crate) fn list_segment_files(dir: &Path) -> Result<Vec<(LogIndex, PathBuf)>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(first_index) = parse_segment_file_name(name) {
                segments.push((first_index, path));
            }
        }
    }

    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Append one framed record; returns the bytes written.
pub(crate) fn write_record<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<u64> {
    let data = bincode::serialize(entry)?;
    let checksum = crc32fast::hash(&data);

    writer.write_all(&(data.len() as u64).to_be_bytes())?;
    writer.write_all(&checksum.to_be_bytes())?;
    writer.write_all(&data)?;

    Ok(12 + data.len() as u64)
}

/// Outcome of scanning one segment file.
pub(crate) struct SegmentScan {
    pub entries: Vec<LogEntry>,
    /// Length of the valid prefix of the file.
    pub valid_len: u64,
    /// False when the scan stopped at a torn or corrupt record.
    pub clean: bool,
}

/// Read every record in a segment, stopping at the first torn or
/// corrupt one. The caller decides whether a dirty tail is a crash
/// artifact (last segment, truncate and continue) or corruption
/// (anywhere else, refuse to serve).
pub(crate) fn read_segment(path: &Path) -> Result<SegmentScan> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut header = [0u8; 12];
        match read_exact_or_eof(&mut reader, &mut header) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof => break,
            ReadOutcome::Partial => {
                return Ok(SegmentScan {
                    entries,
                    valid_len,
                    clean: false,
                });
            }
        }

        let length = u64::from_be_bytes(header[..8].try_into().expect("8-byte slice"));
        let expected_crc = u32::from_be_bytes(header[8..].try_into().expect("4-byte slice"));

        let mut data = vec![0u8; length as usize];
        if reader.read_exact(&mut data).is_err() {
            return Ok(SegmentScan {
                entries,
                valid_len,
                clean: false,
            });
        }

        if crc32fast::hash(&data) != expected_crc {
            return Ok(SegmentScan {
                entries,
                valid_len,
                clean: false,
            });
        }

        match bincode::deserialize::<LogEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                return Ok(SegmentScan {
                    entries,
                    valid_len,
                    clean: false,
                });
            }
        }

        valid_len += 12 + length;
    }

    Ok(SegmentScan {
        entries,
        valid_len,
        clean: true,
    })
}

enum ReadOutcome {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                };
            }
            Ok(n) => filled += n,
            Err(_) => return ReadOutcome::Partial,
        }
    }
    ReadOutcome::Full
}

/// Rewrite a whole segment file through a temp file and atomic rename.
/// Used when truncating a conflict suffix out of a segment.
pub(crate) fn write_segment_file(
    dir: &Path,
    first_index: LogIndex,
    entries: &[LogEntry],
) -> Result<u64> {
    let path = dir.join(segment_file_name(first_index));
    let temp_path = dir.join(format!("{}.tmp", segment_file_name(first_index)));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    let mut writer = BufWriter::new(file);

    let mut bytes = 0;
    for entry in entries {
        bytes += write_record(&mut writer, entry)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;
    Ok(bytes)
}

/// Chop a dirty tail off a segment file (crash during append).
pub(crate) fn truncate_segment_file(path: &Path, valid_len: u64) -> Result<()> {
    warn!(
        "Truncating torn tail of {:?} to {} bytes",
        path.file_name().unwrap_or_default(),
        valid_len
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_len)?;
    file.sync_all()?;
    Ok(())
}

/// Validate that a scan produced the contiguous index run the segment
/// name promises.
pub(crate) fn check_contiguous(
    path: &Path,
    first_index: LogIndex,
    entries: &[LogEntry],
) -> Result<()> {
    for (offset, entry) in entries.iter().enumerate() {
        if entry.index != first_index + offset as u64 {
            return Err(LogStoreError::Corrupted {
                segment: path.to_path_buf(),
                offset: offset as u64,
            });
        }
    }
    Ok(())
}
