//! Segment file management.
//!
//! A segment is one append-only file inside a partition directory, holding
//! the records written during one roll cycle. Segments are immutable once
//! the partition has rolled past them; only the newest segment of a
//! partition grows. Retention and purging operate on whole segment files.
//!
//! # Segment File Format
//!
//! ```text
//! +-------------------+
//! | Segment Header    |  (32 bytes)
//! +-------------------+
//! | Frame 1           |
//! +-------------------+
//! | Frame 2           |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! Segment header:
//! - Magic (8 bytes): "RILLSEG1"
//! - Version (4 bytes): format version
//! - Cycle (8 bytes): roll cycle id this segment belongs to
//! - First offset (8 bytes): offset of the first record in this segment
//! - Reserved (4 bytes)
//!
//! Frame: `[len: u32][crc32(payload): u32][payload]`, one record per frame,
//! written with a single write call so a concurrent reader sees either the
//! whole frame or a short file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{LogError, LogResult};

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Frame header size in bytes (length + CRC).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Magic bytes identifying a rill segment file.
const SEGMENT_MAGIC: &[u8; 8] = b"RILLSEG1";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Returns the directory name for a partition index.
#[must_use]
pub fn partition_dir_name(partition: u32) -> String {
    format!("partition-{partition:02}")
}

/// Parses a partition directory name back into its index.
#[must_use]
pub fn parse_partition_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("partition-")?.parse().ok()
}

/// Returns the file name for a segment of the given cycle.
#[must_use]
pub fn segment_file_name(cycle: u64) -> String {
    format!("segment-{cycle:016x}.{SEGMENT_EXTENSION}")
}

/// Parses a segment file name back into its cycle id.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("segment-")?;
    let hex = rest.strip_suffix(&format!(".{SEGMENT_EXTENSION}"))?;
    u64::from_str_radix(hex, 16).ok()
}

/// Segment header stored at the beginning of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u32,
    /// Roll cycle id.
    pub cycle: u64,
    /// Offset of the first record in this segment.
    pub first_offset: u64,
}

impl SegmentHeader {
    /// Creates a header for a new segment.
    #[must_use]
    pub const fn new(cycle: u64, first_offset: u64) -> Self {
        Self {
            version: SEGMENT_VERSION,
            cycle,
            first_offset,
        }
    }

    /// Encodes the header to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.cycle);
        buf.put_u64_le(self.first_offset);
        buf.put_u32_le(0); // reserved
    }

    /// Decodes a header read from `path`.
    ///
    /// # Errors
    /// Returns `Corruption` on bad magic or unknown version.
    pub fn decode(mut buf: &[u8], path: &Path) -> LogResult<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(LogError::Corruption {
                path: path.to_path_buf(),
                detail: format!("short header: {} bytes", buf.len()),
            });
        }
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(LogError::Corruption {
                path: path.to_path_buf(),
                detail: "bad segment magic".to_string(),
            });
        }
        let version = buf.get_u32_le();
        if version != SEGMENT_VERSION {
            return Err(LogError::Corruption {
                path: path.to_path_buf(),
                detail: format!("unsupported segment version {version}"),
            });
        }
        let cycle = buf.get_u64_le();
        let first_offset = buf.get_u64_le();
        Ok(Self {
            version,
            cycle,
            first_offset,
        })
    }
}

/// Location and identity of one segment file on disk.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Roll cycle id.
    pub cycle: u64,
    /// Offset of the first record in the segment.
    pub first_offset: u64,
    /// Path of the segment file.
    pub path: PathBuf,
}

/// Lists the segments of a partition directory, sorted by cycle.
///
/// Files that do not match the segment naming scheme are ignored; files
/// with an unreadable header are skipped with a warning (they are left for
/// the operator, never silently deleted).
///
/// # Errors
/// Returns `Io` if the directory cannot be read.
pub fn list_segments(dir: &Path) -> LogResult<Vec<SegmentMeta>> {
    let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read_dir", e))?;
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(cycle) = parse_segment_file_name(name) else {
            continue;
        };
        match read_header(&path) {
            Ok(header) => {
                if header.cycle != cycle {
                    warn!(?path, "segment header cycle does not match file name, skipping");
                    continue;
                }
                segments.push(SegmentMeta {
                    cycle,
                    first_offset: header.first_offset,
                    path,
                });
            }
            Err(e) => {
                warn!(?path, error = %e, "unreadable segment header, skipping");
            }
        }
    }
    segments.sort_by_key(|s| s.cycle);
    Ok(segments)
}

fn read_header(path: &Path) -> LogResult<SegmentHeader> {
    let mut file = File::open(path).map_err(|e| LogError::io("open", e))?;
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|e| LogError::io("read_header", e))?;
    SegmentHeader::decode(&buf, path)
}

/// Counts the complete frames in a segment file.
///
/// A torn frame at the tail (writer mid-append, or a crash) is not counted;
/// the writer position recovers to just before it.
///
/// # Errors
/// Returns `Io` if the file cannot be read.
pub fn scan_record_count(path: &Path) -> LogResult<u64> {
    let mut file = File::open(path).map_err(|e| LogError::io("open", e))?;
    let len = file
        .metadata()
        .map_err(|e| LogError::io("metadata", e))?
        .len();
    let mut pos = SEGMENT_HEADER_SIZE as u64;
    let mut count = 0u64;
    let mut frame_header = [0u8; FRAME_HEADER_SIZE];
    while pos + FRAME_HEADER_SIZE as u64 <= len {
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| LogError::io("seek", e))?;
        file.read_exact(&mut frame_header)
            .map_err(|e| LogError::io("read_frame_header", e))?;
        let payload_len = u64::from(u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]));
        let frame_end = pos + FRAME_HEADER_SIZE as u64 + payload_len;
        if frame_end > len {
            break; // torn tail
        }
        pos = frame_end;
        count += 1;
    }
    Ok(count)
}

/// Returns the end-of-partition position: the offset the next append will
/// be assigned. 0 for a partition that has never been written.
///
/// # Errors
/// Returns `Io` if the directory or segment files cannot be read.
pub fn partition_end(dir: &Path) -> LogResult<u64> {
    let segments = list_segments(dir)?;
    match segments.last() {
        None => Ok(0),
        Some(last) => Ok(last.first_offset + scan_record_count(&last.path)?),
    }
}

/// Returns the oldest retained offset of a partition. 0 when empty.
///
/// # Errors
/// Returns `Io` if the directory cannot be read.
pub fn partition_first(dir: &Path) -> LogResult<u64> {
    let segments = list_segments(dir)?;
    Ok(segments.first().map_or(0, |s| s.first_offset))
}

/// Append handle on the open segment of a partition.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    cycle: u64,
}

impl SegmentWriter {
    /// Creates a new segment file with its header.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be created or written.
    pub fn create(dir: &Path, cycle: u64, first_offset: u64) -> LogResult<Self> {
        let path = dir.join(segment_file_name(cycle));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io("create_segment", e))?;
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE);
        SegmentHeader::new(cycle, first_offset).encode(&mut buf);
        file.write_all(&buf).map_err(|e| LogError::io("write_header", e))?;
        Ok(Self { file, path, cycle })
    }

    /// Reopens an existing segment for appending (same cycle still open,
    /// e.g. after process restart within the cycle).
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be opened.
    pub fn reopen(meta: &SegmentMeta) -> LogResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(&meta.path)
            .map_err(|e| LogError::io("open_segment", e))?;
        Ok(Self {
            file,
            path: meta.path.clone(),
            cycle: meta.cycle,
        })
    }

    /// Roll cycle this segment belongs to.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one framed record.
    ///
    /// The whole frame goes out in a single write call, so a concurrent
    /// reader observes either the complete frame or a short file.
    ///
    /// # Errors
    /// Returns `Io` if the write fails.
    #[allow(clippy::cast_possible_truncation)] // Payload length checked below.
    pub fn append_frame(&mut self, payload: &[u8]) -> LogResult<()> {
        if payload.len() > u32::MAX as usize {
            return Err(LogError::Configuration {
                reason: format!("record payload too large: {} bytes", payload.len()),
            });
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(crc32fast::hash(payload));
        buf.put_slice(payload);
        self.file
            .write_all(&buf)
            .map_err(|e| LogError::io("append_frame", e))
    }
}

/// Sequential frame reader over one segment file.
///
/// The reader tolerates a growing file: a partial frame at the tail reads
/// as "nothing available yet", never as an error.
#[derive(Debug)]
pub struct SegmentReader {
    file: File,
    path: PathBuf,
    cycle: u64,
    first_offset: u64,
    pos: u64,
}

impl SegmentReader {
    /// Opens a reader positioned on the first record of the segment.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be opened.
    pub fn open(meta: &SegmentMeta) -> LogResult<Self> {
        let file = File::open(&meta.path).map_err(|e| LogError::io("open_segment", e))?;
        Ok(Self {
            file,
            path: meta.path.clone(),
            cycle: meta.cycle,
            first_offset: meta.first_offset,
            pos: SEGMENT_HEADER_SIZE as u64,
        })
    }

    /// Roll cycle of the segment being read.
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Offset of the first record in the segment.
    #[must_use]
    pub const fn first_offset(&self) -> u64 {
        self.first_offset
    }

    /// Reads the next complete frame, or `None` if the segment holds no
    /// further complete frame right now.
    ///
    /// # Errors
    /// Returns `Corruption` on a CRC mismatch, `Io` on read failure.
    pub fn read_next(&mut self) -> LogResult<Option<Bytes>> {
        let len = self
            .file
            .metadata()
            .map_err(|e| LogError::io("metadata", e))?
            .len();
        if self.pos + FRAME_HEADER_SIZE as u64 > len {
            return Ok(None);
        }
        self.file
            .seek(SeekFrom::Start(self.pos))
            .map_err(|e| LogError::io("seek", e))?;
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        self.file
            .read_exact(&mut frame_header)
            .map_err(|e| LogError::io("read_frame_header", e))?;
        let payload_len = u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]) as usize;
        let expected_crc = u32::from_le_bytes([
            frame_header[4],
            frame_header[5],
            frame_header[6],
            frame_header[7],
        ]);
        if self.pos + (FRAME_HEADER_SIZE + payload_len) as u64 > len {
            return Ok(None); // frame still in flight
        }
        let mut payload = vec![0u8; payload_len];
        self.file
            .read_exact(&mut payload)
            .map_err(|e| LogError::io("read_frame", e))?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(LogError::Corruption {
                path: self.path.clone(),
                detail: format!(
                    "frame CRC mismatch at byte {}: expected {expected_crc:08x}, got {actual_crc:08x}",
                    self.pos
                ),
            });
        }
        self.pos += (FRAME_HEADER_SIZE + payload_len) as u64;
        Ok(Some(Bytes::from(payload)))
    }

    /// Skips up to `n` complete frames, returning how many were skipped.
    ///
    /// Skipping stops early at the tail of the segment; the reader is then
    /// positioned exactly where the writer will append next.
    ///
    /// # Errors
    /// Returns `Io` on read failure.
    pub fn skip_frames(&mut self, n: u64) -> LogResult<u64> {
        let len = self
            .file
            .metadata()
            .map_err(|e| LogError::io("metadata", e))?
            .len();
        let mut skipped = 0u64;
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        while skipped < n && self.pos + FRAME_HEADER_SIZE as u64 <= len {
            self.file
                .seek(SeekFrom::Start(self.pos))
                .map_err(|e| LogError::io("seek", e))?;
            self.file
                .read_exact(&mut frame_header)
                .map_err(|e| LogError::io("read_frame_header", e))?;
            let payload_len = u64::from(u32::from_le_bytes([
                frame_header[0],
                frame_header[1],
                frame_header[2],
                frame_header[3],
            ]));
            let frame_end = self.pos + FRAME_HEADER_SIZE as u64 + payload_len;
            if frame_end > len {
                break;
            }
            self.pos = frame_end;
            skipped += 1;
        }
        Ok(skipped)
    }
}
