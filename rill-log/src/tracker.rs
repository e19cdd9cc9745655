//! Durable last-committed-offset tracking.
//!
//! Each consumer group owns one append-only commit log per queue, stored in
//! `<queue>/offset-<group>/commits.olog` and created lazily on the first
//! commit. Every tracker instance serves one (partition, group) pair; all
//! trackers of a group append to the same file, distinguished by the
//! partition index stored in each row. Commits are appended, never
//! rewritten, so the most recent row for a partition is authoritative.
//!
//! Rows are fixed-stride so the authoritative read can scan backward from
//! the end of the file:
//!
//! ```text
//! [partition: u32][offset: u64][timestamp_ms: i64][crc32: u32]   (24 bytes)
//! ```
//!
//! The commit log is never touched by partition retention purging.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::cycle::Clock;
use crate::error::{LogError, LogResult};

/// Size of one commit row in bytes.
pub const COMMIT_ROW_SIZE: usize = 24;

/// File name of a group's commit log.
pub const COMMIT_FILE: &str = "commits.olog";

/// Directory name holding a group's commit log.
#[must_use]
pub fn group_dir_name(group: &str) -> String {
    format!("offset-{group}")
}

/// Extracts the group name from an `offset-<group>` directory name.
#[must_use]
pub fn parse_group_dir_name(name: &str) -> Option<&str> {
    name.strip_prefix("offset-")
}

fn commit_log_path(queue_dir: &Path, group: &str) -> PathBuf {
    queue_dir.join(group_dir_name(group)).join(COMMIT_FILE)
}

fn encode_row(partition: u32, offset: u64, timestamp_ms: i64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(COMMIT_ROW_SIZE);
    buf.put_u32_le(partition);
    buf.put_u64_le(offset);
    buf.put_i64_le(timestamp_ms);
    let crc = crc32fast::hash(&buf[..COMMIT_ROW_SIZE - 4]);
    buf.put_u32_le(crc);
    buf
}

/// Reads the most recent committed offset of a (partition, group) pair
/// straight from the group's commit log, without constructing a tracker.
///
/// Scans the file backward in fixed strides and returns the first row
/// matching the partition index; `None` if the group has never committed
/// for this partition. Rows failing their CRC are skipped.
///
/// # Errors
/// Returns `Io` if the commit log exists but cannot be read.
pub fn read_last_committed(
    queue_dir: &Path,
    group: &str,
    partition: u32,
) -> LogResult<Option<u64>> {
    let path = commit_log_path(queue_dir, group);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LogError::io("open_commit_log", e)),
    };
    let len = file
        .metadata()
        .map_err(|e| LogError::io("metadata", e))?
        .len();
    // A torn trailing row (crash mid-commit) is ignored.
    let mut rows = len / COMMIT_ROW_SIZE as u64;
    let mut buf = [0u8; COMMIT_ROW_SIZE];
    while rows > 0 {
        rows -= 1;
        file.seek(SeekFrom::Start(rows * COMMIT_ROW_SIZE as u64))
            .map_err(|e| LogError::io("seek", e))?;
        file.read_exact(&mut buf)
            .map_err(|e| LogError::io("read_commit_row", e))?;
        let expected_crc =
            u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        if crc32fast::hash(&buf[..COMMIT_ROW_SIZE - 4]) != expected_crc {
            warn!(?path, row = rows, "commit row failed CRC, skipping");
            continue;
        }
        let row_partition = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if row_partition == partition {
            let offset = u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]);
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

/// Durable cursor store for one (partition, group) pair.
pub struct OffsetTracker {
    queue_dir: PathBuf,
    group: String,
    partition: u32,
    clock: Arc<dyn Clock>,
    /// Append handle, opened lazily on first commit.
    file: Option<File>,
    /// In-memory fast path. Valid only for single-process, single-reader
    /// use; `read_last_committed` is the authoritative view.
    cached: Option<u64>,
    closed: bool,
}

impl std::fmt::Debug for OffsetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetTracker")
            .field("group", &self.group)
            .field("partition", &self.partition)
            .field("cached", &self.cached)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl OffsetTracker {
    /// Creates a tracker. No file is touched until the first commit.
    #[must_use]
    pub fn new(queue_dir: &Path, group: &str, partition: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue_dir: queue_dir.to_path_buf(),
            group: group.to_string(),
            partition,
            clock,
            file: None,
            cached: None,
            closed: false,
        }
    }

    /// Appends a commit row for this partition and fsyncs it.
    ///
    /// The stored value is the next unread offset of the group's cursor.
    ///
    /// # Errors
    /// Returns `Closed` after `close()`, `Io` on write failure.
    pub fn commit(&mut self, offset: u64) -> LogResult<()> {
        if self.closed {
            return Err(LogError::Closed);
        }
        if self.file.is_none() {
            let path = commit_log_path(&self.queue_dir, &self.group);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LogError::io("create_group_dir", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| LogError::io("open_commit_log", e))?;
            self.file = Some(file);
        }
        let row = encode_row(self.partition, offset, self.clock.now_ms());
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        file.write_all(&row)
            .map_err(|e| LogError::io("append_commit", e))?;
        file.sync_data().map_err(|e| LogError::io("sync_commit", e))?;
        self.cached = Some(offset);
        Ok(())
    }

    /// Fast path: the last offset committed through this tracker, falling
    /// back to one authoritative read when the cache is cold.
    ///
    /// # Errors
    /// Returns `Closed` after `close()`, `Io` on read failure.
    pub fn last_committed(&mut self) -> LogResult<Option<u64>> {
        if self.closed {
            return Err(LogError::Closed);
        }
        if let Some(cached) = self.cached {
            return Ok(Some(cached));
        }
        let read = self.read_last_committed()?;
        self.cached = read;
        Ok(read)
    }

    /// Authoritative read: scans the commit log backward for this
    /// partition's most recent row.
    ///
    /// # Errors
    /// Returns `Closed` after `close()`, `Io` on read failure.
    pub fn read_last_committed(&self) -> LogResult<Option<u64>> {
        if self.closed {
            return Err(LogError::Closed);
        }
        read_last_committed(&self.queue_dir, &self.group, self.partition)
    }

    /// Releases the commit log handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
        self.closed = true;
    }

    /// Returns true once the tracker is closed.
    #[must_use]
    pub const fn closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::SystemClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    #[test]
    fn test_no_commit_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::new(dir.path(), "g1", 0, clock());
        assert_eq!(tracker.read_last_committed().unwrap(), None);
        // Lazy creation: no directory until the first commit.
        assert!(!dir.path().join(group_dir_name("g1")).exists());
    }

    #[test]
    fn test_commit_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OffsetTracker::new(dir.path(), "g1", 0, clock());
        tracker.commit(5).unwrap();
        tracker.commit(9).unwrap();
        assert_eq!(tracker.last_committed().unwrap(), Some(9));
        assert_eq!(tracker.read_last_committed().unwrap(), Some(9));

        // A fresh tracker sees the durable value.
        let mut fresh = OffsetTracker::new(dir.path(), "g1", 0, clock());
        assert_eq!(fresh.last_committed().unwrap(), Some(9));
    }

    #[test]
    fn test_rows_are_per_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut t0 = OffsetTracker::new(dir.path(), "g1", 0, clock());
        let mut t1 = OffsetTracker::new(dir.path(), "g1", 1, clock());
        t0.commit(3).unwrap();
        t1.commit(7).unwrap();
        t0.commit(4).unwrap();

        assert_eq!(read_last_committed(dir.path(), "g1", 0).unwrap(), Some(4));
        assert_eq!(read_last_committed(dir.path(), "g1", 1).unwrap(), Some(7));
        assert_eq!(read_last_committed(dir.path(), "g1", 2).unwrap(), None);
    }

    #[test]
    fn test_groups_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = OffsetTracker::new(dir.path(), "group-a", 0, clock());
        let mut b = OffsetTracker::new(dir.path(), "group-b", 0, clock());
        a.commit(2).unwrap();
        b.commit(8).unwrap();
        assert_eq!(read_last_committed(dir.path(), "group-a", 0).unwrap(), Some(2));
        assert_eq!(read_last_committed(dir.path(), "group-b", 0).unwrap(), Some(8));
    }

    #[test]
    fn test_corrupt_row_skipped_for_older_valid_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OffsetTracker::new(dir.path(), "g1", 0, clock());
        tracker.commit(5).unwrap();
        tracker.commit(9).unwrap();

        // Flip the stored CRC of the newest row in place.
        let path = commit_log_path(dir.path(), "g1");
        let mut data = std::fs::read(&path).unwrap();
        let crc_at = 2 * COMMIT_ROW_SIZE - 4;
        for byte in &mut data[crc_at..crc_at + 4] {
            *byte ^= 0xFF;
        }
        std::fs::write(&path, data).unwrap();

        // The backward scan lands on the older valid row.
        assert_eq!(read_last_committed(dir.path(), "g1", 0).unwrap(), Some(5));
    }

    #[test]
    fn test_torn_trailing_row_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OffsetTracker::new(dir.path(), "g1", 0, clock());
        tracker.commit(5).unwrap();

        let path = commit_log_path(dir.path(), "g1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap(); // crash mid-row
        drop(file);

        assert_eq!(read_last_committed(dir.path(), "g1", 0).unwrap(), Some(5));
    }

    #[test]
    fn test_closed_tracker_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = OffsetTracker::new(dir.path(), "g1", 0, clock());
        tracker.commit(1).unwrap();
        tracker.close();
        assert!(tracker.closed());
        assert!(matches!(tracker.commit(2), Err(LogError::Closed)));
        assert!(matches!(tracker.last_committed(), Err(LogError::Closed)));
    }

    #[test]
    fn test_group_dir_name_round_trip() {
        assert_eq!(group_dir_name("g1"), "offset-g1");
        assert_eq!(parse_group_dir_name("offset-g1"), Some("g1"));
        assert_eq!(parse_group_dir_name("partition-00"), None);
    }
}
