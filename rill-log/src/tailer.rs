//! Single-partition read cursors.
//!
//! A [`Tailer`] is a sequential cursor over one partition for one consumer
//! group. It owns the group's [`OffsetTracker`] for that partition; its
//! position survives restarts through committed offsets, not through any
//! state of its own.
//!
//! At most one live tailer may exist per (queue, partition, group) pair in
//! a process, enforced by the [`TailerGuard`]. The guard is process-local
//! only: nothing prevents two separate processes from tailing the same
//! partition under the same group, in which case commits interleave
//! most-recent-wins and records may be re-delivered.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rill_core::{LogOffset, LogPartition, LogRecord, Offset};

use crate::cycle::Clock;
use crate::error::{LogError, LogResult};
use crate::segment::{
    list_segments, partition_dir_name, partition_end, partition_first, SegmentReader,
};
use crate::tracker::OffsetTracker;

/// Minimum interval between poll attempts in blocking reads.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide registry of live (queue, partition, group) tailers.
///
/// Owned by the `Manager` and shared with every appender it opens; a
/// standalone appender creates its own. Process-local only by design.
#[derive(Debug, Default)]
pub struct TailerGuard {
    live: Mutex<HashSet<(String, u32, String)>>,
}

impl TailerGuard {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, name: &str, partition: u32, group: &str) -> LogResult<()> {
        let mut live = self.live.lock().map_err(|_| LogError::Closed)?;
        let key = (name.to_string(), partition, group.to_string());
        if !live.insert(key) {
            return Err(LogError::DuplicateTailer {
                name: name.to_string(),
                partition,
                group: group.to_string(),
            });
        }
        Ok(())
    }

    fn unregister(&self, name: &str, partition: u32, group: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&(name.to_string(), partition, group.to_string()));
        }
    }
}

/// State shared between a tailer and the appender that created it.
///
/// The appender holds only a `Weak` to this for bulk close; the tailer
/// itself is owned by the consumer.
#[derive(Debug)]
pub(crate) struct TailerShared {
    name: String,
    partition: u32,
    group: String,
    guard: Arc<TailerGuard>,
    closed: AtomicBool,
}

impl TailerShared {
    /// Marks the tailer closed and frees its guard slot. Idempotent.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.guard
                .unregister(&self.name, self.partition, &self.group);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Read cursor position within a partition.
#[derive(Debug)]
struct Cursor {
    /// Open segment reader; `None` means "reposition lazily on next read".
    reader: Option<SegmentReader>,
    /// Offset the next read will return.
    next_offset: u64,
}

/// Sequential read cursor bound to one partition and one consumer group.
#[derive(Debug)]
pub struct Tailer {
    shared: Arc<TailerShared>,
    partition: LogPartition,
    partition_dir: PathBuf,
    tracker: OffsetTracker,
    cursor: Cursor,
}

/// Retries `f` once on a transient I/O failure before propagating.
///
/// Boundary scans can glitch when racing a writer that is mid-roll; one
/// retry is enough to land on a consistent view.
fn retry_once<T>(mut f: impl FnMut() -> LogResult<T>) -> LogResult<T> {
    match f() {
        Err(LogError::Io { .. }) => f(),
        other => other,
    }
}

impl Tailer {
    /// Opens a tailer on `partition` for `group`, positioned on the last
    /// committed offset (start of partition when no commit exists).
    ///
    /// # Errors
    /// Returns `DuplicateTailer` if a live tailer for the same (queue,
    /// partition, group) already exists in this process, `NotFound` if the
    /// partition directory is missing.
    pub(crate) fn open(
        queue_dir: &Path,
        partition: LogPartition,
        group: &str,
        guard: Arc<TailerGuard>,
        clock: Arc<dyn Clock>,
    ) -> LogResult<Self> {
        let partition_dir = queue_dir.join(partition_dir_name(partition.partition));
        if !partition_dir.is_dir() {
            return Err(LogError::NotFound {
                path: partition_dir,
            });
        }
        guard.register(&partition.name, partition.partition, group)?;
        let shared = Arc::new(TailerShared {
            name: partition.name.clone(),
            partition: partition.partition,
            group: group.to_string(),
            guard,
            closed: AtomicBool::new(false),
        });
        let tracker = OffsetTracker::new(queue_dir, group, partition.partition, clock);
        let mut tailer = Self {
            shared,
            partition,
            partition_dir,
            tracker,
            cursor: Cursor {
                reader: None,
                next_offset: 0,
            },
        };
        if let Err(e) = tailer.to_last_committed() {
            tailer.close();
            return Err(e);
        }
        Ok(tailer)
    }

    pub(crate) fn shared(&self) -> &Arc<TailerShared> {
        &self.shared
    }

    /// The consumer group this tailer commits under.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.shared.group
    }

    /// The partition this tailer is bound to.
    #[must_use]
    pub const fn partition(&self) -> &LogPartition {
        &self.partition
    }

    /// The partitions assigned to this cursor (always exactly one).
    #[must_use]
    pub fn assignments(&self) -> Vec<LogPartition> {
        vec![self.partition.clone()]
    }

    /// Returns true once the tailer is closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn check_open(&self) -> LogResult<()> {
        if self.shared.is_closed() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Single non-blocking read attempt.
    ///
    /// Returns `None` when no record is available at the cursor right now.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Corruption`/`Io` from the segment
    /// layer.
    pub fn read(&mut self) -> LogResult<Option<LogRecord>> {
        self.check_open()?;
        if self.cursor.reader.is_none() && !self.position_reader()? {
            return Ok(None);
        }
        loop {
            let reader = self.cursor.reader.as_mut().ok_or(LogError::Closed)?;
            if let Some(payload) = reader.read_next()? {
                let offset = LogOffset::new(
                    self.partition.clone(),
                    Offset::new(self.cursor.next_offset),
                );
                self.cursor.next_offset += 1;
                return Ok(Some(LogRecord::new(payload, offset)));
            }
            if !self.advance_segment()? {
                return Ok(None);
            }
        }
    }

    /// Bounded blocking read: polls until a record is available or the
    /// timeout elapses. Never blocks indefinitely.
    ///
    /// # Errors
    /// Same as [`Tailer::read`].
    pub fn read_wait(&mut self, timeout: Duration) -> LogResult<Option<LogRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.read()? {
                return Ok(Some(record));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|r| !r.is_zero()) else {
                return Ok(None);
            };
            std::thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    /// Opens a reader at the cursor offset. Returns false when the
    /// partition has no segments yet.
    fn position_reader(&mut self) -> LogResult<bool> {
        let segments = retry_once(|| list_segments(&self.partition_dir))?;
        if segments.is_empty() {
            return Ok(false);
        }
        let target = self.cursor.next_offset;
        // Last segment whose first offset is not past the target; clamps a
        // purged position forward to the oldest retained record.
        let idx = segments
            .iter()
            .rposition(|s| s.first_offset <= target)
            .unwrap_or(0);
        let meta = &segments[idx];
        let mut reader = SegmentReader::open(meta)?;
        let want = target.saturating_sub(meta.first_offset);
        let skipped = reader.skip_frames(want)?;
        self.cursor.next_offset = meta.first_offset + skipped;
        self.cursor.reader = Some(reader);
        Ok(true)
    }

    /// Moves the reader to the next segment once the current one is
    /// drained. Returns false when the cursor already sits on the newest
    /// segment.
    fn advance_segment(&mut self) -> LogResult<bool> {
        let current_cycle = self
            .cursor
            .reader
            .as_ref()
            .map_or(0, SegmentReader::cycle);
        let segments = retry_once(|| list_segments(&self.partition_dir))?;
        let Some(next) = segments.iter().find(|s| s.cycle > current_cycle) else {
            return Ok(false);
        };
        let reader = SegmentReader::open(next)?;
        // Records between segments can only disappear to purging; jump the
        // cursor over the gap.
        if next.first_offset > self.cursor.next_offset {
            self.cursor.next_offset = next.first_offset;
        }
        self.cursor.reader = Some(reader);
        Ok(true)
    }

    /// Persists the cursor for the bound partition.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on commit-log failure.
    pub fn commit(&mut self) -> LogResult<()> {
        self.check_open()?;
        self.tracker.commit(self.cursor.next_offset)
    }

    /// Persists the cursor, verifying the partition is this tailer's own.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a foreign partition.
    pub fn commit_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        self.check_assigned(partition)?;
        self.commit()
    }

    /// Moves the cursor to the oldest retained record.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_start(&mut self) -> LogResult<()> {
        self.check_open()?;
        self.cursor.next_offset = retry_once(|| partition_first(&self.partition_dir))?;
        self.cursor.reader = None;
        Ok(())
    }

    /// Moves the cursor past the last appended record.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_end(&mut self) -> LogResult<()> {
        self.check_open()?;
        self.cursor.next_offset = retry_once(|| partition_end(&self.partition_dir))?;
        self.cursor.reader = None;
        Ok(())
    }

    /// Moves the cursor to the group's last committed position, or to the
    /// start of the partition when no commit exists.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on read failure.
    pub fn to_last_committed(&mut self) -> LogResult<()> {
        self.check_open()?;
        match self.tracker.read_last_committed()? {
            Some(offset) if offset > 0 => {
                self.cursor.next_offset = offset;
                self.cursor.reader = None;
                Ok(())
            }
            _ => self.to_start(),
        }
    }

    /// Jumps the cursor to an offset previously returned by an append.
    ///
    /// Positions outside the retained range are clamped to the nearest
    /// retained record on the next read.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` if the offset belongs to another
    /// partition.
    pub fn seek(&mut self, offset: &LogOffset) -> LogResult<()> {
        self.check_assigned(&offset.partition)?;
        self.cursor.next_offset = offset.offset.get();
        self.cursor.reader = None;
        Ok(())
    }

    /// Moves the cursor to start and immediately commits it.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on failure.
    pub fn reset(&mut self) -> LogResult<()> {
        self.to_start()?;
        self.commit()
    }

    /// [`Tailer::reset`] with a partition check.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a foreign partition.
    pub fn reset_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        self.check_assigned(partition)?;
        self.reset()
    }

    fn check_assigned(&self, partition: &LogPartition) -> LogResult<()> {
        self.check_open()?;
        if *partition != self.partition {
            return Err(LogError::AssignmentMismatch {
                requested: partition.clone(),
            });
        }
        Ok(())
    }

    /// Releases the offset tracker and frees the duplicate-tailer slot.
    /// Idempotent; subsequent reads and commits fail with `Closed`.
    pub fn close(&mut self) {
        self.shared.close();
        self.tracker.close();
        self.cursor.reader = None;
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::SystemClock;
    use crate::segment::SegmentWriter;

    fn setup(partitions: u32) -> (tempfile::TempDir, Arc<TailerGuard>, Arc<dyn Clock>) {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..partitions {
            std::fs::create_dir_all(dir.path().join(partition_dir_name(i))).unwrap();
        }
        (dir, TailerGuard::new(), Arc::new(SystemClock))
    }

    fn write_records(queue_dir: &Path, partition: u32, cycle: u64, first: u64, msgs: &[&str]) {
        let dir = queue_dir.join(partition_dir_name(partition));
        let mut writer = SegmentWriter::create(&dir, cycle, first).unwrap();
        for msg in msgs {
            writer.append_frame(msg.as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_read_in_append_order() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b", "c"]);

        let mut tailer = Tailer::open(
            dir.path(),
            LogPartition::of("q", 0),
            "g1",
            guard,
            clock,
        )
        .unwrap();
        let mut offsets = Vec::new();
        for expected in ["a", "b", "c"] {
            let record = tailer.read().unwrap().unwrap();
            assert_eq!(record.payload.as_ref(), expected.as_bytes());
            offsets.push(record.offset.offset.get());
        }
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(tailer.read().unwrap().is_none());
    }

    #[test]
    fn test_read_crosses_segments() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b"]);
        write_records(dir.path(), 0, 1, 2, &["c"]);

        let mut tailer =
            Tailer::open(dir.path(), LogPartition::of("q", 0), "g1", guard, clock).unwrap();
        let got: Vec<_> = std::iter::from_fn(|| tailer.read().unwrap())
            .map(|r| (r.offset.offset.get(), r.payload))
            .collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].0, 2);
    }

    #[test]
    fn test_duplicate_tailer_rejected_until_close() {
        let (dir, guard, clock) = setup(1);
        let partition = LogPartition::of("q", 0);

        let first = Tailer::open(
            dir.path(),
            partition.clone(),
            "g",
            Arc::clone(&guard),
            Arc::clone(&clock),
        )
        .unwrap();
        let err = Tailer::open(
            dir.path(),
            partition.clone(),
            "g",
            Arc::clone(&guard),
            Arc::clone(&clock),
        )
        .unwrap_err();
        assert!(matches!(err, LogError::DuplicateTailer { .. }));

        // A different group is fine.
        let other = Tailer::open(
            dir.path(),
            partition.clone(),
            "other",
            Arc::clone(&guard),
            Arc::clone(&clock),
        )
        .unwrap();
        drop(other);

        drop(first);
        let again = Tailer::open(dir.path(), partition, "g", guard, clock);
        assert!(again.is_ok());
    }

    #[test]
    fn test_commit_resumes_after_reopen() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b", "c"]);
        let partition = LogPartition::of("q", 0);

        {
            let mut tailer = Tailer::open(
                dir.path(),
                partition.clone(),
                "g",
                Arc::clone(&guard),
                Arc::clone(&clock),
            )
            .unwrap();
            tailer.read().unwrap().unwrap(); // "a"
            tailer.read().unwrap().unwrap(); // "b"
            tailer.commit().unwrap();
        }

        let mut tailer = Tailer::open(dir.path(), partition, "g", guard, clock).unwrap();
        let record = tailer.read().unwrap().unwrap();
        assert_eq!(record.payload.as_ref(), b"c");
        assert_eq!(record.offset.offset.get(), 2);
    }

    #[test]
    fn test_to_last_committed_without_commit_is_start() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b"]);

        let mut tailer =
            Tailer::open(dir.path(), LogPartition::of("q", 0), "g", guard, clock).unwrap();
        tailer.to_end().unwrap();
        assert!(tailer.read().unwrap().is_none());
        tailer.to_last_committed().unwrap();
        assert_eq!(tailer.read().unwrap().unwrap().payload.as_ref(), b"a");
    }

    #[test]
    fn test_seek_and_mismatch() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b", "c"]);
        let partition = LogPartition::of("q", 0);

        let mut tailer =
            Tailer::open(dir.path(), partition.clone(), "g", guard, clock).unwrap();
        tailer
            .seek(&LogOffset::new(partition, Offset::new(1)))
            .unwrap();
        assert_eq!(tailer.read().unwrap().unwrap().payload.as_ref(), b"b");

        let foreign = LogOffset::new(LogPartition::of("q", 9), Offset::new(0));
        assert!(matches!(
            tailer.seek(&foreign),
            Err(LogError::AssignmentMismatch { .. })
        ));
    }

    #[test]
    fn test_reset_commits_start() {
        let (dir, guard, clock) = setup(1);
        write_records(dir.path(), 0, 0, 0, &["a", "b"]);
        let partition = LogPartition::of("q", 0);

        let mut tailer = Tailer::open(
            dir.path(),
            partition.clone(),
            "g",
            Arc::clone(&guard),
            Arc::clone(&clock),
        )
        .unwrap();
        tailer.read().unwrap().unwrap();
        tailer.read().unwrap().unwrap();
        tailer.commit().unwrap();
        tailer.reset().unwrap();
        assert_eq!(tailer.read().unwrap().unwrap().payload.as_ref(), b"a");
        drop(tailer);

        // The reset position was committed.
        let mut reopened = Tailer::open(dir.path(), partition, "g", guard, clock).unwrap();
        assert_eq!(reopened.read().unwrap().unwrap().payload.as_ref(), b"a");
    }

    #[test]
    fn test_closed_tailer_rejects_reads() {
        let (dir, guard, clock) = setup(1);
        let mut tailer =
            Tailer::open(dir.path(), LogPartition::of("q", 0), "g", guard, clock).unwrap();
        assert!(!tailer.closed());
        tailer.close();
        assert!(tailer.closed());
        assert!(matches!(tailer.read(), Err(LogError::Closed)));
        assert!(matches!(tailer.commit(), Err(LogError::Closed)));
        tailer.close(); // idempotent
    }

    #[test]
    fn test_transient_io_failure_is_retried_once() {
        let mut calls = 0;
        let result = retry_once(|| {
            calls += 1;
            if calls == 1 {
                Err(LogError::io("scan", "transient glitch"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_persistent_io_failure_propagates_after_one_retry() {
        let mut calls = 0;
        let result: LogResult<()> = retry_once(|| {
            calls += 1;
            Err(LogError::io("scan", "disk gone"))
        });
        assert!(matches!(result, Err(LogError::Io { .. })));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_non_io_failure_is_not_retried() {
        let mut calls = 0;
        let result: LogResult<()> = retry_once(|| {
            calls += 1;
            Err(LogError::Closed)
        });
        assert!(matches!(result, Err(LogError::Closed)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_read_wait_times_out() {
        let (dir, guard, clock) = setup(1);
        let mut tailer =
            Tailer::open(dir.path(), LogPartition::of("q", 0), "g", guard, clock).unwrap();
        let start = Instant::now();
        let record = tailer.read_wait(Duration::from_millis(30)).unwrap();
        assert!(record.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_missing_partition_dir_is_not_found() {
        let (dir, guard, clock) = setup(1);
        let err =
            Tailer::open(dir.path(), LogPartition::of("q", 5), "g", guard, clock).unwrap_err();
        assert!(matches!(err, LogError::NotFound { .. }));
    }
}
