//! Queue appender: producer side of one queue.
//!
//! An [`Appender`] owns every partition of one on-disk queue. Each
//! partition serializes its own writes behind a mutex, so appends are safe
//! under concurrent callers both across and within partitions; ordering
//! within a partition is the order the partition's writer accepts calls.
//!
//! Segment rolling is driven by wall-clock cycles. When an append lands in
//! a newer cycle than the open segment, the partition rolls: a new segment
//! file is created and retention purging runs synchronously before the
//! record is written, so the purge happens-before the first append into the
//! new segment. Purging keeps at least the newest `retention.cycles`
//! segments regardless of age and never touches the open segment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rill_core::{LogOffset, LogPartition, Offset};
use tracing::{info, warn};

use crate::cycle::{Clock, RetentionPolicy};
use crate::error::{LogError, LogResult};
use crate::segment::{
    list_segments, parse_partition_dir_name, partition_dir_name, partition_first,
    scan_record_count, SegmentMeta, SegmentWriter,
};
use crate::tailer::{Tailer, TailerGuard, TailerShared, POLL_INTERVAL};
use crate::tracker;

/// Write state of one partition.
#[derive(Debug)]
struct PartitionWriter {
    dir: PathBuf,
    /// Open segment; `None` until the first append after open/create.
    segment: Option<SegmentWriter>,
    /// Offset the next append will be assigned.
    next_offset: u64,
}

impl PartitionWriter {
    /// Recovers the write position from the partition directory.
    fn recover(dir: PathBuf) -> LogResult<Self> {
        let segments = list_segments(&dir)?;
        let next_offset = match segments.last() {
            None => 0,
            Some(last) => last.first_offset + scan_record_count(&last.path)?,
        };
        Ok(Self {
            dir,
            segment: None,
            next_offset,
        })
    }
}

/// Producer handle owning all partitions of one queue.
pub struct Appender {
    name: String,
    dir: PathBuf,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    writers: Vec<Mutex<PartitionWriter>>,
    /// Non-owning back-references for bulk close only; tailers are owned
    /// by the consumers that created them.
    tailers: Mutex<Vec<Weak<TailerShared>>>,
    guard: Arc<TailerGuard>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("partitions", &self.writers.len())
            .field("retention", &self.retention)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn queue_name(dir: &Path) -> String {
    dir.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

impl Appender {
    /// Creates a new queue with a fixed partition count.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if `dir` already holds a queue,
    /// `Configuration` if `partitions` is zero.
    pub fn create(
        dir: &Path,
        partitions: u32,
        retention: RetentionPolicy,
        clock: Arc<dyn Clock>,
        guard: Arc<TailerGuard>,
    ) -> LogResult<Arc<Self>> {
        if partitions == 0 {
            return Err(LogError::Configuration {
                reason: "partition count must be positive".to_string(),
            });
        }
        if dir.is_dir() && count_partition_dirs(dir)? > 0 {
            return Err(LogError::AlreadyExists {
                path: dir.to_path_buf(),
            });
        }
        std::fs::create_dir_all(dir).map_err(|e| LogError::io("create_queue_dir", e))?;
        let mut writers = Vec::with_capacity(partitions as usize);
        for i in 0..partitions {
            let partition_dir = dir.join(partition_dir_name(i));
            std::fs::create_dir_all(&partition_dir)
                .map_err(|e| LogError::io("create_partition_dir", e))?;
            writers.push(Mutex::new(PartitionWriter {
                dir: partition_dir,
                segment: None,
                next_offset: 0,
            }));
        }
        info!(name = %queue_name(dir), partitions, retention = %retention, "Created queue");
        Ok(Arc::new(Self {
            name: queue_name(dir),
            dir: dir.to_path_buf(),
            retention,
            clock,
            writers,
            tailers: Mutex::new(Vec::new()),
            guard,
            closed: AtomicBool::new(false),
        }))
    }

    /// Opens an existing queue, inferring the partition count from the
    /// partition subdirectories and recovering each write position.
    ///
    /// # Errors
    /// Returns `NotFound` if `dir` does not hold a queue.
    pub fn open(
        dir: &Path,
        retention: RetentionPolicy,
        clock: Arc<dyn Clock>,
        guard: Arc<TailerGuard>,
    ) -> LogResult<Arc<Self>> {
        if !dir.is_dir() {
            return Err(LogError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        let partitions = count_partition_dirs(dir)?;
        if partitions == 0 {
            return Err(LogError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        let mut writers = Vec::with_capacity(partitions as usize);
        for i in 0..partitions {
            let partition_dir = dir.join(partition_dir_name(i));
            if !partition_dir.is_dir() {
                return Err(LogError::NotFound {
                    path: partition_dir,
                });
            }
            writers.push(Mutex::new(PartitionWriter::recover(partition_dir)?));
        }
        info!(name = %queue_name(dir), partitions, "Opened queue");
        Ok(Arc::new(Self {
            name: queue_name(dir),
            dir: dir.to_path_buf(),
            retention,
            clock,
            writers,
            tailers: Mutex::new(Vec::new()),
            guard,
            closed: AtomicBool::new(false),
        }))
    }

    /// Queue name (the directory name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of partitions, fixed at creation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Bounded at creation.
    pub fn partitions(&self) -> u32 {
        self.writers.len() as u32
    }

    /// Retention policy in force for this queue.
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Returns true once the appender is closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn writer(&self, partition: u32) -> LogResult<&Mutex<PartitionWriter>> {
        self.writers
            .get(partition as usize)
            .ok_or_else(|| LogError::NotFound {
                path: self.dir.join(partition_dir_name(partition)),
            })
    }

    /// Appends an opaque payload to a partition, returning the assigned
    /// offset. Safe under concurrent calls; each partition serializes its
    /// own writes.
    ///
    /// # Errors
    /// Returns `Closed` after close, `NotFound` for an out-of-range
    /// partition, `Io` on write failure.
    pub fn append(&self, partition: u32, payload: &[u8]) -> LogResult<LogOffset> {
        if self.closed() {
            return Err(LogError::Closed);
        }
        let mut writer = self.writer(partition)?.lock().map_err(|_| LogError::Closed)?;
        let cycle = self.retention.cycle_of(self.clock.now_ms());
        let needs_roll = match writer.segment.as_ref() {
            Some(segment) => cycle > segment.cycle(),
            None => true,
        };
        if needs_roll {
            self.roll_partition(&mut writer, partition, cycle)?;
        }
        let segment = writer.segment.as_mut().ok_or(LogError::Closed)?;
        segment.append_frame(payload)?;
        let offset = writer.next_offset;
        writer.next_offset += 1;
        Ok(LogOffset::new(
            LogPartition::of(self.name.clone(), partition),
            Offset::new(offset),
        ))
    }

    /// Opens (or creates) the segment for `cycle` and purges expired
    /// segments. The purge completes before the first append lands in the
    /// new segment.
    fn roll_partition(
        &self,
        writer: &mut PartitionWriter,
        partition: u32,
        cycle: u64,
    ) -> LogResult<()> {
        let path = writer.dir.join(crate::segment::segment_file_name(cycle));
        let segment = if path.is_file() {
            // Reopened within the same cycle (process restart).
            SegmentWriter::reopen(&SegmentMeta {
                cycle,
                first_offset: writer.next_offset,
                path,
            })?
        } else {
            let rolled = writer.segment.is_some();
            let segment = SegmentWriter::create(&writer.dir, cycle, writer.next_offset)?;
            if rolled {
                info!(
                    name = %self.name,
                    partition,
                    cycle,
                    first_offset = writer.next_offset,
                    "Rolled to new segment"
                );
            }
            self.purge_partition(&writer.dir, partition);
            segment
        };
        writer.segment = Some(segment);
        Ok(())
    }

    /// Deletes segments beyond the retention floor. The newest
    /// `retention.cycles` segments always survive; an individual delete
    /// failure is logged and skipped rather than aborting the roll.
    fn purge_partition(&self, dir: &Path, partition: u32) {
        let segments = match list_segments(dir) {
            Ok(segments) => segments,
            Err(e) => {
                warn!(name = %self.name, partition, error = %e, "Purge scan failed, skipping");
                return;
            }
        };
        let keep = self.retention.cycles as usize;
        if segments.len() <= keep {
            return;
        }
        let mut purged = 0usize;
        for meta in &segments[..segments.len() - keep] {
            match std::fs::remove_file(&meta.path) {
                Ok(()) => purged += 1,
                Err(e) => {
                    warn!(path = ?meta.path, error = %e, "Failed to purge segment, skipping");
                }
            }
        }
        if purged > 0 {
            info!(name = %self.name, partition, purged, "Purged expired segments");
        }
    }

    /// Oldest retained offset of a partition.
    ///
    /// # Errors
    /// Returns `NotFound` for an out-of-range partition, `Io` on scan
    /// failure.
    pub fn first_offset(&self, partition: u32) -> LogResult<u64> {
        let writer = self.writer(partition)?.lock().map_err(|_| LogError::Closed)?;
        partition_first(&writer.dir)
    }

    /// End-of-partition position: the offset the next append will be
    /// assigned.
    ///
    /// # Errors
    /// Returns `NotFound` for an out-of-range partition.
    pub fn end_offset(&self, partition: u32) -> LogResult<u64> {
        let writer = self.writer(partition)?.lock().map_err(|_| LogError::Closed)?;
        Ok(writer.next_offset)
    }

    /// Approximate count of records in `[lower, upper)` still retained.
    /// Returns 0 when the range precedes the oldest retained offset
    /// (already purged); that is not an error.
    ///
    /// # Errors
    /// Returns `NotFound` for an out-of-range partition, `Io` on scan
    /// failure.
    pub fn count_messages(&self, partition: u32, lower: u64, upper: u64) -> LogResult<u64> {
        let writer = self.writer(partition)?.lock().map_err(|_| LogError::Closed)?;
        let first = partition_first(&writer.dir)?;
        if lower < first {
            return Ok(0);
        }
        Ok(upper.min(writer.next_offset).saturating_sub(lower))
    }

    /// Polls a group's committed position until it covers `offset` or the
    /// timeout elapses. Returns true once the record at `offset` has been
    /// committed by the group.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` when the offset belongs to another
    /// queue, `Io` on commit-log read failure.
    pub fn wait_for(&self, offset: &LogOffset, group: &str, timeout: Duration) -> LogResult<bool> {
        if offset.partition.name != self.name {
            return Err(LogError::AssignmentMismatch {
                requested: offset.partition.clone(),
            });
        }
        let partition = offset.partition.partition;
        let deadline = Instant::now() + timeout;
        loop {
            let committed =
                tracker::read_last_committed(&self.dir, group, partition)?.unwrap_or(0);
            // Committed values are next-unread positions: the record at
            // `offset` is covered once the cursor moved past it.
            if committed > offset.offset.get() {
                return Ok(true);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|r| !r.is_zero())
            else {
                return Ok(false);
            };
            std::thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    /// Creates a tailer on one partition of this queue.
    ///
    /// The appender keeps a non-owning reference for bulk close; the
    /// returned tailer is owned by the caller.
    ///
    /// # Errors
    /// Returns `DuplicateTailer` when a live tailer for the same
    /// (partition, group) exists in this process, `Closed` after close.
    pub fn create_tailer(&self, partition: u32, group: &str) -> LogResult<Tailer> {
        if self.closed() {
            return Err(LogError::Closed);
        }
        self.writer(partition)?; // bounds check
        let tailer = Tailer::open(
            &self.dir,
            LogPartition::of(self.name.clone(), partition),
            group,
            Arc::clone(&self.guard),
            Arc::clone(&self.clock),
        )?;
        if let Ok(mut tailers) = self.tailers.lock() {
            tailers.retain(|weak| weak.strong_count() > 0);
            tailers.push(Arc::downgrade(tailer.shared()));
        }
        Ok(tailer)
    }

    /// Closes the appender: all tracked tailers first, then every
    /// partition's open segment. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(tailers) = self.tailers.lock() {
            for weak in tailers.iter() {
                if let Some(shared) = weak.upgrade() {
                    shared.close();
                }
            }
        }
        for writer in &self.writers {
            if let Ok(mut writer) = writer.lock() {
                writer.segment = None;
            }
        }
        info!(name = %self.name, "Closed queue appender");
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Counts `partition-NN` subdirectories of a queue directory.
fn count_partition_dirs(dir: &Path) -> LogResult<u32> {
    let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read_dir", e))?;
    let mut count = 0u32;
    for entry in entries {
        let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if parse_partition_dir_name(name).is_some() && entry.path().is_dir() {
                count += 1;
            }
        }
    }
    Ok(count)
}
