//! Multi-partition read cursor.
//!
//! A [`CompoundTailer`] wraps one [`Tailer`] per assigned partition and
//! serves reads round-robin: each read starts probing at the partition
//! after the one that produced the previous record, so a busy partition
//! cannot starve the others. Commit state stays per partition, in each
//! wrapped tailer's own group cursor.

use std::time::{Duration, Instant};

use rill_core::{LogOffset, LogPartition, LogRecord};

use crate::error::{LogError, LogResult};
use crate::tailer::{Tailer, POLL_INTERVAL};

/// Round-robin read cursor over a set of partitions for one consumer group.
///
/// All wrapped tailers must share the group; an empty set is valid and
/// behaves as a permanently drained cursor.
#[derive(Debug)]
pub struct CompoundTailer {
    group: String,
    tailers: Vec<Tailer>,
    /// Index of the tailer that produced the last record; the next read
    /// starts probing just past it.
    last: usize,
    closed: bool,
}

impl CompoundTailer {
    /// Wraps a set of single-partition tailers into one cursor.
    pub(crate) fn new(group: &str, tailers: Vec<Tailer>) -> Self {
        // Seed `last` on the final index so the first rotation probes the
        // first assigned partition first.
        let last = tailers.len().saturating_sub(1);
        Self {
            group: group.to_string(),
            tailers,
            last,
            closed: false,
        }
    }

    /// The consumer group this cursor commits under.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The partitions assigned to this cursor.
    #[must_use]
    pub fn assignments(&self) -> Vec<LogPartition> {
        self.tailers.iter().map(|t| t.partition().clone()).collect()
    }

    /// Returns true once the cursor is closed.
    #[must_use]
    pub const fn closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> LogResult<()> {
        if self.closed {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    fn tailer_for(&mut self, partition: &LogPartition) -> LogResult<&mut Tailer> {
        self.tailers
            .iter_mut()
            .find(|t| t.partition() == partition)
            .ok_or_else(|| LogError::AssignmentMismatch {
                requested: partition.clone(),
            })
    }

    /// Single non-blocking read attempt: probes each partition at most
    /// once, starting after the last productive one, and returns the first
    /// available record. `None` when every partition is drained right now.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Corruption`/`Io` from the partition
    /// that failed.
    pub fn read(&mut self) -> LogResult<Option<LogRecord>> {
        self.check_open()?;
        let n = self.tailers.len();
        for probe in 0..n {
            let idx = (self.last + 1 + probe) % n;
            if let Some(record) = self.tailers[idx].read()? {
                self.last = idx;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Bounded blocking read across all assigned partitions.
    ///
    /// # Errors
    /// Same as [`CompoundTailer::read`].
    pub fn read_wait(&mut self, timeout: Duration) -> LogResult<Option<LogRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.read()? {
                return Ok(Some(record));
            }
            if self.tailers.is_empty() {
                return Ok(None);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|r| !r.is_zero())
            else {
                return Ok(None);
            };
            std::thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    /// Persists the cursor of every assigned partition.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on the first partition that fails
    /// to commit.
    pub fn commit(&mut self) -> LogResult<()> {
        self.check_open()?;
        for tailer in &mut self.tailers {
            tailer.commit()?;
        }
        Ok(())
    }

    /// Persists the cursor of one assigned partition.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a partition not in this cursor's
    /// assignments.
    pub fn commit_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        self.check_open()?;
        self.tailer_for(partition)?.commit()
    }

    /// Moves every assigned partition's cursor to its oldest retained
    /// record.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_start(&mut self) -> LogResult<()> {
        self.check_open()?;
        for tailer in &mut self.tailers {
            tailer.to_start()?;
        }
        Ok(())
    }

    /// Moves every assigned partition's cursor past its last record.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_end(&mut self) -> LogResult<()> {
        self.check_open()?;
        for tailer in &mut self.tailers {
            tailer.to_end()?;
        }
        Ok(())
    }

    /// Moves every assigned partition's cursor to the group's last
    /// committed position.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on read failure.
    pub fn to_last_committed(&mut self) -> LogResult<()> {
        self.check_open()?;
        for tailer in &mut self.tailers {
            tailer.to_last_committed()?;
        }
        Ok(())
    }

    /// Jumps one assigned partition's cursor to a previously returned
    /// offset.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a partition not in this cursor's
    /// assignments.
    pub fn seek(&mut self, offset: &LogOffset) -> LogResult<()> {
        self.check_open()?;
        self.tailer_for(&offset.partition)?.seek(offset)
    }

    /// Resets one assigned partition: cursor to start, committed
    /// immediately.
    ///
    /// A failure on any partition is reported to the caller instead of
    /// leaving a silently partial reset.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a partition not in this cursor's
    /// assignments, `Io` on commit failure.
    pub fn reset_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        self.check_open()?;
        self.tailer_for(partition)?.reset()
    }

    /// Resets every assigned partition: cursors to start, committed
    /// immediately. Fails fast on the first partition that cannot commit.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on the first failing partition.
    pub fn reset(&mut self) -> LogResult<()> {
        self.check_open()?;
        for tailer in &mut self.tailers {
            tailer.reset()?;
        }
        Ok(())
    }

    /// Closes every wrapped tailer. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for tailer in &mut self.tailers {
            tailer.close();
        }
    }
}

impl Drop for CompoundTailer {
    fn drop(&mut self) {
        self.close();
    }
}
