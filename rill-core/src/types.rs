//! Value types shared across the rill stack.
//!
//! An offset is meaningful only within one partition of one queue, so the
//! types here keep the coordinate system explicit: `Offset` is the bare
//! position, `LogPartition` names a (queue, partition) pair, and
//! `LogOffset` binds the two together. `append` returns a `LogOffset` and
//! `seek` consumes one, which is what lets a tailer reject positions that
//! belong to a partition it does not own.

use std::fmt;

use bytes::Bytes;

/// Position of a record within one partition.
///
/// Offsets are opaque, strictly increasing within a partition, and not
/// comparable across partitions or queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// Creates an offset from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// A partition coordinate: one independently ordered stream of a queue.
///
/// The partition count of a queue is fixed at creation; indexes run from 0
/// to `count - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogPartition {
    /// Queue name.
    pub name: String,
    /// Partition index within the queue.
    pub partition: u32,
}

impl LogPartition {
    /// Creates a partition coordinate.
    #[must_use]
    pub fn of(name: impl Into<String>, partition: u32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }
}

impl fmt::Display for LogPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.name, self.partition)
    }
}

/// An offset bound to the partition it belongs to.
///
/// This is the value returned by an append and accepted by `seek` and
/// `wait_for`; carrying the partition lets consumers fail fast when handed
/// a position from a stream they do not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOffset {
    /// The partition this offset is scoped to.
    pub partition: LogPartition,
    /// The position within that partition.
    pub offset: Offset,
}

impl LogOffset {
    /// Creates a bound offset.
    #[must_use]
    pub const fn new(partition: LogPartition, offset: Offset) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:+{}", self.partition, self.offset)
    }
}

/// A record read from a partition: the opaque payload plus the offset it
/// was assigned on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Caller-supplied payload blob. The engine never inspects it.
    pub payload: Bytes,
    /// Position the record was assigned on append.
    pub offset: LogOffset,
}

impl LogRecord {
    /// Creates a record.
    #[must_use]
    pub const fn new(payload: Bytes, offset: LogOffset) -> Self {
        Self { payload, offset }
    }
}

/// Consumption lag of one group over one partition.
///
/// `lower` is the group's committed position (the next unread offset),
/// `upper` the end of the partition, and `first` the oldest retained
/// offset. With no commit, `lower == first` and the lag equals the total
/// record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogLag {
    /// Committed position (next unread offset) of the group.
    pub lower: u64,
    /// End-of-partition position.
    pub upper: u64,
    /// Oldest retained offset of the partition.
    pub first: u64,
}

impl LogLag {
    /// Creates a lag report.
    #[must_use]
    pub const fn new(lower: u64, upper: u64, first: u64) -> Self {
        Self {
            lower,
            upper,
            first,
        }
    }

    /// Number of records the group has not yet committed.
    #[must_use]
    pub const fn lag(&self) -> u64 {
        self.upper.saturating_sub(self.lower)
    }

    /// Total number of retained records in the partition.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.upper.saturating_sub(self.first)
    }

    /// Folds another partition's lag into this one.
    ///
    /// Summed lags lose the per-partition offsets; only `lag()` and
    /// `total()` are meaningful on the result.
    #[must_use]
    pub const fn combined(self, other: Self) -> Self {
        Self {
            lower: self.lower + other.lower,
            upper: self.upper + other.upper,
            first: self.first + other.first,
        }
    }
}

impl fmt::Display for LogLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lag: {}, pos: {}, end: {}, total: {}",
            self.lag(),
            self.lower,
            self.upper,
            self.total()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ordering() {
        let a = Offset::new(1);
        let b = Offset::new(2);
        assert!(a < b);
        assert_eq!(a.next(), b);
    }

    #[test]
    fn test_partition_display() {
        let p = LogPartition::of("events", 3);
        assert_eq!(format!("{p}"), "events-03");
    }

    #[test]
    fn test_log_offset_carries_partition() {
        let o = LogOffset::new(LogPartition::of("events", 0), Offset::new(7));
        assert_eq!(o.partition.partition, 0);
        assert_eq!(o.offset.get(), 7);
    }

    #[test]
    fn test_lag_math() {
        let lag = LogLag::new(3, 10, 0);
        assert_eq!(lag.lag(), 7);
        assert_eq!(lag.total(), 10);

        // No commit: lower sits at first.
        let fresh = LogLag::new(2, 10, 2);
        assert_eq!(fresh.lag(), 8);
        assert_eq!(fresh.total(), 8);
    }

    #[test]
    fn test_lag_combined() {
        let a = LogLag::new(1, 4, 0);
        let b = LogLag::new(0, 2, 0);
        let sum = a.combined(b);
        assert_eq!(sum.lag(), 5);
        assert_eq!(sum.total(), 6);
    }
}
