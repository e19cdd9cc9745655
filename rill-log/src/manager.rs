//! Queue lifecycle and tailer acquisition.
//!
//! A [`Manager`] owns one root directory and every queue beneath it:
//! creation, deletion, listing, lag reporting, and handing out appenders
//! and tailers. Appenders are cached per queue so concurrent producers
//! share one set of partition writers; the duplicate-tailer guard is
//! likewise manager-wide, so two components of the same process cannot
//! accidentally tail the same (queue, partition, group) pair.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_core::{LogLag, LogOffset, LogPartition, LogRecord};
use tracing::info;

use crate::appender::Appender;
use crate::compound::CompoundTailer;
use crate::cycle::{Clock, RetentionPolicy, SystemClock};
use crate::error::{LogError, LogResult};
use crate::segment::{parse_partition_dir_name, parse_segment_file_name};
use crate::tailer::{Tailer, TailerGuard};
use crate::tracker::{self, parse_group_dir_name, COMMIT_FILE};

/// Callback interface reserved for partition rebalancing.
///
/// Assignments are static in this engine; the trait exists so consumer
/// code can be written against the final shape and swap in a dynamic
/// implementation later.
pub trait RebalanceListener: Send {
    /// Called before partitions are taken away from the consumer.
    fn on_partitions_revoked(&mut self, partitions: &[LogPartition]);
    /// Called after partitions are handed to the consumer.
    fn on_partitions_assigned(&mut self, partitions: &[LogPartition]);
}

/// A read cursor acquired from a [`Manager`]: single-partition or
/// round-robin compound, decided by the assignment size at acquisition.
#[derive(Debug)]
pub enum LogTailer {
    /// Cursor over exactly one partition.
    Single(Tailer),
    /// Round-robin cursor over several partitions.
    Compound(CompoundTailer),
}

impl LogTailer {
    /// The consumer group this cursor commits under.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::Single(t) => t.group(),
            Self::Compound(t) => t.group(),
        }
    }

    /// The partitions assigned to this cursor.
    #[must_use]
    pub fn assignments(&self) -> Vec<LogPartition> {
        match self {
            Self::Single(t) => t.assignments(),
            Self::Compound(t) => t.assignments(),
        }
    }

    /// Returns true once the cursor is closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        match self {
            Self::Single(t) => t.closed(),
            Self::Compound(t) => t.closed(),
        }
    }

    /// Single non-blocking read attempt across the assignment.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Corruption`/`Io` from the failing
    /// partition.
    pub fn read(&mut self) -> LogResult<Option<LogRecord>> {
        match self {
            Self::Single(t) => t.read(),
            Self::Compound(t) => t.read(),
        }
    }

    /// Bounded blocking read across the assignment.
    ///
    /// # Errors
    /// Same as [`LogTailer::read`].
    pub fn read_wait(&mut self, timeout: Duration) -> LogResult<Option<LogRecord>> {
        match self {
            Self::Single(t) => t.read_wait(timeout),
            Self::Compound(t) => t.read_wait(timeout),
        }
    }

    /// Persists the cursor of every assigned partition.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on commit failure.
    pub fn commit(&mut self) -> LogResult<()> {
        match self {
            Self::Single(t) => t.commit(),
            Self::Compound(t) => t.commit(),
        }
    }

    /// Persists the cursor of one assigned partition.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a foreign partition.
    pub fn commit_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        match self {
            Self::Single(t) => t.commit_partition(partition),
            Self::Compound(t) => t.commit_partition(partition),
        }
    }

    /// Moves the cursor to the oldest retained records.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_start(&mut self) -> LogResult<()> {
        match self {
            Self::Single(t) => t.to_start(),
            Self::Compound(t) => t.to_start(),
        }
    }

    /// Moves the cursor past the last appended records.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on scan failure.
    pub fn to_end(&mut self) -> LogResult<()> {
        match self {
            Self::Single(t) => t.to_end(),
            Self::Compound(t) => t.to_end(),
        }
    }

    /// Moves the cursor to the group's last committed positions.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on read failure.
    pub fn to_last_committed(&mut self) -> LogResult<()> {
        match self {
            Self::Single(t) => t.to_last_committed(),
            Self::Compound(t) => t.to_last_committed(),
        }
    }

    /// Jumps one assigned partition's cursor to a previously returned
    /// offset.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a foreign partition.
    pub fn seek(&mut self, offset: &LogOffset) -> LogResult<()> {
        match self {
            Self::Single(t) => t.seek(offset),
            Self::Compound(t) => t.seek(offset),
        }
    }

    /// Rewinds every assigned partition to start and commits immediately.
    ///
    /// # Errors
    /// Returns `Closed` after close, `Io` on the first failing partition.
    pub fn reset(&mut self) -> LogResult<()> {
        match self {
            Self::Single(t) => t.reset(),
            Self::Compound(t) => t.reset(),
        }
    }

    /// [`LogTailer::reset`] for one assigned partition.
    ///
    /// # Errors
    /// Returns `AssignmentMismatch` for a foreign partition.
    pub fn reset_partition(&mut self, partition: &LogPartition) -> LogResult<()> {
        match self {
            Self::Single(t) => t.reset_partition(partition),
            Self::Compound(t) => t.reset_partition(partition),
        }
    }

    /// Closes the cursor and frees its guard slots. Idempotent.
    pub fn close(&mut self) {
        match self {
            Self::Single(t) => t.close(),
            Self::Compound(t) => t.close(),
        }
    }
}

/// Entry point owning every queue under one root directory.
pub struct Manager {
    root: PathBuf,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    guard: Arc<TailerGuard>,
    appenders: Mutex<HashMap<String, Arc<Appender>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("root", &self.root)
            .field("retention", &self.retention)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Opens a manager on a root directory with the default retention
    /// policy, creating the root if needed.
    ///
    /// # Errors
    /// Returns `Io` if the root cannot be created.
    pub fn open(root: &Path) -> LogResult<Self> {
        Self::with_options(root, RetentionPolicy::default(), Arc::new(SystemClock))
    }

    /// Opens a manager with an explicit retention policy and clock.
    ///
    /// # Errors
    /// Returns `Io` if the root cannot be created.
    pub fn with_options(
        root: &Path,
        retention: RetentionPolicy,
        clock: Arc<dyn Clock>,
    ) -> LogResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| LogError::io("create_root", e))?;
        info!(root = ?root, retention = %retention, "Opened queue manager");
        Ok(Self {
            root: root.to_path_buf(),
            retention,
            clock,
            guard: TailerGuard::new(),
            appenders: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Root directory this manager owns.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Retention policy applied to queues this manager creates or opens.
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Returns true once the manager is closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> LogResult<()> {
        if self.closed() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    fn queue_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Returns true when a queue with this name exists on disk.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        let dir = self.queue_dir(name);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(parse_partition_dir_name)
                .is_some()
        })
    }

    /// Creates a queue with a fixed partition count.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the queue exists, `Configuration` for a
    /// zero partition count.
    pub fn create(&self, name: &str, partitions: u32) -> LogResult<()> {
        self.check_open()?;
        let appender = Appender::create(
            &self.queue_dir(name),
            partitions,
            self.retention,
            Arc::clone(&self.clock),
            Arc::clone(&self.guard),
        )?;
        if let Ok(mut appenders) = self.appenders.lock() {
            appenders.insert(name.to_string(), appender);
        }
        Ok(())
    }

    /// Creates a queue unless it already exists. Returns true when this
    /// call created it.
    ///
    /// # Errors
    /// Returns `Configuration` for a zero partition count, `Io` on
    /// filesystem failure.
    pub fn create_if_not_exists(&self, name: &str, partitions: u32) -> LogResult<bool> {
        self.check_open()?;
        if self.exists(name) {
            return Ok(false);
        }
        self.create(name, partitions)?;
        Ok(true)
    }

    /// Deletes a queue: every partition, segment, and consumer-group
    /// cursor. Returns false when the queue does not exist.
    ///
    /// The queue directory is removed only when it holds nothing but
    /// engine-owned entries; a foreign file aborts the deletion with the
    /// queue intact.
    ///
    /// # Errors
    /// Returns `Configuration` when a foreign file is present, `Io` on
    /// filesystem failure.
    pub fn delete(&self, name: &str) -> LogResult<bool> {
        self.check_open()?;
        if !self.exists(name) {
            return Ok(false);
        }
        if let Ok(mut appenders) = self.appenders.lock() {
            if let Some(appender) = appenders.remove(name) {
                appender.close();
            }
        }
        let dir = self.queue_dir(name);
        self.check_engine_owned(&dir)?;
        std::fs::remove_dir_all(&dir).map_err(|e| LogError::io("delete_queue", e))?;
        info!(name, "Deleted queue");
        Ok(true)
    }

    /// Verifies a queue directory holds only engine-owned entries:
    /// `partition-NN` directories of segment files and `offset-<group>`
    /// directories of commit logs.
    fn check_engine_owned(&self, dir: &Path) -> LogResult<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read_dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
            let file_name = entry.file_name();
            let Some(entry_name) = file_name.to_str() else {
                return Err(foreign_entry(&entry.path()));
            };
            if parse_partition_dir_name(entry_name).is_some() {
                self.check_only_segments(&entry.path())?;
            } else if parse_group_dir_name(entry_name).is_some() {
                self.check_only_commit_log(&entry.path())?;
            } else {
                return Err(foreign_entry(&entry.path()));
            }
        }
        Ok(())
    }

    fn check_only_segments(&self, dir: &Path) -> LogResult<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read_dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
            let owned = entry
                .file_name()
                .to_str()
                .and_then(parse_segment_file_name)
                .is_some();
            if !owned {
                return Err(foreign_entry(&entry.path()));
            }
        }
        Ok(())
    }

    fn check_only_commit_log(&self, dir: &Path) -> LogResult<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read_dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
            if entry.file_name().to_str() != Some(COMMIT_FILE) {
                return Err(foreign_entry(&entry.path()));
            }
        }
        Ok(())
    }

    /// Lists every queue under the root, sorted by name.
    ///
    /// # Errors
    /// Returns `Io` if the root cannot be read.
    pub fn list_all(&self) -> LogResult<Vec<String>> {
        self.check_open()?;
        let entries = std::fs::read_dir(&self.root).map_err(|e| LogError::io("read_dir", e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Lists the consumer groups that have committed on a queue, sorted by
    /// name.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown queue, `Io` on read failure.
    pub fn list_consumer_groups(&self, name: &str) -> LogResult<Vec<String>> {
        self.check_open()?;
        let dir = self.queue_dir(name);
        if !self.exists(name) {
            return Err(LogError::NotFound { path: dir });
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| LogError::io("read_dir", e))?;
        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read_dir_entry", e))?;
            if let Some(group) = entry
                .file_name()
                .to_str()
                .and_then(parse_group_dir_name)
            {
                groups.push(group.to_string());
            }
        }
        groups.sort();
        Ok(groups)
    }

    /// Returns the shared appender for a queue, opening it on first use.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown queue, `Closed` after close.
    pub fn appender(&self, name: &str) -> LogResult<Arc<Appender>> {
        self.check_open()?;
        let mut appenders = self.appenders.lock().map_err(|_| LogError::Closed)?;
        if let Some(appender) = appenders.get(name) {
            return Ok(Arc::clone(appender));
        }
        let appender = Appender::open(
            &self.queue_dir(name),
            self.retention,
            Arc::clone(&self.clock),
            Arc::clone(&self.guard),
        )?;
        appenders.insert(name.to_string(), Arc::clone(&appender));
        Ok(appender)
    }

    /// Partition count of a queue.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown queue.
    pub fn partitions(&self, name: &str) -> LogResult<u32> {
        Ok(self.appender(name)?.partitions())
    }

    /// Per-partition lag of a group over a queue. A group that has never
    /// committed reads as fully lagging from the oldest retained offset.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown queue, `Io` on read failure.
    pub fn lag_per_partition(&self, name: &str, group: &str) -> LogResult<Vec<LogLag>> {
        self.check_open()?;
        let appender = self.appender(name)?;
        let mut lags = Vec::with_capacity(appender.partitions() as usize);
        for partition in 0..appender.partitions() {
            let first = appender.first_offset(partition)?;
            let upper = appender.end_offset(partition)?;
            let committed = tracker::read_last_committed(&self.queue_dir(name), group, partition)?
                .filter(|&c| c > 0);
            // Clamp into the retained range: a commit older than the oldest
            // retained record cannot be consumed anyway.
            let lower = committed.unwrap_or(first).clamp(first, upper);
            lags.push(LogLag::new(lower, upper, first));
        }
        Ok(lags)
    }

    /// Aggregated lag of a group over all partitions of a queue.
    ///
    /// # Errors
    /// Same as [`Manager::lag_per_partition`].
    pub fn lag(&self, name: &str, group: &str) -> LogResult<LogLag> {
        Ok(self
            .lag_per_partition(name, group)?
            .into_iter()
            .fold(LogLag::default(), LogLag::combined))
    }

    /// Acquires a tailer for a group over an explicit set of partitions,
    /// possibly spanning several queues. A single-partition assignment
    /// yields a plain cursor, anything else a round-robin compound one.
    ///
    /// # Errors
    /// Returns `DuplicateTailer` when any requested pair is already tailed
    /// in this process (no tailer is leaked: the ones already opened are
    /// closed again), `NotFound` for an unknown partition.
    pub fn acquire_tailer(
        &self,
        group: &str,
        partitions: &[LogPartition],
    ) -> LogResult<LogTailer> {
        self.check_open()?;
        let mut tailers = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let appender = self.appender(&partition.name)?;
            // Tailers already opened close on drop if this one fails.
            tailers.push(appender.create_tailer(partition.partition, group)?);
        }
        if tailers.len() == 1 {
            let single = tailers.pop().ok_or(LogError::Closed)?;
            Ok(LogTailer::Single(single))
        } else {
            Ok(LogTailer::Compound(CompoundTailer::new(group, tailers)))
        }
    }

    /// Acquires a tailer for a group over every partition of one queue.
    ///
    /// # Errors
    /// Same as [`Manager::acquire_tailer`].
    pub fn acquire_tailer_all(&self, group: &str, name: &str) -> LogResult<LogTailer> {
        let count = self.partitions(name)?;
        let partitions: Vec<LogPartition> = (0..count)
            .map(|p| LogPartition::of(name, p))
            .collect();
        self.acquire_tailer(group, &partitions)
    }

    /// Dynamic group subscription with rebalancing. Not supported by this
    /// engine; assignments are static via [`Manager::acquire_tailer`].
    ///
    /// # Errors
    /// Always returns `Unsupported`.
    pub fn subscribe(
        &self,
        _group: &str,
        _names: &[String],
        _listener: Option<Box<dyn RebalanceListener>>,
    ) -> LogResult<LogTailer> {
        Err(LogError::Unsupported {
            reason: "dynamic subscription requires an external coordinator",
        })
    }

    /// Closes every cached appender (which closes their tracked tailers).
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut appenders) = self.appenders.lock() {
            for (_, appender) in appenders.drain() {
                appender.close();
            }
        }
        info!(root = ?self.root, "Closed queue manager");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
    }
}

fn foreign_entry(path: &Path) -> LogError {
    LogError::Configuration {
        reason: format!("refusing to delete: foreign entry {}", path.display()),
    }
}
