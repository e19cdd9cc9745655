//! Rill Log - Partitioned, persistent, append-only queue engine.
//!
//! A queue is a fixed set of partitions, each an independently ordered
//! stream of opaque records stored in cycle-rolled segment files. Producers
//! append through an [`Appender`] and get back a [`LogOffset`]; consumer
//! groups read through a [`Tailer`] (one partition) or a
//! [`CompoundTailer`] (round-robin over several) and make progress durable
//! by committing their cursor. The [`Manager`] owns the root directory:
//! queue lifecycle, lag reporting and tailer acquisition.
//!
//! # Design Principles
//!
//! - **Synchronous and blocking**: no async runtime; blocking reads take an
//!   explicit timeout and never block indefinitely
//! - **Commits are facts**: cursor state is an append-only commit log,
//!   most recent row wins, never rewritten in place
//! - **Retention by whole segments**: purging deletes entire cycle files
//!   and always keeps the newest `cycles` of them
//! - **Checksummed frames**: every record and commit row carries a CRC32;
//!   torn tails read as absence, bad checksums as [`LogError::Corruption`]
//!
//! # Example
//!
//! ```no_run
//! use rill_log::{LogResult, Manager};
//! use std::time::Duration;
//!
//! fn main() -> LogResult<()> {
//!     let manager = Manager::open("/var/lib/rill".as_ref())?;
//!     manager.create_if_not_exists("events", 4)?;
//!
//!     let appender = manager.appender("events")?;
//!     let offset = appender.append(0, b"hello")?;
//!
//!     let mut tailer = manager.acquire_tailer_all("indexer", "events")?;
//!     if let Some(record) = tailer.read_wait(Duration::from_secs(1))? {
//!         tailer.commit()?;
//!     }
//!     appender.wait_for(&offset, "indexer", Duration::from_secs(1))?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod appender;
mod compound;
mod cycle;
mod error;
mod manager;
mod segment;
mod tailer;
mod tracker;

pub use appender::Appender;
pub use compound::CompoundTailer;
pub use cycle::{Clock, ManualClock, RetentionPolicy, RollUnit, SystemClock, DEFAULT_RETENTION};
pub use error::{LogError, LogResult};
pub use manager::{LogTailer, Manager, RebalanceListener};
pub use tailer::{Tailer, TailerGuard};
pub use tracker::OffsetTracker;

pub use rill_core::{LogLag, LogOffset, LogPartition, LogRecord, Offset};
