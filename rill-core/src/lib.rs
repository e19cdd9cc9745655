//! Rill Core - Shared value types for the rill partitioned log.
//!
//! This crate holds the strongly-typed values exchanged across the rill
//! stack: offsets, partition coordinates, records and lag reports. It has
//! no I/O and no engine logic.
//!
//! # Design Principles
//!
//! - **Strongly-typed values**: an `Offset` is not a bare u64
//! - **Opaque payloads**: a record's payload is a `Bytes` blob; message
//!   serialization is the caller's contract
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod types;

pub use types::{LogLag, LogOffset, LogPartition, LogRecord, Offset};
