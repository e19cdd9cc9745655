//! Rill Tests - Integration tests for the rill partitioned log.
//!
//! This crate holds the multi-component tests: full producer/consumer
//! round trips through a [`Manager`](rill_log::Manager), consumer-group
//! isolation, and clock-driven retention behavior. Unit tests live inline
//! in each crate under `#[cfg(test)]`.
//!
//! ## Test Organization
//!
//! - `log_tests`: queue lifecycle, append/tail round trips, group cursors
//! - `retention_tests`: segment rolling and purging under a manual clock
//! - `support`: shared harness building managers on temp directories
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod support;

#[cfg(test)]
mod retention_tests;
