//! Shared harness for integration tests.

use std::sync::Arc;

use rill_log::{Clock, LogResult, ManualClock, Manager, RetentionPolicy};
use tempfile::TempDir;

/// A manager on its own temporary root directory.
///
/// The directory lives as long as the env; dropping it deletes everything.
pub struct TestEnv {
    dir: TempDir,
    /// Manager under test.
    pub manager: Manager,
}

impl TestEnv {
    /// Creates an env with default retention and the system clock.
    ///
    /// # Errors
    /// Propagates manager open failures.
    pub fn new() -> LogResult<Self> {
        let dir = TempDir::new().map_err(|e| rill_log::LogError::io("tempdir", e))?;
        let manager = Manager::open(dir.path())?;
        Ok(Self { dir, manager })
    }

    /// Creates an env with an explicit retention code and a manual clock,
    /// for tests that drive segment rolling themselves.
    ///
    /// # Errors
    /// Propagates retention parse and manager open failures.
    pub fn with_manual_clock(retention: &str, clock: Arc<ManualClock>) -> LogResult<Self> {
        let dir = TempDir::new().map_err(|e| rill_log::LogError::io("tempdir", e))?;
        let manager = Manager::with_options(
            dir.path(),
            RetentionPolicy::parse(retention)?,
            clock as Arc<dyn Clock>,
        )?;
        Ok(Self { dir, manager })
    }

    /// Reopens the manager on the same root, simulating a process restart.
    ///
    /// # Errors
    /// Propagates manager open failures.
    pub fn reopen(&mut self) -> LogResult<()> {
        self.manager.close();
        self.manager = Manager::open(self.dir.path())?;
        Ok(())
    }
}
