//! Roll-cycle arithmetic and retention configuration.
//!
//! Segments roll at a fixed wall-clock granularity. The granularity and the
//! number of retained segments are both encoded in a short duration code:
//! digits plus one trailing unit letter, e.g. `"4d"` (four daily segments),
//! `"12h"`, `"30s"`. The digits are the retention cycle count, the unit is
//! the roll granularity.
//!
//! Time is injected through the [`Clock`] trait so that rolling and purging
//! are testable without real time passing.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{LogError, LogResult};

/// Default retention code: four daily segments.
pub const DEFAULT_RETENTION: &str = "4d";

/// Wall-clock granularity at which segments roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollUnit {
    /// One segment per second.
    Seconds,
    /// One segment per minute.
    Minutes,
    /// One segment per hour.
    Hours,
    /// One segment per day.
    Days,
}

impl RollUnit {
    /// Length of one cycle in milliseconds.
    #[must_use]
    pub const fn cycle_len_ms(self) -> i64 {
        match self {
            Self::Seconds => 1_000,
            Self::Minutes => 60 * 1_000,
            Self::Hours => 60 * 60 * 1_000,
            Self::Days => 24 * 60 * 60 * 1_000,
        }
    }

    const fn code(self) -> char {
        match self {
            Self::Seconds => 's',
            Self::Minutes => 'm',
            Self::Hours => 'h',
            Self::Days => 'd',
        }
    }
}

/// Segment retention policy: roll granularity plus the minimum number of
/// segments kept on disk.
///
/// Purging never drops below `cycles` segments even when they are older
/// than the nominal duration, so a consumer outage of several cycles does
/// not lose unread records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of segments always retained.
    pub cycles: u32,
    /// Roll granularity.
    pub unit: RollUnit,
}

impl RetentionPolicy {
    /// Parses a retention code such as `"4d"` or `"12h"`.
    ///
    /// # Errors
    /// Returns `Configuration` if the code is malformed or the cycle count
    /// is zero.
    pub fn parse(code: &str) -> LogResult<Self> {
        let code = code.trim();
        let Some(unit_char) = code.chars().last() else {
            return Err(LogError::Configuration {
                reason: "empty retention code".to_string(),
            });
        };
        let unit = match unit_char {
            's' => RollUnit::Seconds,
            'm' => RollUnit::Minutes,
            'h' => RollUnit::Hours,
            'd' => RollUnit::Days,
            other => {
                return Err(LogError::Configuration {
                    reason: format!("unknown retention unit '{other}' in \"{code}\""),
                })
            }
        };
        let digits = &code[..code.len() - 1];
        let cycles: u32 = digits.parse().map_err(|_| LogError::Configuration {
            reason: format!("invalid retention cycle count in \"{code}\""),
        })?;
        if cycles == 0 {
            return Err(LogError::Configuration {
                reason: format!("retention cycle count must be positive in \"{code}\""),
            });
        }
        Ok(Self { cycles, unit })
    }

    /// Length of one roll cycle in milliseconds.
    #[must_use]
    pub const fn cycle_len_ms(&self) -> i64 {
        self.unit.cycle_len_ms()
    }

    /// Cycle id for a timestamp: the segment a record written at `now_ms`
    /// belongs to.
    #[must_use]
    pub const fn cycle_of(&self, now_ms: i64) -> u64 {
        let cycle = now_ms / self.cycle_len_ms();
        if cycle < 0 {
            0
        } else {
            #[allow(clippy::cast_sign_loss)]
            {
                cycle as u64
            }
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::parse(DEFAULT_RETENTION).expect("default retention code is valid")
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.cycles, self.unit.code())
    }
}

/// Wall-clock source for roll-cycle arithmetic.
///
/// Production uses [`SystemClock`]; tests inject a [`ManualClock`] to drive
/// segment rolling deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // Millis fit i64 for centuries.
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at the given time.
    #[must_use]
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    /// Advances the clock.
    pub fn advance_ms(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_codes() {
        let p = RetentionPolicy::parse("4d").unwrap();
        assert_eq!(p.cycles, 4);
        assert_eq!(p.unit, RollUnit::Days);

        let p = RetentionPolicy::parse("30s").unwrap();
        assert_eq!(p.cycles, 30);
        assert_eq!(p.unit, RollUnit::Seconds);

        let p = RetentionPolicy::parse("12h").unwrap();
        assert_eq!(p.cycles, 12);
        assert_eq!(p.unit, RollUnit::Hours);
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert!(RetentionPolicy::parse("").is_err());
        assert!(RetentionPolicy::parse("d").is_err());
        assert!(RetentionPolicy::parse("4x").is_err());
        assert!(RetentionPolicy::parse("0d").is_err());
        assert!(RetentionPolicy::parse("-1h").is_err());
    }

    #[test]
    fn test_default_policy() {
        let p = RetentionPolicy::default();
        assert_eq!(format!("{p}"), "4d");
    }

    #[test]
    fn test_cycle_of() {
        let p = RetentionPolicy::parse("3s").unwrap();
        assert_eq!(p.cycle_of(0), 0);
        assert_eq!(p.cycle_of(999), 0);
        assert_eq!(p.cycle_of(1_000), 1);
        assert_eq!(p.cycle_of(5_500), 5);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
