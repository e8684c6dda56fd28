//! Clock abstraction for expiration checks.
//!
//! Expiration policies never read the wall clock directly. Every component
//! that needs "now" receives a [`Clock`], so production code runs on the
//! system clock and tests run on a [`ManualClock`] that only moves when told to.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstraction over the current time.
///
/// Implementations must be shareable across request-handling tasks.
pub trait Clock: Debug + Send + Sync {
    /// Get the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Real clock backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // Milliseconds won't overflow u64 for billions of years
    fn now_ms(&self) -> u64 {
        // Only fails if the system time is before 1970; treat that as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis() as u64)
    }
}

/// A manually driven clock for deterministic testing.
///
/// Unlike [`SystemClock`], time only advances when explicitly told to.
/// Backed by an atomic so a single instance can be shared between
/// concurrently running tasks.
///
/// # Example
///
/// ```
/// use tickets::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1000);
/// assert_eq!(clock.now_ms(), 1000);
///
/// clock.advance_ms(100);
/// assert_eq!(clock.now_ms(), 1100);
///
/// clock.set(5000);
/// assert_eq!(clock.now_ms(), 5000);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    /// Current time in milliseconds since Unix epoch.
    current_time_ms: AtomicU64,
}

impl ManualClock {
    /// Create a new manual clock with the given initial time.
    #[must_use]
    pub const fn new(initial_time_ms: u64) -> Self {
        Self {
            current_time_ms: AtomicU64::new(initial_time_ms),
        }
    }

    /// Create a clock starting at `1_700_000_000_000` (approximately November 2023).
    #[must_use]
    pub const fn default_start() -> Self {
        Self::new(1_700_000_000_000)
    }

    /// Advance time by the given number of milliseconds.
    ///
    /// Saturates at `u64::MAX`.
    pub fn advance_ms(&self, ms: u64) {
        let _ = self
            .current_time_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(ms))
            });
    }

    /// Advance time by a [`Duration`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, duration: Duration) {
        self.advance_ms(duration.as_millis() as u64);
    }

    /// Set the current time to a specific value. May move time backwards.
    pub fn set(&self, time_ms: u64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::default_start()
    }
}

/// Convert a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        let t1 = clock.now_ms();
        let t2 = clock.now_ms();

        // Time should be reasonable (after 2020)
        assert!(t1 > 1_577_836_800_000);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1000);

        clock.advance_ms(100);
        assert_eq!(clock.now_ms(), 1100);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now_ms(), 2100);
    }

    #[test]
    fn test_manual_clock_set_backwards() {
        let clock = ManualClock::new(1000);
        clock.set(5000);
        assert_eq!(clock.now_ms(), 5000);

        clock.set(3000);
        assert_eq!(clock.now_ms(), 3000);
    }

    #[test]
    fn test_manual_clock_saturates() {
        let clock = ManualClock::new(u64::MAX - 1);
        clock.advance_ms(10);
        assert_eq!(clock.now_ms(), u64::MAX);
    }

    #[test]
    fn test_manual_clock_default() {
        assert_eq!(ManualClock::default().now_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_duration_to_ms() {
        assert_eq!(duration_to_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_ms(Duration::MAX), u64::MAX);
    }
}
