//! # Error-Density Limiter
//!
//! Sliding-window failure counter guarding against crash loops. Each fed
//! error is timestamped; entries older than the observation period are
//! evicted before counting, and once the surviving count exceeds the
//! registration limit the limiter trips. Tripping is a one-way transition:
//! the limiter never resets, and the trip is reported to exactly one
//! caller.
//!
//! Individual failures stay recoverable (the pool respawns workers); the
//! limiter exists to detect that recovery itself has become a loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::LimiterOptions;

/// Result of one `feed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Error recorded; `density` is the in-window count including it.
    Recorded { density: usize },
    /// This feed pushed the density past the limit. Reported once.
    Tripped,
    /// The limiter tripped earlier; the feed was ignored.
    AlreadyTripped,
}

/// Sliding-window error counter with a one-way trip.
///
/// Cheap to share: feeds take a short lock on the timestamp queue, the
/// tripped flag is a lock-free fast path.
#[derive(Debug)]
pub struct ErrorDensityLimiter {
    options: LimiterOptions,
    timestamps: Mutex<VecDeque<Instant>>,
    tripped: AtomicBool,
}

impl ErrorDensityLimiter {
    pub fn new(options: LimiterOptions) -> Self {
        Self {
            options,
            timestamps: Mutex::new(VecDeque::new()),
            tripped: AtomicBool::new(false),
        }
    }

    /// Record one error at the current instant.
    pub fn feed(&self) -> FeedOutcome {
        self.feed_at(Instant::now())
    }

    /// Record one error at an explicit instant. Deterministic variant for
    /// tests and embedders driving their own clock; `now` must not move
    /// backwards between calls.
    pub fn feed_at(&self, now: Instant) -> FeedOutcome {
        if self.tripped.load(Ordering::Acquire) {
            return FeedOutcome::AlreadyTripped;
        }

        let mut timestamps = self.timestamps.lock();
        if self.tripped.load(Ordering::Acquire) {
            return FeedOutcome::AlreadyTripped;
        }

        timestamps.push_back(now);
        Self::evict(&mut timestamps, now, &self.options);
        let density = timestamps.len();

        if density > self.options.registration_limit {
            self.tripped.store(true, Ordering::Release);
            warn!(
                density,
                registration_limit = self.options.registration_limit,
                observation_period_ms = self.options.observation_period_ms,
                "🔴 LIMITER: error density exceeded, tripping"
            );
            FeedOutcome::Tripped
        } else {
            debug!(
                density,
                registration_limit = self.options.registration_limit,
                "LIMITER: error recorded"
            );
            FeedOutcome::Recorded { density }
        }
    }

    /// Whether the limiter has tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// In-window error count as of now.
    pub fn density(&self) -> usize {
        let mut timestamps = self.timestamps.lock();
        Self::evict(&mut timestamps, Instant::now(), &self.options);
        timestamps.len()
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    // Entries exactly on the window boundary still count.
    fn evict(timestamps: &mut VecDeque<Instant>, now: Instant, options: &LimiterOptions) {
        let period = options.observation_period();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) > period {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(observation_period_ms: u64, registration_limit: usize) -> ErrorDensityLimiter {
        ErrorDensityLimiter::new(LimiterOptions {
            observation_period_ms,
            registration_limit,
        })
    }

    #[test]
    fn stays_quiet_below_the_limit() {
        let limiter = limiter(5_000, 3);
        let base = Instant::now();

        for i in 0..3 {
            let outcome = limiter.feed_at(base + Duration::from_millis(i * 10));
            assert_eq!(
                outcome,
                FeedOutcome::Recorded {
                    density: i as usize + 1
                }
            );
        }
        assert!(!limiter.is_tripped());
    }

    #[test]
    fn trips_exactly_once_past_the_limit() {
        let limiter = limiter(5_000, 3);
        let base = Instant::now();

        for i in 0..3 {
            limiter.feed_at(base + Duration::from_millis(i));
        }
        assert_eq!(
            limiter.feed_at(base + Duration::from_millis(4)),
            FeedOutcome::Tripped
        );
        assert_eq!(
            limiter.feed_at(base + Duration::from_millis(5)),
            FeedOutcome::AlreadyTripped
        );
        assert!(limiter.is_tripped());
    }

    #[test]
    fn expired_entries_do_not_count() {
        // Window 5000ms, limit 3: errors at t=0, 100, 200, 6000 never trip,
        // because the fourth arrives after the first three expired.
        let limiter = limiter(5_000, 3);
        let base = Instant::now();

        for offset in [0u64, 100, 200] {
            limiter.feed_at(base + Duration::from_millis(offset));
        }
        assert_eq!(
            limiter.feed_at(base + Duration::from_millis(6_000)),
            FeedOutcome::Recorded { density: 1 }
        );
        assert!(!limiter.is_tripped());
    }

    #[test]
    fn boundary_entries_still_count() {
        let limiter = limiter(1_000, 1);
        let base = Instant::now();

        limiter.feed_at(base);
        // Exactly one window later: the first entry is still in-window, so
        // density reaches 2 and the limiter trips.
        assert_eq!(
            limiter.feed_at(base + Duration::from_millis(1_000)),
            FeedOutcome::Tripped
        );
    }

    #[test]
    fn real_clock_feed_smoke() {
        let limiter = limiter(60_000, 2);
        assert_eq!(limiter.feed(), FeedOutcome::Recorded { density: 1 });
        assert_eq!(limiter.feed(), FeedOutcome::Recorded { density: 2 });
        assert_eq!(limiter.feed(), FeedOutcome::Tripped);
        assert_eq!(limiter.density(), 3);
    }
}
