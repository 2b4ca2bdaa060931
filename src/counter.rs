//! A small exponential-moving-average byte counter used to estimate
//! transfer rates for a peer connection.
//!
//! A plain, allocation-free struct updated on every read/write and sampled
//! by callers such as the request-cap formula in the peer protocol engine
//! and the choking algorithm's rate comparisons.

use std::time::{Duration, Instant};

/// Smoothing factor for the EMA: larger values make the average track
/// recent activity more closely. 0.2 is a common choice for 1-second-ish
/// sampling windows and matches what `rate_to_peer`/`rate_to_client` need:
/// responsive enough to feed the request-cap formula within a few pulses.
const SMOOTHING: f64 = 0.2;

/// Tracks a byte rate as an exponential moving average, updated every time
/// bytes are transferred and decayed based on wall-clock time between
/// updates.
#[derive(Debug, Clone)]
pub(crate) struct RateCounter {
    /// Current estimated rate, in bytes per second.
    rate: f64,
    /// Total bytes counted since creation (not decayed).
    total: u64,
    last_update: Instant,
}

impl RateCounter {
    pub(crate) fn new() -> Self {
        Self {
            rate: 0.0,
            total: 0,
            last_update: Instant::now(),
        }
    }

    /// Records `n` additional bytes transferred just now and updates the
    /// moving average accordingly.
    pub(crate) fn update(&mut self, n: u32) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.last_update = now;
        self.total += n as u64;

        let instant_rate = if elapsed > Duration::from_millis(1) {
            n as f64 / elapsed.as_secs_f64()
        } else {
            // Avoid dividing by a near-zero duration when many small
            // updates land back to back within the same tick.
            n as f64
        };

        self.rate = SMOOTHING * instant_rate + (1.0 - SMOOTHING) * self.rate;
    }

    /// Decays the rate towards zero without any new bytes, used when a
    /// pulse fires but no bytes moved in this direction, so idle
    /// connections don't keep reporting a stale rate forever.
    pub(crate) fn tick_idle(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        if elapsed <= 0.0 {
            return;
        }
        // Decay proportionally to elapsed time so a long idle gap drives
        // the rate to (near) zero rather than leaving it pinned.
        let decay = (-elapsed).exp();
        self.rate *= decay;
    }

    /// Current estimated rate in bytes per second.
    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    /// Total bytes ever recorded.
    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_total_bytes() {
        let mut c = RateCounter::new();
        c.update(100);
        c.update(200);
        assert_eq!(c.total(), 300);
    }

    #[test]
    fn rate_is_nonzero_after_update() {
        let mut c = RateCounter::new();
        c.update(16 * 1024);
        assert!(c.rate() > 0.0);
    }

    #[test]
    fn idle_tick_does_not_panic_or_grow_rate() {
        let mut c = RateCounter::new();
        c.update(1000);
        let before = c.rate();
        std::thread::sleep(Duration::from_millis(5));
        c.tick_idle();
        assert!(c.rate() <= before);
    }
}
