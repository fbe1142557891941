//! Round-trip latency smoothing.

use std::time::{Duration, Instant};

/// Samples above this are considered pathological and clamped.
const MAX_SANE_LAG: Duration = Duration::from_millis(10_000);

/// Number of initial pongs averaged exactly before switching to decay.
const TRUE_AVERAGE_PONGS: u64 = 4;

/// Fixed mixing coefficient once the estimate has settled.
const DECAY_MIX: f64 = 0.1;

/// Maintains a smoothed average of ping/pong round-trip times.
///
/// The first four samples use a true running average so the estimate
/// converges fast; later samples mix in with a fixed 0.1 coefficient so a
/// transient spike cannot collapse it.
#[derive(Debug)]
pub struct LagTracker {
    average_ms: f64,
    pong_count: u64,
    last_ping_sent: Option<Instant>,
}

impl Default for LagTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LagTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            average_ms: 0.0,
            pong_count: 0,
            last_ping_sent: None,
        }
    }

    /// Record that a ping left the socket at `now`.
    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
    }

    /// Fold the pong received at `now` into the average and return the
    /// updated value. Publishing the new average on the bus is the
    /// caller's job.
    pub fn on_pong(&mut self, now: Instant) -> f64 {
        let elapsed = self
            .last_ping_sent
            .map_or(Duration::ZERO, |sent| now.saturating_duration_since(sent));
        let sample_ms = elapsed.min(MAX_SANE_LAG).as_secs_f64() * 1000.0;

        self.pong_count += 1;
        let mix = if self.pong_count > TRUE_AVERAGE_PONGS {
            DECAY_MIX
        } else {
            1.0 / self.pong_count as f64
        };
        self.average_ms += mix * (sample_ms - self.average_ms);
        self.average_ms
    }

    /// Smoothed average in milliseconds; 0 before the first pong.
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        self.average_ms
    }

    #[must_use]
    pub fn pong_count(&self) -> u64 {
        self.pong_count
    }
}
