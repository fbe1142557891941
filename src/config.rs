use std::time::Duration;

use crate::store::KvStore;

/// Store key for the user's ping-interval override, in milliseconds.
pub const PING_INTERVAL_KEY: &str = "socket.ping.interval";

const DEFAULT_PING_DELAY: Duration = Duration::from_millis(2500);
/// Overrides at or below this floor fall back to the default ping delay.
const PING_DELAY_FLOOR: Duration = Duration::from_millis(400);
const DEFAULT_PING_MAX_LAG: Duration = Duration::from_millis(9000);
const DEFAULT_AUTO_RECONNECT_DELAY: Duration = Duration::from_millis(3500);
const DEFAULT_OFFLINE_RETRY_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_IDLE_RECONNECT_MIN: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_RECONNECT_MAX: Duration = Duration::from_secs(20);
const DEFAULT_IDLE_PING_EXTRA: Duration = Duration::from_millis(1000);
const DEFAULT_IDLE_TEARDOWN_AFTER: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_RESYNC_RELOAD_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_ACK_RESEND_INTERVAL: Duration = Duration::from_millis(1200);
const DEFAULT_ACK_RESEND_CUTOFF: Duration = Duration::from_millis(2500);
const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(30 * 60);

/// Configuration for transport timing behavior.
///
/// Defaults mirror the production values; tests shrink them to keep
/// wall-clock time down.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Time between a pong and the next ping
    pub ping_delay: Duration,
    /// Time to wait for a pong (or a successful open) before resetting the connection
    pub ping_max_lag: Duration,
    /// Delay before redialing after an error or close
    pub auto_reconnect_delay: Duration,
    /// Retry delay while the host reports the process offline
    pub offline_retry_delay: Duration,
    /// Lower bound of the randomized reconnect delay while idle
    pub idle_reconnect_min: Duration,
    /// Upper bound of the randomized reconnect delay while idle
    pub idle_reconnect_max: Duration,
    /// Extra ping spacing while idle
    pub idle_ping_extra: Duration,
    /// Continuous idle time after which the connection is torn down
    pub idle_teardown_after: Duration,
    /// Delay between a server resync request and the reload signal
    pub resync_reload_delay: Duration,
    /// Cadence of the acknowledgement retry pass
    pub ack_resend_interval: Duration,
    /// Age after which an unacknowledged message is retransmitted
    pub ack_resend_cutoff: Duration,
    /// Lifetime of the persisted sticky endpoint choice
    pub sticky_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_delay: DEFAULT_PING_DELAY,
            ping_max_lag: DEFAULT_PING_MAX_LAG,
            auto_reconnect_delay: DEFAULT_AUTO_RECONNECT_DELAY,
            offline_retry_delay: DEFAULT_OFFLINE_RETRY_DELAY,
            idle_reconnect_min: DEFAULT_IDLE_RECONNECT_MIN,
            idle_reconnect_max: DEFAULT_IDLE_RECONNECT_MAX,
            idle_ping_extra: DEFAULT_IDLE_PING_EXTRA,
            idle_teardown_after: DEFAULT_IDLE_TEARDOWN_AFTER,
            resync_reload_delay: DEFAULT_RESYNC_RELOAD_DELAY,
            ack_resend_interval: DEFAULT_ACK_RESEND_INTERVAL,
            ack_resend_cutoff: DEFAULT_ACK_RESEND_CUTOFF,
            sticky_ttl: DEFAULT_STICKY_TTL,
        }
    }
}

impl Config {
    /// Apply the persisted ping-interval user preference, if any.
    ///
    /// Overrides at or below the 400 ms floor are rejected in favor of the
    /// default so a corrupt preference cannot flood the server.
    pub fn apply_ping_override(&mut self, store: &dyn KvStore) {
        let Some(raw) = store.get(PING_INTERVAL_KEY) else {
            return;
        };
        match raw.parse::<u64>() {
            Ok(millis) if Duration::from_millis(millis) > PING_DELAY_FLOOR => {
                self.ping_delay = Duration::from_millis(millis);
            }
            Ok(_) => self.ping_delay = DEFAULT_PING_DELAY,
            Err(e) => {
                tracing::debug!(%raw, error = %e, "ignoring malformed ping interval preference");
            }
        }
    }
}
