use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// How many intervals may pass without an ACK before the socket is
/// considered dead.
pub const MISSED_ACK_LIMIT: u32 = 2;

/// Liveness bookkeeping for one socket. Pure state, the connection loop owns
/// the timers.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    last_ack: Instant,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl Heartbeat {
    /// `now` is when HELLO arrived; it counts as the first ack.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_ack: now,
            last_sent: None,
            latency: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Randomized delay before the very first beat so a fleet of shards
    /// doesn't heartbeat in lockstep.
    pub fn first_delay(&self) -> Duration {
        let jitter: f64 = rand::rng().random_range(0.0..1.0);
        self.interval.mul_f64(jitter)
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Returns the round trip of the beat being acknowledged, if any.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.last_ack = now;
        if let Some(sent) = self.last_sent.take() {
            self.latency = Some(now.saturating_duration_since(sent));
        }
        self.latency
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Instant at which the connection is presumed dead if no ACK shows up.
    pub fn deadline(&self) -> Instant {
        self.last_ack + self.interval * MISSED_ACK_LIMIT
    }

    pub fn is_zombied(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}
