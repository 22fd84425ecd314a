use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep_until, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct Window {
    started: Instant,
    used: u32,
    paused_until: Option<Instant>,
}

/// The one bucket every request passes through: a per-second budget plus
/// the shared timer a global 429 arms.
pub(crate) struct GlobalLimiter {
    limit: u32,
    window: Mutex<Window>,
}

impl GlobalLimiter {
    /// `limit == 0` disables the per-second budget; the 429 timer still works.
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
                paused_until: None,
            }),
        }
    }

    /// Returns once this caller may put a request on the wire.
    pub(crate) async fn acquire(&self) {
        loop {
            let wake_at = self.try_acquire(Instant::now());
            match wake_at {
                None => return,
                Some(at) => {
                    debug!("Global rate limit reached, waiting {:?}", at - Instant::now());
                    sleep_until(at).await;
                }
            }
        }
    }

    fn try_acquire(&self, now: Instant) -> Option<Instant> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(until) = window.paused_until {
            if until > now {
                return Some(until);
            }
            window.paused_until = None;
        }

        if now >= window.started + WINDOW {
            window.started = now;
            window.used = 0;
        }

        if self.limit == 0 || window.used < self.limit {
            window.used += 1;
            None
        } else {
            Some(window.started + WINDOW)
        }
    }

    /// Arms the shared timer. A shorter pause never cuts a longer one short.
    pub(crate) fn pause(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.paused_until.is_none_or(|current| current < until) {
            warn!("Global rate limit hit, pausing every bucket for {wait:?}");
            window.paused_until = Some(until);
        }
    }

    pub(crate) fn paused_until(&self) -> Option<Instant> {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.paused_until.filter(|until| *until > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_refills_every_window() {
        let limiter = GlobalLimiter::new(2);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);

        limiter.acquire().await;
        assert!(Instant::now() >= start + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_until_timer_fires() {
        let limiter = GlobalLimiter::new(0);
        let start = Instant::now();
        limiter.pause(Duration::from_secs(3));
        limiter.pause(Duration::from_secs(1));
        assert!(limiter.paused_until().is_some());

        limiter.acquire().await;
        assert!(Instant::now() >= start + Duration::from_secs(3));
        assert!(limiter.paused_until().is_none());
    }
}
