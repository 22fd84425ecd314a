use std::time::Duration;

use log::debug;
use tokio::time::{sleep_until, Instant};

/// How far behind schedule we let ourselves fall before giving up on
/// catching up and re-anchoring to now.
const MAX_LAG_FRAMES: u32 = 10;

/// Schedules frame `n` at `anchor + n * frame`, so timer jitter never
/// accumulates into drift. Pausing shifts the anchor by the paused time.
#[derive(Debug)]
pub struct FramePacer {
    frame: Duration,
    anchor: Instant,
    index: u32,
    paused_at: Option<Instant>,
}

impl FramePacer {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            anchor: Instant::now(),
            index: 0,
            paused_at: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.anchor + self.frame * self.index
    }

    /// Sleeps until the next frame slot and claims it.
    pub async fn tick(&mut self) {
        let deadline = self.deadline();
        sleep_until(deadline).await;

        let now = Instant::now();
        if now.saturating_duration_since(deadline) > self.frame * MAX_LAG_FRAMES {
            debug!(
                "Frame pacing fell {}ms behind, re-anchoring",
                now.duration_since(deadline).as_millis()
            );
            self.anchor = now;
            self.index = 0;
        }
        self.index += 1;
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.anchor += Instant::now().saturating_duration_since(paused_at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn frames_are_spaced_by_the_frame_size() {
        let mut pacer = FramePacer::new(Duration::from_millis(20));
        let start = Instant::now();
        let mut emitted = Vec::new();
        for _ in 0..50 {
            pacer.tick().await;
            emitted.push(Instant::now());
        }
        let span = *emitted.last().unwrap() - emitted[0];
        assert!(span >= Duration::from_millis(20) * 49);
        assert_eq!(emitted[0], start);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumers_do_not_drift() {
        let mut pacer = FramePacer::new(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..10 {
            pacer.tick().await;
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        pacer.tick().await;
        assert_eq!(Instant::now(), start + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_shifts_the_schedule() {
        let mut pacer = FramePacer::new(Duration::from_millis(20));
        let start = Instant::now();
        pacer.tick().await;
        pacer.tick().await;

        pacer.pause();
        assert!(pacer.is_paused());
        tokio::time::advance(Duration::from_secs(3)).await;
        pacer.resume();

        pacer.tick().await;
        assert_eq!(
            Instant::now(),
            start + Duration::from_secs(3) + Duration::from_millis(40)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn re_anchors_after_a_long_stall() {
        let mut pacer = FramePacer::new(Duration::from_millis(20));
        pacer.tick().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        pacer.tick().await;
        let resumed = Instant::now();
        pacer.tick().await;
        assert_eq!(Instant::now(), resumed + Duration::from_millis(20));
    }
}
