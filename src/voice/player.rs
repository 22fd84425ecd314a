use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::frame::{FrameSize, SILENCE_FRAME, TRAILING_SILENCE_FRAMES};
use super::pacer::FramePacer;
use super::source::FrameSource;
use crate::error::ClientResult;

/// Where paced frames go. The real one encrypts onto the voice UDP socket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, opus: &[u8], frame: FrameSize) -> ClientResult<()>;

    async fn set_speaking(&mut self, speaking: bool) -> ClientResult<()>;
}

/// Caller side of a running playback.
#[derive(Debug)]
pub struct PlaybackControl {
    paused: watch::Sender<bool>,
    stop: CancellationToken,
}

/// Player side of a running playback.
#[derive(Debug)]
pub struct PlaybackSignals {
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
}

impl PlaybackControl {
    pub fn pair() -> (Self, PlaybackSignals) {
        let (paused, paused_rx) = watch::channel(false);
        let stop = CancellationToken::new();
        (
            Self {
                paused,
                stop: stop.clone(),
            },
            PlaybackSignals {
                paused: paused_rx,
                stop,
            },
        )
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn unpause(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

enum Outcome {
    Finished,
    Stopped,
}

/// Pulls frames from `source` and hands them to `sink` on the frame clock
/// until the source drains or playback is stopped.
///
/// A failing source rejects this call and nothing else; the sink stays
/// usable for the next playback.
pub async fn play<S, K>(
    source: &mut S,
    sink: &mut K,
    frame: FrameSize,
    mut signals: PlaybackSignals,
) -> ClientResult<()>
where
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
{
    let mut pacer = FramePacer::new(frame.duration());
    let mut sent = 0u64;
    let result = pump(source, sink, frame, &mut signals, &mut pacer, &mut sent).await;
    // A paused playback already trailed off when it paused.
    let trailed = if pacer.is_paused() {
        Ok(())
    } else {
        trail_off(sink, frame, &mut pacer).await
    };

    match result {
        Ok(Outcome::Finished) => {
            source.finish().await?;
            trailed?;
            info!("Playback finished after {sent} frames");
            Ok(())
        }
        Ok(Outcome::Stopped) => {
            source.abort().await;
            info!("Playback stopped after {sent} frames");
            Ok(())
        }
        Err(e) => {
            source.abort().await;
            Err(e)
        }
    }
}

async fn pump<S, K>(
    source: &mut S,
    sink: &mut K,
    frame: FrameSize,
    signals: &mut PlaybackSignals,
    pacer: &mut FramePacer,
    sent: &mut u64,
) -> ClientResult<Outcome>
where
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
{
    sink.set_speaking(true).await?;

    loop {
        if *signals.paused.borrow_and_update() {
            trail_off(sink, frame, pacer).await?;
            pacer.pause();
            debug!("Playback paused after {sent} frames");
            if !wait_for_unpause(signals).await {
                return Ok(Outcome::Stopped);
            }
            pacer.resume();
            sink.set_speaking(true).await?;
            debug!("Playback resumed");
        }

        let next = tokio::select! {
            biased;
            _ = signals.stop.cancelled() => return Ok(Outcome::Stopped),
            next = source.next_frame() => next?,
        };
        let Some(packet) = next else {
            return Ok(Outcome::Finished);
        };

        tokio::select! {
            biased;
            _ = signals.stop.cancelled() => return Ok(Outcome::Stopped),
            _ = pacer.tick() => {}
        }
        sink.send_frame(&packet, frame).await?;
        *sent += 1;
    }
}

/// `false` if playback was stopped while paused.
async fn wait_for_unpause(signals: &mut PlaybackSignals) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = signals.stop.cancelled() => return false,
            changed = signals.paused.changed() => {
                if changed.is_err() {
                    return false;
                }
                if !*signals.paused.borrow_and_update() {
                    return true;
                }
            }
        }
    }
}

/// Trailing silence, then SPEAKING off.
async fn trail_off<K: FrameSink + ?Sized>(
    sink: &mut K,
    frame: FrameSize,
    pacer: &mut FramePacer,
) -> ClientResult<()> {
    for _ in 0..TRAILING_SILENCE_FRAMES {
        pacer.tick().await;
        sink.send_frame(&SILENCE_FRAME, frame).await?;
    }
    sink.set_speaking(false).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::error::ClientError;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Frame(Vec<u8>, Instant),
        Speaking(bool),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<Sent>>>,
    }

    impl RecordingSink {
        fn audio(&self) -> Vec<(Vec<u8>, Instant)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| match s {
                    Sent::Frame(bytes, at) if bytes.as_slice() != SILENCE_FRAME => {
                        Some((bytes.clone(), *at))
                    }
                    _ => None,
                })
                .collect()
        }

        fn entries(&self) -> Vec<Sent> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, opus: &[u8], _frame: FrameSize) -> ClientResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(Sent::Frame(opus.to_vec(), Instant::now()));
            Ok(())
        }

        async fn set_speaking(&mut self, speaking: bool) -> ClientResult<()> {
            self.log.lock().unwrap().push(Sent::Speaking(speaking));
            Ok(())
        }
    }

    struct ScriptedSource {
        frames: VecDeque<Vec<u8>>,
        fail_at_end: bool,
        aborted: bool,
    }

    impl ScriptedSource {
        fn counting(n: u8) -> Self {
            Self {
                frames: (0..n).map(|i| vec![i]).collect(),
                fail_at_end: false,
                aborted: false,
            }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> ClientResult<Option<Vec<u8>>> {
            Ok(self.frames.pop_front())
        }

        async fn finish(&mut self) -> ClientResult<()> {
            if self.fail_at_end {
                Err(ClientError::audio("encoder exited with exit status: 1"))
            } else {
                Ok(())
            }
        }

        async fn abort(&mut self) {
            self.aborted = true;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_and_wrapped_in_speaking() {
        let mut source = ScriptedSource::counting(10);
        let mut sink = RecordingSink::default();
        let (_control, signals) = PlaybackControl::pair();

        play(&mut source, &mut sink, FrameSize::Ms20, signals).await.unwrap();

        let audio = sink.audio();
        assert_eq!(audio.len(), 10);
        let span = audio[9].1 - audio[0].1;
        assert!(span >= Duration::from_millis(20) * 9);

        let entries = sink.entries();
        assert_eq!(entries.first(), Some(&Sent::Speaking(true)));
        assert_eq!(entries.last(), Some(&Sent::Speaking(false)));
        let silence = entries
            .iter()
            .filter(|s| matches!(s, Sent::Frame(b, _) if b.as_slice() == SILENCE_FRAME))
            .count();
        assert_eq!(silence, TRAILING_SILENCE_FRAMES);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_unpause_continue_at_the_next_frame() {
        let mut source = ScriptedSource::counting(20);
        let sink = RecordingSink::default();
        let (control, signals) = PlaybackControl::pair();

        let mut player_sink = sink.clone();
        let player = tokio::spawn(async move {
            play(&mut source, &mut player_sink, FrameSize::Ms20, signals).await
        });

        tokio::time::sleep(Duration::from_millis(95)).await;
        control.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let during_pause = sink.audio().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.audio().len(), during_pause);
        control.unpause();

        player.await.unwrap().unwrap();
        let indices: Vec<u8> = sink.audio().iter().map(|(bytes, _)| bytes[0]).collect();
        assert_eq!(indices, (0..20).collect::<Vec<u8>>());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_playback_cleanly() {
        let mut source = ScriptedSource::counting(200);
        let mut sink = RecordingSink::default();
        let (control, signals) = PlaybackControl::pair();
        control.stop();

        play(&mut source, &mut sink, FrameSize::Ms20, signals).await.unwrap();
        assert!(source.aborted);
        assert!(sink.audio().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_while_paused_trails_off_once() {
        let mut source = ScriptedSource::counting(50);
        let sink = RecordingSink::default();
        let (control, signals) = PlaybackControl::pair();

        let mut player_sink = sink.clone();
        let player = tokio::spawn(async move {
            play(&mut source, &mut player_sink, FrameSize::Ms20, signals).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.pause();
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.stop();
        player.await.unwrap().unwrap();

        let entries = sink.entries();
        let silence = entries
            .iter()
            .filter(|s| matches!(s, Sent::Frame(b, _) if b.as_slice() == SILENCE_FRAME))
            .count();
        assert_eq!(silence, TRAILING_SILENCE_FRAMES);
        assert_eq!(entries.last(), Some(&Sent::Speaking(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_failure_rejects_the_playback() {
        let mut source = ScriptedSource {
            frames: VecDeque::from(vec![vec![1], vec![2]]),
            fail_at_end: true,
            aborted: false,
        };
        let mut sink = RecordingSink::default();
        let (_control, signals) = PlaybackControl::pair();

        let err = play(&mut source, &mut sink, FrameSize::Ms20, signals)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AudioPipeline(_)));
        assert_eq!(sink.audio().len(), 2);
        assert_eq!(sink.entries().last(), Some(&Sent::Speaking(false)));
    }
}
