use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::frame::{FrameSize, CHANNELS, SAMPLE_RATE};
use super::ogg::OggReader;
use crate::error::{ClientError, ClientResult};

const STDERR_TAIL_LINES: usize = 3;

/// Produces encoded Opus frames for the player.
#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(None)` once the source is drained.
    async fn next_frame(&mut self) -> ClientResult<Option<Vec<u8>>>;

    /// Called after the last frame. Reports how the producer ended.
    async fn finish(&mut self) -> ClientResult<()> {
        Ok(())
    }

    /// Tears the producer down before it is drained.
    async fn abort(&mut self) {}
}

/// How to run the encoder.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub ffmpeg: String,
    pub bitrate_kbps: u32,
    pub frame_size: FrameSize,
}

impl EncoderOptions {
    pub(crate) fn args(&self, input: &str) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-i".into(),
            input.to_string(),
            "-vn".into(),
            "-map".into(),
            "0:a".into(),
            "-c:a".into(),
            "libopus".into(),
            "-ar".into(),
            SAMPLE_RATE.to_string(),
            "-ac".into(),
            CHANNELS.to_string(),
            "-b:a".into(),
            format!("{}k", self.bitrate_kbps),
            "-frame_duration".into(),
            self.frame_size.millis().to_string(),
            "-application".into(),
            "audio".into(),
            "-f".into(),
            "ogg".into(),
            "pipe:1".into(),
        ]
    }
}

/// An ffmpeg child turning any input into Ogg/Opus on stdout.
pub struct FfmpegSource {
    child: Child,
    frames: OggReader<ChildStdout>,
    stderr: JoinHandle<String>,
    feeder: Option<JoinHandle<()>>,
    program: String,
}

impl FfmpegSource {
    pub fn file(options: &EncoderOptions, path: &Path) -> ClientResult<Self> {
        let input = path.to_string_lossy();
        Self::spawn(options, &input, Stdio::null())
    }

    /// Pipes `input` into the encoder's stdin from a background task.
    pub fn stream<R>(options: &EncoderOptions, mut input: R) -> ClientResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut source = Self::spawn(options, "pipe:0", Stdio::piped())?;
        let mut stdin = source
            .child
            .stdin
            .take()
            .ok_or_else(|| ClientError::audio("encoder has no stdin"))?;

        source.feeder = Some(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut input, &mut stdin).await {
                debug!("Encoder stopped reading its input: {e}");
            }
            let _ = stdin.shutdown().await;
        }));
        Ok(source)
    }

    fn spawn(options: &EncoderOptions, input: &str, stdin: Stdio) -> ClientResult<Self> {
        let mut child = Command::new(&options.ffmpeg)
            .args(options.args(input))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::audio(format!("failed to start {}: {e}", options.ffmpeg)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::audio("encoder has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::audio("encoder has no stderr"))?;

        debug!("Started {} for {input}", options.ffmpeg);
        Ok(Self {
            child,
            frames: OggReader::new(stdout),
            stderr: tokio::spawn(stderr_tail(stderr)),
            feeder: None,
            program: options.ffmpeg.clone(),
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn next_frame(&mut self) -> ClientResult<Option<Vec<u8>>> {
        self.frames.next_packet().await
    }

    async fn finish(&mut self) -> ClientResult<()> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ClientError::audio(format!("lost track of {}: {e}", self.program)))?;
        if status.success() {
            return Ok(());
        }

        let tail = (&mut self.stderr).await.unwrap_or_default();
        warn!("{} exited with {status}", self.program);
        Err(ClientError::audio(format!(
            "{} exited with {status}:\n{tail}",
            self.program
        )))
    }

    async fn abort(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Err(e) = self.child.kill().await {
            debug!("Could not kill {}: {e}", self.program);
        }
        self.stderr.abort();
    }
}

/// Keeps the last few stderr lines for error reports.
async fn stderr_tail(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}
