use crate::config::ProcessingConfig;
use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

const READ_CHUNK_BYTES: usize = 64 * 1024;
const STDERR_LIMIT_BYTES: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("frame exceeds the {limit} byte limit")]
    FrameTooLarge { limit: usize },

    #[error("stream ended inside a frame with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("video input is empty")]
    EmptyInput,

    #[error("failed to start transcoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid frame stream: {0}")]
    Stream(#[from] TokenizeError),

    #[error("transcoder exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("transcoder terminated by signal: {stderr}")]
    Terminated { stderr: String },

    #[error("no frames could be extracted from the video")]
    NoFrames,

    #[error("frame decoding task failed: {0}")]
    Decode(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    SeekingStart,
    /// A start marker sits at `buf[0]`; the end marker search resumes at `scan_from`
    SeekingEnd { scan_from: usize },
}

/// Splits a concatenated JPEG byte stream into individual frames.
///
/// Input may arrive in chunks of any size; the frames produced do not depend
/// on where the chunk boundaries fall. Bytes outside a `FF D8 .. FF D9` pair
/// are discarded.
#[derive(Debug)]
pub struct FrameTokenizer {
    buf: Vec<u8>,
    state: ScanState,
    max_frame_bytes: usize,
}

impl FrameTokenizer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: ScanState::SeekingStart,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, `None` when more input is needed
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TokenizeError> {
        loop {
            match self.state {
                ScanState::SeekingStart => match find_marker(&self.buf, SOI, 0) {
                    Some(start) => {
                        self.buf.drain(..start);
                        self.state = ScanState::SeekingEnd { scan_from: SOI.len() };
                    }
                    None => {
                        // Only a trailing 0xFF can still become part of a start marker
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        self.buf.drain(..self.buf.len() - keep);
                        return Ok(None);
                    }
                },
                ScanState::SeekingEnd { scan_from } => match find_marker(&self.buf, EOI, scan_from) {
                    Some(end) => {
                        let frame: Vec<u8> = self.buf.drain(..end + EOI.len()).collect();
                        self.state = ScanState::SeekingStart;
                        return Ok(Some(frame));
                    }
                    None => {
                        if self.buf.len() > self.max_frame_bytes {
                            return Err(TokenizeError::FrameTooLarge {
                                limit: self.max_frame_bytes,
                            });
                        }
                        let scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
                        self.state = ScanState::SeekingEnd { scan_from };
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Signal end of input. A frame that was started but never terminated is
    /// reported and dropped.
    pub fn finish(&mut self) -> Result<(), TokenizeError> {
        let state = std::mem::replace(&mut self.state, ScanState::SeekingStart);
        let buffered = self.buf.len();
        self.buf.clear();
        match state {
            ScanState::SeekingEnd { .. } => Err(TokenizeError::UnexpectedEof { buffered }),
            ScanState::SeekingStart => Ok(()),
        }
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}

/// How the transcoder is invoked and how its exit is judged
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub program: String,
    pub timeout: Duration,
    pub quality: u8,
    pub tolerated_exit_codes: Vec<i32>,
    pub max_frame_bytes: usize,
}

impl From<&ProcessingConfig> for ExtractorSettings {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            program: config.transcoder_path.clone(),
            timeout: Duration::from_secs(config.transcoder_timeout_secs),
            quality: config.transcoder_quality,
            tolerated_exit_codes: config.tolerated_exit_codes.clone(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Source of decoded frames for a video
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn extract_frames(
        &self,
        video: Bytes,
        sampling_rate_hz: f64,
    ) -> Result<Vec<DynamicImage>, ExtractionError>;
}

/// Extracts frames by piping the video through an ffmpeg-compatible transcoder
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    settings: ExtractorSettings,
}

impl FrameExtractor {
    pub fn new(settings: ExtractorSettings) -> Self {
        Self { settings }
    }

    /// Arguments for reading the video on stdin and writing MJPEG frames to stdout
    pub fn transcoder_args(&self, sampling_rate_hz: f64) -> Vec<String> {
        vec![
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            "pipe:0".into(),
            "-f".into(),
            "image2pipe".into(),
            "-vf".into(),
            format!("fps={sampling_rate_hz}"),
            "-vcodec".into(),
            "mjpeg".into(),
            "-q:v".into(),
            self.settings.quality.to_string(),
            "-vsync".into(),
            "0".into(),
            "-frame_pts".into(),
            "1".into(),
            "pipe:1".into(),
        ]
    }

    fn transcoder_command(&self, sampling_rate_hz: f64) -> Command {
        let mut command = Command::new(&self.settings.program);
        command.args(self.transcoder_args(sampling_rate_hz));
        command
    }

    /// Run `command` with `video` on stdin and collect the decoded frames it emits
    pub(crate) async fn extract_with(
        &self,
        mut command: Command,
        video: Bytes,
    ) -> Result<Vec<DynamicImage>, ExtractionError> {
        if video.is_empty() {
            return Err(ExtractionError::EmptyInput);
        }

        command
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ExtractionError::Spawn {
            program: self.settings.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("transcoder stdout was not captured"))?;
        let stderr = child.stderr.take();

        let writer = tokio::spawn(write_input(stdin, video));
        let mut stderr_reader = tokio::spawn(capture_stderr(stderr));

        let max_frame_bytes = self.settings.max_frame_bytes;
        let run = async {
            let raw_frames = read_frames(stdout, max_frame_bytes).await?;
            let status = child.wait().await?;
            Ok::<_, ExtractionError>((raw_frames, status))
        };

        let outcome = timeout(self.settings.timeout, run).await;
        metrics::histogram!("worker.transcoder.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let (raw_frames, status) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                writer.abort();
                stderr_reader.abort();
                return Err(e);
            }
            Err(_) => {
                writer.abort();
                stderr_reader.abort();
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill timed out transcoder");
                }
                let _ = child.wait().await;
                return Err(ExtractionError::Timeout(self.settings.timeout));
            }
        };

        // A descendant can keep the pipes open after the transcoder exits
        writer.abort();
        let remaining = self.settings.timeout.saturating_sub(started.elapsed());
        let stderr = match timeout(remaining, &mut stderr_reader).await {
            Ok(captured) => captured.unwrap_or_default(),
            Err(_) => {
                stderr_reader.abort();
                debug!("Transcoder stderr still open after exit");
                String::new()
            }
        };
        self.check_exit(status, &stderr)?;

        let frames = decode_frames(raw_frames).await?;
        if frames.is_empty() {
            return Err(ExtractionError::NoFrames);
        }

        if !status.success() {
            warn!(
                code = ?status.code(),
                frames = frames.len(),
                "Transcoder exited with a tolerated code"
            );
        }

        Ok(frames)
    }

    /// Reject exit statuses that fail extraction regardless of output
    fn check_exit(&self, status: ExitStatus, stderr: &str) -> Result<(), ExtractionError> {
        match status.code() {
            Some(0) => Ok(()),
            Some(code) if self.settings.tolerated_exit_codes.contains(&code) => Ok(()),
            Some(code) => Err(ExtractionError::Exit {
                code,
                stderr: stderr.to_string(),
            }),
            None => Err(ExtractionError::Terminated {
                stderr: stderr.to_string(),
            }),
        }
    }
}

#[async_trait]
impl FrameSource for FrameExtractor {
    #[instrument(skip(self, video), fields(video_bytes = video.len(), rate = sampling_rate_hz))]
    async fn extract_frames(
        &self,
        video: Bytes,
        sampling_rate_hz: f64,
    ) -> Result<Vec<DynamicImage>, ExtractionError> {
        let command = self.transcoder_command(sampling_rate_hz);
        let frames = self.extract_with(command, video).await?;

        metrics::counter!("worker.frames.extracted").increment(frames.len() as u64);
        info!(frames = frames.len(), "Frames extracted");

        Ok(frames)
    }
}

async fn write_input(stdin: Option<ChildStdin>, video: Bytes) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // The transcoder may exit before consuming everything
    if let Err(e) = stdin.write_all(&video).await {
        debug!(error = %e, "Transcoder stopped reading input");
    }
    let _ = stdin.shutdown().await;
}

async fn capture_stderr<R: AsyncRead + Unpin>(stderr: Option<R>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    String::from_utf8_lossy(&kept).trim().to_string()
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut stdout: R,
    max_frame_bytes: usize,
) -> Result<Vec<Vec<u8>>, ExtractionError> {
    let mut tokenizer = FrameTokenizer::new(max_frame_bytes);
    let mut frames = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = stdout.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tokenizer.push(&chunk[..n]);
        while let Some(frame) = tokenizer.next_frame()? {
            frames.push(frame);
        }
    }

    if let Err(e) = tokenizer.finish() {
        warn!(error = %e, "Discarding incomplete trailing frame");
    }

    Ok(frames)
}

/// Decode on the blocking pool, skipping frames that are not valid JPEG
async fn decode_frames(raw_frames: Vec<Vec<u8>>) -> Result<Vec<DynamicImage>, ExtractionError> {
    let frames = tokio::task::spawn_blocking(move || {
        raw_frames
            .iter()
            .enumerate()
            .filter_map(|(index, data)| {
                match image::load_from_memory_with_format(data, ImageFormat::Jpeg) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!(index, error = %e, "Skipping undecodable frame");
                        None
                    }
                }
            })
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(frames)
}
