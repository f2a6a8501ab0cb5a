//! Encoder strategies and the ordered fallback chain.
//!
//! A strategy is one concrete way of turning raw frames into a bitstream.
//! The chain is walked by index only, from the most efficient entry towards
//! the last-resort intra-only JPEG encoder.

use std::fmt::{Display, Formatter};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::bitstream::{Bitstream, contains_keyframe, convert_avcc_to_annexb, is_annexb_packet};
use crate::hw::EncoderProbe;
use crate::types::{FramePayload, QualityTuple, RawFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    HardwareHevc,
    HardwareH264,
    SoftwareHevc,
    SoftwareH264,
    /// Intra-only stills, always available
    Jpeg,
}

impl Strategy {
    pub const DEFAULT_CHAIN: [Strategy; 5] = [
        Strategy::HardwareHevc,
        Strategy::HardwareH264,
        Strategy::SoftwareHevc,
        Strategy::SoftwareH264,
        Strategy::Jpeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::HardwareHevc => "hardware_hevc",
            Strategy::HardwareH264 => "hardware_h264",
            Strategy::SoftwareHevc => "software_hevc",
            Strategy::SoftwareH264 => "software_h264",
            Strategy::Jpeg => "jpeg",
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Strategy::HardwareHevc | Strategy::HardwareH264)
    }

    pub fn bitstream(&self) -> Bitstream {
        match self {
            Strategy::HardwareHevc | Strategy::SoftwareHevc => Bitstream::Hevc,
            Strategy::HardwareH264 | Strategy::SoftwareH264 => Bitstream::H264,
            Strategy::Jpeg => Bitstream::Jpeg,
        }
    }

    /// Software encoder of the same codec family.
    pub fn software_encoder(&self) -> Option<&'static str> {
        match self.bitstream() {
            Bitstream::H264 => Some("libx264"),
            Bitstream::Hevc => Some("libx265"),
            Bitstream::Jpeg => None,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings an encoder is (re)configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderOptions {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    /// Frames between forced key frames
    pub keyframe_interval: u32,
}

impl EncoderOptions {
    pub fn from_quality(quality: &QualityTuple, keyframe_interval: u32) -> Self {
        Self {
            width: quality.width,
            height: quality.height,
            frame_rate: quality.frame_rate,
            bitrate_kbps: quality.bitrate_kbps,
            keyframe_interval,
        }
    }
}

/// Partial update for a live encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderUpdate {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub bitrate_kbps: Option<u32>,
}

impl EncoderUpdate {
    pub fn apply(&self, options: &mut EncoderOptions) -> bool {
        let before = options.clone();
        if let Some(v) = self.width {
            options.width = v;
        }
        if let Some(v) = self.height {
            options.height = v;
        }
        if let Some(v) = self.frame_rate {
            options.frame_rate = v;
        }
        if let Some(v) = self.bitrate_kbps {
            options.bitrate_kbps = v;
        }
        *options != before
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The strategy is unusable; the worker moves on to the next chain entry.
    #[error("fatal encoder error: {0:#}")]
    Fatal(anyhow::Error),
    /// Only this frame failed.
    #[error("frame rejected: {0:#}")]
    Frame(anyhow::Error),
}

/// Bytes produced by one encode call.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub is_key: bool,
}

/// One encoder implementation behind the common capability interface.
pub trait EncodeStrategy: Send {
    fn strategy(&self) -> Strategy;

    /// Encodes a frame. `Ok(None)` means the encoder buffered and produced nothing yet.
    fn encode(&mut self, frame: RawFrame) -> BoxFuture<'_, Result<Option<EncodedChunk>, EncodeError>>;

    /// Applies new options. Returns false when the strategy must be restarted
    /// to pick them up.
    fn update_options(&mut self, options: &EncoderOptions) -> bool;

    fn stop(&mut self) -> BoxFuture<'_, ()>;
}

/// Builds strategy instances for the worker. Swapped for fakes in tests.
pub trait StrategyFactory: Send + Sync {
    fn create(
        &self,
        strategy: Strategy,
        options: &EncoderOptions,
    ) -> anyhow::Result<Box<dyn EncodeStrategy>>;
}

/// Factory backed by ffmpeg worker processes and the in-process JPEG encoder.
pub struct ProcessStrategyFactory {
    ffmpeg_path: String,
    probe: EncoderProbe,
    frame_timeout: Duration,
}

impl ProcessStrategyFactory {
    pub fn new(ffmpeg_path: impl Into<String>, probe: EncoderProbe, frame_timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            probe,
            frame_timeout,
        }
    }
}

impl StrategyFactory for ProcessStrategyFactory {
    fn create(
        &self,
        strategy: Strategy,
        options: &EncoderOptions,
    ) -> anyhow::Result<Box<dyn EncodeStrategy>> {
        if strategy == Strategy::Jpeg {
            return Ok(Box::new(JpegEncoder::new(options.clone())));
        }
        // Unprobed entries still get a worker: it fails fast and the chain moves on.
        let codec = self
            .probe
            .resolve(strategy)
            .or_else(|| match strategy.software_encoder() {
                Some(sw) if strategy.is_hardware() => {
                    crate::hw::hw_encoder_names(sw).first().map(|s| s.to_string())
                }
                other => other.map(str::to_string),
            })
            .ok_or(anyhow::anyhow!("no encoder for strategy {}", strategy))?;
        Ok(Box::new(ProcessEncoder::new(
            strategy,
            &self.ffmpeg_path,
            &codec,
            options.clone(),
            self.frame_timeout,
        )))
    }
}

// ============================================================================
// ffmpeg worker process
// ============================================================================

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::Receiver<Bytes>,
    last_error: Arc<Mutex<Option<String>>>,
    input: InputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Jpeg,
    Rgb24 { width: u32, height: u32 },
}

impl InputKind {
    fn of(frame: &RawFrame) -> Self {
        match frame.payload {
            FramePayload::Jpeg(_) => InputKind::Jpeg,
            FramePayload::Rgb24(_) => InputKind::Rgb24 {
                width: frame.width,
                height: frame.height,
            },
        }
    }
}

/// External `ffmpeg` process fed through stdin, emitting an Annex B stream on stdout.
/// The process is started on the first frame, since the input layout is only known then.
pub struct ProcessEncoder {
    strategy: Strategy,
    ffmpeg_path: String,
    codec: String,
    options: EncoderOptions,
    frame_timeout: Duration,
    process: Option<WorkerProcess>,
}

impl ProcessEncoder {
    pub fn new(
        strategy: Strategy,
        ffmpeg_path: &str,
        codec: &str,
        options: EncoderOptions,
        frame_timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            ffmpeg_path: ffmpeg_path.to_string(),
            codec: codec.to_string(),
            options,
            frame_timeout,
            process: None,
        }
    }

    fn build_args(&self, input: InputKind) -> Vec<String> {
        fn push(args: &mut Vec<String>, items: &[&str]) {
            args.extend(items.iter().map(|s| s.to_string()));
        }

        let o = &self.options;
        let mut args = Vec::new();
        push(&mut args, &["-hide_banner", "-loglevel", "error"]);
        if self.codec.contains("vaapi") {
            push(&mut args, &["-vaapi_device", "/dev/dri/renderD128"]);
        }
        match input {
            InputKind::Jpeg => push(&mut args, &["-f", "image2pipe", "-c:v", "mjpeg"]),
            InputKind::Rgb24 { width, height } => {
                let size = format!("{}x{}", width, height);
                push(&mut args, &["-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size]);
            }
        }
        let frame_rate = o.frame_rate.max(1).to_string();
        push(&mut args, &["-framerate", &frame_rate, "-i", "pipe:0"]);

        let scale = format!("scale={}:{}", o.width, o.height);
        let filter = if self.codec.contains("vaapi") {
            format!("{},format=nv12,hwupload", scale)
        } else if crate::hw::is_hw_encoder(&self.codec) {
            format!("{},format=nv12", scale)
        } else {
            format!("{},format=yuv420p", scale)
        };
        push(&mut args, &["-vf", &filter]);

        let bitrate = format!("{}k", o.bitrate_kbps);
        let bufsize = format!("{}k", (o.bitrate_kbps / o.frame_rate.max(1)).max(1) * 2);
        let gop = o.keyframe_interval.max(1).to_string();
        push(
            &mut args,
            &[
                "-c:v", &self.codec, "-b:v", &bitrate, "-maxrate", &bitrate, "-bufsize", &bufsize,
                "-g", &gop, "-bf", "0",
            ],
        );
        match self.codec.as_str() {
            "libx264" => push(&mut args, &["-preset", "ultrafast", "-tune", "zerolatency"]),
            "libx265" => push(
                &mut args,
                &[
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "zerolatency",
                    "-x265-params",
                    "log-level=error",
                ],
            ),
            c if c.contains("nvenc") => push(&mut args, &["-preset", "p1", "-tune", "ll"]),
            _ => {}
        }
        let format = match self.strategy.bitstream() {
            Bitstream::Hevc => "hevc",
            _ => "h264",
        };
        push(&mut args, &["-f", format, "pipe:1"]);
        args
    }

    fn spawn(&self, input: InputKind) -> anyhow::Result<WorkerProcess> {
        let args = self.build_args(input);
        log::debug!("spawning encoder worker: {} {}", self.ffmpeg_path, args.join(" "));
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {} failed: {}", self.ffmpeg_path, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or(anyhow::anyhow!("encoder worker has no stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or(anyhow::anyhow!("encoder worker has no stdout"))?;

        /// Encoded output is small; a short queue is enough between reads.
        const OUTPUT_CHAN_CAP: usize = 64;
        let (tx, rx) = mpsc::channel(OUTPUT_CHAN_CAP);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("encoder worker stdout read error: {}", e);
                        break;
                    }
                }
            }
        });

        let last_error = Arc::new(Mutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            let last_error = Arc::clone(&last_error);
            let codec = self.codec.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[{}] {}", codec, line);
                    if let Ok(mut guard) = last_error.lock() {
                        *guard = Some(line);
                    }
                }
            });
        }

        log::info!(
            "encoder worker started: {} ({}x{} @ {}fps, {}kbps)",
            self.codec,
            self.options.width,
            self.options.height,
            self.options.frame_rate,
            self.options.bitrate_kbps
        );
        Ok(WorkerProcess {
            child,
            stdin,
            output: rx,
            last_error,
            input,
        })
    }

    fn exit_error(process: &mut WorkerProcess, status: Option<ExitStatus>) -> EncodeError {
        let detail = process
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        match status {
            Some(status) => EncodeError::Fatal(anyhow::anyhow!(
                "encoder worker exited with {}: {}",
                status,
                detail
            )),
            None => EncodeError::Fatal(anyhow::anyhow!("encoder worker output closed: {}", detail)),
        }
    }

    async fn encode_inner(&mut self, frame: RawFrame) -> Result<Option<EncodedChunk>, EncodeError> {
        let input = InputKind::of(&frame);
        if let Some(process) = &self.process {
            if process.input != input {
                // Capture layout changed mid-stream; start over with the new input.
                self.stop_inner().await;
            }
        }
        if self.process.is_none() {
            self.process = Some(self.spawn(input).map_err(EncodeError::Fatal)?);
        }
        let frame_timeout = self.frame_timeout;
        let bitstream = self.strategy.bitstream();
        let Some(process) = self.process.as_mut() else {
            return Err(EncodeError::Fatal(anyhow::anyhow!("encoder worker missing")));
        };

        let payload = match &frame.payload {
            FramePayload::Jpeg(data) | FramePayload::Rgb24(data) => data.clone(),
        };
        let write = async {
            process.stdin.write_all(&payload).await?;
            process.stdin.flush().await
        };
        if let Err(e) = write.await {
            let status = process.child.try_wait().ok().flatten();
            log::warn!("encoder worker stdin write failed: {}", e);
            return Err(Self::exit_error(process, status));
        }

        let first = match tokio::time::timeout(frame_timeout, process.output.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                let status = process.child.wait().await.ok();
                return Err(Self::exit_error(process, status));
            }
            Err(_) => {
                if let Ok(Some(status)) = process.child.try_wait() {
                    return Err(Self::exit_error(process, Some(status)));
                }
                return Ok(None);
            }
        };

        let mut data = bytes::BytesMut::from(&first[..]);
        while let Ok(more) = process.output.try_recv() {
            data.extend_from_slice(&more);
        }
        let mut data = data.freeze();
        if bitstream != Bitstream::Jpeg && !data.is_empty() && !is_annexb_packet(&data) {
            data = convert_avcc_to_annexb(&data);
        }
        let is_key = contains_keyframe(bitstream, &data);
        Ok(Some(EncodedChunk { data, is_key }))
    }

    async fn stop_inner(&mut self) {
        if let Some(mut process) = self.process.take() {
            drop(process.stdin);
            if let Err(e) = process.child.kill().await {
                log::debug!("encoder worker kill: {}", e);
            }
            log::info!("encoder worker stopped: {}", self.codec);
        }
    }
}

impl EncodeStrategy for ProcessEncoder {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn encode(&mut self, frame: RawFrame) -> BoxFuture<'_, Result<Option<EncodedChunk>, EncodeError>> {
        Box::pin(self.encode_inner(frame))
    }

    fn update_options(&mut self, options: &EncoderOptions) -> bool {
        if *options == self.options {
            return true;
        }
        self.options = options.clone();
        // ffmpeg cannot retune a running encode; the next frame respawns it.
        self.process.is_none()
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }
}

// ============================================================================
// In-process intra-only encoder
// ============================================================================

/// Last-resort encoder: every frame becomes a JPEG still.
/// Compressed input is passed through untouched.
pub struct JpegEncoder {
    options: EncoderOptions,
}

impl JpegEncoder {
    pub fn new(options: EncoderOptions) -> Self {
        Self { options }
    }

    /// Maps the bitrate budget onto a JPEG quality.
    pub fn quality(&self) -> u8 {
        let o = &self.options;
        let pixels_per_sec = o.width as f64 * o.height as f64 * o.frame_rate.max(1) as f64;
        if pixels_per_sec <= 0.0 {
            return 75;
        }
        let bpp = o.bitrate_kbps as f64 * 1000.0 / pixels_per_sec;
        (30.0 + bpp * 400.0).clamp(20.0, 90.0) as u8
    }
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> anyhow::Result<Bytes> {
    if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
        anyhow::bail!("invalid frame size {}x{}", width, height);
    }
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        anyhow::bail!("rgb24 frame has {} bytes, expected {}", rgb.len(), expected);
    }
    let mut out = Vec::with_capacity(expected / 8);
    let encoder = jpeg_encoder::Encoder::new(&mut out, quality);
    encoder
        .encode(rgb, width as u16, height as u16, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| anyhow::anyhow!("jpeg encode: {}", e))?;
    Ok(Bytes::from(out))
}

impl EncodeStrategy for JpegEncoder {
    fn strategy(&self) -> Strategy {
        Strategy::Jpeg
    }

    fn encode(&mut self, frame: RawFrame) -> BoxFuture<'_, Result<Option<EncodedChunk>, EncodeError>> {
        let quality = self.quality();
        Box::pin(async move {
            let data = match frame.payload {
                FramePayload::Jpeg(data) => data,
                FramePayload::Rgb24(rgb) => {
                    let (w, h) = (frame.width, frame.height);
                    tokio::task::spawn_blocking(move || encode_jpeg(&rgb, w, h, quality))
                        .await
                        .map_err(|e| EncodeError::Fatal(anyhow::anyhow!("jpeg task: {}", e)))?
                        .map_err(EncodeError::Frame)?
                }
            };
            Ok(Some(EncodedChunk { data, is_key: true }))
        })
    }

    fn update_options(&mut self, options: &EncoderOptions) -> bool {
        self.options = options.clone();
        true
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EncoderOptions {
        EncoderOptions {
            width: 64,
            height: 48,
            frame_rate: 30,
            bitrate_kbps: 500,
            keyframe_interval: 60,
        }
    }

    #[test]
    fn test_chain_order() {
        let chain = Strategy::DEFAULT_CHAIN;
        assert!(chain[0].is_hardware() && chain[1].is_hardware());
        assert!(!chain[2].is_hardware());
        assert_eq!(chain[4], Strategy::Jpeg);
        assert_eq!(chain[0].bitstream(), Bitstream::Hevc);
        assert_eq!(chain[3].software_encoder(), Some("libx264"));
    }

    #[test]
    fn test_encoder_update_apply() {
        let mut o = options();
        let unchanged = EncoderUpdate {
            bitrate_kbps: Some(500),
            ..Default::default()
        };
        assert!(!unchanged.apply(&mut o));
        let changed = EncoderUpdate {
            bitrate_kbps: Some(800),
            frame_rate: Some(20),
            ..Default::default()
        };
        assert!(changed.apply(&mut o));
        assert_eq!(o.bitrate_kbps, 800);
        assert_eq!(o.frame_rate, 20);
    }

    #[test]
    fn test_process_args_for_libx264() {
        let enc = ProcessEncoder::new(
            Strategy::SoftwareH264,
            "ffmpeg",
            "libx264",
            options(),
            Duration::from_millis(50),
        );
        let args = enc.build_args(InputKind::Rgb24 {
            width: 64,
            height: 48,
        });
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 64x48"));
        assert!(joined.contains("-c:v libx264 -b:v 500k"));
        assert!(joined.ends_with("-f h264 pipe:1"));
    }

    #[tokio::test]
    async fn test_jpeg_encoder_encodes_rgb() -> anyhow::Result<()> {
        let mut enc = JpegEncoder::new(options());
        let rgb = vec![128u8; 64 * 48 * 3];
        let chunk = enc
            .encode(RawFrame::rgb24(rgb, 64, 48))
            .await?
            .expect("jpeg always produces output");
        assert!(chunk.is_key);
        // SOI marker
        assert_eq!(&chunk.data[..2], &[0xff, 0xd8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_jpeg_encoder_rejects_short_frame() {
        let mut enc = JpegEncoder::new(options());
        let res = enc.encode(RawFrame::rgb24(vec![0u8; 10], 64, 48)).await;
        assert!(matches!(res, Err(EncodeError::Frame(_))));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_fatal() {
        let mut enc = ProcessEncoder::new(
            Strategy::SoftwareH264,
            "/nonexistent/ffmpeg",
            "libx264",
            options(),
            Duration::from_millis(50),
        );
        let res = enc.encode(RawFrame::rgb24(vec![0u8; 64 * 48 * 3], 64, 48)).await;
        assert!(matches!(res, Err(EncodeError::Fatal(_))));
    }
}
