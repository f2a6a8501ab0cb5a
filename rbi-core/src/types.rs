use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{RbiError, RbiResult};
use crate::strategy::Strategy;

/// Bits per pixel per frame used by the default bitrate heuristic.
/// A tunable starting point, the controller clamps whatever comes out of it.
pub const DEFAULT_BITS_PER_PIXEL: f64 = 0.07;

/// Default bitrate for a resolution/frame rate, in kbps.
pub fn default_bitrate_kbps(width: u32, height: u32, frame_rate: u32) -> u32 {
    let bits = width as f64 * height as f64 * frame_rate as f64 * DEFAULT_BITS_PER_PIXEL;
    (bits / 1000.0).round() as u32
}

/// Payload of a captured frame
#[derive(Clone, Debug)]
pub enum FramePayload {
    /// Already compressed still, as delivered by a CDP screencast
    Jpeg(Bytes),
    /// Packed RGB, width * height * 3 bytes
    Rgb24(Bytes),
}

impl FramePayload {
    pub fn len(&self) -> usize {
        match self {
            FramePayload::Jpeg(data) | FramePayload::Rgb24(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One screen update emitted by a page.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub payload: FramePayload,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl RawFrame {
    pub fn jpeg(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            payload: FramePayload::Jpeg(data.into()),
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn rgb24(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            payload: FramePayload::Rgb24(data.into()),
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn with_captured_at(mut self, at: Instant) -> Self {
        self.captured_at = at;
        self
    }
}

impl Display for RawFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "RawFrame {{ {}x{}, {} bytes }}",
            self.width,
            self.height,
            self.payload.len()
        )
    }
}

/// Output of one encode call.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_key: bool,
    pub strategy: Strategy,
    pub latency: Duration,
}

/// Per-frame metadata handed to the transport together with the bitstream.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct FrameMeta {
    /// Acceptance order within the stream, strictly increasing
    pub sequence: u64,
    pub is_key: bool,
    /// Milliseconds since the stream started
    pub timestamp_ms: u64,
    pub strategy: Strategy,
}

/// (width, height, frame rate, bitrate) in effect for a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTuple {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

impl QualityTuple {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

/// Caller-facing stream options. Every field is optional; unset fields fall
/// back to configured defaults on creation and stay untouched on update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    /// Ceiling for the adaptive controller
    pub max_bitrate_kbps: Option<u32>,
    pub max_frame_rate: Option<u32>,
}

impl StreamOptions {
    pub fn validate(&self) -> RbiResult<()> {
        let zero = |v: Option<u32>| v == Some(0);
        if zero(self.width) || zero(self.height) {
            return Err(RbiError::InvalidArgument("resolution must be non-zero".into()));
        }
        if zero(self.frame_rate) || zero(self.max_frame_rate) {
            return Err(RbiError::InvalidArgument("frame rate must be non-zero".into()));
        }
        if zero(self.bitrate_kbps) || zero(self.max_bitrate_kbps) {
            return Err(RbiError::InvalidArgument("bitrate must be non-zero".into()));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the upper bounds in `limits`.
    pub fn validate_within(&self, limits: &StreamLimits) -> RbiResult<()> {
        self.validate()?;
        let over = |v: Option<u32>, max: u32| v.is_some_and(|v| v > max);
        if over(self.width, limits.max_width) || over(self.height, limits.max_height) {
            return Err(RbiError::InvalidArgument(format!(
                "resolution exceeds {}x{}",
                limits.max_width, limits.max_height
            )));
        }
        if over(self.frame_rate, limits.max_frame_rate) || over(self.max_frame_rate, limits.max_frame_rate) {
            return Err(RbiError::InvalidArgument(format!(
                "frame rate exceeds {}",
                limits.max_frame_rate
            )));
        }
        Ok(())
    }

    /// Applies the set fields onto `base`.
    pub fn apply_to(&self, base: QualityTuple) -> QualityTuple {
        QualityTuple {
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            frame_rate: self.frame_rate.unwrap_or(base.frame_rate),
            bitrate_kbps: self.bitrate_kbps.unwrap_or(base.bitrate_kbps),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == StreamOptions::default()
    }
}

/// Largest resolution and frame rate a caller may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
}

/// Viewport a page is created with and captured at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Options for starting raw-frame capture on a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
    /// Upper bound the page should emit at; the pipeline gates anyway
    pub max_frame_rate: u32,
    /// JPEG quality for engines that capture compressed stills
    pub quality: u8,
}

impl CaptureOptions {
    pub fn for_quality(quality: &QualityTuple) -> Self {
        Self {
            width: quality.width,
            height: quality.height,
            max_frame_rate: quality.frame_rate.max(1) * 2,
            quality: 80,
        }
    }
}
