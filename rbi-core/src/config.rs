use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::Strategy;
use crate::types::{QualityTuple, StreamLimits, StreamOptions, default_bitrate_kbps};

/// Everything the core needs, grouped per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub stream: StreamDefaults,
    pub quality: QualityConfig,
    pub encoder: EncoderConfig,
    pub transport: TransportConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Caps session creation
    pub max_sessions: usize,
    /// Inactivity TTL
    pub timeout_secs: u64,
    pub reap_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            timeout_secs: 300,
            reap_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(10))
    }
}

/// What happens to a stream whose page was recycled by the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// End the stream with `page_closed`
    #[default]
    Fail,
    /// Acquire a fresh page, re-navigate and keep streaming
    Rehome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub max_pages_per_instance: usize,
    /// Drain an instance once it has created more pages than this
    pub restart_after_pages: u64,
    pub max_instance_age_secs: u64,
    pub launch_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub drain_policy: DrainPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            max_pages_per_instance: 4,
            restart_after_pages: 100,
            max_instance_age_secs: 3600,
            launch_timeout_ms: 30_000,
            health_interval_ms: 5_000,
            drain_policy: DrainPolicy::Fail,
        }
    }
}

impl PoolConfig {
    pub fn max_instance_age(&self) -> Duration {
        Duration::from_secs(self.max_instance_age_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(10))
    }
}

/// Initial quality of new streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// None = derived from resolution and frame rate
    pub bitrate_kbps: Option<u32>,
    /// Largest stream or viewport size a caller may request
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            bitrate_kbps: None,
            max_width: 3840,
            max_height: 2160,
        }
    }
}

impl StreamDefaults {
    /// Upper bounds for caller-supplied sizes and frame rates.
    pub fn limits(&self, quality: &QualityConfig) -> StreamLimits {
        StreamLimits {
            max_width: self.max_width,
            max_height: self.max_height,
            max_frame_rate: quality.max_frame_rate.max(1),
        }
    }

    /// Initial quality for a stream, with caller options layered on top and
    /// the default frame rate and bitrate clamped into the controller's bounds.
    pub fn resolve(&self, options: &StreamOptions, quality: &QualityConfig) -> QualityTuple {
        let width = options.width.unwrap_or(self.width);
        let height = options.height.unwrap_or(self.height);
        let fps_ceiling = quality.max_frame_rate.max(1);
        let fps_floor = quality.min_frame_rate.clamp(1, fps_ceiling);
        let frame_rate = options
            .frame_rate
            .unwrap_or_else(|| self.frame_rate.clamp(fps_floor, fps_ceiling));
        let bitrate_kbps = options
            .bitrate_kbps
            .or(self.bitrate_kbps)
            .unwrap_or_else(|| default_bitrate_kbps(width, height, frame_rate));
        let ceiling = options.max_bitrate_kbps.unwrap_or(quality.max_bitrate_kbps);
        QualityTuple {
            width,
            height,
            frame_rate,
            bitrate_kbps: bitrate_kbps.clamp(quality.min_bitrate_kbps, ceiling.max(quality.min_bitrate_kbps)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// Rolling window length, in ticks
    pub window_size: usize,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub min_frame_rate: u32,
    pub max_frame_rate: u32,
    pub rtt_fair_ms: f64,
    pub rtt_poor_ms: f64,
    pub jitter_fair_ms: f64,
    pub jitter_poor_ms: f64,
    /// Fraction, 0.0..=1.0
    pub loss_fair: f64,
    pub loss_poor: f64,
    pub encode_fair_ms: f64,
    pub encode_poor_ms: f64,
    pub decrease_factor: f64,
    pub fair_decrease_factor: f64,
    pub increase_factor: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 2_000,
            window_size: 10,
            min_bitrate_kbps: 500,
            max_bitrate_kbps: 8_000,
            min_frame_rate: 10,
            max_frame_rate: 60,
            rtt_fair_ms: 150.0,
            rtt_poor_ms: 300.0,
            jitter_fair_ms: 30.0,
            jitter_poor_ms: 60.0,
            loss_fair: 0.02,
            loss_poor: 0.05,
            encode_fair_ms: 33.0,
            encode_poor_ms: 66.0,
            decrease_factor: 0.6,
            fair_decrease_factor: 0.85,
            increase_factor: 1.1,
        }
    }
}

impl QualityConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub fallback_order: Vec<Strategy>,
    pub ffmpeg_path: String,
    pub probe_hardware: bool,
    /// How long an encode waits for worker output before reporting "buffered"
    pub frame_timeout_ms: u64,
    pub keyframe_interval: u32,
    /// Minimum age of a worker before a rate change may restart it
    pub restart_min_interval_ms: u64,
    /// Smallest relative bitrate/frame-rate change worth a restart
    pub restart_min_change: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            fallback_order: Strategy::DEFAULT_CHAIN.to_vec(),
            ffmpeg_path: "ffmpeg".to_string(),
            probe_hardware: true,
            frame_timeout_ms: 40,
            keyframe_interval: 60,
            restart_min_interval_ms: 5_000,
            restart_min_change: 0.2,
        }
    }
}

impl EncoderConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn restart_min_interval(&self) -> Duration {
        Duration::from_millis(self.restart_min_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Fan encoded frames out to connected viewers
    #[default]
    Broadcast,
    /// Run without a delivery channel
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Per-viewer backlog, in frames
    pub viewer_buffer: usize,
    pub max_consecutive_send_failures: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Broadcast,
            viewer_buffer: 64,
            max_consecutive_send_failures: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Synthetic,
    Chromium,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Browser binary; None = engine default lookup
    pub executable: Option<String>,
    pub headless: bool,
    /// Frame rate of the synthetic engine's pattern generator
    pub synthetic_frame_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Synthetic,
            executable: None,
            headless: true,
            synthetic_frame_rate: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"pool": {"max_instances": 2}, "encoder": {"fallback_order": ["software_h264", "jpeg"]}}"#)
                .unwrap();
        assert_eq!(config.pool.max_instances, 2);
        assert_eq!(config.pool.max_pages_per_instance, 4);
        assert_eq!(
            config.encoder.fallback_order,
            vec![Strategy::SoftwareH264, Strategy::Jpeg]
        );
        assert_eq!(config.session.max_sessions, 16);
    }

    #[test]
    fn test_stream_defaults_resolve_clamps_bitrate() {
        let defaults = StreamDefaults::default();
        let quality = QualityConfig::default();
        let q = defaults.resolve(
            &StreamOptions {
                bitrate_kbps: Some(100),
                ..Default::default()
            },
            &quality,
        );
        assert_eq!(q.bitrate_kbps, quality.min_bitrate_kbps);

        let q = defaults.resolve(&StreamOptions::default(), &quality);
        assert_eq!(q.bitrate_kbps, 1935);
        assert_eq!((q.width, q.height, q.frame_rate), (1280, 720, 30));
    }

    #[test]
    fn test_stream_defaults_clamp_frame_rate() {
        let quality = QualityConfig::default();
        let defaults = StreamDefaults {
            frame_rate: 240,
            ..Default::default()
        };
        let q = defaults.resolve(&StreamOptions::default(), &quality);
        assert_eq!(q.frame_rate, quality.max_frame_rate);

        let defaults = StreamDefaults {
            frame_rate: 1,
            ..Default::default()
        };
        assert_eq!(
            defaults.resolve(&StreamOptions::default(), &quality).frame_rate,
            quality.min_frame_rate
        );

        let limits = StreamDefaults::default().limits(&quality);
        assert_eq!((limits.max_width, limits.max_height, limits.max_frame_rate), (3840, 2160, 60));
    }
}
