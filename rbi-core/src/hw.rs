//! Hardware-accelerated encoder discovery.
//!
//! Asks the `ffmpeg` binary for its encoder list once at backend start,
//! confirms each listed hardware encoder with a one-frame test encode and
//! resolves every [`Strategy`] to a concrete encoder name, so that a host
//! without GPU encoders starts on the first software entry of the chain
//! instead of failing through the hardware entries at runtime.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::strategy::Strategy;

const TEST_ENCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hardware encoder candidates, most preferred first.
pub fn hw_encoder_names(codec_name: &str) -> &'static [&'static str] {
    match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    }
}

pub fn is_hw_encoder(name: &str) -> bool {
    name.contains("nvenc")
        || name.contains("vaapi")
        || name.contains("qsv")
        || name.contains("v4l2m2m")
}

/// Result of probing the host for encoders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderProbe {
    /// Whether an `ffmpeg` binary answered at all
    pub ffmpeg_available: bool,
    /// Encoder names reported by ffmpeg
    pub encoders: HashSet<String>,
}

impl EncoderProbe {
    /// Probe result for a host where only in-process encoding is possible.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds a probe from a known encoder list (tests, pinned deployments).
    pub fn with_encoders<I, S>(encoders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ffmpeg_available: true,
            encoders: encoders.into_iter().map(Into::into).collect(),
        }
    }

    /// Runs `ffmpeg -hide_banner -encoders` and collects the encoder names.
    pub async fn run(ffmpeg_path: &str, probe_hardware: bool) -> Self {
        let output = match Command::new(ffmpeg_path)
            .arg("-hide_banner")
            .arg("-encoders")
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                log::warn!(
                    "encoder probe: {} exited with {}, only in-process encoding available",
                    ffmpeg_path,
                    output.status
                );
                return Self::none();
            }
            Err(e) => {
                log::warn!(
                    "encoder probe: {} not runnable ({}), only in-process encoding available",
                    ffmpeg_path,
                    e
                );
                return Self::none();
            }
        };

        let listing = String::from_utf8_lossy(&output.stdout);
        let mut encoders = parse_encoder_list(&listing);
        let listed_hw: Vec<String> = encoders
            .iter()
            .filter(|name| is_hw_encoder(name))
            .cloned()
            .collect();
        for name in listed_hw {
            if !probe_hardware || !test_encode(ffmpeg_path, &name).await {
                encoders.remove(&name);
            }
        }
        log::info!(
            "encoder probe: {} encoders, hardware: {:?}",
            encoders.len(),
            encoders
                .iter()
                .filter(|n| is_hw_encoder(n))
                .collect::<Vec<_>>()
        );
        Self {
            ffmpeg_available: true,
            encoders,
        }
    }

    pub fn has_hardware(&self) -> bool {
        self.encoders.iter().any(|n| is_hw_encoder(n))
    }

    /// Concrete ffmpeg encoder for a strategy, None when unavailable here.
    /// The in-process JPEG strategy has no ffmpeg encoder and maps to "mjpeg" for display.
    pub fn resolve(&self, strategy: Strategy) -> Option<String> {
        match strategy {
            Strategy::Jpeg => Some("mjpeg".to_string()),
            Strategy::SoftwareH264 | Strategy::SoftwareHevc => {
                let name = strategy.software_encoder()?;
                (self.ffmpeg_available && self.encoders.contains(name)).then(|| name.to_string())
            }
            Strategy::HardwareH264 | Strategy::HardwareHevc => {
                let software = strategy.software_encoder()?;
                hw_encoder_names(software)
                    .iter()
                    .find(|name| self.encoders.contains(**name))
                    .map(|name| name.to_string())
            }
        }
    }

    pub fn is_available(&self, strategy: Strategy) -> bool {
        self.resolve(strategy).is_some()
    }

    /// Index of the first usable strategy in `chain`; the last entry when none is.
    pub fn initial_index(&self, chain: &[Strategy]) -> usize {
        chain
            .iter()
            .position(|s| self.is_available(*s))
            .unwrap_or(chain.len().saturating_sub(1))
    }
}

/// Encodes one blank frame with `encoder`. Builds list hardware encoders
/// whether or not a device backs them, so only a successful encode counts.
async fn test_encode(ffmpeg_path: &str, encoder: &str) -> bool {
    let result = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "lavfi", "-i", "nullsrc=s=64x64"])
        .args(["-frames:v", "1", "-c:v", encoder, "-f", "null", "-"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(TEST_ENCODE_TIMEOUT, result).await {
        Ok(Ok(output)) if output.status.success() => true,
        Ok(Ok(output)) => {
            log::info!("encoder probe: {} listed but unusable ({})", encoder, output.status);
            false
        }
        Ok(Err(e)) => {
            log::warn!("encoder probe: test encode with {} failed to run: {}", encoder, e);
            false
        }
        Err(_) => {
            log::warn!("encoder probe: test encode with {} timed out", encoder);
            false
        }
    }
}

/// Parses the table printed by `ffmpeg -encoders`:
/// ```text
///  V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC
/// ```
fn parse_encoder_list(listing: &str) -> HashSet<String> {
    let mut past_header = false;
    let mut out = HashSet::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.starts_with("------") {
            past_header = true;
            continue;
        }
        if !past_header {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if flags.starts_with('V') {
            out.insert(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder
 V....D libx265              libx265 H.265 / HEVC
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(LISTING);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("h264_nvenc"));
        assert!(!encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_resolve_strategies() {
        let probe = EncoderProbe::with_encoders(parse_encoder_list(LISTING));
        assert_eq!(
            probe.resolve(Strategy::HardwareH264).as_deref(),
            Some("h264_nvenc")
        );
        assert_eq!(probe.resolve(Strategy::HardwareHevc), None);
        assert_eq!(
            probe.resolve(Strategy::SoftwareHevc).as_deref(),
            Some("libx265")
        );
        assert!(probe.is_available(Strategy::Jpeg));
        assert!(probe.has_hardware());
    }

    /// Stand-in `ffmpeg` that lists `LISTING` and fails every encode whose
    /// encoder name is not in `working`.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &std::path::Path, working: &[&str]) -> anyhow::Result<String> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        let cases: String = working
            .iter()
            .map(|name| format!("      {}) exit 0 ;;\n", name))
            .collect();
        let script = r#"#!/bin/sh
for arg in "$@"; do
  if [ "$arg" = "-encoders" ]; then
    cat <<'LISTING'
@LISTING@LISTING
    exit 0
  fi
done
prev=""
for arg in "$@"; do
  if [ "$prev" = "-c:v" ]; then
    case "$arg" in
@CASES@      *) exit 1 ;;
    esac
  fi
  prev="$arg"
done
exit 1
"#
        .replace("@LISTING@", LISTING)
        .replace("@CASES@", &cases);
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listed_hardware_without_device_is_dropped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ffmpeg = fake_ffmpeg(dir.path(), &["libx264", "libx265"])?;

        let probe = EncoderProbe::run(&ffmpeg, true).await;
        assert!(probe.ffmpeg_available);
        assert!(probe.encoders.contains("libx264"));
        assert!(!probe.encoders.contains("h264_nvenc"));
        assert!(!probe.has_hardware());
        let chain = Strategy::DEFAULT_CHAIN;
        assert_eq!(chain[probe.initial_index(&chain)], Strategy::SoftwareHevc);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_hardware_is_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ffmpeg = fake_ffmpeg(dir.path(), &["h264_nvenc", "libx264"])?;

        let probe = EncoderProbe::run(&ffmpeg, true).await;
        assert!(probe.encoders.contains("h264_nvenc"));
        let chain = Strategy::DEFAULT_CHAIN;
        assert_eq!(chain[probe.initial_index(&chain)], Strategy::HardwareH264);

        let no_hw = EncoderProbe::run(&ffmpeg, false).await;
        assert!(!no_hw.has_hardware());
        Ok(())
    }

    #[test]
    fn test_initial_index_skips_missing_hardware() {
        let chain = Strategy::DEFAULT_CHAIN;
        let software_only = EncoderProbe::with_encoders(["libx264", "libx265"]);
        assert_eq!(chain[software_only.initial_index(&chain)], Strategy::SoftwareHevc);

        let nothing = EncoderProbe::none();
        assert_eq!(chain[nothing.initial_index(&chain)], Strategy::Jpeg);

        let with_gpu = EncoderProbe::with_encoders(["hevc_vaapi", "libx264"]);
        assert_eq!(chain[with_gpu.initial_index(&chain)], Strategy::HardwareHevc);
    }
}
