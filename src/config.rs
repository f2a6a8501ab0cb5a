use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::Context;
use rbi_core::CoreConfig;
use rbi_core::config::{DrainPolicy, EngineKind, TransportMode};
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "RBI_CONFIG";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbiConfig {
    listen: String,
    #[serde(flatten)]
    core: CoreConfig,
}

impl Default for RbiConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            core: CoreConfig::default(),
        }
    }
}

impl RbiConfig {
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn core(&self) -> &CoreConfig {
        &self.core
    }

    /// Reads the JSON file named by `RBI_CONFIG` (if set), then the `RBI_*`
    /// overrides from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read config file {}", path))?;
                Self::from_json(&raw).with_context(|| format!("parse config file {}", path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Applies `RBI_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let core = &mut self.core;
        if let Some(listen) = lookup("RBI_LISTEN") {
            self.listen = listen;
        }
        override_parsed(&lookup, "RBI_MAX_SESSIONS", &mut core.session.max_sessions)?;
        override_parsed(&lookup, "RBI_SESSION_TIMEOUT_SECS", &mut core.session.timeout_secs)?;
        override_parsed(&lookup, "RBI_MAX_INSTANCES", &mut core.pool.max_instances)?;
        override_parsed(
            &lookup,
            "RBI_MAX_PAGES_PER_INSTANCE",
            &mut core.pool.max_pages_per_instance,
        )?;
        override_parsed(&lookup, "RBI_STREAM_WIDTH", &mut core.stream.width)?;
        override_parsed(&lookup, "RBI_STREAM_HEIGHT", &mut core.stream.height)?;
        override_parsed(&lookup, "RBI_STREAM_FRAME_RATE", &mut core.stream.frame_rate)?;
        override_parsed(&lookup, "RBI_QUALITY_ENABLED", &mut core.quality.enabled)?;
        override_parsed(&lookup, "RBI_PROBE_HARDWARE", &mut core.encoder.probe_hardware)?;
        if let Some(path) = lookup("RBI_FFMPEG") {
            core.encoder.ffmpeg_path = path;
        }
        if let Some(mode) = lookup("RBI_DRAIN_POLICY") {
            core.pool.drain_policy = parse_enum::<DrainPolicy>("RBI_DRAIN_POLICY", &mode)?;
        }
        if let Some(mode) = lookup("RBI_TRANSPORT") {
            core.transport.mode = parse_enum::<TransportMode>("RBI_TRANSPORT", &mode)?;
        }
        if let Some(kind) = lookup("RBI_ENGINE") {
            core.engine.kind = parse_enum::<EngineKind>("RBI_ENGINE", &kind)?;
        }
        if let Some(path) = lookup("RBI_BROWSER") {
            core.engine.executable = Some(path);
        }
        override_parsed(&lookup, "RBI_HEADLESS", &mut core.engine.headless)?;
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw))?;
    }
    Ok(())
}

/// Enum overrides use the same snake_case names as the config file.
fn parse_enum<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
        .with_context(|| format!("invalid {}: {:?}", key, raw))
}

pub fn config() -> &'static RbiConfig {
    static CONFIG: LazyLock<RbiConfig> = LazyLock::new(|| {
        RbiConfig::load().unwrap_or_else(|e| {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
