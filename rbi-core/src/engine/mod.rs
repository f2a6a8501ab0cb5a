//! Browser engine capability.
//!
//! The pool drives engines only through these traits. Frames leave a page
//! through the receiver returned by [`BrowserPage::start_capture`]; the
//! receiver ending means the page went away.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, EngineKind};
use crate::types::{CaptureOptions, RawFrame, Viewport};

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod synthetic;

pub use synthetic::SyntheticEngine;

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub executable: Option<String>,
    pub headless: bool,
    pub viewport: Viewport,
}

impl LaunchOptions {
    pub fn from_config(config: &EngineConfig, viewport: Viewport) -> Self {
        Self {
            executable: config.executable.clone(),
            headless: config.headless,
            viewport,
        }
    }
}

pub trait BrowserEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn launch<'a>(
        &'a self,
        options: &'a LaunchOptions,
    ) -> BoxFuture<'a, anyhow::Result<Arc<dyn BrowserInstance>>>;
}

pub trait BrowserInstance: Send + Sync {
    fn new_page(&self, viewport: Viewport) -> BoxFuture<'_, anyhow::Result<Arc<dyn BrowserPage>>>;

    fn is_connected(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub trait BrowserPage: Send + Sync {
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn start_capture(
        &self,
        options: CaptureOptions,
    ) -> BoxFuture<'_, anyhow::Result<mpsc::Receiver<RawFrame>>>;

    fn stop_capture(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Engine selected by configuration.
pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn BrowserEngine>> {
    match config.kind {
        EngineKind::Synthetic => Ok(Arc::new(SyntheticEngine::new(config.synthetic_frame_rate))),
        #[cfg(feature = "chromium")]
        EngineKind::Chromium => Ok(Arc::new(chromium::ChromiumEngine::new())),
        #[cfg(not(feature = "chromium"))]
        EngineKind::Chromium => Err(anyhow::anyhow!(
            "engine 'chromium' requested but built without the chromium feature"
        )),
    }
}
