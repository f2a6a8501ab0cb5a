//! In-process engine rendering a moving colour-bar pattern, much like
//! ffmpeg's `testsrc`. Used where no real browser is available and by the
//! tests, which drive its failure switches.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{BrowserEngine, BrowserInstance, BrowserPage, LaunchOptions};
use crate::types::{CaptureOptions, RawFrame, Viewport};

const CAPTURE_CHAN_CAP: usize = 4;
const DROP_LOG_INTERVAL: u64 = 100;

/// 75% SMPTE-style bars.
const BARS: [[u8; 3]; 8] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
    [16, 16, 16],
];

#[derive(Default)]
struct Faults {
    fail_launch: AtomicBool,
    fail_new_page: AtomicBool,
    launch_delay_ms: AtomicU64,
    launches: AtomicUsize,
}

pub struct SyntheticEngine {
    frame_interval: Duration,
    faults: Arc<Faults>,
    instances: Mutex<Vec<Arc<SyntheticInstance>>>,
}

impl SyntheticEngine {
    pub fn new(frame_rate: u32) -> Self {
        Self::with_frame_interval(Duration::from_secs(1) / frame_rate.max(1))
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            frame_interval: frame_interval.max(Duration::from_millis(1)),
            faults: Arc::new(Faults::default()),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_launches(&self, fail: bool) {
        self.faults.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_page_opens(&self, fail: bool) {
        self.faults.fail_new_page.store(fail, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        self.faults
            .launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of launch attempts so far.
    pub fn launches(&self) -> usize {
        self.faults.launches.load(Ordering::SeqCst)
    }

    /// Simulates every running browser crashing.
    pub fn disconnect_all(&self) {
        if let Ok(instances) = self.instances.lock() {
            for instance in instances.iter() {
                instance.disconnect();
            }
        }
    }

    pub fn live_instances(&self) -> usize {
        self.instances
            .lock()
            .map(|i| i.iter().filter(|i| i.is_connected()).count())
            .unwrap_or(0)
    }
}

impl BrowserEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn launch<'a>(
        &'a self,
        _options: &'a LaunchOptions,
    ) -> BoxFuture<'a, anyhow::Result<Arc<dyn BrowserInstance>>> {
        Box::pin(async move {
            let attempt = self.faults.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.faults.launch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.faults.fail_launch.load(Ordering::SeqCst) {
                anyhow::bail!("synthetic launch {} failed", attempt);
            }
            let instance = Arc::new(SyntheticInstance {
                connected: AtomicBool::new(true),
                closed: CancellationToken::new(),
                frame_interval: self.frame_interval,
                faults: Arc::clone(&self.faults),
            });
            if let Ok(mut instances) = self.instances.lock() {
                instances.retain(|i| !i.closed.is_cancelled());
                instances.push(Arc::clone(&instance));
            }
            Ok(instance as Arc<dyn BrowserInstance>)
        })
    }
}

struct SyntheticInstance {
    connected: AtomicBool,
    /// Parent of every page token
    closed: CancellationToken,
    frame_interval: Duration,
    faults: Arc<Faults>,
}

impl SyntheticInstance {
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

impl BrowserInstance for SyntheticInstance {
    fn new_page(&self, viewport: Viewport) -> BoxFuture<'_, anyhow::Result<Arc<dyn BrowserPage>>> {
        Box::pin(async move {
            if !self.is_connected() {
                anyhow::bail!("browser disconnected");
            }
            if self.faults.fail_new_page.load(Ordering::SeqCst) {
                anyhow::bail!("synthetic page open failed");
            }
            Ok(Arc::new(SyntheticPage {
                viewport,
                frame_interval: self.frame_interval,
                url: Mutex::new("about:blank".to_string()),
                closed: self.closed.child_token(),
                capture: Mutex::new(None),
            }) as Arc<dyn BrowserPage>)
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.disconnect();
            Ok(())
        })
    }
}

struct SyntheticPage {
    viewport: Viewport,
    frame_interval: Duration,
    url: Mutex<String>,
    closed: CancellationToken,
    capture: Mutex<Option<CancellationToken>>,
}

impl SyntheticPage {
    fn stop_generator(&self) {
        if let Some(token) = self.capture.lock().ok().and_then(|mut c| c.take()) {
            token.cancel();
        }
    }
}

impl BrowserPage for SyntheticPage {
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                anyhow::bail!("page closed");
            }
            if url.starts_with("fail:") {
                anyhow::bail!("navigation to {} failed", url);
            }
            if let Ok(mut current) = self.url.lock() {
                *current = url.to_string();
            }
            Ok(())
        })
    }

    fn start_capture(
        &self,
        options: CaptureOptions,
    ) -> BoxFuture<'_, anyhow::Result<mpsc::Receiver<RawFrame>>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                anyhow::bail!("page closed");
            }
            self.stop_generator();
            let token = self.closed.child_token();
            if let Ok(mut capture) = self.capture.lock() {
                *capture = Some(token.clone());
            }

            let width = if options.width > 0 { options.width } else { self.viewport.width };
            let height = if options.height > 0 { options.height } else { self.viewport.height };
            let interval = self.frame_interval;
            let (tx, rx) = mpsc::channel(CAPTURE_CHAN_CAP);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut index = 0u64;
                let mut dropped = 0u64;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let frame = RawFrame::rgb24(test_pattern(width, height, index), width, height);
                    index += 1;
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped += 1;
                            if dropped % DROP_LOG_INTERVAL == 1 {
                                log::debug!("synthetic capture: consumer behind, {} frames dropped", dropped);
                            }
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            });
            Ok(rx)
        })
    }

    fn stop_capture(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.stop_generator();
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            Ok(())
        })
    }
}

/// Packed RGB colour bars scrolled by `index` pixels.
fn test_pattern(width: u32, height: u32, index: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let mut row = Vec::with_capacity(w * 3);
    for x in 0..w {
        let bar = ((x + index as usize) * BARS.len() / w) % BARS.len();
        row.extend_from_slice(&BARS[bar]);
    }
    let mut out = Vec::with_capacity(w * h * 3);
    for _ in 0..h {
        out.extend_from_slice(&row);
    }
    out
}
