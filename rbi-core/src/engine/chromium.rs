//! Headless Chromium over CDP. Frames come from `Page.startScreencast` as
//! JPEG stills; every frame is acknowledged or Chromium stops sending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams,
    StopScreencastParams,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BrowserEngine, BrowserInstance, BrowserPage, LaunchOptions};
use crate::types::{CaptureOptions, RawFrame, Viewport};

const CAPTURE_CHAN_CAP: usize = 4;

#[derive(Default)]
pub struct ChromiumEngine;

impl ChromiumEngine {
    pub fn new() -> Self {
        Self
    }
}

impl BrowserEngine for ChromiumEngine {
    fn name(&self) -> &'static str {
        "chromium"
    }

    fn launch<'a>(
        &'a self,
        options: &'a LaunchOptions,
    ) -> BoxFuture<'a, anyhow::Result<Arc<dyn BrowserInstance>>> {
        Box::pin(async move {
            let mut builder = BrowserConfig::builder()
                .window_size(options.viewport.width, options.viewport.height)
                .arg("--disable-gpu")
                .arg("--no-first-run");
            if !options.headless {
                builder = builder.with_head();
            }
            if let Some(exe) = &options.executable {
                builder = builder.chrome_executable(exe);
            }
            let config = builder.build().map_err(|e| anyhow::anyhow!("browser config: {}", e))?;
            let (browser, mut handler) = Browser::launch(config).await?;

            let connected = Arc::new(AtomicBool::new(true));
            let connected_clone = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        log::warn!("chromium handler error: {}", e);
                        break;
                    }
                }
                connected_clone.store(false, Ordering::SeqCst);
                log::info!("chromium connection closed");
            });

            Ok(Arc::new(ChromiumInstance {
                browser: tokio::sync::Mutex::new(browser),
                connected,
                closed: CancellationToken::new(),
            }) as Arc<dyn BrowserInstance>)
        })
    }
}

struct ChromiumInstance {
    browser: tokio::sync::Mutex<Browser>,
    connected: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl BrowserInstance for ChromiumInstance {
    fn new_page(&self, viewport: Viewport) -> BoxFuture<'_, anyhow::Result<Arc<dyn BrowserPage>>> {
        Box::pin(async move {
            let page = self.browser.lock().await.new_page("about:blank").await?;
            page.execute(SetDeviceMetricsOverrideParams::new(
                viewport.width as i64,
                viewport.height as i64,
                1.0,
                false,
            ))
            .await?;
            Ok(Arc::new(ChromiumPage {
                page,
                closed: self.closed.child_token(),
                capture: Mutex::new(None),
            }) as Arc<dyn BrowserPage>)
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            let mut browser = self.browser.lock().await;
            browser.close().await?;
            browser.wait().await?;
            Ok(())
        })
    }
}

struct ChromiumPage {
    page: Page,
    closed: CancellationToken,
    capture: Mutex<Option<CancellationToken>>,
}

impl BrowserPage for ChromiumPage {
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.page.goto(url).await?;
            Ok(())
        })
    }

    fn start_capture(
        &self,
        options: CaptureOptions,
    ) -> BoxFuture<'_, anyhow::Result<mpsc::Receiver<RawFrame>>> {
        Box::pin(async move {
            if let Some(previous) = self.capture.lock().ok().and_then(|mut c| c.take()) {
                previous.cancel();
            }
            let mut events = self.page.event_listener::<EventScreencastFrame>().await?;
            let params = StartScreencastParams::builder()
                .format(StartScreencastFormat::Jpeg)
                .quality(options.quality as i64)
                .max_width(options.width as i64)
                .max_height(options.height as i64)
                .every_nth_frame(1)
                .build();
            self.page.execute(params).await?;

            let token = self.closed.child_token();
            if let Ok(mut capture) = self.capture.lock() {
                *capture = Some(token.clone());
            }
            let (tx, rx) = mpsc::channel(CAPTURE_CHAN_CAP);
            let page = self.page.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        event = events.next() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    if let Err(e) = page
                        .execute(ScreencastFrameAckParams::new(event.session_id))
                        .await
                    {
                        log::warn!("screencast ack failed: {}", e);
                        break;
                    }
                    let encoded: &str = event.data.as_ref();
                    let data = match BASE64.decode(encoded) {
                        Ok(data) => data,
                        Err(e) => {
                            log::debug!("screencast frame decode: {}", e);
                            continue;
                        }
                    };
                    let frame = RawFrame::jpeg(
                        data,
                        event.metadata.device_width as u32,
                        event.metadata.device_height as u32,
                    );
                    // Screencast frames are already paced by Chromium; a full queue drops.
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(frame) {
                        break;
                    }
                }
            });
            Ok(rx)
        })
    }

    fn stop_capture(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            if let Some(token) = self.capture.lock().ok().and_then(|mut c| c.take()) {
                token.cancel();
            }
            self.page.execute(StopScreencastParams::default()).await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            self.page.clone().close().await?;
            Ok(())
        })
    }
}
