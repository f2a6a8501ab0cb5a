//! Bounded pool of browser instances and their pages.
//!
//! The pool is a single task owning all bookkeeping. Callers talk to it
//! through [`InstancePool`] (command channel + oneshot replies). Anything that
//! touches the engine runs in a spawned task and reports back through the
//! same channel, so the owning task never waits on browser I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::engine::{BrowserEngine, BrowserInstance, BrowserPage, LaunchOptions};
use crate::error::{RbiError, RbiResult};
use crate::types::Viewport;

const COMMAND_CHAN_CAP: usize = 256;
/// Page opens failing back to back mark the instance as unhealthy.
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// Why the pool closed a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceCloseReason {
    Released,
    /// Instance recycled by the health loop
    Drained,
    /// Browser process went away
    InstanceLost,
    /// Instance force-closed or pool shut down
    InstanceClosed,
}

struct SurfaceSignal {
    token: CancellationToken,
    reason: OnceLock<SurfaceCloseReason>,
}

impl SurfaceSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    fn fire(&self, reason: SurfaceCloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }
}

/// A page leased from the pool.
#[derive(Clone)]
pub struct Surface {
    pub page_id: String,
    pub instance_id: String,
    pub viewport: Viewport,
    page: Arc<dyn BrowserPage>,
    signal: Arc<SurfaceSignal>,
}

impl Surface {
    pub fn page(&self) -> &Arc<dyn BrowserPage> {
        &self.page
    }

    /// Fired when the pool closes the page for any reason.
    pub fn closed(&self) -> CancellationToken {
        self.signal.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.signal.token.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<SurfaceCloseReason> {
        self.signal.reason.get().copied()
    }
}

/// The page a session currently works on, shared between the session and its
/// stream. Re-pointed when a closed page is replaced.
pub struct PageBinding {
    viewport: Viewport,
    surface: Mutex<Option<Surface>>,
    url: Mutex<Option<String>>,
    /// Held across `ensure` so concurrent callers share one replacement page.
    rebind: tokio::sync::Mutex<()>,
}

impl PageBinding {
    pub fn new(surface: Surface) -> Self {
        Self {
            viewport: surface.viewport,
            surface: Mutex::new(Some(surface)),
            url: Mutex::new(None),
            rebind: tokio::sync::Mutex::new(()),
        }
    }

    pub fn surface(&self) -> Option<Surface> {
        self.surface.lock().ok()?.clone()
    }

    pub fn url(&self) -> Option<String> {
        self.url.lock().ok()?.clone()
    }

    pub fn set_url(&self, url: &str) {
        if let Ok(mut current) = self.url.lock() {
            *current = Some(url.to_string());
        }
    }

    pub fn take(&self) -> Option<Surface> {
        self.surface.lock().ok()?.take()
    }

    fn replace(&self, surface: Surface) -> Option<Surface> {
        self.surface.lock().ok()?.replace(surface)
    }

    /// Current surface, or a fresh one re-navigated to the last URL when the
    /// pool closed the old page.
    pub async fn ensure(&self, pool: &InstancePool) -> RbiResult<Surface> {
        let _rebind = self.rebind.lock().await;
        if let Some(surface) = self.surface().filter(|s| !s.is_closed()) {
            return Ok(surface);
        }
        let fresh = pool.acquire_surface(self.viewport).await?;
        if let Some(url) = self.url() {
            if let Err(e) = fresh.page().navigate(&url).await {
                pool.release_surface(&fresh.page_id).await;
                return Err(RbiError::backend(e));
            }
        }
        if let Some(old) = self.replace(fresh.clone()) {
            pool.release_surface(&old.page_id).await;
        }
        log::info!("page {} now bound on instance {}", fresh.page_id, fresh.instance_id);
        Ok(fresh)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    /// "launching" or "ready"
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub live_pages: usize,
    pub pending_pages: usize,
    pub lifetime_pages: u64,
    pub failed_page_opens: u64,
    pub failed_health_checks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub engine: &'static str,
    pub instances: usize,
    pub pages: usize,
    pub pending_pages: usize,
    pub max_instances: usize,
    pub max_pages_per_instance: usize,
    pub details: Vec<InstanceSnapshot>,
}

struct PendingPage {
    page_id: String,
    viewport: Viewport,
    reply: oneshot::Sender<RbiResult<Surface>>,
}

enum PoolCommand {
    Acquire {
        viewport: Viewport,
        reply: oneshot::Sender<RbiResult<Surface>>,
    },
    Release {
        page_id: String,
        reply: oneshot::Sender<()>,
    },
    CloseInstance {
        id: String,
        reply: oneshot::Sender<RbiResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Launched {
        instance_id: String,
        result: anyhow::Result<Arc<dyn BrowserInstance>>,
    },
    PageOpened {
        instance_id: String,
        pending: PendingPage,
        result: anyhow::Result<Arc<dyn BrowserPage>>,
    },
}

/// Handle to the pool task. Cheap to clone.
#[derive(Clone)]
pub struct InstancePool {
    tx: mpsc::Sender<PoolCommand>,
    cancel: CancellationToken,
}

impl InstancePool {
    pub fn new(config: PoolConfig, engine: Arc<dyn BrowserEngine>, launch: LaunchOptions) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHAN_CAP);
        let cancel = CancellationToken::new();
        log::info!(
            "instance pool: engine {}, {} instances x {} pages",
            engine.name(),
            config.max_instances,
            config.max_pages_per_instance
        );
        let state = PoolState {
            config,
            engine,
            launch: Arc::new(launch),
            tx: tx.clone(),
            instances: HashMap::new(),
        };
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { state.run(rx, cancel_clone).await });
        Self { tx, cancel }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> RbiResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RbiError::backend(anyhow::anyhow!("instance pool stopped")))?;
        rx.await
            .map_err(|_| RbiError::backend(anyhow::anyhow!("instance pool dropped the request")))
    }

    /// Leases a page on the least-loaded instance, launching one if needed.
    pub async fn acquire_surface(&self, viewport: Viewport) -> RbiResult<Surface> {
        self.request(|reply| PoolCommand::Acquire { viewport, reply })
            .await?
    }

    /// Closes a leased page. Unknown or already released ids are ignored.
    pub async fn release_surface(&self, page_id: &str) {
        let page_id = page_id.to_string();
        if let Err(e) = self
            .request(|reply| PoolCommand::Release { page_id, reply })
            .await
        {
            log::debug!("release_surface: {}", e);
        }
    }

    pub async fn close_instance(&self, id: &str) -> RbiResult<()> {
        let id = id.to_string();
        self.request(|reply| PoolCommand::CloseInstance { id, reply })
            .await?
    }

    pub async fn snapshot(&self) -> RbiResult<PoolSnapshot> {
        self.request(|reply| PoolCommand::Snapshot { reply }).await
    }

    /// Closes every page and instance, then stops the pool task.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| PoolCommand::Shutdown { reply })
            .await
            .is_err()
        {
            self.cancel.cancel();
        }
    }
}

enum InstanceStatus {
    Launching,
    Ready(Arc<dyn BrowserInstance>),
}

struct PageEntry {
    page: Arc<dyn BrowserPage>,
    signal: Arc<SurfaceSignal>,
}

struct InstanceEntry {
    status: InstanceStatus,
    created: Instant,
    created_at: DateTime<Utc>,
    pages: HashMap<String, PageEntry>,
    /// Reservations whose page is still being opened
    pending: usize,
    /// Requests parked until the launch finishes
    waiters: Vec<PendingPage>,
    lifetime_pages: u64,
    failed_page_opens: u64,
    consecutive_page_failures: u32,
    failed_health_checks: u64,
    idle_since: Option<Instant>,
}

impl InstanceEntry {
    fn new() -> Self {
        Self {
            status: InstanceStatus::Launching,
            created: Instant::now(),
            created_at: Utc::now(),
            pages: HashMap::new(),
            pending: 0,
            waiters: Vec::new(),
            lifetime_pages: 0,
            failed_page_opens: 0,
            consecutive_page_failures: 0,
            failed_health_checks: 0,
            idle_since: None,
        }
    }

    fn load(&self) -> usize {
        self.pages.len() + self.pending
    }

    fn is_busy(&self) -> bool {
        self.load() > 0
    }

    fn mark_idle_if_empty(&mut self) {
        if !self.is_busy() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn instance(&self) -> Option<Arc<dyn BrowserInstance>> {
        match &self.status {
            InstanceStatus::Ready(instance) => Some(Arc::clone(instance)),
            InstanceStatus::Launching => None,
        }
    }

    /// Signals every page closed and fails parked requests. Returns what is
    /// left to tear down.
    fn evict(&mut self, reason: SurfaceCloseReason) -> Vec<Arc<dyn BrowserPage>> {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(RbiError::backend(anyhow::anyhow!(
                "instance closed while launching"
            ))));
        }
        self.pages
            .drain()
            .map(|(_, entry)| {
                entry.signal.fire(reason);
                entry.page
            })
            .collect()
    }
}

struct PoolState {
    config: PoolConfig,
    engine: Arc<dyn BrowserEngine>,
    launch: Arc<LaunchOptions>,
    tx: mpsc::Sender<PoolCommand>,
    instances: HashMap<String, InstanceEntry>,
}

impl PoolState {
    async fn run(mut self, mut rx: mpsc::Receiver<PoolCommand>, cancel: CancellationToken) {
        let mut health = tokio::time::interval(self.config.health_interval());
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health.tick().await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = health.tick() => self.health_check(),
                cmd = rx.recv() => match cmd {
                    Some(PoolCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }

        self.close_all().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        log::info!("instance pool stopped");
    }

    fn handle(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Acquire { viewport, reply } => self.acquire(viewport, reply),
            PoolCommand::Release { page_id, reply } => {
                self.release(&page_id);
                let _ = reply.send(());
            }
            PoolCommand::CloseInstance { id, reply } => {
                let _ = reply.send(self.close_instance(&id));
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Launched {
                instance_id,
                result,
            } => self.on_launched(instance_id, result),
            PoolCommand::PageOpened {
                instance_id,
                pending,
                result,
            } => self.on_page_opened(instance_id, pending, result),
            PoolCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn acquire(&mut self, viewport: Viewport, reply: oneshot::Sender<RbiResult<Surface>>) {
        let cap = self.config.max_pages_per_instance;
        let restart_after = self.config.restart_after_pages;
        let candidate = self
            .instances
            .iter()
            .filter(|(_, e)| e.load() < cap)
            .filter(|(_, e)| restart_after == 0 || e.lifetime_pages + (e.pending as u64) < restart_after)
            .min_by_key(|(_, e)| (e.load(), e.instance().is_none(), e.created))
            .map(|(id, _)| id.clone());

        let pending = PendingPage {
            page_id: uuid::Uuid::new_v4().to_string(),
            viewport,
            reply,
        };

        if let Some(id) = candidate {
            if let Some(entry) = self.instances.get_mut(&id) {
                entry.pending += 1;
                entry.idle_since = None;
                match entry.instance() {
                    Some(instance) => self.spawn_open(id, instance, pending),
                    None => entry.waiters.push(pending),
                }
            }
            return;
        }

        if cap == 0 || self.instances.len() >= self.config.max_instances {
            let _ = pending.reply.send(Err(RbiError::ResourceExhausted(format!(
                "pool at capacity ({} instances x {} pages)",
                self.config.max_instances, cap
            ))));
            return;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut entry = InstanceEntry::new();
        entry.pending = 1;
        entry.waiters.push(pending);
        self.instances.insert(id.clone(), entry);
        self.spawn_launch(id);
    }

    fn spawn_launch(&self, instance_id: String) {
        let engine = Arc::clone(&self.engine);
        let options = Arc::clone(&self.launch);
        let tx = self.tx.clone();
        let timeout = self.config.launch_timeout();
        log::info!("launching instance {}", instance_id);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, engine.launch(&options)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("launch timed out after {:?}", timeout)),
            };
            if let Err(mpsc::error::SendError(PoolCommand::Launched {
                result: Ok(instance),
                ..
            })) = tx
                .send(PoolCommand::Launched {
                    instance_id,
                    result,
                })
                .await
            {
                let _ = instance.close().await;
            }
        });
    }

    fn spawn_open(&self, instance_id: String, instance: Arc<dyn BrowserInstance>, pending: PendingPage) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = instance.new_page(pending.viewport).await;
            if let Err(mpsc::error::SendError(PoolCommand::PageOpened {
                result: Ok(page),
                ..
            })) = tx
                .send(PoolCommand::PageOpened {
                    instance_id,
                    pending,
                    result,
                })
                .await
            {
                let _ = page.close().await;
            }
        });
    }

    fn on_launched(&mut self, instance_id: String, result: anyhow::Result<Arc<dyn BrowserInstance>>) {
        let Some(entry) = self.instances.get_mut(&instance_id) else {
            if let Ok(instance) = result {
                log::info!("instance {} launched after removal, closing", instance_id);
                spawn_teardown(instance_id, Vec::new(), Some(instance));
            }
            return;
        };

        match result {
            Ok(instance) => {
                log::info!("instance {} ready", instance_id);
                entry.status = InstanceStatus::Ready(Arc::clone(&instance));
                entry.created = Instant::now();
                let waiters: Vec<_> = entry.waiters.drain(..).collect();
                entry.mark_idle_if_empty();
                for pending in waiters {
                    self.spawn_open(instance_id.clone(), Arc::clone(&instance), pending);
                }
            }
            Err(e) => {
                log::warn!("instance {} launch failed: {:#}", instance_id, e);
                if let Some(mut entry) = self.instances.remove(&instance_id) {
                    let message = format!("{:#}", e);
                    for waiter in entry.waiters.drain(..) {
                        let _ = waiter.reply.send(Err(RbiError::backend(anyhow::anyhow!(
                            "browser launch failed: {}",
                            message
                        ))));
                    }
                }
            }
        }
    }

    fn on_page_opened(
        &mut self,
        instance_id: String,
        pending: PendingPage,
        result: anyhow::Result<Arc<dyn BrowserPage>>,
    ) {
        let Some(entry) = self.instances.get_mut(&instance_id) else {
            if let Ok(page) = result {
                spawn_teardown(instance_id, vec![page], None);
            }
            let _ = pending.reply.send(Err(RbiError::backend(anyhow::anyhow!(
                "instance went away while opening page"
            ))));
            return;
        };
        entry.pending = entry.pending.saturating_sub(1);

        match result {
            Ok(page) => {
                entry.lifetime_pages += 1;
                entry.consecutive_page_failures = 0;
                let signal = Arc::new(SurfaceSignal::new());
                let surface = Surface {
                    page_id: pending.page_id.clone(),
                    instance_id: instance_id.clone(),
                    viewport: pending.viewport,
                    page: Arc::clone(&page),
                    signal: Arc::clone(&signal),
                };
                entry.pages.insert(
                    pending.page_id.clone(),
                    PageEntry {
                        page: Arc::clone(&page),
                        signal,
                    },
                );
                log::debug!(
                    "page {} opened on instance {} ({} live)",
                    pending.page_id,
                    instance_id,
                    entry.pages.len()
                );
                if pending.reply.send(Ok(surface)).is_err() {
                    // caller gave up waiting
                    self.release(&pending.page_id);
                }
            }
            Err(e) => {
                entry.failed_page_opens += 1;
                entry.consecutive_page_failures += 1;
                entry.mark_idle_if_empty();
                log::warn!("page open on instance {} failed: {:#}", instance_id, e);
                let _ = pending.reply.send(Err(RbiError::backend(e)));
            }
        }
    }

    fn release(&mut self, page_id: &str) {
        for (instance_id, entry) in self.instances.iter_mut() {
            if let Some(page) = entry.pages.remove(page_id) {
                page.signal.fire(SurfaceCloseReason::Released);
                entry.mark_idle_if_empty();
                log::debug!("page {} released from instance {}", page_id, instance_id);
                spawn_teardown(instance_id.clone(), vec![page.page], None);
                return;
            }
        }
    }

    fn close_instance(&mut self, id: &str) -> RbiResult<()> {
        let mut entry = self
            .instances
            .remove(id)
            .ok_or_else(|| RbiError::not_found("instance", id))?;
        let pages = entry.evict(SurfaceCloseReason::InstanceClosed);
        log::info!("instance {} closed with {} pages", id, pages.len());
        spawn_teardown(id.to_string(), pages, entry.instance());
        Ok(())
    }

    fn health_check(&mut self) {
        let now = Instant::now();
        let interval = self.config.health_interval();
        let max_age = self.config.max_instance_age();
        let restart_after = self.config.restart_after_pages;

        let mut lost = Vec::new();
        let mut drained = Vec::new();
        let mut idle = Vec::new();
        for (id, entry) in self.instances.iter_mut() {
            let Some(instance) = entry.instance() else {
                continue;
            };
            if !instance.is_connected() || entry.consecutive_page_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
                entry.failed_health_checks += 1;
                lost.push(id.clone());
                continue;
            }
            if entry.pending > 0 {
                continue;
            }
            let worn = restart_after > 0 && entry.lifetime_pages >= restart_after;
            let old = !max_age.is_zero() && now.duration_since(entry.created) >= max_age;
            if worn || old {
                if entry.is_busy() {
                    drained.push(id.clone());
                } else {
                    idle.push(id.clone());
                }
                continue;
            }
            if entry
                .idle_since
                .is_some_and(|since| now.duration_since(since) >= interval)
            {
                idle.push(id.clone());
            }
        }

        for id in lost {
            if let Some(mut entry) = self.instances.remove(&id) {
                let pages = entry.evict(SurfaceCloseReason::InstanceLost);
                log::warn!("instance {} lost, {} pages closed", id, pages.len());
                spawn_teardown(id, pages, entry.instance());
            }
        }
        for id in drained {
            if let Some(mut entry) = self.instances.remove(&id) {
                let pages = entry.evict(SurfaceCloseReason::Drained);
                log::info!(
                    "instance {} drained after {} pages, {} live pages closed",
                    id,
                    entry.lifetime_pages,
                    pages.len()
                );
                spawn_teardown(id, pages, entry.instance());
                if self.instances.len() < self.config.max_instances {
                    let replacement = uuid::Uuid::new_v4().to_string();
                    self.instances.insert(replacement.clone(), InstanceEntry::new());
                    self.spawn_launch(replacement);
                }
            }
        }
        for id in idle {
            if let Some(entry) = self.instances.remove(&id) {
                log::info!("instance {} idle, closing", id);
                spawn_teardown(id, Vec::new(), entry.instance());
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let mut details: Vec<_> = self
            .instances
            .iter()
            .map(|(id, e)| InstanceSnapshot {
                id: id.clone(),
                state: match e.status {
                    InstanceStatus::Launching => "launching",
                    InstanceStatus::Ready(_) => "ready",
                },
                created_at: e.created_at,
                age_secs: now.duration_since(e.created).as_secs(),
                live_pages: e.pages.len(),
                pending_pages: e.pending,
                lifetime_pages: e.lifetime_pages,
                failed_page_opens: e.failed_page_opens,
                failed_health_checks: e.failed_health_checks,
            })
            .collect();
        details.sort_by_key(|d| d.created_at);
        PoolSnapshot {
            engine: self.engine.name(),
            instances: details.len(),
            pages: details.iter().map(|d| d.live_pages).sum(),
            pending_pages: details.iter().map(|d| d.pending_pages).sum(),
            max_instances: self.config.max_instances,
            max_pages_per_instance: self.config.max_pages_per_instance,
            details,
        }
    }

    async fn close_all(&mut self) {
        for (id, mut entry) in self.instances.drain() {
            let pages = entry.evict(SurfaceCloseReason::InstanceClosed);
            close_pages_then_instance(&id, pages, entry.instance()).await;
        }
    }
}

fn spawn_teardown(
    instance_id: String,
    pages: Vec<Arc<dyn BrowserPage>>,
    instance: Option<Arc<dyn BrowserInstance>>,
) {
    tokio::spawn(async move { close_pages_then_instance(&instance_id, pages, instance).await });
}

async fn close_pages_then_instance(
    instance_id: &str,
    pages: Vec<Arc<dyn BrowserPage>>,
    instance: Option<Arc<dyn BrowserInstance>>,
) {
    for page in pages {
        if let Err(e) = page.close().await {
            log::warn!("instance {}: page close failed: {:#}", instance_id, e);
        }
    }
    if let Some(instance) = instance {
        if let Err(e) = instance.close().await {
            log::warn!("instance {}: close failed: {:#}", instance_id, e);
        }
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
