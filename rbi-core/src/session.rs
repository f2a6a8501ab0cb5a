//! In-memory session registry.
//!
//! A session owns a [`PageBinding`] and at most one live stream. Mutating
//! operations on one session are serialized by a per-session async lock;
//! reads go through short std locks and the streams' published snapshots.
//! A reaper task closes sessions whose inactivity TTL ran out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CoreConfig, SessionConfig, StreamDefaults};
use crate::encoder::{EncoderBackend, EncoderTelemetry};
use crate::engine::{self, LaunchOptions};
use crate::error::{RbiError, RbiResult, StreamEndReason};
use crate::hw::EncoderProbe;
use crate::pipeline::{StreamContext, StreamHandle, StreamStats, start_stream};
use crate::pool::{InstancePool, PageBinding, PoolSnapshot};
use crate::strategy::Strategy;
use crate::transport::{self, BroadcastTransport, TransportCapability, ViewerSubscription};
use crate::types::{QualityTuple, StreamLimits, StreamOptions, Viewport};

/// Ended streams remembered per session.
const ENDED_HISTORY: usize = 16;
/// Closed sessions remembered so a repeated close is answered, not rejected.
const CLOSED_HISTORY: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Navigated to right after the page opens
    pub url: Option<String>,
    /// Defaults to the configured stream resolution
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub viewport: Viewport,
    pub page_id: Option<String>,
    pub instance_id: Option<String>,
    pub stream_id: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session: SessionSnapshot,
    pub stream: Option<StreamStats>,
    /// Oldest first
    pub ended_streams: Vec<StreamStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderSummary {
    pub chain: Vec<Strategy>,
    pub initial: Strategy,
    pub probe: EncoderProbe,
    pub encoders: Vec<EncoderTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub sessions: usize,
    pub max_sessions: usize,
    pub active_streams: usize,
    pub transport: TransportCapability,
    pub pool: PoolSnapshot,
    pub encoder: EncoderSummary,
    pub streams: Vec<StreamStats>,
}

#[derive(Clone, Copy)]
struct Activity {
    at: Instant,
    at_utc: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            at_utc: Utc::now(),
        }
    }
}

struct SessionInner {
    activity: Activity,
    stream: Option<StreamHandle>,
    ended: VecDeque<StreamStats>,
    closed: bool,
}

impl SessionInner {
    fn push_ended(&mut self, stats: StreamStats) {
        if self.ended.len() == ENDED_HISTORY {
            self.ended.pop_front();
        }
        self.ended.push_back(stats);
    }

    /// Moves a stream that ended on its own into the history.
    fn collect_ended(&mut self) {
        if self.stream.as_ref().is_some_and(|s| s.is_ended()) {
            if let Some(stream) = self.stream.take() {
                self.push_ended(stream.stats());
            }
        }
    }

    /// Latest of explicit activity and the stream's last output.
    fn last_activity(&self) -> Activity {
        let output = self.stream.as_ref().map(|s| s.stats()).and_then(|stats| {
            Some(Activity {
                at: stats.last_output?,
                at_utc: stats.last_output_at?,
            })
        });
        match output {
            Some(output) if output.at > self.activity.at => output,
            _ => self.activity,
        }
    }
}

struct Session {
    id: String,
    created_at: DateTime<Utc>,
    viewport: Viewport,
    binding: Arc<PageBinding>,
    ops: tokio::sync::Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(viewport: Viewport, binding: Arc<PageBinding>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            viewport,
            binding,
            ops: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SessionInner {
                activity: Activity::now(),
                stream: None,
                ended: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        self.inner().activity = Activity::now();
    }

    fn ensure_open(&self) -> RbiResult<()> {
        if self.inner().closed {
            return Err(RbiError::not_found("session", &self.id));
        }
        Ok(())
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = self.inner().last_activity();
        now.saturating_duration_since(last.at)
    }

    fn snapshot(&self, timeout: Duration) -> SessionSnapshot {
        let inner = self.inner();
        let last = inner.last_activity();
        let live_stream = inner.stream.as_ref().filter(|s| !s.is_ended());
        let status = if inner.closed {
            SessionStatus::Closed
        } else if live_stream.is_some() {
            SessionStatus::Streaming
        } else {
            SessionStatus::Active
        };
        let expires_at = (!timeout.is_zero() && !inner.closed)
            .then(|| chrono::Duration::from_std(timeout).ok())
            .flatten()
            .and_then(|ttl| last.at_utc.checked_add_signed(ttl));
        let surface = self.binding.surface();
        SessionSnapshot {
            id: self.id.clone(),
            status,
            created_at: self.created_at,
            last_activity_at: last.at_utc,
            expires_at,
            viewport: self.viewport,
            page_id: surface.as_ref().map(|s| s.page_id.clone()),
            instance_id: surface.as_ref().map(|s| s.instance_id.clone()),
            stream_id: inner.stream.as_ref().map(|s| s.id().to_string()),
            url: self.binding.url(),
        }
    }

    fn stats(&self, timeout: Duration) -> SessionStats {
        let session = self.snapshot(timeout);
        let inner = self.inner();
        SessionStats {
            session,
            stream: inner.stream.as_ref().map(|s| s.stats()),
            ended_streams: inner.ended.iter().cloned().collect(),
        }
    }

    /// Closes the stream and releases the page. Runs once; later calls only
    /// return the final stats.
    async fn shutdown(&self, pool: &InstancePool, reason: StreamEndReason, timeout: Duration) -> SessionStats {
        let _op = self.ops.lock().await;
        let stream = {
            let mut inner = self.inner();
            if inner.closed {
                None
            } else {
                inner.closed = true;
                inner.stream.take()
            }
        };
        if let Some(stream) = stream {
            let stats = stream.close(reason).await;
            self.inner().push_ended(stats);
        }
        if let Some(surface) = self.binding.take() {
            pool.release_surface(&surface.page_id).await;
            log::info!("session {} closed ({})", self.id, reason);
        }
        self.stats(timeout)
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Slots taken by creations still waiting for a page
    reserved: usize,
    closed: VecDeque<(String, SessionStats)>,
}

/// Holds a session slot while the page is being acquired.
struct Reservation<'a> {
    manager: &'a SessionManager,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, registry: &mut Registry) {
        registry.reserved = registry.reserved.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut registry = self.manager.registry();
            registry.reserved = registry.reserved.saturating_sub(1);
        }
    }
}

pub struct SessionManager {
    config: SessionConfig,
    defaults: StreamDefaults,
    ctx: StreamContext,
    viewers: Option<Arc<BroadcastTransport>>,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Builds the whole core from configuration: engine, pool, probed encoder
    /// backend and transport.
    pub async fn from_config(config: &CoreConfig) -> anyhow::Result<Arc<Self>> {
        let engine = engine::from_config(&config.engine)?;
        let viewport = Viewport {
            width: config.stream.width,
            height: config.stream.height,
        };
        let pool = InstancePool::new(
            config.pool.clone(),
            engine,
            LaunchOptions::from_config(&config.engine, viewport),
        );
        let encoders = Arc::new(EncoderBackend::probe(&config.encoder).await);
        let (transport, viewers) = transport::from_config(&config.transport);
        let ctx = StreamContext {
            pool,
            encoders,
            transport,
            quality: config.quality.clone(),
            drain_policy: config.pool.drain_policy,
            max_consecutive_send_failures: config.transport.max_consecutive_send_failures,
        };
        Ok(Self::new(config, ctx, viewers))
    }

    /// Wires a manager onto existing collaborators and starts its reaper.
    pub fn new(config: &CoreConfig, ctx: StreamContext, viewers: Option<Arc<BroadcastTransport>>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config: config.session.clone(),
            defaults: config.stream.clone(),
            ctx,
            viewers,
            registry: Mutex::new(Registry::default()),
            cancel: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&manager);
        let interval = manager.config.reap_interval();
        let cancel = manager.cancel.clone();
        tokio::spawn(async move { reap_loop(weak, interval, cancel).await });
        log::info!(
            "session manager: max {} sessions, ttl {:?}",
            manager.config.max_sessions,
            manager.config.timeout()
        );
        manager
    }

    pub fn pool(&self) -> &InstancePool {
        &self.ctx.pool
    }

    pub fn encoders(&self) -> &Arc<EncoderBackend> {
        &self.ctx.encoders
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, id: &str) -> RbiResult<Arc<Session>> {
        self.registry()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| RbiError::not_found("session", id))
    }

    fn limits(&self) -> StreamLimits {
        self.defaults.limits(&self.ctx.quality)
    }

    fn reserve(&self) -> RbiResult<Reservation<'_>> {
        let mut registry = self.registry();
        if registry.sessions.len() + registry.reserved >= self.config.max_sessions {
            return Err(RbiError::ResourceExhausted(format!(
                "{} sessions live",
                self.config.max_sessions
            )));
        }
        registry.reserved += 1;
        Ok(Reservation {
            manager: self,
            armed: true,
        })
    }

    pub async fn create_session(&self, options: SessionOptions) -> RbiResult<SessionSnapshot> {
        let viewport = options.viewport.unwrap_or(Viewport {
            width: self.defaults.width,
            height: self.defaults.height,
        });
        if viewport.width == 0 || viewport.height == 0 {
            return Err(RbiError::InvalidArgument("viewport must be non-zero".into()));
        }
        let limits = self.limits();
        if viewport.width > limits.max_width || viewport.height > limits.max_height {
            return Err(RbiError::InvalidArgument(format!(
                "viewport exceeds {}x{}",
                limits.max_width, limits.max_height
            )));
        }
        if options.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(RbiError::InvalidArgument("url must not be empty".into()));
        }

        let reservation = self.reserve()?;
        let surface = self.ctx.pool.acquire_surface(viewport).await?;
        if let Some(url) = options.url.as_deref() {
            if let Err(e) = surface.page().navigate(url).await {
                self.ctx.pool.release_surface(&surface.page_id).await;
                return Err(RbiError::backend(e));
            }
        }
        let binding = Arc::new(PageBinding::new(surface));
        if let Some(url) = options.url.as_deref() {
            binding.set_url(url);
        }
        let session = Arc::new(Session::new(viewport, binding));
        let snapshot = session.snapshot(self.config.timeout());

        let mut registry = self.registry();
        reservation.commit(&mut registry);
        registry.sessions.insert(session.id.clone(), Arc::clone(&session));
        log::info!(
            "session {} created on page {:?} ({} live)",
            session.id,
            snapshot.page_id,
            registry.sessions.len()
        );
        Ok(snapshot)
    }

    pub fn get_session(&self, id: &str) -> RbiResult<SessionSnapshot> {
        Ok(self.session(id)?.snapshot(self.config.timeout()))
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<_> = self.registry().sessions.values().cloned().collect();
        sessions
            .iter()
            .map(|s| s.snapshot(self.config.timeout()))
            .collect()
    }

    /// Pushes the expiry out by one TTL.
    pub fn refresh_session(&self, id: &str) -> RbiResult<SessionSnapshot> {
        let session = self.session(id)?;
        session.ensure_open()?;
        session.touch();
        Ok(session.snapshot(self.config.timeout()))
    }

    /// Closes the stream (reason `closed`) and releases the page. Closing a
    /// session that was closed recently returns its final stats again.
    pub async fn close_session(&self, id: &str) -> RbiResult<SessionStats> {
        if let Some(stats) = self.remove_and_close(id, StreamEndReason::Closed).await {
            return Ok(stats);
        }
        self.registry()
            .closed
            .iter()
            .find(|(closed_id, _)| closed_id == id)
            .map(|(_, stats)| stats.clone())
            .ok_or_else(|| RbiError::not_found("session", id))
    }

    async fn remove_and_close(&self, id: &str, reason: StreamEndReason) -> Option<SessionStats> {
        let session = self.registry().sessions.remove(id)?;
        let stats = session
            .shutdown(&self.ctx.pool, reason, self.config.timeout())
            .await;
        let mut registry = self.registry();
        if registry.closed.len() == CLOSED_HISTORY {
            registry.closed.pop_front();
        }
        registry.closed.push_back((id.to_string(), stats.clone()));
        Some(stats)
    }

    pub async fn navigate_session(&self, id: &str, url: &str) -> RbiResult<SessionSnapshot> {
        if url.trim().is_empty() {
            return Err(RbiError::InvalidArgument("url must not be empty".into()));
        }
        let session = self.session(id)?;
        let _op = session.ops.lock().await;
        session.ensure_open()?;
        let surface = session.binding.ensure(&self.ctx.pool).await?;
        surface
            .page()
            .navigate(url)
            .await
            .map_err(RbiError::backend)?;
        session.binding.set_url(url);
        session.touch();
        log::info!("session {} navigated to {}", id, url);
        Ok(session.snapshot(self.config.timeout()))
    }

    pub async fn create_stream(&self, session_id: &str, options: StreamOptions) -> RbiResult<StreamStats> {
        options.validate_within(&self.limits())?;
        let session = self.session(session_id)?;
        let _op = session.ops.lock().await;
        session.ensure_open()?;
        {
            let mut inner = session.inner();
            inner.collect_ended();
            if inner.stream.is_some() {
                return Err(RbiError::InvalidArgument(format!(
                    "session {} already has a live stream",
                    session_id
                )));
            }
        }

        let quality = self.defaults.resolve(&options, &self.ctx.quality);
        let handle = start_stream(
            self.ctx.clone(),
            &session.id,
            Arc::clone(&session.binding),
            quality,
            &options,
        )
        .await?;
        let stats = handle.stats();
        let mut inner = session.inner();
        inner.stream = Some(handle);
        inner.activity = Activity::now();
        Ok(stats)
    }

    /// Stops the live stream. `None` when there was none.
    pub async fn close_stream(&self, session_id: &str) -> RbiResult<Option<StreamStats>> {
        let session = self.session(session_id)?;
        let _op = session.ops.lock().await;
        session.ensure_open()?;
        let Some(stream) = session.inner().stream.take() else {
            return Ok(None);
        };
        let stats = stream.close(StreamEndReason::Closed).await;
        let mut inner = session.inner();
        inner.push_ended(stats.clone());
        inner.activity = Activity::now();
        Ok(Some(stats))
    }

    pub async fn update_stream_options(&self, session_id: &str, options: StreamOptions) -> RbiResult<QualityTuple> {
        options.validate_within(&self.limits())?;
        let session = self.session(session_id)?;
        let _op = session.ops.lock().await;
        session.ensure_open()?;
        let stream = {
            let mut inner = session.inner();
            inner.collect_ended();
            inner.stream.clone()
        }
        .ok_or_else(|| RbiError::not_found("stream", session_id))?;
        let quality = stream.update_options(options).await?;
        session.touch();
        Ok(quality)
    }

    /// Live stream stats, or the last ended stream's final stats.
    pub fn get_stream_stats(&self, session_id: &str) -> RbiResult<StreamStats> {
        let session = self.session(session_id)?;
        let inner = session.inner();
        inner
            .stream
            .as_ref()
            .map(|s| s.stats())
            .or_else(|| inner.ended.back().cloned())
            .ok_or_else(|| RbiError::not_found("stream", session_id))
    }

    pub fn get_session_stats(&self, session_id: &str) -> RbiResult<SessionStats> {
        Ok(self.session(session_id)?.stats(self.config.timeout()))
    }

    pub async fn aggregate_stats(&self) -> RbiResult<AggregateStats> {
        let pool = self.ctx.pool.snapshot().await?;
        let sessions: Vec<_> = self.registry().sessions.values().cloned().collect();
        let streams: Vec<StreamStats> = sessions
            .iter()
            .filter_map(|s| s.inner().stream.as_ref().map(|h| h.stats()))
            .collect();
        let encoders = &self.ctx.encoders;
        Ok(AggregateStats {
            sessions: sessions.len(),
            max_sessions: self.config.max_sessions,
            active_streams: streams.iter().filter(|s| s.end_reason.is_none()).count(),
            transport: self.ctx.transport.capability(),
            pool,
            encoder: EncoderSummary {
                chain: encoders.chain().to_vec(),
                initial: encoders.initial_strategy(),
                probe: encoders.probe_result().clone(),
                encoders: encoders.list(),
            },
            streams,
        })
    }

    /// Attaches a viewer to the live stream of a session.
    pub fn subscribe(&self, session_id: &str) -> RbiResult<ViewerSubscription> {
        let session = self.session(session_id)?;
        session.ensure_open()?;
        let viewers = self
            .viewers
            .as_ref()
            .ok_or_else(|| RbiError::InvalidArgument("transport disabled".into()))?;
        viewers
            .subscribe(session_id)
            .ok_or_else(|| RbiError::not_found("stream", session_id))
    }

    /// Closes every session idle for longer than the TTL and files streams
    /// that ended on their own. Returns how many sessions expired.
    pub async fn reap(&self) -> usize {
        let timeout = self.config.timeout();
        let now = Instant::now();
        let sessions: Vec<_> = self.registry().sessions.values().cloned().collect();
        let mut expired = 0;
        for session in sessions {
            session.inner().collect_ended();
            if timeout.is_zero() || session.idle_for(now) < timeout {
                continue;
            }
            log::info!("session {} idle for {:?}, expiring", session.id, session.idle_for(now));
            if self
                .remove_and_close(&session.id, StreamEndReason::Expired)
                .await
                .is_some()
            {
                expired += 1;
            }
        }
        expired
    }

    /// Closes all sessions and stops the pool.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<_> = self.registry().sessions.keys().cloned().collect();
        for id in ids {
            self.remove_and_close(&id, StreamEndReason::Closed).await;
        }
        self.ctx.pool.shutdown().await;
        log::info!("session manager stopped");
    }
}

async fn reap_loop(manager: Weak<SessionManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let expired = manager.reap().await;
        if expired > 0 {
            log::debug!("reaper expired {} sessions", expired);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
