//! Delivery channel boundary.
//!
//! The pipeline only talks to `dyn Transport` and branches on
//! [`Transport::capability`]. `send_frame` never blocks and never errors past
//! this boundary: failures come back as [`SendOutcome::Dropped`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{TransportConfig, TransportMode};
use crate::types::FrameMeta;

/// Weight of one frame in the packet loss estimate.
const LOSS_ALPHA: f64 = 0.05;
/// Log skipped sends once every N frames.
const SKIP_LOG_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportCapability {
    Full,
    /// Channels open but never deliver
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
    /// Degraded transport, nothing was attempted
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Per-viewer backlog override, in frames
    pub buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    /// None until a viewer reported one
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// Estimated fraction of frames viewers missed, None before any delivery
    pub packet_loss: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub viewers: usize,
}

/// Handle to one open channel. Carries the signal the transport fires when it
/// closes the channel for good.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: String,
    pub session_id: String,
    closed: CancellationToken,
}

impl ChannelHandle {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            closed: CancellationToken::new(),
        }
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub trait Transport: Send + Sync {
    fn capability(&self) -> TransportCapability;

    fn open_channel<'a>(
        &'a self,
        session_id: &'a str,
        options: ChannelOptions,
    ) -> BoxFuture<'a, anyhow::Result<ChannelHandle>>;

    fn send_frame(&self, channel: &ChannelHandle, data: Bytes, meta: FrameMeta) -> SendOutcome;

    fn channel_stats(&self, channel: &ChannelHandle) -> ChannelStats;

    /// Idempotent.
    fn close_channel(&self, channel: &ChannelHandle);
}

/// Builds the process transport from configuration. The broadcast transport
/// is also returned concretely so viewers can attach to it.
pub fn from_config(config: &TransportConfig) -> (Arc<dyn Transport>, Option<Arc<BroadcastTransport>>) {
    match config.mode {
        TransportMode::Broadcast => {
            let broadcast = Arc::new(BroadcastTransport::new(config.viewer_buffer));
            let transport: Arc<dyn Transport> = broadcast.clone();
            (transport, Some(broadcast))
        }
        TransportMode::Disabled => {
            log::warn!("transport disabled, streams run without delivery");
            let transport: Arc<dyn Transport> = Arc::new(DegradedTransport::default());
            (transport, None)
        }
    }
}

// ============================================================================
// Broadcast fan-out
// ============================================================================

/// One encoded frame as seen by viewers.
#[derive(Debug, Clone)]
pub struct ViewerFrame {
    pub meta: FrameMeta,
    pub data: Bytes,
}

#[derive(Default)]
struct ViewerReports {
    rtt_ms: Option<f64>,
    jitter_ms: Option<f64>,
    loss: Option<f64>,
}

struct Channel {
    session_id: String,
    tx: broadcast::Sender<Arc<ViewerFrame>>,
    handle: ChannelHandle,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    reports: Mutex<ViewerReports>,
}

impl Channel {
    /// Updates the loss estimate with `lost` misses followed by one delivered frame.
    fn record_delivery(&self, lost: u64) {
        let Ok(mut reports) = self.reports.lock() else {
            return;
        };
        let mut loss = reports.loss.unwrap_or(0.0);
        for _ in 0..lost.min(1000) {
            loss += LOSS_ALPHA * (1.0 - loss);
        }
        loss *= 1.0 - LOSS_ALPHA;
        reports.loss = Some(loss);
    }
}

/// Fans encoded frames out to any number of viewers over bounded broadcast
/// queues. A viewer that falls behind skips ahead and the skipped frames
/// count as packet loss.
pub struct BroadcastTransport {
    viewer_buffer: usize,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl BroadcastTransport {
    pub fn new(viewer_buffer: usize) -> Self {
        Self {
            viewer_buffer: viewer_buffer.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().ok()?.get(id).cloned()
    }

    /// Attaches a viewer to the open channel of a session.
    pub fn subscribe(&self, session_id: &str) -> Option<ViewerSubscription> {
        let channels = self.channels.lock().ok()?;
        let channel = channels
            .values()
            .find(|c| c.session_id == session_id && !c.handle.is_closed())?;
        log::info!(
            "viewer attached to channel {} (session {})",
            channel.handle.id,
            session_id
        );
        Some(ViewerSubscription {
            rx: channel.tx.subscribe(),
            channel: Arc::clone(channel),
        })
    }
}

impl Transport for BroadcastTransport {
    fn capability(&self) -> TransportCapability {
        TransportCapability::Full
    }

    fn open_channel<'a>(
        &'a self,
        session_id: &'a str,
        options: ChannelOptions,
    ) -> BoxFuture<'a, anyhow::Result<ChannelHandle>> {
        Box::pin(async move {
            let buffer = options.buffer.unwrap_or(self.viewer_buffer).max(1);
            let (tx, _) = broadcast::channel(buffer);
            let handle = ChannelHandle::new(uuid::Uuid::new_v4().to_string(), session_id);
            let channel = Arc::new(Channel {
                session_id: session_id.to_string(),
                tx,
                handle: handle.clone(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                reports: Mutex::new(ViewerReports::default()),
            });
            self.channels
                .lock()
                .map_err(|_| anyhow::anyhow!("channel registry poisoned"))?
                .insert(handle.id.clone(), channel);
            log::info!("channel {} opened for session {}", handle.id, session_id);
            Ok(handle)
        })
    }

    fn send_frame(&self, channel: &ChannelHandle, data: Bytes, meta: FrameMeta) -> SendOutcome {
        if channel.is_closed() {
            return SendOutcome::Dropped;
        }
        let Some(ch) = self.channel(&channel.id) else {
            return SendOutcome::Dropped;
        };
        let len = data.len() as u64;
        // Err only means nobody is watching right now.
        let _ = ch.tx.send(Arc::new(ViewerFrame { meta, data }));
        ch.bytes_sent.fetch_add(len, Ordering::Relaxed);
        ch.frames_sent.fetch_add(1, Ordering::Relaxed);
        SendOutcome::Sent
    }

    fn channel_stats(&self, channel: &ChannelHandle) -> ChannelStats {
        let Some(ch) = self.channel(&channel.id) else {
            return ChannelStats::default();
        };
        let (rtt, jitter, loss) = match ch.reports.lock() {
            Ok(r) => (r.rtt_ms, r.jitter_ms, r.loss),
            Err(_) => (None, None, None),
        };
        ChannelStats {
            round_trip_time_ms: rtt,
            jitter_ms: jitter,
            packet_loss: loss,
            bytes_sent: ch.bytes_sent.load(Ordering::Relaxed),
            bytes_received: ch.bytes_received.load(Ordering::Relaxed),
            frames_sent: ch.frames_sent.load(Ordering::Relaxed),
            viewers: ch.tx.receiver_count(),
        }
    }

    fn close_channel(&self, channel: &ChannelHandle) {
        let removed = self
            .channels
            .lock()
            .ok()
            .and_then(|mut c| c.remove(&channel.id));
        channel.closed.cancel();
        if removed.is_some() {
            log::info!("channel {} closed", channel.id);
        }
    }
}

/// Viewer side of a broadcast channel.
pub struct ViewerSubscription {
    rx: broadcast::Receiver<Arc<ViewerFrame>>,
    channel: Arc<Channel>,
}

impl std::fmt::Debug for ViewerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSubscription")
            .field("channel_id", &self.channel.handle.id)
            .field("session_id", &self.channel.session_id)
            .finish()
    }
}

impl ViewerSubscription {
    pub fn channel_id(&self) -> &str {
        &self.channel.handle.id
    }

    /// Next frame for this viewer; None once the channel closed.
    pub async fn recv(&mut self) -> Option<Arc<ViewerFrame>> {
        let closed = self.channel.handle.closed.clone();
        let mut lost = 0u64;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => return None,
                next = self.rx.recv() => next,
            };
            match next {
                Ok(frame) => {
                    self.channel.record_delivery(lost);
                    return Some(frame);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("viewer on channel {} lagged by {} frames", self.channel.handle.id, n);
                    lost += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Network figures measured by the viewer.
    pub fn report(&self, rtt_ms: Option<f64>, jitter_ms: Option<f64>) {
        if let Ok(mut reports) = self.channel.reports.lock() {
            if let Some(rtt) = rtt_ms.filter(|v| v.is_finite() && *v >= 0.0) {
                reports.rtt_ms = Some(rtt);
            }
            if let Some(jitter) = jitter_ms.filter(|v| v.is_finite() && *v >= 0.0) {
                reports.jitter_ms = Some(jitter);
            }
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.channel
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// Degraded no-op
// ============================================================================

/// Stand-in when no delivery channel is available. Streams keep running, the
/// output goes nowhere.
#[derive(Default)]
pub struct DegradedTransport {
    skipped: AtomicU64,
}

impl Transport for DegradedTransport {
    fn capability(&self) -> TransportCapability {
        TransportCapability::Degraded
    }

    fn open_channel<'a>(
        &'a self,
        session_id: &'a str,
        _options: ChannelOptions,
    ) -> BoxFuture<'a, anyhow::Result<ChannelHandle>> {
        Box::pin(async move {
            log::warn!("session {}: degraded transport, frames will not be delivered", session_id);
            Ok(ChannelHandle::new(uuid::Uuid::new_v4().to_string(), session_id))
        })
    }

    fn send_frame(&self, channel: &ChannelHandle, _data: Bytes, _meta: FrameMeta) -> SendOutcome {
        let n = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        if n % SKIP_LOG_INTERVAL == 1 {
            log::debug!(
                "degraded transport: skipped frame for session {} (total {})",
                channel.session_id,
                n
            );
        }
        SendOutcome::Skipped
    }

    fn channel_stats(&self, _channel: &ChannelHandle) -> ChannelStats {
        ChannelStats::default()
    }

    fn close_channel(&self, channel: &ChannelHandle) {
        channel.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;

    fn meta(sequence: u64) -> FrameMeta {
        FrameMeta {
            sequence,
            is_key: sequence == 0,
            timestamp_ms: sequence * 33,
            strategy: Strategy::Jpeg,
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_viewers() -> anyhow::Result<()> {
        let transport = BroadcastTransport::new(8);
        let handle = transport.open_channel("s1", ChannelOptions::default()).await?;
        let mut viewer = transport.subscribe("s1").expect("viewer");
        let debug = format!("{:?}", viewer);
        assert!(debug.contains(&handle.id) && debug.contains("s1"), "{}", debug);

        assert_eq!(
            transport.send_frame(&handle, Bytes::from_static(b"abc"), meta(0)),
            SendOutcome::Sent
        );
        let frame = viewer.recv().await.expect("frame");
        assert_eq!(frame.meta.sequence, 0);
        assert_eq!(&frame.data[..], b"abc");

        viewer.report(Some(42.0), Some(3.0));
        viewer.record_received(10);
        let stats = transport.channel_stats(&handle);
        assert_eq!(stats.round_trip_time_ms, Some(42.0));
        assert_eq!(stats.jitter_ms, Some(3.0));
        assert_eq!(stats.bytes_sent, 3);
        assert_eq!(stats.bytes_received, 10);
        assert_eq!(stats.viewers, 1);
        assert_eq!(stats.packet_loss, Some(0.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_lagging_viewer_counts_loss() -> anyhow::Result<()> {
        let transport = BroadcastTransport::new(2);
        let handle = transport.open_channel("s1", ChannelOptions::default()).await?;
        let mut viewer = transport.subscribe("s1").expect("viewer");
        for seq in 0..10 {
            transport.send_frame(&handle, Bytes::from_static(b"x"), meta(seq));
        }
        let frame = viewer.recv().await.expect("frame");
        assert!(frame.meta.sequence >= 8);
        let loss = transport.channel_stats(&handle).packet_loss.expect("loss");
        assert!(loss > 0.0 && loss < 1.0, "loss {}", loss);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_fires_signal_and_is_idempotent() -> anyhow::Result<()> {
        let transport = BroadcastTransport::new(4);
        let handle = transport.open_channel("s1", ChannelOptions::default()).await?;
        let mut viewer = transport.subscribe("s1").expect("viewer");

        transport.close_channel(&handle);
        transport.close_channel(&handle);
        assert!(handle.is_closed());
        assert!(viewer.recv().await.is_none());
        assert!(transport.subscribe("s1").is_none());
        assert_eq!(
            transport.send_frame(&handle, Bytes::from_static(b"x"), meta(1)),
            SendOutcome::Dropped
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_degraded_transport_skips() -> anyhow::Result<()> {
        let transport = DegradedTransport::default();
        assert_eq!(transport.capability(), TransportCapability::Degraded);
        let handle = transport.open_channel("s1", ChannelOptions::default()).await?;
        assert_eq!(
            transport.send_frame(&handle, Bytes::from_static(b"x"), meta(0)),
            SendOutcome::Skipped
        );
        assert!(transport.channel_stats(&handle).round_trip_time_ms.is_none());
        Ok(())
    }
}
