//! Per-stream pipeline: capture → gate → encode → transport.
//!
//! ```text
//!  page frames ──► FrameGate ──► [slot: 1 frame, latest wins] ──► encoder worker
//!                    │ early: drop                                   │
//!                    ▼                                               ▼
//!                 counters                          transport.send_frame (seq, key, ts)
//! ```
//!
//! Each stream is one task owning all of its state. Control arrives over an
//! mpsc channel; stats leave through a `watch` snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DrainPolicy, QualityConfig};
use crate::encoder::{EncoderBackend, EncoderEvent, EncoderEvents, EncoderHandle, EncoderTelemetry};
use crate::error::{RbiError, RbiResult, StreamEndReason};
use crate::pool::{InstancePool, PageBinding, Surface, SurfaceCloseReason};
use crate::quality::{QualityController, QualitySample, QualitySnapshot};
use crate::strategy::{EncoderOptions, EncoderUpdate, Strategy};
use crate::transport::{
    ChannelHandle, ChannelOptions, ChannelStats, DegradedTransport, SendOutcome, Transport,
    TransportCapability,
};
use crate::types::{CaptureOptions, EncodedFrame, FrameMeta, QualityTuple, RawFrame, StreamOptions};

const COMMAND_CHAN_CAP: usize = 16;
/// Log gate drops once every N.
const DROP_LOG_INTERVAL: u64 = 100;

/// Admits frames on a fixed cadence of `1 / frame_rate`.
///
/// A frame arriving before its slot is rejected. A late frame is admitted and
/// the cadence catches up by at most one slot, so a burst can never push the
/// admitted rate above `frame_rate + 1` in any one-second window.
#[derive(Debug, Clone)]
pub struct FrameGate {
    interval: Duration,
    next_due: Option<Instant>,
}

impl FrameGate {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / frame_rate.max(1),
            next_due: None,
        }
    }

    pub fn set_frame_rate(&mut self, frame_rate: u32) {
        self.interval = Duration::from_secs(1) / frame_rate.max(1);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, at: Instant) -> bool {
        let base = match self.next_due {
            None => at,
            Some(due) if at < due => return false,
            Some(due) => at.checked_sub(self.interval).map_or(due, |lag| lag.max(due)),
        };
        self.next_due = Some(base + self.interval);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Created,
    Capturing,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamCounters {
    pub frames_received: u64,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub key_frames: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub rehomes: u64,
}

/// Read-only view of a stream, republished as the stream runs and kept
/// after it ended.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub session_id: String,
    pub page_id: String,
    pub channel_id: String,
    pub encoder_id: String,
    pub state: StreamState,
    /// Telemetry is stale: degraded transport or an encoder fallback in progress
    pub degraded: bool,
    pub transport: TransportCapability,
    pub strategy: Strategy,
    pub quality: QualityTuple,
    pub counters: StreamCounters,
    pub started_at: DateTime<Utc>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<StreamEndReason>,
    pub network: Option<ChannelStats>,
    pub encoder: Option<EncoderTelemetry>,
    pub controller: Option<QualitySnapshot>,
    #[serde(skip)]
    pub last_output: Option<Instant>,
}

/// Shared collaborators of every stream.
#[derive(Clone)]
pub struct StreamContext {
    pub pool: InstancePool,
    pub encoders: Arc<EncoderBackend>,
    pub transport: Arc<dyn Transport>,
    pub quality: QualityConfig,
    pub drain_policy: DrainPolicy,
    pub max_consecutive_send_failures: u32,
}

enum StreamCommand {
    Close {
        reason: StreamEndReason,
        reply: oneshot::Sender<()>,
    },
    Update {
        options: StreamOptions,
        reply: oneshot::Sender<RbiResult<QualityTuple>>,
    },
}

/// Control side of a running stream. Cheap to clone.
#[derive(Clone)]
pub struct StreamHandle {
    id: String,
    tx: mpsc::Sender<StreamCommand>,
    stats: watch::Receiver<StreamStats>,
    done: CancellationToken,
}

impl StreamHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.borrow().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Waits until the stream has fully torn down.
    pub async fn ended(&self) -> StreamStats {
        self.done.cancelled().await;
        self.stats()
    }

    /// Stops the stream and waits for teardown. Safe to call any number of
    /// times; only the first reason sticks.
    pub async fn close(&self, reason: StreamEndReason) -> StreamStats {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StreamCommand::Close { reason, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.ended().await
    }

    /// Fails with `TerminalFailure` once the stream has ended.
    pub async fn update_options(&self, options: StreamOptions) -> RbiResult<QualityTuple> {
        options.validate()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StreamCommand::Update { options, reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> RbiError {
        match self.stats.borrow().end_reason {
            Some(reason) => RbiError::TerminalFailure(reason),
            None => RbiError::not_found("stream", &self.id),
        }
    }
}

/// Sets up page capture, transport channel and encoder, then spawns the
/// stream task. Anything set up before a failure is torn down again.
pub async fn start_stream(
    ctx: StreamContext,
    session_id: &str,
    binding: Arc<PageBinding>,
    quality: QualityTuple,
    options: &StreamOptions,
) -> RbiResult<StreamHandle> {
    let stream_id = uuid::Uuid::new_v4().to_string();
    let surface = binding.ensure(&ctx.pool).await?;

    let mut transport = Arc::clone(&ctx.transport);
    let opened = transport
        .open_channel(session_id, ChannelOptions::default())
        .await;
    let channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            log::warn!(
                "stream {}: transport channel failed ({:#}), continuing degraded",
                stream_id,
                e
            );
            let degraded: Arc<dyn Transport> = Arc::new(DegradedTransport::default());
            transport = degraded;
            transport
                .open_channel(session_id, ChannelOptions::default())
                .await
                .map_err(RbiError::backend)?
        }
    };

    let encoder_options = EncoderOptions::from_quality(&quality, ctx.encoders.keyframe_interval());
    let (encoder, events) = match ctx.encoders.create_encoder(&stream_id, encoder_options) {
        Ok(created) => created,
        Err(e) => {
            transport.close_channel(&channel);
            return Err(e);
        }
    };

    let frames = match surface
        .page()
        .start_capture(CaptureOptions::for_quality(&quality))
        .await
    {
        Ok(frames) => frames,
        Err(e) => {
            ctx.encoders.destroy_encoder(&stream_id);
            transport.close_channel(&channel);
            return Err(RbiError::backend(e));
        }
    };

    let capability = transport.capability();
    let now = Utc::now();
    let initial = StreamStats {
        stream_id: stream_id.clone(),
        session_id: session_id.to_string(),
        page_id: surface.page_id.clone(),
        channel_id: channel.id.clone(),
        encoder_id: stream_id.clone(),
        state: StreamState::Capturing,
        degraded: capability == TransportCapability::Degraded,
        transport: capability,
        strategy: encoder.strategy(),
        quality,
        counters: StreamCounters::default(),
        started_at: now,
        last_output_at: None,
        ended_at: None,
        end_reason: None,
        network: None,
        encoder: None,
        controller: None,
        last_output: None,
    };
    let (stats_tx, stats_rx) = watch::channel(initial.clone());
    let (tx, rx) = mpsc::channel(COMMAND_CHAN_CAP);
    let done = CancellationToken::new();

    log::info!(
        "stream {} started for session {} on page {} ({}x{} @ {}fps, {}kbps, {})",
        stream_id,
        session_id,
        surface.page_id,
        quality.width,
        quality.height,
        quality.frame_rate,
        quality.bitrate_kbps,
        encoder.strategy()
    );

    let task = StreamTask {
        id: stream_id.clone(),
        gate: FrameGate::new(quality.frame_rate),
        controller: QualityController::new(ctx.quality.clone(), quality, options),
        ctx,
        transport,
        channel,
        encoder,
        surface,
        binding,
        slot: None,
        in_flight: None,
        next_sequence: 0,
        started: Instant::now(),
        consecutive_send_failures: 0,
        fallback_pending: false,
        last_encoder_frames: 0,
        stats: initial,
        stats_tx,
        end: None,
    };
    let done_clone = done.clone();
    tokio::spawn(async move { task.run(rx, events, frames, done_clone).await });

    Ok(StreamHandle {
        id: stream_id,
        tx,
        stats: stats_rx,
        done,
    })
}

/// A frame that passed the gate, numbered in acceptance order.
struct Accepted {
    sequence: u64,
    frame: RawFrame,
}

struct InFlight {
    sequence: u64,
    captured_at: Instant,
}

struct StreamTask {
    id: String,
    ctx: StreamContext,
    transport: Arc<dyn Transport>,
    channel: ChannelHandle,
    encoder: EncoderHandle,
    surface: Surface,
    binding: Arc<PageBinding>,
    gate: FrameGate,
    controller: QualityController,
    slot: Option<Accepted>,
    in_flight: Option<InFlight>,
    next_sequence: u64,
    started: Instant,
    consecutive_send_failures: u32,
    fallback_pending: bool,
    last_encoder_frames: u64,
    stats: StreamStats,
    stats_tx: watch::Sender<StreamStats>,
    end: Option<StreamEndReason>,
}

impl StreamTask {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<StreamCommand>,
        mut events: EncoderEvents,
        mut frames: mpsc::Receiver<RawFrame>,
        done: CancellationToken,
    ) {
        let quality_enabled = self.ctx.quality.enabled;
        let mut tick = tokio::time::interval(self.ctx.quality.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        let channel_closed = self.channel.closed().clone();
        let mut waiters = Vec::new();

        while self.end.is_none() {
            let page_closed = self.surface.closed();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(StreamCommand::Close { reason, reply }) => {
                        waiters.push(reply);
                        self.end = Some(reason);
                    }
                    Some(StreamCommand::Update { options, reply }) => {
                        let result = self.apply_options(&options, &mut frames).await;
                        let _ = reply.send(result);
                    }
                    None => self.end = Some(StreamEndReason::Closed),
                },
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_raw_frame(frame),
                    None => {
                        if let Some(next) = self.on_page_gone().await {
                            frames = next;
                        }
                    }
                },
                _ = page_closed.cancelled() => {
                    if let Some(next) = self.on_page_gone().await {
                        frames = next;
                    }
                }
                event = events.recv() => match event {
                    Some(EncoderEvent::FrameDone { output }) => self.on_encoded(output),
                    Some(EncoderEvent::StrategyChanged { from, to, error }) => {
                        log::warn!("stream {}: encoder fell back {} -> {} ({})", self.id, from, to, error);
                        self.fallback_pending = true;
                        self.stats.strategy = to;
                        self.publish();
                    }
                    Some(EncoderEvent::Exhausted { error }) => {
                        log::error!("stream {}: no encoder left ({})", self.id, error);
                        self.end = Some(StreamEndReason::EncoderExhausted);
                    }
                    None => self.end = Some(StreamEndReason::EncoderExhausted),
                },
                _ = channel_closed.cancelled() => {
                    log::warn!("stream {}: transport channel closed", self.id);
                    self.end = Some(StreamEndReason::TransportError);
                }
                _ = tick.tick(), if quality_enabled => self.on_tick(),
            }
        }

        let reason = self.end.unwrap_or(StreamEndReason::Closed);
        self.teardown(reason).await;
        done.cancel();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn on_raw_frame(&mut self, frame: RawFrame) {
        let counters = &mut self.stats.counters;
        counters.frames_received += 1;
        if !self.gate.admit(frame.captured_at) {
            counters.frames_dropped += 1;
            if counters.frames_dropped % DROP_LOG_INTERVAL == 1 {
                log::debug!(
                    "stream {}: {} frames dropped by the gate so far",
                    self.id,
                    counters.frames_dropped
                );
            }
            return;
        }
        counters.frames_accepted += 1;
        let accepted = Accepted {
            sequence: self.next_sequence,
            frame,
        };
        self.next_sequence += 1;

        if self.in_flight.is_some() {
            if self.slot.replace(accepted).is_some() {
                self.stats.counters.frames_dropped += 1;
            }
            return;
        }
        self.dispatch(accepted);
    }

    fn dispatch(&mut self, accepted: Accepted) {
        let captured_at = accepted.frame.captured_at;
        if self.encoder.encode_frame(accepted.frame) {
            self.in_flight = Some(InFlight {
                sequence: accepted.sequence,
                captured_at,
            });
        } else {
            self.stats.counters.frames_dropped += 1;
        }
    }

    fn on_encoded(&mut self, output: Option<EncodedFrame>) {
        let in_flight = self.in_flight.take();
        if let (Some(output), Some(in_flight)) = (output, in_flight) {
            self.deliver(output, in_flight);
        }
        if self.end.is_none() {
            if let Some(next) = self.slot.take() {
                self.dispatch(next);
            }
        }
        self.publish();
    }

    fn deliver(&mut self, output: EncodedFrame, in_flight: InFlight) {
        let meta = FrameMeta {
            sequence: in_flight.sequence,
            is_key: output.is_key,
            timestamp_ms: in_flight
                .captured_at
                .saturating_duration_since(self.started)
                .as_millis() as u64,
            strategy: output.strategy,
        };
        let len = output.data.len() as u64;
        let counters = &mut self.stats.counters;
        counters.frames_encoded += 1;
        self.stats.strategy = output.strategy;
        self.fallback_pending = false;

        match self.transport.send_frame(&self.channel, output.data, meta) {
            SendOutcome::Sent => {
                counters.frames_sent += 1;
                counters.bytes_sent += len;
                if meta.is_key {
                    counters.key_frames += 1;
                }
                self.consecutive_send_failures = 0;
            }
            SendOutcome::Skipped => counters.frames_skipped += 1,
            SendOutcome::Dropped => {
                counters.send_failures += 1;
                self.consecutive_send_failures += 1;
                if self.consecutive_send_failures > self.ctx.max_consecutive_send_failures {
                    log::warn!(
                        "stream {}: {} consecutive send failures",
                        self.id,
                        self.consecutive_send_failures
                    );
                    self.end = Some(StreamEndReason::TransportError);
                }
            }
        }

        self.stats.last_output_at = Some(Utc::now());
        self.stats.last_output = Some(Instant::now());
        if self.stats.state == StreamState::Capturing {
            self.stats.state = StreamState::Active;
            log::info!("stream {} active", self.id);
        }
    }

    fn on_tick(&mut self) {
        let network = self.transport.channel_stats(&self.channel);
        let telemetry = self.encoder.telemetry();
        let encode_latency_ms = (telemetry.frames_encoded > self.last_encoder_frames)
            .then_some(telemetry.rolling_latency_ms);
        self.last_encoder_frames = telemetry.frames_encoded;

        let sample = QualitySample {
            rtt_ms: network.round_trip_time_ms,
            jitter_ms: network.jitter_ms,
            packet_loss: network.packet_loss,
            encode_latency_ms,
        };
        if let Some(adjustment) = self.controller.tick(sample) {
            let to = adjustment.to;
            log::info!(
                "stream {}: quality {}kbps@{}fps -> {}kbps@{}fps",
                self.id,
                adjustment.from.bitrate_kbps,
                adjustment.from.frame_rate,
                to.bitrate_kbps,
                to.frame_rate
            );
            self.encoder.update_options(EncoderUpdate {
                frame_rate: Some(to.frame_rate),
                bitrate_kbps: Some(to.bitrate_kbps),
                ..Default::default()
            });
            self.gate.set_frame_rate(to.frame_rate);
            self.stats.quality = to;
        }

        self.stats.network = Some(network);
        self.stats.encoder = Some(telemetry);
        self.stats.controller = Some(self.controller.snapshot());
        self.publish();
    }

    async fn apply_options(
        &mut self,
        options: &StreamOptions,
        frames: &mut mpsc::Receiver<RawFrame>,
    ) -> RbiResult<QualityTuple> {
        let config = &self.ctx.quality;
        let before = self.stats.quality;
        self.controller.set_ceiling(options);
        let mut next = options.apply_to(before);
        let ceiling = options.max_bitrate_kbps.unwrap_or(config.max_bitrate_kbps);
        next.bitrate_kbps = next
            .bitrate_kbps
            .clamp(config.min_bitrate_kbps, ceiling.max(config.min_bitrate_kbps));

        if (next.width, next.height) != (before.width, before.height) {
            let restarted = self
                .surface
                .page()
                .start_capture(CaptureOptions::for_quality(&next))
                .await
                .map_err(RbiError::backend)?;
            *frames = restarted;
        }
        self.encoder.update_options(EncoderUpdate {
            width: Some(next.width),
            height: Some(next.height),
            frame_rate: Some(next.frame_rate),
            bitrate_kbps: Some(next.bitrate_kbps),
        });
        self.gate.set_frame_rate(next.frame_rate);
        self.controller.set_baseline(next);
        self.stats.quality = next;
        self.publish();
        log::info!(
            "stream {}: reconfigured to {}x{} @ {}fps, {}kbps",
            self.id,
            next.width,
            next.height,
            next.frame_rate,
            next.bitrate_kbps
        );
        Ok(next)
    }

    /// Page closed or capture ended. Returns the new frame source when the
    /// stream moved to a fresh page.
    async fn on_page_gone(&mut self) -> Option<mpsc::Receiver<RawFrame>> {
        let reason = self.surface.close_reason();
        if reason == Some(SurfaceCloseReason::Drained) && self.ctx.drain_policy == DrainPolicy::Rehome {
            match self.rehome().await {
                Ok(frames) => return Some(frames),
                Err(e) => log::warn!("stream {}: rehome failed: {}", self.id, e),
            }
        }
        log::info!("stream {}: page {} gone ({:?})", self.id, self.surface.page_id, reason);
        self.end = Some(StreamEndReason::PageClosed);
        None
    }

    async fn rehome(&mut self) -> RbiResult<mpsc::Receiver<RawFrame>> {
        let surface = self.binding.ensure(&self.ctx.pool).await?;
        let frames = surface
            .page()
            .start_capture(CaptureOptions::for_quality(&self.stats.quality))
            .await
            .map_err(RbiError::backend)?;
        log::info!(
            "stream {}: moved from page {} to {}",
            self.id,
            self.surface.page_id,
            surface.page_id
        );
        self.stats.counters.rehomes += 1;
        self.stats.page_id = surface.page_id.clone();
        self.surface = surface;
        self.publish();
        Ok(frames)
    }

    /// Every step is attempted; failures are logged and the rest still runs.
    async fn teardown(&mut self, reason: StreamEndReason) {
        self.stats.state = StreamState::Closing;
        self.publish();

        if !self.surface.is_closed() {
            if let Err(e) = self.surface.page().stop_capture().await {
                log::warn!("stream {}: stop capture failed: {:#}", self.id, e);
            }
        }
        self.slot = None;
        self.stats.encoder = Some(self.encoder.telemetry());
        self.ctx.encoders.destroy_encoder(&self.id);
        self.stats.network = Some(self.transport.channel_stats(&self.channel));
        self.transport.close_channel(&self.channel);

        self.stats.state = StreamState::Closed;
        self.stats.end_reason = Some(reason);
        self.stats.ended_at = Some(Utc::now());
        self.publish();
        let c = &self.stats.counters;
        log::info!(
            "stream {} closed ({}): {} received, {} accepted, {} dropped, {} sent",
            self.id,
            reason,
            c.frames_received,
            c.frames_accepted,
            c.frames_dropped,
            c.frames_sent
        );
    }

    fn publish(&mut self) {
        self.stats.degraded = self.stats.transport == TransportCapability::Degraded || self.fallback_pending;
        self.stats_tx.send_replace(self.stats.clone());
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
