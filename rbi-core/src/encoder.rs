//! Encoder backend: one dedicated worker task per encoder, fed one frame at a time.
//!
//! ```text
//!  Pipeline ── encode_frame (try_send, never blocks) ──► worker task ──► strategy[index]
//!     ▲                                                      │
//!     └──────────── EncoderEvent (FrameDone / StrategyChanged / Exhausted) ◄┘
//! ```
//!
//! A fatal strategy error moves the worker to `chain[index + 1]`; running off
//! the end of the chain marks the encoder permanently failed.

use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EncoderConfig;
use crate::error::{RbiError, RbiResult};
use crate::hw::EncoderProbe;
use crate::strategy::{
    EncodeError, EncodeStrategy, EncoderOptions, EncoderUpdate, ProcessStrategyFactory, Strategy,
    StrategyFactory,
};
use crate::types::{EncodedFrame, RawFrame};

/// Number of recent encode latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 30;
/// Commands are at most one frame plus a few option updates.
const COMMAND_CHAN_CAP: usize = 16;
const EVENT_CHAN_CAP: usize = 16;

pub type EncoderEvents = mpsc::Receiver<EncoderEvent>;

#[derive(Debug)]
pub enum EncoderEvent {
    /// The in-flight frame is finished. `None` when nothing came out of it
    /// (buffered, rejected, or discarded because the strategy failed).
    FrameDone { output: Option<EncodedFrame> },
    StrategyChanged {
        from: Strategy,
        to: Strategy,
        error: String,
    },
    /// The fallback chain ran out. The encoder accepts nothing anymore.
    Exhausted { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderTelemetry {
    pub id: String,
    pub strategy: Strategy,
    pub failed: bool,
    pub frames_encoded: u64,
    /// Frames the strategy swallowed without output yet
    pub frames_buffered: u64,
    pub bytes_produced: u64,
    pub avg_latency_ms: f64,
    pub rolling_latency_ms: f64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub fallbacks: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

enum EncoderCommand {
    Encode(RawFrame),
    Update(EncoderUpdate),
}

struct Shared {
    busy: AtomicBool,
    failed: AtomicBool,
}

/// Caller side of one encoder. Cheap to clone.
#[derive(Clone)]
pub struct EncoderHandle {
    id: String,
    tx: mpsc::Sender<EncoderCommand>,
    shared: Arc<Shared>,
    telemetry: watch::Receiver<EncoderTelemetry>,
    cancel: CancellationToken,
}

impl EncoderHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hands a frame to the worker. Returns false right away when a frame is
    /// already in flight or the encoder is gone; never waits.
    pub fn encode_frame(&self, frame: RawFrame) -> bool {
        if self.cancel.is_cancelled() || self.shared.failed.load(Ordering::Acquire) {
            return false;
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match self.tx.try_send(EncoderCommand::Encode(frame)) {
            Ok(()) => true,
            Err(_) => {
                self.shared.busy.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn update_options(&self, update: EncoderUpdate) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.tx.try_send(EncoderCommand::Update(update)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("encoder {}: option update not delivered: {}", self.id, e);
                false
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn strategy(&self) -> Strategy {
        self.telemetry.borrow().strategy
    }

    pub fn telemetry(&self) -> EncoderTelemetry {
        self.telemetry.borrow().clone()
    }

    /// Stops the worker; an in-flight encode is abandoned.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// When a strategy that cannot retune live gets restarted for new rates.
///
/// Resolution changes always restart. Bitrate and frame-rate changes restart
/// only once the running strategy is `min_interval` old and the target moved
/// by at least `min_change` (relative); smaller moves wait for the next
/// restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub min_interval: Duration,
    pub min_change: f64,
}

impl RestartPolicy {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            min_interval: config.restart_min_interval(),
            min_change: config.restart_min_change.max(0.0),
        }
    }

    fn allows(&self, running: &EncoderOptions, since: Instant, target: &EncoderOptions) -> bool {
        if (running.width, running.height) != (target.width, target.height) {
            return true;
        }
        let moved = |from: u32, to: u32| (to as f64 - from as f64).abs() / from.max(1) as f64;
        let change = moved(running.bitrate_kbps, target.bitrate_kbps)
            .max(moved(running.frame_rate, target.frame_rate));
        change > 0.0 && change >= self.min_change && since.elapsed() >= self.min_interval
    }
}

/// Process-wide encoder registry. Constructed once and passed to the pipelines.
pub struct EncoderBackend {
    chain: Vec<Strategy>,
    initial_index: usize,
    keyframe_interval: u32,
    restart: RestartPolicy,
    probe: EncoderProbe,
    factory: Arc<dyn StrategyFactory>,
    encoders: Mutex<HashMap<String, EncoderHandle>>,
}

impl EncoderBackend {
    /// Probes the host and builds a backend on top of ffmpeg worker processes.
    pub async fn probe(config: &EncoderConfig) -> Self {
        let probe = EncoderProbe::run(&config.ffmpeg_path, config.probe_hardware).await;
        let factory = Arc::new(ProcessStrategyFactory::new(
            config.ffmpeg_path.clone(),
            probe.clone(),
            config.frame_timeout(),
        ));
        Self::new(config, probe, factory)
    }

    pub fn new(config: &EncoderConfig, probe: EncoderProbe, factory: Arc<dyn StrategyFactory>) -> Self {
        let mut chain = config.fallback_order.clone();
        if chain.is_empty() {
            chain = Strategy::DEFAULT_CHAIN.to_vec();
        }
        let initial_index = probe.initial_index(&chain);
        log::info!(
            "encoder backend: chain {:?}, starting at {}",
            chain.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            chain[initial_index]
        );
        Self {
            chain,
            initial_index,
            keyframe_interval: config.keyframe_interval,
            restart: RestartPolicy::from_config(config),
            probe,
            factory,
            encoders: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> &[Strategy] {
        &self.chain
    }

    pub fn initial_strategy(&self) -> Strategy {
        self.chain[self.initial_index]
    }

    pub fn probe_result(&self) -> &EncoderProbe {
        &self.probe
    }

    pub fn keyframe_interval(&self) -> u32 {
        self.keyframe_interval
    }

    /// Registers an encoder and spawns its worker. No external work starts
    /// until the first frame arrives.
    pub fn create_encoder(
        &self,
        id: &str,
        options: EncoderOptions,
    ) -> RbiResult<(EncoderHandle, EncoderEvents)> {
        let mut encoders = self
            .encoders
            .lock()
            .map_err(|_| RbiError::backend(anyhow::anyhow!("encoder registry poisoned")))?;
        if encoders.contains_key(id) {
            return Err(RbiError::InvalidArgument(format!("encoder {} already exists", id)));
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHAN_CAP);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHAN_CAP);
        let initial = self.chain[self.initial_index];
        let (telemetry_tx, telemetry_rx) = watch::channel(EncoderTelemetry {
            id: id.to_string(),
            strategy: initial,
            failed: false,
            frames_encoded: 0,
            frames_buffered: 0,
            bytes_produced: 0,
            avg_latency_ms: 0.0,
            rolling_latency_ms: 0.0,
            last_frame_at: None,
            fallbacks: 0,
            width: options.width,
            height: options.height,
            frame_rate: options.frame_rate,
            bitrate_kbps: options.bitrate_kbps,
        });
        let shared = Arc::new(Shared {
            busy: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let worker = EncoderWorker {
            id: id.to_string(),
            chain: self.chain.clone(),
            index: self.initial_index,
            options,
            factory: Arc::clone(&self.factory),
            strategy: None,
            running: None,
            restart_pending: false,
            restart: self.restart,
            shared: Arc::clone(&shared),
            events: event_tx,
            telemetry: telemetry_tx,
            stats: WorkerStats::default(),
        };
        let worker_cancel = cancel.clone();
        tokio::spawn(async move { worker.run(rx, worker_cancel).await });

        let handle = EncoderHandle {
            id: id.to_string(),
            tx,
            shared,
            telemetry: telemetry_rx,
            cancel,
        };
        encoders.insert(id.to_string(), handle.clone());
        log::info!("encoder {} created with strategy {}", id, initial);
        Ok((handle, event_rx))
    }

    fn get(&self, id: &str) -> Option<EncoderHandle> {
        self.encoders.lock().ok()?.get(id).cloned()
    }

    pub fn encode_frame(&self, id: &str, frame: RawFrame) -> bool {
        match self.get(id) {
            Some(handle) => handle.encode_frame(frame),
            None => false,
        }
    }

    pub fn update_options(&self, id: &str, update: EncoderUpdate) -> RbiResult<()> {
        let handle = self
            .get(id)
            .ok_or_else(|| RbiError::not_found("encoder", id))?;
        handle.update_options(update);
        Ok(())
    }

    pub fn telemetry(&self, id: &str) -> RbiResult<EncoderTelemetry> {
        self.get(id)
            .map(|h| h.telemetry())
            .ok_or_else(|| RbiError::not_found("encoder", id))
    }

    pub fn list(&self) -> Vec<EncoderTelemetry> {
        match self.encoders.lock() {
            Ok(encoders) => encoders.values().map(|h| h.telemetry()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stops and forgets an encoder. Returns false if it was already gone.
    pub fn destroy_encoder(&self, id: &str) -> bool {
        let removed = self.encoders.lock().ok().and_then(|mut e| e.remove(id));
        match removed {
            Some(handle) => {
                handle.stop();
                log::info!("encoder {} destroyed", id);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct WorkerStats {
    frames_encoded: u64,
    frames_buffered: u64,
    bytes_produced: u64,
    total_latency_ms: f64,
    latency_samples: u64,
    recent_latency_ms: VecDeque<f64>,
    last_frame_at: Option<DateTime<Utc>>,
    fallbacks: u32,
}

struct EncoderWorker {
    id: String,
    chain: Vec<Strategy>,
    index: usize,
    options: EncoderOptions,
    factory: Arc<dyn StrategyFactory>,
    strategy: Option<Box<dyn EncodeStrategy>>,
    /// Options the current strategy was built with, and when
    running: Option<(EncoderOptions, Instant)>,
    /// The strategy declined a live update and runs on stale options
    restart_pending: bool,
    restart: RestartPolicy,
    shared: Arc<Shared>,
    events: mpsc::Sender<EncoderEvent>,
    telemetry: watch::Sender<EncoderTelemetry>,
    stats: WorkerStats,
}

enum Step {
    Continue,
    Exhausted,
}

impl EncoderWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<EncoderCommand>, cancel: CancellationToken) {
        log::debug!("encoder {} worker started", self.id);
        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match cmd {
                EncoderCommand::Update(update) => self.apply_update(update).await,
                EncoderCommand::Encode(frame) => {
                    let step = tokio::select! {
                        _ = cancel.cancelled() => {
                            log::debug!("encoder {}: in-flight encode cancelled", self.id);
                            break;
                        }
                        step = self.encode_one(frame) => step,
                    };
                    if let Step::Exhausted = step {
                        break;
                    }
                }
            }
        }

        if let Some(mut strategy) = self.strategy.take() {
            strategy.stop().await;
        }
        self.shared.busy.store(false, Ordering::Release);
        log::debug!("encoder {} worker finished", self.id);
    }

    async fn apply_update(&mut self, update: EncoderUpdate) {
        if !update.apply(&mut self.options) {
            return;
        }
        log::info!(
            "encoder {}: options now {}x{} @ {}fps, {}kbps",
            self.id,
            self.options.width,
            self.options.height,
            self.options.frame_rate,
            self.options.bitrate_kbps
        );
        if let Some(strategy) = self.strategy.as_mut() {
            if !strategy.update_options(&self.options) {
                self.restart_pending = true;
            }
        }
        self.restart_if_due().await;
        self.publish();
    }

    /// Drops a strategy running on stale options once the restart policy
    /// allows it; the next frame rebuilds it with the current options.
    async fn restart_if_due(&mut self) {
        if !self.restart_pending {
            return;
        }
        let Some((running, since)) = self.running.as_ref() else {
            self.restart_pending = false;
            return;
        };
        if !self.restart.allows(running, *since, &self.options) {
            log::debug!("encoder {}: restart for new options deferred", self.id);
            return;
        }
        if let Some(mut strategy) = self.strategy.take() {
            log::info!("encoder {}: restarting {} with new options", self.id, strategy.strategy());
            strategy.stop().await;
        }
        self.running = None;
        self.restart_pending = false;
    }

    async fn encode_one(&mut self, frame: RawFrame) -> Step {
        let current = self.chain[self.index];
        self.restart_if_due().await;
        if self.strategy.is_none() {
            match self.factory.create(current, &self.options) {
                Ok(strategy) => {
                    self.strategy = Some(strategy);
                    self.running = Some((self.options.clone(), Instant::now()));
                    self.restart_pending = false;
                }
                Err(e) => return self.fall_back(e).await,
            }
        }
        let Some(strategy) = self.strategy.as_mut() else {
            return self
                .fall_back(anyhow::anyhow!("strategy {} unavailable", current))
                .await;
        };

        let started = Instant::now();
        let output = match strategy.encode(frame).await {
            Ok(Some(chunk)) => {
                let latency = started.elapsed();
                self.record(latency.as_secs_f64() * 1000.0, chunk.data.len());
                Some(EncodedFrame {
                    data: chunk.data,
                    is_key: chunk.is_key,
                    strategy: current,
                    latency,
                })
            }
            Ok(None) => {
                self.stats.frames_buffered += 1;
                None
            }
            Err(EncodeError::Frame(e)) => {
                log::debug!("encoder {}: frame rejected: {:#}", self.id, e);
                None
            }
            Err(EncodeError::Fatal(e)) => return self.fall_back(e).await,
        };

        self.publish();
        self.finish_frame(output).await;
        Step::Continue
    }

    fn record(&mut self, latency_ms: f64, bytes: usize) {
        let stats = &mut self.stats;
        stats.frames_encoded += 1;
        stats.bytes_produced += bytes as u64;
        stats.total_latency_ms += latency_ms;
        stats.latency_samples += 1;
        stats.recent_latency_ms.push_back(latency_ms);
        while stats.recent_latency_ms.len() > LATENCY_WINDOW {
            stats.recent_latency_ms.pop_front();
        }
        stats.last_frame_at = Some(Utc::now());
    }

    /// Clears the busy flag before announcing completion, so the receiver can
    /// dispatch its next frame as soon as it sees the event.
    async fn finish_frame(&mut self, output: Option<EncodedFrame>) {
        self.shared.busy.store(false, Ordering::Release);
        let _ = self.events.send(EncoderEvent::FrameDone { output }).await;
    }

    async fn fall_back(&mut self, error: anyhow::Error) -> Step {
        if let Some(mut strategy) = self.strategy.take() {
            strategy.stop().await;
        }
        let from = self.chain[self.index];
        let error = format!("{:#}", error);
        self.stats.fallbacks += 1;

        if self.index + 1 >= self.chain.len() {
            log::error!(
                "encoder {}: last strategy {} failed ({}), fallback chain exhausted",
                self.id,
                from,
                error
            );
            self.shared.failed.store(true, Ordering::Release);
            self.publish();
            self.shared.busy.store(false, Ordering::Release);
            let _ = self.events.send(EncoderEvent::Exhausted { error }).await;
            return Step::Exhausted;
        }

        self.index += 1;
        let to = self.chain[self.index];
        log::warn!(
            "encoder {}: strategy {} failed ({}), falling back to {}",
            self.id,
            from,
            error,
            to
        );
        self.publish();
        let _ = self
            .events
            .send(EncoderEvent::StrategyChanged { from, to, error })
            .await;
        self.finish_frame(None).await;
        Step::Continue
    }

    fn publish(&self) {
        let stats = &self.stats;
        let recent = stats.recent_latency_ms.len();
        let rolling = if recent == 0 {
            0.0
        } else {
            stats.recent_latency_ms.iter().sum::<f64>() / recent as f64
        };
        let measured = stats.latency_samples.max(1) as f64;
        let snapshot = EncoderTelemetry {
            id: self.id.clone(),
            strategy: self.chain[self.index],
            failed: self.shared.failed.load(Ordering::Acquire),
            frames_encoded: stats.frames_encoded,
            frames_buffered: stats.frames_buffered,
            bytes_produced: stats.bytes_produced,
            avg_latency_ms: stats.total_latency_ms / measured,
            rolling_latency_ms: rolling,
            last_frame_at: stats.last_frame_at,
            fallbacks: stats.fallbacks,
            width: self.options.width,
            height: self.options.height,
            frame_rate: self.options.frame_rate,
            bitrate_kbps: self.options.bitrate_kbps,
        };
        self.telemetry.send_replace(snapshot);
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
