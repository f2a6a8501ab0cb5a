//! Scripted collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::strategy::{EncodeError, EncodeStrategy, EncodedChunk, EncoderOptions, Strategy, StrategyFactory};
use crate::transport::{ChannelHandle, ChannelOptions, ChannelStats, SendOutcome, Transport, TransportCapability};
use crate::types::{FrameMeta, RawFrame};

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Every frame produces output
    Healthy,
    /// The factory refuses to build the strategy
    RefuseCreate,
    /// `n` frames succeed, then the strategy dies
    FatalAfter(usize),
    /// Every frame is rejected individually
    RejectFrames,
    /// Frames go in, nothing comes out yet
    Buffering,
}

#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<Strategy, Script>,
    delay: Duration,
    fixed_options: bool,
    pub created: Arc<Mutex<Vec<Strategy>>>,
    pub stopped: Arc<Mutex<Vec<Strategy>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, strategy: Strategy, script: Script) -> Self {
        self.scripts.insert(strategy, script);
        self
    }

    /// Simulated encode time per frame.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Strategies refuse live option updates, like ffmpeg workers do.
    pub fn fixed_options(mut self) -> Self {
        self.fixed_options = true;
        self
    }

    pub fn created(&self) -> Vec<Strategy> {
        self.created.lock().unwrap().clone()
    }
}

impl StrategyFactory for ScriptedFactory {
    fn create(
        &self,
        strategy: Strategy,
        options: &EncoderOptions,
    ) -> anyhow::Result<Box<dyn EncodeStrategy>> {
        let script = self.scripts.get(&strategy).copied().unwrap_or(Script::Healthy);
        if let Script::RefuseCreate = script {
            anyhow::bail!("{} not available", strategy);
        }
        self.created.lock().unwrap().push(strategy);
        Ok(Box::new(ScriptedStrategy {
            strategy,
            script,
            delay: self.delay,
            fixed_options: self.fixed_options,
            frames: 0,
            options: options.clone(),
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

struct ScriptedStrategy {
    strategy: Strategy,
    script: Script,
    delay: Duration,
    fixed_options: bool,
    frames: usize,
    options: EncoderOptions,
    stopped: Arc<Mutex<Vec<Strategy>>>,
}

impl EncodeStrategy for ScriptedStrategy {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn encode(&mut self, _frame: RawFrame) -> BoxFuture<'_, Result<Option<EncodedChunk>, EncodeError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.script {
                Script::FatalAfter(n) if self.frames >= n => {
                    return Err(EncodeError::Fatal(anyhow::anyhow!("{} crashed", self.strategy)));
                }
                Script::RejectFrames => {
                    return Err(EncodeError::Frame(anyhow::anyhow!("bad frame")));
                }
                Script::Buffering => return Ok(None),
                _ => {}
            }
            let is_key = self.frames % self.options.keyframe_interval.max(1) as usize == 0
                || self.strategy == Strategy::Jpeg;
            self.frames += 1;
            Ok(Some(EncodedChunk {
                data: Bytes::from(vec![0u8; 16]),
                is_key,
            }))
        })
    }

    fn update_options(&mut self, options: &EncoderOptions) -> bool {
        if self.fixed_options {
            return *options == self.options;
        }
        self.options = options.clone();
        true
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        self.stopped.lock().unwrap().push(self.strategy);
        Box::pin(async {})
    }
}

/// Transport that keeps the metadata of every frame it was handed.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<FrameMeta>>,
    channels: Mutex<Vec<ChannelHandle>>,
    drop_all: AtomicBool,
    fail_open: AtomicBool,
    rtt_ms: Mutex<Option<f64>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<FrameMeta> {
        self.sent.lock().unwrap().clone()
    }

    pub fn drop_all(&self, drop: bool) {
        self.drop_all.store(drop, Ordering::SeqCst);
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_rtt(&self, rtt_ms: Option<f64>) {
        *self.rtt_ms.lock().unwrap() = rtt_ms;
    }

    /// Closes every channel from the transport side.
    pub fn close_all_channels(&self) {
        for channel in self.channels.lock().unwrap().iter() {
            channel.closed().cancel();
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

impl Transport for RecordingTransport {
    fn capability(&self) -> TransportCapability {
        TransportCapability::Full
    }

    fn open_channel<'a>(
        &'a self,
        session_id: &'a str,
        _options: ChannelOptions,
    ) -> BoxFuture<'a, anyhow::Result<ChannelHandle>> {
        Box::pin(async move {
            if self.fail_open.load(Ordering::SeqCst) {
                anyhow::bail!("no transport");
            }
            let handle = ChannelHandle::new(uuid::Uuid::new_v4().to_string(), session_id);
            self.channels.lock().unwrap().push(handle.clone());
            Ok(handle)
        })
    }

    fn send_frame(&self, channel: &ChannelHandle, _data: Bytes, meta: FrameMeta) -> SendOutcome {
        if channel.is_closed() || self.drop_all.load(Ordering::SeqCst) {
            return SendOutcome::Dropped;
        }
        self.sent.lock().unwrap().push(meta);
        SendOutcome::Sent
    }

    fn channel_stats(&self, _channel: &ChannelHandle) -> ChannelStats {
        ChannelStats {
            round_trip_time_ms: *self.rtt_ms.lock().unwrap(),
            jitter_ms: None,
            packet_loss: None,
            frames_sent: self.sent.lock().unwrap().len() as u64,
            ..Default::default()
        }
    }

    fn close_channel(&self, channel: &ChannelHandle) {
        channel.closed().cancel();
    }
}
