use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{DrainPolicy, EncoderConfig, PoolConfig, QualityConfig};
use crate::encoder::EncoderBackend;
use crate::engine::{LaunchOptions, SyntheticEngine};
use crate::error::{RbiError, StreamEndReason};
use crate::hw::EncoderProbe;
use crate::pipeline::{FrameGate, StreamContext, StreamHandle, StreamState, start_stream};
use crate::pool::{InstancePool, PageBinding};
use crate::strategy::Strategy;
use crate::testing::{RecordingTransport, Script, ScriptedFactory};
use crate::transport::TransportCapability;
use crate::types::{QualityTuple, StreamOptions, Viewport};

struct Rig {
    ctx: StreamContext,
    transport: Arc<RecordingTransport>,
}

fn rig(factory: ScriptedFactory, pool: PoolConfig) -> Rig {
    let engine = Arc::new(SyntheticEngine::with_frame_interval(Duration::from_millis(16)));
    let transport = Arc::new(RecordingTransport::new());
    let config = EncoderConfig {
        fallback_order: vec![Strategy::SoftwareH264, Strategy::Jpeg],
        ..Default::default()
    };
    let encoders = Arc::new(EncoderBackend::new(
        &config,
        EncoderProbe::with_encoders(["libx264"]),
        Arc::new(factory),
    ));
    let ctx = StreamContext {
        pool: InstancePool::new(
            PoolConfig {
                health_interval_ms: 100,
                ..pool
            },
            engine,
            LaunchOptions::default(),
        ),
        encoders,
        transport: transport.clone(),
        quality: QualityConfig {
            enabled: false,
            ..Default::default()
        },
        drain_policy: DrainPolicy::Fail,
        max_consecutive_send_failures: 150,
    };
    Rig { ctx, transport }
}

fn quality() -> QualityTuple {
    QualityTuple {
        width: 32,
        height: 18,
        frame_rate: 30,
        bitrate_kbps: 1000,
    }
}

async fn start(ctx: &StreamContext) -> anyhow::Result<(StreamHandle, Arc<PageBinding>)> {
    let surface = ctx
        .pool
        .acquire_surface(Viewport {
            width: 32,
            height: 18,
        })
        .await?;
    let binding = Arc::new(PageBinding::new(surface));
    let handle = start_stream(
        ctx.clone(),
        "s1",
        Arc::clone(&binding),
        quality(),
        &StreamOptions::default(),
    )
    .await?;
    Ok((handle, binding))
}

async fn wait_ended(handle: &StreamHandle) -> anyhow::Result<StreamEndReason> {
    let stats = tokio::time::timeout(Duration::from_secs(5), handle.ended()).await?;
    stats
        .end_reason
        .ok_or_else(|| anyhow::anyhow!("ended without a reason"))
}

#[tokio::test(start_paused = true)]
async fn test_gate_caps_accepted_rate() {
    let start = Instant::now();
    let mut gate = FrameGate::new(30);
    let accepted = (0..60u64)
        .filter(|i| gate.admit(start + Duration::from_millis(16 * i)))
        .count();
    assert_eq!(accepted, 29);

    // dense burst: no one-second window may hold more than rate + 1
    let mut gate = FrameGate::new(30);
    let times: Vec<_> = (0..3000u64)
        .map(|i| start + Duration::from_micros(700 * i))
        .filter(|t| gate.admit(*t))
        .collect();
    for (i, t) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|u| u.duration_since(*t) < Duration::from_secs(1))
            .count();
        assert!(in_window <= 31, "{} frames in one second", in_window);
    }
}

#[tokio::test(start_paused = true)]
async fn test_gate_does_not_burst_after_a_gap() {
    let start = Instant::now();
    let mut gate = FrameGate::new(30);
    let at = |ms: u64| start + Duration::from_millis(ms);
    assert!(gate.admit(at(0)));
    assert!(!gate.admit(at(10)));
    assert!(gate.admit(at(500)));
    assert!(gate.admit(at(501)));
    assert!(!gate.admit(at(502)));
    assert!(!gate.admit(at(520)));
    assert!(gate.admit(at(534)));

    gate.set_frame_rate(10);
    assert_eq!(gate.interval(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_stream_delivers_frames_in_order() -> anyhow::Result<()> {
    let rig = rig(ScriptedFactory::new(), PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let running = handle.stats();
    assert_eq!(running.state, StreamState::Active);
    assert!(!running.degraded);
    assert!(running.last_output.is_some());

    let stats = handle.close(StreamEndReason::Closed).await;
    assert_eq!(stats.state, StreamState::Closed);
    assert_eq!(stats.end_reason, Some(StreamEndReason::Closed));
    assert!(stats.ended_at.is_some());

    let c = &stats.counters;
    assert!((25..=32).contains(&c.frames_accepted), "accepted {}", c.frames_accepted);
    assert!(c.frames_received > c.frames_accepted);
    let sent = rig.transport.sent();
    assert_eq!(sent.len() as u64, c.frames_sent);
    assert!(sent[0].is_key);
    assert!(sent.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(sent.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));

    assert_eq!(rig.transport.open_channels(), 0);
    assert!(rig.ctx.encoders.list().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() -> anyhow::Result<()> {
    let rig = rig(ScriptedFactory::new(), PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = handle.close(StreamEndReason::Expired).await;
    let second = handle.close(StreamEndReason::Closed).await;
    assert_eq!(first.end_reason, Some(StreamEndReason::Expired));
    assert_eq!(second.end_reason, Some(StreamEndReason::Expired));
    assert_eq!(first.counters.frames_sent, second.counters.frames_sent);
    assert!(handle.is_ended());

    let err = handle.update_options(StreamOptions::default()).await.unwrap_err();
    assert!(matches!(err, RbiError::TerminalFailure(StreamEndReason::Expired)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_encoder_fallback_keeps_stream_running() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new().script(Strategy::SoftwareH264, Script::FatalAfter(3));
    let rig = rig(factory, PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = handle.stats();
    assert_eq!(stats.strategy, Strategy::Jpeg);
    assert!(stats.end_reason.is_none());
    assert!(!stats.degraded);

    let sent = rig.transport.sent();
    assert_eq!(
        sent.iter().filter(|m| m.strategy == Strategy::SoftwareH264).count(),
        3
    );
    assert!(sent.iter().any(|m| m.strategy == Strategy::Jpeg));
    assert!(sent.windows(2).all(|w| w[0].sequence < w[1].sequence));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_encoder_ends_stream() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .script(Strategy::SoftwareH264, Script::FatalAfter(2))
        .script(Strategy::Jpeg, Script::FatalAfter(0));
    let rig = rig(factory, PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;

    assert_eq!(wait_ended(&handle).await?, StreamEndReason::EncoderExhausted);
    assert_eq!(handle.stats().counters.frames_sent, 2);
    assert_eq!(rig.transport.open_channels(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_persistent_send_failures_end_stream() -> anyhow::Result<()> {
    let mut rig = rig(ScriptedFactory::new(), PoolConfig::default());
    rig.ctx.max_consecutive_send_failures = 3;
    rig.transport.drop_all(true);
    let (handle, _binding) = start(&rig.ctx).await?;

    assert_eq!(wait_ended(&handle).await?, StreamEndReason::TransportError);
    let stats = handle.stats();
    assert_eq!(stats.counters.send_failures, 4);
    assert_eq!(stats.counters.frames_sent, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_closed_channel_ends_stream() -> anyhow::Result<()> {
    let rig = rig(ScriptedFactory::new(), PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    rig.transport.close_all_channels();
    assert_eq!(wait_ended(&handle).await?, StreamEndReason::TransportError);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_runs_degraded() -> anyhow::Result<()> {
    let rig = rig(ScriptedFactory::new(), PoolConfig::default());
    rig.transport.fail_open(true);
    let (handle, _binding) = start(&rig.ctx).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = handle.stats();
    assert_eq!(stats.transport, TransportCapability::Degraded);
    assert!(stats.degraded);
    assert!(stats.counters.frames_skipped > 0);
    assert_eq!(stats.counters.frames_sent, 0);
    assert!(stats.end_reason.is_none());
    assert!(rig.transport.sent().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_drained_page_ends_stream() -> anyhow::Result<()> {
    let rig = rig(
        ScriptedFactory::new(),
        PoolConfig {
            max_instances: 1,
            max_instance_age_secs: 1,
            ..Default::default()
        },
    );
    let (handle, _binding) = start(&rig.ctx).await?;
    assert_eq!(wait_ended(&handle).await?, StreamEndReason::PageClosed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_drained_page_rehomes_stream() -> anyhow::Result<()> {
    let mut rig = rig(
        ScriptedFactory::new(),
        PoolConfig {
            max_instances: 1,
            max_instance_age_secs: 1,
            ..Default::default()
        },
    );
    rig.ctx.drain_policy = DrainPolicy::Rehome;
    let (handle, binding) = start(&rig.ctx).await?;
    binding.set_url("about:blank");
    let first_page = handle.stats().page_id;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stats = handle.stats();
    assert!(stats.end_reason.is_none());
    assert_eq!(stats.counters.rehomes, 1);
    assert_ne!(stats.page_id, first_page);
    assert_eq!(binding.surface().map(|s| s.page_id), Some(stats.page_id.clone()));

    let sent_before = stats.counters.frames_sent;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.stats().counters.frames_sent > sent_before);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_update_options_reconfigures() -> anyhow::Result<()> {
    let rig = rig(ScriptedFactory::new(), PoolConfig::default());
    let (handle, _binding) = start(&rig.ctx).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = handle
        .update_options(StreamOptions {
            frame_rate: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RbiError::InvalidArgument(_)));

    let applied = handle
        .update_options(StreamOptions {
            frame_rate: Some(10),
            bitrate_kbps: Some(800),
            ..Default::default()
        })
        .await?;
    assert_eq!(applied.frame_rate, 10);
    assert_eq!(applied.bitrate_kbps, 800);
    assert_eq!(applied.width, 32);
    assert_eq!(handle.stats().quality, applied);

    let accepted_before = handle.stats().counters.frames_accepted;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let accepted = handle.stats().counters.frames_accepted - accepted_before;
    assert!((8..=11).contains(&accepted), "accepted {}", accepted);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_controller_backs_off_on_slow_network() -> anyhow::Result<()> {
    let mut rig = rig(ScriptedFactory::new(), PoolConfig::default());
    rig.ctx.quality = QualityConfig {
        tick_interval_ms: 200,
        window_size: 1,
        ..Default::default()
    };
    rig.transport.set_rtt(Some(500.0));
    let (handle, _binding) = start(&rig.ctx).await?;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let stats = handle.stats();
    assert!(stats.quality.bitrate_kbps < 1000);
    assert!(stats.quality.frame_rate < 30);
    let controller = stats.controller.expect("controller snapshot");
    assert!(controller.adjustments >= 1);
    assert_eq!(stats.network.and_then(|n| n.round_trip_time_ms), Some(500.0));
    Ok(())
}
