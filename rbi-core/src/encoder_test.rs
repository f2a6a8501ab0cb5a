use std::sync::Arc;
use std::time::Duration;

use crate::config::EncoderConfig;
use crate::encoder::{EncoderBackend, EncoderEvent, EncoderEvents, EncoderHandle};
use crate::error::RbiError;
use crate::hw::EncoderProbe;
use crate::strategy::{EncoderOptions, EncoderUpdate, Strategy};
use crate::testing::{Script, ScriptedFactory};
use crate::types::RawFrame;

fn options() -> EncoderOptions {
    EncoderOptions {
        width: 2,
        height: 2,
        frame_rate: 30,
        bitrate_kbps: 1000,
        keyframe_interval: 30,
    }
}

fn frame() -> RawFrame {
    RawFrame::rgb24(vec![0u8; 12], 2, 2)
}

fn backend(chain: &[Strategy], probe: EncoderProbe, factory: Arc<ScriptedFactory>) -> EncoderBackend {
    let config = EncoderConfig {
        fallback_order: chain.to_vec(),
        ..Default::default()
    };
    EncoderBackend::new(&config, probe, factory)
}

async fn next_event(events: &mut EncoderEvents) -> anyhow::Result<EncoderEvent> {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event channel closed"))
}

#[tokio::test]
async fn test_encode_frame_produces_output() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().delay(Duration::from_millis(50)));
    let backend = backend(
        &[Strategy::SoftwareH264, Strategy::Jpeg],
        EncoderProbe::with_encoders(["libx264"]),
        factory.clone(),
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    assert_eq!(handle.strategy(), Strategy::SoftwareH264);

    assert!(backend.encode_frame("e1", frame()));
    // one frame in flight at a time
    assert!(!backend.encode_frame("e1", frame()));
    assert!(handle.is_busy());

    match next_event(&mut events).await? {
        EncoderEvent::FrameDone { output: Some(out) } => {
            assert!(out.is_key);
            assert_eq!(out.strategy, Strategy::SoftwareH264);
            assert_eq!(out.data.len(), 16);
        }
        other => anyhow::bail!("unexpected event {:?}", other),
    }
    assert!(!handle.is_busy());
    let telemetry = backend.telemetry("e1")?;
    assert_eq!(telemetry.frames_encoded, 1);
    assert_eq!(telemetry.bytes_produced, 16);
    assert!(telemetry.last_frame_at.is_some());
    assert_eq!(factory.created(), vec![Strategy::SoftwareH264]);
    Ok(())
}

#[tokio::test]
async fn test_fatal_error_falls_back_to_next_strategy() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().script(Strategy::HardwareHevc, Script::FatalAfter(0)));
    let backend = backend(
        &Strategy::DEFAULT_CHAIN,
        EncoderProbe::with_encoders(["hevc_nvenc", "h264_nvenc", "libx264", "libx265"]),
        factory.clone(),
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    assert_eq!(handle.strategy(), Strategy::HardwareHevc);

    assert!(handle.encode_frame(frame()));
    match next_event(&mut events).await? {
        EncoderEvent::StrategyChanged { from, to, .. } => {
            assert_eq!(from, Strategy::HardwareHevc);
            assert_eq!(to, Strategy::HardwareH264);
        }
        other => anyhow::bail!("unexpected event {:?}", other),
    }
    // the failed frame is discarded
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::FrameDone { output: None }
    ));

    assert!(handle.encode_frame(frame()));
    match next_event(&mut events).await? {
        EncoderEvent::FrameDone { output: Some(out) } => {
            assert_eq!(out.strategy, Strategy::HardwareH264)
        }
        other => anyhow::bail!("unexpected event {:?}", other),
    }
    let telemetry = handle.telemetry();
    assert_eq!(telemetry.strategy, Strategy::HardwareH264);
    assert_eq!(telemetry.fallbacks, 1);
    assert!(factory.stopped.lock().unwrap().contains(&Strategy::HardwareHevc));
    Ok(())
}

#[tokio::test]
async fn test_refused_strategy_is_skipped() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().script(Strategy::SoftwareHevc, Script::RefuseCreate));
    let backend = backend(
        &[Strategy::SoftwareHevc, Strategy::SoftwareH264, Strategy::Jpeg],
        EncoderProbe::with_encoders(["libx264", "libx265"]),
        factory.clone(),
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    assert!(handle.encode_frame(frame()));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::StrategyChanged {
            to: Strategy::SoftwareH264,
            ..
        }
    ));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::FrameDone { output: None }
    ));
    assert_eq!(handle.strategy(), Strategy::SoftwareH264);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_chain_fails_encoder() -> anyhow::Result<()> {
    let factory = Arc::new(
        ScriptedFactory::new()
            .script(Strategy::SoftwareH264, Script::FatalAfter(0))
            .script(Strategy::Jpeg, Script::FatalAfter(1)),
    );
    let backend = backend(
        &[Strategy::SoftwareH264, Strategy::Jpeg],
        EncoderProbe::with_encoders(["libx264"]),
        factory,
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;

    assert!(handle.encode_frame(frame()));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::StrategyChanged { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::FrameDone { output: None }
    ));

    assert!(handle.encode_frame(frame()));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::FrameDone { output: Some(_) }
    ));

    assert!(handle.encode_frame(frame()));
    assert!(matches!(
        next_event(&mut events).await?,
        EncoderEvent::Exhausted { .. }
    ));
    assert!(handle.is_failed());
    assert!(handle.telemetry().failed);
    assert!(!handle.encode_frame(frame()));
    Ok(())
}

#[tokio::test]
async fn test_rejected_frame_keeps_strategy() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().script(Strategy::SoftwareH264, Script::RejectFrames));
    let backend = backend(
        &[Strategy::SoftwareH264, Strategy::Jpeg],
        EncoderProbe::with_encoders(["libx264"]),
        factory,
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    for _ in 0..3 {
        assert!(handle.encode_frame(frame()));
        assert!(matches!(
            next_event(&mut events).await?,
            EncoderEvent::FrameDone { output: None }
        ));
    }
    assert_eq!(handle.strategy(), Strategy::SoftwareH264);
    assert_eq!(handle.telemetry().fallbacks, 0);
    Ok(())
}

#[tokio::test]
async fn test_update_options_applies_before_next_frame() -> anyhow::Result<()> {
    let backend = backend(
        &[Strategy::Jpeg],
        EncoderProbe::none(),
        Arc::new(ScriptedFactory::new()),
    );
    let (_handle, mut events) = backend.create_encoder("e1", options())?;
    backend.update_options(
        "e1",
        EncoderUpdate {
            bitrate_kbps: Some(600),
            frame_rate: Some(15),
            ..Default::default()
        },
    )?;
    assert!(backend.encode_frame("e1", frame()));
    next_event(&mut events).await?;

    let telemetry = backend.telemetry("e1")?;
    assert_eq!(telemetry.bitrate_kbps, 600);
    assert_eq!(telemetry.frame_rate, 15);
    Ok(())
}

#[tokio::test]
async fn test_buffered_frames_are_not_counted_as_encoded() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().script(Strategy::Jpeg, Script::Buffering));
    let backend = backend(&[Strategy::Jpeg], EncoderProbe::none(), factory);
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    for _ in 0..3 {
        assert!(handle.encode_frame(frame()));
        assert!(matches!(
            next_event(&mut events).await?,
            EncoderEvent::FrameDone { output: None }
        ));
    }
    let telemetry = handle.telemetry();
    assert_eq!(telemetry.frames_encoded, 0);
    assert_eq!(telemetry.frames_buffered, 3);
    assert_eq!(telemetry.rolling_latency_ms, 0.0);
    Ok(())
}

async fn encode(handle: &EncoderHandle, events: &mut EncoderEvents) -> anyhow::Result<EncoderEvent> {
    assert!(handle.encode_frame(frame()));
    next_event(events).await
}

#[tokio::test(start_paused = true)]
async fn test_rate_changes_restart_at_most_once_per_interval() -> anyhow::Result<()> {
    let factory = Arc::new(ScriptedFactory::new().fixed_options());
    let backend = backend(
        &[Strategy::SoftwareH264, Strategy::Jpeg],
        EncoderProbe::with_encoders(["libx264"]),
        factory.clone(),
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    let rate = |bitrate_kbps: u32| EncoderUpdate {
        bitrate_kbps: Some(bitrate_kbps),
        ..Default::default()
    };

    encode(&handle, &mut events).await?;
    assert_eq!(factory.created().len(), 1);

    // big move, but the worker is too young to restart
    backend.update_options("e1", rate(600))?;
    encode(&handle, &mut events).await?;
    backend.update_options("e1", rate(550))?;
    encode(&handle, &mut events).await?;
    assert_eq!(factory.created().len(), 1);

    // the deferred change lands once the interval has passed
    tokio::time::sleep(Duration::from_secs(6)).await;
    encode(&handle, &mut events).await?;
    assert_eq!(factory.created().len(), 2);

    // small move stays deferred even after the interval
    tokio::time::sleep(Duration::from_secs(6)).await;
    backend.update_options("e1", rate(530))?;
    encode(&handle, &mut events).await?;
    assert_eq!(factory.created().len(), 2);
    assert_eq!(handle.telemetry().bitrate_kbps, 530);

    // a resolution change cannot wait
    backend.update_options(
        "e1",
        EncoderUpdate {
            width: Some(4),
            height: Some(4),
            ..Default::default()
        },
    )?;
    encode(&handle, &mut events).await?;
    assert_eq!(factory.created(), vec![Strategy::SoftwareH264; 3]);
    Ok(())
}

#[tokio::test]
async fn test_destroy_is_idempotent() -> anyhow::Result<()> {
    let backend = backend(
        &[Strategy::Jpeg],
        EncoderProbe::none(),
        Arc::new(ScriptedFactory::new().delay(Duration::from_secs(10))),
    );
    let (handle, mut events) = backend.create_encoder("e1", options())?;
    assert!(matches!(
        backend.create_encoder("e1", options()),
        Err(RbiError::InvalidArgument(_))
    ));

    // destroying with a frame in flight abandons it
    assert!(handle.encode_frame(frame()));
    assert!(backend.destroy_encoder("e1"));
    assert!(!backend.destroy_encoder("e1"));
    assert!(!backend.encode_frame("e1", frame()));
    assert!(backend.telemetry("e1").is_err_and(|e| e.is_not_found()));
    assert!(!handle.encode_frame(frame()));

    // worker exits without completing the frame
    let closed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await?;
    assert!(closed.is_none());
    Ok(())
}
