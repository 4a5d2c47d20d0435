//! End-to-end pipeline tests over the synthetic camera, codec and link.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use peercam::testing::{CodecProbe, TestCamera, TestCodec, TestLink};
use peercam::{
    FrameLink, Pipeline, PipelineCommand, PipelineEvent, StreamSettings,
};

struct Harness {
    pipeline: Pipeline,
    events: mpsc::Receiver<PipelineEvent>,
    link: Arc<TestLink>,
    probe: CodecProbe,
    camera: CameraHandles,
}

struct CameraHandles {
    configured: Arc<std::sync::Mutex<Vec<peercam::CaptureConfig>>>,
}

fn harness() -> Harness {
    harness_with_link(Arc::new(TestLink::new()))
}

fn harness_with_link(link: Arc<TestLink>) -> Harness {
    let camera = TestCamera::new();
    let configured = camera.configured_sessions();
    let probe = CodecProbe::new();
    let factory_probe = probe.clone();
    let (events_tx, events) = mpsc::channel(512);

    let pipeline = Pipeline::new(
        Box::new(camera),
        Box::new(move || Box::new(TestCodec::new(factory_probe.clone()))),
        Arc::clone(&link) as Arc<dyn FrameLink>,
        StreamSettings {
            // Keep the recommendation static so assertions are deterministic
            adaptive_bitrate: false,
            ..StreamSettings::default()
        },
        events_tx,
    );

    Harness {
        pipeline,
        events,
        link,
        probe,
        camera: CameraHandles { configured },
    }
}

fn start_command() -> PipelineCommand {
    PipelineCommand::StartCapture {
        camera_id: "back".to_string(),
        width: 1280,
        height: 720,
        fps: 30,
    }
}

/// Wait for an event matching `pred`, skipping everything else.
async fn expect_event(
    events: &mut mpsc::Receiver<PipelineEvent>,
    pred: impl Fn(&PipelineEvent) -> bool,
) -> PipelineEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for pipeline event")
            .expect("pipeline event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn streams_config_then_tagged_frames_in_order() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(start_command()).await);

    expect_event(&mut h.events, |e| *e == PipelineEvent::StreamStarted).await;
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;

    // Let a few dozen frames flow
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_ok!(h.pipeline.command(PipelineCommand::StopCapture).await);
    // Capture and transport stop concurrently; accept either order
    let mut saw_capture_stop = false;
    let mut saw_stream_stop = false;
    while !(saw_capture_stop && saw_stream_stop) {
        match expect_event(&mut h.events, |e| {
            matches!(e, PipelineEvent::CaptureStopped | PipelineEvent::StreamStopped)
        })
        .await
        {
            PipelineEvent::CaptureStopped => saw_capture_stop = true,
            PipelineEvent::StreamStopped => saw_stream_stop = true,
            _ => unreachable!(),
        }
    }

    let sent = h.link.sent();
    assert!(sent.len() > 10, "expected a stream, got {} packets", sent.len());

    // Decoder configuration travels first, then a keyframe, then deltas
    assert_eq!(sent[0].header.frame_type, "config");
    assert_eq!(sent[0].header.sequence, 0);
    assert_eq!(sent[0].header.timestamp_us, 0);
    assert_eq!(sent[1].header.frame_type, "key");

    // Wire sequences of picture frames are contiguous from zero
    let sequences: Vec<u64> = sent
        .iter()
        .filter(|p| p.header.frame_type != "config")
        .map(|p| p.header.sequence)
        .collect();
    let expected: Vec<u64> = (0..sequences.len() as u64).collect();
    assert_eq!(sequences, expected);

    // Timestamps on picture frames are strictly increasing
    let timestamps: Vec<u64> = sent
        .iter()
        .filter(|p| p.header.frame_type != "config")
        .map(|p| p.header.timestamp_us)
        .collect();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn switch_camera_restarts_capture_but_not_the_stream() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(start_command()).await);
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_ok!(
        h.pipeline
            .command(PipelineCommand::SwitchCamera {
                camera_id: "front".to_string(),
            })
            .await
    );
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStopped).await;
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;

    let sessions = h.camera.configured.lock().unwrap().clone();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].camera_id, "back");
    assert_eq!(sessions[1].camera_id, "front");
    // The output format carries over unchanged
    assert_eq!(
        (sessions[1].width, sessions[1].height, sessions[1].fps),
        (1280, 720, 30)
    );

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn change_resolution_restarts_session_with_fresh_config() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(start_command()).await);
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_ok!(
        h.pipeline
            .command(PipelineCommand::ChangeResolution {
                width: 640,
                height: 480,
            })
            .await
    );
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sessions = h.camera.configured.lock().unwrap().clone();
    assert_eq!(sessions.len(), 2);
    assert_eq!((sessions[1].width, sessions[1].height), (640, 480));

    // The new encoder sent fresh decoder configuration, while the stream
    // itself carried on: wire sequences never restarted
    let sent = h.link.sent();
    let config_count = sent.iter().filter(|p| p.header.frame_type == "config").count();
    assert!(config_count >= 2, "each encoder sends its own config");
    let sequences: Vec<u64> = sent
        .iter()
        .filter(|p| p.header.frame_type != "config")
        .map(|p| p.header.sequence)
        .collect();
    let expected: Vec<u64> = (0..sequences.len() as u64).collect();
    assert_eq!(sequences, expected, "one uninterrupted wire sequence");

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn fps_change_is_live_and_keeps_the_session() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(start_command()).await);
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;

    assert_ok!(h.pipeline.command(PipelineCommand::ChangeFps { fps: 15 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one session configured: no teardown happened
    assert_eq!(h.camera.configured.lock().unwrap().len(), 1);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn connection_loss_ends_the_whole_session() {
    let link = Arc::new(TestLink::new());
    link.push_failure(peercam::LinkError::connection_lost("peer closed"));
    let mut h = harness_with_link(link);

    assert_ok!(h.pipeline.command(start_command()).await);

    // The first packet hits the scripted failure; the pipeline must report a
    // stream error and tear capture down
    match expect_event(&mut h.events, |e| matches!(e, PipelineEvent::StreamError(_))).await {
        PipelineEvent::StreamError(message) => assert!(message.contains("connection lost")),
        _ => unreachable!(),
    }
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStopped).await;

    // Nothing reaches the link afterwards
    tokio::time::sleep(Duration::from_millis(200)).await;
    let attempts_after_loss = h.link.send_attempts();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.link.send_attempts(), attempts_after_loss);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn target_bitrate_override_reaches_the_codec() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(start_command()).await);
    expect_event(&mut h.events, |e| *e == PipelineEvent::CaptureStarted).await;

    assert_ok!(
        h.pipeline
            .command(PipelineCommand::SetTargetBitrate { kbps: 3000 })
            .await
    );
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.probe.applied_bitrate_kbps() != 3000 {
        assert!(tokio::time::Instant::now() < deadline, "bitrate never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Out-of-range overrides are clamped before reaching the codec
    assert_ok!(
        h.pipeline
            .command(PipelineCommand::SetTargetBitrate { kbps: 50_000 })
            .await
    );
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.probe.applied_bitrate_kbps() != 8000 {
        assert!(tokio::time::Instant::now() < deadline, "clamped bitrate never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn stop_while_idle_is_quiet() {
    let mut h = harness();
    assert_ok!(h.pipeline.command(PipelineCommand::StopCapture).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.events.try_recv().is_err(), "no events expected while idle");
    h.pipeline.shutdown().await;
}
