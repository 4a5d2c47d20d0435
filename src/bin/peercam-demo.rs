//! End-to-end demo over the synthetic camera, codec and link.
//!
//! Runs a short streaming session, exercises the live controls and prints
//! pipeline events. Configuration comes from the environment:
//!
//! ```text
//! PEERCAM_CAMERA=back PEERCAM_WIDTH=1280 PEERCAM_HEIGHT=720 \
//! PEERCAM_FPS=30 PEERCAM_BITRATE_KBPS=2000 RUST_LOG=info cargo run
//! ```

use anyhow::Result;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peercam::testing::{CodecProbe, TestCamera, TestCodec, TestLink};
use peercam::{Pipeline, PipelineCommand, PipelineEvent, StreamSettings};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let camera_id: String = env_or("PEERCAM_CAMERA", "back".to_string());
    let width = env_or("PEERCAM_WIDTH", 1280u32);
    let height = env_or("PEERCAM_HEIGHT", 720u32);
    let fps = env_or("PEERCAM_FPS", 30u32);
    let bitrate_kbps = env_or("PEERCAM_BITRATE_KBPS", 2000u32);

    let link = Arc::new(TestLink::new());
    let (events_tx, mut events) = mpsc::channel(256);
    let pipeline = Pipeline::new(
        Box::new(TestCamera::new()),
        Box::new(|| Box::new(TestCodec::new(CodecProbe::new()))),
        Arc::clone(&link) as Arc<dyn peercam::FrameLink>,
        StreamSettings {
            bitrate_kbps,
            ..StreamSettings::default()
        },
        events_tx,
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::FrameCaptured(_) => {}
                PipelineEvent::BandwidthUpdate(kbps) => info!("bandwidth: {kbps} kbps"),
                other => info!("event: {other:?}"),
            }
        }
    });

    info!("Starting capture on camera {camera_id} at {width}x{height}@{fps}fps");
    pipeline
        .command(PipelineCommand::StartCapture {
            camera_id,
            width,
            height,
            fps,
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Lowering frame rate to 15 fps (live update)");
    pipeline
        .command(PipelineCommand::ChangeFps { fps: 15 })
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("Switching to the front camera");
    pipeline
        .command(PipelineCommand::SwitchCamera {
            camera_id: "front".to_string(),
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("Dropping to 640x480 (session restart)");
    pipeline
        .command(PipelineCommand::ChangeResolution {
            width: 640,
            height: 480,
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    pipeline.command(PipelineCommand::StopCapture).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.shutdown().await;
    printer.abort();

    let sent = link.sent();
    let keys = sent.iter().filter(|p| p.header.frame_type == "key").count();
    let deltas = sent.iter().filter(|p| p.header.frame_type == "delta").count();
    let configs = sent
        .iter()
        .filter(|p| p.header.frame_type == "config")
        .count();
    info!("Sent {} packets: {configs} config, {keys} key, {deltas} delta", sent.len());
    Ok(())
}
