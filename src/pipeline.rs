//! Pipeline orchestration
//!
//! Owns the capture controller, the per-session encoder and the stream
//! transport, and wires their event streams together on a single worker
//! task: raw frames flow camera → encoder → transport, while control
//! commands and lifecycle events flow through here. The encoder cannot
//! survive a resolution change, so it is created fresh for every session;
//! the controller and transport live as long as the pipeline.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{
    CameraBackend, CaptureConfig, CaptureController, CaptureEvent, RawFrameSink,
};
use crate::command::{PipelineCommand, StreamSettings};
use crate::encode::{Encoder, EncoderConfig, EncoderEvent, EncoderState, VideoCodec};
use crate::link::FrameLink;
use crate::transport::{StreamEvent, StreamTransport};

/// Builds a fresh codec for each streaming session.
pub type CodecFactory = Box<dyn Fn() -> Box<dyn VideoCodec> + Send + Sync>;

/// Everything the application observes about the running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    CaptureStarted,
    CaptureStopped,
    CaptureError(String),
    /// A raw frame left the camera; advisory, dropped when the consumer is
    /// behind
    FrameCaptured(u64),
    EncoderError(String),
    StreamStarted,
    StreamStopped,
    /// The link is gone; the session has been torn down
    StreamError(String),
    /// Periodic observed throughput in kbps
    BandwidthUpdate(u32),
    Congestion,
}

/// The full capture → encode → send chain behind a command channel.
pub struct Pipeline {
    commands: mpsc::Sender<PipelineCommand>,
    worker: JoinHandle<()>,
}

impl Pipeline {
    /// Assemble a pipeline over the given hardware seams. Nothing runs until
    /// a [`PipelineCommand::StartCapture`] arrives.
    pub fn new(
        backend: Box<dyn CameraBackend>,
        codec_factory: CodecFactory,
        link: Arc<dyn FrameLink>,
        settings: StreamSettings,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        let settings = settings.normalized();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (capture_tx, capture_rx) = mpsc::channel(64);
        let (encoder_tx, encoder_rx) = mpsc::channel(64);
        let (stream_tx, stream_rx) = mpsc::channel(64);

        let initial_bitrate_kbps = settings.bitrate_kbps;
        let controller = CaptureController::new(backend, capture_tx);
        let transport = StreamTransport::new(
            link,
            initial_bitrate_kbps,
            settings.adaptive_bitrate,
            stream_tx,
        );

        let worker = PipelineWorker {
            controller: Some(controller),
            transport,
            codec_factory,
            settings,
            encoder: None,
            encoder_tx,
            session_config: None,
            applied_bitrate_kbps: initial_bitrate_kbps,
            events,
        };
        let worker = tokio::spawn(worker.run(command_rx, capture_rx, encoder_rx, stream_rx));

        Self {
            commands: command_tx,
            worker,
        }
    }

    /// Submit a control command. Applied asynchronously, in order.
    pub async fn command(&self, command: PipelineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("pipeline worker is gone"))
    }

    /// Tear everything down and wait (bounded) for the worker to finish.
    pub async fn shutdown(self) {
        drop(self.commands);
        if tokio::time::timeout(Duration::from_secs(5), self.worker)
            .await
            .is_err()
        {
            warn!("Pipeline worker did not stop within 5s");
        }
    }
}

struct PipelineWorker {
    controller: Option<CaptureController>,
    transport: StreamTransport,
    codec_factory: CodecFactory,
    settings: StreamSettings,
    encoder: Option<Encoder>,
    encoder_tx: mpsc::Sender<EncoderEvent>,
    session_config: Option<CaptureConfig>,
    applied_bitrate_kbps: u32,
    events: mpsc::Sender<PipelineEvent>,
}

impl PipelineWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<PipelineCommand>,
        mut capture: mpsc::Receiver<CaptureEvent>,
        mut encoder: mpsc::Receiver<EncoderEvent>,
        mut stream: mpsc::Receiver<StreamEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = capture.recv() => self.handle_capture_event(event).await,
                Some(event) = encoder.recv() => self.handle_encoder_event(event).await,
                Some(event) = stream.recv() => self.handle_stream_event(event).await,
            }
        }

        self.stop_session().await;
        if let Some(controller) = self.controller.take() {
            controller.shutdown().await;
        }
        debug!("Pipeline worker exited");
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::StartCapture {
                camera_id,
                width,
                height,
                fps,
            } => {
                self.start_session(CaptureConfig {
                    camera_id,
                    width,
                    height,
                    fps,
                })
                .await;
            }
            PipelineCommand::StopCapture => self.stop_session().await,
            PipelineCommand::SwitchCamera { camera_id } => {
                // The output format is unchanged, so the running encoder and
                // its sink carry over
                if let (Some(config), Some(controller)) =
                    (self.session_config.as_mut(), self.controller.as_ref())
                {
                    config.camera_id = camera_id.clone();
                    if let Err(e) = controller.switch_camera(camera_id).await {
                        warn!("switchCamera failed: {e:#}");
                    }
                } else {
                    warn!("switchCamera with no active session; ignoring");
                }
            }
            PipelineCommand::ChangeResolution { width, height } => {
                // A new output format needs a new encoder; restart the whole
                // session with the fresh input sink
                let Some(mut config) = self.session_config.clone() else {
                    warn!("changeResolution with no active session; ignoring");
                    return;
                };
                config.width = width;
                config.height = height;
                self.start_session(config).await;
            }
            PipelineCommand::ChangeFps { fps } => {
                if let (Some(config), Some(controller)) =
                    (self.session_config.as_mut(), self.controller.as_ref())
                {
                    config.fps = fps;
                    if let Err(e) = controller.change_fps(fps).await {
                        warn!("changeFps failed: {e:#}");
                    }
                } else {
                    warn!("changeFps with no active session; ignoring");
                }
            }
            PipelineCommand::SetFlashEnabled { enabled } => {
                if let Some(controller) = self.controller.as_ref() {
                    if let Err(e) = controller.set_flash_enabled(enabled).await {
                        warn!("setFlashEnabled failed: {e:#}");
                    }
                }
            }
            PipelineCommand::SetTargetBitrate { kbps } => {
                self.transport.set_target_bitrate(kbps);
                self.apply_target_bitrate();
            }
            PipelineCommand::SetAdaptiveBitrate { enabled } => {
                self.transport.set_adaptive(enabled);
                info!(
                    "Adaptive bitrate {}",
                    if enabled { "enabled" } else { "disabled" }
                );
            }
        }
    }

    /// Bring up transport, a fresh encoder and capture for `config`. Any
    /// running session is torn down first.
    async fn start_session(&mut self, config: CaptureConfig) {
        if self.encoder.is_some() {
            self.teardown_encoder();
        }

        self.transport.start().await;

        let mut encoder = Encoder::new((self.codec_factory)(), self.encoder_tx.clone());
        let encoder_config = EncoderConfig {
            width: config.width,
            height: config.height,
            fps: config.fps,
            bitrate_kbps: self.transport.target_bitrate_kbps(),
            low_latency: self.settings.low_latency,
        };
        self.applied_bitrate_kbps = encoder_config.bitrate_kbps;

        let sink = match bring_up_encoder(&mut encoder, &encoder_config) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Encoder bring-up failed: {e:#}");
                encoder.release();
                self.transport.stop().await;
                let _ = self
                    .events
                    .send(PipelineEvent::EncoderError(format!("{e:#}")))
                    .await;
                return;
            }
        };
        self.encoder = Some(encoder);

        self.session_config = Some(config.clone());
        if let Some(controller) = self.controller.as_ref() {
            if let Err(e) = controller.start_capture(config, sink).await {
                warn!("startCapture failed: {e:#}");
            }
        }
    }

    async fn stop_session(&mut self) {
        if let Some(controller) = self.controller.as_ref() {
            if let Err(e) = controller.stop_capture().await {
                warn!("stopCapture failed: {e:#}");
            }
        }
        self.teardown_encoder();
        self.session_config = None;
        self.transport.stop().await;
    }

    fn teardown_encoder(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            if encoder.state() == EncoderState::Running {
                if let Err(e) = encoder.stop() {
                    debug!("Encoder stop during teardown: {e:#}");
                }
            }
            encoder.release();
        }
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Started => self.emit(PipelineEvent::CaptureStarted).await,
            CaptureEvent::Stopped => self.emit(PipelineEvent::CaptureStopped).await,
            CaptureEvent::Error(message) => {
                self.emit(PipelineEvent::CaptureError(message)).await
            }
            CaptureEvent::FrameCaptured(timestamp_us) => {
                let _ = self
                    .events
                    .try_send(PipelineEvent::FrameCaptured(timestamp_us));
            }
        }
    }

    async fn handle_encoder_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::Frame(frame) => self.transport.send_frame(frame).await,
            EncoderEvent::ConfigAvailable(units) => self.transport.send_config(&units).await,
            EncoderEvent::Error(message) => {
                self.emit(PipelineEvent::EncoderError(message)).await
            }
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Started => self.emit(PipelineEvent::StreamStarted).await,
            StreamEvent::Stopped => self.emit(PipelineEvent::StreamStopped).await,
            StreamEvent::Error(message) => {
                // Connection lost: the transport already went inactive, so
                // finish tearing down capture and encode
                self.stop_session().await;
                self.emit(PipelineEvent::StreamError(message)).await;
            }
            StreamEvent::Bandwidth(kbps) => {
                self.apply_target_bitrate();
                self.emit(PipelineEvent::BandwidthUpdate(kbps)).await;
            }
            StreamEvent::Congestion => {
                self.apply_target_bitrate();
                self.emit(PipelineEvent::Congestion).await;
            }
        }
    }

    /// Push the transport's current bitrate recommendation into the encoder
    /// when it has moved.
    fn apply_target_bitrate(&mut self) {
        let target = self.transport.target_bitrate_kbps();
        if target == self.applied_bitrate_kbps {
            return;
        }
        self.applied_bitrate_kbps = target;
        if let Some(encoder) = self.encoder.as_mut() {
            info!("Applying recommended bitrate: {target} kbps");
            encoder.set_bitrate(target);
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event).await;
    }
}

fn bring_up_encoder(encoder: &mut Encoder, config: &EncoderConfig) -> Result<RawFrameSink> {
    encoder.configure(config)?;
    let sink = encoder.input_sink()?;
    encoder.start()?;
    Ok(sink)
}
