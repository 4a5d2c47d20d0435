//! Capture controller: serialized access to the camera device
//!
//! All hardware transitions run on a single worker task driven by a command
//! channel, so open/close/reconfigure can never interleave. Callers observe
//! completion through [`CaptureEvent`]s, never through return values; the
//! lifecycle callbacks are the only truth.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{
    CameraBackend, CameraHandle, CaptureConfig, DeviceFault, RawFrame, RawFrameSink, RequestParams,
};

/// Capture state machine.
///
/// `Idle → Opening → SessionConfiguring → Streaming → Stopping → Idle`, with
/// `Error` reachable from the middle states on unrecoverable device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Opening,
    SessionConfiguring,
    Streaming,
    Stopping,
    Error,
}

/// Lifecycle events reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A session reached `Streaming`
    Started,
    /// A session was torn down
    Stopped,
    /// A device fault or precondition failure, one message per occurrence
    Error(String),
    /// A raw frame left the hardware (timestamp in microseconds)
    FrameCaptured(u64),
}

enum CaptureCommand {
    Start {
        config: CaptureConfig,
        sink: RawFrameSink,
    },
    Stop,
    Switch {
        camera_id: String,
    },
    SetResolution {
        width: u32,
        height: u32,
    },
    SetFps {
        fps: u32,
    },
    SetFlash {
        enabled: bool,
    },
}

/// Owns the capture device behind a single serialized worker.
pub struct CaptureController {
    commands: mpsc::Sender<CaptureCommand>,
    state_rx: watch::Receiver<CaptureState>,
    worker: JoinHandle<()>,
}

impl CaptureController {
    /// Spawn the capture worker around `backend`. Lifecycle events are
    /// delivered on `events`.
    pub fn new(backend: Box<dyn CameraBackend>, events: mpsc::Sender<CaptureEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);
        let (fault_tx, fault_rx) = mpsc::channel(8);

        let worker = tokio::spawn(
            CaptureWorker {
                backend,
                state_tx,
                events,
                session: None,
                fault_tx,
            }
            .run(command_rx, fault_rx),
        );

        Self {
            commands: command_tx,
            state_rx,
            worker,
        }
    }

    /// Begin capturing with `config`, delivering raw frames into `sink`.
    ///
    /// If a session is already streaming it is stopped first. Completes
    /// asynchronously; watch for [`CaptureEvent::Started`].
    pub async fn start_capture(&self, config: CaptureConfig, sink: RawFrameSink) -> Result<()> {
        self.send(CaptureCommand::Start { config, sink }).await
    }

    /// Tear down the current session. Idempotent; safe from any state.
    pub async fn stop_capture(&self) -> Result<()> {
        self.send(CaptureCommand::Stop).await
    }

    /// Stop, then restart on a different camera with the previous
    /// width/height/fps and sink. A single compound transition: no other
    /// command can interleave between the stop and the restart.
    pub async fn switch_camera(&self, camera_id: impl Into<String>) -> Result<()> {
        self.send(CaptureCommand::Switch {
            camera_id: camera_id.into(),
        })
        .await
    }

    /// Stop, then restart at a new resolution. The output format is fixed at
    /// session-configure time, so this is never a live update.
    pub async fn change_resolution(&self, width: u32, height: u32) -> Result<()> {
        self.send(CaptureCommand::SetResolution { width, height })
            .await
    }

    /// Update the repeating request's frame-rate range in place.
    ///
    /// Unlike resolution changes this does not tear the session down; the
    /// frame rate is a per-request parameter, not part of the output format.
    pub async fn change_fps(&self, fps: u32) -> Result<()> {
        self.send(CaptureCommand::SetFps { fps }).await
    }

    /// Toggle torch illumination by rebuilding the repeating request.
    pub async fn set_flash_enabled(&self, enabled: bool) -> Result<()> {
        self.send(CaptureCommand::SetFlash { enabled }).await
    }

    /// Current state of the capture state machine.
    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    /// Whether a session is currently streaming.
    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Streaming
    }

    /// Stop the worker and wait (bounded) for it to finish. Any active
    /// session is torn down first.
    pub async fn shutdown(self) {
        drop(self.commands);
        if tokio::time::timeout(Duration::from_secs(2), self.worker)
            .await
            .is_err()
        {
            warn!("Capture worker did not stop within 2s");
        }
    }

    async fn send(&self, cmd: CaptureCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("capture worker is gone"))
    }
}

struct ActiveSession {
    handle: Box<dyn CameraHandle>,
    config: CaptureConfig,
    sink: RawFrameSink,
    params: RequestParams,
}

struct CaptureWorker {
    backend: Box<dyn CameraBackend>,
    state_tx: watch::Sender<CaptureState>,
    events: mpsc::Sender<CaptureEvent>,
    session: Option<ActiveSession>,
    fault_tx: mpsc::Sender<DeviceFault>,
}

impl CaptureWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<CaptureCommand>,
        mut faults: mpsc::Receiver<DeviceFault>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Controller dropped; tear down and exit
                        self.stop_session(false).await;
                        break;
                    }
                },
                Some(fault) = faults.recv() => self.handle_fault(fault).await,
            }
        }
        debug!("Capture worker exited");
    }

    async fn handle_command(&mut self, cmd: CaptureCommand) {
        match cmd {
            CaptureCommand::Start { config, sink } => {
                if self.state() == CaptureState::Streaming {
                    warn!("startCapture while streaming; stopping current session first");
                    self.stop_session(true).await;
                }
                self.start_session(config, sink).await;
            }
            CaptureCommand::Stop => self.stop_session(true).await,
            CaptureCommand::Switch { camera_id } => {
                let Some(prev) = self.session.as_ref() else {
                    warn!("switchCamera with no active session; ignoring");
                    return;
                };
                let config = CaptureConfig {
                    camera_id,
                    ..prev.config.clone()
                };
                let sink = prev.sink.clone();
                self.stop_session(true).await;
                self.start_session(config, sink).await;
            }
            CaptureCommand::SetResolution { width, height } => {
                let Some(prev) = self.session.as_ref() else {
                    warn!("changeResolution with no active session; ignoring");
                    return;
                };
                let config = CaptureConfig {
                    width,
                    height,
                    ..prev.config.clone()
                };
                let sink = prev.sink.clone();
                self.stop_session(true).await;
                self.start_session(config, sink).await;
            }
            CaptureCommand::SetFps { fps } => {
                let Some(session) = self.session.as_mut() else {
                    warn!("changeFps with no active session; ignoring");
                    return;
                };
                session.params.fps = fps;
                session.config.fps = fps;
                let params = session.params;
                if let Err(fault) = session.handle.set_repeating(&params) {
                    self.handle_fault(fault).await;
                } else {
                    info!("Repeating request updated to {fps} fps");
                }
            }
            CaptureCommand::SetFlash { enabled } => {
                let Some(session) = self.session.as_mut() else {
                    warn!("setFlashEnabled with no active session; ignoring");
                    return;
                };
                session.params.flash = enabled;
                let params = session.params;
                if let Err(fault) = session.handle.set_repeating(&params) {
                    self.handle_fault(fault).await;
                } else {
                    debug!("Flash {}", if enabled { "enabled" } else { "disabled" });
                }
            }
        }
    }

    async fn start_session(&mut self, config: CaptureConfig, sink: RawFrameSink) {
        // Precondition check, before any hardware call
        if !self.backend.has_permission() {
            warn!("Capture permission not granted");
            self.emit(CaptureEvent::Error(
                DeviceFault::PermissionDenied.describe().to_string(),
            ))
            .await;
            return;
        }

        info!(
            "Opening camera {} at {}x{}@{}fps",
            config.camera_id, config.width, config.height, config.fps
        );
        self.set_state(CaptureState::Opening);
        let mut handle = match self.backend.open(&config.camera_id) {
            Ok(handle) => handle,
            Err(fault) => {
                self.fail(fault, None).await;
                return;
            }
        };

        self.set_state(CaptureState::SessionConfiguring);
        let inner_sink = self.spawn_frame_forwarder(sink.clone());
        if let Err(fault) = handle.configure_session(&config, inner_sink, self.fault_tx.clone()) {
            self.fail(fault, Some(handle)).await;
            return;
        }

        let params = RequestParams {
            fps: config.fps,
            flash: false,
        };
        if let Err(fault) = handle.set_repeating(&params) {
            self.fail(fault, Some(handle)).await;
            return;
        }

        self.session = Some(ActiveSession {
            handle,
            config,
            sink,
            params,
        });
        self.set_state(CaptureState::Streaming);
        self.emit(CaptureEvent::Started).await;
    }

    /// Best-effort teardown; a no-op (without events) when already idle.
    async fn stop_session(&mut self, emit_stopped: bool) {
        let Some(mut session) = self.session.take() else {
            if self.state() == CaptureState::Error {
                self.set_state(CaptureState::Idle);
            }
            debug!("stopCapture while idle; nothing to do");
            return;
        };

        self.set_state(CaptureState::Stopping);
        if let Err(fault) = session.handle.stop_repeating() {
            warn!("Failed to stop repeating request: {fault}");
        }
        session.handle.close();
        self.set_state(CaptureState::Idle);
        if emit_stopped {
            self.emit(CaptureEvent::Stopped).await;
        }
        info!("Capture stopped");
    }

    async fn handle_fault(&mut self, fault: DeviceFault) {
        let Some(mut session) = self.session.take() else {
            // Fault from a session that was already torn down
            debug!("Ignoring stale device fault: {fault}");
            return;
        };
        warn!("Device fault while streaming: {fault}");
        self.set_state(CaptureState::Error);
        session.handle.close();
        self.emit(CaptureEvent::Error(fault.describe().to_string()))
            .await;
        self.set_state(CaptureState::Idle);
    }

    async fn fail(&mut self, fault: DeviceFault, handle: Option<Box<dyn CameraHandle>>) {
        warn!("Capture failed: {fault}");
        self.set_state(CaptureState::Error);
        if let Some(mut handle) = handle {
            handle.close();
        }
        self.emit(CaptureEvent::Error(fault.describe().to_string()))
            .await;
        self.set_state(CaptureState::Idle);
    }

    /// Relay raw frames to the downstream sink, surfacing a FrameCaptured
    /// event per frame. The forwarder ends when the hardware drops its
    /// sender side (session closed).
    fn spawn_frame_forwarder(&self, sink: RawFrameSink) -> RawFrameSink {
        let (inner_tx, mut inner_rx) = mpsc::channel::<RawFrame>(8);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(frame) = inner_rx.recv().await {
                // Advisory event; dropping it under load is fine
                let _ = events.try_send(CaptureEvent::FrameCaptured(frame.timestamp_us));
                // A full sink means the encoder is behind; the hardware's own
                // behavior is to drop the frame, so mirror that here
                if let Err(mpsc::error::TrySendError::Closed(_)) = sink.try_send(frame) {
                    break;
                }
            }
        });
        inner_tx
    }

    fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: CaptureState) {
        let _ = self.state_tx.send(state);
    }

    async fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event).await;
    }
}
