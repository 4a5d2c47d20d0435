//! Hardware-accelerated video encoding
//!
//! Wraps a [`VideoCodec`] behind a small state machine, drains its async
//! output without ever blocking the capture producer, separates decoder
//! configuration from picture data, and emits tagged [`Frame`] events.

pub mod codec;
pub mod h264;

pub use codec::{BitrateMode, BufferFlags, CodecOutput, CodecProfile, CodecSettings, VideoCodec};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::RawFrameSink;
use crate::frame::{ConfigUnits, Frame, FrameKind};
use crate::protocol::clamp_bitrate_kbps;

/// Encoder configuration. Immutable once applied; only the bitrate can be
/// changed afterwards, via [`Encoder::set_bitrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Favor fast decoder recovery and predictable latency over compression
    /// efficiency
    pub low_latency: bool,
}

impl EncoderConfig {
    /// Derive the full codec configuration.
    ///
    /// Low latency: short GOP (one second), constant bitrate, zero reordering
    /// frames, baseline profile. Otherwise: long GOP, variable bitrate,
    /// reordering permitted, high profile.
    pub fn derive(&self) -> CodecSettings {
        if self.low_latency {
            CodecSettings {
                width: self.width,
                height: self.height,
                fps: self.fps,
                bitrate_kbps: self.bitrate_kbps,
                gop_frames: self.fps,
                mode: BitrateMode::Constant,
                b_frames: 0,
                profile: CodecProfile::Baseline,
            }
        } else {
            CodecSettings {
                width: self.width,
                height: self.height,
                fps: self.fps,
                bitrate_kbps: self.bitrate_kbps,
                gop_frames: self.fps * 5,
                mode: BitrateMode::Variable,
                b_frames: 2,
                profile: CodecProfile::High,
            }
        }
    }
}

/// Encoder state machine. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
    Released,
}

/// Events emitted by the encoder toward the transport.
#[derive(Debug)]
pub enum EncoderEvent {
    /// One encoded picture frame; ownership transfers to the receiver
    Frame(Frame),
    /// Fresh SPS/PPS became available (initial config or mid-stream
    /// renegotiation)
    ConfigAvailable(ConfigUnits),
    /// Runtime error; non-fatal, the caller decides whether to tear down
    Error(String),
}

/// Wraps a hardware compressor and demultiplexes its output.
pub struct Encoder {
    codec: Box<dyn VideoCodec>,
    state: EncoderState,
    events: mpsc::Sender<EncoderEvent>,
    drain: Option<JoinHandle<()>>,
}

impl Encoder {
    /// A new, unconfigured encoder around `codec`.
    pub fn new(codec: Box<dyn VideoCodec>, events: mpsc::Sender<EncoderEvent>) -> Self {
        Self {
            codec,
            state: EncoderState::Unconfigured,
            events,
            drain: None,
        }
    }

    /// Apply `config` and spawn the output drain task.
    ///
    /// Valid only from `Unconfigured`. On failure the encoder stays
    /// `Unconfigured` and must be discarded and recreated.
    pub fn configure(&mut self, config: &EncoderConfig) -> Result<()> {
        if self.state != EncoderState::Unconfigured {
            bail!("configure is only valid from Unconfigured, state is {:?}", self.state);
        }

        let settings = config.derive();
        info!(
            "Configuring encoder: {}x{}@{}fps, {} kbps, gop {} frames, {:?}/{:?}",
            settings.width,
            settings.height,
            settings.fps,
            settings.bitrate_kbps,
            settings.gop_frames,
            settings.mode,
            settings.profile,
        );

        let (output_tx, output_rx) = mpsc::channel(32);
        self.codec
            .configure(&settings, output_tx)
            .context("codec configuration failed")?;

        self.drain = Some(tokio::spawn(drain_output(output_rx, self.events.clone())));
        self.state = EncoderState::Configured;
        Ok(())
    }

    /// The raw-frame input sink shared with the capture controller.
    /// Valid after `configure`.
    pub fn input_sink(&self) -> Result<RawFrameSink> {
        if self.state == EncoderState::Unconfigured || self.state == EncoderState::Released {
            bail!("input sink unavailable in state {:?}", self.state);
        }
        self.codec.input_sink()
    }

    /// Begin encoding. Valid from `Configured` or `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EncoderState::Configured | EncoderState::Stopped => {
                self.codec.start()?;
                self.state = EncoderState::Running;
                Ok(())
            }
            state => bail!("start is not valid from {state:?}"),
        }
    }

    /// Pause encoding. Valid from `Running`.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            EncoderState::Running => {
                self.codec.stop()?;
                self.state = EncoderState::Stopped;
                Ok(())
            }
            state => bail!("stop is not valid from {state:?}"),
        }
    }

    /// Release all codec resources. Reachable from any non-released state;
    /// terminal.
    pub fn release(&mut self) {
        if self.state == EncoderState::Released {
            return;
        }
        self.codec.release();
        self.state = EncoderState::Released;
        // The codec dropped its output sender; the drain task ends on its own
        self.drain.take();
        debug!("Encoder released");
    }

    /// Best-effort hint to emit a sync frame on the next output. Failures
    /// are logged, never escalated.
    pub fn request_keyframe(&mut self) {
        if self.state != EncoderState::Running {
            debug!("Keyframe request ignored in state {:?}", self.state);
            return;
        }
        if let Err(e) = self.codec.request_keyframe() {
            warn!("Keyframe request failed: {e:#}");
        }
    }

    /// Change the target bitrate, clamped to the supported range. Failures
    /// are logged and the stream continues at the previous bitrate.
    pub fn set_bitrate(&mut self, kbps: u32) {
        if self.state != EncoderState::Running {
            debug!("Bitrate change ignored in state {:?}", self.state);
            return;
        }
        let clamped = clamp_bitrate_kbps(kbps);
        if clamped != kbps {
            debug!("Bitrate {kbps} kbps clamped to {clamped} kbps");
        }
        if let Err(e) = self.codec.set_bitrate(clamped) {
            warn!("Bitrate change to {clamped} kbps failed: {e:#}");
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }
}

/// Drain the codec's output queue.
///
/// Runs on its own task so the capture pipeline is never blocked; each
/// buffer message is consumed within one loop iteration. Pure-config buffers
/// do not advance the frame sequence counter.
async fn drain_output(mut output: mpsc::Receiver<CodecOutput>, events: mpsc::Sender<EncoderEvent>) {
    let mut sequence: u64 = 0;
    let mut cached_config: Option<ConfigUnits> = None;

    while let Some(item) = output.recv().await {
        match item {
            CodecOutput::Buffer { flags, .. } if flags.is_end_of_stream() => {
                debug!("Encoder end of stream after {sequence} frames");
                break;
            }
            CodecOutput::Buffer { flags, data, .. } if flags.is_config() => {
                match h264::extract_config_units(&data) {
                    Some(units) => {
                        cached_config = Some(units.clone());
                        let _ = events.send(EncoderEvent::ConfigAvailable(units)).await;
                    }
                    None => debug!("Config buffer held no usable parameter sets this cycle"),
                }
            }
            CodecOutput::Buffer {
                flags,
                timestamp_us,
                data,
            } => {
                let kind = if flags.is_sync() {
                    FrameKind::KeyFrame
                } else {
                    FrameKind::DeltaFrame
                };
                let frame = Frame::picture(kind, sequence, timestamp_us, data);
                sequence += 1;
                if events.send(EncoderEvent::Frame(frame)).await.is_err() {
                    break;
                }
            }
            CodecOutput::FormatChanged { csd } => match h264::extract_config_units(&csd) {
                Some(units) => {
                    info!("Output format changed; refreshed parameter sets");
                    cached_config = Some(units.clone());
                    let _ = events.send(EncoderEvent::ConfigAvailable(units)).await;
                }
                None => {
                    // Fall back to the cached sets so the transport can still
                    // deliver config after a renegotiation
                    warn!("Format change carried no usable parameter sets");
                    if let Some(units) = cached_config.clone() {
                        let _ = events.send(EncoderEvent::ConfigAvailable(units)).await;
                    }
                }
            },
            CodecOutput::Fault(message) => {
                warn!("Codec fault: {message}");
                let _ = events.send(EncoderEvent::Error(message)).await;
            }
        }
    }

    debug!("Encoder drain task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RawFrame;
    use crate::testing::{CodecProbe, TestCodec};
    use bytes::Bytes;
    use std::time::Duration;

    fn low_latency_config() -> EncoderConfig {
        EncoderConfig {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2000,
            low_latency: true,
        }
    }

    async fn recv_event(rx: &mut mpsc::Receiver<EncoderEvent>) -> EncoderEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for encoder event")
            .expect("encoder event channel closed")
    }

    #[test]
    fn low_latency_derivation() {
        let settings = low_latency_config().derive();
        assert_eq!(settings.gop_frames, 30);
        assert_eq!(settings.mode, BitrateMode::Constant);
        assert_eq!(settings.b_frames, 0);
        assert_eq!(settings.profile, CodecProfile::Baseline);
    }

    #[test]
    fn quality_derivation() {
        let settings = EncoderConfig {
            low_latency: false,
            ..low_latency_config()
        }
        .derive();
        assert_eq!(settings.gop_frames, 150);
        assert_eq!(settings.mode, BitrateMode::Variable);
        assert_eq!(settings.b_frames, 2);
        assert_eq!(settings.profile, CodecProfile::High);
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let (events_tx, _events) = mpsc::channel(64);
        let mut encoder = Encoder::new(Box::new(TestCodec::new(CodecProbe::new())), events_tx);
        assert_eq!(encoder.state(), EncoderState::Unconfigured);

        assert!(encoder.input_sink().is_err());
        assert!(encoder.start().is_err());

        encoder.configure(&low_latency_config()).unwrap();
        assert_eq!(encoder.state(), EncoderState::Configured);
        assert!(encoder.configure(&low_latency_config()).is_err());
        assert!(encoder.input_sink().is_ok());

        encoder.start().unwrap();
        assert_eq!(encoder.state(), EncoderState::Running);

        encoder.stop().unwrap();
        assert_eq!(encoder.state(), EncoderState::Stopped);
        encoder.start().unwrap();

        encoder.release();
        assert_eq!(encoder.state(), EncoderState::Released);
        assert!(encoder.input_sink().is_err());
    }

    #[tokio::test]
    async fn config_first_then_tagged_frames() {
        let (events_tx, mut events) = mpsc::channel(64);
        let probe = CodecProbe::new();
        let mut encoder = Encoder::new(Box::new(TestCodec::new(probe)), events_tx);
        encoder.configure(&low_latency_config()).unwrap();
        encoder.start().unwrap();

        let sink = encoder.input_sink().unwrap();
        for i in 0..3u64 {
            sink.send(RawFrame {
                timestamp_us: i * 33_333,
                data: Bytes::from(vec![0u8; 256]),
            })
            .await
            .unwrap();
        }

        // First event: decoder configuration, with both parameter sets
        match recv_event(&mut events).await {
            EncoderEvent::ConfigAvailable(units) => {
                assert_eq!(&units.sps[..4], &[0, 0, 0, 1]);
                assert_eq!(units.sps[4] & 0x1F, 7);
                assert_eq!(units.pps[4] & 0x1F, 8);
            }
            other => panic!("expected config, got {other:?}"),
        }

        // Then pictures: a keyframe first, sequence starting at zero
        match recv_event(&mut events).await {
            EncoderEvent::Frame(frame) => {
                assert_eq!(frame.kind, FrameKind::KeyFrame);
                assert_eq!(frame.sequence, 0);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        match recv_event(&mut events).await {
            EncoderEvent::Frame(frame) => {
                assert_eq!(frame.kind, FrameKind::DeltaFrame);
                assert_eq!(frame.sequence, 1);
                assert_eq!(frame.timestamp_us, 33_333);
            }
            other => panic!("expected frame, got {other:?}"),
        }

        encoder.release();
    }

    #[tokio::test]
    async fn config_buffers_do_not_consume_sequence_numbers() {
        let (events_tx, mut events) = mpsc::channel(64);
        let probe = CodecProbe::new();
        let mut encoder = Encoder::new(Box::new(TestCodec::new(probe)), events_tx);
        encoder.configure(&low_latency_config()).unwrap();
        encoder.start().unwrap();

        let sink = encoder.input_sink().unwrap();
        for i in 0..2u64 {
            sink.send(RawFrame {
                timestamp_us: i,
                data: Bytes::from(vec![0u8; 64]),
            })
            .await
            .unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            match recv_event(&mut events).await {
                EncoderEvent::Frame(frame) => sequences.push(frame.sequence),
                EncoderEvent::ConfigAvailable(_) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sequences, vec![0, 1]);
        encoder.release();
    }

    #[tokio::test]
    async fn dynamic_controls_reach_the_codec() {
        let (events_tx, _events) = mpsc::channel(64);
        let probe = CodecProbe::new();
        let mut encoder = Encoder::new(Box::new(TestCodec::new(probe.clone())), events_tx);
        encoder.configure(&low_latency_config()).unwrap();
        encoder.start().unwrap();

        encoder.request_keyframe();
        assert_eq!(probe.keyframe_requests(), 1);

        encoder.set_bitrate(1000);
        assert_eq!(probe.applied_bitrate_kbps(), 1000);

        // Out-of-range values are clamped before reaching the codec
        encoder.set_bitrate(100);
        assert_eq!(probe.applied_bitrate_kbps(), 500);
        encoder.set_bitrate(50_000);
        assert_eq!(probe.applied_bitrate_kbps(), 8000);

        encoder.release();
    }

    #[tokio::test]
    async fn controls_are_ignored_when_not_running() {
        let (events_tx, _events) = mpsc::channel(64);
        let probe = CodecProbe::new();
        let mut encoder = Encoder::new(Box::new(TestCodec::new(probe.clone())), events_tx);
        encoder.configure(&low_latency_config()).unwrap();

        encoder.request_keyframe();
        encoder.set_bitrate(1000);
        assert_eq!(probe.keyframe_requests(), 0);
        assert_eq!(probe.applied_bitrate_kbps(), 0);
    }
}
