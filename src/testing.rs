//! Synthetic camera, codec and link for tests and the demo binary
//!
//! These stand in for real hardware behind the [`CameraBackend`],
//! [`VideoCodec`] and [`FrameLink`] seams: the camera produces gray frames on
//! a timer, the codec wraps them in well-formed Annex-B NAL units with a
//! proper SPS/PPS preamble, and the link records what it is given and can be
//! scripted to fail.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use anyhow::{anyhow, Result};

use crate::capture::{
    CameraBackend, CameraHandle, CaptureConfig, DeviceFault, RawFrame, RawFrameSink, RequestParams,
};
use crate::encode::codec::{BufferFlags, CodecOutput, CodecSettings, VideoCodec};
use crate::link::{FrameLink, LinkError};
use crate::transport::packet::StreamPacket;

const FRAME_INTERVAL: Duration = Duration::from_millis(10);
const FRAME_TIMESTAMP_STEP_US: u64 = 33_333;

/// A scriptable in-process camera.
pub struct TestCamera {
    permission: bool,
    open_failure: Option<DeviceFault>,
    configured: Arc<Mutex<Vec<CaptureConfig>>>,
    params: Arc<Mutex<Option<RequestParams>>>,
    fault_tx: mpsc::Sender<DeviceFault>,
    fault_rx: Arc<Mutex<Option<mpsc::Receiver<DeviceFault>>>>,
}

impl TestCamera {
    pub fn new() -> Self {
        let (fault_tx, fault_rx) = mpsc::channel(8);
        Self {
            permission: true,
            open_failure: None,
            configured: Arc::new(Mutex::new(Vec::new())),
            params: Arc::new(Mutex::new(None)),
            fault_tx,
            fault_rx: Arc::new(Mutex::new(Some(fault_rx))),
        }
    }

    /// Simulate a revoked capture permission.
    pub fn without_permission(mut self) -> Self {
        self.permission = false;
        self
    }

    /// Make every `open` call fail with `fault`.
    pub fn fail_open(mut self, fault: DeviceFault) -> Self {
        self.open_failure = Some(fault);
        self
    }

    /// Every session configuration seen by the hardware, in order.
    pub fn configured_sessions(&self) -> Arc<Mutex<Vec<CaptureConfig>>> {
        Arc::clone(&self.configured)
    }

    /// The most recent repeating-request parameters.
    pub fn repeating_params(&self) -> Arc<Mutex<Option<RequestParams>>> {
        Arc::clone(&self.params)
    }

    /// Inject a mid-stream device fault.
    pub fn fault_trigger(&self) -> mpsc::Sender<DeviceFault> {
        self.fault_tx.clone()
    }
}

impl Default for TestCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for TestCamera {
    fn has_permission(&self) -> bool {
        self.permission
    }

    fn open(&mut self, _camera_id: &str) -> Result<Box<dyn CameraHandle>, DeviceFault> {
        if let Some(fault) = self.open_failure {
            return Err(fault);
        }
        Ok(Box::new(TestCameraHandle {
            configured: Arc::clone(&self.configured),
            params: Arc::clone(&self.params),
            trigger_rx: Arc::clone(&self.fault_rx),
            sink: None,
            producer: None,
            fault_forwarder: None,
        }))
    }
}

struct TestCameraHandle {
    configured: Arc<Mutex<Vec<CaptureConfig>>>,
    params: Arc<Mutex<Option<RequestParams>>>,
    trigger_rx: Arc<Mutex<Option<mpsc::Receiver<DeviceFault>>>>,
    sink: Option<RawFrameSink>,
    producer: Option<JoinHandle<()>>,
    fault_forwarder: Option<JoinHandle<()>>,
}

impl CameraHandle for TestCameraHandle {
    fn configure_session(
        &mut self,
        config: &CaptureConfig,
        sink: RawFrameSink,
        faults: mpsc::Sender<DeviceFault>,
    ) -> Result<(), DeviceFault> {
        self.configured.lock().unwrap().push(config.clone());
        self.sink = Some(sink);

        // Relay injected faults into the session's fault channel
        if let Some(mut trigger) = self.trigger_rx.lock().unwrap().take() {
            self.fault_forwarder = Some(tokio::spawn(async move {
                while let Some(fault) = trigger.recv().await {
                    if faults.send(fault).await.is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(())
    }

    fn set_repeating(&mut self, params: &RequestParams) -> Result<(), DeviceFault> {
        *self.params.lock().unwrap() = Some(*params);
        if self.producer.is_some() {
            // Live parameter update; the running request keeps going
            return Ok(());
        }
        let Some(sink) = self.sink.clone() else {
            return Err(DeviceFault::DeviceError);
        };
        self.producer = Some(tokio::spawn(async move {
            let mut timestamp_us: u64 = 0;
            loop {
                tokio::time::sleep(FRAME_INTERVAL).await;
                timestamp_us += FRAME_TIMESTAMP_STEP_US;
                let frame = RawFrame {
                    timestamp_us,
                    data: Bytes::from(vec![0x80u8; 128]),
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), DeviceFault> {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if let Some(forwarder) = self.fault_forwarder.take() {
            forwarder.abort();
        }
        self.sink = None;
    }
}

/// Records what the encoder asks of its codec.
#[derive(Clone, Default)]
pub struct CodecProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Default)]
struct ProbeInner {
    keyframe_requests: AtomicU32,
    bitrate_kbps: AtomicU32,
    started: AtomicU32,
    stopped: AtomicU32,
    released: AtomicBool,
}

impl CodecProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyframe requests seen so far.
    pub fn keyframe_requests(&self) -> u32 {
        self.inner.keyframe_requests.load(Ordering::SeqCst)
    }

    /// The last bitrate applied, zero if never set.
    pub fn applied_bitrate_kbps(&self) -> u32 {
        self.inner.bitrate_kbps.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// A synthetic compressor producing well-formed Annex-B output.
///
/// The first consumed frame yields a config buffer (SPS then PPS); every
/// `gop_frames`-th picture is a sync frame. Timestamps pass straight through.
pub struct TestCodec {
    probe: CodecProbe,
    input_tx: Option<RawFrameSink>,
    running: Arc<AtomicBool>,
    force_keyframe: Arc<AtomicBool>,
    encode: Option<JoinHandle<()>>,
}

impl TestCodec {
    pub fn new(probe: CodecProbe) -> Self {
        Self {
            probe,
            input_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            force_keyframe: Arc::new(AtomicBool::new(false)),
            encode: None,
        }
    }
}

impl VideoCodec for TestCodec {
    fn configure(
        &mut self,
        settings: &CodecSettings,
        output: mpsc::Sender<CodecOutput>,
    ) -> Result<()> {
        if self.input_tx.is_some() {
            return Err(anyhow!("codec already configured"));
        }
        let (input_tx, input_rx) = mpsc::channel(16);
        self.input_tx = Some(input_tx);
        self.encode = Some(tokio::spawn(encode_loop(
            input_rx,
            output,
            settings.gop_frames.max(1),
            Arc::clone(&self.running),
            Arc::clone(&self.force_keyframe),
        )));
        Ok(())
    }

    fn input_sink(&self) -> Result<RawFrameSink> {
        self.input_tx
            .clone()
            .ok_or_else(|| anyhow!("codec not configured"))
    }

    fn start(&mut self) -> Result<()> {
        self.probe.inner.started.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.probe.inner.stopped.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        self.probe.inner.released.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.input_tx = None;
        if let Some(encode) = self.encode.take() {
            encode.abort();
        }
    }

    fn request_keyframe(&mut self) -> Result<()> {
        self.probe
            .inner
            .keyframe_requests
            .fetch_add(1, Ordering::SeqCst);
        self.force_keyframe.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_bitrate(&mut self, kbps: u32) -> Result<()> {
        self.probe.inner.bitrate_kbps.store(kbps, Ordering::SeqCst);
        Ok(())
    }
}

async fn encode_loop(
    mut input: mpsc::Receiver<RawFrame>,
    output: mpsc::Sender<CodecOutput>,
    gop_frames: u32,
    running: Arc<AtomicBool>,
    force_keyframe: Arc<AtomicBool>,
) {
    let mut emitted_config = false;
    let mut picture_count: u64 = 0;

    while let Some(frame) = input.recv().await {
        if !running.load(Ordering::SeqCst) {
            // A stopped compressor consumes its input without producing
            continue;
        }

        if !emitted_config {
            emitted_config = true;
            let config = CodecOutput::Buffer {
                flags: BufferFlags::config(),
                timestamp_us: 0,
                data: synthetic_parameter_sets(),
            };
            if output.send(config).await.is_err() {
                return;
            }
        }

        let forced = force_keyframe.swap(false, Ordering::SeqCst);
        let is_sync = forced || picture_count % u64::from(gop_frames) == 0;
        picture_count += 1;

        let buffer = CodecOutput::Buffer {
            flags: if is_sync {
                BufferFlags::sync()
            } else {
                BufferFlags(0)
            },
            timestamp_us: frame.timestamp_us,
            data: synthetic_picture(is_sync, &frame.data),
        };
        if output.send(buffer).await.is_err() {
            return;
        }
    }
}

/// Concatenated SPS (type 7) + PPS (type 8), each with a 4-byte start code.
fn synthetic_parameter_sets() -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F]);
    buf.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80]);
    buf.freeze()
}

/// One picture NAL: IDR (type 5) for sync frames, non-IDR (type 1) otherwise.
fn synthetic_picture(is_sync: bool, raw: &Bytes) -> Bytes {
    let nal_header: u8 = if is_sync { 0x65 } else { 0x41 };
    let mut buf = BytesMut::with_capacity(5 + raw.len());
    buf.extend_from_slice(&[0, 0, 0, 1, nal_header]);
    buf.extend_from_slice(raw);
    buf.freeze()
}

/// A link that records sent packets and can be scripted to fail.
pub struct TestLink {
    sent: Mutex<Vec<StreamPacket>>,
    failures: Mutex<VecDeque<LinkError>>,
    send_delay: Duration,
    send_count: AtomicU64,
}

impl TestLink {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            send_delay: Duration::ZERO,
            send_count: AtomicU64::new(0),
        }
    }

    /// Make every send take `delay` to complete.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Queue a failure; each queued failure consumes one send attempt.
    pub fn push_failure(&self, error: LinkError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Packets successfully sent, in order.
    pub fn sent(&self) -> Vec<StreamPacket> {
        self.sent.lock().unwrap().clone()
    }

    /// Total send attempts, including failed ones.
    pub fn send_attempts(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }
}

impl Default for TestLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameLink for TestLink {
    async fn send_packet(&self, packet: StreamPacket) -> Result<(), LinkError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }
}
