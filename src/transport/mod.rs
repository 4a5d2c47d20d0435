//! Stream transport: framing, backpressure, and congestion control
//!
//! Converts encoder [`Frame`]s into wire packets over the external link,
//! bounds outstanding network work, keeps the peer's decoder recoverable via
//! periodic SPS/PPS resends, and adapts the recommended target bitrate to
//! observed conditions. The transport only recommends a bitrate; applying it
//! to the encoder is the orchestrating layer's job.

pub mod bandwidth;
pub mod packet;

pub use bandwidth::{BandwidthMeter, BandwidthSample};
pub use packet::{read_packet, write_packet, PacketHeader, StreamPacket};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{ConfigUnits, Frame, FrameKind};
use crate::link::{FrameLink, LinkErrorKind};
use crate::protocol::{
    clamp_bitrate_kbps, BANDWIDTH_SAMPLE_INTERVAL_MS, BITRATE_STEP_PERCENT, CONFIG_RESEND_INTERVAL,
    CONGESTION_RATIO, MAX_PENDING_FRAMES, STABILITY_THRESHOLD,
};

/// Stream lifecycle and monitoring events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Started,
    Stopped,
    /// Connection-loss-class failure; the session has been stopped
    Error(String),
    /// Instantaneous throughput estimate in kbps
    Bandwidth(u32),
    /// Congestion declared by the monitor
    Congestion,
}

/// Counters for one streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Picture frames handed to the link
    pub frames_sent: u64,
    /// Delta frames dropped for backpressure (keyframes never appear here)
    pub frames_dropped: u64,
    /// Periodic SPS/PPS resends
    pub config_resends: u64,
    /// Total payload bytes successfully sent
    pub bytes_sent: u64,
}

/// Counters mutated from two call sites: the send-completion path and the
/// bandwidth monitor. Everything here is atomic; the remaining transport
/// state is single-writer on the send path.
struct Shared {
    link: Arc<dyn FrameLink>,
    events: mpsc::Sender<StreamEvent>,
    active: AtomicBool,
    adaptive: AtomicBool,
    pending: AtomicUsize,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    config_resends: AtomicU64,
    frames_since_congestion: AtomicU32,
    target_bitrate_kbps: AtomicU32,
}

impl Shared {
    fn emit(&self, event: StreamEvent) {
        // Events are advisory; a slow consumer must not stall the data path
        if self.events.try_send(event).is_err() {
            debug!("Stream event receiver behind; event dropped");
        }
    }

    /// Adaptive raise on sustained stability, from the send-completion path.
    fn note_send_success(&self, payload_len: usize) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.bytes_sent
            .fetch_add(payload_len as u64, Ordering::SeqCst);
        self.frames_sent.fetch_add(1, Ordering::SeqCst);

        let stable = self.frames_since_congestion.fetch_add(1, Ordering::SeqCst) + 1;
        if stable > STABILITY_THRESHOLD
            && self.adaptive.load(Ordering::SeqCst)
            && self.pending.load(Ordering::SeqCst) <= 1
        {
            let target = self.target_bitrate_kbps.load(Ordering::SeqCst);
            let raised = clamp_bitrate_kbps(target + target * BITRATE_STEP_PERCENT / 100);
            if raised != target {
                info!("Link stable; raising target bitrate {target} -> {raised} kbps");
                self.target_bitrate_kbps.store(raised, Ordering::SeqCst);
            }
            self.frames_since_congestion.store(0, Ordering::SeqCst);
        }
    }
}

struct Outbound {
    packet: StreamPacket,
    kind: FrameKind,
}

/// Sends encoded frames to the paired peer with bounded in-flight work.
pub struct StreamTransport {
    shared: Arc<Shared>,
    sender_tx: Option<mpsc::Sender<Outbound>>,
    monitor: Option<JoinHandle<()>>,
    initial_bitrate_kbps: u32,
    // Send-path single-writer state
    sequence: u64,
    frames_since_config: u32,
    cached_config: Option<ConfigUnits>,
}

impl StreamTransport {
    /// Create a transport over `link`. `target_bitrate_kbps` seeds the
    /// adaptive recommendation and is clamped to the supported range.
    pub fn new(
        link: Arc<dyn FrameLink>,
        target_bitrate_kbps: u32,
        adaptive: bool,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let initial = clamp_bitrate_kbps(target_bitrate_kbps);
        Self {
            shared: Arc::new(Shared {
                link,
                events,
                active: AtomicBool::new(false),
                adaptive: AtomicBool::new(adaptive),
                pending: AtomicUsize::new(0),
                bytes_sent: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                config_resends: AtomicU64::new(0),
                frames_since_congestion: AtomicU32::new(0),
                target_bitrate_kbps: AtomicU32::new(initial),
            }),
            sender_tx: None,
            monitor: None,
            initial_bitrate_kbps: initial,
            sequence: 0,
            frames_since_config: 0,
            cached_config: None,
        }
    }

    /// Begin a streaming session: reset all counters and start the sender
    /// and bandwidth monitor. No-op when already active.
    pub async fn start(&mut self) {
        if self.shared.active.load(Ordering::SeqCst) {
            debug!("Transport already active");
            return;
        }

        self.sequence = 0;
        self.frames_since_config = 0;
        self.shared.pending.store(0, Ordering::SeqCst);
        self.shared.bytes_sent.store(0, Ordering::SeqCst);
        self.shared.frames_sent.store(0, Ordering::SeqCst);
        self.shared.frames_dropped.store(0, Ordering::SeqCst);
        self.shared.config_resends.store(0, Ordering::SeqCst);
        self.shared.frames_since_congestion.store(0, Ordering::SeqCst);
        self.shared
            .target_bitrate_kbps
            .store(self.initial_bitrate_kbps, Ordering::SeqCst);
        self.shared.active.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(32);
        self.sender_tx = Some(tx);
        tokio::spawn(run_sender(Arc::clone(&self.shared), rx));
        self.monitor = Some(tokio::spawn(run_monitor(Arc::clone(&self.shared))));

        let _ = self.shared.events.send(StreamEvent::Started).await;
        info!(
            "Stream transport started at {} kbps target",
            self.initial_bitrate_kbps
        );
    }

    /// End the session and halt bandwidth sampling. Idempotent.
    pub async fn stop(&mut self) {
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);
        if self.sender_tx.is_none() && !was_active {
            debug!("Transport already stopped");
            return;
        }
        self.sender_tx = None;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if was_active {
            let _ = self.shared.events.send(StreamEvent::Stopped).await;
            info!("Stream transport stopped");
        }
    }

    /// Cache fresh SPS/PPS and send them immediately as one config packet.
    pub async fn send_config(&mut self, units: &ConfigUnits) {
        self.cached_config = Some(units.clone());
        if !self.shared.active.load(Ordering::SeqCst) {
            debug!("Config cached while inactive; not sent");
            return;
        }
        self.submit_config().await;
    }

    /// Send one picture frame, applying backpressure and recovery rules.
    ///
    /// Delta frames are dropped once `MAX_PENDING_FRAMES` sends are in
    /// flight; keyframes are always force-sent because dropping one would
    /// deny the decoder its only recovery point.
    pub async fn send_frame(&mut self, frame: Frame) {
        if !self.shared.active.load(Ordering::SeqCst) {
            debug!("Frame while transport inactive; discarded");
            return;
        }

        // 1. Backpressure: disposable frames are cheaper to lose than to
        //    deliver late
        if self.shared.pending.load(Ordering::SeqCst) >= MAX_PENDING_FRAMES
            && frame.kind.is_droppable()
        {
            let dropped = self.shared.frames_dropped.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Link saturated; dropped delta frame ({dropped} total)");
            return;
        }

        // 2. Recovery: periodic config resend so a late-joining or lossy
        //    decoder can resynchronize. Does not consume sequence numbers.
        if self.frames_since_config >= CONFIG_RESEND_INTERVAL && self.cached_config.is_some() {
            self.shared.config_resends.fetch_add(1, Ordering::SeqCst);
            self.submit_config().await;
        }

        // 3. Submit with the next wire sequence number
        let packet = StreamPacket::from_frame(&frame, self.sequence);
        self.sequence += 1;
        self.frames_since_config += 1;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.submit(Outbound {
            packet,
            kind: frame.kind,
        })
        .await;
    }

    /// The current recommended target bitrate in kbps.
    pub fn target_bitrate_kbps(&self) -> u32 {
        self.shared.target_bitrate_kbps.load(Ordering::SeqCst)
    }

    /// Override the recommended target bitrate (clamped). Also becomes the
    /// seed for subsequent sessions.
    pub fn set_target_bitrate(&mut self, kbps: u32) {
        let clamped = clamp_bitrate_kbps(kbps);
        self.initial_bitrate_kbps = clamped;
        self.shared
            .target_bitrate_kbps
            .store(clamped, Ordering::SeqCst);
    }

    /// Enable or disable adaptive bitrate recommendations.
    pub fn set_adaptive(&mut self, enabled: bool) {
        self.shared.adaptive.store(enabled, Ordering::SeqCst);
    }

    /// Whether a session is active.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Frames currently in flight on the link.
    pub fn pending_frames(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Session counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.shared.frames_sent.load(Ordering::SeqCst),
            frames_dropped: self.shared.frames_dropped.load(Ordering::SeqCst),
            config_resends: self.shared.config_resends.load(Ordering::SeqCst),
            bytes_sent: self.shared.bytes_sent.load(Ordering::SeqCst),
        }
    }

    async fn submit_config(&mut self) {
        let Some(units) = &self.cached_config else {
            return;
        };
        let frame = Frame::config(units.concatenated());
        let packet = StreamPacket::from_frame(&frame, 0);
        self.frames_since_config = 0;
        self.submit(Outbound {
            packet,
            kind: FrameKind::ConfigUnit,
        })
        .await;
    }

    async fn submit(&self, outbound: Outbound) {
        if let Some(tx) = &self.sender_tx {
            let _ = tx.send(outbound).await;
        }
    }
}

/// Serialized sender: preserves submission order on the link and performs
/// the per-send completion bookkeeping.
async fn run_sender(shared: Arc<Shared>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let is_picture = outbound.kind != FrameKind::ConfigUnit;

        if !shared.active.load(Ordering::SeqCst) {
            // Session ended underneath us; unwind the pending count and
            // discard the packet
            if is_picture {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
            }
            continue;
        }

        let payload_len = outbound.packet.payload_len();
        match shared.link.send_packet(outbound.packet).await {
            Ok(()) => {
                if is_picture {
                    shared.note_send_success(payload_len);
                } else {
                    shared
                        .bytes_sent
                        .fetch_add(payload_len as u64, Ordering::SeqCst);
                }
            }
            Err(e) => {
                if is_picture {
                    shared.pending.fetch_sub(1, Ordering::SeqCst);
                }
                shared.frames_since_congestion.store(0, Ordering::SeqCst);
                match e.kind() {
                    LinkErrorKind::Transient => {
                        // The frame is already stale; absorb the loss and
                        // keep the stream real-time
                        warn!("Transient send failure, frame lost: {}", e.message());
                    }
                    LinkErrorKind::ConnectionLost => {
                        if shared.active.swap(false, Ordering::SeqCst) {
                            warn!("Connection lost, stopping stream: {}", e.message());
                            shared.emit(StreamEvent::Error(e.to_string()));
                        }
                    }
                }
            }
        }
    }
    debug!("Transport sender task exited");
}

/// Periodic bandwidth sampling and congestion detection.
async fn run_monitor(shared: Arc<Shared>) {
    let mut meter = BandwidthMeter::new();
    let mut ticker =
        tokio::time::interval(Duration::from_millis(BANDWIDTH_SAMPLE_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !shared.active.load(Ordering::SeqCst) {
            break;
        }

        let Some(sample) = meter.sample(shared.bytes_sent.load(Ordering::SeqCst)) else {
            continue;
        };
        let kbps = sample.kbps();
        shared.emit(StreamEvent::Bandwidth(kbps));

        let pending = shared.pending.load(Ordering::SeqCst);
        let target = shared.target_bitrate_kbps.load(Ordering::SeqCst);
        let congested = pending >= MAX_PENDING_FRAMES - 1
            || (kbps as f64) < target as f64 * CONGESTION_RATIO;
        if !congested {
            continue;
        }

        shared.frames_since_congestion.store(0, Ordering::SeqCst);
        if shared.adaptive.load(Ordering::SeqCst) {
            let lowered =
                clamp_bitrate_kbps(target.saturating_sub(target * BITRATE_STEP_PERCENT / 100));
            if lowered != target {
                info!(
                    "Congestion ({kbps} kbps observed, {pending} pending); \
                     lowering target bitrate {target} -> {lowered} kbps"
                );
                shared.target_bitrate_kbps.store(lowered, Ordering::SeqCst);
            }
        }
        shared.emit(StreamEvent::Congestion);
    }
    debug!("Bandwidth monitor exited");
}
