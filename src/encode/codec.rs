//! Hardware video codec abstraction
//!
//! The encoder drives the compressor through this trait so its state machine
//! and drain loop are testable without hardware. Output buffers arrive as
//! [`CodecOutput`] messages on a channel, mirroring the hardware's async
//! output callbacks without letting callbacks mutate shared state directly.

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::capture::RawFrameSink;

/// Rate-control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateMode {
    /// Constant bitrate: predictable latency over best-effort quality
    Constant,
    /// Variable bitrate: compression efficiency over predictability
    Variable,
}

/// Compression profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecProfile {
    /// Most broadly compatible profile
    Baseline,
    /// Better compression, more decoder requirements
    High,
}

/// Fully derived codec configuration, immutable once applied.
///
/// Only the bitrate is adjustable afterwards, through the dedicated
/// dynamic-control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames (GOP length)
    pub gop_frames: u32,
    pub mode: BitrateMode,
    /// Allowed reordering (B) frames between references
    pub b_frames: u32,
    pub profile: CodecProfile,
}

/// Flags on a codec output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(pub u8);

impl BufferFlags {
    /// Buffer holds decoder configuration, zero picture bytes
    pub const CONFIG: u8 = 0b0000_0001;
    /// Buffer holds a sync (IDR) frame
    pub const SYNC: u8 = 0b0000_0010;
    /// End of stream marker
    pub const END_OF_STREAM: u8 = 0b0000_0100;

    pub fn config() -> Self {
        Self(Self::CONFIG)
    }

    pub fn sync() -> Self {
        Self(Self::SYNC)
    }

    pub fn end_of_stream() -> Self {
        Self(Self::END_OF_STREAM)
    }

    pub fn is_config(&self) -> bool {
        self.0 & Self::CONFIG != 0
    }

    pub fn is_sync(&self) -> bool {
        self.0 & Self::SYNC != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.0 & Self::END_OF_STREAM != 0
    }
}

/// One async event out of the compressor.
///
/// `Buffer.data` is already copied out of the hardware buffer; sending the
/// message is what releases the underlying buffer back to the codec.
#[derive(Debug)]
pub enum CodecOutput {
    /// An output buffer became ready
    Buffer {
        flags: BufferFlags,
        timestamp_us: u64,
        data: Bytes,
    },
    /// The output format changed mid-stream; `csd` holds the new codec
    /// specific data (concatenated SPS/PPS with start codes)
    FormatChanged { csd: Bytes },
    /// A runtime codec error; non-fatal, the caller decides
    Fault(String),
}

/// A hardware (or synthetic) video compressor.
pub trait VideoCodec: Send + Sync + 'static {
    /// Apply the derived configuration and hand over the output channel.
    /// Valid exactly once, before anything else.
    fn configure(&mut self, settings: &CodecSettings, output: mpsc::Sender<CodecOutput>)
        -> Result<()>;

    /// The raw-frame input sink. Valid after `configure`.
    fn input_sink(&self) -> Result<RawFrameSink>;

    /// Begin compressing.
    fn start(&mut self) -> Result<()>;

    /// Pause compressing; `start` may be called again.
    fn stop(&mut self) -> Result<()>;

    /// Release all codec resources. Terminal.
    fn release(&mut self);

    /// Hint the codec to emit a sync frame on the next output. Best-effort.
    fn request_keyframe(&mut self) -> Result<()>;

    /// Change the target bitrate mid-stream. The value arrives pre-clamped.
    fn set_bitrate(&mut self, kbps: u32) -> Result<()>;
}
