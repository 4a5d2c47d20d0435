//! Control-plane commands and stream settings
//!
//! Commands arrive from the application (or the remote viewer, relayed over
//! the control channel) as MessagePack messages and are applied to the
//! running pipeline.

use serde::{Deserialize, Serialize};

use crate::protocol::{clamp_bitrate_kbps, DEFAULT_BITRATE_KBPS};

/// A control command for the streaming pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PipelineCommand {
    /// Open a camera and start the capture/encode/send chain
    StartCapture {
        camera_id: String,
        width: u32,
        height: u32,
        fps: u32,
    },
    /// Tear the chain down; no-op when idle
    StopCapture,
    /// Restart the session on a different camera, same output settings
    SwitchCamera { camera_id: String },
    /// Restart the session at a new output resolution
    ChangeResolution { width: u32, height: u32 },
    /// Update the capture frame rate without restarting the session
    ChangeFps { fps: u32 },
    /// Toggle the camera torch
    SetFlashEnabled { enabled: bool },
    /// Override the target bitrate recommendation
    SetTargetBitrate { kbps: u32 },
    /// Enable or disable adaptive bitrate
    SetAdaptiveBitrate { enabled: bool },
}

/// Stream-wide settings the application configures once at pipeline
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Tune the encoder for latency over quality
    pub low_latency: bool,
    /// Initial target bitrate in kbps (clamped to the supported range)
    pub bitrate_kbps: u32,
    /// Let the transport adjust the bitrate to observed conditions
    pub adaptive_bitrate: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            low_latency: true,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            adaptive_bitrate: true,
        }
    }
}

impl StreamSettings {
    /// Settings with the bitrate clamped into the supported range.
    pub fn normalized(mut self) -> Self {
        self.bitrate_kbps = clamp_bitrate_kbps(self.bitrate_kbps);
        self
    }
}
