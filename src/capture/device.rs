//! Camera device abstraction
//!
//! The capture controller drives physical hardware through these traits so
//! the state machine stays testable without a camera attached. All trait
//! calls happen on the controller's serialized worker task; the hardware is
//! never touched from two contexts at once.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Immutable per-session capture configuration.
///
/// Changing any field requires a full stop/reconfigure/start cycle; the
/// pipeline's output format is fixed at session-configure time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Identifies the physical camera (e.g. "front", "back", "0")
    pub camera_id: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
}

/// Per-request parameters that can be rebuilt without tearing the session
/// down: illumination and frame-rate range do not change the output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestParams {
    /// Target frames per second for the repeating request
    pub fps: u32,
    /// Torch/flash illumination
    pub flash: bool,
}

/// One raw frame out of the capture hardware.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Capture timestamp in microseconds since session start
    pub timestamp_us: u64,
    /// Uncompressed frame data
    pub data: Bytes,
}

/// Where the hardware delivers raw frames; shared with the encoder.
pub type RawFrameSink = mpsc::Sender<RawFrame>;

/// Device-level failure categories.
///
/// Each maps to one human-readable message; faults close the device and are
/// never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// Capture permission not granted (checked before any hardware call)
    PermissionDenied,
    /// Camera already open elsewhere
    InUse,
    /// System-wide camera limit reached
    MaxInUse,
    /// Camera disabled by policy
    Disabled,
    /// Fatal device hardware error
    DeviceError,
    /// Camera service itself failed
    ServiceError,
}

impl DeviceFault {
    /// Human-readable message, one per failure category.
    pub fn describe(&self) -> &'static str {
        match self {
            DeviceFault::PermissionDenied => "camera permission not granted",
            DeviceFault::InUse => "camera is in use by another client",
            DeviceFault::MaxInUse => "too many cameras in use",
            DeviceFault::Disabled => "camera is disabled",
            DeviceFault::DeviceError => "camera device error",
            DeviceFault::ServiceError => "camera service error",
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for DeviceFault {}

/// Entry point to the capture hardware.
pub trait CameraBackend: Send + Sync + 'static {
    /// Whether capture permission has been granted. Checked before any
    /// hardware call; a missing permission fails fast.
    fn has_permission(&self) -> bool;

    /// Open the camera identified by `camera_id`.
    fn open(&mut self, camera_id: &str) -> Result<Box<dyn CameraHandle>, DeviceFault>;
}

/// An open camera device.
///
/// Mid-stream failures are reported on the `faults` channel supplied at
/// session-configure time; the worker reacts by closing the device.
pub trait CameraHandle: Send + Sync {
    /// Configure a capture session delivering raw frames into `sink`.
    fn configure_session(
        &mut self,
        config: &CaptureConfig,
        sink: RawFrameSink,
        faults: mpsc::Sender<DeviceFault>,
    ) -> Result<(), DeviceFault>;

    /// Issue (or reissue) the repeating capture request.
    fn set_repeating(&mut self, params: &RequestParams) -> Result<(), DeviceFault>;

    /// Stop the in-flight repeating request. Best-effort.
    fn stop_repeating(&mut self) -> Result<(), DeviceFault>;

    /// Close the device. Must be safe to call more than once.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_messages_are_distinct() {
        let faults = [
            DeviceFault::PermissionDenied,
            DeviceFault::InUse,
            DeviceFault::MaxInUse,
            DeviceFault::Disabled,
            DeviceFault::DeviceError,
            DeviceFault::ServiceError,
        ];
        for (i, a) in faults.iter().enumerate() {
            for b in &faults[i + 1..] {
                assert_ne!(a.describe(), b.describe());
            }
        }
    }
}
