//! Camera capture: device abstraction and the serialized capture controller
//!
//! - Device traits keep the hardware behind a testable seam
//! - The controller serializes every hardware transition onto one worker task
//! - Raw frames flow into a caller-supplied sink shared with the encoder

pub mod controller;
pub mod device;

pub use controller::{CaptureController, CaptureEvent, CaptureState};
pub use device::{
    CameraBackend, CameraHandle, CaptureConfig, DeviceFault, RawFrame, RawFrameSink, RequestParams,
};
