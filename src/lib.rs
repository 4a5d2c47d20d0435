//! Real-time camera streaming pipeline.
//!
//! Three stages, each behind a hardware seam so everything is testable
//! without a device attached:
//!
//! - [`capture`]: opens a camera through a [`capture::CameraBackend`] and
//!   drives its session lifecycle on a serialized worker
//! - [`encode`]: compresses raw frames into H.264 through a
//!   [`encode::VideoCodec`], tagging config, key and delta output
//! - [`transport`]: frames packets onto a [`link::FrameLink`] with bounded
//!   in-flight work, periodic decoder-config resends and adaptive bitrate
//!
//! [`pipeline::Pipeline`] wires the stages together behind a command
//! channel; see `peercam-demo` for a complete synthetic end-to-end run.

pub mod capture;
pub mod command;
pub mod encode;
pub mod frame;
pub mod link;
pub mod pipeline;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "test-source"))]
pub mod testing;

pub use capture::{CaptureConfig, CaptureController, CaptureEvent, CaptureState};
pub use command::{PipelineCommand, StreamSettings};
pub use encode::{Encoder, EncoderConfig, EncoderEvent, EncoderState};
pub use frame::{ConfigUnits, Frame, FrameKind};
pub use link::{FrameLink, LinkError, LinkErrorKind};
pub use pipeline::{CodecFactory, Pipeline, PipelineEvent};
pub use protocol::*;
pub use transport::{StreamEvent, StreamPacket, StreamTransport, TransportStats};
