//! Encoded frame types flowing from the encoder to the transport

use bytes::{Bytes, BytesMut};

/// Classifies an encoded frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// SPS/PPS decoder configuration, no picture data
    ConfigUnit,
    /// Self-contained sync frame (IDR), the decoder's only recovery point
    KeyFrame,
    /// Predicted frame referencing earlier pictures
    DeltaFrame,
}

impl FrameKind {
    /// Wire label used in packet headers.
    pub fn wire_label(&self) -> &'static str {
        match self {
            FrameKind::ConfigUnit => "config",
            FrameKind::KeyFrame => "key",
            FrameKind::DeltaFrame => "delta",
        }
    }

    /// Parse a wire label back into a kind.
    pub fn from_wire_label(label: &str) -> Option<Self> {
        match label {
            "config" => Some(FrameKind::ConfigUnit),
            "key" => Some(FrameKind::KeyFrame),
            "delta" => Some(FrameKind::DeltaFrame),
            _ => None,
        }
    }

    /// Only delta frames may be dropped under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, FrameKind::DeltaFrame)
    }
}

/// One encoded access unit, produced exactly once per encoder output event.
///
/// Ownership transfers from the encoder to the transport; the payload is an
/// Annex-B byte stream (start-code-delimited NAL units).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoder-assigned sequence number (picture frames only)
    pub sequence: u64,
    /// Frame classification
    pub kind: FrameKind,
    /// Capture timestamp in microseconds since stream start
    pub timestamp_us: u64,
    /// Encoded payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a picture frame (key or delta).
    pub fn picture(kind: FrameKind, sequence: u64, timestamp_us: u64, payload: Bytes) -> Self {
        debug_assert!(kind != FrameKind::ConfigUnit);
        Self {
            sequence,
            kind,
            timestamp_us,
            payload,
        }
    }

    /// Create a config-unit frame. Config frames carry no timestamp and do
    /// not consume picture sequence numbers.
    pub fn config(payload: Bytes) -> Self {
        Self {
            sequence: 0,
            kind: FrameKind::ConfigUnit,
            timestamp_us: 0,
            payload,
        }
    }
}

/// Cached SPS/PPS parameter sets, each carrying its own 4-byte start code.
///
/// Never sent to the peer except wrapped as a `ConfigUnit` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUnits {
    /// Sequence parameter set (start-code prefixed)
    pub sps: Bytes,
    /// Picture parameter set (start-code prefixed)
    pub pps: Bytes,
}

impl ConfigUnits {
    /// Concatenate SPS and PPS into a single config packet payload.
    pub fn concatenated(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.sps.len() + self.pps.len());
        buf.extend_from_slice(&self.sps);
        buf.extend_from_slice(&self.pps);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_label_roundtrip() {
        for kind in [FrameKind::ConfigUnit, FrameKind::KeyFrame, FrameKind::DeltaFrame] {
            assert_eq!(FrameKind::from_wire_label(kind.wire_label()), Some(kind));
        }
        assert_eq!(FrameKind::from_wire_label("bogus"), None);
    }

    #[test]
    fn only_delta_is_droppable() {
        assert!(FrameKind::DeltaFrame.is_droppable());
        assert!(!FrameKind::KeyFrame.is_droppable());
        assert!(!FrameKind::ConfigUnit.is_droppable());
    }

    #[test]
    fn config_frame_has_zero_sequence_and_timestamp() {
        let frame = Frame::config(Bytes::from_static(b"\x00\x00\x00\x01\x67"));
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.timestamp_us, 0);
        assert_eq!(frame.kind, FrameKind::ConfigUnit);
    }

    #[test]
    fn config_units_concatenation() {
        let units = ConfigUnits {
            sps: Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42]),
            pps: Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xCE]),
        };
        let joined = units.concatenated();
        assert_eq!(&joined[..], &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]);
    }
}
