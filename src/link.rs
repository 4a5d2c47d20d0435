//! The external secured link to the paired peer
//!
//! Pairing, identity exchange and TLS live outside this crate; what arrives
//! here is an already-secured bidirectional channel able to carry framed
//! packets. The transport classifies send failures into transient losses
//! (frame dropped, stream continues) and connection losses (session ends).

use async_trait::async_trait;
use std::fmt;

use crate::transport::packet::StreamPacket;

/// How a failed send should be treated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// Momentary failure; the frame is lost but the link is still usable
    Transient,
    /// The link is gone; the streaming session must stop
    ConnectionLost,
}

/// A classified link send failure.
#[derive(Debug)]
pub struct LinkError {
    kind: LinkErrorKind,
    message: String,
}

impl LinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: LinkErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            kind: LinkErrorKind::ConnectionLost,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> LinkErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LinkErrorKind::Transient => write!(f, "transient link failure: {}", self.message),
            LinkErrorKind::ConnectionLost => write!(f, "link connection lost: {}", self.message),
        }
    }
}

impl std::error::Error for LinkError {}

/// An established, secured channel to the paired peer.
///
/// Implementations must tolerate concurrent `send_packet` calls completing
/// out of order; the transport serializes submissions itself.
#[async_trait]
pub trait FrameLink: Send + Sync + 'static {
    /// Send one framed packet to the peer.
    async fn send_packet(&self, packet: StreamPacket) -> Result<(), LinkError>;
}
