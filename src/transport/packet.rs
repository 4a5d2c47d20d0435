//! Wire format for stream packets sent over the peer link
//!
//! Each packet is sent as:
//! - 4 bytes: header length (big-endian u32)
//! - N bytes: MessagePack-encoded [`PacketHeader`]
//! - M bytes: binary payload (`header.payload_size` bytes of Annex-B data)

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, FrameKind};
use crate::protocol::{MAX_PACKET_HEADER_SIZE, MAX_PACKET_PAYLOAD_SIZE};

/// Packet header describing one frame on the wire.
///
/// Config packets always carry `timestamp_us == 0` and `sequence == 0`;
/// picture packets carry the transport-assigned wire sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Frame classification: "config", "key" or "delta"
    pub frame_type: String,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    /// Wire sequence number
    pub sequence: u64,
    /// Payload size in bytes
    pub payload_size: u32,
}

impl PacketHeader {
    /// Parse the frame type back into a [`FrameKind`].
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_wire_label(&self.frame_type)
    }
}

/// One framed packet: header plus binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl StreamPacket {
    /// Build a packet from a frame, stamping the given wire sequence number.
    pub fn from_frame(frame: &Frame, wire_sequence: u64) -> Self {
        let sequence = match frame.kind {
            FrameKind::ConfigUnit => 0,
            _ => wire_sequence,
        };
        Self {
            header: PacketHeader {
                frame_type: frame.kind.wire_label().to_string(),
                timestamp_us: frame.timestamp_us,
                sequence,
                payload_size: frame.payload.len() as u32,
            },
            payload: frame.payload.clone(),
        }
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Serialize to a single buffer (length prefix + header + payload).
    pub fn to_bytes(&self) -> Result<Bytes> {
        let header = rmp_serde::to_vec(&self.header).context("encode packet header")?;
        if header.len() > MAX_PACKET_HEADER_SIZE {
            bail!(
                "Packet header too large: {} > {}",
                header.len(),
                MAX_PACKET_HEADER_SIZE
            );
        }
        if self.payload.len() > MAX_PACKET_PAYLOAD_SIZE {
            bail!(
                "Packet payload too large: {} > {}",
                self.payload.len(),
                MAX_PACKET_PAYLOAD_SIZE
            );
        }

        let mut buf = BytesMut::with_capacity(4 + header.len() + self.payload.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Deserialize from a single buffer.
    pub fn from_bytes(mut buf: Bytes) -> Result<Self> {
        if buf.len() < 4 {
            bail!("Buffer too small for length prefix: {}", buf.len());
        }
        let header_len = buf.get_u32() as usize;
        if header_len > MAX_PACKET_HEADER_SIZE {
            bail!(
                "Packet header length exceeds maximum: {} > {}",
                header_len,
                MAX_PACKET_HEADER_SIZE
            );
        }
        if buf.len() < header_len {
            bail!("Truncated packet header: {} < {}", buf.len(), header_len);
        }

        let header_bytes = buf.split_to(header_len);
        let header: PacketHeader =
            rmp_serde::from_slice(&header_bytes).context("decode packet header")?;

        if buf.len() != header.payload_size as usize {
            bail!(
                "Payload size mismatch: header says {}, got {}",
                header.payload_size,
                buf.len()
            );
        }

        Ok(Self {
            header,
            payload: buf,
        })
    }
}

/// Write a packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &StreamPacket,
) -> Result<()> {
    let bytes = packet.to_bytes()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read a packet from an async reader.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<StreamPacket> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    if header_len > MAX_PACKET_HEADER_SIZE {
        bail!(
            "Packet header length exceeds maximum: {} > {}",
            header_len,
            MAX_PACKET_HEADER_SIZE
        );
    }

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes).await?;
    let header: PacketHeader =
        rmp_serde::from_slice(&header_bytes).context("decode packet header")?;

    if header.payload_size as usize > MAX_PACKET_PAYLOAD_SIZE {
        bail!(
            "Packet payload exceeds maximum: {} > {}",
            header.payload_size,
            MAX_PACKET_PAYLOAD_SIZE
        );
    }

    let mut payload = vec![0u8; header.payload_size as usize];
    reader.read_exact(&mut payload).await?;

    Ok(StreamPacket {
        header,
        payload: Bytes::from(payload),
    })
}
