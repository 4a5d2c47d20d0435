//! H.264 Annex-B parsing utilities
//!
//! The hardware codec sometimes hands decoder configuration over as one
//! undifferentiated buffer instead of per-unit format metadata. These helpers
//! scan such buffers for start codes, classify the NAL units inside, and pull
//! out the SPS/PPS parameter sets.

use bytes::{Bytes, BytesMut};

use crate::frame::ConfigUnits;

/// The 4-byte Annex-B start code re-attached to extracted units.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit classification (low 5 bits of the first payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    /// Non-IDR slice (delta picture data)
    NonIdrSlice,
    /// IDR slice (keyframe picture data)
    IdrSlice,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Anything else
    Other(u8),
}

impl From<u8> for NalType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            n => NalType::Other(n),
        }
    }
}

/// Find the next 3- or 4-byte start code at or after `from`.
/// Returns (position, start code length).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < from + 3 {
        return None;
    }
    for i in from..data.len() - 2 {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
    }
    None
}

/// Split a complete Annex-B buffer into NAL units (start codes stripped).
///
/// The run after the final start code, through end of buffer, counts as one
/// unit; bytes before the first start code are discarded. Empty runs are
/// skipped. A buffer with no start code yields nothing.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let Some((pos, len)) = find_start_code(data, 0) else {
        return units;
    };

    let mut start = pos + len;
    while let Some((next, next_len)) = find_start_code(data, start) {
        if next > start {
            units.push(&data[start..next]);
        }
        start = next + next_len;
    }
    if start < data.len() {
        units.push(&data[start..]);
    }
    units
}

/// Re-attach a 4-byte start code to a bare NAL unit.
pub fn prefix_start_code(unit: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(START_CODE.len() + unit.len());
    buf.extend_from_slice(&START_CODE);
    buf.extend_from_slice(unit);
    buf.freeze()
}

/// Extract SPS and PPS from a codec-config buffer.
///
/// Returns `None` when the buffer does not contain both parameter sets (for
/// example fewer than two start codes) — the caller treats that as "config
/// unavailable this cycle", never as an error.
pub fn extract_config_units(data: &[u8]) -> Option<ConfigUnits> {
    let mut sps = None;
    let mut pps = None;

    for unit in split_nal_units(data) {
        match NalType::from(unit[0]) {
            NalType::Sps if sps.is_none() => sps = Some(prefix_start_code(unit)),
            NalType::Pps if pps.is_none() => pps = Some(prefix_start_code(unit)),
            _ => {}
        }
    }

    Some(ConfigUnits {
        sps: sps?,
        pps: pps?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

    #[test]
    fn nal_type_from_header_byte() {
        assert_eq!(NalType::from(0x65), NalType::IdrSlice);
        assert_eq!(NalType::from(0x41), NalType::NonIdrSlice);
        assert_eq!(NalType::from(0x67), NalType::Sps);
        assert_eq!(NalType::from(0x68), NalType::Pps);
        assert_eq!(NalType::from(0x06), NalType::Sei);
        assert_eq!(NalType::from(0x09), NalType::Other(9));
    }

    #[test]
    fn extracts_sps_and_pps_with_four_byte_codes() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(SPS);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(PPS);

        let units = extract_config_units(&buf).unwrap();
        assert_eq!(&units.sps[..4], &START_CODE);
        assert_eq!(&units.sps[4..], SPS);
        assert_eq!(&units.pps[..4], &START_CODE);
        assert_eq!(&units.pps[4..], PPS);
    }

    #[test]
    fn extracts_with_three_byte_codes_and_reprefixes_to_four() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 1]);
        buf.extend_from_slice(SPS);
        buf.extend_from_slice(&[0, 0, 1]);
        buf.extend_from_slice(PPS);

        let units = extract_config_units(&buf).unwrap();
        // Always re-attached as 4-byte start codes, regardless of input form
        assert_eq!(&units.sps[..4], &START_CODE);
        assert_eq!(&units.pps[..4], &START_CODE);
        assert_eq!(&units.sps[4..], SPS);
        assert_eq!(&units.pps[4..], PPS);
    }

    #[test]
    fn single_start_code_yields_no_config() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(SPS);
        assert!(extract_config_units(&buf).is_none());
    }

    #[test]
    fn garbage_and_empty_buffers_do_not_crash() {
        assert!(extract_config_units(&[]).is_none());
        assert!(extract_config_units(&[0xFF, 0x66, 0x01]).is_none());
        assert!(extract_config_units(&[0, 0]).is_none());
        // Start code immediately at end of buffer: empty run
        assert!(extract_config_units(&[0, 0, 0, 1]).is_none());
    }

    #[test]
    fn ignores_non_parameter_units() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(SPS);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(PPS);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(&[0x65, 0x88, 0x84]); // IDR slice

        let units = extract_config_units(&buf).unwrap();
        assert_eq!(&units.sps[4..], SPS);
        assert_eq!(&units.pps[4..], PPS);
    }

    #[test]
    fn split_discards_leading_junk() {
        let mut buf = vec![0xAA, 0xBB];
        buf.extend_from_slice(&[0, 0, 1]);
        buf.extend_from_slice(SPS);

        let units = split_nal_units(&buf);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0], SPS);
    }

    #[test]
    fn split_handles_mixed_start_code_lengths() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(SPS);
        buf.extend_from_slice(&[0, 0, 1]);
        buf.extend_from_slice(PPS);

        let units = split_nal_units(&buf);
        assert_eq!(units, vec![SPS, PPS]);
    }
}
