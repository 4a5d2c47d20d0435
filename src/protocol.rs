//! Shared protocol constants and tuning knobs
//!
//! Everything here is part of the wire or control contract between the two
//! peers; changing a value changes observable streaming behavior.

/// Lowest target bitrate the pipeline will recommend or accept, in kbps.
pub const MIN_BITRATE_KBPS: u32 = 500;

/// Highest target bitrate the pipeline will recommend or accept, in kbps.
pub const MAX_BITRATE_KBPS: u32 = 8000;

/// Default target bitrate for a new stream, in kbps.
pub const DEFAULT_BITRATE_KBPS: u32 = 2000;

/// Picture frames allowed in flight on the link before delta frames are
/// dropped. Keyframes ignore this limit.
pub const MAX_PENDING_FRAMES: usize = 3;

/// Picture frames between periodic SPS/PPS resends, so a lossy or
/// late-joining decoder can recover.
pub const CONFIG_RESEND_INTERVAL: u32 = 60;

/// Consecutive successful sends without congestion before the target
/// bitrate may be raised.
pub const STABILITY_THRESHOLD: u32 = 90;

/// Percentage step used when raising or lowering the target bitrate.
pub const BITRATE_STEP_PERCENT: u32 = 20;

/// Observed throughput below this fraction of the target declares
/// congestion.
pub const CONGESTION_RATIO: f64 = 0.8;

/// How often the transport samples observed throughput, in milliseconds.
pub const BANDWIDTH_SAMPLE_INTERVAL_MS: u64 = 500;

/// Upper bound on an encoded packet header, in bytes.
pub const MAX_PACKET_HEADER_SIZE: usize = 256;

/// Upper bound on a packet payload, in bytes.
pub const MAX_PACKET_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Clamp a bitrate into the supported range.
pub fn clamp_bitrate_kbps(kbps: u32) -> u32 {
    kbps.clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_clamping() {
        assert_eq!(clamp_bitrate_kbps(0), MIN_BITRATE_KBPS);
        assert_eq!(clamp_bitrate_kbps(MIN_BITRATE_KBPS), MIN_BITRATE_KBPS);
        assert_eq!(clamp_bitrate_kbps(3000), 3000);
        assert_eq!(clamp_bitrate_kbps(u32::MAX), MAX_BITRATE_KBPS);
    }
}
