//! Bitrate and duration estimation
//!
//! Variable-bitrate streams average per-packet bit rates and become usable
//! after a small floor of samples; constant-bitrate streams have a closed
//! form. Duration resolves in three tiers: the parser's packet count, the
//! bisection-discovered count, then a byte-length / bitrate fallback.

/// Packets to observe before a VBR estimate is trusted.
pub(crate) const BITRATE_EST_MIN_PACKETS: u64 = 50;

/// Initial upper bound of the packet-count bisection. A discovered count
/// equal to this means the parser never rejected a probe and the real count
/// is unknowable, so duration falls through to the bitrate tier.
pub(crate) const PACKET_COUNT_SENTINEL: u64 = 1_000_000;

/// Running average of per-packet bit rates.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BitrateEstimator {
    /// Sum of `8 * byte_size / packet_duration` over observed packets —
    /// each addend is already a bits-per-second figure.
    size_total: f64,
    packets: u64,
}

impl BitrateEstimator {
    pub(crate) fn record_packet(&mut self, byte_size: u32, packet_duration: f64) {
        if packet_duration > 0.0 {
            self.size_total += 8.0 * f64::from(byte_size) / packet_duration;
            self.packets += 1;
        }
    }

    pub(crate) fn packets(&self) -> u64 {
        self.packets
    }

    pub(crate) fn ready(&self) -> bool {
        self.packets >= BITRATE_EST_MIN_PACKETS
    }

    pub(crate) fn average(&self) -> Option<f64> {
        if self.ready() {
            Some(self.size_total / self.packets as f64)
        } else {
            None
        }
    }
}

/// Format metadata mirrored between the engine and the query snapshot; all
/// derived figures (bitrate, duration, packet duration) compute from here.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FormatSnapshot {
    pub vbr: bool,
    pub sample_rate: f64,
    pub frames_per_packet: u32,
    pub bytes_per_packet: u32,
    pub data_offset: u64,
    pub file_length: u64,
    pub parser_packet_count: Option<u64>,
    pub discovered_packet_count: Option<u64>,
    pub estimator: BitrateEstimator,
}

impl FormatSnapshot {
    pub(crate) fn packet_duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            f64::from(self.frames_per_packet) / self.sample_rate
        } else {
            0.0
        }
    }

    /// Estimated bits per second, when estimable.
    pub(crate) fn calculated_bit_rate(&self) -> Option<f64> {
        if self.vbr {
            self.estimator.average()
        } else if self.sample_rate > 0.0 && self.frames_per_packet > 0 && self.bytes_per_packet > 0
        {
            Some(
                8.0 * self.sample_rate * f64::from(self.bytes_per_packet)
                    / f64::from(self.frames_per_packet),
            )
        } else {
            None
        }
    }

    /// Three-tier duration estimate in seconds.
    pub(crate) fn duration(&self) -> Option<f64> {
        let packet_duration = self.packet_duration();
        if packet_duration > 0.0 {
            if let Some(count) = self.parser_packet_count {
                if count != PACKET_COUNT_SENTINEL {
                    return Some(count as f64 * packet_duration);
                }
            }
            if let Some(count) = self.discovered_packet_count {
                if count != PACKET_COUNT_SENTINEL {
                    return Some(count as f64 * packet_duration);
                }
            }
        }
        let bit_rate = self.calculated_bit_rate()?;
        if bit_rate <= 0.0 || self.file_length == 0 {
            return None;
        }
        let audio_bytes = self.file_length.saturating_sub(self.data_offset);
        Some(audio_bytes as f64 / (bit_rate / 8.0))
    }
}
