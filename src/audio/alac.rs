//! Apple Lossless encoder adapter

use alac_encoder::{AlacEncoder, FormatDescription};

/// Headroom the encoder may need beyond the PCM size for escaped packets.
pub const ALAC_HEADROOM: usize = 80;

/// Wraps the ALAC encoder for the engine's canonical stream:
/// 44100 Hz, 16-bit, stereo, 352 frames per packet.
///
/// Deterministic: the same PCM input always yields the same packet.
pub struct AlacAdapter {
    encoder: AlacEncoder,
    input_format: FormatDescription,
    frames_per_packet: u32,
}

impl AlacAdapter {
    /// Construct a fresh encoder for one session.
    #[must_use]
    pub fn new(sample_rate: u32, channels: u32, frames_per_packet: u32) -> Self {
        let output_format =
            FormatDescription::alac(f64::from(sample_rate), frames_per_packet, channels);
        let input_format = FormatDescription::pcm::<i16>(f64::from(sample_rate), channels);

        Self {
            encoder: AlacEncoder::new(&output_format),
            input_format,
            frames_per_packet,
        }
    }

    /// Frames the encoder packs into one packet.
    #[must_use]
    pub fn frames_per_packet(&self) -> u32 {
        self.frames_per_packet
    }

    /// Encode one packet of interleaved 16-bit PCM into `output`.
    /// Returns the encoded byte count.
    ///
    /// `output` must provide the PCM length plus [`ALAC_HEADROOM`] bytes.
    pub fn encode(&mut self, pcm: &[u8], output: &mut [u8]) -> usize {
        self.encoder.encode(&self.input_format, pcm, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET_PCM_BYTES: usize = 352 * 4;

    #[test]
    fn encodes_full_packet() {
        let mut adapter = AlacAdapter::new(44100, 2, 352);
        let pcm = vec![0u8; PACKET_PCM_BYTES];
        let mut out = vec![0u8; PACKET_PCM_BYTES + ALAC_HEADROOM];

        let size = adapter.encode(&pcm, &mut out);
        assert!(size > 0);
        assert!(size <= out.len());
    }

    #[test]
    fn deterministic_for_same_input() {
        let mut pcm = Vec::with_capacity(PACKET_PCM_BYTES);
        for i in 0..(PACKET_PCM_BYTES / 2) {
            let sample = ((i as f32 * 0.1).sin() * 12_000.0) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
        }

        let mut first = vec![0u8; PACKET_PCM_BYTES + ALAC_HEADROOM];
        let mut second = vec![0u8; PACKET_PCM_BYTES + ALAC_HEADROOM];

        let n1 = AlacAdapter::new(44100, 2, 352).encode(&pcm, &mut first);
        let n2 = AlacAdapter::new(44100, 2, 352).encode(&pcm, &mut second);

        assert_eq!(n1, n2);
        assert_eq!(&first[..n1], &second[..n2]);
    }

    #[test]
    fn silence_compresses() {
        let mut adapter = AlacAdapter::new(44100, 2, 352);
        let pcm = vec![0u8; PACKET_PCM_BYTES];
        let mut out = vec![0u8; PACKET_PCM_BYTES + ALAC_HEADROOM];
        let size = adapter.encode(&pcm, &mut out);
        // lossless silence is far smaller than the raw packet
        assert!(size < PACKET_PCM_BYTES / 2);
    }
}
