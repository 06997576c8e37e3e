//! NTP-format timestamps used by sync and timing packets

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const SECONDS_FROM_1900_TO_1970: u64 = 0x83AA_7E80;

const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// 64-bit NTP timestamp: seconds since 1900 plus 1/2^32 fractional seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    /// Seconds since the NTP epoch
    pub seconds: u32,
    /// Fractional seconds (units of 1/2^32 s)
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Capture the current wall clock.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_unix_micros(elapsed.as_secs() * MICROSECONDS_PER_SECOND
            + u64::from(elapsed.subsec_micros()))
    }

    /// Build from microseconds since the Unix epoch.
    #[must_use]
    pub fn from_unix_micros(micros: u64) -> Self {
        let seconds = micros / MICROSECONDS_PER_SECOND + SECONDS_FROM_1900_TO_1970;
        let remainder = micros % MICROSECONDS_PER_SECOND;
        let fraction = (remainder << 32) / MICROSECONDS_PER_SECOND;

        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    /// Convert back to microseconds since the Unix epoch.
    #[must_use]
    pub fn to_unix_micros(&self) -> i64 {
        let seconds = i64::from(self.seconds) - SECONDS_FROM_1900_TO_1970 as i64;
        let fraction_micros =
            (u64::from(self.fraction) * MICROSECONDS_PER_SECOND) >> 32;
        seconds * MICROSECONDS_PER_SECOND as i64 + fraction_micros as i64
    }

    /// Encode as 8 bytes, network order.
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    /// Decode from 8 bytes, network order.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than 8 bytes.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            fraction: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_shift() {
        let ts = NtpTimestamp::from_unix_micros(0);
        assert_eq!(ts.seconds, 0x83AA_7E80);
        assert_eq!(ts.fraction, 0);
    }

    #[test]
    fn fraction_scaling() {
        // half a second = 2^31 fractional units
        let ts = NtpTimestamp::from_unix_micros(500_000);
        let expected = 1u64 << 31;
        let diff = (i64::from(ts.fraction) - expected as i64).abs();
        assert!(diff <= 1, "fraction {} not near {}", ts.fraction, expected);
    }

    #[test]
    fn micros_round_trip() {
        let micros = 1_234_567_890_123_456u64;
        let ts = NtpTimestamp::from_unix_micros(micros);
        let back = ts.to_unix_micros();
        assert!((back - micros as i64).abs() <= 1);
    }

    #[test]
    fn codec_round_trip() {
        let ts = NtpTimestamp {
            seconds: 0xDEAD_BEEF,
            fraction: 0x0123_4567,
        };
        assert_eq!(NtpTimestamp::decode(&ts.encode()), ts);
    }

    #[test]
    fn now_is_after_2020() {
        let ts = NtpTimestamp::now();
        // 2020-01-01 in NTP seconds
        assert!(ts.seconds > 0x83AA_7E80 + 50 * 365 * 86400);
    }
}
