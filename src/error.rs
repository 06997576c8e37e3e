//! Error types

use crate::types::format::OutputFormat;

/// Main error type for raopcast operations.
#[derive(Debug, thiserror::Error)]
pub enum RaopCastError {
    /// Service discovery failed or the daemon is unavailable.
    #[error("discovery error: {0}")]
    Discovery(#[from] crate::discovery::DiscoveryError),

    /// RTSP exchange failed at the transport or protocol level.
    #[error("rtsp error: {0}")]
    Rtsp(#[from] crate::protocol::rtsp::RtspError),

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::protocol::crypto::CryptoError),

    /// Audio pipeline failure.
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    /// Streaming engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The speaker rejected the session with an RTSP status code.
    /// 453 means another player holds the session.
    #[error("remote speakers refused session: status {0}")]
    SessionRefused(i32),

    /// The user cancelled the password prompt.
    #[error("no password entered")]
    NoPasswordEntered,

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the audio pipeline (ring buffer, reformatter, encoder).
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// `write` was called with more data than the stage can accept.
    #[error("write of {requested} bytes exceeds writable space of {writable}")]
    WriteOverflow {
        /// Bytes offered by the producer.
        requested: usize,
        /// Bytes the stage could accept.
        writable: usize,
    },

    /// Input does not match the format the stage was constructed for.
    #[error("unexpected input format {actual}, expected {expected}")]
    FormatMismatch {
        /// Format the stage was built for.
        expected: OutputFormat,
        /// Format the caller presented.
        actual: OutputFormat,
    },

    /// Write length is not a whole number of samples.
    #[error("write length {0} is not sample aligned")]
    UnalignedWrite(usize),

    /// Sample rate converter failure.
    #[error("resampler error: {0}")]
    Resampler(String),
}

/// Errors raised by the RAOP engine proper.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `write` contract violation.
    #[error("packet data of {0} bytes exceeds maximum of {1}")]
    PacketTooLarge(usize, usize),

    /// Packet buffer has no free slot.
    #[error("packet buffer full")]
    BufferFull,

    /// Packet buffer has no pending slot.
    #[error("packet buffer empty")]
    BufferEmpty,

    /// Requested history slot is outside the retained window.
    #[error("packet history index {0} out of range")]
    HistoryOutOfRange(u16),

    /// No local port could be bound for a UDP endpoint.
    #[error("no local port available starting at {0}")]
    NoLocalPort(u16),

    /// Underlying socket error.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Inbound packet failed to decode.
    #[error("rtp decode error: {0}")]
    Rtp(#[from] crate::protocol::rtp::RtpDecodeError),

    /// Session key material missing; `reinit` was not called.
    #[error("engine session not initialized")]
    NotInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_strings() {
        let err = EngineError::PacketTooLarge(2000, 1408);
        assert_eq!(
            err.to_string(),
            "packet data of 2000 bytes exceeds maximum of 1408"
        );

        let err = AudioError::WriteOverflow {
            requested: 64,
            writable: 32,
        };
        assert!(err.to_string().contains("64"));
        assert!(err.to_string().contains("32"));
    }
}
