//! RTSP message types, digest authentication, and the blocking client

pub mod auth;
mod client;
pub mod headers;
mod request;
mod response;

pub use client::{
    RtspClient, SetupResult, ERR_CHALLENGE_DECRYPT, ERR_CHALLENGE_MISMATCH,
    ERR_CHALLENGE_RESPONSE_MISSING, ERR_CHALLENGE_RESPONSE_SIZE, ERR_CHALLENGE_SHORT,
    ERR_SETUP_SESSION_EMPTY, ERR_SETUP_SESSION_MISSING, ERR_SETUP_TRANSPORT_MISSING,
};
pub use headers::Headers;
pub use request::{Method, RtspRequest};
pub use response::RtspResponse;

/// RTSP 200.
pub const STATUS_OK: i32 = 200;
/// RTSP 401; drives the password retry loop.
pub const STATUS_UNAUTHORIZED: i32 = 401;
/// RTSP 453; the speaker is held by another player.
pub const STATUS_NOT_ENOUGH_BANDWIDTH: i32 = 453;

/// Physical state of the speaker's audio jack, from `Audio-Jack-Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioJackStatus {
    /// Jack reported connected (default when unreported)
    Connected,
    /// Jack reported disconnected
    Disconnected,
}

/// RTSP transport and protocol errors
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Socket failure under a request or response.
    #[error("rtsp i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection mid-response.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Response could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
