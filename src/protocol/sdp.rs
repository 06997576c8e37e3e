//! SDP body for the RAOP ANNOUNCE request

use crate::engine::{
    RAOP_BITS_PER_SAMPLE, RAOP_CHANNEL_COUNT, RAOP_FRAMES_PER_PACKET, RAOP_SAMPLES_PER_SECOND,
};
use std::fmt::Write as _;
use std::net::IpAddr;

/// Build the ANNOUNCE body describing an AppleLossless RTP stream.
///
/// `aes_key_b64`/`aes_iv_b64` are the padding-stripped base64 session key
/// attributes; both empty means a clear stream and the key lines are omitted.
#[must_use]
pub fn announce_body(
    session_id: u32,
    local_ip: &IpAddr,
    peer_ip: &IpAddr,
    aes_key_b64: &str,
    aes_iv_b64: &str,
) -> String {
    let mut body = String::with_capacity(512);

    let _ = write!(
        body,
        "v=0\r\n\
         o=iTunes {session_id} 0 IN IP4 {local_ip}\r\n\
         s=iTunes\r\n\
         c=IN IP4 {peer_ip}\r\n\
         t=0 0\r\n\
         m=audio 0 RTP/AVP 96\r\n\
         a=rtpmap:96 AppleLossless\r\n\
         a=fmtp:96 {RAOP_FRAMES_PER_PACKET} 0 {RAOP_BITS_PER_SAMPLE} 40 10 14 \
         {RAOP_CHANNEL_COUNT} 255 0 0 {RAOP_SAMPLES_PER_SECOND}\r\n"
    );

    if !aes_key_b64.is_empty() && !aes_iv_b64.is_empty() {
        let _ = write!(body, "a=rsaaeskey:{aes_key_b64}\r\na=aesiv:{aes_iv_b64}\r\n");
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips() -> (IpAddr, IpAddr) {
        ("10.0.0.2".parse().unwrap(), "10.0.0.9".parse().unwrap())
    }

    #[test]
    fn secured_body_carries_key_attributes() {
        let (local, peer) = ips();
        let body = announce_body(42, &local, &peer, "S0VZ", "SVY");

        assert!(body.contains("o=iTunes 42 0 IN IP4 10.0.0.2\r\n"));
        assert!(body.contains("c=IN IP4 10.0.0.9\r\n"));
        assert!(body.contains("a=rtpmap:96 AppleLossless\r\n"));
        assert!(body.contains("a=fmtp:96 352 0 16 40 10 14 2 255 0 0 44100\r\n"));
        assert!(body.contains("a=rsaaeskey:S0VZ\r\n"));
        assert!(body.contains("a=aesiv:SVY\r\n"));
    }

    #[test]
    fn clear_body_omits_key_attributes() {
        let (local, peer) = ips();
        let body = announce_body(7, &local, &peer, "", "");
        assert!(!body.contains("rsaaeskey"));
        assert!(!body.contains("aesiv"));
        assert!(body.contains("a=fmtp:96 "));
    }
}
