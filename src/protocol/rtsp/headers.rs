//! RTSP header collection

/// Well-known header names
pub mod names {
    /// DACP correlator routing commands back to a specific device
    pub const ACTIVE_REMOTE: &str = "Active-Remote";
    /// Challenge sent with OPTIONS when encryption is negotiated
    pub const APPLE_CHALLENGE: &str = "Apple-Challenge";
    /// Speaker's signed reply to `Apple-Challenge`
    pub const APPLE_RESPONSE: &str = "Apple-Response";
    /// Speaker audio jack state ("connected"/"disconnected")
    pub const AUDIO_JACK_STATUS: &str = "Audio-Jack-Status";
    /// Speaker playback latency in samples
    pub const AUDIO_LATENCY: &str = "Audio-Latency";
    /// Digest credentials
    pub const AUTHORIZATION: &str = "Authorization";
    /// Client instance identifier (16 hex digits)
    pub const CLIENT_INSTANCE: &str = "Client-Instance";
    /// Body length
    pub const CONTENT_LENGTH: &str = "Content-Length";
    /// Body MIME type
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Monotonic request sequence
    pub const CSEQ: &str = "CSeq";
    /// DACP identifier (same value as Client-Instance)
    pub const DACP_ID: &str = "DACP-ID";
    /// Playback range for RECORD
    pub const RANGE: &str = "Range";
    /// RTP stream position (seq/rtptime)
    pub const RTP_INFO: &str = "RTP-Info";
    /// Server session identifier
    pub const SESSION: &str = "Session";
    /// Transport negotiation
    pub const TRANSPORT: &str = "Transport";
    /// Client software identification
    pub const USER_AGENT: &str = "User-Agent";
    /// Digest challenge from a 401 response
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
}

/// Ordered header map with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Look up a header value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the header is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parsed `Content-Length`, defaulting to zero.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.get(names::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Parsed `CSeq`.
    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.get(names::CSEQ).and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_case_insensitive_get() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/sdp");
        assert_eq!(headers.get("content-type"), Some("application/sdp"));
        assert!(headers.contains("CONTENT-TYPE"));
        assert!(!headers.contains("Session"));
    }

    #[test]
    fn insert_replaces() {
        let mut headers = Headers::new();
        headers.insert("CSeq", "1");
        headers.insert("cseq", "2");
        assert_eq!(headers.cseq(), Some(2));
        assert_eq!(headers.iter().count(), 1);
    }

    #[test]
    fn content_length_default() {
        let headers = Headers::new();
        assert_eq!(headers.content_length(), 0);
    }
}
