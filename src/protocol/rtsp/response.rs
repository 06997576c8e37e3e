//! RTSP response parsing

use super::headers::{names, Headers};
use super::RtspError;

/// A parsed RTSP response.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    /// Numeric status code
    pub status: i32,
    /// Reason phrase
    pub reason: String,
    /// Response headers
    pub headers: Headers,
    /// Response body (may be empty)
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Parse a complete response (status line, headers, body).
    ///
    /// # Errors
    ///
    /// Returns `RtspError::MalformedResponse` when the status line or a
    /// header line cannot be parsed.
    pub fn parse(data: &[u8]) -> Result<Self, RtspError> {
        let head_end = find_header_end(data)
            .ok_or_else(|| RtspError::MalformedResponse("missing header terminator".into()))?;

        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| RtspError::MalformedResponse("non-UTF-8 header block".into()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| RtspError::MalformedResponse("empty response".into()))?;
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RtspError::MalformedResponse(format!("bad header line: {line}")))?;
            headers.insert(name.trim(), value.trim());
        }

        let body = data[head_end + 4..].to_vec();

        Ok(Self {
            status,
            reason,
            headers,
            body,
        })
    }

    /// True for a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body interpreted as UTF-8, lossily.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Value of a `name: value` line in a `text/parameters` body.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<String> {
        if self.headers.get(names::CONTENT_TYPE) != Some("text/parameters") {
            return None;
        }
        self.body_text().lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    }
}

fn parse_status_line(line: &str) -> Result<(i32, String), RtspError> {
    // e.g. "RTSP/1.0 200 OK"
    let mut parts = line.splitn(3, ' ');
    let protocol = parts
        .next()
        .ok_or_else(|| RtspError::MalformedResponse("empty status line".into()))?;
    if !protocol.starts_with("RTSP/") && !protocol.starts_with("HTTP/") {
        return Err(RtspError::MalformedResponse(format!(
            "unexpected protocol: {protocol}"
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RtspError::MalformedResponse(format!("bad status line: {line}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

/// Locate the `\r\n\r\n` separating the header block from the body.
#[must_use]
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ok_response() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: DEADBEEF\r\n\r\n";
        let response = RtspResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert!(response.is_success());
        assert_eq!(response.headers.get("Session"), Some("DEADBEEF"));
        assert_eq!(response.headers.cseq(), Some(2));
        assert!(response.body.is_empty());
    }

    #[test]
    fn parse_unauthorized_with_challenge() {
        let raw = b"RTSP/1.0 401 Unauthorized\r\n\
                    WWW-Authenticate: Digest realm=\"raop\", nonce=\"abcDEF\"\r\n\r\n";
        let response = RtspResponse::parse(raw).unwrap();
        assert_eq!(response.status, 401);
        assert!(!response.is_success());
        assert!(response
            .headers
            .get(names::WWW_AUTHENTICATE)
            .unwrap()
            .contains("nonce=\"abcDEF\""));
    }

    #[test]
    fn parse_body_parameter() {
        let raw = b"RTSP/1.0 200 OK\r\nContent-Type: text/parameters\r\n\
                    Content-Length: 18\r\n\r\nvolume: -11.500000";
        let response = RtspResponse::parse(raw).unwrap();
        assert_eq!(response.parameter("volume"), Some("-11.500000".into()));
        assert_eq!(response.parameter("progress"), None);
    }

    #[test]
    fn reject_garbage() {
        assert!(RtspResponse::parse(b"not rtsp\r\n\r\n").is_err());
        assert!(RtspResponse::parse(b"RTSP/1.0 200 OK\r\n").is_err());
    }
}
