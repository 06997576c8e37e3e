//! RTSP request construction

use super::headers::{names, Headers};

/// RTSP request methods used by the RAOP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Probe and challenge
    Options,
    /// Announce the stream (SDP body)
    Announce,
    /// Negotiate transport ports
    Setup,
    /// Start the stream clock
    Record,
    /// Drop buffered audio
    Flush,
    /// End the session
    Teardown,
    /// Read a named parameter
    GetParameter,
    /// Write a named parameter or metadata body
    SetParameter,
}

impl Method {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Announce => "ANNOUNCE",
            Self::Setup => "SETUP",
            Self::Record => "RECORD",
            Self::Flush => "FLUSH",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
        }
    }
}

/// An outgoing RTSP request.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// Request method
    pub method: Method,
    /// Request headers
    pub headers: Headers,
    /// Request body (may be empty)
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Create a bodyless request.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Attach a body and its content type; sets `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.headers
            .insert(names::CONTENT_LENGTH, self.body.len().to_string());
        self.headers.insert(names::CONTENT_TYPE, content_type);
    }

    /// Encode the request against a URI, ready for transmission.
    #[must_use]
    pub fn encode(&self, uri: &str) -> Vec<u8> {
        let mut output = Vec::with_capacity(256 + self.body.len());

        output.extend_from_slice(self.method.as_str().as_bytes());
        output.push(b' ');
        output.extend_from_slice(uri.as_bytes());
        output.extend_from_slice(b" RTSP/1.0\r\n");

        for (name, value) in self.headers.iter() {
            output.extend_from_slice(name.as_bytes());
            output.extend_from_slice(b": ");
            output.extend_from_slice(value.as_bytes());
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&self.body);

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple() {
        let mut request = RtspRequest::new(Method::Options);
        request.headers.insert(names::CSEQ, "1");
        request.headers.insert(names::USER_AGENT, "test/1.0");

        let encoded = request.encode("*");
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.starts_with("OPTIONS * RTSP/1.0\r\n"));
        assert!(text.contains("CSeq: 1\r\n"));
        assert!(text.contains("User-Agent: test/1.0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_with_body() {
        let mut request = RtspRequest::new(Method::SetParameter);
        request.set_body("volume: -20.000000\r\n", "text/parameters");

        let text = String::from_utf8(request.encode("rtsp://10.0.0.2/123")).unwrap();
        assert!(text.contains("Content-Type: text/parameters\r\n"));
        assert!(text.contains("Content-Length: 20\r\n"));
        assert!(text.ends_with("volume: -20.000000\r\n"));
    }

    #[test]
    fn method_names() {
        assert_eq!(Method::GetParameter.as_str(), "GET_PARAMETER");
        assert_eq!(Method::SetParameter.as_str(), "SET_PARAMETER");
        assert_eq!(Method::Teardown.as_str(), "TEARDOWN");
    }
}
