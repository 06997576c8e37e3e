//! HTTP Digest authentication (RFC 2617) for RTSP sessions
//!
//! Hex digest casing mirrors the server: if the nonce contains any uppercase
//! hex digit the response digests are emitted uppercase, otherwise lowercase.

use super::RtspError;

/// Digest username fixed by the RAOP protocol.
const DIGEST_USERNAME: &str = "iTunes";

/// Captured `WWW-Authenticate` challenge plus the device password.
#[derive(Debug, Clone, Default)]
pub struct DigestState {
    realm: String,
    nonce: String,
    password: String,
    uppercase_hex: bool,
}

impl DigestState {
    /// Whether a challenge has been captured.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.realm.is_empty() && !self.nonce.is_empty()
    }

    /// Store the device password for subsequent digests.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    /// Parse a `WWW-Authenticate: Digest realm="..", nonce=".."` header.
    ///
    /// # Errors
    ///
    /// Returns `RtspError::MalformedResponse` for a non-Digest scheme or a
    /// challenge missing realm/nonce.
    pub fn absorb_challenge(&mut self, header: &str) -> Result<(), RtspError> {
        let header = header.trim();
        let Some(params) = header.strip_prefix("Digest") else {
            return Err(RtspError::MalformedResponse(format!(
                "unsupported auth scheme: {header}"
            )));
        };

        for part in params.split(',') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match name.trim() {
                "realm" => self.realm = value.to_string(),
                "nonce" => self.nonce = value.to_string(),
                _ => {}
            }
        }

        if self.realm.is_empty() || self.nonce.is_empty() {
            return Err(RtspError::MalformedResponse(
                "digest challenge missing realm or nonce".into(),
            ));
        }

        self.uppercase_hex = self.nonce.chars().any(|c| matches!(c, 'A'..='F'));
        Ok(())
    }

    /// Build the `Authorization` header value for a request.
    #[must_use]
    pub fn authorization(&self, method: &str, uri: &str) -> String {
        let ha1 = self.hex_md5(&format!(
            "{DIGEST_USERNAME}:{}:{}",
            self.realm, self.password
        ));
        let ha2 = self.hex_md5(&format!("{method}:{uri}"));
        let response = self.hex_md5(&format!("{ha1}:{}:{ha2}", self.nonce));

        format!(
            "Digest username=\"{DIGEST_USERNAME}\", realm=\"{}\", \
             nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            self.realm, self.nonce
        )
    }

    fn hex_md5(&self, input: &str) -> String {
        let digest = md5::compute(input.as_bytes());
        let mut out = String::with_capacity(32);
        for byte in digest.iter() {
            if self.uppercase_hex {
                out.push_str(&format!("{byte:02X}"));
            } else {
                out.push_str(&format!("{byte:02x}"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parsing() {
        let mut state = DigestState::default();
        state
            .absorb_challenge("Digest realm=\"raop\", nonce=\"abcdef\"")
            .unwrap();
        assert!(state.is_armed());
        assert!(!state.uppercase_hex);

        state
            .absorb_challenge("Digest realm=\"raop\", nonce=\"abcDEF\"")
            .unwrap();
        assert!(state.uppercase_hex);
    }

    #[test]
    fn rejects_basic_scheme() {
        let mut state = DigestState::default();
        assert!(state.absorb_challenge("Basic realm=\"x\"").is_err());
    }

    fn upper_md5(input: &str) -> String {
        md5::compute(input.as_bytes())
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect()
    }

    #[test]
    fn digest_matches_rfc_formula() {
        let mut state = DigestState::default();
        state
            .absorb_challenge("Digest realm=\"raop\", nonce=\"abcDEF\"")
            .unwrap();
        state.set_password("pw");

        let uri = "rtsp://10.0.0.5/12345";
        let header = state.authorization("OPTIONS", uri);

        // recompute by hand, uppercase per the mixed-case nonce
        let ha1 = upper_md5("iTunes:raop:pw");
        let ha2 = upper_md5(&format!("OPTIONS:{uri}"));
        let expected = upper_md5(&format!("{ha1}:abcDEF:{ha2}"));

        assert!(header.contains(&format!("response=\"{expected}\"")));
        assert!(header.contains("username=\"iTunes\""));
        assert!(header.contains("realm=\"raop\""));
        assert!(header.contains("nonce=\"abcDEF\""));
        assert!(header.contains(&format!("uri=\"{uri}\"")));
    }

    #[test]
    fn lowercase_nonce_gives_lowercase_hex() {
        let mut state = DigestState::default();
        state
            .absorb_challenge("Digest realm=\"raop\", nonce=\"0123abc\"")
            .unwrap();
        state.set_password("pw");
        let header = state.authorization("OPTIONS", "*");
        let response = header
            .split("response=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap();
        assert_eq!(response, response.to_lowercase());
    }
}
