//! RSA operations for the RAOP handshake
//!
//! Two uses: wrapping the session AES key for ANNOUNCE (`rsaaeskey`), and
//! verifying the `Apple-Response` challenge signature during OPTIONS.

use super::CryptoError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::Sha1;

/// RSA modulus size in bytes (2048 bits).
pub const MODULUS_BYTES: usize = 256;

/// Apple AirPort Express RSA public key modulus, base64.
const MODULUS_B64: &str = concat!(
    "59dE8qLieItsH1WgjrcFRKj6eUWqi+bGLOX1HL3U3GhC/j0Qg90u3sG/1CUtwC",
    "5vOYvfDmFI6oSFXi5ELabWJmT2dKHzBJKa3k9ok+8t9ucRqMd6DZHJ2YCCLlDR",
    "KSKv6kDqnw4UwPdpOMXziC/AMj3Z/lUVX1G7WSHCAWKf1zNS1eLvqr+boEjXuB",
    "OitnZ/bDzPHrTOZz0Dew0uowxf/+sG+NCK3eQJVxqcaJ/vEHKIVd2M+5qL71yJ",
    "Q+87X6oV3eaYvt3zWZYD6z5vYTcrtij2VZ9Zmni/UAaHqn9JdsBWLUEpVviYnh",
    "imNVvYFZeCXg/IdTQ+x4IRdiXNv5hEew=="
);

/// Apple AirPort Express RSA public key exponent, base64 (65537).
const EXPONENT_B64: &str = "AQAB";

/// The well-known RAOP public key, plus the raw operations the handshake
/// needs that go beyond the usual encrypt/verify pairing.
#[derive(Clone)]
pub struct RaopRsaKey {
    inner: RsaPublicKey,
}

impl RaopRsaKey {
    /// Load the embedded AirPort Express public key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` if the embedded constants are
    /// malformed (which would be a build defect, not a runtime condition).
    pub fn load() -> Result<Self, CryptoError> {
        let n = BASE64
            .decode(MODULUS_B64)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let e = BASE64
            .decode(EXPONENT_B64)
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let inner = RsaPublicKey::new(
            BigUint::from_bytes_be(&n),
            BigUint::from_bytes_be(&e),
        )
        .map_err(|_| CryptoError::InvalidPublicKey)?;

        Ok(Self { inner })
    }

    /// Wrap an existing `RsaPublicKey` (test keys).
    #[must_use]
    pub fn from_public_key(inner: RsaPublicKey) -> Self {
        Self { inner }
    }

    /// Modulus size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Encrypt the session AES key with RSA-OAEP (SHA-1 digest, per RAOP).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` on an OAEP failure.
    pub fn encrypt_oaep(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let padding = Oaep::new::<Sha1>();
        let mut rng = rand::rngs::OsRng;
        self.inner
            .encrypt(&mut rng, padding, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Apply the raw public operation (`c^e mod n`) and strip PKCS#1 v1.5
    /// type-1 padding. This is what the speaker's `Apple-Response` needs:
    /// the device signs the challenge with its private key and we recover
    /// the signed block with the public key.
    ///
    /// Returns `None` when the padding is malformed.
    #[must_use]
    pub fn public_decrypt_pkcs1(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() != self.size() {
            return None;
        }

        let c = BigUint::from_bytes_be(ciphertext);
        let m = c.modpow(self.inner.e(), self.inner.n());
        let bytes = m.to_bytes_be();

        // re-establish leading zeros dropped by the big-int conversion
        let mut block = vec![0u8; self.size() - bytes.len()];
        block.extend_from_slice(&bytes);

        // expect 0x00 0x01 0xFF..0xFF 0x00 <payload>
        if block.len() < 11 || block[0] != 0x00 || block[1] != 0x01 {
            return None;
        }
        let mut i = 2;
        while i < block.len() && block[i] == 0xFF {
            i += 1;
        }
        if i < 10 || i >= block.len() || block[i] != 0x00 {
            return None;
        }

        Some(block[i + 1..].to_vec())
    }
}

/// Base64 encode with `=` padding stripped, as RAOP headers and SDP
/// attributes require.
#[must_use]
pub fn base64_unpadded(data: &[u8]) -> String {
    let mut encoded = BASE64.encode(data);
    while encoded.ends_with('=') {
        encoded.pop();
    }
    encoded
}

/// Base64 decode a string whose padding may have been stripped.
///
/// # Errors
///
/// Returns `CryptoError::InvalidBase64` on malformed input.
pub fn base64_repadded(text: &str) -> Result<Vec<u8>, CryptoError> {
    let mut padded = text.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    BASE64
        .decode(padded)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))
}
