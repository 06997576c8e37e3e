//! Cryptography for the RAOP handshake and audio stream

mod aes;
mod rsa;

pub use aes::{StreamCipher, AES_BLOCK_SIZE, AES_KEY_SIZE};
pub use rsa::{base64_repadded, base64_unpadded, RaopRsaKey, MODULUS_BYTES};

/// Crypto layer errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The embedded public key failed to load.
    #[error("invalid RAOP public key")]
    InvalidPublicKey,

    /// RSA-OAEP encryption failed.
    #[error("key encryption failed: {0}")]
    EncryptionFailed(String),

    /// Base64 input could not be decoded.
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    /// Key or IV had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required byte length
        expected: usize,
        /// Provided byte length
        actual: usize,
    },
}
