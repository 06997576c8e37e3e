//! AES-128-CBC audio packet encryption

use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// AES key size in bytes (128 bits).
pub const AES_KEY_SIZE: usize = 16;
/// AES block and IV size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Session stream cipher.
///
/// CBC state does not chain across packets: every packet is encrypted with a
/// fresh copy of the session IV. Only the whole-block prefix of the payload
/// is ciphered; the ragged tail (fewer than 16 bytes) travels in the clear.
#[derive(Clone)]
pub struct StreamCipher {
    key: [u8; AES_KEY_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl StreamCipher {
    /// Create a cipher for a session key and initialization vector.
    #[must_use]
    pub fn new(key: [u8; AES_KEY_SIZE], iv: [u8; AES_BLOCK_SIZE]) -> Self {
        Self { key, iv }
    }

    /// The session key.
    #[must_use]
    pub fn key(&self) -> &[u8; AES_KEY_SIZE] {
        &self.key
    }

    /// The session IV.
    #[must_use]
    pub fn iv(&self) -> &[u8; AES_BLOCK_SIZE] {
        &self.iv
    }

    /// Encrypt `clear` into `out`. Both slices must have the same length;
    /// `out` ends up holding ciphered whole blocks followed by the cleartext
    /// tail.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() != clear.len()`.
    pub fn encrypt_packet(&self, clear: &[u8], out: &mut [u8]) {
        assert_eq!(clear.len(), out.len());

        let whole = clear.len() - clear.len() % AES_BLOCK_SIZE;

        let cipher = Aes128CbcEnc::new_from_slices(&self.key, &self.iv)
            .expect("key and IV sizes are fixed at construction");
        cipher
            .encrypt_padded_b2b_mut::<NoPadding>(&clear[..whole], &mut out[..whole])
            .expect("whole-block input needs no padding");

        out[whole..].copy_from_slice(&clear[whole..]);
    }
}

impl Drop for StreamCipher {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
        self.iv.iter_mut().for_each(|b| *b = 0);
    }
}
