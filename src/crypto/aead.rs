//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Data channel AEAD ciphers negotiated by OpenVPN:
//! - AES-128/192/256-GCM
//! - ChaCha20-Poly1305
//!
//! The tag is detached because OpenVPN places it before the ciphertext on
//! the wire.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::ChaCha20Poly1305;

use crate::crypto::{Cipher, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

/// Keyed AEAD cipher.
///
/// Owns the expanded key schedule; construct once per data channel
/// direction.
pub enum AeadCipher {
    /// AES-128-GCM
    Aes128Gcm(Box<Aes128Gcm>),
    /// AES-192-GCM
    Aes192Gcm(Box<Aes192Gcm>),
    /// AES-256-GCM
    Aes256Gcm(Box<Aes256Gcm>),
    /// ChaCha20-Poly1305
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    /// Create a cipher for `cipher` from the first `key_length` bytes of
    /// `key`.
    pub fn new(cipher: Cipher, key: &[u8]) -> Result<Self> {
        let length = cipher.key_length();
        if key.len() < length {
            return Err(Error::Buffer {
                expected: length,
                actual: key.len(),
            });
        }
        let key = &key[..length];
        let invalid = |_| Error::crypto(format!("invalid {} key", cipher));
        Ok(match cipher {
            Cipher::Aes128Gcm => Self::Aes128Gcm(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            Cipher::Aes192Gcm => Self::Aes192Gcm(Box::new(Aes192Gcm::new_from_slice(key).map_err(invalid)?)),
            Cipher::Aes256Gcm => Self::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
            Cipher::ChaCha20Poly1305 => {
                Self::ChaCha20Poly1305(Box::new(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?))
            }
            other => return Err(Error::crypto(format!("{} is not an AEAD cipher", other))),
        })
    }

    /// Encrypt `buffer` in place and return the detached tag.
    pub fn encrypt_in_place_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; TAG_SIZE]> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match self {
            Self::Aes128Gcm(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
            Self::Aes192Gcm(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
            Self::Aes256Gcm(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
            Self::ChaCha20Poly1305(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
        }
        .map_err(|_| Error::crypto("encryption failed"))?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify `tag` and decrypt `buffer` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, tampered data, etc.)
    pub fn decrypt_in_place_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<()> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        match self {
            Self::Aes128Gcm(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
            Self::Aes192Gcm(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
            Self::Aes256Gcm(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
            Self::ChaCha20Poly1305(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
        }
        .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Aes128Gcm(_) => "AES-128-GCM",
            Self::Aes192Gcm(_) => "AES-192-GCM",
            Self::Aes256Gcm(_) => "AES-256-GCM",
            Self::ChaCha20Poly1305(_) => "CHACHA20-POLY1305",
        };
        f.debug_tuple("AeadCipher").field(&name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AEAD_CIPHERS: [Cipher; 4] = [
        Cipher::Aes128Gcm,
        Cipher::Aes192Gcm,
        Cipher::Aes256Gcm,
        Cipher::ChaCha20Poly1305,
    ];

    fn test_key() -> Vec<u8> {
        (0u8..64).collect()
    }

    #[test]
    fn test_encrypt_decrypt() {
        for cipher in AEAD_CIPHERS {
            let aead = AeadCipher::new(cipher, &test_key()).unwrap();
            let nonce = [1u8; NONCE_SIZE];

            let mut buffer = b"Hello, World!".to_vec();
            let tag = aead.encrypt_in_place_detached(&nonce, b"context", &mut buffer).unwrap();
            assert_ne!(buffer, b"Hello, World!");

            aead.decrypt_in_place_detached(&nonce, b"context", &mut buffer, &tag).unwrap();
            assert_eq!(buffer, b"Hello, World!", "{}", cipher);
        }
    }

    #[test]
    fn test_key_prefix_is_used() {
        let long = test_key();
        let a = AeadCipher::new(Cipher::Aes128Gcm, &long).unwrap();
        let b = AeadCipher::new(Cipher::Aes128Gcm, &long[..16]).unwrap();
        let nonce = [0u8; NONCE_SIZE];

        let mut buffer = b"data".to_vec();
        let tag = a.encrypt_in_place_detached(&nonce, b"", &mut buffer).unwrap();
        b.decrypt_in_place_detached(&nonce, b"", &mut buffer, &tag).unwrap();
        assert_eq!(buffer, b"data");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let aead = AeadCipher::new(Cipher::Aes256Gcm, &test_key()).unwrap();
        let nonce = [3u8; NONCE_SIZE];

        let mut buffer = b"secret data".to_vec();
        let tag = aead.encrypt_in_place_detached(&nonce, b"context1", &mut buffer).unwrap();
        assert!(aead
            .decrypt_in_place_detached(&nonce, b"context2", &mut buffer, &tag)
            .is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = AeadCipher::new(Cipher::ChaCha20Poly1305, &test_key()).unwrap();
        let nonce = [4u8; NONCE_SIZE];

        let mut buffer = b"secret data".to_vec();
        let tag = aead.encrypt_in_place_detached(&nonce, b"", &mut buffer).unwrap();
        buffer[0] ^= 0x01;
        assert!(aead.decrypt_in_place_detached(&nonce, b"", &mut buffer, &tag).is_err());
    }

    #[test]
    fn test_rejects_cbc_and_short_keys() {
        assert!(AeadCipher::new(Cipher::Aes256Cbc, &test_key()).is_err());
        assert!(AeadCipher::new(Cipher::Aes256Gcm, &[0u8; 16]).is_err());
    }
}
