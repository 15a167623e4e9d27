//! AES-256-CTR with HMAC-SHA256, the `tls-crypt` construction.
//!
//! The tag is `HMAC-SHA256(ad || plaintext)` and its first 16 bytes are the
//! CTR IV (SIV style), so a tag mismatch is detected after decrypting.

use aes::Aes256;
use ::ctr::cipher::{KeyIvInit, StreamCipher};
use subtle::ConstantTimeEq;

use crate::crypto::{Digest, SecureBytes, BLOCK_SIZE, TLS_CRYPT_TAG_SIZE};
use crate::error::{Error, Result};

type Aes256Ctr = ::ctr::Ctr128BE<Aes256>;

const CIPHER_KEY_LENGTH: usize = 32;

/// Keyed `tls-crypt` box for both directions.
#[derive(Debug)]
pub struct CtrHmac {
    encrypt_key: SecureBytes,
    decrypt_key: SecureBytes,
    hmac_send_key: SecureBytes,
    hmac_receive_key: SecureBytes,
}

impl CtrHmac {
    /// Create from static key slots; only the first 32 bytes of each are used.
    pub fn new(
        encrypt_key: &[u8],
        decrypt_key: &[u8],
        hmac_send_key: &[u8],
        hmac_receive_key: &[u8],
    ) -> Result<Self> {
        let take = |key: &[u8]| -> Result<SecureBytes> {
            key.get(..CIPHER_KEY_LENGTH)
                .map(SecureBytes::from_slice)
                .ok_or(Error::Buffer {
                    expected: CIPHER_KEY_LENGTH,
                    actual: key.len(),
                })
        };
        Ok(Self {
            encrypt_key: take(encrypt_key)?,
            decrypt_key: take(decrypt_key)?,
            hmac_send_key: take(hmac_send_key)?,
            hmac_receive_key: take(hmac_receive_key)?,
        })
    }

    /// Authenticate `ad || plaintext` and encrypt, appending
    /// `tag || ciphertext` to `out`.
    pub fn encrypt(&self, ad: &[u8], plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let tag = Digest::Sha256.hmac(self.hmac_send_key.as_bytes(), &[ad, plaintext])?;
        let start = out.len();
        out.reserve(tag.len() + plaintext.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(plaintext);

        apply_keystream(
            self.encrypt_key.as_bytes(),
            &tag[..BLOCK_SIZE],
            &mut out[start + TLS_CRYPT_TAG_SIZE..],
        )
    }

    /// Decrypt `tag || ciphertext` and verify the tag over `ad || plaintext`.
    pub fn decrypt(&self, ad: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < TLS_CRYPT_TAG_SIZE {
            return Err(Error::Buffer {
                expected: TLS_CRYPT_TAG_SIZE,
                actual: input.len(),
            });
        }
        let (tag, ciphertext) = input.split_at(TLS_CRYPT_TAG_SIZE);
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        plaintext.extend_from_slice(ciphertext);
        apply_keystream(self.decrypt_key.as_bytes(), &tag[..BLOCK_SIZE], &mut plaintext)?;

        let expected = Digest::Sha256.hmac(self.hmac_receive_key.as_bytes(), &[ad, &plaintext])?;
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(Error::crypto("tls-crypt tag mismatch"));
        }
        Ok(plaintext)
    }
}

fn apply_keystream(key: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<()> {
    let mut cipher = Aes256Ctr::new_from_slices(key, iv)
        .map_err(|_| Error::crypto("invalid CTR key or IV"))?;
    cipher.apply_keystream(buffer);
    Ok(())
}
