//! AES-CBC with HMAC authentication (encrypt-then-MAC).
//!
//! Output layout is `HMAC(iv || ciphertext) || iv || ciphertext`, the body of
//! an OpenVPN CBC data packet after its header.

use aes::{Aes128, Aes192, Aes256};
use ::cbc::cipher::block_padding::Pkcs7;
use ::cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use subtle::ConstantTimeEq;

use crate::crypto::{Cipher, Digest, Prng, SecureBytes, BLOCK_SIZE};
use crate::error::{Error, Result};

/// CBC cipher plus HMAC digest for one direction.
#[derive(Debug)]
pub struct CbcHmac {
    cipher: Cipher,
    digest: Digest,
    cipher_key: SecureBytes,
    hmac_key: SecureBytes,
}

impl CbcHmac {
    /// Create from key slots; only the required prefix of each is kept.
    pub fn new(cipher: Cipher, digest: Digest, cipher_key: &[u8], hmac_key: &[u8]) -> Result<Self> {
        if cipher.is_aead() {
            return Err(Error::crypto(format!("{} is not a CBC cipher", cipher)));
        }
        let cipher_key = SecureBytes::from_slice(cipher_key);
        let hmac_key = SecureBytes::from_slice(hmac_key);
        Ok(Self {
            cipher,
            digest,
            cipher_key: SecureBytes::from_slice(cipher_key.prefix(cipher.key_length())?),
            hmac_key: SecureBytes::from_slice(hmac_key.prefix(digest.output_length())?),
        })
    }

    /// Bytes added before the ciphertext.
    pub fn overhead(&self) -> usize {
        self.digest.output_length() + BLOCK_SIZE
    }

    /// Encrypt `plaintext` with a fresh random IV, appending
    /// `hmac || iv || ciphertext` to `out`.
    pub fn encrypt(&self, prng: &dyn Prng, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut iv = [0u8; BLOCK_SIZE];
        prng.fill(&mut iv);

        let key = self.cipher_key.as_bytes();
        let invalid = |_| Error::crypto("invalid CBC key or IV");
        let ciphertext = match self.cipher {
            Cipher::Aes128Cbc => ::cbc::Encryptor::<Aes128>::new_from_slices(key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes192Cbc => ::cbc::Encryptor::<Aes192>::new_from_slices(key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes256Cbc => ::cbc::Encryptor::<Aes256>::new_from_slices(key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            other => return Err(Error::crypto(format!("{} is not a CBC cipher", other))),
        };

        let mac = self.digest.hmac(self.hmac_key.as_bytes(), &[&iv, &ciphertext])?;
        out.reserve(mac.len() + iv.len() + ciphertext.len());
        out.extend_from_slice(&mac);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(())
    }

    /// Verify the HMAC, then decrypt `hmac || iv || ciphertext`.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mac_len = self.digest.output_length();
        if input.len() < mac_len + BLOCK_SIZE {
            return Err(Error::Buffer {
                expected: mac_len + BLOCK_SIZE,
                actual: input.len(),
            });
        }
        let (mac, rest) = input.split_at(mac_len);
        let expected = self.digest.hmac(self.hmac_key.as_bytes(), &[rest])?;
        if !bool::from(expected.as_slice().ct_eq(mac)) {
            return Err(Error::crypto("HMAC mismatch"));
        }

        let (iv, ciphertext) = rest.split_at(BLOCK_SIZE);
        let key = self.cipher_key.as_bytes();
        let invalid = |_| Error::crypto("invalid CBC key or IV");
        let unpad = |_| Error::crypto("bad padding");
        match self.cipher {
            Cipher::Aes128Cbc => ::cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
            Cipher::Aes192Cbc => ::cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
            Cipher::Aes256Cbc => ::cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
            other => Err(Error::crypto(format!("{} is not a CBC cipher", other))),
        }
    }
}
