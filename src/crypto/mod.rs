//! Cryptographic primitives for the OpenVPN core.
//!
//! This module provides:
//! - Cipher and digest selection matching OpenVPN option names
//! - The legacy TLS 1.0 PRF used by key method 2
//! - AES-CBC + HMAC and AEAD (AES-GCM, ChaCha20-Poly1305) data channel boxes
//! - AES-256-CTR + HMAC-SHA256 for `tls-crypt`
//! - The 2048-bit static key and zero-on-drop key buffers
//! - Injected secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod algorithm;
mod cbc;
mod ctr;
mod keys;
pub mod prf;
mod random;

pub use aead::AeadCipher;
pub use algorithm::{Cipher, Digest};
pub use cbc::CbcHmac;
pub use ctr::CtrHmac;
pub use keys::{CryptoKeys, KeyDirection, KeyPair, SecureBytes, StaticKey};
pub use random::{Prng, SecureRandom, SeededRandom};

pub(crate) use algorithm::hmac_parts;

/// Size of the OpenVPN static key in bytes (2048 bits)
pub const STATIC_KEY_LENGTH: usize = 256;

/// Size of each of the four static key slots
pub const STATIC_KEY_SLOT_LENGTH: usize = 64;

/// Size of the client pre-master secret
pub const PRE_MASTER_LENGTH: usize = 48;

/// Size of each client/server random
pub const RANDOM_LENGTH: usize = 32;

/// Size of each of the four key block slices
pub const KEY_BLOCK_SLOT_LENGTH: usize = 64;

/// Size of AEAD nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// AES block size, also the CBC IV size
pub const BLOCK_SIZE: usize = 16;

/// Size of the `tls-crypt` HMAC-SHA256 tag
pub const TLS_CRYPT_TAG_SIZE: usize = 32;

/// Deterministic static key whose byte `i` is `i`, for tests.
#[cfg(test)]
pub(crate) fn test_static_key(direction: Option<KeyDirection>) -> StaticKey {
    let data: Vec<u8> = (0..STATIC_KEY_LENGTH).map(|i| i as u8).collect();
    StaticKey::new(&data, direction).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;

    #[test]
    fn test_negotiated_keys_drive_both_peers() {
        let pre_master = [9u8; PRE_MASTER_LENGTH];
        let randoms = [[1u8; RANDOM_LENGTH], [2; RANDOM_LENGTH], [3; RANDOM_LENGTH], [4; RANDOM_LENGTH]];
        let client_sid = SessionId::new([0xaa; 8]);
        let server_sid = SessionId::new([0xbb; 8]);

        let client_keys = prf::derive_keys(&prf::KeyMaterial {
            pre_master: &pre_master,
            random1: &randoms[0],
            random2: &randoms[1],
            server_random1: &randoms[2],
            server_random2: &randoms[3],
            session_id: &client_sid,
            remote_session_id: &server_sid,
        })
        .unwrap();
        let server_keys = client_keys.mirrored();

        let client = AeadCipher::new(
            Cipher::Aes256Gcm,
            client_keys.cipher.encryption_key.as_bytes(),
        )
        .unwrap();
        let server = AeadCipher::new(
            Cipher::Aes256Gcm,
            server_keys.cipher.decryption_key.as_bytes(),
        )
        .unwrap();

        let nonce = [7u8; NONCE_SIZE];
        let mut buffer = b"tunnel payload".to_vec();
        let tag = client.encrypt_in_place_detached(&nonce, b"ad", &mut buffer).unwrap();
        server.decrypt_in_place_detached(&nonce, b"ad", &mut buffer, &tag).unwrap();
        assert_eq!(buffer, b"tunnel payload");
    }
}
