//! Legacy TLS 1.0 PRF used by OpenVPN key method 2.
//!
//! `P_MD5` over the first half of the secret is XORed with `P_SHA1` over the
//! second half. The algorithm pair is fixed by the protocol and must stay
//! bit-exact for interoperability with OpenVPN servers.

use zeroize::Zeroizing;

use crate::crypto::algorithm::{hmac_md5, hmac_sha1};
use crate::crypto::keys::{CryptoKeys, KeyPair, SecureBytes};
use crate::crypto::{KEY_BLOCK_SLOT_LENGTH, PRE_MASTER_LENGTH};
use crate::error::Result;
use crate::protocol::SessionId;

/// Label of the first derivation stage.
pub const LABEL_MASTER_SECRET: &str = "OpenVPN master secret";

/// Label of the second derivation stage.
pub const LABEL_KEY_EXPANSION: &str = "OpenVPN key expansion";

/// Input of one PRF invocation.
pub struct PrfInput<'a> {
    /// Label mixed into the seed
    pub label: &'a str,
    /// Secret to expand
    pub secret: &'a [u8],
    /// Client random
    pub client_seed: &'a [u8],
    /// Server random
    pub server_seed: &'a [u8],
    /// Local session id, appended to the seed when present
    pub client_session_id: Option<&'a SessionId>,
    /// Remote session id, appended to the seed when present
    pub server_session_id: Option<&'a SessionId>,
    /// Output size in bytes
    pub size: usize,
}

/// Run the PRF.
pub fn prf(input: &PrfInput<'_>) -> Result<SecureBytes> {
    let mut seed = Vec::with_capacity(
        input.label.len() + input.client_seed.len() + input.server_seed.len() + 16,
    );
    seed.extend_from_slice(input.label.as_bytes());
    seed.extend_from_slice(input.client_seed);
    seed.extend_from_slice(input.server_seed);
    if let Some(id) = input.client_session_id {
        seed.extend_from_slice(id.as_bytes());
    }
    if let Some(id) = input.server_session_id {
        seed.extend_from_slice(id.as_bytes());
    }
    let seed = Zeroizing::new(seed);

    let secret = input.secret;
    let len = secret.len() / 2;
    let half_len = len + (secret.len() & 1);
    let first_half = &secret[..half_len];
    let second_half = &secret[len..len + half_len];

    let md5_out = p_hash(HashKind::Md5, first_half, &seed, input.size)?;
    let sha1_out = p_hash(HashKind::Sha1, second_half, &seed, input.size)?;

    let out: Vec<u8> = md5_out
        .iter()
        .zip(sha1_out.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    Ok(SecureBytes::new(out))
}

#[derive(Clone, Copy)]
enum HashKind {
    Md5,
    Sha1,
}

impl HashKind {
    fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        match self {
            HashKind::Md5 => hmac_md5(key, parts),
            HashKind::Sha1 => hmac_sha1(key, parts),
        }
    }
}

/// TLS `P_hash` expansion to exactly `size` bytes.
fn p_hash(kind: HashKind, secret: &[u8], seed: &[u8], size: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(size + 20));
    let mut a = Zeroizing::new(kind.hmac(secret, &[seed])?);
    while out.len() < size {
        let chunk = Zeroizing::new(kind.hmac(secret, &[&a, seed])?);
        out.extend_from_slice(&chunk);
        a = Zeroizing::new(kind.hmac(secret, &[&a])?);
    }
    out.truncate(size);
    Ok(out)
}

/// Material consumed by the two-stage key derivation.
pub struct KeyMaterial<'a> {
    /// Client pre-master secret (48 bytes)
    pub pre_master: &'a [u8],
    /// First client random
    pub random1: &'a [u8],
    /// Second client random
    pub random2: &'a [u8],
    /// First server random
    pub server_random1: &'a [u8],
    /// Second server random
    pub server_random2: &'a [u8],
    /// Local session id
    pub session_id: &'a SessionId,
    /// Remote session id
    pub remote_session_id: &'a SessionId,
}

/// Derive the 256-byte key block for a data channel.
pub fn key_block(material: &KeyMaterial<'_>) -> Result<SecureBytes> {
    let master = prf(&PrfInput {
        label: LABEL_MASTER_SECRET,
        secret: material.pre_master,
        client_seed: material.random1,
        server_seed: material.server_random1,
        client_session_id: None,
        server_session_id: None,
        size: PRE_MASTER_LENGTH,
    })?;

    prf(&PrfInput {
        label: LABEL_KEY_EXPANSION,
        secret: master.as_bytes(),
        client_seed: material.random2,
        server_seed: material.server_random2,
        client_session_id: Some(material.session_id),
        server_session_id: Some(material.remote_session_id),
        size: 4 * KEY_BLOCK_SLOT_LENGTH,
    })
}

/// Derive the data channel keys: slices 0..4 of the key block are cipher
/// encrypt, hmac encrypt, cipher decrypt, hmac decrypt.
pub fn derive_keys(material: &KeyMaterial<'_>) -> Result<CryptoKeys> {
    let block = key_block(material)?;
    let slot = |i: usize| {
        SecureBytes::from_slice(&block.as_bytes()[i * KEY_BLOCK_SLOT_LENGTH..(i + 1) * KEY_BLOCK_SLOT_LENGTH])
    };
    Ok(CryptoKeys {
        cipher: KeyPair {
            encryption_key: slot(0),
            decryption_key: slot(2),
        },
        digest: KeyPair {
            encryption_key: slot(1),
            decryption_key: slot(3),
        },
    })
}
