//! Cipher and digest selection.
//!
//! Names match the OpenVPN option values (`cipher AES-256-GCM`,
//! `auth SHA256`) so they round-trip through the AUTH options string and
//! PUSH_REPLY.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Data channel cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Cipher {
    /// AES-128 in CBC mode with HMAC
    Aes128Cbc,
    /// AES-192 in CBC mode with HMAC
    Aes192Cbc,
    /// AES-256 in CBC mode with HMAC
    Aes256Cbc,
    /// AES-128-GCM
    Aes128Gcm,
    /// AES-192-GCM
    Aes192Gcm,
    /// AES-256-GCM
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl Cipher {
    /// All ciphers this implementation can negotiate.
    pub const ALL: [Cipher; 7] = [
        Cipher::Aes128Cbc,
        Cipher::Aes192Cbc,
        Cipher::Aes256Cbc,
        Cipher::Aes128Gcm,
        Cipher::Aes192Gcm,
        Cipher::Aes256Gcm,
        Cipher::ChaCha20Poly1305,
    ];

    /// OpenVPN option name.
    pub fn name(&self) -> &'static str {
        match self {
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes192Cbc => "AES-192-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes192Gcm => "AES-192-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
            Cipher::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Key length in bytes.
    pub fn key_length(&self) -> usize {
        match self {
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes192Cbc | Cipher::Aes192Gcm => 24,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm | Cipher::ChaCha20Poly1305 => 32,
        }
    }

    /// Key length in bits, as announced by `keysize`.
    pub fn key_bits(&self) -> usize {
        self.key_length() * 8
    }

    /// Whether this is an AEAD cipher (no separate HMAC).
    pub fn is_aead(&self) -> bool {
        !matches!(
            self,
            Cipher::Aes128Cbc | Cipher::Aes192Cbc | Cipher::Aes256Cbc
        )
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        Cipher::ALL
            .iter()
            .copied()
            .find(|c| c.name() == upper)
            .ok_or_else(|| Error::config(format!("unsupported cipher: {}", s)))
    }
}

impl TryFrom<String> for Cipher {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Cipher> for String {
    fn from(cipher: Cipher) -> Self {
        cipher.name().to_string()
    }
}

/// HMAC digest used by CBC data channels and `tls-auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Digest {
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl Digest {
    /// All supported digests.
    pub const ALL: [Digest; 5] = [
        Digest::Sha1,
        Digest::Sha224,
        Digest::Sha256,
        Digest::Sha384,
        Digest::Sha512,
    ];

    /// OpenVPN option name.
    pub fn name(&self) -> &'static str {
        match self {
            Digest::Sha1 => "SHA1",
            Digest::Sha224 => "SHA224",
            Digest::Sha256 => "SHA256",
            Digest::Sha384 => "SHA384",
            Digest::Sha512 => "SHA512",
        }
    }

    /// Output length in bytes, which is also the HMAC key length used.
    pub fn output_length(&self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Sha224 => 28,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }

    /// Compute HMAC over the concatenation of `parts`.
    pub fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        match self {
            Digest::Sha1 => hmac_parts::<Hmac<Sha1>>(key, parts),
            Digest::Sha224 => hmac_parts::<Hmac<Sha224>>(key, parts),
            Digest::Sha256 => hmac_parts::<Hmac<Sha256>>(key, parts),
            Digest::Sha384 => hmac_parts::<Hmac<Sha384>>(key, parts),
            Digest::Sha512 => hmac_parts::<Hmac<Sha512>>(key, parts),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase().replace('-', "");
        Digest::ALL
            .iter()
            .copied()
            .find(|d| d.name() == upper)
            .ok_or_else(|| Error::config(format!("unsupported digest: {}", s)))
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.name().to_string()
    }
}

pub(crate) fn hmac_parts<M: Mac + hmac::digest::KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| Error::crypto("invalid HMAC key"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-MD5, only used by the legacy PRF.
pub(crate) fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    hmac_parts::<Hmac<Md5>>(key, parts)
}

/// HMAC-SHA1, only used by the legacy PRF.
pub(crate) fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    hmac_parts::<Hmac<Sha1>>(key, parts)
}
