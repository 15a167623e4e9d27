//! Key material containers.
//!
//! Provides a zero-on-drop byte buffer, the OpenVPN 2048-bit static key used
//! by `tls-auth` and `tls-crypt`, and the negotiated key bundle of a data
//! channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{STATIC_KEY_LENGTH, STATIC_KEY_SLOT_LENGTH};
use crate::error::{Error, Result};

/// A byte buffer holding secret material.
///
/// Zeroized when dropped or reset. `Debug` never prints the contents.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    /// Wrap existing bytes. The caller's copy is not zeroized.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copy from a slice.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First `len` bytes, or an error if the buffer is shorter.
    pub fn prefix(&self, len: usize) -> Result<&[u8]> {
        self.0.get(..len).ok_or(Error::Buffer {
            expected: len,
            actual: self.0.len(),
        })
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        // grow manually so the old allocation is zeroed before release
        if self.0.capacity() - self.0.len() < bytes.len() {
            let mut grown = Vec::with_capacity((self.0.len() + bytes.len()).max(self.0.capacity() * 2));
            grown.extend_from_slice(&self.0);
            self.0.zeroize();
            self.0 = grown;
        }
        self.0.extend_from_slice(bytes);
    }

    /// Drop the first `count` bytes, zeroing what was removed.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.0.len());
        self.0[..count].zeroize();
        self.0.drain(..count);
    }

    /// Zero the contents and clear.
    pub fn reset(&mut self) {
        self.0.zeroize();
    }

    /// Hex dump, only when sensitive logging is enabled.
    pub fn loggable(&self, sensitive: bool) -> String {
        if sensitive {
            hex::encode(&self.0)
        } else {
            format!("<{} bytes>", self.0.len())
        }
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes(<{} bytes>)", self.0.len())
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Static key direction (`key-direction` / `tls-auth key N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirection {
    /// Direction 0
    Server,
    /// Direction 1
    Client,
}

impl KeyDirection {
    /// Numeric value announced as `keydir N`.
    pub fn value(&self) -> u8 {
        match self {
            KeyDirection::Server => 0,
            KeyDirection::Client => 1,
        }
    }
}

const STATIC_KEY_BEGIN: &str = "-----BEGIN OpenVPN Static key V1-----";
const STATIC_KEY_END: &str = "-----END OpenVPN Static key V1-----";

/// OpenVPN 2048-bit static key.
///
/// The key is four consecutive 64-byte slots; the direction selects which
/// slots are used for each purpose.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct StaticKey {
    data: SecureBytes,
    #[zeroize(skip)]
    direction: Option<KeyDirection>,
}

impl StaticKey {
    /// Create from the raw 256 bytes.
    pub fn new(data: &[u8], direction: Option<KeyDirection>) -> Result<Self> {
        if data.len() != STATIC_KEY_LENGTH {
            return Err(Error::Buffer {
                expected: STATIC_KEY_LENGTH,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: SecureBytes::from_slice(data),
            direction,
        })
    }

    /// Parse the `-----BEGIN OpenVPN Static key V1-----` block.
    ///
    /// Comment lines starting with `#` or `;` and blank lines are ignored.
    pub fn from_file_content(content: &str, direction: Option<KeyDirection>) -> Result<Self> {
        let mut hex_body = Zeroizing::new(String::with_capacity(STATIC_KEY_LENGTH * 2));
        let mut inside = false;
        let mut seen_end = false;
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line == STATIC_KEY_BEGIN {
                inside = true;
                continue;
            }
            if line == STATIC_KEY_END {
                seen_end = true;
                break;
            }
            if inside {
                hex_body.push_str(line);
            }
        }
        if !inside || !seen_end {
            return Err(Error::config("static key block not found"));
        }
        let data = Zeroizing::new(
            hex::decode(hex_body.as_str())
                .map_err(|e| Error::config(format!("invalid static key hex: {}", e)))?,
        );
        Self::new(&data, direction)
    }

    /// Render in the OpenVPN file format (16 bytes per line).
    pub fn to_file_content(&self) -> String {
        let mut out = String::new();
        out.push_str(STATIC_KEY_BEGIN);
        out.push('\n');
        for chunk in self.data.as_bytes().chunks(16) {
            out.push_str(&hex::encode(chunk));
            out.push('\n');
        }
        out.push_str(STATIC_KEY_END);
        out.push('\n');
        out
    }

    /// Configured direction.
    pub fn direction(&self) -> Option<KeyDirection> {
        self.direction
    }

    /// Same key material with another direction.
    pub fn with_direction(&self, direction: Option<KeyDirection>) -> Self {
        Self {
            data: self.data.clone(),
            direction,
        }
    }

    fn slot(&self, index: usize) -> &[u8] {
        let start = index * STATIC_KEY_SLOT_LENGTH;
        &self.data.as_bytes()[start..start + STATIC_KEY_SLOT_LENGTH]
    }

    /// Slot used to encrypt outbound control packets.
    pub fn cipher_encrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(0),
            Some(KeyDirection::Client) => self.slot(2),
        }
    }

    /// Slot used to decrypt inbound control packets.
    pub fn cipher_decrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(0),
            Some(KeyDirection::Server) => self.slot(2),
        }
    }

    /// Slot used to sign outbound control packets.
    pub fn hmac_send_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(1),
            Some(KeyDirection::Client) => self.slot(3),
        }
    }

    /// Slot used to verify inbound control packets.
    pub fn hmac_receive_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(1),
            Some(KeyDirection::Server) => self.slot(3),
        }
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Encryption/decryption pair of one key purpose.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Key for outbound traffic
    pub encryption_key: SecureBytes,
    /// Key for inbound traffic
    pub decryption_key: SecureBytes,
}

/// Key bundle produced by the PRF for one data channel.
#[derive(Debug, Clone)]
pub struct CryptoKeys {
    /// Cipher keys
    pub cipher: KeyPair,
    /// HMAC keys (AEAD ciphers take their implicit IV from here)
    pub digest: KeyPair,
}

impl CryptoKeys {
    /// Keys as seen by the other end of the connection.
    pub fn mirrored(&self) -> Self {
        Self {
            cipher: KeyPair {
                encryption_key: self.cipher.decryption_key.clone(),
                decryption_key: self.cipher.encryption_key.clone(),
            },
            digest: KeyPair {
                encryption_key: self.digest.decryption_key.clone(),
                decryption_key: self.digest.encryption_key.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_static_key;

    #[test]
    fn test_secure_bytes_debug_hides_content() {
        let secret = SecureBytes::from_slice(b"hunter2");
        assert_eq!(format!("{:?}", secret), "SecureBytes(<7 bytes>)");
        assert_eq!(secret.loggable(false), "<7 bytes>");
        assert_eq!(secret.loggable(true), hex::encode(b"hunter2"));
    }

    #[test]
    fn test_secure_bytes_consume_and_reset() {
        let mut buf = SecureBytes::default();
        buf.extend_from_slice(b"hello");
        buf.extend_from_slice(b" world");
        buf.consume(6);
        assert_eq!(buf.as_bytes(), b"world");

        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_secure_bytes_prefix() {
        let buf = SecureBytes::from_slice(&[1, 2, 3]);
        assert_eq!(buf.prefix(2).unwrap(), &[1, 2]);
        assert!(buf.prefix(4).is_err());
    }

    #[test]
    fn test_static_key_slots_by_direction() {
        let none = test_static_key(None);
        assert_eq!(none.cipher_encrypt_key()[0], 0);
        assert_eq!(none.hmac_send_key()[0], 64);
        assert_eq!(none.hmac_receive_key()[0], 64);

        let client = test_static_key(Some(KeyDirection::Client));
        assert_eq!(client.cipher_encrypt_key()[0], 128);
        assert_eq!(client.hmac_send_key()[0], 192);
        assert_eq!(client.cipher_decrypt_key()[0], 0);
        assert_eq!(client.hmac_receive_key()[0], 64);

        let server = test_static_key(Some(KeyDirection::Server));
        assert_eq!(server.hmac_send_key(), client.hmac_receive_key());
        assert_eq!(server.cipher_encrypt_key(), client.cipher_decrypt_key());
    }

    #[test]
    fn test_static_key_file_round_trip() {
        let key = test_static_key(Some(KeyDirection::Client));
        let content = format!("#\n# 2048 bit OpenVPN static key\n#\n{}", key.to_file_content());
        let parsed = StaticKey::from_file_content(&content, Some(KeyDirection::Client)).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_static_key_rejects_bad_input() {
        assert!(StaticKey::new(&[0u8; 10], None).is_err());
        assert!(StaticKey::from_file_content("no key here", None).is_err());

        let truncated = format!("{}\n00112233\n{}\n", STATIC_KEY_BEGIN, STATIC_KEY_END);
        assert!(StaticKey::from_file_content(&truncated, None).is_err());
    }

    #[test]
    fn test_mirrored_keys() {
        let keys = CryptoKeys {
            cipher: KeyPair {
                encryption_key: SecureBytes::from_slice(&[1]),
                decryption_key: SecureBytes::from_slice(&[2]),
            },
            digest: KeyPair {
                encryption_key: SecureBytes::from_slice(&[3]),
                decryption_key: SecureBytes::from_slice(&[4]),
            },
        };
        let peer = keys.mirrored();
        assert_eq!(peer.cipher.encryption_key.as_bytes(), &[2]);
        assert_eq!(peer.digest.decryption_key.as_bytes(), &[3]);
    }
}
