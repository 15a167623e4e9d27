//! AUTH payload construction and server reply parsing.
//!
//! Request layout (TLS plaintext):
//! ```text
//! ┌────────────────┬────────────────┬─────────────┬─────────────┐
//! │ 00 00 00 00 02 │ pre-master (48)│ random1 (32)│ random2 (32)│
//! ├────────────────┴────────────────┴─────────────┴─────────────┤
//! │ options │ username │ password │ peer info   (sized strings)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The reply carries the same prefix, two server randoms and the server
//! options string. Parsing is incremental: plaintext is appended as it
//! leaves the TLS layer and `parse_auth_reply` reports `false` until the
//! reply is complete.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::control::TlsWrap;
use crate::crypto::prf::{self, KeyMaterial};
use crate::crypto::{Cipher, CryptoKeys, Digest, Prng, SecureBytes, PRE_MASTER_LENGTH, RANDOM_LENGTH};
use crate::data::CompressionFraming;
use crate::error::{Error, Result};
use crate::protocol::SessionId;

/// Key method 2 prefix of both request and reply.
pub const CONTROL_DATA_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x02];

/// Options string sent when local options are disabled.
pub const UNDEFINED_OPTIONS: &str = "V0 UNDEF";

const REPLY_MIN_LENGTH: usize = CONTROL_DATA_PREFIX.len() + 2 * RANDOM_LENGTH + 2;

/// Username and password for `auth-user-pass`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Local options announced to the server.
#[derive(Debug, Clone, Copy)]
pub struct LocalOptions<'a> {
    /// Data channel cipher
    pub cipher: Cipher,
    /// HMAC digest
    pub digest: Digest,
    /// Compression framing
    pub compression: CompressionFraming,
    /// Control channel wrapping
    pub tls_wrap: Option<&'a TlsWrap>,
}

impl LocalOptions<'_> {
    /// Comma-separated options string (`V4,...`).
    pub fn render(&self) -> String {
        let mut options = vec!["V4".to_string(), "dev-type tun".to_string()];
        match self.compression {
            CompressionFraming::Disabled => {}
            CompressionFraming::CompLzo => options.push("comp-lzo".into()),
            CompressionFraming::Compress | CompressionFraming::CompressV2 => options.push("compress".into()),
        }
        if let Some(TlsWrap::Auth { key, .. }) = self.tls_wrap {
            if let Some(direction) = key.direction() {
                options.push(format!("keydir {}", direction.value()));
            }
        }
        options.push(format!("cipher {}", self.cipher));
        options.push(format!("auth {}", self.digest));
        options.push(format!("keysize {}", self.cipher.key_bits()));
        if let Some(wrap) = self.tls_wrap {
            options.push(wrap.option_name().into());
        }
        options.push("key-method 2".into());
        options.push("tls-client".into());
        options.join(",")
    }
}

/// Handshake secrets and AUTH reply state for one negotiation.
pub struct Authenticator {
    pre_master: SecureBytes,
    random1: SecureBytes,
    random2: SecureBytes,
    server_random1: Option<SecureBytes>,
    server_random2: Option<SecureBytes>,
    server_options: Option<String>,
    control_buffer: SecureBytes,
    credentials: Option<Credentials>,
    with_local_options: bool,
}

impl Authenticator {
    /// Generate fresh handshake randoms.
    pub fn new(prng: &dyn Prng, credentials: Option<Credentials>) -> Self {
        Self {
            pre_master: SecureBytes::new(prng.data(PRE_MASTER_LENGTH)),
            random1: SecureBytes::new(prng.data(RANDOM_LENGTH)),
            random2: SecureBytes::new(prng.data(RANDOM_LENGTH)),
            server_random1: None,
            server_random2: None,
            server_options: None,
            control_buffer: SecureBytes::default(),
            credentials,
            with_local_options: true,
        }
    }

    /// Send `V0 UNDEF` instead of the local options.
    pub fn with_local_options(mut self, enabled: bool) -> Self {
        self.with_local_options = enabled;
        self
    }

    /// Whether local options are announced.
    pub fn sends_local_options(&self) -> bool {
        self.with_local_options
    }

    /// Build the AUTH payload.
    pub fn request(&self, options: &LocalOptions<'_>, peer_info: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(512));
        out.extend_from_slice(&CONTROL_DATA_PREFIX);
        out.extend_from_slice(self.pre_master.as_bytes());
        out.extend_from_slice(self.random1.as_bytes());
        out.extend_from_slice(self.random2.as_bytes());

        let options = if self.with_local_options {
            options.render()
        } else {
            UNDEFINED_OPTIONS.to_string()
        };
        debug!(%options, "authenticator: local options");
        put_sized_string(&mut out, &options)?;

        match &self.credentials {
            Some(credentials) => {
                put_sized_string(&mut out, &credentials.username)?;
                put_sized_string(&mut out, &credentials.password)?;
            }
            None => {
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&[0, 0]);
            }
        }
        put_sized_string(&mut out, peer_info)?;
        Ok(out)
    }

    /// Append TLS plaintext received from the server.
    pub fn append_control_data(&mut self, data: &[u8]) {
        self.control_buffer.extend_from_slice(data);
    }

    /// Bytes buffered and not yet parsed.
    pub fn buffered_len(&self) -> usize {
        self.control_buffer.len()
    }

    /// Try to parse the server AUTH reply.
    ///
    /// Returns `Ok(false)` while more data is needed; on success the reply
    /// is removed from the buffer.
    pub fn parse_auth_reply(&mut self) -> Result<bool> {
        let buffer = self.control_buffer.as_bytes();
        if buffer.len() < REPLY_MIN_LENGTH {
            return Ok(false);
        }
        if buffer[..CONTROL_DATA_PREFIX.len()] != CONTROL_DATA_PREFIX {
            return Err(Error::WrongControlDataPrefix);
        }

        let mut offset = CONTROL_DATA_PREFIX.len();
        let random1 = &buffer[offset..offset + RANDOM_LENGTH];
        offset += RANDOM_LENGTH;
        let random2 = &buffer[offset..offset + RANDOM_LENGTH];
        offset += RANDOM_LENGTH;
        let options_length = u16::from_be_bytes([buffer[offset], buffer[offset + 1]]) as usize;
        offset += 2;
        if buffer.len() < offset + options_length {
            return Ok(false);
        }

        let raw_options = &buffer[offset..offset + options_length];
        let raw_options = raw_options.strip_suffix(&[0]).unwrap_or(raw_options);
        let options = String::from_utf8_lossy(raw_options).into_owned();
        debug!(%options, "authenticator: server options");

        self.server_random1 = Some(SecureBytes::from_slice(random1));
        self.server_random2 = Some(SecureBytes::from_slice(random2));
        self.server_options = Some(options);
        self.control_buffer.consume(offset + options_length);
        Ok(true)
    }

    /// Extract every complete NUL-terminated message; a partial trailing
    /// message stays buffered.
    pub fn parse_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(end) = self.control_buffer.as_bytes().iter().position(|b| *b == 0) {
            let message = String::from_utf8_lossy(&self.control_buffer.as_bytes()[..end]).into_owned();
            self.control_buffer.consume(end + 1);
            if !message.is_empty() {
                messages.push(message);
            }
        }
        messages
    }

    /// Server options string from the AUTH reply.
    pub fn server_options(&self) -> Option<&str> {
        self.server_options.as_deref()
    }

    /// Run the PRF over the handshake material.
    pub fn derive_keys(&self, session_id: &SessionId, remote_session_id: &SessionId) -> Result<CryptoKeys> {
        let (Some(server_random1), Some(server_random2)) = (&self.server_random1, &self.server_random2) else {
            return Err(Error::control("server randoms not received"));
        };
        prf::derive_keys(&KeyMaterial {
            pre_master: self.pre_master.as_bytes(),
            random1: self.random1.as_bytes(),
            random2: self.random2.as_bytes(),
            server_random1: server_random1.as_bytes(),
            server_random2: server_random2.as_bytes(),
            session_id,
            remote_session_id,
        })
    }

    /// Zero every secret and the control buffer.
    pub fn reset(&mut self) {
        self.pre_master.reset();
        self.random1.reset();
        self.random2.reset();
        self.server_random1 = None;
        self.server_random2 = None;
        self.control_buffer.reset();
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("buffered", &self.control_buffer.len())
            .field("server_options", &self.server_options)
            .finish_non_exhaustive()
    }
}

/// `u16be(len + 1) || s || 00`
fn put_sized_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let length = u16::try_from(value.len() + 1).map_err(|_| Error::Buffer {
        expected: u16::MAX as usize,
        actual: value.len() + 1,
    })?;
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}
