//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::TlsWrap;
use crate::crypto::{Cipher, Digest, KeyDirection, StaticKey};
use crate::data::CompressionFraming;
use crate::error::{Error, Result};
use crate::obfuscation::XorMethod;

/// Transport used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    /// One OpenVPN packet per datagram
    #[default]
    Udp,
    /// Length-prefixed packets over a stream
    Tcp,
}

/// Control channel wrapping as written in configuration files.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum TlsWrapConfig {
    /// `tls-auth`, HMAC with the session digest
    Auth {
        /// Static key file content
        #[serde(with = "static_key_file")]
        key: StaticKey,
        /// `key-direction`
        #[serde(default)]
        direction: Option<KeyDirection>,
    },
    /// `tls-crypt`
    Crypt {
        /// Static key file content
        #[serde(with = "static_key_file")]
        key: StaticKey,
    },
}

impl TlsWrapConfig {
    /// Runtime wrapping for a session using `digest`.
    pub fn to_tls_wrap(&self, digest: Digest) -> TlsWrap {
        match self {
            TlsWrapConfig::Auth { key, direction } => TlsWrap::Auth {
                digest,
                key: key.with_direction(*direction),
            },
            // tls-crypt keys are always used in client direction
            TlsWrapConfig::Crypt { key } => TlsWrap::Crypt {
                key: key.with_direction(Some(KeyDirection::Client)),
            },
        }
    }
}

impl std::fmt::Debug for TlsWrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsWrapConfig::Auth { direction, .. } => {
                f.debug_struct("Auth").field("direction", direction).finish_non_exhaustive()
            }
            TlsWrapConfig::Crypt { .. } => f.debug_struct("Crypt").finish_non_exhaustive(),
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Server host name or address
    pub remote_host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub remote_port: u16,

    /// Link transport
    #[serde(default)]
    pub protocol: LinkProtocol,

    /// Data channel cipher before negotiation
    #[serde(default = "default_cipher")]
    pub cipher: Cipher,

    /// Ciphers offered for negotiation (`data-ciphers`)
    #[serde(default)]
    pub data_ciphers: Vec<Cipher>,

    /// HMAC digest (`auth`)
    #[serde(default = "default_digest")]
    pub digest: Digest,

    /// Compression framing
    #[serde(default)]
    pub compression: CompressionFraming,

    /// Control channel wrapping
    #[serde(default)]
    pub tls_wrap: Option<TlsWrapConfig>,

    /// Link scrambling (`scramble ...`)
    #[serde(default)]
    pub xor_method: Option<XorMethod>,

    /// Announce local options in the AUTH payload
    #[serde(default = "default_true")]
    pub uses_local_options: bool,

    /// Version reported as `IV_UI_VER`
    #[serde(default = "default_ui_version")]
    pub ui_version: String,

    /// Control packet retransmission delay (seconds)
    #[serde(default = "default_resend_after")]
    pub resend_after_secs: u64,

    /// Negotiation must complete within this many seconds
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Keep-alive ping interval (seconds), overridden by `ping`
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Peer silence tolerated (seconds), overridden by `ping-restart`
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_secs: u64,

    /// Client initiated renegotiation period (seconds, 0 disables)
    #[serde(default = "default_renegotiates_after")]
    pub renegotiates_after_secs: u64,

    /// How long a replaced data channel keeps decrypting (seconds)
    #[serde(default = "default_transition_window")]
    pub transition_window_secs: u64,

    /// Log key material and payloads in hex
    #[serde(default)]
    pub log_sensitive_data: bool,
}

fn default_port() -> u16 {
    1194
}

fn default_cipher() -> Cipher {
    Cipher::Aes256Gcm
}

fn default_digest() -> Digest {
    Digest::Sha1
}

fn default_true() -> bool {
    true
}

fn default_ui_version() -> String {
    concat!("ovpn-core ", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_resend_after() -> u64 {
    2
}

fn default_negotiation_timeout() -> u64 {
    30
}

fn default_keep_alive_interval() -> u64 {
    10
}

fn default_keep_alive_timeout() -> u64 {
    60
}

fn default_renegotiates_after() -> u64 {
    3600
}

fn default_transition_window() -> u64 {
    60
}

impl Configuration {
    /// Configuration with defaults for `remote_host`.
    pub fn new(remote_host: impl Into<String>) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port: default_port(),
            protocol: LinkProtocol::default(),
            cipher: default_cipher(),
            data_ciphers: Vec::new(),
            digest: default_digest(),
            compression: CompressionFraming::default(),
            tls_wrap: None,
            xor_method: None,
            uses_local_options: true,
            ui_version: default_ui_version(),
            resend_after_secs: default_resend_after(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            keep_alive_timeout_secs: default_keep_alive_timeout(),
            renegotiates_after_secs: default_renegotiates_after(),
            transition_window_secs: default_transition_window(),
            log_sensitive_data: false,
        }
    }

    /// `host:port` of the server.
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Runtime control channel wrapping.
    pub fn tls_wrap(&self) -> Option<TlsWrap> {
        self.tls_wrap.as_ref().map(|wrap| wrap.to_tls_wrap(self.digest))
    }

    /// Retransmission delay.
    pub fn resend_after(&self) -> Duration {
        Duration::from_secs(self.resend_after_secs)
    }

    /// Negotiation deadline.
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    /// Keep-alive timeout.
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    /// Renegotiation period, if enabled.
    pub fn renegotiates_after(&self) -> Option<Duration> {
        (self.renegotiates_after_secs > 0).then(|| Duration::from_secs(self.renegotiates_after_secs))
    }

    /// Transition window for replaced keys.
    pub fn transition_window(&self) -> Duration {
        Duration::from_secs(self.transition_window_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.remote_host.is_empty() {
            return Err(Error::config("remote_host cannot be empty"));
        }
        if self.remote_port == 0 {
            return Err(Error::config("remote_port cannot be 0"));
        }
        if self.resend_after_secs == 0 {
            return Err(Error::config("resend_after_secs must be positive"));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(Error::config("negotiation_timeout_secs must be positive"));
        }
        if self.keep_alive_interval_secs > 0 && self.keep_alive_timeout_secs <= self.keep_alive_interval_secs {
            return Err(Error::config("keep_alive_timeout_secs must exceed keep_alive_interval_secs"));
        }
        if !self.uses_local_options && !self.data_ciphers.is_empty() && !self.data_ciphers.contains(&self.cipher) {
            return Err(Error::config("cipher must be one of data_ciphers"));
        }
        Ok(())
    }
}

/// Serde helper reading and writing the OpenVPN static key file format.
mod static_key_file {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::crypto::StaticKey;

    pub fn serialize<S>(key: &StaticKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&key.to_file_content())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<StaticKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        StaticKey::from_file_content(&s, None).map_err(serde::de::Error::custom)
    }
}
