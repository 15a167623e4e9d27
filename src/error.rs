//! Error types for the OpenVPN protocol core.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the data path while encrypting or decrypting packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataPathError {
    /// Cipher or digest could not be set up for the data channel
    #[error("unsupported or misconfigured algorithm")]
    Algorithm,

    /// A DATA_V2 packet carried a peer id other than ours
    #[error("peer id mismatch")]
    PeerIdMismatch,

    /// Outbound packet id space exhausted
    #[error("packet id overflow")]
    Overflow,

    /// Peer sent a compressed packet or unknown compression framing
    #[error("unsupported compression")]
    Compression,

    /// Encryption, decryption or authentication failure
    #[error("data channel crypto failure (code {0})")]
    Crypto(u32),
}

impl DataPathError {
    /// Whether this error invalidates the key rather than a single packet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DataPathError::Algorithm | DataPathError::Crypto(_))
    }
}

/// Errors that can occur during OpenVPN operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or truncated control packet
    #[error("control channel error: {0}")]
    ControlChannel(String),

    /// Cryptographic operation failed (bad HMAC, bad tag, key setup)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Data path failure
    #[error("data path error: {0}")]
    DataPath(#[from] DataPathError),

    /// Control channel used before a session id was generated
    #[error("missing session id")]
    MissingSessionId,

    /// Peer acknowledged packets for a different session
    #[error("session id mismatch")]
    SessionMismatch,

    /// Packet referenced a key id with no negotiated keys
    #[error("bad key id {0}")]
    BadKey(u8),

    /// Server AUTH reply did not start with the expected prefix
    #[error("wrong control data prefix")]
    WrongControlDataPrefix,

    /// Server rejected the credentials
    #[error("authentication failed: bad credentials")]
    BadCredentials,

    /// Server rejected the credentials while local options were announced
    #[error("authentication failed: bad credentials (retry without local options)")]
    BadCredentialsWithLocalOptions,

    /// A renegotiation was requested while another is in flight
    #[error("renegotiation already in progress")]
    RenegotiationInProgress,

    /// Negotiation did not complete in time
    #[error("negotiation timeout after {0}ms")]
    NegotiationTimeout(u64),

    /// Peer stopped answering
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Link closed or failed underneath the session
    #[error("link failure: {0}")]
    LinkFailure(String),

    /// Network path changed (e.g. mobile handoff)
    #[error("network changed")]
    NetworkChanged,

    /// Server asked the client to restart or shut down
    #[error("server shutdown")]
    ServerShutdown,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// TLS collaborator failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },
}

impl Error {
    /// Create a new control channel error
    pub fn control(msg: impl Into<String>) -> Self {
        Error::ControlChannel(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new link failure
    pub fn link(msg: impl Into<String>) -> Self {
        Error::LinkFailure(msg.into())
    }

    /// Check if reconnecting may fix this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::NegotiationTimeout(_)
                | Error::LinkFailure(_)
                | Error::Network(_)
                | Error::NetworkChanged
                | Error::ServerShutdown
        )
    }

    /// Check if this error indicates rejected credentials
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::BadCredentials | Error::BadCredentialsWithLocalOptions
        )
    }
}
