//! # ovpn
//!
//! Client side of the OpenVPN 2.x protocol: reliable control channel,
//! key method 2 negotiation and an encrypted data channel, with optional
//! XOR scrambling of the link.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Transport (tokio UDP/TCP links, tunnel, runner)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Session (sans-IO driver, renegotiation, timers)        │
//! ├──────────────────────────────┬──────────────────────────┤
//! │  Handshake (AUTH, PRF keys)  │  Data channel (CBC/AEAD) │
//! ├──────────────────────────────┴──────────────────────────┤
//! │  Control channel (reliability, tls-auth / tls-crypt)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Obfuscation (xormask, xorptrpos, reverse, obfuscate)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto (AES, ChaCha20-Poly1305, HMAC, PRF, keys)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! TLS itself is pluggable through [`session::TlsProtocol`]; the crate
//! never touches certificates.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod control;
pub mod crypto;
pub mod data;
pub mod error;
pub mod handshake;
pub mod obfuscation;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Default server port
pub const DEFAULT_PORT: u16 = 1194;
