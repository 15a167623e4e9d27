//! Key method 2 handshake carried inside the TLS tunnel.
//!
//! ```text
//! Client                                   Server
//!   │ ── AUTH (pre-master, randoms, opts) ──► │
//!   │ ◄── AUTH reply (randoms, opts) ──────── │
//!   │ ── PUSH_REQUEST ──────────────────────► │
//!   │ ◄── PUSH_REPLY,... ──────────────────── │
//! ```
//!
//! Both sides then run the PRF over the exchanged randoms and session ids
//! to obtain the data channel keys.

mod authenticator;
mod peer_info;

pub use authenticator::{Authenticator, Credentials, LocalOptions, CONTROL_DATA_PREFIX, UNDEFINED_OPTIONS};
pub use peer_info::PeerInfo;
