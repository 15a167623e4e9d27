//! Async I/O around the sans-IO session.
//!
//! ```text
//!   TunnelInterface ──IP──▶ Session::encrypt ──▶ LinkInterface (UDP / TCP)
//!   TunnelInterface ◀──IP── Session::handle_link_packet ◀── LinkInterface
//!                             ▲
//!                 Runner: tokio::select! over link, tunnel, timers
//! ```
//!
//! Links apply the configured [`PacketProcessor`](crate::obfuscation::PacketProcessor)
//! so the session only ever sees clear OpenVPN packets.

mod link;
mod runner;

pub use link::{Link, LinkInterface, TcpLink, TunnelInterface, UdpLink, MAX_DATAGRAM_SIZE};
pub use runner::Runner;
