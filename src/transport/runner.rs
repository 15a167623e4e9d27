use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LinkInterface, TunnelInterface};
use crate::error::{Error, Result};
use crate::session::Session;

/// Sleep used when the session has no pending deadline.
const IDLE_TICK: Duration = Duration::from_secs(3600);

enum Event {
    Shutdown,
    Link(Vec<Bytes>),
    Tunnel(Vec<Bytes>),
    Timer,
}

/// Drives a [`Session`] over a link and a tunnel on the tokio runtime.
pub struct Runner<L, T> {
    session: Session,
    link: L,
    tunnel: T,
}

impl<L: LinkInterface, T: TunnelInterface> Runner<L, T> {
    /// Bundle a session with its I/O.
    pub fn new(session: Session, link: L, tunnel: T) -> Self {
        Self { session, link, tunnel }
    }

    /// The driven session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Split back into parts.
    pub fn into_parts(self) -> (Session, L, T) {
        (self.session, self.link, self.tunnel)
    }

    /// Start the session and pump packets until `shutdown` resolves or the
    /// session fails.
    ///
    /// Malformed or unauthenticated packets are dropped; timeouts,
    /// authentication failures and link errors end the run.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        self.session.start(Instant::now().into_std())?;

        loop {
            let now = Instant::now().into_std();
            self.flush(now).await?;

            let deadline = self.session.next_timeout(now).unwrap_or(now + IDLE_TICK);
            let connected = self.session.is_connected();
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => Event::Shutdown,
                packets = self.link.read_packets() => Event::Link(packets?),
                packets = self.tunnel.read_packets(), if connected => Event::Tunnel(packets?),
                _ = tokio::time::sleep_until(Instant::from_std(deadline)) => Event::Timer,
            };

            let now = Instant::now().into_std();
            match event {
                Event::Shutdown => {
                    info!("runner: shutdown requested");
                    self.session.shutdown();
                    return self.link.shutdown().await;
                }
                Event::Link(packets) => {
                    let mut tunnel_packets = Vec::new();
                    for packet in packets {
                        match self.session.handle_link_packet(&packet, now) {
                            Ok(mut decrypted) => tunnel_packets.append(&mut decrypted),
                            Err(e) if drops_packet(&e) => debug!(error = %e, "runner: packet dropped"),
                            Err(e) => return self.fail(e).await,
                        }
                    }
                    if !tunnel_packets.is_empty() {
                        self.tunnel.write_packets(&tunnel_packets).await?;
                    }
                }
                Event::Tunnel(packets) => match self.session.encrypt(&packets, now) {
                    Ok(wire) => self.link.write_packets(&wire).await?,
                    Err(e) => return self.fail(e).await,
                },
                Event::Timer => {
                    if let Err(e) = self.session.handle_timeout(now) {
                        return self.fail(e).await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self, now: std::time::Instant) -> Result<()> {
        let packets = self.session.poll_transmit(now)?;
        if !packets.is_empty() {
            self.link.write_packets(&packets).await?;
        }
        Ok(())
    }

    async fn fail(&mut self, error: Error) -> Result<()> {
        warn!(error = %error, recoverable = error.is_recoverable(), "runner: session failed");
        self.session.shutdown();
        if let Err(e) = self.link.shutdown().await {
            debug!(error = %e, "runner: link shutdown failed");
        }
        Err(error)
    }
}

/// Errors scoped to a single inbound packet. Authentication failures on
/// either channel end the session.
fn drops_packet(error: &Error) -> bool {
    match error {
        Error::ControlChannel(_) | Error::BadKey(_) | Error::SessionMismatch | Error::Buffer { .. } => true,
        Error::DataPath(e) => !e.is_fatal(),
        _ => false,
    }
}
