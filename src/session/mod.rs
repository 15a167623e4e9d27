//! Sans-IO OpenVPN client session.
//!
//! The session owns the control channel, the negotiation in flight and the
//! data channels by key id. It performs no I/O: the caller feeds it link
//! packets and timer ticks, and sends whatever it returns.
//!
//! ```text
//!            start ──▶ HARD_RESET_CLIENT_V2
//! HARD_RESET_SERVER_V2 ──▶ TLS handshake (CONTROL_V1)
//!                TLS up ──▶ AUTH ──▶ AUTH reply ──▶ PUSH_REQUEST
//!            PUSH_REPLY ──▶ data channel (key 0), connected
//!
//!   SOFT_RESET_V1 (either side) ──▶ TLS + AUTH on key k+1
//!          AUTH reply ──▶ new data channel; old one retired after the
//!                         transition window
//! ```
//!
//! Every method takes the current `Instant` so that timers are
//! deterministic under test.

mod config;
mod push;
mod tls;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

pub use config::{Configuration, LinkProtocol, TlsWrapConfig};
pub use push::{PushReply, Route, PUSH_REPLY_PREFIX};
pub use tls::{TlsFactory, TlsProtocol};

use crate::control::{ControlChannel, ControlChannelSerializer, TlsWrap};
use crate::crypto::{Cipher, CryptoKeys, Prng};
use crate::data::{CompressionFraming, DataChannel, DataChannelOptions};
use crate::error::{Error, Result};
use crate::handshake::{Authenticator, Credentials, LocalOptions, PeerInfo};
use crate::protocol::{parse_opcode, ControlPacket, PacketCode, NUM_KEY_IDS};

/// Control message asking the server for its push options.
pub const PUSH_REQUEST: &str = "PUSH_REQUEST";

/// Server message rejecting the credentials.
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// Server message asking the client to reconnect.
pub const RESTART: &str = "RESTART";

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Idle,
    /// First negotiation in progress
    Negotiating,
    /// Data channel established
    Connected,
    /// Shut down; the session cannot be restarted
    Stopped,
}

/// Side that asked for a renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// This client
    Client,
    /// The server
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    HardReset,
    SoftReset,
    Tls,
    AuthReply,
    PushReply,
    Done,
}

struct Negotiator {
    key: u8,
    state: NegotiationState,
    tls: Box<dyn TlsProtocol>,
    authenticator: Authenticator,
    keys: Option<CryptoKeys>,
    started_at: Instant,
    requested_by: Option<Requester>,
}

impl Negotiator {
    fn is_in_flight(&self) -> bool {
        self.state != NegotiationState::Done
    }
}

struct KeySlot {
    channel: Arc<DataChannel>,
    retires_at: Option<Instant>,
}

/// OpenVPN client session state machine.
pub struct Session {
    config: Configuration,
    credentials: Option<Credentials>,
    peer_info: PeerInfo,
    tls_factory: TlsFactory,
    tls_wrap: Option<TlsWrap>,
    prng: Arc<dyn Prng>,
    control: ControlChannel,
    state: SessionState,
    negotiator: Option<Negotiator>,
    pending_acks: BTreeMap<u8, Vec<u32>>,
    data_channels: HashMap<u8, KeySlot>,
    current_key: Option<u8>,
    push_reply: Option<PushReply>,
    cipher: Cipher,
    compression: CompressionFraming,
    peer_id: Option<u32>,
    keep_alive_interval: Duration,
    keep_alive_timeout: Duration,
    last_received: Option<Instant>,
    last_sent: Option<Instant>,
    next_renegotiation: Option<Instant>,
}

impl Session {
    /// Create a session.
    ///
    /// # Errors
    ///
    /// Invalid configuration or control channel wrapping.
    pub fn new(
        config: Configuration,
        credentials: Option<Credentials>,
        tls_factory: TlsFactory,
        prng: Arc<dyn Prng>,
    ) -> Result<Self> {
        config.validate()?;
        let tls_wrap = config.tls_wrap();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let serializer = ControlChannelSerializer::new(tls_wrap.as_ref(), timestamp)?;
        let peer_info = PeerInfo::new(config.ui_version.clone()).with_ciphers(config.data_ciphers.clone());

        Ok(Self {
            credentials,
            peer_info,
            tls_factory,
            tls_wrap,
            control: ControlChannel::new(serializer, prng.clone()),
            prng,
            state: SessionState::Idle,
            negotiator: None,
            pending_acks: BTreeMap::new(),
            data_channels: HashMap::new(),
            current_key: None,
            push_reply: None,
            cipher: config.cipher,
            compression: config.compression,
            peer_id: None,
            keep_alive_interval: config.keep_alive_interval(),
            keep_alive_timeout: config.keep_alive_timeout(),
            last_received: None,
            last_sent: None,
            next_renegotiation: None,
            config,
        })
    }

    /// Replace the announced peer info.
    pub fn with_peer_info(mut self, peer_info: PeerInfo) -> Self {
        self.peer_info = peer_info;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether tunnel traffic can flow.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Options pushed by the server.
    pub fn push_reply(&self) -> Option<&PushReply> {
        self.push_reply.as_ref()
    }

    /// Key id used for outbound data.
    pub fn current_key(&self) -> Option<u8> {
        self.current_key
    }

    /// Data channel for `key`, including retired ones still decrypting.
    pub fn data_channel(&self, key: u8) -> Option<Arc<DataChannel>> {
        self.data_channels.get(&key).map(|slot| slot.channel.clone())
    }

    /// Control channel of this session.
    pub fn control_channel(&self) -> &ControlChannel {
        &self.control
    }

    /// Negotiated data cipher.
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Send the client hard reset.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::control("session already started"));
        }
        self.control.reset(true);
        self.negotiator = Some(self.new_negotiator(0, NegotiationState::HardReset, None, now)?);
        self.control.enqueue_outbound(PacketCode::HardResetClientV2, 0, &[]);
        self.state = SessionState::Negotiating;
        info!(remote = %self.config.remote_address(), "session: started");
        Ok(())
    }

    /// Ask the server for a new key.
    ///
    /// # Errors
    ///
    /// `RenegotiationInProgress` while a negotiation is in flight.
    pub fn renegotiate(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(Error::control("cannot renegotiate before connecting"));
        }
        let current = self.current_key.unwrap_or(0);
        let key = next_key(current);
        self.begin_renegotiation(key, Requester::Client, now)?;
        self.control.enqueue_outbound(PacketCode::SoftResetV1, key, &[]);
        Ok(())
    }

    /// Process one packet from the link and return tunnel packets.
    pub fn handle_link_packet(&mut self, packet: &[u8], now: Instant) -> Result<Vec<Bytes>> {
        if self.state == SessionState::Stopped {
            return Err(Error::link("session stopped"));
        }
        let Some(&first) = packet.first() else {
            return Err(Error::control("missing opcode"));
        };
        let (code, key) = parse_opcode(first);
        if code.is_data() {
            return self.handle_data_packet(key, packet, now);
        }
        self.handle_control_packet(packet, now)?;
        Ok(Vec::new())
    }

    /// Encrypt tunnel packets for the link with the current key.
    pub fn encrypt(&mut self, packets: &[Bytes], now: Instant) -> Result<Vec<Bytes>> {
        let channel = self
            .current_key
            .and_then(|key| self.data_channel(key))
            .ok_or_else(|| Error::control("data channel not established"))?;
        let encrypted = channel.encrypt(packets)?;
        let sent: usize = packets.iter().map(Bytes::len).sum();
        self.control.add_data_count(0, sent as u64);
        self.last_sent = Some(now);
        Ok(encrypted)
    }

    /// Link packets due now: control packets (new and retransmitted), acks
    /// and keep-alive pings.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        if self.state == SessionState::Stopped {
            return Ok(Vec::new());
        }
        let mut out = self.control.write_outbound(self.config.resend_after(), now)?;

        if let Some(remote) = self.control.remote_session_id() {
            for (key, ids) in std::mem::take(&mut self.pending_acks) {
                out.extend(self.control.write_acks(key, &ids, remote)?);
            }
        }

        if self.keep_alive_due(now) {
            if let Some(channel) = self.current_key.and_then(|key| self.data_channel(key)) {
                trace!(key = channel.key(), "session: keep-alive");
                out.push(channel.keep_alive()?);
                self.last_sent = Some(now);
            }
        }
        Ok(out)
    }

    /// Run timers.
    ///
    /// # Errors
    ///
    /// `NegotiationTimeout` or `Timeout` when the peer is unresponsive.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        if let Some(negotiator) = self.negotiator.as_ref().filter(|n| n.is_in_flight()) {
            let timeout = self.config.negotiation_timeout();
            if now.saturating_duration_since(negotiator.started_at) >= timeout {
                warn!(key = negotiator.key, "session: negotiation timed out");
                return Err(Error::NegotiationTimeout(timeout.as_millis() as u64));
            }
        }

        if self.state == SessionState::Connected {
            if let Some(last) = self.last_received {
                if now.saturating_duration_since(last) >= self.keep_alive_timeout {
                    warn!("session: peer silent, giving up");
                    return Err(Error::Timeout(self.keep_alive_timeout.as_millis() as u64));
                }
            }
        }

        self.data_channels.retain(|key, slot| match slot.retires_at {
            Some(at) if at <= now => {
                debug!(key, "session: retired data channel dropped");
                false
            }
            _ => true,
        });

        let renegotiation_due = self.next_renegotiation.map_or(false, |at| at <= now);
        let idle = self.negotiator.as_ref().map_or(true, |n| !n.is_in_flight());
        if self.state == SessionState::Connected && renegotiation_due && idle {
            info!("session: periodic renegotiation");
            self.renegotiate(now)?;
        }
        Ok(())
    }

    /// Earliest instant at which `poll_transmit` or `handle_timeout` has
    /// work to do.
    pub fn next_timeout(&self, now: Instant) -> Option<Instant> {
        if self.state == SessionState::Stopped {
            return None;
        }
        let mut deadlines = Vec::new();
        if !self.pending_acks.is_empty() {
            deadlines.push(now);
        }
        if self.control.has_pending_outbound() {
            deadlines.push(now + self.config.resend_after());
        }
        if let Some(negotiator) = self.negotiator.as_ref().filter(|n| n.is_in_flight()) {
            deadlines.push(negotiator.started_at + self.config.negotiation_timeout());
        }
        if self.state == SessionState::Connected {
            if let Some(last) = self.last_sent.filter(|_| !self.keep_alive_interval.is_zero()) {
                deadlines.push(last + self.keep_alive_interval);
            }
            if let Some(last) = self.last_received {
                deadlines.push(last + self.keep_alive_timeout);
            }
            deadlines.extend(self.next_renegotiation);
        }
        deadlines.extend(self.data_channels.values().filter_map(|slot| slot.retires_at));
        deadlines.into_iter().min()
    }

    /// Stop the session and drop all key material.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.negotiator = None;
        self.data_channels.clear();
        self.current_key = None;
        self.pending_acks.clear();
        self.next_renegotiation = None;
        self.state = SessionState::Stopped;
        let (received, sent) = self.control.data_count();
        info!(received, sent, "session: stopped");
    }

    fn handle_data_packet(&mut self, key: u8, packet: &[u8], now: Instant) -> Result<Vec<Bytes>> {
        let channel = self.data_channel(key).ok_or(Error::BadKey(key))?;
        let (packets, keep_alive) = match channel.decrypt(&[Bytes::copy_from_slice(packet)]) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(key, error = %e, "session: data channel key invalidated");
                self.data_channels.remove(&key);
                if self.current_key == Some(key) {
                    self.current_key = None;
                }
                return Err(e);
            }
        };
        if keep_alive || !packets.is_empty() {
            self.last_received = Some(now);
        }
        let received: usize = packets.iter().map(Bytes::len).sum();
        self.control.add_data_count(received as u64, 0);
        Ok(packets)
    }

    fn handle_control_packet(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        let packet = self.control.read_inbound(raw)?;
        self.last_received = Some(now);
        if packet.is_ack() {
            return Ok(());
        }

        match self.control.remote_session_id() {
            Some(remote) if remote != packet.session_id => {
                warn!(expected = %remote, received = %packet.session_id, "session: packet from another session");
                return Err(Error::SessionMismatch);
            }
            Some(_) => {}
            None if packet.code == PacketCode::HardResetServerV2 => {
                debug!(remote = %packet.session_id, "session: server session id");
                self.control.set_remote_session_id(packet.session_id);
            }
            None => return Err(Error::control(format!("{} before server hard reset", packet.code))),
        }

        if packet.code == PacketCode::SoftResetV1 && self.negotiator.as_ref().map(|n| n.key) != Some(packet.key) {
            self.begin_renegotiation(packet.key, Requester::Server, now)?;
            self.control.enqueue_outbound(PacketCode::SoftResetV1, packet.key, &[]);
        }

        self.pending_acks.entry(packet.key).or_default().push(packet.packet_id);
        let active = self.negotiator.as_ref().map(|n| n.key);
        if active != Some(packet.key) {
            // ids of a retired key would collide with the new key's sequence
            debug!(key = packet.key, ?active, "session: acked packet for inactive key");
            return Ok(());
        }
        for ready in self.control.enqueue_inbound(packet) {
            self.process_control_packet(ready, now)?;
        }
        Ok(())
    }

    fn process_control_packet(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        let Some(mut negotiator) = self.negotiator.take() else {
            return Err(Error::BadKey(packet.key));
        };
        let result = self.advance(&mut negotiator, packet, now);
        self.negotiator = Some(negotiator);
        result
    }

    fn advance(&mut self, negotiator: &mut Negotiator, packet: ControlPacket, now: Instant) -> Result<()> {
        if packet.key != negotiator.key {
            return Err(Error::BadKey(packet.key));
        }
        match (packet.code, negotiator.state) {
            (PacketCode::HardResetServerV2, NegotiationState::HardReset)
            | (PacketCode::SoftResetV1, NegotiationState::SoftReset) => {
                debug!(key = negotiator.key, "session: starting TLS");
                negotiator.tls.start()?;
                negotiator.state = NegotiationState::Tls;
            }
            (PacketCode::ControlV1, _) => {
                if let Some(payload) = &packet.payload {
                    negotiator.tls.put_cipher_text(payload)?;
                }
            }
            (code, state) => debug!(%code, ?state, "session: ignoring control packet"),
        }
        self.negotiate(negotiator, now)
    }

    fn negotiate(&mut self, negotiator: &mut Negotiator, now: Instant) -> Result<()> {
        if negotiator.state == NegotiationState::Tls && negotiator.tls.is_connected() {
            let options = LocalOptions {
                cipher: self.config.cipher,
                digest: self.config.digest,
                compression: self.config.compression,
                tls_wrap: self.tls_wrap.as_ref(),
            };
            let request = negotiator.authenticator.request(&options, &self.peer_info.render())?;
            negotiator.tls.put_raw_plain_text(&request)?;
            negotiator.state = NegotiationState::AuthReply;
            debug!(key = negotiator.key, "session: AUTH sent");
        }

        if negotiator.state != NegotiationState::Tls {
            let plain = negotiator.tls.pull_plain_text()?;
            if !plain.is_empty() {
                negotiator.authenticator.append_control_data(&plain);
            }
        }

        if negotiator.state == NegotiationState::AuthReply && negotiator.authenticator.parse_auth_reply()? {
            let (Some(session_id), Some(remote)) = (self.control.session_id(), self.control.remote_session_id())
            else {
                return Err(Error::MissingSessionId);
            };
            let keys = negotiator.authenticator.derive_keys(&session_id, &remote)?;
            debug!(
                key = negotiator.key,
                cipher_key = %keys.cipher.encryption_key.loggable(self.config.log_sensitive_data),
                "session: keys derived"
            );
            if negotiator.requested_by.is_none() {
                negotiator.keys = Some(keys);
                negotiator.tls.put_plain_text(PUSH_REQUEST)?;
                negotiator.state = NegotiationState::PushReply;
            } else {
                self.install_data_channel(negotiator.key, &keys, now)?;
                negotiator.authenticator.reset();
                negotiator.state = NegotiationState::Done;
                info!(key = negotiator.key, requested_by = ?negotiator.requested_by, "session: renegotiated");
            }
        }

        if matches!(negotiator.state, NegotiationState::PushReply | NegotiationState::Done) {
            for message in negotiator.authenticator.parse_messages() {
                self.handle_message(negotiator, &message, now)?;
            }
        }

        let cipher_text = negotiator.tls.pull_cipher_text()?;
        if !cipher_text.is_empty() {
            self.control.enqueue_outbound(PacketCode::ControlV1, negotiator.key, &cipher_text);
        }
        Ok(())
    }

    fn handle_message(&mut self, negotiator: &mut Negotiator, message: &str, now: Instant) -> Result<()> {
        if PushReply::matches(message) {
            if negotiator.state != NegotiationState::PushReply {
                debug!("session: ignoring unsolicited push reply");
                return Ok(());
            }
            let reply = PushReply::parse(message)?;
            debug!(options = ?reply.options, "session: push reply");
            self.apply_push_reply(&reply);
            let keys = negotiator
                .keys
                .take()
                .ok_or_else(|| Error::control("push reply before key derivation"))?;
            self.install_data_channel(negotiator.key, &keys, now)?;
            negotiator.authenticator.reset();
            negotiator.state = NegotiationState::Done;
            self.push_reply = Some(reply);
            self.state = SessionState::Connected;
            self.last_sent = Some(now);
            self.next_renegotiation = self.config.renegotiates_after().map(|period| now + period);
            info!(cipher = %self.cipher, peer_id = ?self.peer_id, "session: connected");
            Ok(())
        } else if message.starts_with(AUTH_FAILED) {
            warn!(%message, "session: authentication failed");
            if negotiator.authenticator.sends_local_options() {
                Err(Error::BadCredentialsWithLocalOptions)
            } else {
                Err(Error::BadCredentials)
            }
        } else if message.starts_with(RESTART) {
            info!(%message, "session: server restart");
            Err(Error::ServerShutdown)
        } else {
            debug!(%message, "session: unhandled control message");
            Ok(())
        }
    }

    fn apply_push_reply(&mut self, reply: &PushReply) {
        if let Some(cipher) = reply.cipher {
            self.cipher = cipher;
        }
        if let Some(compression) = reply.compression {
            self.compression = compression;
        }
        self.peer_id = reply.peer_id;
        if let Some(ping) = reply.ping {
            self.keep_alive_interval = Duration::from_secs(ping);
        }
        if let Some(restart) = reply.ping_restart {
            self.keep_alive_timeout = Duration::from_secs(restart);
        }
    }

    fn install_data_channel(&mut self, key: u8, keys: &CryptoKeys, now: Instant) -> Result<()> {
        let options = DataChannelOptions {
            peer_id: self.peer_id,
            compression: self.compression,
            ..DataChannelOptions::default()
        };
        let channel = DataChannel::new(key, self.cipher, self.config.digest, keys, options, self.prng.clone())?;
        if let Some(old) = self.current_key.replace(key).filter(|old| *old != key) {
            if let Some(slot) = self.data_channels.get_mut(&old) {
                slot.retires_at = Some(now + self.config.transition_window());
            }
        }
        self.data_channels.insert(
            key,
            KeySlot {
                channel: Arc::new(channel),
                retires_at: None,
            },
        );
        Ok(())
    }

    fn begin_renegotiation(&mut self, key: u8, requester: Requester, now: Instant) -> Result<()> {
        if self.negotiator.as_ref().map_or(false, Negotiator::is_in_flight) {
            return Err(Error::RenegotiationInProgress);
        }
        info!(key, ?requester, "session: soft reset");
        self.control.reset(false);
        self.pending_acks.clear();
        self.next_renegotiation = self.config.renegotiates_after().map(|period| now + period);
        self.negotiator = Some(self.new_negotiator(key, NegotiationState::SoftReset, Some(requester), now)?);
        Ok(())
    }

    fn new_negotiator(
        &mut self,
        key: u8,
        state: NegotiationState,
        requested_by: Option<Requester>,
        now: Instant,
    ) -> Result<Negotiator> {
        let tls = (self.tls_factory)()?;
        let authenticator = Authenticator::new(self.prng.as_ref(), self.credentials.clone())
            .with_local_options(self.config.uses_local_options);
        Ok(Negotiator {
            key,
            state,
            tls,
            authenticator,
            keys: None,
            started_at: now,
            requested_by,
        })
    }

    fn keep_alive_due(&self, now: Instant) -> bool {
        if self.state != SessionState::Connected || self.keep_alive_interval.is_zero() {
            return false;
        }
        self.last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.keep_alive_interval)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("current_key", &self.current_key)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

/// Key id following `key`; 0 is reserved for the first negotiation.
fn next_key(key: u8) -> u8 {
    ((key + 1) % NUM_KEY_IDS).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::prf::{self, KeyMaterial};
    use crate::crypto::SeededRandom;
    use crate::handshake::CONTROL_DATA_PREFIX;
    use crate::protocol::{opcode, SessionId};

    /// TLS stand-in that is connected once started and passes data through.
    #[derive(Default)]
    struct PassthroughTls {
        started: bool,
        outgoing: Vec<u8>,
        incoming: Vec<u8>,
    }

    impl TlsProtocol for PassthroughTls {
        fn start(&mut self) -> Result<()> {
            self.started = true;
            Ok(())
        }

        fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
            self.incoming.extend_from_slice(data);
            Ok(())
        }

        fn pull_cipher_text(&mut self) -> Result<Vec<u8>> {
            Ok(std::mem::take(&mut self.outgoing))
        }

        fn put_raw_plain_text(&mut self, data: &[u8]) -> Result<()> {
            self.outgoing.extend_from_slice(data);
            Ok(())
        }

        fn pull_plain_text(&mut self) -> Result<Vec<u8>> {
            Ok(std::mem::take(&mut self.incoming))
        }

        fn is_connected(&self) -> bool {
            self.started
        }
    }

    const SERVER_SID: SessionId = SessionId::new([0x5e; 8]);

    /// Server side of a negotiation, built from raw packets.
    struct FakeServer {
        client_sid: SessionId,
        next_packet_id: u32,
        auth: Option<Vec<u8>>,
    }

    impl FakeServer {
        fn packet(&mut self, code: PacketCode, key: u8, payload: &[u8], acks: Vec<u32>) -> Bytes {
            let payload = (!payload.is_empty()).then(|| Bytes::copy_from_slice(payload));
            let packet = ControlPacket::new(code, key, SERVER_SID, self.next_packet_id, payload);
            self.next_packet_id += 1;
            let packet = if acks.is_empty() {
                packet
            } else {
                packet.with_ack(acks, self.client_sid)
            };
            packet.serialize()
        }

        fn auth_reply(&self) -> Vec<u8> {
            let mut out = CONTROL_DATA_PREFIX.to_vec();
            out.extend_from_slice(&[0x71; 32]);
            out.extend_from_slice(&[0x72; 32]);
            let options = b"V4,dev-type tun,cipher AES-256-GCM\0";
            out.extend_from_slice(&(options.len() as u16).to_be_bytes());
            out.extend_from_slice(options);
            out
        }

        fn keys(&self) -> CryptoKeys {
            let auth = self.auth.as_ref().unwrap();
            prf::derive_keys(&KeyMaterial {
                pre_master: &auth[5..53],
                random1: &auth[53..85],
                random2: &auth[85..117],
                server_random1: &[0x71; 32],
                server_random2: &[0x72; 32],
                session_id: &self.client_sid,
                remote_session_id: &SERVER_SID,
            })
            .unwrap()
            .mirrored()
        }
    }

    fn config() -> Configuration {
        let mut config = Configuration::new("vpn.example.com");
        config.keep_alive_timeout_secs = 120;
        config.renegotiates_after_secs = 0;
        config
    }

    fn session(config: Configuration) -> Session {
        let factory: TlsFactory = Box::new(|| Ok(Box::new(PassthroughTls::default()) as Box<dyn TlsProtocol>));
        Session::new(
            config,
            Some(Credentials::new("user", "pass")),
            factory,
            Arc::new(SeededRandom::new(21)),
        )
        .unwrap()
    }

    fn control_packets(raw: &[Bytes]) -> Vec<ControlPacket> {
        raw.iter().map(|r| ControlPacket::deserialize(r).unwrap()).collect()
    }

    fn payload_of(packets: &[ControlPacket], code: PacketCode) -> Vec<u8> {
        packets
            .iter()
            .find(|p| p.code == code && p.payload.is_some())
            .and_then(|p| p.payload.clone())
            .map(|p| p.to_vec())
            .unwrap_or_default()
    }

    /// Drives a session up to the AUTH reply.
    fn authenticated(now: Instant) -> (Session, FakeServer) {
        let mut session = session(config());
        session.start(now).unwrap();
        let hello = control_packets(&session.poll_transmit(now).unwrap());
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].code, PacketCode::HardResetClientV2);

        let mut server = FakeServer {
            client_sid: hello[0].session_id,
            next_packet_id: 0,
            auth: None,
        };
        let reset = server.packet(PacketCode::HardResetServerV2, 0, &[], vec![0]);
        assert!(session.handle_link_packet(&reset, now).unwrap().is_empty());

        let sent = control_packets(&session.poll_transmit(now).unwrap());
        let auth = payload_of(&sent, PacketCode::ControlV1);
        assert_eq!(&auth[..5], &CONTROL_DATA_PREFIX);
        assert!(sent.iter().any(|p| p.is_ack() && p.ack.as_ref().unwrap().ids == vec![0]));
        server.auth = Some(auth);

        let reply = server.auth_reply();
        let packet = server.packet(PacketCode::ControlV1, 0, &reply, vec![1]);
        session.handle_link_packet(&packet, now).unwrap();
        (session, server)
    }

    fn connected(now: Instant) -> (Session, FakeServer) {
        let (mut session, mut server) = authenticated(now);
        let sent = control_packets(&session.poll_transmit(now).unwrap());
        assert_eq!(payload_of(&sent, PacketCode::ControlV1), b"PUSH_REQUEST\0".to_vec());

        let push = b"PUSH_REPLY,ping 10,ping-restart 120,peer-id 5,cipher AES-256-GCM\0";
        let packet = server.packet(PacketCode::ControlV1, 0, push, vec![2]);
        session.handle_link_packet(&packet, now).unwrap();
        (session, server)
    }

    #[test]
    fn test_negotiation_to_data_channel() {
        let now = Instant::now();
        let (mut session, server) = connected(now);
        assert!(session.is_connected());
        assert_eq!(session.current_key(), Some(0));
        assert_eq!(session.push_reply().unwrap().peer_id, Some(5));

        let options = DataChannelOptions {
            peer_id: Some(5),
            ..Default::default()
        };
        let remote = DataChannel::new(
            0,
            Cipher::Aes256Gcm,
            session.config.digest,
            &server.keys(),
            options,
            Arc::new(SeededRandom::new(3)),
        )
        .unwrap();

        let ip = Bytes::from_static(&[0x45, 0, 0, 20, 9, 9, 9, 9]);
        let wire = session.encrypt(&[ip.clone()], now).unwrap();
        assert_eq!(wire[0][0], opcode(PacketCode::DataV2, 0));
        assert_eq!(remote.decrypt(&wire).unwrap().0, vec![ip.clone()]);

        let inbound = remote.encrypt_packet(&ip).unwrap();
        assert_eq!(session.handle_link_packet(&inbound, now).unwrap(), vec![ip]);

        let ping = remote.keep_alive().unwrap();
        assert!(session.handle_link_packet(&ping, now).unwrap().is_empty());
    }

    #[test]
    fn test_forged_data_packet_invalidates_key() {
        let now = Instant::now();
        let (mut session, _server) = connected(now);

        let mut forged = vec![opcode(PacketCode::DataV2, 0), 0, 0, 5];
        forged.extend_from_slice(&1u32.to_be_bytes());
        forged.extend_from_slice(&[0xaa; 16]);
        forged.extend_from_slice(b"not a real payload");
        match session.handle_link_packet(&forged, now) {
            Err(Error::DataPath(e)) => assert!(e.is_fatal()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.data_channel(0).is_none());
        assert_eq!(session.current_key(), None);
        assert!(session.encrypt(&[Bytes::from_static(b"x")], now).is_err());
    }

    #[test]
    fn test_auth_failed_with_local_options() {
        let now = Instant::now();
        let (mut session, mut server) = authenticated(now);
        session.poll_transmit(now).unwrap();
        let packet = server.packet(PacketCode::ControlV1, 0, b"AUTH_FAILED\0", vec![]);
        let err = session.handle_link_packet(&packet, now).unwrap_err();
        assert!(matches!(err, Error::BadCredentialsWithLocalOptions));
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_restart_is_server_shutdown() {
        let now = Instant::now();
        let (mut session, mut server) = authenticated(now);
        let packet = server.packet(PacketCode::ControlV1, 0, b"RESTART\0", vec![]);
        let err = session.handle_link_packet(&packet, now).unwrap_err();
        assert!(matches!(err, Error::ServerShutdown));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_packet_from_other_session_rejected() {
        let now = Instant::now();
        let (mut session, server) = authenticated(now);
        let packet = ControlPacket::new(PacketCode::ControlV1, 0, SessionId::new([1; 8]), 2, None).serialize();
        assert!(matches!(
            session.handle_link_packet(&packet, now),
            Err(Error::SessionMismatch)
        ));
        drop(server);
    }

    #[test]
    fn test_negotiation_timeout() {
        let now = Instant::now();
        let mut session = session(config());
        session.start(now).unwrap();
        session.handle_timeout(now + Duration::from_secs(29)).unwrap();
        assert!(matches!(
            session.handle_timeout(now + Duration::from_secs(30)),
            Err(Error::NegotiationTimeout(30_000))
        ));
    }

    #[test]
    fn test_keep_alive_and_peer_timeout() {
        let now = Instant::now();
        let (mut session, _server) = connected(now);

        assert!(session.poll_transmit(now + Duration::from_secs(5)).unwrap().iter().all(|p| {
            let (code, _) = parse_opcode(p[0]);
            !code.is_data()
        }));
        let later = now + Duration::from_secs(10);
        let sent = session.poll_transmit(later).unwrap();
        assert!(sent.iter().any(|p| p[0] == opcode(PacketCode::DataV2, 0)));
        assert_eq!(session.next_timeout(later), Some(later + Duration::from_secs(10)));

        session.handle_timeout(now + Duration::from_secs(119)).unwrap();
        assert!(matches!(
            session.handle_timeout(now + Duration::from_secs(120)),
            Err(Error::Timeout(120_000))
        ));
    }

    #[test]
    fn test_renegotiation_rotates_key() {
        let now = Instant::now();
        let (mut session, mut server) = connected(now);
        let old_keys = server.keys();
        session.poll_transmit(now).unwrap();

        session.renegotiate(now).unwrap();
        assert!(matches!(session.renegotiate(now), Err(Error::RenegotiationInProgress)));

        let sent = control_packets(&session.poll_transmit(now).unwrap());
        let soft = sent.iter().find(|p| p.code == PacketCode::SoftResetV1).unwrap();
        assert_eq!((soft.key, soft.packet_id), (1, 0));

        server.next_packet_id = 0;
        let reply = server.packet(PacketCode::SoftResetV1, 1, &[], vec![0]);
        session.handle_link_packet(&reply, now).unwrap();
        let sent = control_packets(&session.poll_transmit(now).unwrap());
        let auth = payload_of(&sent, PacketCode::ControlV1);
        assert_eq!(&auth[..5], &CONTROL_DATA_PREFIX);
        server.auth = Some(auth);

        let packet = server.packet(PacketCode::ControlV1, 1, &server.auth_reply(), vec![1]);
        session.handle_link_packet(&packet, now).unwrap();
        assert_eq!(session.current_key(), Some(1));

        // old key still decrypts during the transition window
        let old = DataChannel::new(
            0,
            Cipher::Aes256Gcm,
            session.config.digest,
            &old_keys,
            DataChannelOptions {
                peer_id: Some(5),
                ..Default::default()
            },
            Arc::new(SeededRandom::new(4)),
        )
        .unwrap();
        let late = old.encrypt_packet(&[1, 2, 3]).unwrap();
        assert_eq!(session.handle_link_packet(&late, now).unwrap(), vec![Bytes::from_static(&[1, 2, 3])]);

        session.handle_timeout(now + Duration::from_secs(60)).unwrap();
        assert!(session.data_channel(0).is_none());
        assert!(session.data_channel(1).is_some());
    }

    #[test]
    fn test_stale_key_packet_during_renegotiation() {
        let now = Instant::now();
        let (mut session, mut server) = connected(now);
        session.poll_transmit(now).unwrap();
        session.renegotiate(now).unwrap();
        session.poll_transmit(now).unwrap();

        server.next_packet_id = 0;
        let reply = server.packet(PacketCode::SoftResetV1, 1, &[], vec![0]);
        session.handle_link_packet(&reply, now).unwrap();
        let sent = control_packets(&session.poll_transmit(now).unwrap());
        server.auth = Some(payload_of(&sent, PacketCode::ControlV1));

        // late retransmission on the old key, same id as the next key 1 packet
        let stale = ControlPacket::new(PacketCode::ControlV1, 0, SERVER_SID, 1, Some(Bytes::from_static(b"late")))
            .serialize();
        assert!(session.handle_link_packet(&stale, now).unwrap().is_empty());
        let sent = control_packets(&session.poll_transmit(now).unwrap());
        assert!(sent
            .iter()
            .any(|p| p.is_ack() && p.key == 0 && p.ack.as_ref().unwrap().ids == vec![1]));
        assert_eq!(session.control_channel().next_expected(), 1);

        let packet = server.packet(PacketCode::ControlV1, 1, &server.auth_reply(), vec![1]);
        session.handle_link_packet(&packet, now).unwrap();
        assert_eq!(session.current_key(), Some(1));
    }

    #[test]
    fn test_server_requested_renegotiation() {
        let now = Instant::now();
        let (mut session, mut server) = connected(now);
        session.poll_transmit(now).unwrap();

        server.next_packet_id = 0;
        let soft = server.packet(PacketCode::SoftResetV1, 1, &[], vec![]);
        session.handle_link_packet(&soft, now).unwrap();

        let sent = control_packets(&session.poll_transmit(now).unwrap());
        let reset = sent.iter().find(|p| p.code == PacketCode::SoftResetV1).unwrap();
        assert_eq!((reset.key, reset.packet_id), (1, 0));
        assert_eq!(&payload_of(&sent, PacketCode::ControlV1)[..5], &CONTROL_DATA_PREFIX);
        assert!(sent.iter().any(|p| p.is_ack() && p.key == 1));
        assert!(matches!(session.renegotiate(now), Err(Error::RenegotiationInProgress)));
    }

    #[test]
    fn test_next_key_skips_zero() {
        assert_eq!(next_key(0), 1);
        assert_eq!(next_key(6), 7);
        assert_eq!(next_key(7), 1);
    }

    #[test]
    fn test_shutdown_drops_keys() {
        let now = Instant::now();
        let (mut session, _server) = connected(now);
        session.shutdown();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.data_channel(0).is_none());
        assert!(session.encrypt(&[Bytes::from_static(b"x")], now).is_err());
        assert!(session.handle_link_packet(&[0x30], now).is_err());
        assert_eq!(session.next_timeout(now), None);
    }
}
