//! Control packet wrapping: plain, `tls-auth` and `tls-crypt`.
//!
//! `tls-auth` layout:
//! ```text
//! ┌────────┬────────────┬──────────┬───────────────┬───────────────┬──────┐
//! │ opcode │ session id │ HMAC (n) │ replay id (4) │ timestamp (4) │ body │
//! └────────┴────────────┴──────────┴───────────────┴───────────────┴──────┘
//! ```
//! The HMAC covers `replay id || timestamp || opcode || session id || body`.
//!
//! `tls-crypt` layout:
//! ```text
//! ┌────────┬────────────┬───────────────┬───────────────┬──────────┬──────────────────┐
//! │ opcode │ session id │ replay id (4) │ timestamp (4) │ tag (32) │ encrypted body   │
//! └────────┴────────────┴───────────────┴───────────────┴──────────┴──────────────────┘
//! ```
//! The first 17 bytes are authenticated in clear.

use bytes::{BufMut, Bytes, BytesMut};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::crypto::{CtrHmac, Digest, SecureBytes, StaticKey, TLS_CRYPT_TAG_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{parse_opcode, ControlPacket, PacketCode, ReplayWindow, SessionId, SESSION_ID_LENGTH};

/// Opcode plus session id.
const PREFIX_LENGTH: usize = 1 + SESSION_ID_LENGTH;

/// Replay id plus timestamp.
const REPLAY_LENGTH: usize = 8;

/// Additional data authenticated by `tls-crypt`.
const CRYPT_AD_LENGTH: usize = PREFIX_LENGTH + REPLAY_LENGTH;

/// Control channel protection negotiated out of band.
#[derive(Debug, Clone)]
pub enum TlsWrap {
    /// `tls-auth`: HMAC with the given digest
    Auth {
        /// HMAC digest
        digest: Digest,
        /// Shared static key
        key: StaticKey,
    },
    /// `tls-crypt`: AES-256-CTR + HMAC-SHA256
    Crypt {
        /// Shared static key
        key: StaticKey,
    },
}

impl TlsWrap {
    /// Option name announced in the AUTH options string.
    pub fn option_name(&self) -> &'static str {
        match self {
            TlsWrap::Auth { .. } => "tls-auth",
            TlsWrap::Crypt { .. } => "tls-crypt",
        }
    }

    /// Shared static key.
    pub fn key(&self) -> &StaticKey {
        match self {
            TlsWrap::Auth { key, .. } | TlsWrap::Crypt { key } => key,
        }
    }
}

/// Control channel serializer, selected once per channel.
#[derive(Debug)]
pub enum ControlChannelSerializer {
    /// Bare wire codec
    Plain,
    /// `tls-auth`
    Auth(AuthSerializer),
    /// `tls-crypt`
    Crypt(CryptSerializer),
}

impl ControlChannelSerializer {
    /// Select the serializer for `wrap`. `timestamp` is the connection start
    /// time in unix seconds, written into every wrapped packet.
    pub fn new(wrap: Option<&TlsWrap>, timestamp: u32) -> Result<Self> {
        Ok(match wrap {
            None => Self::Plain,
            Some(TlsWrap::Auth { digest, key }) => Self::Auth(AuthSerializer::new(*digest, key, timestamp)?),
            Some(TlsWrap::Crypt { key }) => Self::Crypt(CryptSerializer::new(key, timestamp)?),
        })
    }

    /// Wrap a packet for the wire.
    pub fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        match self {
            Self::Plain => Ok(packet.serialize()),
            Self::Auth(s) => s.serialize(packet),
            Self::Crypt(s) => s.serialize(packet),
        }
    }

    /// Unwrap a packet from the wire.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        match self {
            Self::Plain => ControlPacket::deserialize(data),
            Self::Auth(s) => s.deserialize(data),
            Self::Crypt(s) => s.deserialize(data),
        }
    }

    /// Restart replay ids in both directions.
    pub fn reset(&mut self) {
        match self {
            Self::Plain => {}
            Self::Auth(s) => s.reset(),
            Self::Crypt(s) => s.reset(),
        }
    }
}

/// Outbound replay id counter plus inbound replay filter.
#[derive(Debug, Clone)]
struct ReplayState {
    next_outbound: u32,
    inbound: ReplayWindow,
    timestamp: u32,
}

impl ReplayState {
    fn new(timestamp: u32) -> Self {
        Self {
            next_outbound: 1,
            inbound: ReplayWindow::new(),
            timestamp,
        }
    }

    fn next(&mut self) -> [u8; REPLAY_LENGTH] {
        let id = self.next_outbound;
        self.next_outbound = self.next_outbound.wrapping_add(1);
        let mut out = [0u8; REPLAY_LENGTH];
        out[..4].copy_from_slice(&id.to_be_bytes());
        out[4..].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Accept an authenticated inbound replay id.
    fn accept(&mut self, replay: &[u8]) -> Result<()> {
        let id = u32::from_be_bytes([replay[0], replay[1], replay[2], replay[3]]);
        if !self.inbound.check_and_update(id) {
            warn!(replay_id = id, "dropping replayed control packet");
            return Err(Error::control(format!("replayed packet id {}", id)));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.next_outbound = 1;
        self.inbound.reset();
    }
}

/// Reads opcode and session id, rejecting unknown codes.
fn read_prefix(data: &[u8]) -> Result<(PacketCode, u8, SessionId)> {
    let first = *data.first().ok_or_else(|| Error::control("missing opcode"))?;
    let (code, key) = parse_opcode(first);
    if code == PacketCode::Unknown {
        return Err(Error::control("unknown code"));
    }
    let session_id = SessionId::from_slice(&data[1..]).ok_or_else(|| Error::control("missing session id"))?;
    Ok((code, key, session_id))
}

/// `tls-auth` serializer.
#[derive(Debug)]
pub struct AuthSerializer {
    digest: Digest,
    send_key: SecureBytes,
    receive_key: SecureBytes,
    replay: ReplayState,
}

impl AuthSerializer {
    /// Create from the static key hmac slots.
    pub fn new(digest: Digest, key: &StaticKey, timestamp: u32) -> Result<Self> {
        let length = digest.output_length();
        Ok(Self {
            digest,
            send_key: SecureBytes::from_slice(&key.hmac_send_key()[..length]),
            receive_key: SecureBytes::from_slice(&key.hmac_receive_key()[..length]),
            replay: ReplayState::new(timestamp),
        })
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(packet.body_len());
        packet.put_body(&mut body);

        let replay = self.replay.next();
        let opcode = [packet.opcode()];
        let hmac = self.digest.hmac(
            self.send_key.as_bytes(),
            &[&replay, &opcode, packet.session_id.as_bytes(), &body],
        )?;

        let mut out = BytesMut::with_capacity(PREFIX_LENGTH + hmac.len() + REPLAY_LENGTH + body.len());
        out.put_u8(opcode[0]);
        out.put_slice(packet.session_id.as_bytes());
        out.put_slice(&hmac);
        out.put_slice(&replay);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let (code, key, session_id) = read_prefix(data)?;
        let hmac_length = self.digest.output_length();
        let header_length = PREFIX_LENGTH + hmac_length + REPLAY_LENGTH;
        if data.len() < header_length {
            return Err(Error::Buffer {
                expected: header_length,
                actual: data.len(),
            });
        }

        let hmac = &data[PREFIX_LENGTH..PREFIX_LENGTH + hmac_length];
        let replay = &data[PREFIX_LENGTH + hmac_length..header_length];
        let body = &data[header_length..];
        let expected = self
            .digest
            .hmac(self.receive_key.as_bytes(), &[replay, &data[..PREFIX_LENGTH], body])?;
        if !bool::from(expected.as_slice().ct_eq(hmac)) {
            debug!(%code, "tls-auth HMAC mismatch");
            return Err(Error::crypto("tls-auth HMAC mismatch"));
        }
        self.replay.accept(replay)?;

        ControlPacket::deserialize_body(code, key, session_id, body)
    }

    fn reset(&mut self) {
        self.replay.reset();
    }
}

/// `tls-crypt` serializer.
#[derive(Debug)]
pub struct CryptSerializer {
    cipher: CtrHmac,
    replay: ReplayState,
}

impl CryptSerializer {
    /// Create from the static key slots.
    pub fn new(key: &StaticKey, timestamp: u32) -> Result<Self> {
        Ok(Self {
            cipher: CtrHmac::new(
                key.cipher_encrypt_key(),
                key.cipher_decrypt_key(),
                key.hmac_send_key(),
                key.hmac_receive_key(),
            )?,
            replay: ReplayState::new(timestamp),
        })
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(packet.body_len());
        packet.put_body(&mut body);

        let mut out = Vec::with_capacity(CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE + body.len());
        out.push(packet.opcode());
        out.extend_from_slice(packet.session_id.as_bytes());
        out.extend_from_slice(&self.replay.next());

        let ad = out.clone();
        self.cipher.encrypt(&ad, &body, &mut out)?;
        Ok(Bytes::from(out))
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let (code, key, session_id) = read_prefix(data)?;
        if data.len() < CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE {
            return Err(Error::Buffer {
                expected: CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE,
                actual: data.len(),
            });
        }

        let (ad, encrypted) = data.split_at(CRYPT_AD_LENGTH);
        let body = self.cipher.decrypt(ad, encrypted)?;
        self.replay.accept(&ad[PREFIX_LENGTH..])?;

        ControlPacket::deserialize_body(code, key, session_id, &body)
    }

    fn reset(&mut self) {
        self.replay.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{test_static_key, KeyDirection};
    use proptest::prelude::*;

    const TIMESTAMP: u32 = 0x6000_0000;

    fn packet() -> ControlPacket {
        ControlPacket::new(
            PacketCode::ControlV1,
            2,
            SessionId::new([1, 2, 3, 4, 5, 6, 7, 8]),
            9,
            Some(Bytes::from_static(b"tls records")),
        )
        .with_ack(vec![3, 4], SessionId::new([9; 8]))
    }

    fn pair(make: impl Fn(Option<KeyDirection>) -> TlsWrap) -> (ControlChannelSerializer, ControlChannelSerializer) {
        let client = ControlChannelSerializer::new(Some(&make(Some(KeyDirection::Client))), TIMESTAMP).unwrap();
        let server = ControlChannelSerializer::new(Some(&make(Some(KeyDirection::Server))), TIMESTAMP).unwrap();
        (client, server)
    }

    fn auth(digest: Digest) -> impl Fn(Option<KeyDirection>) -> TlsWrap {
        move |direction| TlsWrap::Auth {
            digest,
            key: test_static_key(direction),
        }
    }

    fn crypt(direction: Option<KeyDirection>) -> TlsWrap {
        TlsWrap::Crypt {
            key: test_static_key(direction),
        }
    }

    #[test]
    fn test_plain_round_trip() {
        let mut plain = ControlChannelSerializer::new(None, TIMESTAMP).unwrap();
        let wire = plain.serialize(&packet()).unwrap();
        assert_eq!(wire, packet().serialize());
        assert_eq!(plain.deserialize(&wire).unwrap(), packet());
    }

    #[test]
    fn test_auth_round_trip_all_digests() {
        for digest in Digest::ALL {
            let (mut client, mut server) = pair(auth(digest));
            let wire = client.serialize(&packet()).unwrap();
            assert_eq!(
                wire.len(),
                PREFIX_LENGTH + digest.output_length() + REPLAY_LENGTH + packet().body_len()
            );
            assert_eq!(server.deserialize(&wire).unwrap(), packet());
        }
    }

    #[test]
    fn test_auth_layout() {
        let (mut client, _) = pair(auth(Digest::Sha1));
        let wire = client.serialize(&packet()).unwrap();
        let plain = packet().serialize();

        assert_eq!(&wire[..PREFIX_LENGTH], &plain[..PREFIX_LENGTH]);
        let replay = &wire[PREFIX_LENGTH + 20..PREFIX_LENGTH + 28];
        assert_eq!(&replay[..4], &1u32.to_be_bytes());
        assert_eq!(&replay[4..], &TIMESTAMP.to_be_bytes());
        assert_eq!(&wire[PREFIX_LENGTH + 28..], &plain[PREFIX_LENGTH..]);

        let key = test_static_key(Some(KeyDirection::Client));
        let hmac = Digest::Sha1
            .hmac(&key.hmac_send_key()[..20], &[replay, &plain[..PREFIX_LENGTH], &plain[PREFIX_LENGTH..]])
            .unwrap();
        assert_eq!(&wire[PREFIX_LENGTH..PREFIX_LENGTH + 20], hmac.as_slice());

        let second = client.serialize(&packet()).unwrap();
        assert_eq!(&second[PREFIX_LENGTH + 20..PREFIX_LENGTH + 24], &2u32.to_be_bytes());
    }

    #[test]
    fn test_auth_tamper_rejected() {
        let (mut client, mut server) = pair(auth(Digest::Sha256));
        let wire = client.serialize(&packet()).unwrap();
        for index in [1, PREFIX_LENGTH, PREFIX_LENGTH + 32, wire.len() - 1] {
            let mut tampered = wire.to_vec();
            tampered[index] ^= 0x01;
            assert!(matches!(server.deserialize(&tampered), Err(Error::Crypto(_))));
        }
    }

    #[test]
    fn test_crypt_round_trip_and_confidentiality() {
        let (mut client, mut server) = pair(crypt);
        let wire = client.serialize(&packet()).unwrap();
        assert_eq!(wire.len(), CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE + packet().body_len());
        assert!(!wire.windows(11).any(|w| w == b"tls records"));
        assert_eq!(server.deserialize(&wire).unwrap(), packet());
    }

    #[test]
    fn test_crypt_tamper_and_truncation() {
        let (mut client, mut server) = pair(crypt);
        let wire = client.serialize(&packet()).unwrap();

        let mut tampered = wire.to_vec();
        tampered[CRYPT_AD_LENGTH - 1] ^= 0x01;
        assert!(matches!(server.deserialize(&tampered), Err(Error::Crypto(_))));

        assert!(matches!(
            server.deserialize(&wire[..CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE - 1]),
            Err(Error::Buffer { .. })
        ));
    }

    #[test]
    fn test_replayed_packet_rejected_until_reset() {
        let (mut client, mut server) = pair(crypt);
        let wire = client.serialize(&packet()).unwrap();
        assert!(server.deserialize(&wire).is_ok());
        assert!(matches!(server.deserialize(&wire), Err(Error::ControlChannel(_))));

        server.reset();
        assert!(server.deserialize(&wire).is_ok());

        let (mut client, mut server) = pair(auth(Digest::Sha1));
        let wire = client.serialize(&packet()).unwrap();
        assert!(server.deserialize(&wire).is_ok());
        assert!(server.deserialize(&wire).is_err());
    }

    #[test]
    fn test_reset_restarts_outbound_replay_id() {
        let (mut client, _) = pair(auth(Digest::Sha1));
        client.serialize(&packet()).unwrap();
        client.serialize(&packet()).unwrap();
        client.reset();
        let wire = client.serialize(&packet()).unwrap();
        assert_eq!(&wire[PREFIX_LENGTH + 20..PREFIX_LENGTH + 24], &1u32.to_be_bytes());
    }

    #[test]
    fn test_wrapped_pure_ack() {
        let ack = ControlPacket::ack(0, SessionId::new([4; 8]), vec![1, 2, 3], SessionId::new([5; 8]));
        let (mut client, mut server) = pair(crypt);
        let wire = client.serialize(&ack).unwrap();
        assert_eq!(server.deserialize(&wire).unwrap(), ack);
    }

    fn arb_packet() -> impl Strategy<Value = ControlPacket> {
        let code = prop_oneof![
            Just(PacketCode::SoftResetV1),
            Just(PacketCode::ControlV1),
            Just(PacketCode::HardResetClientV2),
            Just(PacketCode::HardResetServerV2),
        ];
        let acks = proptest::option::of((proptest::collection::vec(any::<u32>(), 1..8), any::<[u8; 8]>()));
        (
            code,
            0u8..8,
            any::<[u8; 8]>(),
            any::<u32>(),
            proptest::collection::vec(any::<u8>(), 0..256),
            acks,
            any::<bool>(),
        )
            .prop_map(|(code, key, session, packet_id, payload, acks, pure_ack)| match acks {
                Some((ids, remote)) if pure_ack => {
                    ControlPacket::ack(key, SessionId::new(session), ids, SessionId::new(remote))
                }
                Some((ids, remote)) => {
                    ControlPacket::new(code, key, SessionId::new(session), packet_id, Some(Bytes::from(payload)))
                        .with_ack(ids, SessionId::new(remote))
                }
                None => ControlPacket::new(code, key, SessionId::new(session), packet_id, Some(Bytes::from(payload))),
            })
    }

    proptest! {
        #[test]
        fn test_auth_peers_agree(packet in arb_packet(), digest in proptest::sample::select(Digest::ALL.to_vec())) {
            let (mut client, mut server) = pair(auth(digest));
            let wire = client.serialize(&packet).unwrap();
            prop_assert_eq!(server.deserialize(&wire).unwrap(), packet.clone());

            let reply = server.serialize(&packet).unwrap();
            prop_assert_eq!(client.deserialize(&reply).unwrap(), packet);
        }

        #[test]
        fn test_crypt_peers_agree(packet in arb_packet()) {
            let (mut client, mut server) = pair(crypt);
            let wire = client.serialize(&packet).unwrap();
            prop_assert_eq!(wire.len(), CRYPT_AD_LENGTH + TLS_CRYPT_TAG_SIZE + packet.body_len());
            prop_assert_eq!(server.deserialize(&wire).unwrap(), packet.clone());

            let reply = server.serialize(&packet).unwrap();
            prop_assert_eq!(client.deserialize(&reply).unwrap(), packet);
        }

        #[test]
        fn test_crypt_rejects_any_flipped_bit(packet in arb_packet(), index in any::<prop::sample::Index>(), bit in 0u8..8) {
            let (mut client, mut server) = pair(crypt);
            let wire = client.serialize(&packet).unwrap();
            let mut tampered = wire.to_vec();
            let at = index.index(tampered.len());
            tampered[at] ^= 1 << bit;
            prop_assert!(server.deserialize(&tampered).is_err());
        }
    }

    #[test]
    fn test_garbage_prefix_errors() {
        let (_, mut server) = pair(auth(Digest::Sha1));
        assert!(matches!(server.deserialize(&[]), Err(Error::ControlChannel(_))));
        assert!(matches!(server.deserialize(&[0x08, 0, 0]), Err(Error::ControlChannel(_))));
        assert!(matches!(server.deserialize(&[0x20, 0, 0]), Err(Error::ControlChannel(_))));
    }
}
