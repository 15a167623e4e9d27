//! Data channel: per-key encryption of tunneled IP packets.
//!
//! ```text
//! DATA_V1: ┌────────┬──────────────────────────────┐
//!          │ opcode │ body                         │
//!          └────────┴──────────────────────────────┘
//! DATA_V2: ┌────────┬─────────────┬────────────────┐
//!          │ opcode │ peer id (3) │ body           │
//!          └────────┴─────────────┴────────────────┘
//!
//! CBC body:  HMAC(iv || ct) │ iv (16) │ ct = CBC(packet id || framed payload)
//! AEAD body: packet id (4)  │ tag (16) │ ct = AEAD(framed payload)
//! ```
//!
//! One [`DataChannel`] exists per key id. Encryption and decryption hold
//! independent locks so that the tunnel→link and link→tunnel pipelines can
//! run concurrently on the same channel.

mod compression;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::crypto::{AeadCipher, CbcHmac, Cipher, CryptoKeys, Digest, Prng, NONCE_SIZE, TAG_SIZE};
use crate::error::{DataPathError, Error, Result};
use crate::protocol::{
    opcode, parse_opcode, PacketCode, ReplayWindow, KEEP_ALIVE_MAGIC, PACKET_ID_LENGTH, PEER_ID_DISABLED,
    PEER_ID_LENGTH,
};

pub use compression::{
    CompressionFraming, LZ4_COMPRESS, LZO_COMPRESS, NO_COMPRESS, NO_COMPRESS_SWAP, V2_INDICATOR, V2_UNCOMPRESSED,
};

/// `DataPathError::Crypto` code: encryption failed.
pub const CRYPTO_ENCRYPT_FAILED: u32 = 1;

/// `DataPathError::Crypto` code: HMAC or AEAD tag did not verify.
pub const CRYPTO_AUTH_FAILED: u32 = 2;

/// `DataPathError::Crypto` code: packet too short for its cipher.
pub const CRYPTO_SHORT_PACKET: u32 = 3;

/// Size of the implicit IV taken from the HMAC key for AEAD nonces.
const IMPLICIT_IV_LENGTH: usize = NONCE_SIZE - PACKET_ID_LENGTH;

/// Per-channel settings besides the key material.
#[derive(Debug, Clone, Copy)]
pub struct DataChannelOptions {
    /// Server-assigned peer id; `Some` switches the channel to `DATA_V2`
    pub peer_id: Option<u32>,
    /// Compression framing
    pub compression: CompressionFraming,
    /// Highest outbound packet id before the channel refuses to encrypt
    pub max_packet_id: u32,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            peer_id: None,
            compression: CompressionFraming::Disabled,
            max_packet_id: u32::MAX,
        }
    }
}

/// One decrypted data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Packet id the peer assigned
    pub packet_id: u32,
    /// Decrypted IP packet; empty for keep-alives
    pub payload: Bytes,
    /// Payload was the keep-alive magic
    pub is_keep_alive: bool,
}

enum Seal {
    Cbc(CbcHmac),
    Aead {
        cipher: AeadCipher,
        implicit_iv: [u8; IMPLICIT_IV_LENGTH],
    },
}

impl Seal {
    fn new(cipher: Cipher, digest: Digest, cipher_key: &[u8], hmac_key: &[u8]) -> Result<Self> {
        if cipher.is_aead() {
            let mut implicit_iv = [0u8; IMPLICIT_IV_LENGTH];
            let iv = hmac_key.get(..IMPLICIT_IV_LENGTH).ok_or(Error::Buffer {
                expected: IMPLICIT_IV_LENGTH,
                actual: hmac_key.len(),
            })?;
            implicit_iv.copy_from_slice(iv);
            Ok(Seal::Aead {
                cipher: AeadCipher::new(cipher, cipher_key)?,
                implicit_iv,
            })
        } else {
            Ok(Seal::Cbc(CbcHmac::new(cipher, digest, cipher_key, hmac_key)?))
        }
    }

    fn nonce(implicit_iv: &[u8; IMPLICIT_IV_LENGTH], packet_id: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PACKET_ID_LENGTH].copy_from_slice(&packet_id.to_be_bytes());
        nonce[PACKET_ID_LENGTH..].copy_from_slice(implicit_iv);
        nonce
    }
}

struct Encrypter {
    seal: Seal,
    next_packet_id: u64,
}

struct Decrypter {
    seal: Seal,
    replay: ReplayWindow,
}

/// Encrypts and decrypts data packets for one key id.
pub struct DataChannel {
    key: u8,
    cipher: Cipher,
    options: DataChannelOptions,
    prng: Arc<dyn Prng>,
    encrypter: Mutex<Encrypter>,
    decrypter: Mutex<Decrypter>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl DataChannel {
    /// Build a channel for `key` from PRF output.
    ///
    /// # Errors
    ///
    /// `DataPathError::Algorithm` when the keys do not fit the cipher.
    pub fn new(
        key: u8,
        cipher: Cipher,
        digest: Digest,
        keys: &CryptoKeys,
        options: DataChannelOptions,
        prng: Arc<dyn Prng>,
    ) -> Result<Self> {
        let setup = |cipher_key: &[u8], hmac_key: &[u8]| {
            Seal::new(cipher, digest, cipher_key, hmac_key).map_err(|e| {
                warn!(%cipher, %digest, error = %e, "data channel: key setup failed");
                Error::DataPath(DataPathError::Algorithm)
            })
        };
        let encrypt = setup(keys.cipher.encryption_key.as_bytes(), keys.digest.encryption_key.as_bytes())?;
        let decrypt = setup(keys.cipher.decryption_key.as_bytes(), keys.digest.decryption_key.as_bytes())?;
        debug!(key, %cipher, %digest, peer_id = ?options.peer_id, "data channel: ready");

        Ok(Self {
            key,
            cipher,
            options,
            prng,
            encrypter: Mutex::new(Encrypter {
                seal: encrypt,
                next_packet_id: 1,
            }),
            decrypter: Mutex::new(Decrypter {
                seal: decrypt,
                replay: ReplayWindow::new(),
            }),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Key id this channel serves.
    pub fn key(&self) -> u8 {
        self.key
    }

    /// Negotiated cipher.
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Peer id carried in outbound `DATA_V2` headers.
    pub fn peer_id(&self) -> Option<u32> {
        self.options.peer_id
    }

    /// Encrypt a batch of IP packets.
    pub fn encrypt(&self, packets: &[Bytes]) -> Result<Vec<Bytes>> {
        packets.iter().map(|packet| self.encrypt_packet(packet)).collect()
    }

    /// Encrypt the keep-alive ping.
    pub fn keep_alive(&self) -> Result<Bytes> {
        self.encrypt_packet(&KEEP_ALIVE_MAGIC)
    }

    /// Encrypt one IP packet.
    pub fn encrypt_packet(&self, payload: &[u8]) -> Result<Bytes> {
        let header = self.header();
        let mut framed = Vec::with_capacity(payload.len() + 2);
        self.options.compression.frame(payload, &mut framed);

        let mut encrypter = self.encrypter.lock();
        if encrypter.next_packet_id > u64::from(self.options.max_packet_id) {
            return Err(DataPathError::Overflow.into());
        }
        let packet_id = encrypter.next_packet_id as u32;
        encrypter.next_packet_id += 1;

        let mut out = Vec::with_capacity(header.len() + framed.len() + 64);
        out.extend_from_slice(&header);
        match &encrypter.seal {
            Seal::Cbc(cbc) => {
                let mut plaintext = Vec::with_capacity(PACKET_ID_LENGTH + framed.len());
                plaintext.extend_from_slice(&packet_id.to_be_bytes());
                plaintext.extend_from_slice(&framed);
                cbc.encrypt(self.prng.as_ref(), &plaintext, &mut out)
                    .map_err(|_| DataPathError::Crypto(CRYPTO_ENCRYPT_FAILED))?;
            }
            Seal::Aead { cipher, implicit_iv } => {
                let nonce = Seal::nonce(implicit_iv, packet_id);
                let aad = aead_aad(&header, packet_id);
                let tag = cipher
                    .encrypt_in_place_detached(&nonce, &aad, &mut framed)
                    .map_err(|_| DataPathError::Crypto(CRYPTO_ENCRYPT_FAILED))?;
                out.extend_from_slice(&packet_id.to_be_bytes());
                out.extend_from_slice(&tag);
                out.extend_from_slice(&framed);
            }
        }
        drop(encrypter);

        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        trace!(key = self.key, packet_id, len = out.len(), "data channel: encrypted");
        Ok(Bytes::from(out))
    }

    /// Decrypt a batch of packets from the link.
    ///
    /// Replays and packets failing framing or peer id checks are dropped.
    /// Returns the IP packets and whether a keep-alive was received.
    ///
    /// # Errors
    ///
    /// Fatal data path errors (authentication failure, bad key setup).
    pub fn decrypt(&self, packets: &[Bytes]) -> Result<(Vec<Bytes>, bool)> {
        let mut out = Vec::with_capacity(packets.len());
        let mut keep_alive = false;
        for packet in packets {
            match self.decrypt_packet(packet) {
                Ok(Some(decrypted)) if decrypted.is_keep_alive => keep_alive = true,
                Ok(Some(decrypted)) => out.push(decrypted.payload),
                Ok(None) => {}
                Err(Error::DataPath(e)) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(key = self.key, error = %e, "data channel: dropping packet"),
            }
        }
        Ok((out, keep_alive))
    }

    /// Decrypt one packet; `Ok(None)` for a replayed packet id.
    pub fn decrypt_packet(&self, data: &[u8]) -> Result<Option<DataPacket>> {
        let (&first, _) = data.split_first().ok_or(DataPathError::Crypto(CRYPTO_SHORT_PACKET))?;
        let (code, key) = parse_opcode(first);
        if key != self.key {
            return Err(Error::BadKey(key));
        }
        let header_len = match code {
            PacketCode::DataV1 => 1,
            PacketCode::DataV2 => {
                if data.len() < 1 + PEER_ID_LENGTH {
                    return Err(DataPathError::Crypto(CRYPTO_SHORT_PACKET).into());
                }
                let peer_id = u32::from_be_bytes([0, data[1], data[2], data[3]]);
                if let Some(ours) = self.options.peer_id {
                    if peer_id != ours {
                        return Err(DataPathError::PeerIdMismatch.into());
                    }
                }
                1 + PEER_ID_LENGTH
            }
            other => return Err(Error::control(format!("{} is not a data packet", other))),
        };
        let (header, body) = data.split_at(header_len);

        let mut decrypter = self.decrypter.lock();
        let (packet_id, framed) = match &decrypter.seal {
            Seal::Cbc(cbc) => {
                let plaintext = cbc.decrypt(body).map_err(|e| match e {
                    Error::Buffer { .. } => DataPathError::Crypto(CRYPTO_SHORT_PACKET),
                    _ => DataPathError::Crypto(CRYPTO_AUTH_FAILED),
                })?;
                if plaintext.len() < PACKET_ID_LENGTH {
                    return Err(DataPathError::Crypto(CRYPTO_SHORT_PACKET).into());
                }
                let packet_id = read_packet_id(&plaintext);
                (packet_id, plaintext[PACKET_ID_LENGTH..].to_vec())
            }
            Seal::Aead { cipher, implicit_iv } => {
                if body.len() < PACKET_ID_LENGTH + TAG_SIZE {
                    return Err(DataPathError::Crypto(CRYPTO_SHORT_PACKET).into());
                }
                let packet_id = read_packet_id(body);
                let mut tag = [0u8; TAG_SIZE];
                tag.copy_from_slice(&body[PACKET_ID_LENGTH..PACKET_ID_LENGTH + TAG_SIZE]);
                let mut buffer = body[PACKET_ID_LENGTH + TAG_SIZE..].to_vec();
                let nonce = Seal::nonce(implicit_iv, packet_id);
                let aad = aead_aad(header, packet_id);
                cipher
                    .decrypt_in_place_detached(&nonce, &aad, &mut buffer, &tag)
                    .map_err(|_| DataPathError::Crypto(CRYPTO_AUTH_FAILED))?;
                (packet_id, buffer)
            }
        };
        if !decrypter.replay.check_and_update(packet_id) {
            trace!(key = self.key, packet_id, "data channel: replayed packet dropped");
            return Ok(None);
        }
        drop(decrypter);

        let payload = self.options.compression.unframe(&framed)?;
        let is_keep_alive = payload == KEEP_ALIVE_MAGIC;
        self.bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(Some(DataPacket {
            packet_id,
            payload: if is_keep_alive { Bytes::new() } else { Bytes::from(payload) },
            is_keep_alive,
        }))
    }

    /// `(received, sent)` plaintext byte counters.
    pub fn data_count(&self) -> (u64, u64) {
        (
            self.bytes_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }

    fn header(&self) -> Vec<u8> {
        match self.options.peer_id {
            Some(peer_id) if peer_id != PEER_ID_DISABLED => {
                let mut header = Vec::with_capacity(1 + PEER_ID_LENGTH);
                header.push(opcode(PacketCode::DataV2, self.key));
                header.extend_from_slice(&peer_id.to_be_bytes()[1..]);
                header
            }
            _ => vec![opcode(PacketCode::DataV1, self.key)],
        }
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("key", &self.key)
            .field("cipher", &self.cipher)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// AAD of an AEAD packet: the `DATA_V2` header (if any) and the packet id.
fn aead_aad(header: &[u8], packet_id: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + PEER_ID_LENGTH + PACKET_ID_LENGTH);
    if header.len() > 1 {
        aad.extend_from_slice(header);
    }
    aad.extend_from_slice(&packet_id.to_be_bytes());
    aad
}

fn read_packet_id(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}
