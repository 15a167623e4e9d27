use crate::error::Result;

/// TLS engine carried by the control channel.
///
/// The session never touches sockets through this trait: ciphertext comes
/// in from and goes out to CONTROL_V1 payloads, plaintext is the key method
/// 2 exchange. Implementations wrap a TLS library configured with the CA,
/// client certificate and verification settings of the profile.
pub trait TlsProtocol: Send {
    /// Begin the client handshake.
    fn start(&mut self) -> Result<()>;

    /// Feed ciphertext received from the server.
    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take ciphertext to send, empty when there is none.
    fn pull_cipher_text(&mut self) -> Result<Vec<u8>>;

    /// Queue a NUL-terminated control message.
    fn put_plain_text(&mut self, text: &str) -> Result<()> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.put_raw_plain_text(&data)
    }

    /// Queue raw plaintext.
    fn put_raw_plain_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take decrypted plaintext, empty when there is none.
    fn pull_plain_text(&mut self) -> Result<Vec<u8>>;

    /// Whether the handshake completed.
    fn is_connected(&self) -> bool;
}

/// Creates a fresh TLS engine for every negotiation.
pub type TlsFactory = Box<dyn FnMut() -> Result<Box<dyn TlsProtocol>> + Send>;
