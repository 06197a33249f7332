//! Shadowsocks-style AEAD encrypted outbound.
//!
//! Wire format per direction: a random salt, then a sequence of sealed
//! chunks `AEAD(len) || AEAD(payload)` with `len <= 0x3fff`. Each direction
//! derives its own session subkey from the master key and its salt; the
//! AEAD nonce is a little-endian counter incremented per seal/open. The
//! destination address travels inside the first chunk the client sends.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

use rudder_proto::{Address, encode_socks_addr};

use crate::conn::ProxyStream;
use crate::error::AdapterError;
use crate::outbound::{MeteredStream, Proxy, dial};
use crate::traffic::TrafficMeter;

/// Largest plaintext chunk the framing allows.
const MAX_CHUNK: usize = 0x3fff;

/// Supported AEAD stream ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes256Gcm,
    Chacha20Poly1305,
}

impl Cipher {
    /// Resolve a configured cipher name.
    pub fn from_name(name: &str) -> Result<Self, AdapterError> {
        match name {
            "aes-256-gcm" => Ok(Cipher::Aes256Gcm),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(Cipher::Chacha20Poly1305),
            other => Err(AdapterError::Cipher(format!("unsupported cipher '{other}'"))),
        }
    }

    pub fn key_size(&self) -> usize {
        32
    }

    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    pub fn tag_size(&self) -> usize {
        16
    }

    /// Stretch a password into the master key.
    pub fn derive_key(&self, password: &str) -> Vec<u8> {
        let key_len = self.key_size();
        let mut key = Vec::with_capacity(key_len);
        let mut prev: Vec<u8> = Vec::new();
        while key.len() < key_len {
            let mut hasher = Sha256::new();
            hasher.update(&prev);
            hasher.update(password.as_bytes());
            prev = hasher.finalize().to_vec();
            key.extend_from_slice(&prev);
        }
        key.truncate(key_len);
        key
    }

    /// Build the per-direction session key for a salt.
    fn session(&self, master_key: &[u8], salt: &[u8]) -> SessionKey {
        let subkey = derive_subkey(master_key, salt);
        match self {
            Cipher::Aes256Gcm => SessionKey::Aes(Box::new(
                Aes256Gcm::new_from_slice(&subkey).expect("subkey is exactly 32 bytes"),
            )),
            Cipher::Chacha20Poly1305 => SessionKey::Chacha(Box::new(
                ChaCha20Poly1305::new_from_slice(&subkey).expect("subkey is exactly 32 bytes"),
            )),
        }
    }
}

/// Session subkey per SIP004: `HKDF(master_key, salt, "ss-subkey")`.
fn derive_subkey(master_key: &[u8], salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
    let mut okm = [0u8; 32];
    hk.expand(b"ss-subkey", &mut okm)
        .expect("HKDF expand with fixed-length output");
    okm
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

enum SessionKey {
    Aes(Box<Aes256Gcm>),
    Chacha(Box<ChaCha20Poly1305>),
}

impl SessionKey {
    fn seal(&self, counter: u64, plain: &[u8]) -> Vec<u8> {
        let nonce = nonce_bytes(counter);
        match self {
            SessionKey::Aes(c) => c.encrypt(Nonce::from_slice(&nonce), plain),
            SessionKey::Chacha(c) => {
                c.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plain)
            }
        }
        .expect("AEAD seal with a valid key and bounded input")
    }

    fn open(&self, counter: u64, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = nonce_bytes(counter);
        match self {
            SessionKey::Aes(c) => c.decrypt(Nonce::from_slice(&nonce), sealed),
            SessionKey::Chacha(c) => {
                c.decrypt(chacha20poly1305::Nonce::from_slice(&nonce), sealed)
            }
        }
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD authentication failed"))
    }
}

enum ReadState {
    /// Waiting for the peer's salt.
    Salt,
    /// Waiting for a sealed length frame.
    Length,
    /// Waiting for a sealed payload of this plaintext length.
    Payload(usize),
    Eof,
}

/// An AEAD-framed stream over `S` (client side).
///
/// Created by [`AeadStream::client`], which sends the local salt and the
/// destination header before returning. The peer's salt is consumed lazily
/// on first read.
pub struct AeadStream<S> {
    inner: S,
    cipher: Cipher,
    master_key: Vec<u8>,
    seal_key: SessionKey,
    seal_nonce: u64,
    open_key: Option<SessionKey>,
    open_nonce: u64,
    read_state: ReadState,
    /// Raw bytes from the wire, not yet decoded.
    ciphertext: BytesMut,
    /// Decoded bytes not yet handed to the caller.
    plaintext: BytesMut,
    /// Sealed bytes not yet flushed to the wire.
    sealed: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AeadStream<S> {
    /// Open the client side: send our salt and the destination `header` as
    /// the first sealed chunk.
    ///
    /// Any error here aborts the connection; a stream is only returned once
    /// the header is fully written.
    pub async fn client(
        inner: S,
        cipher: Cipher,
        master_key: &[u8],
        header: &[u8],
    ) -> io::Result<Self> {
        let mut salt = vec![0u8; cipher.salt_size()];
        fastrand::fill(&mut salt);
        let seal_key = cipher.session(master_key, &salt);

        let mut stream = Self {
            inner,
            cipher,
            master_key: master_key.to_vec(),
            seal_key,
            seal_nonce: 0,
            open_key: None,
            open_nonce: 0,
            read_state: ReadState::Salt,
            ciphertext: BytesMut::new(),
            plaintext: BytesMut::new(),
            sealed: BytesMut::new(),
        };

        let mut first = BytesMut::with_capacity(salt.len() + header.len() + 64);
        first.extend_from_slice(&salt);
        stream.seal_chunk(header);
        first.extend_from_slice(&stream.sealed);
        stream.sealed.clear();

        stream.inner.write_all(&first).await?;
        stream.inner.flush().await?;
        Ok(stream)
    }

    /// Seal one chunk of plaintext into the outgoing buffer.
    fn seal_chunk(&mut self, plain: &[u8]) {
        debug_assert!(plain.len() <= MAX_CHUNK);
        let len_bytes = (plain.len() as u16).to_be_bytes();
        let sealed_len = self.seal_key.seal(self.seal_nonce, &len_bytes);
        self.sealed.extend_from_slice(&sealed_len);
        let sealed_payload = self.seal_key.seal(self.seal_nonce + 1, plain);
        self.sealed.extend_from_slice(&sealed_payload);
        self.seal_nonce += 2;
    }

    /// Push buffered sealed bytes to the wire.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.sealed.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.sealed) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.sealed.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Decode complete frames out of the buffered ciphertext.
    ///
    /// Returns true when any progress was made.
    fn decode_frames(&mut self) -> io::Result<bool> {
        let tag = self.cipher.tag_size();
        let mut progressed = false;
        loop {
            match self.read_state {
                ReadState::Salt => {
                    let salt_size = self.cipher.salt_size();
                    if self.ciphertext.len() < salt_size {
                        return Ok(progressed);
                    }
                    let salt = self.ciphertext.split_to(salt_size);
                    self.open_key = Some(self.cipher.session(&self.master_key, &salt));
                    self.read_state = ReadState::Length;
                    progressed = true;
                }
                ReadState::Length => {
                    if self.ciphertext.len() < 2 + tag {
                        return Ok(progressed);
                    }
                    let frame = self.ciphertext.split_to(2 + tag);
                    let key = self
                        .open_key
                        .as_ref()
                        .expect("session key exists past the salt state");
                    let plain = key.open(self.open_nonce, &frame)?;
                    self.open_nonce += 1;
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if len > MAX_CHUNK {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "oversized chunk length",
                        ));
                    }
                    self.read_state = ReadState::Payload(len);
                    progressed = true;
                }
                ReadState::Payload(len) => {
                    if self.ciphertext.len() < len + tag {
                        return Ok(progressed);
                    }
                    let frame = self.ciphertext.split_to(len + tag);
                    let key = self
                        .open_key
                        .as_ref()
                        .expect("session key exists past the salt state");
                    let plain = key.open(self.open_nonce, &frame)?;
                    self.open_nonce += 1;
                    self.plaintext.extend_from_slice(&plain);
                    self.read_state = ReadState::Length;
                    progressed = true;
                }
                ReadState::Eof => return Ok(progressed),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(out.remaining());
                out.put_slice(&this.plaintext[..n]);
                this.plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }
            if matches!(this.read_state, ReadState::Eof) {
                return Poll::Ready(Ok(()));
            }
            if this.decode_frames()? {
                continue;
            }

            let mut tmp = [0u8; 16 * 1024];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let chunk = tmp_buf.filled();
                    if chunk.is_empty() {
                        // EOF on a frame boundary is a normal close; inside
                        // a frame it is truncation.
                        let clean = this.ciphertext.is_empty()
                            && matches!(this.read_state, ReadState::Salt | ReadState::Length);
                        this.read_state = ReadState::Eof;
                        return if clean {
                            Poll::Ready(Ok(()))
                        } else {
                            Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                        };
                    }
                    this.ciphertext.extend_from_slice(chunk);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Finish pushing previously sealed bytes before accepting more.
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let take = buf.len().min(MAX_CHUNK);
        this.seal_chunk(&buf[..take]);
        // Push opportunistically; leftovers drain on the next write or flush.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            _ => {}
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

/// The `ss` outbound: an encrypted stream tunnel through a remote server.
pub struct Shadowsocks {
    name: String,
    server: String,
    port: u16,
    cipher: Cipher,
    key: Vec<u8>,
    up: mpsc::UnboundedSender<i64>,
    down: mpsc::UnboundedSender<i64>,
}

impl Shadowsocks {
    /// Build an `ss` outbound; fails on an unknown cipher name.
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        cipher_name: &str,
        password: &str,
        traffic: &TrafficMeter,
    ) -> Result<Self, AdapterError> {
        let cipher = Cipher::from_name(cipher_name)?;
        let key = cipher.derive_key(password);
        Ok(Self {
            name: name.into(),
            server: server.into(),
            port,
            cipher,
            key,
            up: traffic.up(),
            down: traffic.down(),
        })
    }
}

#[async_trait]
impl Proxy for Shadowsocks {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, addr: &Address) -> Result<ProxyStream, AdapterError> {
        let tcp = dial(&self.server, self.port).await?;
        let mut header = Vec::with_capacity(32);
        encode_socks_addr(addr, &mut header)?;
        let stream = AeadStream::client(tcp, self.cipher, &self.key, &header).await?;
        Ok(Box::new(MeteredStream::new(
            stream,
            self.up.clone(),
            self.down.clone(),
        )))
    }
}
