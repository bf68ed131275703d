//! AEAD-framed duplex stream over a raw transport (Shadowsocks AEAD wire format).
//!
//! Wire layout: a random salt (key length bytes) sent once per direction,
//! then a sequence of chunks. Each chunk is two AEAD-sealed frames: a 2-byte
//! big-endian length (capped at [`MAX_CHUNK_LEN`]) and the payload of that
//! length. Each seal operation consumes one nonce, so a chunk advances the
//! nonce counter by two.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::crypto::{derive_master_key, derive_session_subkey, AeadCipher, CipherKind, CryptoError};

/// Payload chunks never exceed this many plaintext bytes, per Shadowsocks AEAD convention.
pub const MAX_CHUNK_LEN: usize = 0x3FFF;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed after a torn frame")]
    Torn,
}

/// Cipher method + password pair. Must match on both ends of a session.
#[derive(Debug, Clone)]
pub struct CipherSpec {
    pub method: String,
    pub password: String,
}

/// Wraps a raw bidirectional byte stream with Shadowsocks AEAD framing.
///
/// Exactly the plaintext bytes written on one side appear on the other,
/// modulo ordering within [`MAX_CHUNK_LEN`]-sized chunks. Once a frame fails
/// to authenticate the stream is poisoned: every subsequent call returns
/// [`CipherError::Torn`].
pub struct CipherStream<S> {
    inner: S,
    cipher_kind: CipherKind,
    master_key: Vec<u8>,
    read_cipher: Option<AeadCipher>,
    write_cipher: Option<AeadCipher>,
    read_leftover: Vec<u8>,
    torn: bool,
}

impl<S> CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `conn` with AEAD framing derived from `spec`. Fails only on an
    /// unrecognized cipher method or empty password; no I/O happens yet,
    /// salts are exchanged lazily on first read/write.
    pub fn wrap(conn: S, spec: &CipherSpec) -> Result<Self, CipherError> {
        let cipher_kind = CipherKind::parse(&spec.method)?;
        if spec.password.is_empty() {
            return Err(CryptoError::InvalidKey("empty password".into()).into());
        }
        let master_key = derive_master_key(cipher_kind, &spec.password)?;
        Ok(Self {
            inner: conn,
            cipher_kind,
            master_key,
            read_cipher: None,
            write_cipher: None,
            read_leftover: Vec::new(),
            torn: false,
        })
    }

    fn check_not_torn(&self) -> Result<(), CipherError> {
        if self.torn {
            return Err(CipherError::Torn);
        }
        Ok(())
    }

    async fn ensure_read_cipher(&mut self) -> Result<(), CipherError> {
        if self.read_cipher.is_some() {
            return Ok(());
        }
        let mut salt = vec![0u8; self.cipher_kind.salt_len()];
        self.inner.read_exact(&mut salt).await?;
        let subkey = derive_session_subkey(self.cipher_kind, &self.master_key, &salt)?;
        self.read_cipher = Some(AeadCipher::new(self.cipher_kind, subkey));
        Ok(())
    }

    async fn ensure_write_cipher(&mut self) -> Result<(), CipherError> {
        if self.write_cipher.is_some() {
            return Ok(());
        }
        let mut salt = vec![0u8; self.cipher_kind.salt_len()];
        rand::Rng::fill(&mut rand::thread_rng(), salt.as_mut_slice());
        let subkey = derive_session_subkey(self.cipher_kind, &self.master_key, &salt)?;
        self.write_cipher = Some(AeadCipher::new(self.cipher_kind, subkey));
        self.inner.write_all(&salt).await?;
        Ok(())
    }

    /// Read one chunk's worth of plaintext off the wire, returning `false` on clean EOF.
    async fn read_chunk(&mut self) -> Result<bool, CipherError> {
        self.ensure_read_cipher().await?;
        let tag_len = self.cipher_kind.tag_len();

        let mut len_frame = vec![0u8; 2 + tag_len];
        if let Err(e) = self.inner.read_exact(&mut len_frame).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(false);
            }
            return Err(e.into());
        }
        let cipher = self.read_cipher.as_mut().expect("ensured above");
        let len_plain = cipher.decrypt(&len_frame).map_err(|e| {
            self.torn = true;
            e
        })?;
        let len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
        if len > MAX_CHUNK_LEN {
            self.torn = true;
            return Err(CryptoError::InvalidKey("chunk length exceeds maximum".into()).into());
        }

        let mut payload_frame = vec![0u8; len + tag_len];
        self.inner.read_exact(&mut payload_frame).await.map_err(|e| {
            self.torn = true;
            e
        })?;
        let cipher = self.read_cipher.as_mut().expect("ensured above");
        let plaintext = cipher.decrypt(&payload_frame).map_err(|e| {
            self.torn = true;
            e
        })?;
        self.read_leftover.extend_from_slice(&plaintext);
        Ok(true)
    }

    /// Read decrypted plaintext into `buf`, returning the number of bytes read (0 = EOF).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CipherError> {
        self.check_not_torn()?;
        if self.read_leftover.is_empty() && !self.read_chunk().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.read_leftover.len());
        buf[..n].copy_from_slice(&self.read_leftover[..n]);
        self.read_leftover.drain(..n);
        Ok(n)
    }

    /// Encrypt and write `buf`, chunked at [`MAX_CHUNK_LEN`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), CipherError> {
        self.check_not_torn()?;
        self.ensure_write_cipher().await?;

        for chunk in buf.chunks(MAX_CHUNK_LEN) {
            let cipher = self.write_cipher.as_mut().expect("ensured above");
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            let len_frame = cipher.encrypt(&len_bytes).map_err(|e| {
                self.torn = true;
                e
            })?;
            let cipher = self.write_cipher.as_mut().expect("ensured above");
            let payload_frame = cipher.encrypt(chunk).map_err(|e| {
                self.torn = true;
                e
            })?;
            self.inner.write_all(&len_frame).await?;
            self.inner.write_all(&payload_frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying transport. The caller retains ownership of
    /// whatever it passed to [`Self::wrap`] and is responsible for it
    /// afterwards (this only flips the half-close on `inner`).
    pub async fn close(&mut self) -> Result<(), CipherError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split into independent read/write halves for full-duplex forwarding,
    /// one task per direction. Must be called before any `read`/`write` if
    /// the caller wants both halves' salts exchanged lazily on first use;
    /// calling it later carries over whatever cipher state already exists.
    pub fn split(self) -> (CipherReadHalf<S>, CipherWriteHalf<S>) {
        let (read_half, write_half) = tokio::io::split(self.inner);
        (
            CipherReadHalf {
                inner: read_half,
                cipher_kind: self.cipher_kind,
                master_key: self.master_key.clone(),
                read_cipher: self.read_cipher,
                leftover: self.read_leftover,
                torn: self.torn,
            },
            CipherWriteHalf {
                inner: write_half,
                cipher_kind: self.cipher_kind,
                master_key: self.master_key,
                write_cipher: self.write_cipher,
                torn: self.torn,
            },
        )
    }
}

/// Read half produced by [`CipherStream::split`]. Owns the receive-direction
/// salt/cipher state independently of the write half.
pub struct CipherReadHalf<S> {
    inner: tokio::io::ReadHalf<S>,
    cipher_kind: CipherKind,
    master_key: Vec<u8>,
    read_cipher: Option<AeadCipher>,
    leftover: Vec<u8>,
    torn: bool,
}

impl<S> CipherReadHalf<S>
where
    S: AsyncRead + Unpin,
{
    fn check_not_torn(&self) -> Result<(), CipherError> {
        if self.torn {
            return Err(CipherError::Torn);
        }
        Ok(())
    }

    async fn ensure_cipher(&mut self) -> Result<(), CipherError> {
        if self.read_cipher.is_some() {
            return Ok(());
        }
        let mut salt = vec![0u8; self.cipher_kind.salt_len()];
        self.inner.read_exact(&mut salt).await?;
        let subkey = derive_session_subkey(self.cipher_kind, &self.master_key, &salt)?;
        self.read_cipher = Some(AeadCipher::new(self.cipher_kind, subkey));
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<bool, CipherError> {
        self.ensure_cipher().await?;
        let tag_len = self.cipher_kind.tag_len();

        let mut len_frame = vec![0u8; 2 + tag_len];
        if let Err(e) = self.inner.read_exact(&mut len_frame).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(false);
            }
            return Err(e.into());
        }
        let cipher = self.read_cipher.as_mut().expect("ensured above");
        let len_plain = cipher.decrypt(&len_frame).map_err(|e| {
            self.torn = true;
            e
        })?;
        let len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
        if len > MAX_CHUNK_LEN {
            self.torn = true;
            return Err(CryptoError::InvalidKey("chunk length exceeds maximum".into()).into());
        }

        let mut payload_frame = vec![0u8; len + tag_len];
        self.inner.read_exact(&mut payload_frame).await.map_err(|e| {
            self.torn = true;
            e
        })?;
        let cipher = self.read_cipher.as_mut().expect("ensured above");
        let plaintext = cipher.decrypt(&payload_frame).map_err(|e| {
            self.torn = true;
            e
        })?;
        self.leftover.extend_from_slice(&plaintext);
        Ok(true)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CipherError> {
        self.check_not_torn()?;
        if self.leftover.is_empty() && !self.read_chunk().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

/// Write half produced by [`CipherStream::split`]. Owns the send-direction
/// salt/cipher state independently of the read half.
pub struct CipherWriteHalf<S> {
    inner: tokio::io::WriteHalf<S>,
    cipher_kind: CipherKind,
    master_key: Vec<u8>,
    write_cipher: Option<AeadCipher>,
    torn: bool,
}

impl<S> CipherWriteHalf<S>
where
    S: AsyncWrite + Unpin,
{
    fn check_not_torn(&self) -> Result<(), CipherError> {
        if self.torn {
            return Err(CipherError::Torn);
        }
        Ok(())
    }

    async fn ensure_cipher(&mut self) -> Result<(), CipherError> {
        if self.write_cipher.is_some() {
            return Ok(());
        }
        let mut salt = vec![0u8; self.cipher_kind.salt_len()];
        rand::Rng::fill(&mut rand::thread_rng(), salt.as_mut_slice());
        let subkey = derive_session_subkey(self.cipher_kind, &self.master_key, &salt)?;
        self.write_cipher = Some(AeadCipher::new(self.cipher_kind, subkey));
        self.inner.write_all(&salt).await?;
        Ok(())
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), CipherError> {
        self.check_not_torn()?;
        self.ensure_cipher().await?;

        for chunk in buf.chunks(MAX_CHUNK_LEN) {
            let cipher = self.write_cipher.as_mut().expect("ensured above");
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            let len_frame = cipher.encrypt(&len_bytes).map_err(|e| {
                self.torn = true;
                e
            })?;
            let cipher = self.write_cipher.as_mut().expect("ensured above");
            let payload_frame = cipher.encrypt(chunk).map_err(|e| {
                self.torn = true;
                e
            })?;
            self.inner.write_all(&len_frame).await?;
            self.inner.write_all(&payload_frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), CipherError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn spec(method: &str) -> CipherSpec {
        CipherSpec {
            method: method.to_string(),
            password: "correct horse battery staple".to_string(),
        }
    }

    #[tokio::test]
    async fn roundtrip_single_chunk() {
        let (client, server) = duplex(8192);
        let mut c = CipherStream::wrap(client, &spec("aes-256-gcm")).unwrap();
        let mut s = CipherStream::wrap(server, &spec("aes-256-gcm")).unwrap();

        let (wr, rr) = tokio::join!(c.write(b"ping"), async {
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        wr.unwrap();
        assert_eq!(rr, b"ping");
    }

    #[tokio::test]
    async fn roundtrip_chacha20() {
        let (client, server) = duplex(8192);
        let mut c = CipherStream::wrap(client, &spec("chacha20-ietf-poly1305")).unwrap();
        let mut s = CipherStream::wrap(server, &spec("chacha20-ietf-poly1305")).unwrap();

        let (wr, rr) = tokio::join!(c.write(b"chacha payload"), async {
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        wr.unwrap();
        assert_eq!(rr, b"chacha payload");
    }

    #[tokio::test]
    async fn roundtrip_oversized_chunk_splits() {
        let (client, server) = duplex(1 << 20);
        let mut c = CipherStream::wrap(client, &spec("aes-128-gcm")).unwrap();
        let mut s = CipherStream::wrap(server, &spec("aes-128-gcm")).unwrap();

        let payload = vec![0x42u8; MAX_CHUNK_LEN + 100];
        let payload_clone = payload.clone();
        let (wr, rr) = tokio::join!(c.write(&payload_clone), async {
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            while collected.len() < payload.len() {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            collected
        });
        wr.unwrap();
        assert_eq!(rr, payload);
    }

    #[tokio::test]
    async fn wrap_rejects_unknown_method() {
        let (client, _server) = duplex(64);
        assert!(CipherStream::wrap(client, &spec("rot13")).is_err());
    }

    #[tokio::test]
    async fn wrap_rejects_empty_password() {
        let (client, _server) = duplex(64);
        let mut s = spec("aes-256-gcm");
        s.password.clear();
        assert!(CipherStream::wrap(client, &s).is_err());
    }

    #[tokio::test]
    async fn mismatched_password_fails_to_authenticate() {
        let (client, server) = duplex(8192);
        let mut c = CipherStream::wrap(client, &spec("aes-256-gcm")).unwrap();
        let mut wrong = spec("aes-256-gcm");
        wrong.password = "not the same password".to_string();
        let mut s = CipherStream::wrap(server, &wrong).unwrap();

        c.write(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let err = s.read(&mut buf).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn torn_stream_stays_torn() {
        let (client, server) = duplex(8192);
        let mut c = CipherStream::wrap(client, &spec("aes-256-gcm")).unwrap();
        let mut wrong = spec("aes-256-gcm");
        wrong.password = "different".to_string();
        let mut s = CipherStream::wrap(server, &wrong).unwrap();

        c.write(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        assert!(s.read(&mut buf).await.is_err());
        assert!(s.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn eof_returns_zero() {
        let (client, server) = duplex(64);
        drop(client);
        let mut s = CipherStream::wrap(server, &spec("aes-256-gcm")).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn split_halves_forward_independently_both_directions() {
        let (client, server) = duplex(8192);
        let c = CipherStream::wrap(client, &spec("aes-256-gcm")).unwrap();
        let s = CipherStream::wrap(server, &spec("aes-256-gcm")).unwrap();
        let (mut c_read, mut c_write) = c.split();
        let (mut s_read, mut s_write) = s.split();

        let client_to_server = async {
            c_write.write(b"client hello").await.unwrap();
            let mut buf = [0u8; 64];
            let n = s_read.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        };
        let server_to_client = async {
            s_write.write(b"server hello").await.unwrap();
            let mut buf = [0u8; 64];
            let n = c_read.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        };
        let (from_client, from_server) = tokio::join!(client_to_server, server_to_client);
        assert_eq!(from_client, b"client hello");
        assert_eq!(from_server, b"server hello");
    }
}
