//! Streaming AES-128-CFB encryption layer
//!
//! The write side sends a random IV in the clear as the first
//! [`IV_LEN`] bytes of the stream, then ciphertext. The read side consumes the
//! peer's IV before it decrypts anything. CFB needs no padding, so every write
//! size is supported and nothing is buffered beyond one write.

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Derived key length (AES-128)
pub const KEY_LEN: usize = 16;

/// IV length, equal to the AES block size
pub const IV_LEN: usize = 16;

const KEY_SALT: &[u8] = b"burrow";
const KEY_ITERATIONS: u32 = 64;

/// Largest plaintext chunk encrypted per `poll_write`
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Cipher setup errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes (expected 16)")]
    InvalidKeyLength(usize),

    #[error("Invalid IV length")]
    InvalidIvLength,
}

/// Derive the symmetric key for a pre-shared secret.
///
/// PBKDF2-HMAC-SHA256 with a fixed salt, so the same secret always yields the
/// same key on both peers.
pub fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret, KEY_SALT, KEY_ITERATIONS, &mut key);
    key
}

/// Encrypting/decrypting connection wrapper
pub struct CryptoStream<S> {
    inner: S,
    key: [u8; KEY_LEN],

    encryptor: BufEncryptor<Aes128>,
    local_iv: [u8; IV_LEN],
    iv_sent: bool,
    // Ciphertext accepted from the caller but not yet written to `inner`
    pending: Vec<u8>,
    pending_pos: usize,

    decryptor: Option<BufDecryptor<Aes128>>,
    remote_iv: [u8; IV_LEN],
    remote_iv_read: usize,
}

impl<S> CryptoStream<S> {
    /// Wrap `inner` using a raw key. Fails before any I/O if the key does not
    /// fit the cipher.
    pub fn new(inner: S, key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

        let mut local_iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut local_iv);

        let encryptor = BufEncryptor::<Aes128>::new_from_slices(&key, &local_iv)
            .map_err(|_| CryptoError::InvalidIvLength)?;

        Ok(Self {
            inner,
            key,
            encryptor,
            local_iv,
            iv_sent: false,
            pending: Vec::new(),
            pending_pos: 0,
            decryptor: None,
            remote_iv: [0u8; IV_LEN],
            remote_iv_read: 0,
        })
    }

    /// Wrap `inner` using the key derived from `secret`
    pub fn with_secret(inner: S, secret: &[u8]) -> Result<Self, CryptoError> {
        Self::new(inner, &derive_key(secret))
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> CryptoStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CryptoStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.decryptor.is_none() {
            let mut iv_buf = ReadBuf::new(&mut this.remote_iv[this.remote_iv_read..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf))?;
            let n = iv_buf.filled().len();
            if n == 0 {
                if this.remote_iv_read == 0 {
                    // Peer closed without sending anything
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside the initialization vector",
                )));
            }
            this.remote_iv_read += n;
            if this.remote_iv_read == IV_LEN {
                let decryptor = BufDecryptor::<Aes128>::new_from_slices(&this.key, &this.remote_iv)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
                this.decryptor = Some(decryptor);
            }
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decryptor) = this.decryptor.as_mut() {
            decryptor.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CryptoStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !this.iv_sent {
            this.pending.extend_from_slice(&this.local_iv);
            this.iv_sent = true;
        }

        let n = buf.len().min(MAX_WRITE_CHUNK);
        let start = this.pending.len();
        this.pending.extend_from_slice(&buf[..n]);
        this.encryptor.encrypt(&mut this.pending[start..]);

        // The keystream has advanced, so these bytes are accepted even if the
        // inner stream is not ready yet; flush/shutdown finish the job.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
