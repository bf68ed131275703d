//! Shadowsocks AEAD cipher primitives and the framed duplex stream built on them.

pub mod crypto;
pub mod stream;

pub use crypto::{CipherKind, CryptoError};
pub use stream::{
    CipherError, CipherReadHalf, CipherSpec, CipherStream, CipherWriteHalf, MAX_CHUNK_LEN,
};
