//! Shadowsocks AEAD key derivation and frame cipher primitives.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use sha1::Sha1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unsupported shadowsocks cipher: {0}")]
    UnsupportedMethod(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("HKDF expand failed: {0}")]
    Hkdf(String),
    #[error("AEAD seal/open failed")]
    Aead,
    #[error("ciphertext too short: {0} bytes, need at least {1} for tag")]
    TooShort(usize, usize),
}

/// Shadowsocks AEAD cipher kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    Aes128Gcm2022,
    Aes256Gcm2022,
    ChaCha20Poly1305_2022,
}

impl CipherKind {
    /// Parse cipher method name string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "2022-blake3-aes-128-gcm" | "aes-128-gcm-2022" => Ok(CipherKind::Aes128Gcm2022),
            "2022-blake3-aes-256-gcm" | "aes-256-gcm-2022" => Ok(CipherKind::Aes256Gcm2022),
            "2022-blake3-chacha20-poly1305" | "chacha20-poly1305-2022" => {
                Ok(CipherKind::ChaCha20Poly1305_2022)
            }
            other => Err(CryptoError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm | CipherKind::Aes128Gcm2022 => 16,
            CipherKind::Aes256Gcm
            | CipherKind::Aes256Gcm2022
            | CipherKind::ChaCha20Poly1305
            | CipherKind::ChaCha20Poly1305_2022 => 32,
        }
    }

    /// Salt length in bytes (same as key length).
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// AEAD tag length in bytes (always 16 for all supported ciphers).
    pub fn tag_len(&self) -> usize {
        16
    }

    pub fn is_aead_2022(&self) -> bool {
        matches!(
            self,
            CipherKind::Aes128Gcm2022 | CipherKind::Aes256Gcm2022 | CipherKind::ChaCha20Poly1305_2022
        )
    }
}

/// Derive key from password using EVP_BytesToKey (OpenSSL compatible).
///
/// D_0 = MD5(password), D_i = MD5(D_{i-1} || password), concatenated until
/// key_len bytes are available.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev_hash: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref prev) = prev_hash {
            hasher.update(prev);
        }
        hasher.update(password);
        let hash = hasher.finalize().to_vec();
        key.extend_from_slice(&hash);
        prev_hash = Some(hash);
    }

    key.truncate(key_len);
    key
}

/// Derive a per-session subkey from the master key and salt (legacy AEAD,
/// HKDF-SHA1, info = b"ss-subkey").
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| CryptoError::Hkdf(e.to_string()))?;
    Ok(subkey)
}

/// Derive a per-session subkey for Shadowsocks 2022 using blake3.
pub fn derive_subkey_2022(key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let mut key_material = Vec::with_capacity(key.len() + salt.len());
    key_material.extend_from_slice(key);
    key_material.extend_from_slice(salt);
    let derived = blake3::derive_key("shadowsocks 2022 session subkey", &key_material);
    derived[..key_len].to_vec()
}

/// Derive the Shadowsocks 2022 master key from the configured password field.
///
/// SS2022 requires the password to be a base64-encoded key of exact length;
/// several encodings are tried before falling back to raw bytes.
pub fn ss2022_password_to_key(password: &str, key_len: usize) -> Result<Vec<u8>, CryptoError> {
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(password.trim()) {
        if decoded.len() == key_len {
            return Ok(decoded);
        }
    }
    if let Ok(decoded) = base64::engine::general_purpose::URL_SAFE.decode(password.trim()) {
        if decoded.len() == key_len {
            return Ok(decoded);
        }
    }
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD_NO_PAD.decode(password.trim()) {
        if decoded.len() == key_len {
            return Ok(decoded);
        }
    }
    let raw = password.as_bytes().to_vec();
    if raw.len() != key_len {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes (try a base64-encoded key)",
            key_len
        )));
    }
    Ok(raw)
}

/// Derive the legacy or 2022 master key for a method/password pair.
pub fn derive_master_key(kind: CipherKind, password: &str) -> Result<Vec<u8>, CryptoError> {
    if kind.is_aead_2022() {
        ss2022_password_to_key(password, kind.key_len())
    } else {
        Ok(evp_bytes_to_key(password.as_bytes(), kind.key_len()))
    }
}

/// Derive the per-session subkey for a master key + salt pair, legacy or 2022.
pub fn derive_session_subkey(
    kind: CipherKind,
    master_key: &[u8],
    salt: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if kind.is_aead_2022() {
        Ok(derive_subkey_2022(master_key, salt, kind.key_len()))
    } else {
        derive_subkey(master_key, salt, kind.key_len())
    }
}

/// AEAD frame cipher with a monotonic nonce counter, one per direction.
pub struct AeadCipher {
    cipher_kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    pub fn new(cipher_kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            cipher_kind,
            key: subkey,
            nonce: 0,
        }
    }

    fn nonce_bytes_and_increment(&mut self) -> [u8; 12] {
        let nonce = self.nonce_bytes();
        self.nonce += 1;
        nonce
    }

    pub fn nonce_bytes(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        nonce
    }

    /// Encrypt plaintext in place, returning ciphertext + tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce_bytes_and_increment();
        let mut buf = plaintext.to_vec();

        match self.cipher_kind {
            CipherKind::Aes128Gcm | CipherKind::Aes128Gcm2022 => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                let tag = cipher
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                    .map_err(|_| CryptoError::Aead)?;
                buf.extend_from_slice(&tag);
            }
            CipherKind::Aes256Gcm | CipherKind::Aes256Gcm2022 => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                let tag = cipher
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                    .map_err(|_| CryptoError::Aead)?;
                buf.extend_from_slice(&tag);
            }
            CipherKind::ChaCha20Poly1305 | CipherKind::ChaCha20Poly1305_2022 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                let tag = cipher
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                    .map_err(|_| CryptoError::Aead)?;
                buf.extend_from_slice(&tag);
            }
        }

        Ok(buf)
    }

    /// Decrypt ciphertext with an appended tag, returning plaintext.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let tag_len = self.cipher_kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            return Err(CryptoError::TooShort(ciphertext_with_tag.len(), tag_len));
        }

        let nonce = self.nonce_bytes_and_increment();
        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = &ciphertext_with_tag[ct_len..];

        match self.cipher_kind {
            CipherKind::Aes128Gcm | CipherKind::Aes128Gcm2022 => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                cipher
                    .decrypt_in_place_detached(
                        GenericArray::from_slice(&nonce),
                        b"",
                        &mut buf,
                        GenericArray::from_slice(tag),
                    )
                    .map_err(|_| CryptoError::Aead)?;
            }
            CipherKind::Aes256Gcm | CipherKind::Aes256Gcm2022 => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                cipher
                    .decrypt_in_place_detached(
                        GenericArray::from_slice(&nonce),
                        b"",
                        &mut buf,
                        GenericArray::from_slice(tag),
                    )
                    .map_err(|_| CryptoError::Aead)?;
            }
            CipherKind::ChaCha20Poly1305 | CipherKind::ChaCha20Poly1305_2022 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                cipher
                    .decrypt_in_place_detached(
                        GenericArray::from_slice(&nonce),
                        b"",
                        &mut buf,
                        GenericArray::from_slice(tag),
                    )
                    .map_err(|_| CryptoError::Aead)?;
            }
        }

        Ok(buf)
    }
}
