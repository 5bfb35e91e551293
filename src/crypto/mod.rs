//! Cipher collaborator for the content transform
//!
//! The transform engine only sees the [`Cipher`] trait: a keyed, reversible
//! byte transform driven by a [`Direction`] and a [`Passphrase`]. The
//! shipped implementation is [`AeadCipher`] (Argon2id + AES-256-GCM).

mod aead;
pub mod kdf;

pub use aead::{AeadCipher, BLOB_MAGIC, BLOB_OVERHEAD, NONCE_SIZE, TAG_SIZE};
pub use kdf::{derive_key, generate_salt, DerivedKey};

use std::fmt;
use zeroize::Zeroizing;

/// Size of derived keys in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Size of key derivation salts in bytes
pub const SALT_SIZE: usize = 16;

/// Which way a buffer goes through the cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Mount passphrase, zeroized on drop
#[derive(Clone)]
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Passphrase {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

impl From<&str> for Passphrase {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Errors raised by the cipher
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Random number generation failed")]
    Random,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed (wrong passphrase or corrupted data)")]
    Decryption,

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),
}

/// Keyed, reversible byte transform.
///
/// `transform(transform(b, Encrypt, k), Decrypt, k) == b` must hold for
/// every byte sequence `b` and passphrase `k`.
pub trait Cipher: Send + Sync {
    fn transform(
        &self,
        input: &[u8],
        direction: Direction,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Logical length of a blob of `ciphertext_len` bytes, if derivable
    /// without decrypting.
    fn plaintext_len(&self, _ciphertext_len: u64) -> Option<u64> {
        None
    }
}

impl<C: Cipher + ?Sized> Cipher for std::sync::Arc<C> {
    fn transform(
        &self,
        input: &[u8],
        direction: Direction,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError> {
        (**self).transform(input, direction, passphrase)
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        (**self).plaintext_len(ciphertext_len)
    }
}
