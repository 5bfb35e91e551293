//! AES-256-GCM cipher with Argon2id-derived keys
//!
//! Blob layout:
//!
//! ```text
//! magic "CMF1" (4) | salt (16) | nonce (12) | ciphertext | tag (16)
//! ```
//!
//! The magic and salt are authenticated as associated data. Every blob a
//! cipher instance seals uses the same salt (drawn when the instance is
//! built) and a fresh random nonce, so Argon2 runs once per mount for
//! writes. Keys for salts seen while decrypting are cached.

use super::{kdf, Cipher, CryptoError, Direction, Passphrase, KEY_SIZE, SALT_SIZE};
use crate::config::EncryptionConfig;
use parking_lot::Mutex;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use tracing::debug;
use zeroize::Zeroizing;

/// Leading bytes of every sealed blob
pub const BLOB_MAGIC: &[u8; 4] = b"CMF1";

/// AES-GCM nonce size
pub const NONCE_SIZE: usize = 12;

/// AES-GCM tag size
pub const TAG_SIZE: usize = 16;

const HEADER_SIZE: usize = BLOB_MAGIC.len() + SALT_SIZE + NONCE_SIZE;

/// Bytes a blob carries on top of its plaintext
pub const BLOB_OVERHEAD: usize = HEADER_SIZE + TAG_SIZE;

/// Cached keys are dropped wholesale past this many distinct salts
const MAX_CACHED_KEYS: usize = 256;

type KeyId = [u8; 32];

/// Passphrase-keyed AES-256-GCM cipher
pub struct AeadCipher {
    config: EncryptionConfig,
    /// Salt stamped on every blob this instance seals
    session_salt: [u8; SALT_SIZE],
    keys: Mutex<HashMap<KeyId, Zeroizing<[u8; KEY_SIZE]>>>,
    rng: SystemRandom,
}

impl AeadCipher {
    pub fn new(config: EncryptionConfig) -> Self {
        Self {
            config,
            session_salt: kdf::generate_salt(),
            keys: Mutex::new(HashMap::new()),
            rng: SystemRandom::new(),
        }
    }

    /// Salt embedded in blobs sealed by this instance
    pub fn session_salt(&self) -> &[u8; SALT_SIZE] {
        &self.session_salt
    }

    /// Salt recorded in a sealed blob header
    pub fn blob_salt(blob: &[u8]) -> Option<&[u8]> {
        if blob.len() < BLOB_OVERHEAD || &blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return None;
        }
        Some(&blob[BLOB_MAGIC.len()..BLOB_MAGIC.len() + SALT_SIZE])
    }

    fn key_id(passphrase: &Passphrase, salt: &[u8]) -> KeyId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(passphrase.as_bytes().len() as u64).to_le_bytes());
        hasher.update(passphrase.as_bytes());
        hasher.update(salt);
        *hasher.finalize().as_bytes()
    }

    fn key_for(&self, passphrase: &Passphrase, salt: &[u8]) -> Result<LessSafeKey, CryptoError> {
        let id = Self::key_id(passphrase, salt);

        let cached = self.keys.lock().get(&id).cloned();
        let key = match cached {
            Some(key) => key,
            None => {
                debug!("deriving key for salt {}", hex::encode(salt));
                let key = kdf::derive_key(passphrase, salt, &self.config)?;

                let mut keys = self.keys.lock();
                if keys.len() >= MAX_CACHED_KEYS {
                    keys.clear();
                }
                keys.insert(id, key.clone());
                key
            }
        };

        let unbound = UnboundKey::new(&AES_256_GCM, &key[..]).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    fn seal(&self, plaintext: &[u8], passphrase: &Passphrase) -> Result<Vec<u8>, CryptoError> {
        let key = self.key_for(passphrase, &self.session_salt)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Random)?;

        let mut blob = Vec::with_capacity(plaintext.len() + BLOB_OVERHEAD);
        blob.extend_from_slice(BLOB_MAGIC);
        blob.extend_from_slice(&self.session_salt);
        blob.extend_from_slice(&nonce_bytes);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&blob[..BLOB_MAGIC.len() + SALT_SIZE]),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encryption)?;

        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    fn open(&self, blob: &[u8], passphrase: &Passphrase) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < BLOB_OVERHEAD {
            return Err(CryptoError::Malformed(format!(
                "blob is {} bytes, shorter than the {} byte envelope",
                blob.len(),
                BLOB_OVERHEAD
            )));
        }
        if &blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return Err(CryptoError::Malformed("bad magic".to_string()));
        }

        let aad = &blob[..BLOB_MAGIC.len() + SALT_SIZE];
        let salt = &aad[BLOB_MAGIC.len()..];
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(&blob[aad.len()..HEADER_SIZE]);

        let key = self.key_for(passphrase, salt)?;

        let mut in_out = blob[HEADER_SIZE..].to_vec();
        let plain_len = key
            .open_in_place(Nonce::assume_unique_for_key(nonce_bytes), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Decryption)?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }
}

impl Cipher for AeadCipher {
    fn transform(
        &self,
        input: &[u8],
        direction: Direction,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError> {
        match direction {
            Direction::Encrypt => self.seal(input, passphrase),
            Direction::Decrypt => self.open(input, passphrase),
        }
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        ciphertext_len.checked_sub(BLOB_OVERHEAD as u64)
    }
}
