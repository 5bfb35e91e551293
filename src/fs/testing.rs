//! Cipher and attribute store doubles shared by the filesystem tests

use crate::config::EncryptionConfig;
use crate::crypto::{AeadCipher, Cipher, CryptoError, Direction, Passphrase};
use crate::error::{self, Error};
use crate::fs::xattr::AttributeStore;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Real cipher with cheap Argon2 parameters
pub fn test_cipher() -> AeadCipher {
    AeadCipher::new(EncryptionConfig {
        argon2_memory_kib: 1024,
        argon2_iterations: 1,
        argon2_parallelism: 1,
    })
}

/// Counts every transform call
pub struct CountingCipher<C> {
    inner: C,
    calls: AtomicUsize,
}

impl<C: Cipher> CountingCipher<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<C: Cipher> Cipher for CountingCipher<C> {
    fn transform(
        &self,
        input: &[u8],
        direction: Direction,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.transform(input, direction, passphrase)
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        self.inner.plaintext_len(ciphertext_len)
    }
}

/// Fails encryption on demand
pub struct FlakyCipher<C> {
    inner: C,
    fail_encrypt: AtomicBool,
}

impl<C: Cipher> FlakyCipher<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            fail_encrypt: AtomicBool::new(false),
        }
    }

    pub fn fail_encrypt(&self, fail: bool) {
        self.fail_encrypt.store(fail, Ordering::SeqCst);
    }
}

impl<C: Cipher> Cipher for FlakyCipher<C> {
    fn transform(
        &self,
        input: &[u8],
        direction: Direction,
        passphrase: &Passphrase,
    ) -> Result<Vec<u8>, CryptoError> {
        if direction == Direction::Encrypt && self.fail_encrypt.load(Ordering::SeqCst) {
            return Err(CryptoError::Encryption);
        }
        self.inner.transform(input, direction, passphrase)
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        self.inner.plaintext_len(ciphertext_len)
    }
}

/// Backing store without `user.*` attribute support: nothing is ever set,
/// and setting fails with ENOTSUP
pub struct NoAttributeStore;

impl AttributeStore for NoAttributeStore {
    fn get(&self, _: &Path, name: &OsStr) -> error::Result<Vec<u8>> {
        Err(Error::AttributeMissing(name.to_string_lossy().to_string()))
    }

    fn set(&self, _: &Path, _: &OsStr, _: &[u8], _: i32) -> error::Result<()> {
        Err(Error::Io(io::Error::from_raw_os_error(libc::ENOTSUP)))
    }

    fn list(&self, _: &Path) -> error::Result<Vec<OsString>> {
        Ok(Vec::new())
    }

    fn remove(&self, _: &Path, name: &OsStr) -> error::Result<()> {
        Err(Error::AttributeMissing(name.to_string_lossy().to_string()))
    }
}
