//! Content transform engine
//!
//! Implements decrypt-then-slice for reads and decrypt-patch-encrypt for
//! writes against whole-file ciphertext. Nothing is cached between calls:
//! every operation reloads the backing file and reruns the cipher over the
//! full buffer, so cost is O(file size) regardless of the range touched.
//!
//! No locking is done. Two writers racing on one file each rewrite the
//! whole file and the last rewrite wins. Unless atomic writes are enabled,
//! a reader racing a writer can observe the truncated file. Atomic commits
//! replace the backing inode, which splits hard links: the other names keep
//! the old ciphertext.

use super::backing;
use super::marker::{self, ContentState};
use super::xattr::AttributeStore;
use crate::crypto::{Cipher, Direction, Passphrase};
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Largest logical buffer a content operation will materialize
pub const MAX_LOGICAL_SIZE: u64 = 1 << 32;

/// Plaintext buffer for the duration of one operation
pub type LogicalBuffer = Zeroizing<Vec<u8>>;

fn too_big() -> Error {
    Error::Io(io::Error::from_raw_os_error(libc::EFBIG))
}

/// Bytes `[offset, offset + size)` of `buf`, clipped to its end
pub fn window(buf: &[u8], offset: u64, size: u32) -> &[u8] {
    let len = buf.len() as u64;
    let start = offset.min(len) as usize;
    let end = offset.saturating_add(u64::from(size)).min(len) as usize;
    &buf[start..end]
}

/// Overwrite `buf[offset..offset + data.len()]`, zero-filling any gap
pub fn splice(buf: &mut Vec<u8>, offset: u64, data: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(data.len() as u64)
        .filter(|&end| end <= MAX_LOGICAL_SIZE)
        .ok_or_else(too_big)?;
    let (start, end) = (offset as usize, end as usize);

    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[start..end].copy_from_slice(data);
    Ok(())
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("{:?} has no file name", path)))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(format!(".cmtmp-{:016x}", rand::random::<u64>()));
    Ok(path.with_file_name(tmp_name))
}

/// The decrypt/patch/encrypt protocol over one backing file
pub struct TransformEngine {
    cipher: Arc<dyn Cipher>,
    attrs: Arc<dyn AttributeStore>,
    atomic_writes: bool,
}

impl TransformEngine {
    pub fn new(cipher: Arc<dyn Cipher>, attrs: Arc<dyn AttributeStore>) -> Self {
        Self {
            cipher,
            attrs,
            atomic_writes: false,
        }
    }

    /// Commit rewrites through a temp file and rename
    pub fn with_atomic_writes(mut self, enabled: bool) -> Self {
        self.atomic_writes = enabled;
        self
    }

    pub fn attributes(&self) -> &dyn AttributeStore {
        self.attrs.as_ref()
    }

    pub fn cipher(&self) -> &dyn Cipher {
        self.cipher.as_ref()
    }

    fn seal(&self, plain: &[u8], passphrase: &Passphrase) -> Result<Vec<u8>> {
        Ok(self.cipher.transform(plain, Direction::Encrypt, passphrase)?)
    }

    /// Load the backing file and produce its logical content
    pub fn load(
        &self,
        path: &Path,
        state: ContentState,
        passphrase: &Passphrase,
    ) -> Result<LogicalBuffer> {
        let raw = fs::read(path)?;
        if raw.len() as u64 > MAX_LOGICAL_SIZE + crate::crypto::BLOB_OVERHEAD as u64 {
            return Err(too_big());
        }

        match state {
            // A zero-length encrypted file is logically empty
            ContentState::Encrypted if raw.is_empty() => Ok(Zeroizing::new(raw)),
            ContentState::Encrypted => {
                let plain = self.cipher.transform(&raw, Direction::Decrypt, passphrase)?;
                Ok(Zeroizing::new(plain))
            }
            ContentState::Plaintext | ContentState::Unmarked => Ok(Zeroizing::new(raw)),
        }
    }

    /// Logical length of a file whose backing length is `backing_len`
    pub fn logical_len(&self, state: ContentState, backing_len: u64) -> u64 {
        match state {
            ContentState::Encrypted if backing_len == 0 => 0,
            ContentState::Encrypted => self.cipher.plaintext_len(backing_len).unwrap_or(backing_len),
            _ => backing_len,
        }
    }

    /// Read `[offset, offset + size)` of the logical view.
    ///
    /// Offsets past the end yield an empty buffer.
    pub fn read(
        &self,
        path: &Path,
        state: ContentState,
        passphrase: &Passphrase,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        match state {
            ContentState::Encrypted => {
                let plain = self.load(path, state, passphrase)?;
                Ok(window(&plain, offset, size).to_vec())
            }
            ContentState::Plaintext | ContentState::Unmarked => backing::read_at(path, offset, size),
        }
    }

    /// Write `data` at `offset` of the logical view.
    ///
    /// Encrypted files are decrypted, patched, re-encrypted as a whole and
    /// rewritten. The cipher always runs before the backing file is opened
    /// for writing. Other files get a positioned write of the raw bytes.
    pub fn write(
        &self,
        path: &Path,
        state: ContentState,
        passphrase: &Passphrase,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        match state {
            ContentState::Encrypted => {
                let mut plain = self.load(path, state, passphrase)?;
                splice(&mut plain, offset, data)?;
                let sealed = self.seal(&plain, passphrase)?;
                self.commit(path, &sealed, None)?;
            }
            ContentState::Plaintext | ContentState::Unmarked => {
                backing::write_at(path, offset, data)?;
            }
        }

        Ok(data.len())
    }

    /// Write into an unmarked file by taking it under management: its raw
    /// bytes become the logical content, the patched buffer is encrypted and
    /// the file is marked encrypted.
    pub fn adopt(
        &self,
        path: &Path,
        passphrase: &Passphrase,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut plain = self.load(path, ContentState::Unmarked, passphrase)?;
        splice(&mut plain, offset, data)?;
        let sealed = self.seal(&plain, passphrase)?;
        self.commit(path, &sealed, Some(ContentState::Encrypted))?;

        debug!("adopted {:?} as encrypted", path);
        Ok(data.len())
    }

    /// Create (or truncate) `path` as an empty encrypted file.
    ///
    /// The marker is set only after the content write succeeded; if setting
    /// it fails the file is removed again.
    pub fn create(
        &self,
        path: &Path,
        mode: u32,
        exclusive: bool,
        passphrase: &Passphrase,
    ) -> Result<()> {
        let sealed = self.seal(&[], passphrase)?;

        let mut opts = OpenOptions::new();
        opts.write(true).mode(mode & 0o7777);
        if exclusive {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }

        let mut file = opts.open(path)?;
        file.write_all(&sealed)?;
        drop(file);

        if let Err(e) = marker::mark(self.attrs.as_ref(), path, ContentState::Encrypted) {
            warn!("Failed to mark {:?} encrypted, removing it: {}", path, e);
            let _ = fs::remove_file(path);
            return Err(e);
        }

        Ok(())
    }

    /// Change the logical length, zero-filling on growth
    pub fn truncate(
        &self,
        path: &Path,
        state: ContentState,
        passphrase: &Passphrase,
        size: u64,
    ) -> Result<()> {
        match state {
            ContentState::Encrypted => {
                if size > MAX_LOGICAL_SIZE {
                    return Err(too_big());
                }
                let mut plain = self.load(path, state, passphrase)?;
                plain.resize(size as usize, 0);
                let sealed = self.seal(&plain, passphrase)?;
                self.commit(path, &sealed, None)
            }
            ContentState::Plaintext | ContentState::Unmarked => backing::truncate(path, size),
        }
    }

    /// Rewrite a file in place so its bytes at rest match `target`.
    ///
    /// Returns the state the file was in before.
    pub fn convert(
        &self,
        path: &Path,
        passphrase: &Passphrase,
        target: ContentState,
    ) -> Result<ContentState> {
        let current = marker::classify(self.attrs.as_ref(), path)?;
        if current == target {
            return Ok(current);
        }

        let plain = self.load(path, current, passphrase)?;
        match target {
            ContentState::Encrypted => {
                let sealed = self.seal(&plain, passphrase)?;
                self.commit(path, &sealed, Some(target))?;
            }
            ContentState::Plaintext | ContentState::Unmarked => {
                if current == ContentState::Encrypted {
                    self.commit(path, &plain, Some(target))?;
                } else {
                    marker::mark(self.attrs.as_ref(), path, target)?;
                }
            }
        }

        Ok(current)
    }

    /// Replace the bytes of `path`, recording `state` if it changes.
    ///
    /// A state change always goes through the temp file so the marker is
    /// set before the new bytes become visible; a store that refuses the
    /// marker leaves the original file untouched.
    fn commit(&self, path: &Path, bytes: &[u8], state: Option<ContentState>) -> Result<()> {
        if self.atomic_writes || state.is_some() {
            return self.commit_atomic(path, bytes, state);
        }

        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Write `bytes` to a temp sibling and rename it over `path`.
    ///
    /// The rename gives `path` a new inode: other hard links to the old
    /// file keep its previous contents and marker.
    fn commit_atomic(&self, path: &Path, bytes: &[u8], state: Option<ContentState>) -> Result<()> {
        let perm = fs::metadata(path)?.permissions().mode() & 0o7777;
        let tmp = temp_sibling(path)?;

        let result = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            drop(file);
            fs::set_permissions(&tmp, fs::Permissions::from_mode(perm))?;

            self.copy_attributes(path, &tmp);
            if let Some(state) = state {
                marker::mark(self.attrs.as_ref(), &tmp, state)?;
            }

            fs::rename(&tmp, path)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.attrs.renamed(&tmp, path);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn copy_attributes(&self, from: &Path, to: &Path) {
        let names = match self.attrs.list(from) {
            Ok(names) => names,
            Err(e) => {
                debug!("not copying attributes of {:?}: {}", from, e);
                return;
            }
        };

        for name in names {
            let copied = self
                .attrs
                .get(from, &name)
                .and_then(|value| self.attrs.set(to, &name, &value, 0));
            if let Err(e) = copied {
                debug!("skipped attribute {:?} of {:?}: {}", name, from, e);
            }
        }
    }
}
