//! Pass-through with content encryption

use super::Operations;
use crate::config::{Config, UnmanagedWritePolicy};
use crate::context::MountContext;
use crate::crypto::{AeadCipher, Cipher};
use crate::error::{Error, Result};
use crate::fs::attr::{Attributes, NodeKind};
use crate::fs::backing;
use crate::fs::marker::{self, ContentState};
use crate::fs::transform::TransformEngine;
use crate::fs::xattr::{AttributeStore, XattrStore};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes content operations through the [`TransformEngine`] by marker
/// state. Everything else is inherited pass-through.
pub struct EncryptingOps {
    engine: TransformEngine,
    unmanaged_writes: UnmanagedWritePolicy,
}

impl EncryptingOps {
    pub fn new(cipher: Arc<dyn Cipher>, attrs: Arc<dyn AttributeStore>) -> Self {
        Self {
            engine: TransformEngine::new(cipher, attrs),
            unmanaged_writes: UnmanagedWritePolicy::default(),
        }
    }

    /// AES-GCM over the backing filesystem's extended attributes
    pub fn from_config(config: &Config) -> Self {
        let cipher = AeadCipher::new(config.encryption.clone());
        Self::new(Arc::new(cipher), Arc::new(XattrStore))
            .with_atomic_writes(config.mount.atomic_writes)
            .with_unmanaged_writes(config.mount.unmanaged_writes)
    }

    pub fn with_atomic_writes(mut self, enabled: bool) -> Self {
        self.engine = self.engine.with_atomic_writes(enabled);
        self
    }

    pub fn with_unmanaged_writes(mut self, policy: UnmanagedWritePolicy) -> Self {
        self.unmanaged_writes = policy;
        self
    }

    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }

    fn classify(&self, path: &Path) -> Result<ContentState> {
        marker::classify(self.engine.attributes(), path)
    }

    fn protect_marker(name: &OsStr, path: &Path) -> Result<()> {
        if marker::is_marker(name) {
            return Err(Error::PermissionDenied(format!(
                "{} is managed by the filesystem ({:?})",
                marker::MARKER_NAME,
                path
            )));
        }
        Ok(())
    }
}

impl Operations for EncryptingOps {
    fn attributes(&self) -> &dyn AttributeStore {
        self.engine.attributes()
    }

    fn transforms_content(&self) -> bool {
        true
    }

    fn getattr(&self, ctx: &MountContext, path: &Path) -> Result<Attributes> {
        let backing_path = ctx.resolve(path)?;
        let mut attrs = backing::getattr(&backing_path)?;

        if attrs.kind == NodeKind::RegularFile {
            match self.classify(&backing_path) {
                Ok(state) => attrs.size = self.engine.logical_len(state, attrs.size),
                Err(e) => debug!("keeping backing size of {:?}: {}", backing_path, e),
            }
        }
        Ok(attrs)
    }

    /// Regular files are created encrypted and exclusively
    fn mknod(&self, ctx: &MountContext, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        let backing_path = ctx.resolve(path)?;
        let kind = mode & libc::S_IFMT;

        if kind == libc::S_IFREG || kind == 0 {
            self.engine.create(&backing_path, mode, true, ctx.passphrase())
        } else {
            backing::mknod(&backing_path, mode, rdev)
        }
    }

    fn truncate(&self, ctx: &MountContext, path: &Path, size: u64) -> Result<()> {
        let backing_path = ctx.resolve(path)?;
        let state = self.classify(&backing_path)?;
        self.engine.truncate(&backing_path, state, ctx.passphrase(), size)
    }

    fn read(&self, ctx: &MountContext, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        let backing_path = ctx.resolve(path)?;
        let state = self.classify(&backing_path)?;
        self.engine
            .read(&backing_path, state, ctx.passphrase(), offset, size)
    }

    fn write(&self, ctx: &MountContext, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let backing_path = ctx.resolve(path)?;
        let state = self.classify(&backing_path)?;
        let passphrase = ctx.passphrase();

        match (state, self.unmanaged_writes) {
            (ContentState::Unmarked, UnmanagedWritePolicy::Adopt) => {
                self.engine.adopt(&backing_path, passphrase, offset, data)
            }
            (ContentState::Unmarked, UnmanagedWritePolicy::Refuse) => {
                warn!("refusing write to unmarked file {:?}", backing_path);
                Err(Error::PermissionDenied(format!(
                    "{:?} carries no content marker",
                    path
                )))
            }
            (state, _) => self
                .engine
                .write(&backing_path, state, passphrase, offset, data),
        }
    }

    fn create(&self, ctx: &MountContext, path: &Path, mode: u32, flags: i32) -> Result<()> {
        let backing_path = ctx.resolve(path)?;
        self.engine.create(
            &backing_path,
            mode,
            flags & libc::O_EXCL != 0,
            ctx.passphrase(),
        )
    }

    fn setxattr(
        &self,
        ctx: &MountContext,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        Self::protect_marker(name, path)?;
        self.attributes()
            .set(&ctx.resolve(path)?, name, value, flags)
            .map_err(super::surface_missing)
    }

    fn removexattr(&self, ctx: &MountContext, path: &Path, name: &OsStr) -> Result<()> {
        Self::protect_marker(name, path)?;
        self.attributes()
            .remove(&ctx.resolve(path)?, name)
            .map_err(super::surface_missing)
    }
}
