//! Mount context and bootstrap checks
//!
//! The context is built once before the dispatcher serves its first
//! request and is passed explicitly into every operation.

use crate::crypto::Passphrase;
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// Longest backing path the resolver will hand out
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Read-only state shared by every operation of one mount
#[derive(Debug, Clone)]
pub struct MountContext {
    backing_root: PathBuf,
    passphrase: Passphrase,
}

impl MountContext {
    /// Create a context over an existing directory.
    ///
    /// The root is canonicalized so resolved paths are absolute.
    pub fn new(backing_root: impl AsRef<Path>, passphrase: Passphrase) -> Result<Self> {
        let root = backing_root.as_ref();
        let backing_root = std::fs::canonicalize(root)
            .map_err(|e| Error::Config(format!("Cannot resolve root {:?}: {}", root, e)))?;

        if !backing_root.is_dir() {
            return Err(Error::Config(format!(
                "Root {:?} is not a directory",
                backing_root
            )));
        }

        Ok(Self {
            backing_root,
            passphrase,
        })
    }

    /// Startup entry point: refuses to run with superuser privileges, then
    /// resolves the root.
    pub fn bootstrap(backing_root: impl AsRef<Path>, passphrase: Passphrase) -> Result<Self> {
        ensure_unprivileged()?;

        if passphrase.is_empty() {
            return Err(Error::Config("Passphrase must not be empty".to_string()));
        }

        let ctx = Self::new(backing_root, passphrase)?;
        info!("Backing root: {:?}", ctx.backing_root);
        Ok(ctx)
    }

    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    pub fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    /// Map a virtual path to its backing path by plain concatenation with
    /// the root. No normalization is done.
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        let root = self.backing_root.as_os_str();
        let tail = virtual_path.as_os_str();

        if root.len() + tail.len() >= PATH_MAX {
            return Err(Error::PathTooLong(virtual_path.to_string_lossy().to_string()));
        }

        let mut full = OsString::with_capacity(root.len() + tail.len() + 1);
        full.push(root);
        if !tail.is_empty() && !virtual_path.has_root() {
            full.push("/");
        }
        full.push(tail);
        Ok(PathBuf::from(full))
    }
}

/// Fail if the process runs as root (real or effective uid 0)
pub fn ensure_unprivileged() -> Result<()> {
    if nix::unistd::getuid().is_root() || nix::unistd::geteuid().is_root() {
        return Err(Error::PermissionDenied(
            "running as root is not allowed".to_string(),
        ));
    }
    Ok(())
}
