//! Operation dispatcher
//!
//! [`Operations`] is the abstract operation set served to the kernel-facing
//! layer. Every method takes the mount context explicitly and a virtual
//! path. The provided methods are straight pass-through to the backing
//! store; variants override only what they change.

mod audit;
mod encrypting;

pub use audit::{AuditOps, AuditRecord};
pub use encrypting::EncryptingOps;

use super::attr::{Attributes, DirEntry, FsStats, Timestamp};
use super::backing;
use super::xattr::{AttributeStore, XattrStore};
use crate::context::MountContext;
use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Abstract filesystem operation set
pub trait Operations: Send + Sync {
    /// Store backing the extended attribute operations
    fn attributes(&self) -> &dyn AttributeStore;

    /// True if read and write go through a content transform
    fn transforms_content(&self) -> bool {
        false
    }

    fn getattr(&self, ctx: &MountContext, path: &Path) -> Result<Attributes> {
        backing::getattr(&ctx.resolve(path)?)
    }

    fn access(&self, ctx: &MountContext, path: &Path, mask: i32) -> Result<()> {
        backing::access(&ctx.resolve(path)?, mask)
    }

    fn readlink(&self, ctx: &MountContext, path: &Path) -> Result<PathBuf> {
        backing::readlink(&ctx.resolve(path)?)
    }

    fn readdir(&self, ctx: &MountContext, path: &Path) -> Result<Vec<DirEntry>> {
        backing::readdir(&ctx.resolve(path)?)
    }

    fn mknod(&self, ctx: &MountContext, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        backing::mknod(&ctx.resolve(path)?, mode, rdev)
    }

    fn mkdir(&self, ctx: &MountContext, path: &Path, mode: u32) -> Result<()> {
        backing::mkdir(&ctx.resolve(path)?, mode)
    }

    fn unlink(&self, ctx: &MountContext, path: &Path) -> Result<()> {
        backing::unlink(&ctx.resolve(path)?)
    }

    fn rmdir(&self, ctx: &MountContext, path: &Path) -> Result<()> {
        backing::rmdir(&ctx.resolve(path)?)
    }

    /// Create symlink `link` (virtual) whose target is stored verbatim
    fn symlink(&self, ctx: &MountContext, target: &Path, link: &Path) -> Result<()> {
        backing::symlink(target, &ctx.resolve(link)?)
    }

    fn rename(&self, ctx: &MountContext, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let (from, to) = (ctx.resolve(from)?, ctx.resolve(to)?);
        backing::rename(&from, &to, flags)?;
        self.attributes().renamed(&from, &to);
        Ok(())
    }

    fn link(&self, ctx: &MountContext, from: &Path, to: &Path) -> Result<()> {
        backing::link(&ctx.resolve(from)?, &ctx.resolve(to)?)
    }

    fn chmod(&self, ctx: &MountContext, path: &Path, mode: u32) -> Result<()> {
        backing::chmod(&ctx.resolve(path)?, mode)
    }

    fn chown(&self, ctx: &MountContext, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        backing::chown(&ctx.resolve(path)?, uid, gid)
    }

    fn truncate(&self, ctx: &MountContext, path: &Path, size: u64) -> Result<()> {
        backing::truncate(&ctx.resolve(path)?, size)
    }

    fn utimens(&self, ctx: &MountContext, path: &Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        backing::utimens(&ctx.resolve(path)?, atime, mtime)
    }

    /// Verify the file opens with the requested access mode. No handle is
    /// kept; `O_TRUNC` is applied through [`Operations::truncate`].
    fn open(&self, ctx: &MountContext, path: &Path, flags: i32) -> Result<()> {
        backing::open(&ctx.resolve(path)?, flags)?;
        if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.truncate(ctx, path, 0)?;
        }
        Ok(())
    }

    fn read(&self, ctx: &MountContext, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        backing::read_at(&ctx.resolve(path)?, offset, size)
    }

    fn write(&self, ctx: &MountContext, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        backing::write_at(&ctx.resolve(path)?, offset, data)
    }

    fn statfs(&self, ctx: &MountContext, path: &Path) -> Result<FsStats> {
        backing::statfs(&ctx.resolve(path)?)
    }

    fn create(&self, ctx: &MountContext, path: &Path, mode: u32, flags: i32) -> Result<()> {
        backing::create(&ctx.resolve(path)?, mode, flags & libc::O_EXCL != 0)
    }

    /// No handle is retained, so there is nothing to release
    fn release(&self, _ctx: &MountContext, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Every write is already committed when it returns
    fn fsync(&self, _ctx: &MountContext, _path: &Path, _datasync: bool) -> Result<()> {
        Ok(())
    }

    fn setxattr(
        &self,
        ctx: &MountContext,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        self.attributes()
            .set(&ctx.resolve(path)?, name, value, flags)
            .map_err(surface_missing)
    }

    fn getxattr(&self, ctx: &MountContext, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        self.attributes()
            .get(&ctx.resolve(path)?, name)
            .map_err(surface_missing)
    }

    fn listxattr(&self, ctx: &MountContext, path: &Path) -> Result<Vec<OsString>> {
        self.attributes().list(&ctx.resolve(path)?)
    }

    fn removexattr(&self, ctx: &MountContext, path: &Path, name: &OsStr) -> Result<()> {
        self.attributes()
            .remove(&ctx.resolve(path)?, name)
            .map_err(surface_missing)
    }
}

/// Report a missing attribute to callers as the plain storage error
pub(crate) fn surface_missing(e: Error) -> Error {
    match e {
        Error::AttributeMissing(_) => Error::Io(io::Error::from_raw_os_error(libc::ENODATA)),
        other => other,
    }
}

/// Pure pass-through: no content transform at all
pub struct PassthroughOps {
    attrs: Arc<dyn AttributeStore>,
}

impl PassthroughOps {
    pub fn new(attrs: Arc<dyn AttributeStore>) -> Self {
        Self { attrs }
    }
}

impl Default for PassthroughOps {
    fn default() -> Self {
        Self::new(Arc::new(XattrStore))
    }
}

impl Operations for PassthroughOps {
    fn attributes(&self) -> &dyn AttributeStore {
        self.attrs.as_ref()
    }
}
