//! Operation audit trail
//!
//! Wraps another operation set, records every call with its outcome and
//! emits it on the `cryptmirror::audit` tracing target.

use super::Operations;
use crate::context::MountContext;
use crate::error::Result;
use crate::fs::attr::{Attributes, DirEntry, FsStats, Timestamp};
use crate::fs::xattr::AttributeStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::info;

/// Records kept in memory before the oldest are dropped
pub const AUDIT_HISTORY: usize = 4096;

/// One dispatched operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub op: &'static str,
    pub path: PathBuf,
    /// `None` on success
    pub errno: Option<i32>,
}

pub struct AuditOps {
    inner: Box<dyn Operations>,
    history: Mutex<VecDeque<AuditRecord>>,
}

impl AuditOps {
    pub fn new(inner: Box<dyn Operations>) -> Self {
        Self {
            inner,
            history: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    /// Most recent records, oldest first
    pub fn records(&self) -> Vec<AuditRecord> {
        self.history.lock().iter().cloned().collect()
    }

    fn record<T>(&self, op: &'static str, path: &Path, result: Result<T>) -> Result<T> {
        let errno = result.as_ref().err().map(|e| e.errno());
        match errno {
            None => info!(target: "cryptmirror::audit", op, path = ?path, "ok"),
            Some(errno) => info!(target: "cryptmirror::audit", op, path = ?path, errno, "failed"),
        }

        let mut history = self.history.lock();
        if history.len() == AUDIT_HISTORY {
            history.pop_front();
        }
        history.push_back(AuditRecord {
            op,
            path: path.to_path_buf(),
            errno,
        });
        result
    }
}

impl Operations for AuditOps {
    fn attributes(&self) -> &dyn AttributeStore {
        self.inner.attributes()
    }

    fn transforms_content(&self) -> bool {
        self.inner.transforms_content()
    }

    fn getattr(&self, ctx: &MountContext, path: &Path) -> Result<Attributes> {
        self.record("getattr", path, self.inner.getattr(ctx, path))
    }

    fn access(&self, ctx: &MountContext, path: &Path, mask: i32) -> Result<()> {
        self.record("access", path, self.inner.access(ctx, path, mask))
    }

    fn readlink(&self, ctx: &MountContext, path: &Path) -> Result<PathBuf> {
        self.record("readlink", path, self.inner.readlink(ctx, path))
    }

    fn readdir(&self, ctx: &MountContext, path: &Path) -> Result<Vec<DirEntry>> {
        self.record("readdir", path, self.inner.readdir(ctx, path))
    }

    fn mknod(&self, ctx: &MountContext, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        self.record("mknod", path, self.inner.mknod(ctx, path, mode, rdev))
    }

    fn mkdir(&self, ctx: &MountContext, path: &Path, mode: u32) -> Result<()> {
        self.record("mkdir", path, self.inner.mkdir(ctx, path, mode))
    }

    fn unlink(&self, ctx: &MountContext, path: &Path) -> Result<()> {
        self.record("unlink", path, self.inner.unlink(ctx, path))
    }

    fn rmdir(&self, ctx: &MountContext, path: &Path) -> Result<()> {
        self.record("rmdir", path, self.inner.rmdir(ctx, path))
    }

    fn symlink(&self, ctx: &MountContext, target: &Path, link: &Path) -> Result<()> {
        self.record("symlink", link, self.inner.symlink(ctx, target, link))
    }

    fn rename(&self, ctx: &MountContext, from: &Path, to: &Path, flags: u32) -> Result<()> {
        self.record("rename", from, self.inner.rename(ctx, from, to, flags))
    }

    fn link(&self, ctx: &MountContext, from: &Path, to: &Path) -> Result<()> {
        self.record("link", to, self.inner.link(ctx, from, to))
    }

    fn chmod(&self, ctx: &MountContext, path: &Path, mode: u32) -> Result<()> {
        self.record("chmod", path, self.inner.chmod(ctx, path, mode))
    }

    fn chown(&self, ctx: &MountContext, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.record("chown", path, self.inner.chown(ctx, path, uid, gid))
    }

    fn truncate(&self, ctx: &MountContext, path: &Path, size: u64) -> Result<()> {
        self.record("truncate", path, self.inner.truncate(ctx, path, size))
    }

    fn utimens(&self, ctx: &MountContext, path: &Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
        self.record("utimens", path, self.inner.utimens(ctx, path, atime, mtime))
    }

    fn open(&self, ctx: &MountContext, path: &Path, flags: i32) -> Result<()> {
        self.record("open", path, self.inner.open(ctx, path, flags))
    }

    fn read(&self, ctx: &MountContext, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.record("read", path, self.inner.read(ctx, path, offset, size))
    }

    fn write(&self, ctx: &MountContext, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        self.record("write", path, self.inner.write(ctx, path, offset, data))
    }

    fn statfs(&self, ctx: &MountContext, path: &Path) -> Result<FsStats> {
        self.record("statfs", path, self.inner.statfs(ctx, path))
    }

    fn create(&self, ctx: &MountContext, path: &Path, mode: u32, flags: i32) -> Result<()> {
        self.record("create", path, self.inner.create(ctx, path, mode, flags))
    }

    fn release(&self, ctx: &MountContext, path: &Path) -> Result<()> {
        self.record("release", path, self.inner.release(ctx, path))
    }

    fn fsync(&self, ctx: &MountContext, path: &Path, datasync: bool) -> Result<()> {
        self.record("fsync", path, self.inner.fsync(ctx, path, datasync))
    }

    fn setxattr(
        &self,
        ctx: &MountContext,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        self.record("setxattr", path, self.inner.setxattr(ctx, path, name, value, flags))
    }

    fn getxattr(&self, ctx: &MountContext, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        self.record("getxattr", path, self.inner.getxattr(ctx, path, name))
    }

    fn listxattr(&self, ctx: &MountContext, path: &Path) -> Result<Vec<OsString>> {
        self.record("listxattr", path, self.inner.listxattr(ctx, path))
    }

    fn removexattr(&self, ctx: &MountContext, path: &Path, name: &OsStr) -> Result<()> {
        self.record("removexattr", path, self.inner.removexattr(ctx, path, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Passphrase;
    use crate::fs::ops::{EncryptingOps, PassthroughOps};
    use crate::fs::testing::test_cipher;
    use crate::fs::xattr::MemoryAttributeStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_records_outcomes_in_order() {
        let dir = tempdir().unwrap();
        let ctx = MountContext::new(dir.path(), Passphrase::from("p")).unwrap();
        let ops = AuditOps::new(Box::new(PassthroughOps::new(Arc::new(
            MemoryAttributeStore::new(),
        ))));

        ops.create(&ctx, Path::new("/a"), 0o644, 0).unwrap();
        ops.write(&ctx, Path::new("/a"), 0, b"x").unwrap();
        assert!(ops.getattr(&ctx, Path::new("/missing")).is_err());

        let records = ops.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, "create");
        assert_eq!(records[1].op, "write");
        assert_eq!(records[1].errno, None);
        assert_eq!(records[2].path, PathBuf::from("/missing"));
        assert_eq!(records[2].errno, Some(libc::ENOENT));
    }

    #[test]
    fn test_delegates_content_transform() {
        let dir = tempdir().unwrap();
        let ctx = MountContext::new(dir.path(), Passphrase::from("p")).unwrap();
        let inner = EncryptingOps::new(Arc::new(test_cipher()), Arc::new(MemoryAttributeStore::new()));
        let ops = AuditOps::new(Box::new(inner));

        assert!(ops.transforms_content());
        ops.create(&ctx, Path::new("/s"), 0o600, libc::O_EXCL).unwrap();
        ops.write(&ctx, Path::new("/s"), 0, b"hidden").unwrap();

        assert_ne!(std::fs::read(dir.path().join("s")).unwrap(), b"hidden");
        assert_eq!(ops.read(&ctx, Path::new("/s"), 0, 16).unwrap(), b"hidden");
    }

    #[test]
    fn test_history_is_bounded() {
        let dir = tempdir().unwrap();
        let ctx = MountContext::new(dir.path(), Passphrase::from("p")).unwrap();
        let ops = AuditOps::new(Box::new(PassthroughOps::default()));

        for _ in 0..AUDIT_HISTORY + 10 {
            ops.release(&ctx, Path::new("/")).unwrap();
        }
        assert_eq!(ops.records().len(), AUDIT_HISTORY);
    }
}
