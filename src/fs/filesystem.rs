//! FUSE filesystem
//!
//! Translates inode-addressed kernel requests into path-addressed calls on
//! an [`Operations`] set. No file handles are kept: every request resolves
//! its path again and the operation set does the rest.

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::attr::{NodeKind, Timestamp};
use super::inode::{InodeTable, ROOT_INO};
use super::ops::Operations;
use crate::context::MountContext;
use crate::error::{Error, Result};

const TTL: Duration = Duration::from_secs(1);

/// Log a failed request and produce its errno
fn failure(op: &str, path: &Path, e: &Error) -> libc::c_int {
    let errno = e.errno();
    if e.is_crypto() {
        warn!("{} {:?}: {}", op, path, e);
    } else {
        debug!("{} {:?} failed: {}", op, path, e);
    }
    errno
}

/// Size-probe protocol shared by getxattr and listxattr
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

/// Passthrough FUSE filesystem over a backing directory
pub struct CryptFs {
    ctx: MountContext,
    ops: Box<dyn Operations>,
    inodes: InodeTable,
}

impl CryptFs {
    pub fn new(ctx: MountContext, ops: Box<dyn Operations>) -> Self {
        Self {
            ctx,
            ops,
            inodes: InodeTable::new(),
        }
    }

    pub fn context(&self) -> &MountContext {
        &self.ctx
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or_else(|| Error::NotFound(format!("inode {}", parent)))
    }

    /// Attributes for an entry reply; counts one kernel lookup of `path`
    fn entry_attr(&self, path: &Path) -> Result<FileAttr> {
        let attrs = self.ops.getattr(&self.ctx, path)?;
        let ino = self.inodes.lookup(path);
        Ok(attrs.to_fuser_attr(ino))
    }

    fn current_attr(&self, path: &Path) -> Result<FileAttr> {
        let attrs = self.ops.getattr(&self.ctx, path)?;
        let ino = self.inodes.lookup_or_insert(path);
        Ok(attrs.to_fuser_attr(ino))
    }

    fn open_flags(&self) -> u32 {
        // Page cache would hold plaintext sized by the logical view
        if self.ops.transforms_content() {
            fuser::consts::FOPEN_DIRECT_IO
        } else {
            0
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr> {
        if let Some(mode) = mode {
            self.ops.chmod(&self.ctx, path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.ops.chown(&self.ctx, path, uid, gid)?;
        }
        if let Some(size) = size {
            self.ops.truncate(&self.ctx, path, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.ops
                .utimens(&self.ctx, path, Timestamp::from(atime), Timestamp::from(mtime))?;
        }
        self.current_attr(path)
    }
}

impl Filesystem for CryptFs {
    fn destroy(&mut self) {
        debug!(
            "unmounting {:?} ({} inodes known)",
            self.ctx.backing_root(),
            self.inodes.len()
        );
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let result = self
            .child_of(parent, name)
            .and_then(|path| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(failure("lookup", Path::new(name), &e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.getattr(&self.ctx, &path));
        match result {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(e) => reply.error(failure("getattr", Path::new(""), &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.apply_setattr(&path, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(failure("setattr", &path, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.readlink(&self.ctx, &path));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(failure("readlink", Path::new(""), &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let result = self
            .ops
            .mknod(&self.ctx, &path, mode, rdev)
            .and_then(|()| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(failure("mknod", &path, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let result = self
            .ops
            .mkdir(&self.ctx, &path, mode)
            .and_then(|()| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(failure("mkdir", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.unlink(&self.ctx, &path) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(failure("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.rmdir(&self.ctx, &path) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(failure("rmdir", &path, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let path = match self.child_of(parent, link_name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let result = self
            .ops
            .symlink(&self.ctx, target, &path)
            .and_then(|()| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(failure("symlink", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        let paths = self
            .child_of(parent, name)
            .and_then(|from| Ok((from, self.child_of(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.rename(&self.ctx, &from, &to, flags) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(failure("rename", &from, &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let paths = self
            .path_of(ino)
            .and_then(|from| Ok((from, self.child_of(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let result = self
            .ops
            .link(&self.ctx, &from, &to)
            .and_then(|()| self.entry_attr(&to));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(failure("link", &to, &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.open(&self.ctx, &path, flags) {
            Ok(()) => reply.opened(0, self.open_flags()),
            Err(e) => reply.error(failure("open", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);

        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.read(&self.ctx, &path, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(failure("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, offset={}, len={})", ino, offset, data.len());

        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.ops.write(&self.ctx, &path, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(failure("write", &path, &e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.release(&self.ctx, &path));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.fsync(&self.ctx, &path, datasync));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.getattr(&self.ctx, &path));
        match result {
            Ok(attrs) if attrs.kind == NodeKind::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let listing = match self.ops.readdir(&self.ctx, &path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(failure("readdir", &path, &e)),
        };

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.ino(p))
            .unwrap_or(ROOT_INO);

        let mut entries = vec![
            (ino, NodeKind::Directory, OsStr::new(".").to_os_string()),
            (parent_ino, NodeKind::Directory, OsStr::new("..").to_os_string()),
        ];
        entries.extend(listing.into_iter().map(|e| (e.ino, e.kind, e.name)));

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.ops.statfs(&self.ctx, &path) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(failure("statfs", &path, &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);

        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.setxattr(&self.ctx, &path, name, value, flags));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failure("setxattr", Path::new(name), &e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.getxattr(&self.ctx, &path, name));
        match result {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.listxattr(&self.ctx, &path));
        match result {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                reply_xattr(reply, size, &buf);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.removexattr(&self.ctx, &path, name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(failure("removexattr", Path::new(name), &e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.access(&self.ctx, &path, mask));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let result = self
            .ops
            .create(&self.ctx, &path, mode, flags)
            .and_then(|()| self.entry_attr(&path));
        match result {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, self.open_flags()),
            Err(e) => reply.error(failure("create", &path, &e)),
        }
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

    fn mount(ops: Box<dyn Operations>) -> (tempfile::TempDir, CryptFs) {
        let dir = tempdir().unwrap();
        let ctx = MountContext::new(dir.path(), Passphrase::from("fs test")).unwrap();
        (dir, CryptFs::new(ctx, ops))
    }

    #[test]
    fn test_entry_attr_registers_inode() {
        let (dir, fs) = mount(Box::new(PassthroughOps::new(Arc::new(
            MemoryAttributeStore::new(),
        ))));
        std::fs::write(dir.path().join("a"), b"abc").unwrap();

        let path = fs.child_of(ROOT_INO, OsStr::new("a")).unwrap();
        let attr = fs.entry_attr(&path).unwrap();

        assert_eq!(attr.size, 3);
        assert_eq!(fs.path_of(attr.ino).unwrap(), PathBuf::from("/a"));
        assert_eq!(fs.entry_attr(&path).unwrap().ino, attr.ino);
        assert_eq!(fs.path_of(12345).unwrap_err().errno(), libc::ENOENT);
    }

    #[test]
    fn test_only_entry_replies_count_lookups() {
        let (dir, fs) = mount(Box::new(PassthroughOps::new(Arc::new(
            MemoryAttributeStore::new(),
        ))));
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let path = PathBuf::from("/a");

        let ino = fs.entry_attr(&path).unwrap().ino;
        fs.apply_setattr(&path, Some(0o600), None, None, None, None, None)
            .unwrap();

        fs.inodes.forget(ino, 1);
        assert_eq!(fs.path_of(ino).unwrap_err().errno(), libc::ENOENT);
        assert_eq!(fs.inodes.len(), 1);
    }

    #[test]
    fn test_direct_io_only_when_transforming() {
        let (_dir, plain) = mount(Box::new(PassthroughOps::default()));
        assert_eq!(plain.open_flags(), 0);

        let ops = EncryptingOps::new(Arc::new(test_cipher()), Arc::new(MemoryAttributeStore::new()));
        let (_dir, encrypted) = mount(Box::new(ops));
        assert_eq!(encrypted.open_flags(), fuser::consts::FOPEN_DIRECT_IO);
    }

    #[test]
    fn test_setattr_truncates_logical_size() {
        let ops = EncryptingOps::new(Arc::new(test_cipher()), Arc::new(MemoryAttributeStore::new()));
        let (dir, fs) = mount(Box::new(ops));
        let path = PathBuf::from("/f");

        fs.ops.create(&fs.ctx, &path, 0o644, 0).unwrap();
        fs.ops.write(&fs.ctx, &path, 0, b"0123456789").unwrap();

        let attr = fs
            .apply_setattr(&path, Some(0o600), None, None, Some(4), None, None)
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(attr.perm, 0o600);
        assert!(std::fs::metadata(dir.path().join("f")).unwrap().len() > 4);
    }
}
