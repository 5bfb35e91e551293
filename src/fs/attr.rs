//! Attribute, directory entry and statfs values returned by the dispatcher

use std::ffi::OsString;
use std::time::{Duration, SystemTime};

/// File type of a backing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;

        if ft.is_file() {
            NodeKind::RegularFile
        } else if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else if ft.is_socket() {
            NodeKind::Socket
        } else {
            NodeKind::RegularFile
        }
    }
}

impl NodeKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            NodeKind::RegularFile => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::Symlink => fuser::FileType::Symlink,
            NodeKind::BlockDevice => fuser::FileType::BlockDevice,
            NodeKind::CharDevice => fuser::FileType::CharDevice,
            NodeKind::Fifo => fuser::FileType::NamedPipe,
            NodeKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Attributes of a backing entry as presented to callers
#[derive(Debug, Clone)]
pub struct Attributes {
    pub kind: NodeKind,
    /// Logical size (plaintext length for encrypted files)
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

fn epoch_plus(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

impl Attributes {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            kind: NodeKind::from(meta.file_type()),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: epoch_plus(meta.atime(), meta.atime_nsec()),
            mtime: epoch_plus(meta.mtime(), meta.mtime_nsec()),
            ctime: epoch_plus(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }

    /// Convert to fuser FileAttr under the given virtual inode
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

/// Directory entry from the backing store
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: NodeKind,
    /// Inode number in the backing filesystem
    pub ino: u64,
}

/// Filesystem statistics of the backing store
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Timestamp argument to `utimens`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Leave unchanged
    Omit,
    Now,
    At(SystemTime),
}

impl From<Option<fuser::TimeOrNow>> for Timestamp {
    fn from(t: Option<fuser::TimeOrNow>) -> Self {
        match t {
            None => Timestamp::Omit,
            Some(fuser::TimeOrNow::Now) => Timestamp::Now,
            Some(fuser::TimeOrNow::SpecificTime(at)) => Timestamp::At(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_kind_from_metadata() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"abc").unwrap();
        std::os::unix::fs::symlink(&file, dir.path().join("l")).unwrap();

        let attrs = Attributes::from_metadata(&std::fs::metadata(&file).unwrap());
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(attrs.size, 3);

        let dir_attrs = Attributes::from_metadata(&std::fs::metadata(dir.path()).unwrap());
        assert_eq!(dir_attrs.kind, NodeKind::Directory);

        let link = std::fs::symlink_metadata(dir.path().join("l")).unwrap();
        assert_eq!(Attributes::from_metadata(&link).kind, NodeKind::Symlink);
    }

    #[test]
    fn test_fuser_attr_uses_virtual_ino() {
        let dir = tempdir().unwrap();
        let attrs = Attributes::from_metadata(&std::fs::metadata(dir.path()).unwrap());
        let fattr = attrs.to_fuser_attr(42);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.kind, fuser::FileType::Directory);
    }

    #[test]
    fn test_epoch_plus_negative() {
        assert!(epoch_plus(-10, 0) < SystemTime::UNIX_EPOCH);
        assert_eq!(epoch_plus(0, 0), SystemTime::UNIX_EPOCH);
    }
}
