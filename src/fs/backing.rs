//! Backing store pass-through
//!
//! Direct system calls against already-resolved backing paths. Nothing here
//! looks at file contents beyond positioned reads and writes.

use super::attr::{Attributes, DirEntry, FsStats, NodeKind, Timestamp};
use crate::error::{Error, Result};
use nix::sys::stat::{utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Open flags handled by the dispatcher itself rather than passed to open(2)
const STRIPPED_OPEN_FLAGS: i32 = libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

/// lstat
pub fn getattr(path: &Path) -> Result<Attributes> {
    let meta = fs::symlink_metadata(path)?;
    Ok(Attributes::from_metadata(&meta))
}

pub fn access(path: &Path, mask: i32) -> Result<()> {
    nix::unistd::access(path, AccessFlags::from_bits_truncate(mask))?;
    Ok(())
}

pub fn readlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Directory entries, excluding `.` and `..`
pub fn readdir(path: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        entries.push(DirEntry {
            name: entry.file_name(),
            kind: NodeKind::from(file_type),
            ino: entry.ino(),
        });
    }

    Ok(entries)
}

pub fn mknod(path: &Path, mode: u32, rdev: u32) -> Result<()> {
    let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
    let perm = Mode::from_bits_truncate(mode & 0o7777);

    if kind == SFlag::S_IFREG || kind.is_empty() {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(path)?;
    } else if kind == SFlag::S_IFIFO {
        nix::unistd::mkfifo(path, perm)?;
    } else {
        nix::sys::stat::mknod(path, kind, perm, libc::dev_t::from(rdev))?;
    }
    Ok(())
}

pub fn mkdir(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new().mode(mode & 0o7777).create(path)?;
    Ok(())
}

pub fn unlink(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    Ok(())
}

pub fn rmdir(path: &Path) -> Result<()> {
    fs::remove_dir(path)?;
    Ok(())
}

/// Create `link` pointing at `target` (target is stored verbatim)
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

pub fn rename(from: &Path, to: &Path, flags: u32) -> Result<()> {
    if flags != 0 {
        return Err(Error::InvalidArgument(format!(
            "rename flags {:#x} not supported",
            flags
        )));
    }
    fs::rename(from, to)?;
    Ok(())
}

pub fn link(from: &Path, to: &Path) -> Result<()> {
    fs::hard_link(from, to)?;
    Ok(())
}

pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

pub fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    std::os::unix::fs::lchown(path, uid, gid)?;
    Ok(())
}

pub fn truncate(path: &Path, size: u64) -> Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(size)?;
    Ok(())
}

fn to_timespec(t: Timestamp) -> Result<TimeSpec> {
    match t {
        Timestamp::Omit => Ok(TimeSpec::UTIME_OMIT),
        Timestamp::Now => Ok(TimeSpec::UTIME_NOW),
        Timestamp::At(at) => at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(TimeSpec::from_duration)
            .map_err(|_| Error::InvalidArgument("timestamp before 1970".to_string())),
    }
}

/// Set access/modification times without following symlinks
pub fn utimens(path: &Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
    utimensat(
        None,
        path,
        &to_timespec(atime)?,
        &to_timespec(mtime)?,
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Check that `path` opens with the access mode in `flags`, then close it
pub fn open(path: &Path, flags: i32) -> Result<()> {
    let accmode = flags & libc::O_ACCMODE;
    OpenOptions::new()
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .custom_flags(flags & !STRIPPED_OPEN_FLAGS)
        .open(path)?;
    Ok(())
}

/// Create or truncate a regular file with `mode`
pub fn create(path: &Path, mode: u32, exclusive: bool) -> Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).mode(mode & 0o7777);
    if exclusive {
        opts.create_new(true);
    } else {
        opts.create(true).truncate(true);
    }
    opts.open(path)?;
    Ok(())
}

/// Positioned read that keeps going until `size` bytes or end of file
pub fn read_at(path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;

    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset.saturating_add(filled as u64)) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

pub fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.write_all_at(data, offset)?;
    Ok(data.len())
}

pub fn statfs(path: &Path) -> Result<FsStats> {
    let st = nix::sys::statvfs::statvfs(path)?;
    Ok(FsStats {
        blocks: st.blocks() as u64,
        bfree: st.blocks_free() as u64,
        bavail: st.blocks_available() as u64,
        files: st.files() as u64,
        ffree: st.files_free() as u64,
        bsize: st.block_size() as u32,
        namelen: st.name_max() as u32,
        frsize: st.fragment_size() as u32,
    })
}
