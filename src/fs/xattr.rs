//! Per-file attribute stores
//!
//! [`XattrStore`] talks to the backing filesystem through the `l*xattr`
//! calls so symlinks are never followed. [`MemoryAttributeStore`] keeps
//! the same map in process memory for backing trees without xattr support
//! and for tests.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Associative per-file key/value store, addressed by backing path
pub trait AttributeStore: Send + Sync {
    /// Value of `name`; `Error::AttributeMissing` if it is not set
    fn get(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>>;

    fn set(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()>;

    fn list(&self, path: &Path) -> Result<Vec<OsString>>;

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()>;

    /// Called after `from` has been renamed to `to` in the backing store.
    /// Stores attached to the inode need nothing here.
    fn renamed(&self, _from: &Path, _to: &Path) {}
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("{:?} contains a NUL byte", path)))
}

fn c_name(name: &OsStr) -> Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("{:?} contains a NUL byte", name)))
}

fn xattr_error(name: &OsStr) -> Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENODATA) => Error::AttributeMissing(name.to_string_lossy().to_string()),
        _ => Error::Io(err),
    }
}

/// Extended attributes of the backing filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrStore;

impl AttributeStore for XattrStore {
    fn get(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let p = c_path(path)?;
        let n = c_name(name)?;

        loop {
            let size = unsafe { libc::lgetxattr(p.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
            if size < 0 {
                return Err(xattr_error(name));
            }

            let mut buf = vec![0u8; size as usize];
            let got = unsafe {
                libc::lgetxattr(p.as_ptr(), n.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            };
            if got < 0 {
                // Value grew between the two calls
                if io::Error::last_os_error().raw_os_error() == Some(libc::ERANGE) {
                    continue;
                }
                return Err(xattr_error(name));
            }

            buf.truncate(got as usize);
            return Ok(buf);
        }
    }

    fn set(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let p = c_path(path)?;
        let n = c_name(name)?;

        let res = unsafe {
            libc::lsetxattr(p.as_ptr(), n.as_ptr(), value.as_ptr().cast(), value.len(), flags)
        };
        if res < 0 {
            return Err(xattr_error(name));
        }
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<OsString>> {
        let p = c_path(path)?;

        let buf = loop {
            let size = unsafe { libc::llistxattr(p.as_ptr(), std::ptr::null_mut(), 0) };
            if size < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }

            let mut buf = vec![0u8; size as usize];
            let got = unsafe { libc::llistxattr(p.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if got < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ERANGE) {
                    continue;
                }
                return Err(Error::Io(err));
            }

            buf.truncate(got as usize);
            break buf;
        };

        Ok(buf
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| OsString::from_vec(name.to_vec()))
            .collect())
    }

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        let p = c_path(path)?;
        let n = c_name(name)?;

        let res = unsafe { libc::lremovexattr(p.as_ptr(), n.as_ptr()) };
        if res < 0 {
            return Err(xattr_error(name));
        }
        Ok(())
    }
}

/// In-memory attribute store keyed by backing path
#[derive(Debug, Default)]
pub struct MemoryAttributeStore {
    entries: RwLock<HashMap<PathBuf, BTreeMap<OsString, Vec<u8>>>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn get(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        self.entries
            .read()
            .get(path)
            .and_then(|attrs| attrs.get(name))
            .cloned()
            .ok_or_else(|| Error::AttributeMissing(name.to_string_lossy().to_string()))
    }

    fn set(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let mut entries = self.entries.write();
        let attrs = entries.entry(path.to_path_buf()).or_default();
        let exists = attrs.contains_key(name);

        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EEXIST)));
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(Error::AttributeMissing(name.to_string_lossy().to_string()));
        }

        attrs.insert(name.to_os_string(), value.to_vec());
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<OsString>> {
        Ok(self
            .entries
            .read()
            .get(path)
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        self.entries
            .write()
            .get_mut(path)
            .and_then(|attrs| attrs.remove(name))
            .map(|_| ())
            .ok_or_else(|| Error::AttributeMissing(name.to_string_lossy().to_string()))
    }

    fn renamed(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.write();
        entries.remove(to);

        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(attrs) = entries.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                entries.insert(new, attrs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/backing/file");

        assert!(matches!(
            store.get(path, name("user.a")),
            Err(Error::AttributeMissing(_))
        ));

        store.set(path, name("user.a"), b"1", 0).unwrap();
        store.set(path, name("user.b"), b"2", 0).unwrap();
        assert_eq!(store.get(path, name("user.a")).unwrap(), b"1");
        assert_eq!(store.list(path).unwrap(), vec![OsString::from("user.a"), OsString::from("user.b")]);

        store.remove(path, name("user.a")).unwrap();
        assert!(store.remove(path, name("user.a")).is_err());
        assert_eq!(store.list(path).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_create_replace_flags() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/f");

        assert!(store.set(path, name("user.x"), b"v", libc::XATTR_REPLACE).is_err());
        store.set(path, name("user.x"), b"v", libc::XATTR_CREATE).unwrap();
        let err = store.set(path, name("user.x"), b"w", libc::XATTR_CREATE).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_memory_store_follows_rename() {
        let store = MemoryAttributeStore::new();
        store.set(Path::new("/d/f"), name("user.x"), b"v", 0).unwrap();
        store.set(Path::new("/other"), name("user.y"), b"w", 0).unwrap();

        store.renamed(Path::new("/d"), Path::new("/e"));

        assert_eq!(store.get(Path::new("/e/f"), name("user.x")).unwrap(), b"v");
        assert!(store.get(Path::new("/d/f"), name("user.x")).is_err());
        assert!(store.get(Path::new("/other"), name("user.y")).is_ok());
    }

    #[test]
    fn test_xattr_store_on_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"data").unwrap();
        let store = XattrStore;

        // Not every filesystem that hosts temp dirs supports user xattrs
        if let Err(e) = store.set(&file, name("user.cryptmirror.test"), b"true", 0) {
            let errno = e.errno();
            assert!(errno == libc::ENOTSUP || errno == libc::EOPNOTSUPP || errno == libc::EPERM);
            return;
        }

        assert_eq!(store.get(&file, name("user.cryptmirror.test")).unwrap(), b"true");
        assert!(store
            .list(&file)
            .unwrap()
            .contains(&OsString::from("user.cryptmirror.test")));

        store.remove(&file, name("user.cryptmirror.test")).unwrap();
        assert!(matches!(
            store.get(&file, name("user.cryptmirror.test")),
            Err(Error::AttributeMissing(_))
        ));
    }
}
