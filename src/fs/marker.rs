//! Content marker oracle
//!
//! Classifies a backing file by its `user.encrypted` attribute. The
//! classification is recomputed on every content operation.

use super::xattr::AttributeStore;
use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::Path;

/// Name of the content marker attribute
pub const MARKER_NAME: &str = "user.encrypted";

/// Marker value for ciphertext at rest
pub const ENCRYPTED_VALUE: &[u8] = b"true";

/// Marker value for plaintext at rest
pub const PLAINTEXT_VALUE: &[u8] = b"false";

/// Longest marker value the oracle will read
pub const MARKER_PROBE_LEN: usize = 8;

/// What the bytes at rest are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Encrypted,
    Plaintext,
    /// No marker: the file bypassed the adapter
    Unmarked,
}

impl ContentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentState::Encrypted => "encrypted",
            ContentState::Plaintext => "plaintext",
            ContentState::Unmarked => "unmarked",
        }
    }
}

impl std::fmt::Display for ContentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn marker_name() -> &'static OsStr {
    OsStr::new(MARKER_NAME)
}

/// True if `name` is the content marker attribute
pub fn is_marker(name: &OsStr) -> bool {
    name == marker_name()
}

/// Classify `backing_path` by its content marker.
///
/// A missing attribute, a value longer than [`MARKER_PROBE_LEN`], or a
/// store that does not support attributes at all means `Unmarked`. Other
/// store errors propagate.
pub fn classify(attrs: &dyn AttributeStore, backing_path: &Path) -> Result<ContentState> {
    match attrs.get(backing_path, marker_name()) {
        // Too long for the probe buffer: the marker is unreadable
        Ok(value) if value.len() > MARKER_PROBE_LEN => Ok(ContentState::Unmarked),
        Ok(value) if value == ENCRYPTED_VALUE => Ok(ContentState::Encrypted),
        Ok(_) => Ok(ContentState::Plaintext),
        Err(Error::AttributeMissing(_)) => Ok(ContentState::Unmarked),
        Err(e) if e.errno() == libc::ENOTSUP => Ok(ContentState::Unmarked),
        Err(e) => Err(e),
    }
}

/// Record `state` on `backing_path`. `Unmarked` removes the marker.
pub fn mark(attrs: &dyn AttributeStore, backing_path: &Path, state: ContentState) -> Result<()> {
    match state {
        ContentState::Encrypted => attrs.set(backing_path, marker_name(), ENCRYPTED_VALUE, 0),
        ContentState::Plaintext => attrs.set(backing_path, marker_name(), PLAINTEXT_VALUE, 0),
        ContentState::Unmarked => match attrs.remove(backing_path, marker_name()) {
            Ok(()) | Err(Error::AttributeMissing(_)) => Ok(()),
            Err(e) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::xattr::MemoryAttributeStore;
    use std::ffi::OsString;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_classify_states() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/b/file");

        assert_eq!(classify(&store, path).unwrap(), ContentState::Unmarked);

        mark(&store, path, ContentState::Encrypted).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Encrypted);

        mark(&store, path, ContentState::Plaintext).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Plaintext);

        mark(&store, path, ContentState::Unmarked).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Unmarked);
        mark(&store, path, ContentState::Unmarked).unwrap();
    }

    #[test]
    fn test_unknown_value_is_plaintext() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/b/file");

        store.set(path, marker_name(), b"yes", 0).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Plaintext);

        store.set(path, marker_name(), b"truetrue", 0).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Plaintext);
    }

    #[test]
    fn test_oversized_value_is_unmarked() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/b/file");

        store.set(path, marker_name(), b"truetruetrue", 0).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Unmarked);

        store.set(path, marker_name(), b"falsefalse", 0).unwrap();
        assert_eq!(classify(&store, path).unwrap(), ContentState::Unmarked);
    }

    struct BrokenStore(i32);

    impl AttributeStore for BrokenStore {
        fn get(&self, _: &Path, _: &OsStr) -> Result<Vec<u8>> {
            Err(Error::Io(io::Error::from_raw_os_error(self.0)))
        }
        fn set(&self, _: &Path, _: &OsStr, _: &[u8], _: i32) -> Result<()> {
            Err(Error::Io(io::Error::from_raw_os_error(self.0)))
        }
        fn list(&self, _: &Path) -> Result<Vec<OsString>> {
            Ok(Vec::new())
        }
        fn remove(&self, _: &Path, _: &OsStr) -> Result<()> {
            Err(Error::Io(io::Error::from_raw_os_error(self.0)))
        }
    }

    #[test]
    fn test_store_errors_propagate() {
        let path = PathBuf::from("/b/file");

        let err = classify(&BrokenStore(libc::EIO), &path).unwrap_err();
        assert_eq!(err.errno(), libc::EIO);

        assert_eq!(
            classify(&BrokenStore(libc::ENOTSUP), &path).unwrap(),
            ContentState::Unmarked
        );
    }

    #[test]
    fn test_is_marker() {
        assert!(is_marker(OsStr::new("user.encrypted")));
        assert!(!is_marker(OsStr::new("user.encrypted2")));
    }
}
