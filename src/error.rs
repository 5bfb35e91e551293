//! Error types for cryptmirror

use crate::crypto::CryptoError;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the dispatcher and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attribute not present on the backing file. The marker oracle folds
    /// this into `ContentState::Unmarked`.
    #[error("Attribute not present: {0}")]
    AttributeMissing(String),

    #[error("Cryptography error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}

impl Error {
    /// Map to the errno reported back to the kernel
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::PathTooLong(_) => libc::ENAMETOOLONG,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::AttributeMissing(_) => libc::ENODATA,
            Error::Crypto(_) => libc::EIO,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EIO,
        }
    }

    /// True if this is a crypto failure reported by the cipher
    pub fn is_crypto(&self) -> bool {
        matches!(self, Error::Crypto(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::PermissionDenied("x".into()).errno(), libc::EACCES);
        assert_eq!(Error::PathTooLong("x".into()).errno(), libc::ENAMETOOLONG);
        assert_eq!(Error::AttributeMissing("x".into()).errno(), libc::ENODATA);
        assert_eq!(Error::Crypto(CryptoError::Decryption).errno(), libc::EIO);
    }

    #[test]
    fn test_io_errno_passes_through() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::ENOTEMPTY));
        assert_eq!(err.errno(), libc::ENOTEMPTY);

        let err = Error::from(nix::errno::Errno::EXDEV);
        assert_eq!(err.errno(), libc::EXDEV);

        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "opaque"));
        assert_eq!(err.errno(), libc::EIO);
    }
}
