//! cryptmirror - Passthrough FUSE filesystem with content encryption
//!
//! Mounts a view of a backing directory. Regular files marked with the
//! `user.encrypted` extended attribute are stored encrypted at rest and
//! presented decrypted; all other entries pass through unchanged.

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use context::MountContext;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, UnmanagedWritePolicy};
    pub use crate::context::MountContext;
    pub use crate::crypto::{Cipher, Passphrase};
    pub use crate::error::{Error, Result};
    pub use crate::fs::{ContentState, CryptFs, Operations};
}
