//! FUSE filesystem implementation
//!
//! Mirrors a backing directory at the mount point. File contents pass
//! through a content transform chosen per file by its marker attribute;
//! everything else goes straight to the backing store.

pub mod attr;
pub mod backing;
mod filesystem;
pub mod inode;
pub mod marker;
pub mod ops;
pub mod transform;
pub mod xattr;

#[cfg(test)]
mod testing;

pub use attr::{Attributes, DirEntry, FsStats, NodeKind, Timestamp};
pub use filesystem::CryptFs;
pub use marker::ContentState;
pub use ops::{AuditOps, AuditRecord, EncryptingOps, Operations, PassthroughOps};
pub use transform::TransformEngine;
pub use xattr::{AttributeStore, MemoryAttributeStore, XattrStore};
