//! Virtual inode table
//!
//! The dispatcher is path-based; the kernel speaks inode numbers. This table
//! hands out stable numbers for virtual paths and keeps both directions of
//! the mapping current across rename and unlink.
//!
//! Every entry reply raises the kernel's lookup count for the inode;
//! `forget` lowers it, and an inode whose count reaches zero is dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Default)]
struct Maps {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    lookups: HashMap<u64, u64>,
}

impl Maps {
    fn insert(&mut self, ino: u64, path: PathBuf) {
        self.by_path.insert(path.clone(), ino);
        self.by_ino.insert(ino, path);
    }

    fn drop_ino(&mut self, ino: u64) {
        if let Some(path) = self.by_ino.remove(&ino) {
            self.by_path.remove(&path);
        }
        self.lookups.remove(&ino);
    }
}

/// Maps virtual inode numbers to virtual paths
pub struct InodeTable {
    next_ino: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.insert(ROOT_INO, PathBuf::from("/"));

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    /// Virtual path of `ino`
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let maps = self.maps.read();
        let dir = maps.by_ino.get(&parent)?;
        Some(dir.join(name))
    }

    pub fn ino(&self, path: &Path) -> Option<u64> {
        self.maps.read().by_path.get(path).copied()
    }

    /// Inode number for `path`, allocating one on first sight
    pub fn lookup_or_insert(&self, path: &Path) -> u64 {
        if let Some(ino) = self.ino(path) {
            return ino;
        }

        let mut maps = self.maps.write();
        // Another lookup may have raced us between the two locks
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.insert(ino, path.to_path_buf());
        ino
    }

    /// Inode number for `path` handed to the kernel in an entry reply
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut maps = self.maps.write();
        let ino = match maps.by_path.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
                maps.insert(ino, path.to_path_buf());
                ino
            }
        };
        if ino != ROOT_INO {
            *maps.lookups.entry(ino).or_insert(0) += 1;
        }
        ino
    }

    /// The kernel dropped `nlookup` references to `ino`
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }

        let mut maps = self.maps.write();
        let remaining = match maps.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            maps.drop_ino(ino);
        }
    }

    /// Forget `path` after unlink or rmdir
    pub fn remove_path(&self, path: &Path) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.get(path).copied() {
            maps.drop_ino(ino);
        }
    }

    /// Move `from` and everything below it to `to`. Whatever `to` named
    /// before is forgotten.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut maps = self.maps.write();

        if let Some(ino) = maps.by_path.get(to).copied() {
            maps.drop_ino(ino);
        }

        let moved: Vec<(u64, PathBuf)> = maps
            .by_ino
            .iter()
            .filter_map(|(&ino, path)| {
                let rest = path.strip_prefix(from).ok()?;
                let new_path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                Some((ino, new_path))
            })
            .collect();

        for (ino, new_path) in moved {
            if let Some(old) = maps.by_ino.get(&ino).cloned() {
                maps.by_path.remove(&old);
            }
            maps.insert(ino, new_path);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.ino(Path::new("/")), Some(ROOT_INO));
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("a")),
            Some(PathBuf::from("/a"))
        );
        assert_eq!(table.child_path(99, OsStr::new("a")), None);
    }

    #[test]
    fn test_lookup_is_stable() {
        let table = InodeTable::new();
        let a = table.lookup_or_insert(Path::new("/a"));
        let b = table.lookup_or_insert(Path::new("/b"));

        assert_ne!(a, b);
        assert_ne!(a, ROOT_INO);
        assert_eq!(table.lookup_or_insert(Path::new("/a")), a);
        assert_eq!(table.path(b), Some(PathBuf::from("/b")));
    }

    #[test]
    fn test_remove_path() {
        let table = InodeTable::new();
        let ino = table.lookup_or_insert(Path::new("/gone"));
        table.remove_path(Path::new("/gone"));

        assert_eq!(table.path(ino), None);
        assert_eq!(table.ino(Path::new("/gone")), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.lookup_or_insert(Path::new("/dir"));
        let file = table.lookup_or_insert(Path::new("/dir/sub/file"));
        let sibling = table.lookup_or_insert(Path::new("/dirt"));
        let victim = table.lookup_or_insert(Path::new("/new"));

        table.rename(Path::new("/dir"), Path::new("/new"));

        assert_eq!(table.path(dir), Some(PathBuf::from("/new")));
        assert_eq!(table.path(file), Some(PathBuf::from("/new/sub/file")));
        assert_eq!(table.path(sibling), Some(PathBuf::from("/dirt")));
        assert_eq!(table.path(victim), None);
        assert_eq!(table.ino(Path::new("/dir")), None);
        assert_eq!(table.ino(Path::new("/new/sub/file")), Some(file));
    }

    #[test]
    fn test_forget_drops_after_last_lookup() {
        let table = InodeTable::new();
        let ino = table.lookup(Path::new("/f"));
        assert_eq!(table.lookup(Path::new("/f")), ino);

        table.forget(ino, 1);
        assert_eq!(table.path(ino), Some(PathBuf::from("/f")));

        table.forget(ino, 1);
        assert_eq!(table.path(ino), None);
        assert_eq!(table.ino(Path::new("/f")), None);
        assert_eq!(table.len(), 1);

        // A fresh lookup hands out a new number
        assert_ne!(table.lookup(Path::new("/f")), ino);
    }

    #[test]
    fn test_forget_root_and_unknown_are_ignored() {
        let table = InodeTable::new();
        table.lookup(Path::new("/"));
        table.forget(ROOT_INO, 10);
        table.forget(42, 1);
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
    }

    #[test]
    fn test_forget_follows_rename() {
        let table = InodeTable::new();
        let ino = table.lookup(Path::new("/old"));
        table.rename(Path::new("/old"), Path::new("/new"));

        table.forget(ino, 1);
        assert_eq!(table.ino(Path::new("/new")), None);
        assert_eq!(table.len(), 1);
    }
}
