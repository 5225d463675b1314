//! The low-level FUSE protocol addresses files by node id, but every host primitive wants a path.
//! This table hands out node ids for host files and remembers which notional path each one was
//! last resolved through.
//!
//! A host file is identified by its `(st_dev, st_ino)` pair. Its node id is the host inode number
//! whenever that is unambiguous. When the inode number is already held by a file on another
//! device, or equals the mount root's id, a synthetic id is issued instead.

use std::collections::{HashMap, hash_map::Entry};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{InodeAddr, ROOT_INODE};

/// Identity of a file on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub dev: u64,
    pub ino: u64,
}

impl HostKey {
    #[must_use]
    pub fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt as _;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Synthetic ids are drawn from the top half of the id space, far from typical inode numbers.
const SYNTHETIC_BASE: InodeAddr = 1 << 63;

#[derive(Debug)]
struct InodeControlBlock {
    /// Outstanding kernel lookups.
    rc: u64,
    path: PathBuf,
    host: Option<HostKey>,
}

#[derive(Debug)]
struct Tables {
    by_node: HashMap<InodeAddr, InodeControlBlock>,
    by_host: HashMap<HostKey, InodeAddr>,
    next_synthetic: InodeAddr,
}

impl Tables {
    fn allocate(&mut self, host: HostKey) -> InodeAddr {
        if host.ino != ROOT_INODE && !self.by_node.contains_key(&host.ino) {
            return host.ino;
        }
        while self.by_node.contains_key(&self.next_synthetic) {
            self.next_synthetic = self.next_synthetic.wrapping_add(1).max(SYNTHETIC_BASE);
        }
        let ino = self.next_synthetic;
        self.next_synthetic = self.next_synthetic.wrapping_add(1).max(SYNTHETIC_BASE);
        debug!(?host, ino, "host inode is ambiguous, issued a synthetic node id");
        ino
    }
}

/// Maps node ids to host files and notional paths (rooted at `/`).
#[derive(Debug)]
pub struct InodeTable {
    tables: RwLock<Tables>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    #[must_use]
    pub fn new() -> Self {
        let mut by_node = HashMap::new();
        by_node.insert(
            ROOT_INODE,
            InodeControlBlock {
                rc: 1,
                path: PathBuf::from("/"),
                host: None,
            },
        );
        Self {
            tables: RwLock::new(Tables {
                by_node,
                by_host: HashMap::new(),
                next_synthetic: SYNTHETIC_BASE,
            }),
        }
    }

    /// The notional path `ino` was last resolved through.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<PathBuf> {
        self.tables
            .read()
            .by_node
            .get(&ino)
            .map(|icb| icb.path.clone())
    }

    /// The node id currently issued for `host`, if any.
    #[must_use]
    pub fn node_of(&self, host: HostKey) -> Option<InodeAddr> {
        self.tables.read().by_host.get(&host).copied()
    }

    /// Record one kernel lookup of `host` through `path` and return its node id.
    ///
    /// The most recent path wins, which keeps a hard-linked inode reachable after one of its
    /// names is removed.
    pub fn remember(&self, host: HostKey, path: PathBuf) -> InodeAddr {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let ino = match tables.by_host.get(&host).copied() {
            Some(ino) => ino,
            None => {
                let ino = tables.allocate(host);
                tables.by_host.insert(host, ino);
                tables.by_node.insert(
                    ino,
                    InodeControlBlock {
                        rc: 0,
                        path: PathBuf::new(),
                        host: Some(host),
                    },
                );
                ino
            }
        };
        if let Some(icb) = tables.by_node.get_mut(&ino) {
            icb.rc += 1;
            icb.path = path;
        }
        ino
    }

    /// Drop `nlookup` kernel references to `ino`, evicting it at zero.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        match tables.by_node.entry(ino) {
            Entry::Occupied(mut entry) => {
                if entry.get().rc <= nlookup {
                    if let Some(host) = entry.remove().host {
                        tables.by_host.remove(&host);
                    }
                } else {
                    entry.get_mut().rc -= nlookup;
                }
            }
            Entry::Vacant(_) => {
                warn!(ino, "Forget called on unknown inode. This is a programming bug");
            }
        }
    }

    /// Re-root every remembered path at or below `from` under `to`.
    pub fn rename(&self, from: &Path, to: &Path) {
        for icb in self.tables.write().by_node.values_mut() {
            if let Ok(rest) = icb.path.strip_prefix(from) {
                icb.path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
            }
        }
    }

    /// Number of node ids currently tracked, root included.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.tables.read().by_node.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dev: u64, ino: u64) -> HostKey {
        HostKey { dev, ino }
    }

    #[test]
    fn root_is_always_known() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE), Some(PathBuf::from("/")));
        table.forget(ROOT_INODE, 100);
        assert_eq!(table.path(ROOT_INODE), Some(PathBuf::from("/")));
    }

    #[test]
    fn unambiguous_host_inode_is_the_node_id() {
        let table = InodeTable::new();
        assert_eq!(table.remember(key(8, 42), PathBuf::from("/a")), 42);
        assert_eq!(table.node_of(key(8, 42)), Some(42));
    }

    #[test]
    fn forget_evicts_after_all_lookups_are_returned() {
        let table = InodeTable::new();
        table.remember(key(8, 42), PathBuf::from("/a"));
        table.remember(key(8, 42), PathBuf::from("/a"));
        table.forget(42, 1);
        assert_eq!(table.path(42), Some(PathBuf::from("/a")));
        table.forget(42, 1);
        assert_eq!(table.path(42), None);
        assert_eq!(table.node_of(key(8, 42)), None);
        assert_eq!(table.tracked(), 1);
    }

    #[test]
    fn latest_lookup_path_wins() {
        let table = InodeTable::new();
        table.remember(key(8, 7), PathBuf::from("/first"));
        table.remember(key(8, 7), PathBuf::from("/second"));
        assert_eq!(table.path(7), Some(PathBuf::from("/second")));
    }

    #[test]
    fn same_inode_number_on_two_devices_gets_two_node_ids() {
        let table = InodeTable::new();
        let etc = table.remember(key(8, 87), PathBuf::from("/etc/alternatives/x"));
        let dev = table.remember(key(5, 87), PathBuf::from("/dev/autofs"));

        assert_eq!(etc, 87);
        assert_ne!(dev, etc);
        assert_ne!(dev, ROOT_INODE);
        assert_eq!(table.path(etc), Some(PathBuf::from("/etc/alternatives/x")));
        assert_eq!(table.path(dev), Some(PathBuf::from("/dev/autofs")));
    }

    #[test]
    fn filesystem_roots_never_take_the_mount_root_id() {
        let table = InodeTable::new();
        let proc = table.remember(key(20, ROOT_INODE), PathBuf::from("/proc"));
        let sys = table.remember(key(21, ROOT_INODE), PathBuf::from("/sys"));

        assert_ne!(proc, ROOT_INODE);
        assert_ne!(sys, ROOT_INODE);
        assert_ne!(proc, sys);
        assert_eq!(table.path(ROOT_INODE), Some(PathBuf::from("/")));
        assert_eq!(table.path(proc), Some(PathBuf::from("/proc")));
    }

    #[test]
    fn synthetic_id_is_released_on_forget() {
        let table = InodeTable::new();
        table.remember(key(8, 87), PathBuf::from("/a"));
        let other = table.remember(key(5, 87), PathBuf::from("/b"));
        table.forget(other, 1);
        assert_eq!(table.path(other), None);
        assert_eq!(table.node_of(key(5, 87)), None);
        assert_eq!(table.path(87), Some(PathBuf::from("/a")));
    }

    #[test]
    fn rename_moves_entry_and_descendants_only() {
        let table = InodeTable::new();
        table.remember(key(8, 10), PathBuf::from("/dir"));
        table.remember(key(8, 11), PathBuf::from("/dir/file"));
        table.remember(key(8, 12), PathBuf::from("/dirty"));

        table.rename(Path::new("/dir"), Path::new("/moved"));

        assert_eq!(table.path(10), Some(PathBuf::from("/moved")));
        assert_eq!(table.path(11), Some(PathBuf::from("/moved/file")));
        assert_eq!(table.path(12), Some(PathBuf::from("/dirty")));
    }
}
