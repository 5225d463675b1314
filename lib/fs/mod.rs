//! Passthrough filesystem plumbing.
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`passthrough::Passthrough`].
pub mod fuser;
/// Admission in front of host opens.
pub mod gate;
/// Bookkeeping between kernel node ids and notional paths.
pub mod inode_table;
/// Path-based forwarders to the host filesystem.
pub mod passthrough;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt as _;

use bitflags::bitflags;
use tracing::error;

/// Type representing a kernel node id.
pub type InodeAddr = u64;

/// Type representing a file handle. For this filesystem it is the host descriptor number.
pub type FileHandle = u64;

/// The node id the kernel uses for the mount root.
pub const ROOT_INODE: InodeAddr = ::fuser::FUSE_ROOT_ID;

bitflags! {
    /// Flags for opening a file, as passed by the kernel to `open` and `create`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;

        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

impl From<i32> for OpenFlags {
    fn from(val: i32) -> Self {
        // Bits we have no name for (O_LARGEFILE and friends) are forwarded untouched.
        Self::from_bits_retain(val)
    }
}

impl OpenFlags {
    /// Whether the access mode permits reading.
    #[must_use]
    pub fn readable(self) -> bool {
        matches!(self.bits() & libc::O_ACCMODE, libc::O_RDONLY | libc::O_RDWR)
    }

    /// Whether the access mode permits writing.
    #[must_use]
    pub fn writable(self) -> bool {
        matches!(self.bits() & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }

    /// Build host open options carrying exactly these flags.
    #[must_use]
    pub fn to_open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.readable())
            .write(self.writable())
            .custom_flags(self.bits() & !libc::O_ACCMODE);
        opts
    }
}

/// The type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirEntryType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

impl TryFrom<std::fs::FileType> for DirEntryType {
    type Error = ();

    fn try_from(ft: std::fs::FileType) -> Result<Self, ()> {
        use std::os::unix::fs::FileTypeExt as _;

        if ft.is_file() {
            Ok(Self::RegularFile)
        } else if ft.is_dir() {
            Ok(Self::Directory)
        } else if ft.is_symlink() {
            Ok(Self::Symlink)
        } else if ft.is_char_device() {
            Ok(Self::CharDevice)
        } else if ft.is_block_device() {
            Ok(Self::BlockDevice)
        } else if ft.is_fifo() {
            Ok(Self::NamedPipe)
        } else if ft.is_socket() {
            Ok(Self::Socket)
        } else {
            error!(ft = ?ft, "Unknown file type encountered in DirEntryType conversion");
            Err(())
        }
    }
}

impl From<DirEntryType> for ::fuser::FileType {
    fn from(val: DirEntryType) -> Self {
        match val {
            DirEntryType::RegularFile => Self::RegularFile,
            DirEntryType::Directory => Self::Directory,
            DirEntryType::Symlink => Self::Symlink,
            DirEntryType::CharDevice => Self::CharDevice,
            DirEntryType::BlockDevice => Self::BlockDevice,
            DirEntryType::NamedPipe => Self::NamedPipe,
            DirEntryType::Socket => Self::Socket,
        }
    }
}

/// A directory entry as read from the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    pub ino: u64,
    pub name: std::ffi::OsString,
    pub kind: DirEntryType,
}
