//! An implementation of a filesystem that directly overlays a host directory.
//!
//! Every operation takes a notional path (rooted at `/`, exactly as the kernel would hand it to a
//! path-based driver), resolves it under the source directory and forwards to the matching host
//! primitive. Failures come back as the host's own `io::Error`, so the errno the kernel sees is
//! the errno the host produced.
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io;
use std::os::fd::AsRawFd as _;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::{DirBuilderExt as _, DirEntryExt as _, FileExt as _};
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::Statvfs;
use nix::sys::time::TimeSpec;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::inode_table::{HostKey, InodeTable};
use super::{DirEntry, DirEntryType, FileHandle, InodeAddr, OpenFlags, ROOT_INODE};

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| errno(libc::EINVAL))
}

/// Result of an extended attribute query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// The caller asked for the size only (buffer size zero).
    Size(u32),
    /// The attribute payload.
    Data(Vec<u8>),
}

/// Descriptors bound by `open` and `create`, keyed by their descriptor number.
#[derive(Debug, Default)]
struct HandleTable {
    open_files: RwLock<HashMap<FileHandle, Arc<File>>>,
}

impl HandleTable {
    fn bind(&self, file: File) -> FileHandle {
        #[expect(clippy::cast_sign_loss, reason = "open descriptors are never negative")]
        let fh = file.as_raw_fd() as FileHandle;
        self.open_files.write().insert(fh, Arc::new(file));
        fh
    }

    fn get(&self, fh: FileHandle) -> Option<Arc<File>> {
        self.open_files.read().get(&fh).cloned()
    }

    fn unbind(&self, fh: FileHandle) -> Option<Arc<File>> {
        self.open_files.write().remove(&fh)
    }

    fn len(&self) -> usize {
        self.open_files.read().len()
    }
}

/// Forwards every filesystem operation to the host directory tree under `source`.
#[derive(Debug)]
pub struct Passthrough {
    source: PathBuf,
    /// Host path that must never be resolved: the mount point itself when it lies under `source`.
    hidden: Option<PathBuf>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl Passthrough {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            hidden: None,
            inodes: InodeTable::new(),
            handles: HandleTable::default(),
        }
    }

    /// Refuse lookups that resolve to `host` with `ELOOP`.
    ///
    /// Stat-ing our own mount point from the session thread would wait on that same thread.
    #[must_use]
    pub fn hide(mut self, host: impl Into<PathBuf>) -> Self {
        self.hidden = Some(host.into());
        self
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[must_use]
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Number of descriptors currently bound to handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Resolve a notional path to the host path beneath `source`.
    #[must_use]
    pub fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rest) if rest.as_os_str().is_empty() => self.source.clone(),
            Ok(rest) => self.source.join(rest),
            Err(_) => self.source.join(path),
        }
    }

    /// The notional path of a node id the kernel has looked up.
    ///
    /// # Errors
    ///
    /// `ENOENT` when the node id is unknown.
    pub fn path_of(&self, ino: InodeAddr) -> io::Result<PathBuf> {
        self.inodes.path(ino).ok_or_else(|| {
            warn!(ino, "Operation on unknown inode. This is a programming bug");
            errno(libc::ENOENT)
        })
    }

    /// Stat `name` in `parent` and record the lookup. Returns the child's node id and metadata.
    ///
    /// # Errors
    ///
    /// `ELOOP` when the child is the hidden mount point, otherwise whatever `lstat` reports.
    pub fn lookup(&self, parent: &Path, name: &OsStr) -> io::Result<(InodeAddr, Metadata)> {
        let path = parent.join(name);
        self.refuse_hidden(&path)?;
        let meta = self.getattr(&path)?;
        let ino = self.inodes.remember(HostKey::of(&meta), path);
        Ok((ino, meta))
    }

    fn refuse_hidden(&self, path: &Path) -> io::Result<()> {
        if self
            .hidden
            .as_deref()
            .is_some_and(|hidden| self.host_path(path) == hidden)
        {
            debug!(path = %path.display(), "refusing to resolve the mount point through itself");
            return Err(errno(libc::ELOOP));
        }
        Ok(())
    }

    /// `lstat`: symlinks are not followed.
    pub fn getattr(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(self.host_path(path))
    }

    pub fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask);
        nix::unistd::access(&self.host_path(path), flags).map_err(io::Error::from)
    }

    /// The symlink target. The kernel adds the terminating NUL itself.
    pub fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.host_path(path))
    }

    /// List a directory, `.` and `..` first.
    pub fn readdir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let host = self.host_path(path);
        let dir = HostKey::of(&fs::symlink_metadata(&host)?);
        let node_of = |key: HostKey| self.inodes.node_of(key).unwrap_or(key.ino);
        let dir_ino = if path == Path::new("/") {
            ROOT_INODE
        } else {
            node_of(dir)
        };
        let parent_ino = host
            .parent()
            .and_then(|p| fs::symlink_metadata(p).ok())
            .map_or(dir_ino, |m| node_of(HostKey::of(&m)));

        let mut entries = vec![
            DirEntry {
                ino: dir_ino,
                name: ".".into(),
                kind: DirEntryType::Directory,
            },
            DirEntry {
                ino: parent_ino,
                name: "..".into(),
                kind: DirEntryType::Directory,
            },
        ];

        for dir_entry in fs::read_dir(&host)? {
            let dir_entry = dir_entry?;
            let Ok(kind) = DirEntryType::try_from(dir_entry.file_type()?) else {
                debug!(name = ?dir_entry.file_name(), "skipping entry of unknown type");
                continue;
            };
            entries.push(DirEntry {
                ino: node_of(HostKey {
                    dev: dir.dev,
                    ino: dir_entry.ino(),
                }),
                name: dir_entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    /// Regular files are created exclusively and closed, FIFOs via `mkfifo`, anything else via
    /// `mknod`.
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
        let host = self.host_path(path);
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & !libc::S_IFMT);

        if kind == SFlag::S_IFREG {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & !libc::S_IFMT)
                .open(&host)
                .map(drop)
        } else if kind == SFlag::S_IFIFO {
            nix::unistd::mkfifo(&host, perm).map_err(io::Error::from)
        } else {
            nix::sys::stat::mknod(&host, kind, perm, rdev).map_err(io::Error::from)
        }
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(self.host_path(path))
    }

    pub fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.host_path(path))
    }

    pub fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.host_path(path))
    }

    /// Create `link` pointing at `target`. The target is stored verbatim.
    pub fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.host_path(link))
    }

    /// Rename without flags. `RENAME_NOREPLACE`, `RENAME_EXCHANGE` and friends are refused.
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> io::Result<()> {
        if flags != 0 {
            return Err(errno(libc::EINVAL));
        }
        fs::rename(self.host_path(from), self.host_path(to))?;
        self.inodes.rename(from, to);
        Ok(())
    }

    pub fn link(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::hard_link(self.host_path(from), self.host_path(to))
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(
            self.host_path(path),
            fs::Permissions::from_mode(mode & 0o7777),
        )
    }

    /// `lchown`: symlinks are not followed.
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::lchown(self.host_path(path), uid, gid)
    }

    /// Truncate through the bound handle when there is one, by path otherwise.
    pub fn truncate(&self, path: &Path, size: u64, fh: Option<FileHandle>) -> io::Result<()> {
        if let Some(file) = fh.and_then(|fh| self.handles.get(fh)) {
            return file.set_len(size);
        }
        let size = libc::off_t::try_from(size).map_err(|_| errno(libc::EFBIG))?;
        nix::unistd::truncate(&self.host_path(path), size).map_err(io::Error::from)
    }

    /// Set access and modification times without following symlinks.
    pub fn utimens(&self, path: &Path, atime: &TimeSpec, mtime: &TimeSpec) -> io::Result<()> {
        nix::sys::stat::utimensat(
            nix::fcntl::AT_FDCWD,
            &self.host_path(path),
            atime,
            mtime,
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(io::Error::from)
    }

    /// Create `name` in `parent` with the caller's flags and mode, record the lookup the kernel
    /// expects and bind the descriptor to a new handle.
    pub fn create(
        &self,
        parent: &Path,
        name: &OsStr,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<(FileHandle, InodeAddr, Metadata)> {
        let file = flags
            .to_open_options()
            .mode(mode)
            .open(self.host_path(&parent.join(name)))?;
        let (fh, (ino, meta)) = self.bind_after(file, || self.lookup(parent, name))?;
        Ok((fh, ino, meta))
    }

    /// Bind `file` only once `then` succeeds. On failure the descriptor is closed here, since the
    /// kernel never learns about a handle it could release.
    fn bind_after<T>(
        &self,
        file: File,
        then: impl FnOnce() -> io::Result<T>,
    ) -> io::Result<(FileHandle, T)> {
        let value = then()?;
        Ok((self.handles.bind(file), value))
    }

    /// The host open that follows a successful admission.
    pub fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<FileHandle> {
        let file = flags.to_open_options().open(self.host_path(path))?;
        Ok(self.handles.bind(file))
    }

    /// Run `op` against the bound handle, or against a descriptor opened just for this call.
    fn with_file<T>(
        &self,
        path: &Path,
        fh: Option<FileHandle>,
        fallback: OpenFlags,
        op: impl FnOnce(&File) -> io::Result<T>,
    ) -> io::Result<T> {
        if let Some(file) = fh.and_then(|fh| self.handles.get(fh)) {
            return op(&file);
        }
        let file = fallback.to_open_options().open(self.host_path(path))?;
        op(&file)
    }

    /// Positional read of up to `size` bytes. Short only at end of file.
    pub fn read(
        &self,
        path: &Path,
        fh: Option<FileHandle>,
        offset: u64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        self.with_file(path, fh, OpenFlags::RDONLY, |file| {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    /// Positional write. Returns the number of bytes written.
    pub fn write(
        &self,
        path: &Path,
        fh: Option<FileHandle>,
        offset: u64,
        data: &[u8],
    ) -> io::Result<usize> {
        self.with_file(path, fh, OpenFlags::WRONLY, |file| {
            file.write_all_at(data, offset)?;
            Ok(data.len())
        })
    }

    pub fn statfs(&self, path: &Path) -> io::Result<Statvfs> {
        nix::sys::statvfs::statvfs(&self.host_path(path)).map_err(io::Error::from)
    }

    /// Close the descriptor bound to `fh`.
    ///
    /// # Errors
    ///
    /// `EBADF` when nothing is bound to `fh`.
    pub fn release(&self, fh: FileHandle) -> io::Result<()> {
        self.handles.unbind(fh).map(drop).ok_or_else(|| {
            warn!(fh, "Release called on unknown file handle. Programming bug");
            errno(libc::EBADF)
        })
    }

    /// Deliberately a no-op.
    pub fn fsync(&self, _path: &Path, _fh: Option<FileHandle>, _datasync: bool) -> io::Result<()> {
        Ok(())
    }

    /// Preallocate. Any mode bits (punch hole, keep size, ...) are unsupported.
    pub fn fallocate(
        &self,
        path: &Path,
        fh: Option<FileHandle>,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> io::Result<()> {
        if mode != 0 {
            return Err(errno(libc::EOPNOTSUPP));
        }
        self.with_file(path, fh, OpenFlags::WRONLY, |file| {
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset, length) };
            if rc == 0 { Ok(()) } else { Err(errno(rc)) }
        })
    }

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
        let host = c_string(self.host_path(path).as_os_str().as_bytes())?;
        let name = c_string(name.as_bytes())?;
        // SAFETY: both strings are NUL-terminated and `value` is valid for `value.len()` bytes.
        let rc = unsafe {
            libc::lsetxattr(
                host.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// With `size == 0` only the attribute's length is reported.
    pub fn getxattr(&self, path: &Path, name: &OsStr, size: u32) -> io::Result<XattrReply> {
        let host = c_string(self.host_path(path).as_os_str().as_bytes())?;
        let name = c_string(name.as_bytes())?;
        let mut buf = vec![0u8; size as usize];
        // SAFETY: both strings are NUL-terminated; `buf` is valid for writes of `buf.len()` bytes
        // (a zero length with a dangling pointer is the documented size query).
        let rc = unsafe {
            libc::lgetxattr(
                host.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        Self::xattr_reply(rc, buf)
    }

    /// NUL-separated attribute names. With `size == 0` only the list length is reported.
    pub fn listxattr(&self, path: &Path, size: u32) -> io::Result<XattrReply> {
        let host = c_string(self.host_path(path).as_os_str().as_bytes())?;
        let mut buf = vec![0u8; size as usize];
        // SAFETY: `host` is NUL-terminated and `buf` is valid for writes of `buf.len()` bytes.
        let rc = unsafe { libc::llistxattr(host.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        Self::xattr_reply(rc, buf)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> io::Result<()> {
        let host = c_string(self.host_path(path).as_os_str().as_bytes())?;
        let name = c_string(name.as_bytes())?;
        // SAFETY: both strings are NUL-terminated.
        let rc = unsafe { libc::lremovexattr(host.as_ptr(), name.as_ptr()) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn xattr_reply(rc: isize, mut buf: Vec<u8>) -> io::Result<XattrReply> {
        let len = usize::try_from(rc).map_err(|_| io::Error::last_os_error())?;
        if buf.is_empty() {
            let len = u32::try_from(len).map_err(|_| errno(libc::E2BIG))?;
            return Ok(XattrReply::Size(len));
        }
        buf.truncate(len);
        Ok(XattrReply::Data(buf))
    }
}
