//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`Passthrough`], with `open` routed
//! through the [`Gate`] first.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::sys::time::TimeSpec;
use tracing::{Instrument as _, debug, error, info, instrument};

use super::gate::Gate;
use super::passthrough::{Passthrough, XattrReply};
use super::{DirEntryType, InodeAddr, OpenFlags};

/// Convert an I/O error to the corresponding errno value for FUSE replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyOpen,
    fuser::ReplyCreate,
    fuser::ReplyWrite,
    fuser::ReplyStatfs,
    fuser::ReplyXattr,
    fuser::ReplyDirectory,
);

/// Extension trait on `Result<T, std::io::Error>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, std::io::Error> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }
}

#[expect(
    clippy::cast_sign_loss,
    reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
)]
#[expect(
    clippy::cast_possible_truncation,
    reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
)]
fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        std::time::UNIX_EPOCH + Duration::new(secs.cast_unsigned(), nsecs as u32)
    } else {
        std::time::UNIX_EPOCH - Duration::from_secs((-secs).cast_unsigned())
            + Duration::from_nanos(nsecs.cast_unsigned())
    }
}

/// Convert host metadata to the attributes reported for node `ino`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "metadata mode/nlink/rdev/blksize narrowing is intentional"
)]
fn metadata_to_fuser_attr(ino: InodeAddr, meta: &Metadata) -> fuser::FileAttr {
    use std::os::unix::fs::MetadataExt as _;

    let kind = DirEntryType::try_from(meta.file_type())
        .map_or(fuser::FileType::RegularFile, Into::into);
    let mtime = to_systime(meta.mtime(), meta.mtime_nsec());

    fuser::FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: to_systime(meta.atime(), meta.atime_nsec()),
        mtime,
        ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
        crtime: mtime,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// `None` leaves the timestamp untouched.
fn to_timespec(time: Option<fuser::TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::UTIME_OMIT,
        Some(fuser::TimeOrNow::Now) => TimeSpec::UTIME_NOW,
        Some(fuser::TimeOrNow::SpecificTime(t)) => match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(since) => TimeSpec::from(since),
            Err(before) => -TimeSpec::from(before.duration()),
        },
    }
}

/// Bridges [`Passthrough`] to the [`fuser::Filesystem`] trait.
///
/// Every callback except `open` and a mediated `create` runs inline on the session thread. Those
/// two may sit behind interactive prompts for a minute or more, so they are spawned onto the
/// runtime and reply from there.
pub struct FuserAdapter {
    fs: Arc<Passthrough>,
    gate: Gate,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    /// Attributes and entries are never cached by the kernel: every lookup comes back to us.
    const TTL: Duration = Duration::ZERO;

    pub fn new(gate: Gate, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs: Arc::clone(gate.fs()),
            gate,
            runtime,
        }
    }

    fn child(&self, parent: InodeAddr, name: &OsStr) -> std::io::Result<PathBuf> {
        Ok(self.fs.path_of(parent)?.join(name))
    }

    fn entry_for(&self, parent: &Path, name: &OsStr) -> std::io::Result<fuser::FileAttr> {
        let (ino, meta) = self.fs.lookup(parent, name)?;
        Ok(metadata_to_fuser_attr(ino, &meta))
    }

    fn attr_of(&self, ino: InodeAddr) -> std::io::Result<fuser::FileAttr> {
        let meta = self.fs.getattr(&self.fs.path_of(ino)?)?;
        Ok(metadata_to_fuser_attr(ino, &meta))
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the setattr callback")]
    fn apply_setattr(
        &self,
        ino: InodeAddr,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        fh: Option<u64>,
    ) -> std::io::Result<fuser::FileAttr> {
        let path = self.fs.path_of(ino)?;
        if let Some(mode) = mode {
            self.fs.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.fs.chown(&path, uid, gid)?;
        }
        if let Some(size) = size {
            self.fs.truncate(&path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.fs
                .utimens(&path, &to_timespec(atime), &to_timespec(mtime))?;
        }
        self.attr_of(ino)
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!(
            source = %self.fs.source().display(),
            ttl = ?Self::TTL,
            mediate_create = self.gate.mediates_create(),
            "filesystem initialized with attribute and entry caching disabled"
        );
        Ok(())
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .path_of(parent)
            .and_then(|parent| self.entry_for(&parent, name))
            .fuse_reply(reply, |attr, reply| {
                debug!(?attr, "replying...");
                reply.entry(&Self::TTL, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.inodes().forget(ino, nlookup);
        debug!(tracked = self.fs.inodes().tracked(), "forgotten");
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.attr_of(ino).fuse_reply(reply, |attr, reply| {
            debug!(?attr, "replying...");
            reply.attr(&Self::TTL, &attr);
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _ctime, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.apply_setattr(ino, mode, uid, gid, size, atime, mtime, fh)
            .fuse_reply(reply, |attr, reply| {
                debug!(?attr, "replying...");
                reply.attr(&Self::TTL, &attr);
            });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        use std::os::unix::ffi::OsStrExt as _;

        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.readlink(&path))
            .fuse_reply(reply, |target, reply| {
                reply.data(target.as_os_str().as_bytes());
            });
    }

    #[instrument(name = "FuserAdapter::mknod", skip(self, _req, _umask, reply))]
    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .path_of(parent)
            .and_then(|parent| {
                self.fs.mknod(&parent.join(name), mode, u64::from(rdev))?;
                self.entry_for(&parent, name)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&Self::TTL, &attr, 0));
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .path_of(parent)
            .and_then(|parent| {
                self.fs.mkdir(&parent.join(name), mode)?;
                self.entry_for(&parent, name)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&Self::TTL, &attr, 0));
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|path| self.fs.unlink(&path))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|path| self.fs.rmdir(&path))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::symlink", skip(self, _req, reply))]
    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .path_of(parent)
            .and_then(|parent| {
                self.fs.symlink(target, &parent.join(link_name))?;
                self.entry_for(&parent, link_name)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&Self::TTL, &attr, 0));
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|from| {
                let to = self.child(newparent, newname)?;
                self.fs.rename(&from, &to, flags)
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::link", skip(self, _req, reply))]
    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|from| {
                let parent = self.fs.path_of(newparent)?;
                self.fs.link(&from, &parent.join(newname))?;
                self.entry_for(&parent, newname)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&Self::TTL, &attr, 0));
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let path = match self.fs.path_of(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(io_to_errno(&e));
                return;
            }
        };
        let flags = OpenFlags::from(flags);
        let gate = self.gate.clone();

        self.runtime.spawn(
            async move {
                gate.open(&path, flags)
                    .await
                    .fuse_reply(reply, |fh, reply| {
                        debug!(handle = fh, "replying...");
                        reply.opened(fh, 0);
                    });
            }
            .in_current_span(),
        );
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _umask, flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let parent = match self.fs.path_of(parent) {
            Ok(parent) => parent,
            Err(e) => {
                reply.error(io_to_errno(&e));
                return;
            }
        };
        let flags = OpenFlags::from(flags);
        let name = name.to_owned();
        let gate = self.gate.clone();

        let task = async move {
            gate.create(&parent, &name, flags, mode)
                .await
                .map(|(fh, ino, meta)| (fh, metadata_to_fuser_attr(ino, &meta)))
                .fuse_reply(reply, |(fh, attr), reply| {
                    debug!(handle = fh, ?attr, "replying...");
                    reply.created(&Self::TTL, &attr, 0, fh, 0);
                });
        }
        .in_current_span();

        if self.gate.mediates_create() {
            self.runtime.spawn(task);
        } else {
            self.runtime.block_on(task);
        }
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.read(&path, Some(fh), offset.cast_unsigned(), size))
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.write(&path, Some(fh), offset.cast_unsigned(), data))
            .and_then(|written| {
                u32::try_from(written).map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))
            })
            .fuse_reply(reply, |written, reply| {
                debug!(written, "replying...");
                reply.written(written);
            });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _fh, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .release(fh)
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.fsync(&path, Some(fh), datasync))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let entries = match self.fs.path_of(ino).and_then(|path| self.fs.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
                return;
            }
        };

        #[expect(
            clippy::cast_possible_truncation,
            reason = "fuser offset is i64 but always non-negative"
        )]
        for (i, entry) in entries
            .iter()
            .enumerate()
            .skip(offset.cast_unsigned() as usize)
        {
            let kind: fuser::FileType = entry.kind.into();
            let Ok(idx): Result<i64, _> = (i + 1).try_into() else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };

            debug!(?entry, "adding entry to reply...");
            if reply.add(entry.ino, idx, kind, &entry.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        let result = self.fs.path_of(ino).and_then(|path| self.fs.statfs(&path));

        #[expect(
            clippy::cast_possible_truncation,
            clippy::useless_conversion,
            reason = "statvfs field widths differ between targets"
        )]
        result.fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                u64::from(stats.blocks()),
                u64::from(stats.blocks_free()),
                u64::from(stats.blocks_available()),
                u64::from(stats.files()),
                u64::from(stats.files_free()),
                stats.block_size() as u32,
                stats.name_max() as u32,
                stats.fragment_size() as u32,
            );
        });
    }

    #[instrument(name = "FuserAdapter::setxattr", skip(self, _req, value, _position, reply))]
    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.setxattr(&path, name, value, flags))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, _req, reply))]
    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.getxattr(&path, name, size))
            .fuse_reply(reply, reply_xattr);
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, _req, reply))]
    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.listxattr(&path, size))
            .fuse_reply(reply, reply_xattr);
    }

    #[instrument(name = "FuserAdapter::removexattr", skip(self, _req, reply))]
    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.removexattr(&path, name))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::access", skip(self, _req, reply))]
    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.access(&path, mask))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fallocate", skip(self, _req, reply))]
    fn fallocate(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .path_of(ino)
            .and_then(|path| self.fs.fallocate(&path, Some(fh), offset, length, mode))
            .fuse_reply(reply, |(), reply| reply.ok());
    }
}

fn reply_xattr(value: XattrReply, reply: fuser::ReplyXattr) {
    match value {
        XattrReply::Size(size) => reply.size(size),
        XattrReply::Data(data) => reply.data(&data),
    }
}
