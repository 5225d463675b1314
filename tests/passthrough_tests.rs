#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::ffi::OsStr;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::Path;

use gatefs::fs::passthrough::Passthrough;
use gatefs::fs::{DirEntryType, OpenFlags, ROOT_INODE};
use nix::sys::time::TimeSpec;
use tempfile::TempDir;

fn setup() -> (TempDir, Passthrough) {
    let dir = tempfile::tempdir().unwrap();
    let fs = Passthrough::new(dir.path());
    (dir, fs)
}

fn errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().expect("host errors carry an errno")
}

#[test]
fn notional_paths_resolve_under_the_source() {
    let (dir, fs) = setup();
    assert_eq!(fs.host_path(Path::new("/")), dir.path());
    assert_eq!(fs.host_path(Path::new("/a/b")), dir.path().join("a/b"));
}

#[test]
fn created_file_reports_the_host_inode() {
    let (dir, fs) = setup();
    let (fh, ino, meta) = fs
        .create(
            Path::new("/"),
            OsStr::new("f"),
            OpenFlags::from(libc::O_CREAT | libc::O_WRONLY),
            0o644,
        )
        .unwrap();

    let host = std::fs::symlink_metadata(dir.path().join("f")).unwrap();
    assert_eq!(ino, host.ino());
    assert_eq!(meta.ino(), host.ino());
    assert_eq!(fs.inodes().path(ino).unwrap(), Path::new("/f"));
    assert_eq!(fs.open_handles(), 1);
    fs.release(fh).unwrap();
}

#[test]
fn failed_create_binds_no_handle() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();

    let err = fs
        .create(
            Path::new("/"),
            OsStr::new("f"),
            OpenFlags::from(libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY),
            0o644,
        )
        .unwrap_err();
    assert_eq!(errno(&err), libc::EEXIST);
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn hidden_mount_point_is_never_resolved() {
    let (dir, fs) = setup();
    std::fs::create_dir(dir.path().join("mnt")).unwrap();
    let fs = fs.hide(dir.path().join("mnt"));

    let err = fs.lookup(Path::new("/"), OsStr::new("mnt")).unwrap_err();
    assert_eq!(errno(&err), libc::ELOOP);
    assert_eq!(fs.inodes().tracked(), 1);

    std::fs::create_dir(dir.path().join("other")).unwrap();
    fs.lookup(Path::new("/"), OsStr::new("other")).unwrap();
}

#[test]
fn filesystem_roots_under_the_source_resolve() {
    // Pseudo filesystems mounted under `/` report inode 1 from their own device.
    let roots: Vec<&str> = ["proc", "sys"]
        .into_iter()
        .filter(|name| {
            std::fs::symlink_metadata(Path::new("/").join(name)).is_ok_and(|m| m.ino() == 1)
        })
        .collect();
    let fs = Passthrough::new("/");

    let mut seen = Vec::new();
    for name in roots {
        let (ino, meta) = fs.lookup(Path::new("/"), OsStr::new(name)).unwrap();
        assert_eq!(meta.ino(), 1);
        assert_ne!(ino, ROOT_INODE);
        assert_eq!(fs.inodes().path(ino).unwrap(), Path::new("/").join(name));
        assert!(!seen.contains(&ino));
        seen.push(ino);
    }
    assert_eq!(fs.path_of(ROOT_INODE).unwrap(), Path::new("/"));
}

#[test]
fn lookup_of_missing_entry_is_enoent() {
    let (_dir, fs) = setup();
    let err = fs.lookup(Path::new("/"), OsStr::new("ghost")).unwrap_err();
    assert_eq!(errno(&err), libc::ENOENT);
    assert_eq!(fs.inodes().tracked(), 1);
}

#[test]
fn second_mkdir_fails_with_eexist() {
    let (_dir, fs) = setup();
    fs.mkdir(Path::new("/d"), 0o755).unwrap();
    let err = fs.mkdir(Path::new("/d"), 0o755).unwrap_err();
    assert_eq!(errno(&err), libc::EEXIST);
}

#[test]
fn hard_link_is_visible_from_both_names() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("a"), b"x").unwrap();

    fs.link(Path::new("/a"), Path::new("/b")).unwrap();

    let a = fs.getattr(Path::new("/a")).unwrap();
    let b = fs.getattr(Path::new("/b")).unwrap();
    assert_eq!(a.nlink(), 2);
    assert_eq!(b.nlink(), 2);
    assert_eq!(a.ino(), b.ino());
}

#[test]
fn rename_with_flags_is_rejected() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("a"), b"x").unwrap();

    let err = fs
        .rename(Path::new("/a"), Path::new("/b"), libc::RENAME_NOREPLACE)
        .unwrap_err();
    assert_eq!(errno(&err), libc::EINVAL);
    assert!(dir.path().join("a").exists());
}

#[test]
fn rename_carries_lookups_along() {
    let (dir, fs) = setup();
    std::fs::create_dir(dir.path().join("d")).unwrap();
    std::fs::write(dir.path().join("d/f"), b"x").unwrap();

    fs.lookup(Path::new("/"), OsStr::new("d")).unwrap();
    let (file_ino, _) = fs.lookup(Path::new("/d"), OsStr::new("f")).unwrap();

    fs.rename(Path::new("/d"), Path::new("/e"), 0).unwrap();
    assert_eq!(fs.inodes().path(file_ino).unwrap(), Path::new("/e/f"));
    assert!(dir.path().join("e/f").exists());
}

#[test]
fn fallocate_with_mode_bits_is_unsupported() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();

    let err = fs
        .fallocate(Path::new("/f"), None, 0, 4096, libc::FALLOC_FL_KEEP_SIZE)
        .unwrap_err();
    assert_eq!(errno(&err), libc::EOPNOTSUPP);

    fs.fallocate(Path::new("/f"), None, 0, 4096, 0).unwrap();
    assert_eq!(fs.getattr(Path::new("/f")).unwrap().len(), 4096);
}

#[test]
fn read_and_write_through_a_bound_handle() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"hello world").unwrap();

    let fh = fs.open(Path::new("/f"), OpenFlags::RDWR).unwrap();
    assert_eq!(fs.open_handles(), 1);

    assert_eq!(
        fs.write(Path::new("/f"), Some(fh), 6, b"there").unwrap(),
        5
    );
    let data = fs.read(Path::new("/f"), Some(fh), 0, 64).unwrap();
    assert_eq!(data, b"hello there");

    let tail = fs.read(Path::new("/f"), Some(fh), 6, 3).unwrap();
    assert_eq!(tail, b"the");

    fs.release(fh).unwrap();
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn read_and_write_without_a_handle_open_on_the_fly() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"abcdef").unwrap();

    fs.write(Path::new("/f"), None, 0, b"XY").unwrap();
    assert_eq!(fs.read(Path::new("/f"), None, 0, 64).unwrap(), b"XYcdef");
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn read_past_end_is_empty() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"abc").unwrap();
    assert!(fs.read(Path::new("/f"), None, 10, 64).unwrap().is_empty());
}

#[test]
fn releasing_an_unknown_handle_is_ebadf() {
    let (_dir, fs) = setup();
    let err = fs.release(9999).unwrap_err();
    assert_eq!(errno(&err), libc::EBADF);
}

#[test]
fn truncate_by_handle_and_by_path() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"0123456789").unwrap();

    fs.truncate(Path::new("/f"), 4, None).unwrap();
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"0123");

    let fh = fs.open(Path::new("/f"), OpenFlags::WRONLY).unwrap();
    fs.truncate(Path::new("/f"), 2, Some(fh)).unwrap();
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"01");
    fs.release(fh).unwrap();
}

#[test]
fn chmod_applies_permission_bits() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();

    fs.chmod(Path::new("/f"), libc::S_IFREG | 0o640).unwrap();
    let mode = std::fs::metadata(dir.path().join("f"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o640);
}

#[test]
fn utimens_sets_mtime_and_leaves_omitted_atime() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let before = fs.getattr(Path::new("/f")).unwrap();

    fs.utimens(
        Path::new("/f"),
        &TimeSpec::UTIME_OMIT,
        &TimeSpec::new(1_000_000, 0),
    )
    .unwrap();

    let after = fs.getattr(Path::new("/f")).unwrap();
    assert_eq!(after.mtime(), 1_000_000);
    assert_eq!(after.atime(), before.atime());
}

#[test]
fn symlinks_are_not_followed() {
    let (dir, fs) = setup();
    fs.symlink(Path::new("does/not/exist"), Path::new("/l")).unwrap();

    assert_eq!(
        fs.readlink(Path::new("/l")).unwrap(),
        Path::new("does/not/exist")
    );
    assert!(fs.getattr(Path::new("/l")).unwrap().file_type().is_symlink());
    assert!(dir.path().join("l").symlink_metadata().is_ok());
}

#[test]
fn mknod_creates_regular_files_and_fifos() {
    let (dir, fs) = setup();

    fs.mknod(Path::new("/r"), libc::S_IFREG | 0o600, 0).unwrap();
    fs.mknod(Path::new("/p"), libc::S_IFIFO | 0o600, 0).unwrap();

    use std::os::unix::fs::FileTypeExt as _;
    assert!(dir.path().join("r").is_file());
    assert!(
        std::fs::symlink_metadata(dir.path().join("p"))
            .unwrap()
            .file_type()
            .is_fifo()
    );

    let err = fs
        .mknod(Path::new("/r"), libc::S_IFREG | 0o600, 0)
        .unwrap_err();
    assert_eq!(errno(&err), libc::EEXIST);
}

#[test]
fn unlink_and_rmdir_forward_to_the_host() {
    let (dir, fs) = setup();
    std::fs::create_dir(dir.path().join("d")).unwrap();
    std::fs::write(dir.path().join("d/f"), b"").unwrap();

    let err = fs.rmdir(Path::new("/d")).unwrap_err();
    assert_eq!(errno(&err), libc::ENOTEMPTY);

    fs.unlink(Path::new("/d/f")).unwrap();
    fs.rmdir(Path::new("/d")).unwrap();
    assert!(!dir.path().join("d").exists());
}

#[test]
fn readdir_lists_dot_entries_first() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    std::fs::create_dir(dir.path().join("d")).unwrap();

    let entries = fs.readdir(Path::new("/")).unwrap();
    let names: Vec<_> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(&names[..2], &[".", ".."]);
    assert_eq!(entries.len(), 4);

    let d = entries.iter().find(|e| e.name == "d").unwrap();
    assert_eq!(d.kind, DirEntryType::Directory);
    let f = entries.iter().find(|e| e.name == "f").unwrap();
    assert_eq!(f.kind, DirEntryType::RegularFile);
    assert_eq!(f.ino, std::fs::metadata(dir.path().join("f")).unwrap().ino());
}

#[test]
fn access_reports_missing_files() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    fs.access(Path::new("/f"), libc::F_OK).unwrap();
    let err = fs.access(Path::new("/ghost"), libc::F_OK).unwrap_err();
    assert_eq!(errno(&err), libc::ENOENT);
}

#[test]
fn statfs_reports_the_backing_filesystem() {
    let (_dir, fs) = setup();
    let stats = fs.statfs(Path::new("/")).unwrap();
    assert!(stats.block_size() > 0);
}

#[test]
fn fsync_always_succeeds() {
    let (_dir, fs) = setup();
    fs.fsync(Path::new("/anything"), None, true).unwrap();
}

#[test]
fn root_inode_is_never_forgotten() {
    let (_dir, fs) = setup();
    fs.inodes().forget(ROOT_INODE, 10);
    assert_eq!(fs.path_of(ROOT_INODE).unwrap(), Path::new("/"));
    let err = fs.path_of(424_242).unwrap_err();
    assert_eq!(errno(&err), libc::ENOENT);
}
