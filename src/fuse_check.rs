//! FUSE availability checks.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

mod paths {
    pub const FUSE_DEVICE: &str = "/dev/fuse";
    pub const MOUNT_HELPERS: [&str; 2] = ["fusermount3", "fusermount"];
}

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded, or the device node is missing.
    #[error(
        "{path} does not exist. gatefs requires the fuse kernel module.\n\
         Load it with: modprobe fuse"
    )]
    DeviceMissing {
        /// Where the device node was expected.
        path: &'static str,
    },

    /// Something other than a character device sits where the FUSE device should be.
    #[error("{path} exists but is not a character device.")]
    NotACharDevice {
        /// Where the device node was expected.
        path: &'static str,
    },

    /// No `fusermount3`/`fusermount` on `PATH`.
    #[error(
        "No FUSE mount helper (fusermount3 or fusermount) found on PATH.\n\
         Install your distribution's fuse3 package."
    )]
    MountHelperMissing,
}

/// The first executable mount helper found in the `PATH`-style list `search`.
fn mount_helper_in(search: Option<OsString>) -> Option<PathBuf> {
    paths::MOUNT_HELPERS
        .iter()
        .find_map(|helper| which::which_in(helper, search.as_ref(), "/").ok())
}

/// Verify that FUSE is installed and usable.
///
/// Checks that `/dev/fuse` is a character device and that a mount helper is on `PATH`.
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    use std::os::unix::fs::FileTypeExt as _;

    let meta = std::fs::metadata(Path::new(paths::FUSE_DEVICE)).map_err(|_| {
        FuseCheckError::DeviceMissing {
            path: paths::FUSE_DEVICE,
        }
    })?;
    if !meta.file_type().is_char_device() {
        return Err(FuseCheckError::NotACharDevice {
            path: paths::FUSE_DEVICE,
        });
    }

    mount_helper_in(std::env::var_os("PATH"))
        .map(drop)
        .ok_or(FuseCheckError::MountHelperMissing)
}
