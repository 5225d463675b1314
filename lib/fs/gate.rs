//! Host opens that must first be admitted by the [`AccessMediator`].

use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::passthrough::Passthrough;
use super::{FileHandle, InodeAddr, OpenFlags};
use crate::access::AccessMediator;

/// Puts the admission sequence in front of [`Passthrough::open`] and, optionally,
/// [`Passthrough::create`]. A denial comes back as an `io::Error` carrying the denial's errno.
#[derive(Clone)]
pub struct Gate {
    fs: Arc<Passthrough>,
    mediator: Arc<AccessMediator>,
    mediate_create: bool,
}

impl Gate {
    pub fn new(fs: Arc<Passthrough>, mediator: Arc<AccessMediator>) -> Self {
        Self {
            fs,
            mediator,
            mediate_create: false,
        }
    }

    /// Route `create` through the same admission sequence as `open`.
    #[must_use]
    pub fn mediate_create(mut self, enabled: bool) -> Self {
        self.mediate_create = enabled;
        self
    }

    #[must_use]
    pub fn mediates_create(&self) -> bool {
        self.mediate_create
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<Passthrough> {
        &self.fs
    }

    async fn admit(&self, path: &Path) -> io::Result<()> {
        match self.mediator.admit(&path.to_string_lossy()).await {
            Ok(_) => Ok(()),
            Err(denial) => {
                debug!(reason = %denial, "open denied");
                Err(io::Error::from_raw_os_error(i32::from(&denial)))
            }
        }
    }

    #[instrument(name = "Gate::open", skip(self))]
    pub async fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<FileHandle> {
        self.admit(path).await?;
        self.fs.open(path, flags)
    }

    #[instrument(name = "Gate::create", skip(self))]
    pub async fn create(
        &self,
        parent: &Path,
        name: &OsStr,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<(FileHandle, InodeAddr, Metadata)> {
        if self.mediate_create {
            self.admit(&parent.join(name)).await?;
        }
        self.fs.create(parent, name, flags, mode)
    }
}
