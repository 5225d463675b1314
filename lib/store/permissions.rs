use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use super::{StoreError, read_records};

/// Maximum number of fields considered in a permission record: the path plus four user-IDs.
const MAX_PERMISSION_FIELDS: usize = 5;

/// The outcome of an authorization lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted,
    Denied,
}

/// Lookup over the permission file.
#[derive(Debug, Clone)]
pub struct PermissionStore {
    path: PathBuf,
}

impl PermissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decide whether `user_id` may open `path`.
    ///
    /// The first record keyed by `path` decides. A path with no record is denied to everyone.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] when the permission file cannot be read.
    #[instrument(name = "PermissionStore::authorize", skip(self), fields(store = %self.path.display()))]
    pub fn authorize(&self, path: &str, user_id: &str) -> Result<Grant, StoreError> {
        let records = read_records(&self.path)?;
        let Some(record) = records.iter().find(|r| r.key() == path) else {
            debug!("no permission record");
            return Ok(Grant::Denied);
        };

        let granted = record
            .fields
            .iter()
            .take(MAX_PERMISSION_FIELDS)
            .skip(1)
            .any(|uid| uid == user_id);

        Ok(if granted { Grant::Granted } else { Grant::Denied })
    }
}
