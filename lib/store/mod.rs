//! Read-only lookups over the comma-separated credential and permission files.
//!
//! Both stores re-open and re-parse their backing file on every call. Edits to either file are
//! visible to the very next `open`.

/// Username keyed credential records.
pub mod credentials;
/// Path keyed permission records.
pub mod permissions;

pub use credentials::{Credential, CredentialStore};
pub use permissions::{Grant, PermissionStore};

use std::io::{BufRead as _, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while reading a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be opened or read.
    #[error("failed to read store {path}: {source}")]
    Io {
        /// The store file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record matched the key but does not have the expected shape.
    #[error("malformed record at {path}:{line}")]
    Malformed {
        /// The store file holding the record.
        path: PathBuf,
        /// One-based line number of the offending record.
        line: usize,
    },
}

impl From<&StoreError> for i32 {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::Io { .. } | StoreError::Malformed { .. } => libc::EIO,
        }
    }
}

/// A single parsed line of a store file.
#[derive(Debug)]
pub(crate) struct Record {
    /// One-based line number.
    pub line: usize,
    pub fields: Vec<String>,
}

impl Record {
    pub fn key(&self) -> &str {
        self.fields.first().map_or("", String::as_str)
    }
}

/// Read every non-empty line of `path`, splitting each on commas.
///
/// Fields are positional: `a,,b` yields three fields, the middle one empty. Only the line feed is
/// stripped; a carriage return stays part of the last field.
pub(crate) fn read_records(path: &Path) -> Result<Vec<Record>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = line.map_err(io_err)?;
        if line.is_empty() {
            continue;
        }
        let line = String::from_utf8_lossy(&line);
        records.push(Record {
            line: idx + 1,
            fields: line.split(',').map(ToOwned::to_owned).collect(),
        });
    }
    Ok(records)
}
