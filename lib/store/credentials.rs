use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret as _, SecretString};
use tracing::{debug, instrument};

use super::{StoreError, read_records};

/// Number of fields in a credential record: `username,password,address,user_id`.
const CREDENTIAL_FIELDS: usize = 4;

/// A user's record in the credential file.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
    /// Where one-time passcodes are delivered (phone number, e-mail, ...).
    pub address: String,
    /// The identifier permission records refer to.
    pub user_id: String,
}

impl Credential {
    /// Byte-exact password comparison.
    #[must_use]
    pub fn password_matches(&self, candidate: &SecretString) -> bool {
        self.password.expose_secret() == candidate.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"****")
            .field("address", &self.address)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Lookup over the credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the first record whose username equals `username` exactly.
    ///
    /// Returns `Ok(None)` when no record matches.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] when the file cannot be read, [`StoreError::Malformed`] when the
    /// matching record does not have exactly four fields.
    #[instrument(name = "CredentialStore::lookup", skip(self), fields(path = %self.path.display()))]
    pub fn lookup(&self, username: &str) -> Result<Option<Credential>, StoreError> {
        let records = read_records(&self.path)?;
        let Some(record) = records.into_iter().find(|r| r.key() == username) else {
            debug!("no credential record");
            return Ok(None);
        };

        let Ok(fields) = <[String; CREDENTIAL_FIELDS]>::try_from(record.fields) else {
            return Err(StoreError::Malformed {
                path: self.path.clone(),
                line: record.line,
            });
        };
        let [username, password, address, user_id] = fields;

        Ok(Some(Credential {
            username,
            password: SecretString::from(password),
            address,
            user_id,
        }))
    }
}
