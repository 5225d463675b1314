//! Admission control for `open`.
//!
//! Every mediated open walks the same sequence and stops at the first failure:
//!
//! 1. prompt for a username and a password,
//! 2. authenticate them against the credential store,
//! 3. check the permission store for the path,
//! 4. issue a one-time passcode, deliver it out of band and prompt for it,
//! 5. refuse the credential file itself to anyone but the privileged user.
//!
//! Authorization runs before a passcode is issued, so no code is burned on a path the user could
//! never open. Nothing is remembered between calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::delivery::DeliveryGateway;
use crate::otp::{OTP_LENGTH, OtpGenerator};
use crate::prompt::{CREDENTIAL_LIMIT, OTP_RESPONSE_LIMIT, PromptChannel, PromptError};
use crate::store::{Credential, CredentialStore, Grant, PermissionStore, StoreError};

pub const DEFAULT_CREDENTIALS_PATH: &str = "/Teste/autenticacao.txt";
pub const DEFAULT_PERMISSIONS_PATH: &str = "/Teste/permission.txt";
pub const DEFAULT_PRIVILEGED_USER: &str = "root";
pub const DEFAULT_OTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Why an open was refused.
#[derive(Debug, Error)]
pub enum Denial {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("you are not authorized to open {path}")]
    AuthorizationFailed { path: String },

    #[error("the passcode you entered is incorrect")]
    OtpMismatch,

    #[error("the passcode was not entered in time")]
    OtpTimeout,

    #[error("only {privileged_user} may open {path}")]
    ProtectedFile {
        path: String,
        privileged_user: String,
    },

    #[error("access store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<&Denial> for i32 {
    fn from(d: &Denial) -> Self {
        match d {
            Denial::AuthenticationFailed
            | Denial::AuthorizationFailed { .. }
            | Denial::OtpMismatch
            | Denial::OtpTimeout => libc::EACCES,
            Denial::ProtectedFile { .. } => libc::EPERM,
            Denial::Store(e) => e.into(),
        }
    }
}

/// Who was let in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub username: String,
    pub user_id: String,
}

/// Interposes authentication, authorization and a one-time passcode on `open`.
pub struct AccessMediator {
    credentials: CredentialStore,
    permissions: PermissionStore,
    otp: OtpGenerator,
    otp_timeout: Duration,
    prompt: Arc<dyn PromptChannel>,
    delivery: Arc<dyn DeliveryGateway>,
    protected_path: String,
    privileged_user: String,
    /// Held for a whole prompt session so dialogs from concurrent opens never interleave.
    session: tokio::sync::Mutex<()>,
}

impl AccessMediator {
    pub fn builder(
        prompt: Arc<dyn PromptChannel>,
        delivery: Arc<dyn DeliveryGateway>,
    ) -> AccessMediatorBuilder {
        AccessMediatorBuilder {
            prompt,
            delivery,
            credentials: PathBuf::from(DEFAULT_CREDENTIALS_PATH),
            permissions: PathBuf::from(DEFAULT_PERMISSIONS_PATH),
            protected_path: None,
            privileged_user: DEFAULT_PRIVILEGED_USER.to_owned(),
            otp_length: OTP_LENGTH,
            otp_timeout: DEFAULT_OTP_TIMEOUT,
        }
    }

    /// The notional path only the privileged user may open.
    #[must_use]
    pub fn protected_path(&self) -> &str {
        &self.protected_path
    }

    /// Run the full admission sequence for an open of `path`.
    ///
    /// On denial an error dialog is shown before returning.
    ///
    /// # Errors
    ///
    /// The [`Denial`] describing the first stage that failed.
    #[instrument(name = "AccessMediator::admit", skip(self))]
    pub async fn admit(&self, path: &str) -> Result<Admission, Denial> {
        let _session = self.session.lock().await;

        match self.mediate(path).await {
            Ok(admission) => {
                info!(user = %admission.username, "open admitted");
                Ok(admission)
            }
            Err(denial) => {
                warn!(reason = %denial, "open denied");
                if let Err(e) = self.prompt.prompt_error(&denial.to_string()).await {
                    debug!(error = %e, "error dialog failed");
                }
                Err(denial)
            }
        }
    }

    async fn mediate(&self, path: &str) -> Result<Admission, Denial> {
        let (username, password) = self.ask_credentials().await?;
        let credential = self.authenticate(&username, &password)?;
        self.authorize(path, &credential)?;
        self.verify_passcode(&credential).await?;

        if path == self.protected_path && credential.username != self.privileged_user {
            return Err(Denial::ProtectedFile {
                path: path.to_owned(),
                privileged_user: self.privileged_user.clone(),
            });
        }

        Ok(Admission {
            username: credential.username,
            user_id: credential.user_id,
        })
    }

    async fn ask_credentials(&self) -> Result<(String, SecretString), Denial> {
        let prompt_failed = |e: PromptError| {
            debug!(error = %e, "credential prompt failed");
            Denial::AuthenticationFailed
        };

        let username = self
            .prompt
            .prompt_text("Enter your username", "Username", CREDENTIAL_LIMIT)
            .await
            .map_err(prompt_failed)?;
        let password = self
            .prompt
            .prompt_password("Enter your password", "Password", CREDENTIAL_LIMIT, None)
            .await
            .map_err(prompt_failed)?;

        Ok((username, password))
    }

    fn authenticate(&self, username: &str, password: &SecretString) -> Result<Credential, Denial> {
        if username.is_empty() {
            return Err(Denial::AuthenticationFailed);
        }

        match self.credentials.lookup(username)? {
            Some(credential) if credential.password_matches(password) => Ok(credential),
            Some(_) => {
                debug!(user = username, "password mismatch");
                Err(Denial::AuthenticationFailed)
            }
            None => {
                debug!(user = username, "unknown user");
                Err(Denial::AuthenticationFailed)
            }
        }
    }

    fn authorize(&self, path: &str, credential: &Credential) -> Result<(), Denial> {
        match self.permissions.authorize(path, &credential.user_id)? {
            Grant::Granted => Ok(()),
            Grant::Denied => Err(Denial::AuthorizationFailed {
                path: path.to_owned(),
            }),
        }
    }

    async fn verify_passcode(&self, credential: &Credential) -> Result<(), Denial> {
        let otp = self.otp.generate();
        self.delivery.deliver(&credential.address, &otp).await;

        let response = self
            .prompt
            .prompt_password(
                "Enter the passcode you received",
                "Passcode",
                OTP_RESPONSE_LIMIT,
                Some(self.otp_timeout),
            )
            .await;

        match response {
            Ok(response) if otp.matches(response.expose_secret()) => Ok(()),
            Ok(_) => Err(Denial::OtpMismatch),
            Err(PromptError::TimedOut) => Err(Denial::OtpTimeout),
            Err(e) => {
                debug!(error = %e, "passcode prompt failed");
                Err(Denial::AuthenticationFailed)
            }
        }
    }
}

/// Configures an [`AccessMediator`].
pub struct AccessMediatorBuilder {
    prompt: Arc<dyn PromptChannel>,
    delivery: Arc<dyn DeliveryGateway>,
    credentials: PathBuf,
    permissions: PathBuf,
    protected_path: Option<String>,
    privileged_user: String,
    otp_length: usize,
    otp_timeout: Duration,
}

impl AccessMediatorBuilder {
    #[must_use]
    pub fn credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = path.into();
        self
    }

    #[must_use]
    pub fn permissions(mut self, path: impl Into<PathBuf>) -> Self {
        self.permissions = path.into();
        self
    }

    /// The notional path reserved for the privileged user. Defaults to the credential file path.
    #[must_use]
    pub fn protected_path(mut self, path: impl Into<String>) -> Self {
        self.protected_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn privileged_user(mut self, user: impl Into<String>) -> Self {
        self.privileged_user = user.into();
        self
    }

    #[must_use]
    pub fn otp_length(mut self, length: usize) -> Self {
        self.otp_length = length;
        self
    }

    #[must_use]
    pub fn otp_timeout(mut self, timeout: Duration) -> Self {
        self.otp_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> AccessMediator {
        let protected_path = self
            .protected_path
            .unwrap_or_else(|| self.credentials.display().to_string());

        AccessMediator {
            credentials: CredentialStore::new(self.credentials),
            permissions: PermissionStore::new(self.permissions),
            otp: OtpGenerator::new(self.otp_length),
            otp_timeout: self.otp_timeout,
            prompt: self.prompt,
            delivery: self.delivery,
            protected_path,
            privileged_user: self.privileged_user,
            session: tokio::sync::Mutex::new(()),
        }
    }
}
