#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gatefs::access::AccessMediator;
use gatefs::delivery::DeliveryGateway;
use gatefs::otp::Otp;
use gatefs::prompt::{PromptChannel, PromptError};
use secrecy::SecretString;
use tempfile::TempDir;

/// Records every passcode it is asked to deliver.
#[derive(Default)]
pub struct RecordingDelivery {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingDelivery {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_token(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, t)| t.clone())
    }

    pub fn last_address(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(a, _)| a.clone())
    }
}

#[async_trait]
impl DeliveryGateway for RecordingDelivery {
    async fn deliver(&self, address: &str, token: &Otp) {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_owned(), token.expose().to_owned()));
    }
}

/// How the fake user answers the passcode prompt.
pub enum OtpAnswer {
    /// Type back whatever was just delivered.
    Echo(Arc<RecordingDelivery>),
    /// Type this.
    Fixed(String),
    /// Let the dialog expire.
    TimeOut,
}

/// A user who types scripted answers.
pub struct FakePrompt {
    username: String,
    password: String,
    otp: OtpAnswer,
    /// Titles of every dialog shown, in order.
    pub shown: Mutex<Vec<String>>,
    /// Messages of every error dialog shown.
    pub errors: Mutex<Vec<String>>,
    /// The timeout requested for each masked prompt.
    pub timeouts: Mutex<Vec<Option<Duration>>>,
}

impl FakePrompt {
    pub fn new(username: &str, password: &str, otp: OtpAnswer) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            otp,
            shown: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn dialogs(&self) -> usize {
        self.shown.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

#[async_trait]
impl PromptChannel for FakePrompt {
    async fn prompt_text(
        &self,
        title: &str,
        _message: &str,
        limit: usize,
    ) -> Result<String, PromptError> {
        self.shown.lock().unwrap().push(title.to_owned());
        Ok(self.username.chars().take(limit).collect())
    }

    async fn prompt_password(
        &self,
        title: &str,
        _message: &str,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<SecretString, PromptError> {
        self.shown.lock().unwrap().push(title.to_owned());
        self.timeouts.lock().unwrap().push(timeout);

        let answer = if timeout.is_none() {
            self.password.clone()
        } else {
            match &self.otp {
                OtpAnswer::Echo(delivery) => delivery.last_token().unwrap_or_default(),
                OtpAnswer::Fixed(answer) => answer.clone(),
                OtpAnswer::TimeOut => return Err(PromptError::TimedOut),
            }
        };
        Ok(SecretString::from(
            answer.chars().take(limit).collect::<String>(),
        ))
    }

    async fn prompt_error(&self, message: &str) -> Result<(), PromptError> {
        self.shown.lock().unwrap().push("error".to_owned());
        self.errors.lock().unwrap().push(message.to_owned());
        Ok(())
    }
}

/// Scratch credential and permission files.
pub struct Stores {
    pub dir: TempDir,
    pub credentials: PathBuf,
    pub permissions: PathBuf,
}

impl Stores {
    pub fn new(credentials: &str, permissions: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cred_path = dir.path().join("autenticacao.txt");
        let perm_path = dir.path().join("permission.txt");
        std::fs::write(&cred_path, credentials).unwrap();
        std::fs::write(&perm_path, permissions).unwrap();
        Self {
            dir,
            credentials: cred_path,
            permissions: perm_path,
        }
    }

    pub fn mediator(
        &self,
        prompt: Arc<FakePrompt>,
        delivery: Arc<RecordingDelivery>,
    ) -> AccessMediator {
        AccessMediator::builder(prompt, delivery)
            .credentials(&self.credentials)
            .permissions(&self.permissions)
            .protected_path("/Teste/autenticacao.txt")
            .build()
    }
}

/// A user typing `username`/`password` who echoes the delivered passcode.
pub fn honest_user(username: &str, password: &str) -> (Arc<FakePrompt>, Arc<RecordingDelivery>) {
    let delivery = Arc::new(RecordingDelivery::default());
    let prompt = Arc::new(FakePrompt::new(
        username,
        password,
        OtpAnswer::Echo(Arc::clone(&delivery)),
    ));
    (prompt, delivery)
}
