//! Interactive prompts shown to whoever is sitting at the display.
//!
//! The default [`CommandPrompt`] shells out to a zenity-compatible program and reads the user's
//! answer straight from the child's stdout.

use std::os::unix::process::ExitStatusExt as _;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Byte budget for usernames and passwords.
pub const CREDENTIAL_LIMIT: usize = 30;

/// Byte budget for the one-time passcode response.
pub const OTP_RESPONSE_LIMIT: usize = 7;

/// zenity exits with 1 when the user cancels or closes the dialog.
const EXIT_CANCELLED: i32 = 1;

/// zenity exits with 5 when its own `--timeout` expires.
const EXIT_TIMED_OUT: i32 = 5;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to launch prompt program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("prompt timed out")]
    TimedOut,

    #[error("prompt program exited with {0}")]
    Failed(ExitStatus),

    #[error("failed to collect prompt output: {0}")]
    Io(#[from] std::io::Error),
}

/// A process-wide channel to the user.
///
/// Implementations are not required to serialize concurrent callers; the access mediator holds
/// its own lock around a whole prompt session.
#[async_trait]
pub trait PromptChannel: Send + Sync {
    /// Ask for a line of visible text. At most `limit` bytes of the answer are kept.
    async fn prompt_text(
        &self,
        title: &str,
        message: &str,
        limit: usize,
    ) -> Result<String, PromptError>;

    /// Ask for a masked line. With a `timeout`, the prompt is dismissed once it expires and
    /// [`PromptError::TimedOut`] is returned.
    async fn prompt_password(
        &self,
        title: &str,
        message: &str,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<SecretString, PromptError>;

    /// Show a modal error and return once it is dismissed.
    async fn prompt_error(&self, message: &str) -> Result<(), PromptError>;
}

/// Keep the first line of `output`, looking at no more than `limit` bytes.
///
/// Bytes past `limit` are discarded before the line is split, so an over-long answer is cut
/// rather than rejected.
#[must_use]
pub fn first_line(output: &[u8], limit: usize) -> String {
    let bounded = &output[..output.len().min(limit)];
    let line = bounded
        .split(|b| *b == b'\n')
        .next()
        .unwrap_or_default();
    String::from_utf8_lossy(line).into_owned()
}

/// Runs a zenity-compatible program for each prompt.
#[derive(Debug, Clone)]
pub struct CommandPrompt {
    program: PathBuf,
    /// Extra time granted past the dialog's own timeout before the child is killed.
    grace: Duration,
}

impl CommandPrompt {
    const DEFAULT_GRACE: Duration = Duration::from_secs(5);

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            grace: Self::DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn run(
        &self,
        args: Vec<String>,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<String, PromptError> {
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PromptError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let output = match timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout + self.grace, child.wait_with_output())
                    .await
                    .map_err(|_| {
                        debug!("prompt outlived its timeout, killing it");
                        PromptError::TimedOut
                    })??
            }
            None => child.wait_with_output().await?,
        };

        match output.status.code() {
            Some(0) => Ok(first_line(&output.stdout, limit)),
            Some(EXIT_CANCELLED) => {
                debug!("prompt cancelled");
                Ok(String::new())
            }
            Some(EXIT_TIMED_OUT) => Err(PromptError::TimedOut),
            None if output.status.signal().is_some() => {
                // A killed prompt reads as end-of-input.
                debug!(signal = ?output.status.signal(), "prompt killed");
                Ok(String::new())
            }
            _ => Err(PromptError::Failed(output.status)),
        }
    }
}

#[async_trait]
impl PromptChannel for CommandPrompt {
    #[instrument(name = "CommandPrompt::prompt_text", skip(self, limit))]
    async fn prompt_text(
        &self,
        title: &str,
        message: &str,
        limit: usize,
    ) -> Result<String, PromptError> {
        let args = vec![
            "--entry".to_owned(),
            format!("--title={title}"),
            format!("--text={message}"),
        ];
        self.run(args, limit, None).await
    }

    #[instrument(name = "CommandPrompt::prompt_password", skip(self, limit))]
    async fn prompt_password(
        &self,
        title: &str,
        message: &str,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<SecretString, PromptError> {
        // zenity's password dialog has no body text, so the message rides in the title.
        let mut args = vec![
            "--password".to_owned(),
            format!("--title={title}: {message}"),
        ];
        if let Some(timeout) = timeout {
            args.push(format!("--timeout={}", timeout.as_secs().max(1)));
        }
        self.run(args, limit, timeout).await.map(SecretString::from)
    }

    #[instrument(name = "CommandPrompt::prompt_error", skip(self))]
    async fn prompt_error(&self, message: &str) -> Result<(), PromptError> {
        let args = vec!["--error".to_owned(), format!("--text={message}")];
        match self.run(args, 0, None).await {
            Ok(_) | Err(PromptError::Failed(_)) => Ok(()),
            Err(e) => {
                warn!(error = %e, "could not show error dialog");
                Err(e)
            }
        }
    }
}
