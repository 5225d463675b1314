//! Out-of-band delivery of one-time passcodes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::otp::Otp;

/// Sends a passcode to a user's delivery address.
///
/// Delivery is fire-and-forget: the mediator cannot tell a failed delivery from a successful one
/// and simply waits for the user to type the code.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn deliver(&self, address: &str, token: &Otp);
}

/// Invokes `program [args...] <address> <token>` and waits for it to exit.
#[derive(Debug, Clone)]
pub struct CommandDelivery {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDelivery {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the address and token, e.g. the script an interpreter should run.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl DeliveryGateway for CommandDelivery {
    #[instrument(name = "CommandDelivery::deliver", skip(self, token), fields(program = %self.program.display()))]
    async fn deliver(&self, address: &str, token: &Otp) {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(address)
            .arg(token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => debug!("passcode handed to delivery program"),
            Ok(status) => warn!(%status, "delivery program reported failure, ignoring"),
            Err(e) => warn!(error = %e, "failed to launch delivery program, ignoring"),
        }
    }
}
