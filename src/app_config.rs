//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Every key is optional; a missing
//! file means built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gatefs::access::{DEFAULT_CREDENTIALS_PATH, DEFAULT_PERMISSIONS_PATH, DEFAULT_PRIVILEGED_USER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn gatefs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("gatefs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("gatefs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    gatefs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/gatefs.pid"),
        |rd| rd.join("gatefs.pid"),
    )
}

fn default_log_file() -> PathBuf {
    gatefs_runtime_dir().map_or_else(
        || PathBuf::from("/tmp/gatefs.log"),
        |rd| rd.join("gatefs.log"),
    )
}

fn default_source() -> PathBuf {
    PathBuf::from("/")
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/mnt/gatefs")
}

/// Where the credential and permission records live on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoresConfig {
    pub credentials: PathBuf,
    pub permissions: PathBuf,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from(DEFAULT_CREDENTIALS_PATH),
            permissions: PathBuf::from(DEFAULT_PERMISSIONS_PATH),
        }
    }
}

/// The dialog program used for username, password and passcode entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PromptConfig {
    /// A zenity-compatible program.
    pub program: PathBuf,

    /// How long the passcode dialog stays up.
    pub otp_timeout_secs: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("zenity"),
            otp_timeout_secs: 60,
        }
    }
}

impl PromptConfig {
    pub fn otp_timeout(&self) -> Duration {
        Duration::from_secs(self.otp_timeout_secs)
    }
}

/// The out-of-band passcode delivery program, invoked as `program args.. <address> <token>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeliveryConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["/usr/local/share/gatefs/sms.py".to_owned()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AccessConfig {
    /// The only user allowed to open the protected path.
    pub privileged_user: String,

    /// Notional path reserved for the privileged user. When unset, the credential file's path
    /// as seen through the mount.
    pub protected_path: Option<String>,

    /// Put `create` through the same checks as `open`.
    pub mediate_create: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            privileged_user: DEFAULT_PRIVILEGED_USER.to_owned(),
            protected_path: None,
            mediate_create: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MountConfig {
    pub fs_name: String,
    pub allow_other: bool,

    /// Extra raw `-o` options.
    pub options: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "gatefs".to_owned(),
            allow_other: false,
            options: Vec::new(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon. Uses /var/run/gatefs.pid if not specified.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Where the daemon's stdout and stderr go.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The host directory mirrored at the mount root.
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default)]
    pub stores: StoresConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub mount: MountConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source(),
            mount_point: default_mount_point(),
            stores: StoresConfig::default(),
            prompt: PromptConfig::default(),
            delivery: DeliveryConfig::default(),
            access: AccessConfig::default(),
            mount: MountConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.source.is_dir() {
            errors.push(format!(
                "Source '{}' is not an existing directory.",
                self.source.display()
            ));
        }

        if self.prompt.otp_timeout_secs == 0 {
            errors.push("prompt.otp-timeout-secs must be greater than zero.".to_owned());
        }

        if self.prompt.program.as_os_str().is_empty() {
            errors.push("prompt.program must not be empty.".to_owned());
        }

        if self.delivery.program.as_os_str().is_empty() {
            errors.push("delivery.program must not be empty.".to_owned());
        }

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The notional path only the privileged user may open.
    ///
    /// An explicit `access.protected-path` wins. Otherwise this is the credential file's path
    /// relative to `source`, or the credential path verbatim when it lives outside `source`.
    pub fn protected_path(&self) -> String {
        if let Some(path) = &self.access.protected_path {
            return path.clone();
        }

        self.stores
            .credentials
            .strip_prefix(&self.source)
            .map_or_else(
                |_| self.stores.credentials.clone(),
                |rest| Path::new("/").join(rest),
            )
            .display()
            .to_string()
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("gatefs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("gatefs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/gatefs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to the defaults when no file exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::load(external_config_path) {
            Some(res) => {
                let config = res?;
                debug!("Loaded configuration successfully.");
                Ok(config)
            }
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}
