//! Mount a host directory through FUSE, with every open gated by a password and a one-time
//! passcode.
use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A passthrough filesystem that asks who you are before letting you open anything."
)]
struct Args {
    /// Where to mount. Overrides `mount-point` from the configuration.
    mount_point: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a gatefs config TOML."
    )]
    config_path: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    foreground: bool,

    /// Debug logging. Implies --foreground.
    #[arg(short, long)]
    debug: bool,

    /// Mount options, comma separated. May be repeated.
    #[arg(short = 'o', value_name = "OPT[,OPT...]")]
    options: Vec<String>,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(mount_point) = args.mount_point {
        config.mount_point = mount_point;
    }
    config.mount.options.extend(args.options);

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    // The daemon runs from `/`, so relative paths are resolved now.
    match std::fs::canonicalize(&config.source) {
        Ok(source) => config.source = source,
        Err(e) => {
            eprintln!("Failed to resolve source '{}': {e}", config.source.display());
            std::process::exit(1);
        }
    }
    if let Ok(mount_point) = std::path::absolute(&config.mount_point) {
        config.mount_point = mount_point;
    }

    let foreground = args.foreground || args.debug;

    if let Err(e) = fuse_check::ensure_fuse() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if !foreground && let Err(e) = daemonize(&config) {
        eprintln!("Failed to spawn the daemon: {e}");
        std::process::exit(1);
    }

    if let Err(e) = Trc::default()
        .with_debug(args.debug)
        .daemonized(!foreground)
        .init()
    {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    debug!(config = ?config, "Starting with configuration...");
    if let Err(e) = daemon::spawn(config) {
        error!("Daemon failed: {e}");
        std::process::exit(1);
    }
}

/// Detach from the terminal. Stdout and stderr are redirected to the configured log file.
fn daemonize(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    for parent in [
        config.daemon.pid_file.parent(),
        config.daemon.log_file.parent(),
    ]
    .into_iter()
    .flatten()
    {
        std::fs::create_dir_all(parent)?;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.daemon.log_file)?;
    let log_clone = log_file.try_clone()?;

    daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .working_directory("/")
        .stdout(log_file)
        .stderr(log_clone)
        .start()?;
    Ok(())
}
