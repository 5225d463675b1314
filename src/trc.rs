//! Tracing configuration and initialization.

use std::io::IsTerminal as _;

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// `FORCE_COLOR` wins over `NO_COLOR`. With neither set, colors follow whether stderr is a tty.
fn stderr_wants_color() -> bool {
    let set = |var: &str| std::env::var_os(var).is_some_and(|v| !v.is_empty());
    set("FORCE_COLOR") || (!set("NO_COLOR") && std::io::stderr().is_terminal())
}

struct FgConfig {
    no_spin: bool,
}

impl FgConfig {
    fn is_ugly(&self) -> bool {
        self.no_spin
    }

    pub fn pretty() -> Self {
        Self { no_spin: false }
    }

    pub fn ugly() -> Self {
        Self { no_spin: true }
    }
}

enum TrcMode {
    Foreground(FgConfig),
    Daemon,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("GATEFS_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            Ok(env_filter) => Self {
                // An explicit filter means someone is debugging; skip the spinners.
                mode: TrcMode::Foreground(FgConfig::ugly()),
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Foreground(FgConfig::pretty()),
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Raise the default filter to `debug`. An explicit `GATEFS_LOG`/`RUST_LOG` still wins.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        if debug && matches!(&self.mode, TrcMode::Foreground(fg) if !fg.is_ugly()) {
            self.env_filter = EnvFilter::new("debug");
        }
        self
    }

    /// Plain output with no terminal decorations, for a process whose stderr is a log file.
    #[must_use]
    pub fn daemonized(mut self, daemonized: bool) -> Self {
        if daemonized {
            self.mode = TrcMode::Daemon;
        }
        self
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match &self.mode {
            TrcMode::Daemon => self.init_ugly_mode(false),
            TrcMode::Foreground(fg_config) => {
                if fg_config.is_ugly() {
                    let ansi = stderr_wants_color();
                    self.init_ugly_mode(ansi)
                } else {
                    self.init_pretty_mode()
                }
            }
        }
    }

    fn init_ugly_mode(self, ansi: bool) -> Result<(), TryInitError> {
        // "Ugly mode" is the plain, verbose, rust logging mode.
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_ansi(ansi)
            .with_writer(std::io::stderr)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        // "Pretty mode" is the compact, colorful mode with progress spinners for pending spans.
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()?;

        Ok(())
    }
}
