//! Installer logging: subscriber setup, step banners and the progress spinner

use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{Stage, VarDict};
use crate::result::{Error, Result};

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "STXAUTO_LOG";

/// Install the global subscriber: human readable to stderr, everything to `log_file`.
///
/// `verbosity` (`trace` .. `error`) sets the default level; [`LOG_ENV`]
/// refines it.
pub fn init(log_file: Option<&Path>, verbosity: Option<&str>) -> Result<()> {
    let level = match verbosity {
        Some(v) => LevelFilter::from_str(v).map_err(|_| Error::InvalidVar {
            key: "verbosity".to_string(),
            value: v.to_string(),
        })?,
        None => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .with_default_directive(level.into())
        .from_env_lossy();

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let file = log_file
        .map(File::create)
        .transpose()?
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file))
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {e}")))
}

/// Banner at the start and end of a stage.
pub fn step(stage: Stage, finished: bool) {
    let state = if finished { "finished" } else { "started" };
    info!("Step {} {state}: {}", stage.number(), stage.name());
}

/// Dump every variable of the run.
pub fn vars(vars: &VarDict) {
    for (key, value) in vars.iter() {
        let value = if key.contains("password") { "******" } else { value };
        info!("{key} = {value}");
    }
}

/// Spinner shown on the terminal during long waits; cleared when dropped.
///
/// Nothing is drawn when stderr is not a terminal.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    /// Start spinning with `message`.
    pub fn start(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed_precise}]") {
            bar.set_style(style.tick_chars("-\\|/ "));
        }
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Change the message.
    pub fn set_message(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
