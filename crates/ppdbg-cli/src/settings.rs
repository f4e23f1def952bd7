//! CLI configuration.
//!
//! Layered lowest to highest: built-in defaults, `ppdbg.toml` (or the file
//! given with `--config`), `PPDBG_*` environment variables, command-line
//! flags.

use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Resolved settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Match service queried when no URI is given.
    pub discovery_url: String,
    /// Debugger endpoint; skips discovery when set.
    #[serde(default)]
    pub uri: Option<String>,
    /// Log level for ppdbg targets.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Where saved breakpoints live.
    pub breakpoint_dir: PathBuf,
    /// Whether to save and restore breakpoints per game.
    pub persist_breakpoints: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_url: ppdbg_client::DISCOVERY_URL.to_string(),
            uri: None,
            log_level: "warn".to_string(),
            log_format: LogFormat::Pretty,
            breakpoint_dir: PathBuf::from("breakpoints"),
            persist_breakpoints: false,
        }
    }
}

/// Values given on the command line. `None` leaves lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub uri: Option<String>,
    pub discovery_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub breakpoint_dir: Option<PathBuf>,
    pub persist_breakpoints: bool,
}

/// Load settings, reading `config_file` if given (it must exist) or
/// `ppdbg.toml` in the working directory if present.
pub fn load(config_file: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
    let defaults = Settings::default();

    let mut builder = Config::builder()
        .set_default("discovery_url", defaults.discovery_url)?
        .set_default("log_level", defaults.log_level)?
        .set_default("log_format", defaults.log_format.as_str())?
        .set_default(
            "breakpoint_dir",
            defaults.breakpoint_dir.to_string_lossy().into_owned(),
        )?
        .set_default("persist_breakpoints", defaults.persist_breakpoints)?;

    builder = match config_file {
        Some(path) => builder.add_source(File::from(path)),
        None => builder.add_source(File::with_name("ppdbg").required(false)),
    };

    builder = builder
        .add_source(Environment::with_prefix("PPDBG").try_parsing(true))
        .set_override_option("uri", overrides.uri.clone())?
        .set_override_option("discovery_url", overrides.discovery_url.clone())?
        .set_override_option("log_level", overrides.log_level.clone())?
        .set_override_option("log_format", overrides.log_format.map(LogFormat::as_str))?
        .set_override_option(
            "breakpoint_dir",
            overrides
                .breakpoint_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
        )?;
    if overrides.persist_breakpoints {
        builder = builder.set_override("persist_breakpoints", true)?;
    }

    builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")
}
