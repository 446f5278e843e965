//! Command-line interface and config loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use lf_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "leadflow", version, about = "Conversational sales agent gateway")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "leadflow.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Load the config file, falling back to defaults when it is absent
/// (dev mode).
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    } else {
        tracing::info!(path = %path.display(), "no config file — using defaults");
        Ok(Config::default())
    }
}
