//! CLI surface for the `toolbridge` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tb_domain::config::Config;
use tb_domain::error::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "toolbridge", about = "ToolBridge — MCP agent orchestration gateway")]
pub struct Cli {
    /// Path to the TOML config file (default: ./toolbridge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Config inspection helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report problems.
    Validate,
    /// Print the effective config (defaults applied).
    Show,
}

/// Load the config file, falling back to built-in defaults when no file
/// exists at the resolved path.
pub fn load_config(path: Option<&PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from("./toolbridge.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)?;
    let config: Config =
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok((config, path))
}

pub fn validate(path: Option<&PathBuf>) -> bool {
    match load_config(path) {
        Ok((_, path)) => {
            println!("ok: {}", path.display());
            true
        }
        Err(e) => {
            eprintln!("invalid config: {e}");
            false
        }
    }
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
