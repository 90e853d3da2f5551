//! Command-line interface.

pub mod config;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "drydock", version, about = "Self-hosted control plane for agent sandboxes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (the default when no subcommand is given).
    Serve,
    /// Inspect or validate the effective configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file + environment and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}
