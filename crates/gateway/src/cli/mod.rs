pub mod config;

use clap::{Parser, Subcommand};

/// Cadence — a persistent job scheduler.
#[derive(Debug, Parser)]
#[command(name = "cadence", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the scheduler service (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Resolve and parse the config file. `CADENCE_CONFIG` names the path;
/// without it, `config.toml` in the working directory. A missing file is
/// not an error — defaults apply. Returns the config together with the
/// path it came from, for `serve` and the `config` subcommands alike.
pub fn load_config() -> anyhow::Result<(cadence_domain::config::Config, String)> {
    use anyhow::Context;

    let path = std::env::var("CADENCE_CONFIG").unwrap_or_else(|_| "config.toml".into());
    if !std::path::Path::new(&path).exists() {
        return Ok((cadence_domain::config::Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config = toml::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    Ok((config, path))
}
