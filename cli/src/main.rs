use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use shellmux_core::CONFIG_TOML_FILE;
use shellmux_core::SessionManagerConfig;
use tracing_subscriber::EnvFilter;

mod exec_cmd;
mod repl_cmd;

use exec_cmd::ExecCli;
use repl_cmd::ReplCli;

/// Run commands in persistent shell sessions.
#[derive(Debug, Parser)]
#[command(name = "shellmux", version)]
struct MultitoolCli {
    /// Path to a TOML config file. Defaults to `$SHELLMUX_HOME/config.toml`,
    /// then `~/.shellmux/config.toml`.
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Subcommands,
}

#[derive(Debug, Subcommand)]
enum Subcommands {
    /// Run one or more commands in a single session and print the results.
    Exec(ExecCli),

    /// Read commands from stdin line by line.
    Repl(ReplCli),
}

fn main() -> Result<()> {
    let cli = MultitoolCli::parse();
    setup_tracing();

    let config = load_config(cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(async move {
        match cli.subcommand {
            Subcommands::Exec(exec_cli) => exec_cmd::run(exec_cli, config).await,
            Subcommands::Repl(repl_cli) => repl_cmd::run(repl_cli, config).await,
        }
    })
}

/// Logs go to stderr; stdout carries command results only.
fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(explicit: Option<PathBuf>) -> Result<SessionManagerConfig> {
    if let Some(path) = explicit {
        return SessionManagerConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    match default_config_path() {
        Some(path) => SessionManagerConfig::load_or_default(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SessionManagerConfig::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = match std::env::var_os("SHELLMUX_HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => dirs::home_dir()?.join(".shellmux"),
    };
    Some(home.join(CONFIG_TOML_FILE))
}
