use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use shellmux_core::CommandOutput;
use shellmux_core::CreateSessionParams;
use shellmux_core::DEFAULT_SESSION_ID;
use shellmux_core::ExecCommandParams;
use shellmux_core::SessionError;
use shellmux_core::SessionId;
use shellmux_core::SessionManager;
use shellmux_core::SessionManagerConfig;

#[derive(Debug, Parser)]
pub struct ExecCli {
    /// Session to run in; created on first use.
    #[arg(long = "session-id", value_name = "ID", default_value = DEFAULT_SESSION_ID)]
    session_id: String,

    /// Working directory for the session's shell.
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Per-command timeout; the configured default applies when omitted.
    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Detach each command as a background job.
    #[arg(long = "background", default_value_t = false)]
    background: bool,

    /// Print one JSON object per command instead of text.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Commands to run, in order.
    #[arg(value_name = "COMMAND", required = true)]
    commands: Vec<String>,
}

pub async fn run(cli: ExecCli, config: SessionManagerConfig) -> Result<()> {
    let manager = SessionManager::new(config);
    let result = run_commands(&manager, &cli).await;
    manager.shutdown().await;
    result
}

async fn run_commands(manager: &SessionManager, cli: &ExecCli) -> Result<()> {
    let session_id = SessionId::from(cli.session_id.as_str());
    open_session(manager, &session_id, cli.cwd.clone()).await?;

    for command in &cli.commands {
        let mut params = ExecCommandParams::new(session_id.clone(), command.as_str());
        if let Some(timeout) = cli.timeout {
            params = params.with_timeout_secs(timeout);
        }
        if cli.background {
            params = params.in_background();
        }
        let output = manager
            .execute_command(params)
            .await
            .with_context(|| format!("failed to run `{command}`"))?;
        print_output(&output, cli.json)?;
    }
    Ok(())
}

pub(crate) async fn open_session(
    manager: &SessionManager,
    session_id: &SessionId,
    cwd: Option<PathBuf>,
) -> Result<()> {
    let mut params = CreateSessionParams::named(session_id.clone());
    params.working_directory = cwd;
    match manager.create_session(params).await {
        Ok(_) | Err(SessionError::DuplicateSession { .. }) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to create session '{session_id}'")),
    }
}

pub(crate) fn print_output(output: &CommandOutput, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(output).context("failed to serialize command output")?;
        println!("{line}");
    } else {
        println!("{}", output.to_text_output());
    }
    Ok(())
}
