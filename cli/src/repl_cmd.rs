use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use shellmux_core::DEFAULT_SESSION_ID;
use shellmux_core::ExecCommandParams;
use shellmux_core::SessionId;
use shellmux_core::SessionManager;
use shellmux_core::SessionManagerConfig;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use crate::exec_cmd::open_session;
use crate::exec_cmd::print_output;

#[derive(Debug, Parser)]
pub struct ReplCli {
    /// Session that plain input lines run in.
    #[arg(long = "session-id", value_name = "ID", default_value = DEFAULT_SESSION_ID)]
    session_id: String,

    /// Working directory for the initial session.
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Per-command timeout; the configured default applies when omitted.
    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum ReplInput<'a> {
    Blank,
    Sessions,
    New { id: &'a str, dir: Option<&'a str> },
    Use { id: &'a str },
    Kill { id: &'a str },
    Quit,
    Unknown(&'a str),
    Command(&'a str),
}

fn parse_line(line: &str) -> ReplInput<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplInput::Blank;
    }
    let Some(meta) = trimmed.strip_prefix(':') else {
        return ReplInput::Command(line);
    };
    let words: Vec<&str> = meta.split_whitespace().collect();
    match words[..] {
        ["sessions"] => ReplInput::Sessions,
        ["quit"] => ReplInput::Quit,
        ["new", id] => ReplInput::New { id, dir: None },
        ["new", id, dir] => ReplInput::New { id, dir: Some(dir) },
        ["use", id] => ReplInput::Use { id },
        ["kill", id] => ReplInput::Kill { id },
        _ => ReplInput::Unknown(trimmed),
    }
}

pub async fn run(cli: ReplCli, config: SessionManagerConfig) -> Result<()> {
    let manager = SessionManager::new(config);
    let result = repl_loop(&manager, &cli).await;
    manager.shutdown().await;
    result
}

async fn repl_loop(manager: &SessionManager, cli: &ReplCli) -> Result<()> {
    let mut current = SessionId::from(cli.session_id.as_str());
    open_session(manager, &current, cli.cwd.clone()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match parse_line(&line) {
            ReplInput::Blank => {}
            ReplInput::Quit => break,
            ReplInput::Sessions => {
                for summary in manager.list_sessions().await {
                    let marker = if summary.id == current { "*" } else { " " };
                    println!(
                        "{marker} {}\t{}\t{}\tcommands={}\tjobs={}",
                        summary.id,
                        summary.status,
                        summary.working_directory.display(),
                        summary.commands_executed,
                        summary.background_jobs
                    );
                }
            }
            ReplInput::New { id, dir } => {
                let id = SessionId::from(id);
                match open_session(manager, &id, dir.map(PathBuf::from)).await {
                    Ok(()) => {
                        println!("using session {id}");
                        current = id;
                    }
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
            ReplInput::Use { id } => {
                let id = SessionId::from(id);
                if manager.get_session(&id).await.is_some() {
                    println!("using session {id}");
                    current = id;
                } else {
                    eprintln!("error: session '{id}' not found");
                }
            }
            ReplInput::Kill { id } => {
                let id = SessionId::from(id);
                if manager.kill_session(&id).await {
                    println!("killed session {id}");
                } else {
                    eprintln!("error: session '{id}' not found");
                }
            }
            ReplInput::Unknown(input) => eprintln!("error: unrecognized command `{input}`"),
            ReplInput::Command(command) => {
                let mut params = ExecCommandParams::new(current.clone(), command);
                if let Some(timeout) = cli.timeout {
                    params = params.with_timeout_secs(timeout);
                }
                match manager.execute_command(params).await {
                    Ok(output) => print_output(&output, false)?,
                    Err(err) => eprintln!("error: {err}"),
                }
            }
        }
    }
    Ok(())
}
