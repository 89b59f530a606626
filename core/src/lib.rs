//! Persistent shell sessions driven through stdin, with marker-framed
//! command results.

#![deny(clippy::print_stdout, clippy::print_stderr)]

#[cfg(not(unix))]
compile_error!("shellmux-core relies on POSIX process groups and signals");

mod background;
mod config;
mod error;
mod output;
mod params;
mod protocol;
mod reaper;
mod registry;
mod session;
mod session_id;
mod session_manager;
mod shell_process;

pub use background::BackgroundJob;
pub use background::JobId;
pub use config::CONFIG_TOML_FILE;
pub use config::SessionManagerConfig;
pub use error::ConfigError;
pub use error::Result;
pub use error::SessionError;
pub use output::OutputEntry;
pub use output::OutputQueue;
pub use output::QueueRead;
pub use output::StreamTag;
pub use params::CreateSessionParams;
pub use params::DEFAULT_SESSION_ID;
pub use params::ExecCommandParams;
pub use protocol::CommandOutput;
pub use protocol::Dispatch;
pub use session::Session;
pub use session::SessionStatus;
pub use session::SessionSummary;
pub use session_id::SessionId;
pub use session_manager::SessionManager;
pub use shell_process::ShellProcess;
