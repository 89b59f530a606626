use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session_id::SessionId;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{session_id}' not found")]
    SessionNotFound { session_id: SessionId },

    #[error("session '{session_id}' already exists")]
    DuplicateSession { session_id: SessionId },

    #[error("session '{session_id}' is no longer active")]
    SessionDead { session_id: SessionId },

    #[error("failed to spawn `{shell}` in {working_directory}: {source}")]
    ProcessSpawn {
        shell: PathBuf,
        working_directory: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to shell stdin: {source}")]
    BrokenPipe {
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    pub(crate) fn not_found(session_id: &SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.clone(),
        }
    }

    pub(crate) fn duplicate(session_id: &SessionId) -> Self {
        Self::DuplicateSession {
            session_id: session_id.clone(),
        }
    }

    pub(crate) fn dead(session_id: &SessionId) -> Self {
        Self::SessionDead {
            session_id: session_id.clone(),
        }
    }

    pub(crate) fn spawn(shell: PathBuf, working_directory: PathBuf, source: io::Error) -> Self {
        Self::ProcessSpawn {
            shell,
            working_directory,
            source,
        }
    }

    /// Stdin is closed or the shell is gone.
    pub(crate) fn broken_pipe() -> Self {
        Self::BrokenPipe {
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
