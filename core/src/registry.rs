use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::config::SessionManagerConfig;
use crate::error::Result;
use crate::error::SessionError;
use crate::params::CreateSessionParams;
use crate::session::Session;
use crate::session::SessionSummary;
use crate::session_id::SessionId;
use crate::shell_process::ShellProcess;

/// Identifier -> session map. Lookups and listings share a read lock;
/// create and kill take the write lock only to mutate the map.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    config: SessionManagerConfig,
    sessions: RwLock<IndexMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub(crate) fn new(config: SessionManagerConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(IndexMap::new()),
        }
    }

    pub(crate) fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub(crate) async fn create(&self, params: CreateSessionParams) -> Result<SessionId> {
        let CreateSessionParams {
            session_id,
            working_directory,
            environment: overrides,
        } = params;
        let session_id = session_id.unwrap_or_else(SessionId::generate);

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(SessionError::duplicate(&session_id));
        }

        let working_directory = self.resolve_working_directory(working_directory.as_deref())?;
        // Inherited values need not be UTF-8; they pass through untouched.
        let mut environment: HashMap<OsString, OsString> = std::env::vars_os().collect();
        environment.extend(
            overrides
                .into_iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        );

        let process = ShellProcess::spawn(
            &self.config.shell,
            &self.config.shell_args,
            &working_directory,
            &environment,
        )
        .inspect_err(|err| {
            tracing::error!(session_id = %session_id, "failed to create session: {err}");
        })?;

        tracing::info!(
            session_id = %session_id,
            pid = process.pid(),
            working_directory = %working_directory.display(),
            "created session"
        );
        let session = Session::new(session_id.clone(), process, working_directory, environment);
        sessions.insert(session_id.clone(), Arc::new(session));
        Ok(session_id)
    }

    fn resolve_working_directory(&self, requested: Option<&Path>) -> Result<PathBuf> {
        let spawn_err = |path: &Path, source: io::Error| {
            SessionError::spawn(self.config.shell.clone(), path.to_path_buf(), source)
        };
        let cwd = std::env::current_dir()?;
        match requested {
            None => Ok(cwd),
            Some(path) => {
                let joined = cwd.join(path);
                std::fs::canonicalize(&joined).map_err(|source| spawn_err(&joined, source))
            }
        }
    }

    pub(crate) async fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub(crate) async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub(crate) async fn list(&self) -> Vec<SessionSummary> {
        self.snapshot()
            .await
            .iter()
            .map(|session| session.summary())
            .collect()
    }

    /// Removes the entry, then tears the session down outside the lock.
    /// Termination failures are logged; the entry is gone either way.
    pub(crate) async fn kill(&self, session_id: &SessionId) -> bool {
        let Some(session) = self.sessions.write().await.shift_remove(session_id) else {
            return false;
        };

        match session
            .terminate(
                self.config.termination_grace(),
                self.config.job_termination_grace(),
            )
            .await
        {
            Ok(()) => tracing::info!(session_id = %session_id, "session terminated"),
            Err(err) => {
                tracing::error!(session_id = %session_id, "error while killing session: {err}");
            }
        }
        true
    }
}
