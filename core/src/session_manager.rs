use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::config::SessionManagerConfig;
use crate::error::Result;
use crate::error::SessionError;
use crate::params::CreateSessionParams;
use crate::params::ExecCommandParams;
use crate::protocol::CommandOutput;
use crate::protocol::Dispatch;
use crate::protocol::ProtocolTiming;
use crate::reaper::Reaper;
use crate::reaper::reap_once;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::session::SessionSummary;
use crate::session_id::SessionId;

/// Entry point for callers: owns the registry and the background reaper.
///
/// Construction spawns the reaper, so it must happen inside a tokio
/// runtime. Call [`SessionManager::shutdown`] to stop the reaper and kill
/// every shell; dropping the manager only stops the reaper, and the shells
/// are then killed as their sessions drop.
#[derive(Debug)]
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    timing: ProtocolTiming,
    reaper: Reaper,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        let timing = ProtocolTiming::from(&config);
        let registry = Arc::new(SessionRegistry::new(config));
        let reaper = Reaper::spawn(Arc::clone(&registry));
        Self {
            registry,
            timing,
            reaper,
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        self.registry.config()
    }

    /// Spawns a new shell. Fails with [`SessionError::DuplicateSession`]
    /// if the id is taken; the existing session is left untouched.
    pub async fn create_session(&self, params: CreateSessionParams) -> Result<SessionId> {
        self.registry.create(params).await
    }

    /// Returns the existing session with this id, creating it first if
    /// needed.
    pub async fn ensure_session(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if let Some(session) = self.registry.get(session_id).await {
            return Ok(session);
        }
        match self
            .registry
            .create(CreateSessionParams::named(session_id.clone()))
            .await
        {
            // Lost a race with another creator; theirs is just as good.
            Ok(_) | Err(SessionError::DuplicateSession { .. }) => {}
            Err(err) => return Err(err),
        }
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::not_found(session_id))
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Option<SessionSummary> {
        self.registry
            .get(session_id)
            .await
            .map(|session| session.summary())
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.registry.get(session_id).await
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Returns `false` only when no session with this id was registered.
    pub async fn kill_session(&self, session_id: &SessionId) -> bool {
        self.registry.kill(session_id).await
    }

    /// Runs one command in the named session, creating the session on first
    /// use.
    pub async fn execute_command(&self, params: ExecCommandParams) -> Result<CommandOutput> {
        let session = self.ensure_session(&params.session_id).await?;
        let (dispatch, timeout) = if params.background {
            (Dispatch::Background, self.config().background_grace())
        } else {
            (
                Dispatch::Foreground,
                params
                    .timeout()
                    .unwrap_or_else(|| self.config().default_timeout()),
            )
        };

        tracing::info!(
            session_id = %params.session_id,
            background = params.background,
            timeout_ms = duration_millis(timeout),
            "executing command"
        );
        let result = session
            .execute(&params.command, dispatch, timeout, &self.timing)
            .await;
        match &result {
            Ok(output) if output.timed_out => tracing::warn!(
                session_id = %params.session_id,
                "command timed out after {:.2}s",
                output.execution_time.as_secs_f64()
            ),
            Ok(output) => tracing::debug!(
                session_id = %params.session_id,
                exit_code = ?output.exit_code,
                "command completed"
            ),
            Err(err) => tracing::error!(
                session_id = %params.session_id,
                "command execution failed: {err}"
            ),
        }
        result
    }

    /// Runs a reaper pass immediately and returns the ids it removed.
    pub async fn reap_stale_sessions(&self) -> Vec<SessionId> {
        reap_once(&self.registry).await
    }

    /// Stops the reaper, then kills every session concurrently.
    pub async fn shutdown(&self) {
        self.reaper.stop().await;
        let ids: Vec<SessionId> = self
            .registry
            .snapshot()
            .await
            .iter()
            .map(|session| session.id().clone())
            .collect();
        let count = ids.len();
        join_all(ids.iter().map(|id| self.registry.kill(id))).await;
        tracing::info!(count, "session manager shut down");
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
