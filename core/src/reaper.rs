use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;
use crate::session_id::SessionId;

/// Periodic sweep that kills sessions whose shell has exited or that have
/// sat idle past the configured limit.
#[derive(Debug)]
pub(crate) struct Reaper {
    cancel: CancellationToken,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(registry: Arc<SessionRegistry>) -> Self {
        let cancel = CancellationToken::new();
        let period = registry.config().reap_interval();
        let handle = tokio::spawn(run_reap_loop(registry, period, cancel.clone()));
        Self {
            cancel,
            handle: StdMutex::new(Some(handle)),
        }
    }

    /// Cancels the loop and waits for an in-flight pass to finish.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(err) = handle.await {
            tracing::warn!("reaper task ended abnormally: {err}");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_reap_loop(registry: Arc<SessionRegistry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    // Skip the immediate tick so the first sweep happens one period in.
    let mut skipped_first_tick = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !skipped_first_tick {
                    skipped_first_tick = true;
                    continue;
                }
                let reaped = reap_once(&registry).await;
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "reaped stale sessions");
                }
            }
        }
    }
    tracing::debug!("reaper stopped");
}

/// One sweep. Dead sessions are always collected; idle ones only when no
/// command is in flight.
pub(crate) async fn reap_once(registry: &SessionRegistry) -> Vec<SessionId> {
    let max_idle = registry.config().max_idle();
    let mut stale = Vec::new();
    for session in registry.snapshot().await {
        if !session.is_alive() {
            tracing::info!(session_id = %session.id(), "reaping dead session");
            stale.push(session.id().clone());
        } else if !session.is_busy() && session.idle_for() > max_idle {
            tracing::info!(
                session_id = %session.id(),
                idle_secs = session.idle_for().as_secs(),
                "reaping idle session"
            );
            stale.push(session.id().clone());
        }
    }

    let mut reaped = Vec::with_capacity(stale.len());
    for session_id in stale {
        if registry.kill(&session_id).await {
            reaped.push(session_id);
        }
    }
    reaped
}
