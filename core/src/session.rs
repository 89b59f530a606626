use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::background::BackgroundJob;
use crate::background::JobId;
use crate::error::Result;
use crate::error::SessionError;
use crate::protocol::CommandOutput;
use crate::protocol::Dispatch;
use crate::protocol::ProtocolTiming;
use crate::protocol::run_command;
use crate::session_id::SessionId;
use crate::shell_process::ShellProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Dead,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub working_directory: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub commands_executed: usize,
    pub background_jobs: usize,
}

#[derive(Debug)]
struct Activity {
    last_used: DateTime<Utc>,
    last_used_at: Instant,
    history: Vec<String>,
}

/// A registered shell plus its bookkeeping. The process and its output
/// queues are reachable only through this type.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    process: ShellProcess,
    working_directory: PathBuf,
    environment: HashMap<OsString, OsString>,
    created_at: DateTime<Utc>,
    activity: StdMutex<Activity>,
    jobs: StdMutex<IndexMap<JobId, BackgroundJob>>,
    next_job_id: StdMutex<JobId>,
    /// Held from writing a command until its marker is seen (or it times
    /// out), so output from two commands never interleaves.
    dispatch: Mutex<()>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        process: ShellProcess,
        working_directory: PathBuf,
        environment: HashMap<OsString, OsString>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            process,
            working_directory,
            environment,
            created_at: now,
            activity: StdMutex::new(Activity {
                last_used: now,
                last_used_at: Instant::now(),
                history: Vec::new(),
            }),
            jobs: StdMutex::new(IndexMap::new()),
            next_job_id: StdMutex::new(1),
            dispatch: Mutex::new(()),
        }
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs(&self) -> MutexGuard<'_, IndexMap<JobId, BackgroundJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops jobs that have exited and returns the ones still running.
    fn running_jobs(&self) -> MutexGuard<'_, IndexMap<JobId, BackgroundJob>> {
        let mut jobs = self.jobs();
        jobs.retain(|_, job| job.is_running());
        jobs
    }

    fn prune_finished_jobs(&self) {
        let pruned = {
            let mut jobs = self.jobs();
            let before = jobs.len();
            jobs.retain(|_, job| job.is_running());
            before - jobs.len()
        };
        if pruned > 0 {
            tracing::debug!(session_id = %self.id, pruned, "dropped finished background jobs");
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn environment(&self) -> &HashMap<OsString, OsString> {
        &self.environment
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn history(&self) -> Vec<String> {
        self.activity().history.clone()
    }

    /// Jobs that are still running, in dispatch order.
    pub fn background_jobs(&self) -> Vec<BackgroundJob> {
        self.running_jobs().values().cloned().collect()
    }

    /// True while a command holds the dispatch lock.
    pub fn is_busy(&self) -> bool {
        self.dispatch.try_lock().is_err()
    }

    pub fn idle_for(&self) -> Duration {
        self.activity().last_used_at.elapsed()
    }

    pub fn summary(&self) -> SessionSummary {
        let (last_used, commands_executed) = {
            let activity = self.activity();
            (activity.last_used, activity.history.len())
        };
        let background_jobs = self.running_jobs().len();
        SessionSummary {
            id: self.id.clone(),
            working_directory: self.working_directory.clone(),
            status: if self.is_alive() {
                SessionStatus::Active
            } else {
                SessionStatus::Dead
            },
            created_at: self.created_at,
            last_used,
            commands_executed,
            background_jobs,
        }
    }

    fn record_dispatch(&self, command: &str) {
        let mut activity = self.activity();
        activity.last_used = Utc::now();
        activity.last_used_at = Instant::now();
        activity.history.push(command.to_string());
    }

    fn track_job(&self, pid: u32, command: &str) -> JobId {
        let job_id = {
            let mut next = self.next_job_id.lock().unwrap_or_else(PoisonError::into_inner);
            let id = *next;
            *next += 1;
            id
        };
        self.jobs().insert(
            job_id,
            BackgroundJob {
                job_id,
                pid,
                pgid: self.process.pid(),
                command: command.to_string(),
                started_at: Utc::now(),
            },
        );
        tracing::info!(session_id = %self.id, job_id, pid, "tracking background job");
        job_id
    }

    /// Runs one command. Callers queue on the dispatch lock, so commands are
    /// written in submission order and never overlap.
    pub(crate) async fn execute(
        &self,
        command: &str,
        dispatch: Dispatch,
        timeout: Duration,
        timing: &ProtocolTiming,
    ) -> Result<CommandOutput> {
        let _turn = self.dispatch.lock().await;
        if !self.is_alive() {
            return Err(SessionError::dead(&self.id));
        }
        self.record_dispatch(command);
        self.prune_finished_jobs();

        let result = run_command(&self.id, &self.process, command, dispatch, timeout, timing).await?;
        let mut output = result.output;
        if let Some(pid) = result.background_pid {
            output.background_job = Some(self.track_job(pid, command));
        }
        Ok(output)
    }

    /// Background jobs first, then the shell's process group. Each step is
    /// attempted even if an earlier one failed; the first error is returned.
    pub(crate) async fn terminate(&self, grace: Duration, job_grace: Duration) -> std::io::Result<()> {
        let mut first_err = None;
        for job in self.background_jobs() {
            if let Err(err) = job.terminate(job_grace).await {
                tracing::warn!(
                    session_id = %self.id,
                    job_id = job.job_id,
                    pid = job.pid,
                    "failed to terminate background job: {err}"
                );
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.process.terminate(grace).await {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
