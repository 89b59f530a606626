//! Jobs a session's shell detached with `&`.
//!
//! Only the PID is tracked: liveness is polled and jobs are signaled on
//! session teardown. Their output interleaves into the session streams and
//! their exit status is never collected.
//!
//! A job counts as running only while its PID still sits in the shell's
//! process group, so a recycled PID is never mistaken for the job.

use std::io;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type JobId = u32;

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundJob {
    pub job_id: JobId,
    pub pid: u32,
    /// Process group the job was started in (the shell's).
    pub pgid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

impl BackgroundJob {
    pub fn is_running(&self) -> bool {
        process_group_of(self.pid) == Some(self.pgid) && pid_is_running(self.pid)
    }

    /// SIGTERM, poll for up to `grace`, then SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        signal_pid(self.pid, libc::SIGTERM)?;
        let exited = tokio::time::timeout(grace, async {
            while self.is_running() {
                tokio::time::sleep(JOB_POLL_INTERVAL).await;
            }
        })
        .await;
        if exited.is_ok() {
            return Ok(());
        }
        tracing::warn!(
            job_id = self.job_id,
            pid = self.pid,
            "background job outlived grace period; sending SIGKILL"
        );
        signal_pid(self.pid, libc::SIGKILL)
    }
}

fn signal_pid(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
    // SAFETY: kill has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn process_group_of(pid: u32) -> Option<u32> {
    let pid = libc::pid_t::try_from(pid).ok()?;
    // SAFETY: getpgid has no memory-safety preconditions.
    let pgid = unsafe { libc::getpgid(pid) };
    u32::try_from(pgid).ok()
}

fn pid_is_running(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let exists = unsafe { libc::kill(raw, 0) } == 0
        || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// The shell reaps its children lazily, so an exited job can linger as a
/// zombie that still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state field follows the parenthesised command name, which may itself
    // contain spaces or parentheses.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Parses the `$!` value the shell reports after dispatching a job.
pub(crate) fn parse_job_pid(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_job_pid_accepts_only_positive_integers() {
        assert_eq!(parse_job_pid(" 4242 "), Some(4242));
        assert_eq!(parse_job_pid(""), None);
        assert_eq!(parse_job_pid("0"), None);
        assert_eq!(parse_job_pid("abc"), None);
    }

    fn job_for(pid: u32, pgid: u32) -> BackgroundJob {
        BackgroundJob {
            job_id: 1,
            pid,
            pgid,
            command: "sleep 30".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn current_process_is_running() {
        assert!(pid_is_running(std::process::id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_stops_a_running_job() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let job = job_for(pid, pid);
        assert!(job.is_running());

        // Reap concurrently so the exited job does not stay a zombie.
        let reaper = tokio::spawn(async move { child.wait().await });
        job.terminate(Duration::from_secs(2)).await.unwrap();
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
        assert!(!job.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pid_outside_the_recorded_group_is_left_alone() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Same PID, but recorded under a group it never belonged to.
        let job = job_for(pid, std::process::id());
        assert!(!job.is_running());

        job.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(job_for(pid, pid).is_running());

        child.kill().await.unwrap();
    }
}
