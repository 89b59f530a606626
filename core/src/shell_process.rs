use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::error::SessionError;
use crate::output::OutputQueue;
use crate::output::StreamTag;
use crate::output::spawn_reader;

const EXIT_CODE_SIGNAL_BASE: i32 = 128;

/// One non-interactive shell child, leader of its own process group.
///
/// The child is awaited by a dedicated task which publishes the exit code on a
/// watch channel, so liveness checks never block and never steal the status.
/// Stdin is fed by a writer task, so a shell that stops reading never blocks
/// callers or termination.
#[derive(Debug)]
pub struct ShellProcess {
    pid: u32,
    stdin: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    stdout: Arc<OutputQueue>,
    stderr: Arc<OutputQueue>,
    exit_rx: watch::Receiver<Option<i32>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShellProcess {
    pub fn spawn(
        shell: &Path,
        shell_args: &[String],
        working_directory: &Path,
        environment: &HashMap<OsString, OsString>,
    ) -> Result<Self> {
        let spawn_err =
            |source| SessionError::spawn(shell.to_path_buf(), working_directory.to_path_buf(), source);

        if !working_directory.is_dir() {
            return Err(spawn_err(io::Error::new(
                io::ErrorKind::NotFound,
                "working directory does not exist",
            )));
        }

        let mut command = Command::new(shell);
        command
            .args(shell_args)
            .current_dir(working_directory)
            .env_clear()
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(spawn_err)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(io::Error::other("shell exited before it could be tracked")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdin pipe was not available")))?;
        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdout pipe was not available")))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stderr pipe was not available")))?;

        let stdout = Arc::new(OutputQueue::new(StreamTag::Stdout));
        let stderr = Arc::new(OutputQueue::new(StreamTag::Stderr));
        let stdout_task = spawn_reader(stdout_pipe, Arc::clone(&stdout));
        let stderr_task = spawn_reader(stderr_pipe, Arc::clone(&stderr));

        let (exit_tx, exit_rx) = watch::channel(None);
        let wait_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    tracing::warn!(pid, "failed to wait for shell: {err}");
                    -1
                }
            };
            tracing::debug!(pid, code, "shell exited");
            let _ = exit_tx.send(Some(code));
        });

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let stdin_task = spawn_writer(stdin, stdin_rx, pid);

        Ok(Self {
            pid,
            stdin: StdMutex::new(Some(stdin_tx)),
            stdout,
            stderr,
            exit_rx,
            tasks: vec![stdin_task, stdout_task, stderr_task, wait_task],
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdout(&self) -> &Arc<OutputQueue> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Arc<OutputQueue> {
        &self.stderr
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code once the shell has been reaped; signals map to 128 + signo.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Queues `bytes` for the shell's stdin and returns without waiting for
    /// the pipe to accept them. Writes reach the shell in call order.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(SessionError::broken_pipe());
        }
        let guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let stdin = guard.as_ref().ok_or_else(SessionError::broken_pipe)?;
        stdin
            .send(bytes.to_vec())
            .map_err(|_| SessionError::broken_pipe())
    }

    /// Dropping the sender ends the writer task, which closes the pipe.
    fn close_stdin(&self) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Waits up to `limit` for the shell to exit. Returns whether it did.
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some)).await {
            Ok(_) => true,
            Err(_) => !self.is_alive(),
        }
    }

    async fn wait(&self) {
        let mut exit_rx = self.exit_rx.clone();
        let _ = exit_rx.wait_for(Option::is_some).await;
    }

    /// SIGTERM to the whole process group, then SIGKILL once `grace` elapses.
    /// A shell that already exited is left alone. Pending stdin is never
    /// waited on.
    pub async fn terminate(&self, grace: Duration) -> io::Result<()> {
        if !self.is_alive() {
            self.close_stdin();
            return Ok(());
        }

        let result = self.signal_and_wait(grace).await;
        self.close_stdin();
        result
    }

    async fn signal_and_wait(&self, grace: Duration) -> io::Result<()> {
        signal_process_group(self.pid, libc::SIGTERM)?;
        if self.wait_for_exit(grace).await {
            return Ok(());
        }

        tracing::warn!(pid = self.pid, "shell outlived grace period; sending SIGKILL");
        signal_process_group(self.pid, libc::SIGKILL)?;
        self.wait().await;
        Ok(())
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            if let Err(err) = signal_process_group(self.pid, libc::SIGKILL) {
                tracing::warn!(pid = self.pid, "failed to kill shell on drop: {err}");
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_writer(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pid: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let written = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            };
            if let Err(err) = written.await {
                tracing::debug!(pid, "stdin writer stopped: {err}");
                break;
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| EXIT_CODE_SIGNAL_BASE + signo))
        .unwrap_or(-1)
}

/// Sends `signal` to the process group led by `pgid`. A group that no longer
/// exists is not an error.
pub(crate) fn signal_process_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid).map_err(io::Error::other)?;
    // SAFETY: killpg has no memory-safety preconditions.
    let result = unsafe { libc::killpg(pgid, signal) };
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::QueueRead;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn bash_args() -> Vec<String> {
        vec!["--norc".to_string(), "--noprofile".to_string()]
    }

    fn spawn_in(dir: &Path) -> ShellProcess {
        let env: HashMap<OsString, OsString> = std::env::vars_os().collect();
        ShellProcess::spawn(Path::new("/bin/bash"), &bash_args(), dir, &env).unwrap()
    }

    async fn next_stdout_line(process: &ShellProcess) -> String {
        loop {
            match process.stdout().try_pop() {
                QueueRead::Entry(entry) => return entry.text,
                QueueRead::Empty => process.stdout().readable().await,
                QueueRead::Closed => panic!("stdout closed before a line arrived"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_working_directory_fails_to_spawn() {
        let err = ShellProcess::spawn(
            Path::new("/bin/bash"),
            &bash_args(),
            Path::new("/definitely/not/here"),
            &HashMap::new(),
        )
        .unwrap_err();
        assert_matches!(err, SessionError::ProcessSpawn { .. });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_shell_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellProcess::spawn(
            &PathBuf::from("/no/such/shell"),
            &[],
            dir.path(),
            &HashMap::new(),
        )
        .unwrap_err();
        assert_matches!(err, SessionError::ProcessSpawn { .. });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_reach_the_shell_and_output_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_in(dir.path());
        process.write(b"echo ready\n").unwrap();
        assert_eq!(next_stdout_line(&process).await, "ready");
        process.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_is_idempotent_and_write_after_exit_is_broken_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_in(dir.path());
        assert!(process.is_alive());

        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_alive());
        assert!(process.exit_code().is_some());

        process.terminate(Duration::from_secs(2)).await.unwrap();
        let err = process.write(b"echo nope\n").unwrap_err();
        assert_matches!(err, SessionError::BrokenPipe { .. });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_in(dir.path());
        process.write(b"trap '' TERM; echo trapped\n").unwrap();
        assert_eq!(next_stdout_line(&process).await, "trapped");

        process.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(EXIT_CODE_SIGNAL_BASE + libc::SIGKILL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_to_a_shell_that_stopped_reading_do_not_block_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_in(dir.path());
        process.write(b"sleep 30\n").unwrap();

        // Far larger than a pipe buffer; the shell is busy in `sleep`.
        let filler = vec![b':'; 1024 * 1024];
        tokio::time::timeout(Duration::from_secs(1), async {
            process.write(&filler).unwrap();
            process.write(&filler).unwrap();
        })
        .await
        .expect("write waited on the pipe");

        tokio::time::timeout(
            Duration::from_secs(5),
            process.terminate(Duration::from_millis(500)),
        )
        .await
        .expect("terminate waited on the pipe")
        .unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_exit_is_observed_without_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_in(dir.path());
        process.write(b"exit 3\n").unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(2)).await);
        assert_eq!(process.exit_code(), Some(3));
    }
}
