//! Marker-framed command execution over a shell's stdin/stdout/stderr.
//!
//! After each command the shell is told to print `<marker>:<status>` on
//! stderr and then `<marker>` on stdout, each on a fresh line. The stderr
//! report ends the command; the stdout sentinel flushes any trailing partial
//! line so it is attributed to the right command.

use std::fmt::Write as _;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde::Serializer;
use tokio::time::Instant;

use crate::background::JobId;
use crate::background::parse_job_pid;
use crate::config::SessionManagerConfig;
use crate::error::Result;
use crate::error::SessionError;
use crate::output::QueueRead;
use crate::session_id::SessionId;
use crate::shell_process::ShellProcess;

pub(crate) const MARKER_PREFIX: &str = "__SHELLMUX_DONE_";

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CompletionMarker(String);

impl CompletionMarker {
    /// Nanosecond timestamp plus a process-wide sequence number, so two
    /// markers minted in the same instant still differ.
    pub(crate) fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let seq = MARKER_SEQ.fetch_add(1, Ordering::SeqCst);
        Self(format!("{MARKER_PREFIX}{nanos}_{seq}__"))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// Status text reported on stderr, if `line` is this marker's report.
    fn reported_status<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.split_once(self.as_str())
            .map(|(_, rest)| rest.strip_prefix(':').unwrap_or(rest).trim())
    }

    fn is_stdout_sentinel(&self, line: &str) -> bool {
        line.trim() == self.as_str()
    }
}

/// Leftover report from an earlier command that timed out before its marker
/// arrived.
fn is_stale_marker(line: &str) -> bool {
    line.trim_start().starts_with(MARKER_PREFIX)
}

/// Best-effort filter for prompt echoes such as `bash-5.2$ `.
fn is_prompt_noise(line: &str) -> bool {
    ["bash-", "sh-"].iter().any(|prefix| {
        line.strip_prefix(prefix)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Foreground,
    /// The shell runs the command in a background subshell and reports `$!`.
    Background,
}

pub(crate) fn compose_payload(command: &str, marker: &CompletionMarker, dispatch: Dispatch) -> String {
    let command = command.trim_end();
    let mut payload = String::with_capacity(command.len() + 2 * marker.as_str().len() + 64);
    let status = match dispatch {
        Dispatch::Foreground => {
            payload.push_str(command);
            "$?"
        }
        Dispatch::Background => {
            // The newline before `)` keeps a trailing `;` or comment harmless.
            payload.push('(');
            payload.push_str(strip_background_operator(command));
            payload.push_str("\n) &");
            "$!"
        }
    };
    let marker = marker.as_str();
    let _ = write!(
        payload,
        "\nprintf '\\n%s:%s\\n' '{marker}' \"{status}\" >&2; printf '\\n%s\\n' '{marker}'\n"
    );
    payload
}

/// Drops one trailing lone `&` so the subshell wrapper does not nest a second
/// background job.
fn strip_background_operator(command: &str) -> &str {
    match command.strip_suffix('&') {
        Some(rest) if !rest.ends_with('&') => rest.trim_end(),
        _ => command,
    }
}

/// Instant `timeout` after `start`, saturating far in the future when the
/// sum does not fit.
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub completed: bool,
    pub timed_out: bool,
    #[serde(rename = "execution_time_seconds", serialize_with = "serialize_secs")]
    pub execution_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_job: Option<JobId>,
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl CommandOutput {
    pub fn to_text_output(&self) -> String {
        let mut sections = Vec::new();
        if !self.stdout.is_empty() {
            sections.push(format!("STDOUT:\n{}", self.stdout));
        }
        if !self.stderr.is_empty() {
            sections.push(format!("STDERR:\n{}", self.stderr));
        }

        let mut status = Vec::new();
        if self.timed_out {
            status.push("Command timed out".to_string());
        }
        if self.completed {
            status.push("Command completed".to_string());
        }
        if let Some(code) = self.exit_code {
            status.push(format!("Exit code: {code}"));
        }
        if let Some(job) = self.background_job {
            status.push(format!("Background job: {job}"));
        }
        status.push(format!(
            "Execution time: {:.2}s",
            self.execution_time.as_secs_f64()
        ));
        sections.push(format!("Status: {}", status.join(" | ")));
        sections.join("\n\n")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProtocolTiming {
    pub poll_interval: Duration,
    pub final_recheck_attempts: u32,
    pub final_recheck_interval: Duration,
}

impl From<&SessionManagerConfig> for ProtocolTiming {
    fn from(config: &SessionManagerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            final_recheck_attempts: config.final_recheck_attempts,
            final_recheck_interval: config.final_recheck_interval(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ProtocolResult {
    pub output: CommandOutput,
    /// `$!` reported for a background dispatch.
    pub background_pid: Option<u32>,
}

#[derive(Debug, Default)]
struct Drained {
    got_data: bool,
    streams_closed: bool,
}

#[derive(Debug)]
struct Collector {
    marker: CompletionMarker,
    stdout: Vec<String>,
    stderr: Vec<String>,
    status: Option<String>,
    sentinel_seen: bool,
    stdout_closed: bool,
}

impl Collector {
    fn new(marker: CompletionMarker) -> Self {
        Self {
            marker,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: None,
            sentinel_seen: false,
            stdout_closed: false,
        }
    }

    fn drain(&mut self, process: &ShellProcess) -> Drained {
        let mut drained = Drained::default();
        let mut stderr_closed = false;

        while !self.sentinel_seen {
            match process.stdout().try_pop() {
                QueueRead::Entry(entry) => {
                    drained.got_data = true;
                    if self.marker.is_stdout_sentinel(&entry.text) {
                        self.sentinel_seen = true;
                    } else if !entry.text.is_empty() && !is_stale_marker(&entry.text) {
                        self.stdout.push(entry.text);
                    }
                }
                QueueRead::Empty => break,
                QueueRead::Closed => {
                    self.stdout_closed = true;
                    break;
                }
            }
        }

        while self.status.is_none() {
            match process.stderr().try_pop() {
                QueueRead::Entry(entry) => {
                    drained.got_data = true;
                    if let Some(status) = self.marker.reported_status(&entry.text) {
                        self.status = Some(status.to_string());
                    } else if !entry.text.is_empty()
                        && !is_stale_marker(&entry.text)
                        && !is_prompt_noise(&entry.text)
                    {
                        self.stderr.push(entry.text);
                    }
                }
                QueueRead::Empty => break,
                QueueRead::Closed => {
                    stderr_closed = true;
                    break;
                }
            }
        }

        drained.streams_closed = self.stdout_closed && stderr_closed;
        drained
    }

    fn is_complete(&self) -> bool {
        self.status.is_some() && (self.sentinel_seen || self.stdout_closed)
    }
}

/// Writes `command` plus its marker trailer and collects output until the
/// marker is reported or `timeout` elapses. The shell is never signaled here:
/// a timed-out command keeps running and the session stays usable.
pub(crate) async fn run_command(
    session_id: &SessionId,
    process: &ShellProcess,
    command: &str,
    dispatch: Dispatch,
    timeout: Duration,
    timing: &ProtocolTiming,
) -> Result<ProtocolResult> {
    let marker = CompletionMarker::generate();
    let payload = compose_payload(command, &marker, dispatch);
    let start = Instant::now();
    let deadline = deadline_after(start, timeout);

    process.write(payload.as_bytes())?;

    let mut collector = Collector::new(marker);
    loop {
        let drained = collector.drain(process);
        if collector.is_complete() {
            break;
        }
        if drained.streams_closed {
            tracing::warn!(%session_id, "shell exited before the command completed");
            return Err(SessionError::dead(session_id));
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if !drained.got_data {
            let wait = timing.poll_interval.min(deadline - now);
            tokio::select! {
                _ = process.stdout().readable() => {}
                _ = process.stderr().readable() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    if !collector.is_complete() {
        for _ in 0..timing.final_recheck_attempts {
            tokio::time::sleep(timing.final_recheck_interval).await;
            collector.drain(process);
            if collector.is_complete() {
                break;
            }
        }
    }

    let execution_time = start.elapsed();
    let completed = collector.status.is_some();
    if !completed {
        tracing::warn!(
            %session_id,
            marker = collector.marker.as_str(),
            "command timed out after {:.2}s",
            timeout.as_secs_f64()
        );
    }

    let (exit_code, background_pid) = match (dispatch, collector.status.as_deref()) {
        (Dispatch::Foreground, Some(status)) => (status.parse::<i32>().ok(), None),
        (Dispatch::Background, Some(status)) => (None, parse_job_pid(status)),
        (_, None) => (None, None),
    };

    Ok(ProtocolResult {
        output: CommandOutput {
            stdout: collector.stdout.join("\n"),
            stderr: collector.stderr.join("\n"),
            completed,
            timed_out: !completed,
            execution_time,
            exit_code,
            background_job: None,
        },
        background_pid,
    })
}
