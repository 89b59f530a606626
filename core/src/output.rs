//! Output demultiplexing for a shell session.
//!
//! One reader task per pipe drains the child's stdout/stderr into an
//! unbounded, order-preserving [`OutputQueue`]. Readers never block the
//! consumer: queue reads are non-blocking and report [`QueueRead::Empty`]
//! explicitly, and a [`Notify`] lets the consumer sleep until new data lands.

use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const READ_CHUNK_SIZE: usize = 8192;
/// A line that grows past this without a newline is emitted as a chunk.
const MAX_LINE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTag::Stdout => write!(f, "stdout"),
            StreamTag::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub stream: StreamTag,
    pub text: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueRead {
    Entry(OutputEntry),
    Empty,
    /// The pipe reached end-of-stream and every entry has been consumed.
    Closed,
}

#[derive(Debug)]
pub struct OutputQueue {
    stream: StreamTag,
    entries: StdMutex<VecDeque<OutputEntry>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutputQueue {
    pub fn new(stream: StreamTag) -> Self {
        Self {
            stream,
            entries: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream(&self) -> StreamTag {
        self.stream
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<OutputEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, text: String) {
        self.entries().push_back(OutputEntry {
            stream: self.stream,
            text,
        });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> QueueRead {
        let mut entries = self.entries();
        match entries.pop_front() {
            Some(entry) => QueueRead::Entry(entry),
            None if self.closed.load(Ordering::SeqCst) => QueueRead::Closed,
            None => QueueRead::Empty,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// True once the reader has stopped and nothing is left to consume.
    pub fn is_exhausted(&self) -> bool {
        self.closed.load(Ordering::SeqCst) && self.is_empty()
    }

    /// Resolves on the next push or close. A push that happened while nobody
    /// was waiting leaves a permit, so this never misses a wakeup.
    pub async fn readable(&self) {
        self.notify.notified().await;
    }
}

/// Splits a byte stream into lines. Invalid UTF-8 is replaced, never dropped.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push_bytes(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                lines.push(decode_line(&std::mem::take(&mut self.pending)));
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_BYTES {
                    let tail = self.pending.split_off(char_boundary(&self.pending));
                    lines.push(decode_line(&std::mem::replace(&mut self.pending, tail)));
                }
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(&std::mem::take(&mut self.pending)))
        }
    }
}

/// Length of `bytes` without a trailing, still incomplete UTF-8 sequence.
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Drains `reader` into `queue` until end-of-stream. The queue is closed when
/// the task ends; a read error is logged and treated as end-of-stream.
pub(crate) fn spawn_reader<R>(mut reader: R, queue: Arc<OutputQueue>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in splitter.push_bytes(&buf[..n]) {
                        queue.push(line);
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(stream = %queue.stream(), "output reader failed: {err}");
                    break;
                }
            }
        }
        if let Some(tail) = splitter.finish() {
            queue.push(tail);
        }
        queue.close();
        tracing::debug!(stream = %queue.stream(), "output reader reached end of stream");
    })
}
