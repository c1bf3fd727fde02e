//! Live output capture for a running remote command
//!
//! Each stream gets its own reader task that forwards lines to an
//! [`OutputSink`] as they arrive and appends them to a buffer only that task
//! writes to. A command is finished once both readers hit end-of-stream or
//! the drain timeout elapses, whichever comes first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Receives every output line as soon as it is read
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn line(&self, stream: StreamKind, line: &str);
}

/// Sink that drops everything
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn line(&self, _stream: StreamKind, _line: &str) {}
}

/// A reader task and the buffer it fills
pub struct StreamCapture {
    kind: StreamKind,
    buffer: Arc<Mutex<String>>,
    handle: JoinHandle<()>,
}

impl StreamCapture {
    /// Start reading `reader` until end-of-stream
    pub fn spawn<R>(kind: StreamKind, reader: R, sink: Arc<dyn OutputSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let task_buffer = buffer.clone();

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::with_capacity(256);

            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&raw);
                        let line = text.trim_end_matches(['\n', '\r']);
                        {
                            let mut buffer = task_buffer.lock().unwrap_or_else(|e| e.into_inner());
                            buffer.push_str(line);
                            buffer.push('\n');
                        }
                        sink.line(kind, line).await;
                    }
                    Err(e) => {
                        warn!("Error reading remote {}: {}", kind.as_str(), e);
                        break;
                    }
                }
            }
        });

        Self {
            kind,
            buffer,
            handle,
        }
    }

    fn take(self) -> String {
        if !self.handle.is_finished() {
            self.handle.abort();
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buffer)
    }
}

/// Output collected from both streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,

    /// False if the drain timeout cut one of the readers short
    pub drained: bool,
}

/// Wait for both readers, bounded by `drain_timeout`
pub async fn collect(
    mut stdout: StreamCapture,
    mut stderr: StreamCapture,
    drain_timeout: Duration,
) -> CapturedOutput {
    let joined = tokio::time::timeout(drain_timeout, async {
        let _ = tokio::join!(&mut stdout.handle, &mut stderr.handle);
    })
    .await;

    let drained = joined.is_ok();
    if !drained {
        debug!(
            "Output streams ({}, {}) still open after {:?}, using what was captured",
            stdout.kind.as_str(),
            stderr.kind.as_str(),
            drain_timeout
        );
    }

    CapturedOutput {
        stdout: stdout.take(),
        stderr: stderr.take(),
        drained,
    }
}
