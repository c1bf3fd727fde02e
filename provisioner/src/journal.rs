//! Structured deployment log stream
//!
//! Every event of a run becomes a [`LogEntry`]: it is forwarded to `tracing`
//! for live visibility, appended as one JSON line to the shared stream file,
//! and kept in a bounded in-memory tail used by escalation reports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::remote::stream::{OutputSink, StreamKind};

/// Entries retained in memory per deployment
const DEFAULT_TAIL_CAPACITY: usize = 500;

/// One append-only log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.to_filter_string().to_uppercase()
        )?;
        if let Some(step) = &self.step {
            write!(f, " [{}]", step)?;
        }
        write!(f, " {}", self.message)
    }
}

/// Per-deployment log handle. Cheap to clone; clones share the tail.
#[derive(Debug, Clone)]
pub struct Journal {
    deployment_id: Option<String>,
    sink: Option<File>,
    tail: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Journal {
    /// Journal writing to the shared stream file
    pub fn new(deployment_id: impl Into<String>, sink: File) -> Self {
        Self {
            deployment_id: Some(deployment_id.into()),
            sink: Some(sink),
            tail: Arc::new(Mutex::new(VecDeque::new())),
            capacity: DEFAULT_TAIL_CAPACITY,
        }
    }

    /// Journal that only keeps the in-memory tail
    pub fn in_memory(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: Some(deployment_id.into()),
            sink: None,
            tail: Arc::new(Mutex::new(VecDeque::new())),
            capacity: DEFAULT_TAIL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Record an event
    pub async fn log(&self, level: LogLevel, step: Option<&str>, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step: step.map(str::to_string),
            deployment_id: self.deployment_id.clone(),
        };

        self.emit(&entry);

        {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() >= self.capacity {
                tail.pop_front();
            }
            tail.push_back(entry.clone());
        }

        if let Some(sink) = &self.sink {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = sink.append_line(&line).await {
                        error!("Failed to append to log stream {}: {}", sink.path().display(), e);
                    }
                }
                Err(e) => error!("Failed to encode log entry: {}", e),
            }
        }
    }

    pub async fn info(&self, step: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Info, step, message).await
    }

    pub async fn warn(&self, step: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Warn, step, message).await
    }

    pub async fn error(&self, step: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Error, step, message).await
    }

    pub async fn debug(&self, step: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Debug, step, message).await
    }

    /// The last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        let skip = tail.len().saturating_sub(n);
        tail.iter().skip(skip).cloned().collect()
    }

    fn emit(&self, entry: &LogEntry) {
        let deployment = self.deployment_id.as_deref().unwrap_or("-");
        let step = entry.step.as_deref().unwrap_or("-");
        match entry.level {
            LogLevel::Trace => trace!(deployment, step, "{}", entry.message),
            LogLevel::Debug => debug!(deployment, step, "{}", entry.message),
            LogLevel::Info => info!(deployment, step, "{}", entry.message),
            LogLevel::Warn => warn!(deployment, step, "{}", entry.message),
            LogLevel::Error => error!(deployment, step, "{}", entry.message),
        }
    }
}

/// Forwards remote output lines into a journal, tagged with the step
pub struct JournalSink {
    journal: Journal,
    step: Option<String>,
}

impl JournalSink {
    pub fn new(journal: Journal, step: Option<&str>) -> Self {
        Self {
            journal,
            step: step.map(str::to_string),
        }
    }
}

#[async_trait]
impl OutputSink for JournalSink {
    async fn line(&self, stream: StreamKind, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        self.journal
            .log(
                LogLevel::Info,
                self.step.as_deref(),
                format!("[{}] {}", stream.as_str(), line),
            )
            .await;
    }
}

/// Parse a stream file back into entries, skipping malformed lines
pub fn parse_stream(contents: &str) -> Vec<LogEntry> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
