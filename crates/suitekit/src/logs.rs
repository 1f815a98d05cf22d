//! Per-test log capture.
//!
//! Test code logs through the ambient [`LogSink`] via [`console`]. While a
//! [`LogCollector`] is started, the ambient sink is wrapped by an interceptor
//! that records every line into the collector's "ambient" bucket and still
//! forwards it to the original sink. The returned [`Capture`] guard puts the
//! original sink back when dropped, on every exit path.
//!
//! Two more buckets take programmatic entries: "framework" (lifecycle notes
//! from the engine) and "domain" (notes from test authors, see [`by`]).
//!
//! Only one collector captures at a time. Threads abandoned by a timed-out
//! operation are detached: whatever they log afterwards is forwarded but never
//! recorded, so it cannot land in a later test's capture.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::CollectorActive;

/// Severity of an ambient log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Destination for ambient log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str);
}

/// Default sink: info to stdout, warnings and errors to stderr.
pub struct StdioSink;

impl LogSink for StdioSink {
    fn write(&self, level: Level, message: &str) {
        match level {
            Level::Info => println!("{message}"),
            Level::Warn | Level::Error => eprintln!("{message}"),
        }
    }
}

static AMBIENT: Lazy<RwLock<Arc<dyn LogSink>>> = Lazy::new(|| RwLock::new(Arc::new(StdioSink)));

static ACTIVE: Lazy<Mutex<Option<Arc<LogCollector>>>> = Lazy::new(|| Mutex::new(None));

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

static DETACHED: Lazy<Mutex<HashSet<ThreadId>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Replace the ambient sink, returning the previous one.
pub fn set_sink(sink: Arc<dyn LogSink>) -> Arc<dyn LogSink> {
    std::mem::replace(&mut *AMBIENT.write(), sink)
}

/// The ambient sink currently in effect.
pub fn sink() -> Arc<dyn LogSink> {
    AMBIENT.read().clone()
}

/// Make `collector` the globally active one (or clear it), returning the
/// previous one.
pub fn set_active(collector: Option<Arc<LogCollector>>) -> Option<Arc<LogCollector>> {
    std::mem::replace(&mut *ACTIVE.lock(), collector)
}

/// The globally active collector, if a test is being captured.
pub fn active() -> Option<Arc<LogCollector>> {
    ACTIVE.lock().clone()
}

/// Stop recording anything `thread` logs from now on.
pub fn detach_thread(thread: ThreadId) {
    DETACHED.lock().insert(thread);
}

fn on_detached_thread() -> bool {
    DETACHED.lock().contains(&thread::current().id())
}

/// Logging functions test code calls instead of printing directly.
pub mod console {
    use super::{sink, Level};

    pub fn info(message: impl AsRef<str>) {
        sink().write(Level::Info, message.as_ref());
    }

    pub fn warn(message: impl AsRef<str>) {
        sink().write(Level::Warn, message.as_ref());
    }

    pub fn error(message: impl AsRef<str>) {
        sink().write(Level::Error, message.as_ref());
    }
}

/// Document a step within a test.
///
/// Recorded in the active collector's domain bucket and echoed to stderr.
pub fn by(description: &str) {
    if let Some(collector) = active().filter(|_| !on_detached_thread()) {
        collector.domain(description);
    }
    eprintln!("  STEP: {description}");
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

impl LogEntry {
    fn now(message: impl Into<String>) -> Self {
        LogEntry {
            message: message.into(),
            timestamp: Utc::now(),
            seq: SEQUENCE.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Snapshot of the three buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapturedLogs {
    pub ambient: Vec<LogEntry>,
    pub framework: Vec<LogEntry>,
    pub domain: Vec<LogEntry>,
}

impl CapturedLogs {
    pub fn is_empty(&self) -> bool {
        self.ambient.is_empty() && self.framework.is_empty() && self.domain.is_empty()
    }

    /// Keep only the most recent `n` entries of each bucket.
    pub fn truncate_to_recent(&mut self, n: usize) {
        for bucket in [&mut self.ambient, &mut self.framework, &mut self.domain] {
            let excess = bucket.len().saturating_sub(n);
            bucket.drain(..excess);
        }
    }
}

/// Log buckets for a single test.
#[derive(Debug, Default)]
pub struct LogCollector {
    logs: Mutex<CapturedLogs>,
}

impl LogCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start intercepting the ambient sink and become the active collector.
    ///
    /// Interception lasts until the returned guard is dropped. Fails while
    /// another collector is active.
    pub fn start(self: &Arc<Self>) -> Result<Capture, CollectorActive> {
        let mut active = ACTIVE.lock();
        if active.is_some() {
            return Err(CollectorActive);
        }
        *active = Some(self.clone());
        drop(active);

        let interceptor = Arc::new(Interceptor {
            collector: self.clone(),
            inner: sink(),
        });
        let previous_sink = set_sink(interceptor);
        Ok(Capture {
            previous_sink: Some(previous_sink),
        })
    }

    pub fn ambient(&self, level: Level, message: &str) {
        let line = match level {
            Level::Info => message.to_string(),
            Level::Warn => format!("[WARN] {message}"),
            Level::Error => format!("[ERROR] {message}"),
        };
        self.logs.lock().ambient.push(LogEntry::now(line));
    }

    pub fn framework(&self, message: impl Into<String>) {
        self.logs.lock().framework.push(LogEntry::now(message));
    }

    pub fn domain(&self, message: impl Into<String>) {
        self.logs.lock().domain.push(LogEntry::now(message));
    }

    pub fn snapshot(&self) -> CapturedLogs {
        self.logs.lock().clone()
    }

    /// The most recent `n` entries across all buckets, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let logs = self.logs.lock();
        let mut all: Vec<LogEntry> = logs
            .ambient
            .iter()
            .chain(&logs.framework)
            .chain(&logs.domain)
            .cloned()
            .collect();
        all.sort_by_key(|e| e.seq);
        let skip = all.len().saturating_sub(n);
        all.split_off(skip)
    }
}

struct Interceptor {
    collector: Arc<LogCollector>,
    inner: Arc<dyn LogSink>,
}

impl LogSink for Interceptor {
    fn write(&self, level: Level, message: &str) {
        if !on_detached_thread() {
            self.collector.ambient(level, message);
        }
        self.inner.write(level, message);
    }
}

/// Restores the ambient sink and clears the active collector on drop.
#[must_use = "interception ends as soon as the guard is dropped"]
pub struct Capture {
    previous_sink: Option<Arc<dyn LogSink>>,
}

impl Capture {
    /// Stop intercepting now.
    pub fn end(self) {}
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(sink) = self.previous_sink.take() {
            set_sink(sink);
        }
        set_active(None);
    }
}
