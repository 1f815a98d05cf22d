//! Turning a [`Thrown`] value into a serializable [`ErrorDescriptor`].
//!
//! [`Normalizer::normalize`] never fails: anything that goes wrong while
//! reading the stack or remapping frames degrades to a message-only
//! descriptor. [`enhance`] attaches an [`ExecutionContext`] and [`project`]
//! picks the minimal or verbose wire shape.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{panic_message, Thrown};
use crate::logs::CapturedLogs;

/// One stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Set after remapping when `file` follows the test-file convention.
    pub is_test_file: bool,
}

impl Frame {
    pub fn new(function: Option<String>, file: impl Into<String>, line: u32, column: u32) -> Self {
        Frame {
            function,
            file: file.into(),
            line,
            column,
            is_test_file: false,
        }
    }
}

/// Remaps a frame to its original source location.
pub type RemapFn = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Where a failure happened and what was logged around it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub logs: CapturedLogs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    pub path: TestPath,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Milliseconds.
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestPath {
    pub suite: String,
    pub test: String,
}

/// Normalized failure, ready for reporters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
    /// Debug rendering of the value that was thrown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
}

impl ErrorDescriptor {
    pub fn message(message: impl Into<String>) -> Self {
        ErrorDescriptor {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Re-label this descriptor as a failure inside `hook`.
    pub fn into_hook_failure(mut self, hook: &str) -> Self {
        self.message = format!("{hook} hook failed: {}", self.message);
        self.name = Some("HookFailure".to_string());
        self
    }
}

static FRAME_PAREN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*at\s+(?:(.+?)\s+)?\((.+):(\d+):(\d+)\)\s*$").expect("frame pattern compiles")
});

static FRAME_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(.+):(\d+):(\d+)\s*$").expect("frame pattern compiles"));

static RUST_FN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").expect("frame pattern compiles"));

static DEFAULT_TEST_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[/\\])tests[/\\]|_(test|tests|spec)\.rs$|\.(test|spec)\.[A-Za-z]+$")
        .expect("test file pattern compiles")
});

/// Parse stack text into frames.
///
/// Understands `at fn (file:line:col)`, `at file:line:col`, and Rust
/// backtraces where `N: fn` is followed by an `at file:line:col` line.
pub fn parse_stack(stack: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pending_fn: Option<String> = None;

    for line in stack.lines() {
        if let Some(cap) = FRAME_PAREN.captures(line) {
            let function = cap.get(1).map(|m| m.as_str().to_string());
            if let Some(frame) = frame_from(function, &cap[2], &cap[3], &cap[4]) {
                frames.push(frame);
            }
            pending_fn = None;
        } else if let Some(cap) = FRAME_BARE.captures(line) {
            if let Some(frame) = frame_from(pending_fn.take(), &cap[1], &cap[2], &cap[3]) {
                frames.push(frame);
            }
        } else if let Some(cap) = RUST_FN_LINE.captures(line) {
            pending_fn = Some(cap[1].to_string());
        }
    }
    frames
}

fn frame_from(function: Option<String>, file: &str, line: &str, column: &str) -> Option<Frame> {
    Some(Frame::new(function, file, line.parse().ok()?, column.parse().ok()?))
}

/// Converts thrown values into descriptors.
#[derive(Clone)]
pub struct Normalizer {
    remap: Option<RemapFn>,
    test_file: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer {
            remap: None,
            test_file: DEFAULT_TEST_FILE.clone(),
        }
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer")
            .field("remap", &self.remap.is_some())
            .field("test_file", &self.test_file.as_str())
            .finish()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a frame remapper (for example one backed by a source map).
    pub fn with_remap(mut self, remap: impl Fn(Frame) -> Frame + Send + Sync + 'static) -> Self {
        self.remap = Some(Arc::new(remap));
        self
    }

    /// Override which paths count as test files.
    pub fn with_test_file_pattern(mut self, pattern: Regex) -> Self {
        self.test_file = pattern;
        self
    }

    /// Describe `thrown`. Never panics.
    pub fn normalize(&self, thrown: &Thrown) -> ErrorDescriptor {
        match panic::catch_unwind(AssertUnwindSafe(|| self.normalize_inner(thrown))) {
            Ok(descriptor) => descriptor,
            Err(_) => degraded(thrown),
        }
    }

    fn normalize_inner(&self, thrown: &Thrown) -> ErrorDescriptor {
        let mut descriptor = degraded(thrown);
        let mut stack_text = None;
        let mut frames = Vec::new();

        match thrown {
            Thrown::Panic { trace: Some(trace), .. } => {
                if !trace.file.is_empty() {
                    frames.push(Frame::new(None, &trace.file, trace.line, trace.column));
                }
                if let Some(bt) = &trace.backtrace {
                    frames.extend(parse_stack(bt));
                    stack_text = Some(bt.clone());
                }
            }
            Thrown::Error { debug, .. } => {
                let parsed = parse_stack(debug);
                if !parsed.is_empty() {
                    frames = parsed;
                    stack_text = Some(debug.clone());
                }
            }
            _ => {}
        }

        let frames: Vec<Frame> = frames.into_iter().map(|f| self.remap_frame(f)).collect();
        let location = frames
            .iter()
            .find(|f| f.is_test_file)
            .or_else(|| frames.first());
        if let Some(frame) = location {
            descriptor.file = Some(frame.file.clone());
            descriptor.line = Some(frame.line);
            descriptor.column = Some(frame.column);
        }
        descriptor.stack = stack_text.map(|s| s.lines().map(str::to_string).collect());
        descriptor
    }

    fn remap_frame(&self, frame: Frame) -> Frame {
        let mut frame = match &self.remap {
            Some(remap) => remap(frame),
            None => frame,
        };
        frame.is_test_file = self.test_file.is_match(&frame.file);
        frame
    }
}

/// The message-only descriptor every path falls back to.
fn degraded(thrown: &Thrown) -> ErrorDescriptor {
    match thrown {
        Thrown::Panic { payload, .. } => match panic_message(thrown) {
            Some(message) => ErrorDescriptor {
                name: Some("Panic".to_string()),
                message: message.to_string(),
                ..Default::default()
            },
            None => ErrorDescriptor {
                name: None,
                message: format!("Unknown error ({})", describe_payload(&**payload)),
                ..Default::default()
            },
        },
        Thrown::Error {
            name,
            message,
            debug,
        } => ErrorDescriptor {
            name: Some(name.clone()),
            message: message.clone(),
            original_error: Some(debug.clone()),
            ..Default::default()
        },
        Thrown::Timeout(t) => ErrorDescriptor {
            name: Some("TimeoutExceeded".to_string()),
            message: t.to_string(),
            ..Default::default()
        },
    }
}

fn describe_payload(payload: &(dyn std::any::Any + Send)) -> String {
    macro_rules! try_display {
        ($($ty:ty),*) => {
            $(if let Some(v) = payload.downcast_ref::<$ty>() {
                return v.to_string();
            })*
        };
    }
    try_display!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char);
    if payload.downcast_ref::<()>().is_some() {
        return "()".to_string();
    }
    "non-string panic payload".to_string()
}

/// What [`enhance`] should attach.
#[derive(Debug, Clone, Default)]
pub struct ContextParts {
    pub logs: Option<CapturedLogs>,
    pub timing: Option<Timing>,
    pub path: TestPath,
    pub metadata: Map<String, Value>,
}

/// Attach an execution context to `base`.
pub fn enhance(mut base: ErrorDescriptor, parts: ContextParts) -> ErrorDescriptor {
    base.context = Some(ExecutionContext {
        logs: parts.logs.unwrap_or_default(),
        timing: parts.timing,
        path: parts.path,
        metadata: parts.metadata,
    });
    base
}

/// Minimal keeps message, name and location; verbose keeps everything.
pub fn project(descriptor: ErrorDescriptor, verbose: bool) -> ErrorDescriptor {
    if verbose {
        return descriptor;
    }
    ErrorDescriptor {
        name: descriptor.name,
        message: descriptor.message,
        file: descriptor.file,
        line: descriptor.line,
        column: descriptor.column,
        ..Default::default()
    }
}
