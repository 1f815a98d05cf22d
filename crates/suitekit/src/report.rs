//! Colored, indented console output.
//!
//! ```text
//! Calculator
//!   ✓ adds two numbers
//!   when negative
//!     ✓ handles negatives
//!     ✗ fails on overflow
//!       Error: assertion failed
//!     - not yet (explicitly skipped)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::filter::{full_name, ListedTest};
use crate::runner::{outcome_of, RunEvent, RunResult, Summary, TestOutcome};

// ============================================================================
// ANSI color helpers
// ============================================================================

fn use_color() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }
    std::io::IsTerminal::is_terminal(&std::io::stdout())
}

#[derive(Debug, Clone, Copy)]
struct Palette {
    enabled: bool,
}

impl Palette {
    fn paint(self, code: &str, s: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    fn green(self, s: &str) -> String {
        self.paint("32", s)
    }

    fn red(self, s: &str) -> String {
        self.paint("31", s)
    }

    fn yellow(self, s: &str) -> String {
        self.paint("33", s)
    }

    fn bold(self, s: &str) -> String {
        self.paint("1", s)
    }

    fn dim(self, s: &str) -> String {
        self.paint("2", s)
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Prints the run as a tree while it happens, then a PASS/FAIL summary.
pub struct ConsoleReporter {
    palette: Palette,
    /// Suite segments whose headers are already on screen.
    open: Mutex<Vec<String>>,
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::with_color(use_color())
    }

    pub fn with_color(enabled: bool) -> Self {
        ConsoleReporter {
            palette: Palette { enabled },
            open: Mutex::new(Vec::new()),
        }
    }

    /// An event handler printing through this reporter.
    pub fn handler(self: &Arc<Self>) -> impl Fn(&RunEvent) + Send + Sync + 'static {
        let reporter = self.clone();
        move |event: &RunEvent| {
            for line in reporter.render(event) {
                println!("{line}");
            }
        }
    }

    /// Lines to print for `event`, including any new suite headers.
    pub fn render(&self, event: &RunEvent) -> Vec<String> {
        let p = self.palette;
        let (suite, test) = match event {
            RunEvent::Pass { suite, test, .. }
            | RunEvent::Fail { suite, test, .. }
            | RunEvent::Skip { suite, test, .. } => (suite, test),
            RunEvent::Start { .. } | RunEvent::Complete { .. } => return Vec::new(),
        };
        let Some(outcome) = outcome_of(event) else {
            return Vec::new();
        };

        let mut lines = self.enter(suite);
        let depth = self.open.lock().len();
        let indent = "  ".repeat(depth);
        match outcome {
            TestOutcome::Passed { duration_ms } => {
                lines.push(format!("{indent}{} {test}{}", p.green("✓"), elapsed(p, duration_ms)));
            }
            TestOutcome::Failed { duration_ms, error } => {
                lines.push(format!(
                    "{indent}{} {}{}",
                    p.red("✗"),
                    p.red(test),
                    elapsed(p, duration_ms)
                ));
                lines.push(format!("{indent}  {}", p.red(&format!("Error: {}", error.message))));
                if let (Some(file), Some(line)) = (&error.file, error.line) {
                    lines.push(format!("{indent}  {}", p.dim(&format!("at {file}:{line}"))));
                }
            }
            TestOutcome::Skipped { reason } => {
                lines.push(format!(
                    "{indent}{} {} {}",
                    p.yellow("-"),
                    p.dim(test),
                    p.dim(&format!("({reason})"))
                ));
            }
        }
        lines
    }

    /// Headers for the segments of `suite_path` not yet shown.
    fn enter(&self, suite_path: &str) -> Vec<String> {
        let segments: Vec<String> = if suite_path.is_empty() {
            Vec::new()
        } else {
            suite_path.split(" > ").map(str::to_string).collect()
        };
        let mut open = self.open.lock();
        let shared = open
            .iter()
            .zip(&segments)
            .take_while(|(a, b)| a == b)
            .count();
        open.truncate(shared);
        let mut lines = Vec::new();
        for (depth, segment) in segments.iter().enumerate().skip(shared) {
            lines.push(format!("{}{}", "  ".repeat(depth), self.palette.bold(segment)));
            open.push(segment.clone());
        }
        lines
    }

    /// PASS/FAIL, the counts, and a numbered list of failures.
    pub fn summary_lines(&self, result: &RunResult) -> Vec<String> {
        let p = self.palette;
        let Summary {
            passed,
            failed,
            skipped,
            duration,
            ..
        } = result.summary;
        let parts: Vec<String> = [
            (passed > 0).then(|| p.green(&format!("{passed} passed"))),
            (failed > 0).then(|| p.red(&format!("{failed} failed"))),
            (skipped > 0).then(|| p.yellow(&format!("{skipped} skipped"))),
        ]
        .into_iter()
        .flatten()
        .collect();
        let counts = if parts.is_empty() {
            "no tests".to_string()
        } else {
            parts.join(", ")
        };
        let summary = format!("{counts} ({})", p.dim(&format!("{:.3}s", duration / 1_000.0)));

        let mut lines = vec![String::new()];
        if failed > 0 {
            lines.push(p.red("FAIL"));
            lines.push(summary);
            lines.push(String::new());
            lines.push("Failures:".to_string());
            for (i, failure) in result.failures.iter().enumerate() {
                lines.push(format!(
                    "  {}. {}: {}",
                    i + 1,
                    full_name(&failure.suite, &failure.test),
                    failure.error.message
                ));
            }
            lines.push(String::new());
        } else {
            lines.push(p.green("PASS"));
            lines.push(summary);
        }
        lines
    }

    pub fn print_summary(&self, result: &RunResult) {
        for line in self.summary_lines(result) {
            println!("{line}");
        }
    }

    /// One `Suite > test [tags]` line per listed test.
    pub fn print_listing(&self, listed: &[ListedTest]) {
        for test in listed {
            let name = full_name(&test.suite, &test.test);
            if test.tags.is_empty() {
                println!("{name}");
            } else {
                println!("{name} {}", self.palette.dim(&format!("[{}]", test.tags.join(", "))));
            }
        }
    }
}

fn elapsed(p: Palette, ms: f64) -> String {
    if ms > 100.0 {
        format!(" {}", p.dim(&format!("({}ms)", ms.round() as u64)))
    } else {
        String::new()
    }
}
