//! The execution engine.
//!
//! Depth-first, pre-order: a suite's own tests run before its child suites,
//! children in declaration order. Everything is sequential; the only state a
//! run mutates is the per-suite [`SuiteExec`] table and the run-wide bail flag.
//!
//! Per suite:
//!
//! 1. Decide visibility: filtered out entirely, skipped (explicitly or because
//!    something else is focused), or active.
//! 2. Run every not-yet-run `before_all` in the lineage, root-most first. Each
//!    suite is marked as set up *before* its hooks run so a failure is never
//!    retried.
//! 3. Run own tests: `before_each` outer-to-inner, the body under the timeout
//!    guard, `after_each` inner-to-outer no matter what.
//! 4. Recurse into children, stopping as soon as one reports bail.
//! 5. Run own `after_all` if this suite's setup succeeded.
//!
//! Bail travels as the `bool` each suite returns, never as a panic, so cleanup
//! on the way out always runs.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map};
use tracing::{debug, info, warn};

use crate::descriptor::{enhance, project, ContextParts, ErrorDescriptor, TestPath, Timing};
use crate::error::{Thrown, UsageError};
use crate::filter::accepts;
use crate::logs::LogCollector;
use crate::options::RunOptions;
use crate::registry::{Callback, Registry, SuiteId, TestId};
use crate::timeout::{self, CancelToken, Worker};

/// Pseudo-test name for a failing `before_all`.
pub const BEFORE_ALL_HOOK: &str = "(beforeAll hook)";
/// Pseudo-test name for a failing `after_all`.
pub const AFTER_ALL_HOOK: &str = "(afterAll hook)";

// ============================================================================
// Results and events
// ============================================================================

/// Why a test was reported without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    #[serde(rename = "explicitly skipped")]
    ExplicitlySkipped,
    #[serde(rename = "not focused")]
    NotFocused,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ExplicitlySkipped => write!(f, "explicitly skipped"),
            SkipReason::NotFocused => write!(f, "not focused"),
        }
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Passed { duration_ms: f64 },
    Failed { duration_ms: f64, error: ErrorDescriptor },
    Skipped { reason: SkipReason },
}

/// Lifecycle notifications, delivered synchronously in traversal order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    Start {
        suite: String,
        test: String,
    },
    Pass {
        suite: String,
        test: String,
        duration: f64,
    },
    Fail {
        suite: String,
        test: String,
        error: ErrorDescriptor,
        duration: f64,
    },
    Skip {
        suite: String,
        test: String,
        reason: SkipReason,
    },
    Complete {
        summary: Summary,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Milliseconds.
    pub duration: f64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub suite: String,
    pub test: String,
    pub error: ErrorDescriptor,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassRecord {
    pub suite: String,
    pub test: String,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipRecord {
    pub suite: String,
    pub test: String,
    pub reason: SkipReason,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    pub summary: Summary,
    pub failures: Vec<FailureRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<Vec<PassRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<Vec<SkipRecord>>,
}

// ============================================================================
// Per-suite execution state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuiteState {
    #[default]
    NotEntered,
    Entered,
    SetupFailed,
    SetupOk,
    TestsRunning,
    ChildrenRunning,
    TeardownAttempted,
    Done,
}

/// Transient per-suite fields touched by a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuiteExec {
    pub state: SuiteState,
    pub entered: bool,
    /// Set before the suite's `before_all` hooks start.
    pub setup_ran: bool,
    /// Every own `before_all` hook completed without failing.
    pub setup_ok: bool,
}

/// Visibility decided for a suite or test before anything runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inclusion {
    Filtered,
    Skipped(SkipReason),
    Run,
}

// ============================================================================
// Runner
// ============================================================================

/// Run everything in `registry`.
pub fn run(registry: &Registry, options: RunOptions) -> Result<RunResult, UsageError> {
    Ok(Runner::new(registry, options)?.execute())
}

impl Registry {
    /// See [`run`].
    pub fn run(&self, options: RunOptions) -> Result<RunResult, UsageError> {
        run(self, options)
    }
}

/// One run over a registry.
pub struct Runner<'r> {
    registry: &'r Registry,
    options: RunOptions,
    exec: Vec<SuiteExec>,
    focus_mode: bool,
    bail: bool,
    worker: Worker,
    result: RunResult,
}

impl<'r> Runner<'r> {
    /// Validate `options` eagerly; nothing runs on error.
    pub fn new(registry: &'r Registry, options: RunOptions) -> Result<Self, UsageError> {
        options.validate()?;
        let focus_mode = registry.has_only();
        if focus_mode && options.fail_on_focus {
            return Err(UsageError::FocusForbidden);
        }
        let mut result = RunResult::default();
        if options.include_passed {
            result.passed = Some(Vec::new());
        }
        if options.include_skipped {
            result.skipped = Some(Vec::new());
        }
        Ok(Runner {
            registry,
            options,
            exec: vec![SuiteExec::default(); registry.suite_count()],
            focus_mode,
            bail: false,
            worker: Worker::new("suitekit-runner"),
            result,
        })
    }

    /// Traverse the tree once. Per-suite state stays readable afterwards
    /// through [`Runner::suite_exec`].
    pub fn execute(&mut self) -> RunResult {
        let started = Instant::now();
        info!(
            suites = self.registry.suite_count(),
            tests = self.registry.test_count(),
            focus_mode = self.focus_mode,
            "run starting"
        );

        self.run_suite(SuiteId::ROOT);

        let summary = &mut self.result.summary;
        summary.duration = started.elapsed().as_secs_f64() * 1_000.0;
        summary.total = summary.passed + summary.failed + summary.skipped;
        summary.success = summary.failed == 0;
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            bailed = self.bail,
            "run complete"
        );
        let summary = summary.clone();
        self.emit(RunEvent::Complete { summary });
        std::mem::take(&mut self.result)
    }

    /// Execution state of a suite after (or during) the run.
    pub fn suite_exec(&self, id: SuiteId) -> SuiteExec {
        self.exec[id.index()]
    }

    // ---- Visibility ----------------------------------------------------------

    fn test_accepted(&self, id: TestId) -> bool {
        let test = self.registry.unit(id);
        let suite_path = self.registry.suite_path(test.suite);
        accepts(
            &suite_path,
            &test.name,
            &self.registry.test_tags(id),
            &self.options.criteria,
        )
    }

    fn lineage_flag(&self, suite: SuiteId, flag: impl Fn(&crate::registry::SuiteNode) -> bool) -> bool {
        self.registry
            .ancestors(suite)
            .any(|s| flag(self.registry.suite(s)))
    }

    fn subtree_has_only(&self, suite: SuiteId) -> bool {
        let node = self.registry.suite(suite);
        node.only
            || node.tests.iter().any(|t| self.registry.unit(*t).only)
            || node.children.iter().any(|c| self.subtree_has_only(*c))
    }

    fn subtree_any_accepted(&self, suite: SuiteId) -> bool {
        let node = self.registry.suite(suite);
        node.tests.iter().any(|t| self.test_accepted(*t))
            || node.children.iter().any(|c| self.subtree_any_accepted(*c))
    }

    fn suite_inclusion(&self, suite: SuiteId) -> Inclusion {
        if !self.subtree_any_accepted(suite) {
            return Inclusion::Filtered;
        }
        if self.lineage_flag(suite, |s| s.skip) {
            return Inclusion::Skipped(SkipReason::ExplicitlySkipped);
        }
        if self.focus_mode
            && !self.lineage_flag(suite, |s| s.only)
            && !self.subtree_has_only(suite)
        {
            return Inclusion::Skipped(SkipReason::NotFocused);
        }
        Inclusion::Run
    }

    fn test_inclusion(&self, id: TestId) -> Inclusion {
        if !self.test_accepted(id) {
            return Inclusion::Filtered;
        }
        let test = self.registry.unit(id);
        if test.skip || self.lineage_flag(test.suite, |s| s.skip) {
            return Inclusion::Skipped(SkipReason::ExplicitlySkipped);
        }
        if self.focus_mode && !test.only && !self.lineage_flag(test.suite, |s| s.only) {
            return Inclusion::Skipped(SkipReason::NotFocused);
        }
        Inclusion::Run
    }

    fn subtree_runnable(&self, suite: SuiteId) -> bool {
        let node = self.registry.suite(suite);
        node.tests
            .iter()
            .any(|t| self.test_inclusion(*t) == Inclusion::Run)
            || node.children.iter().any(|c| self.subtree_runnable(*c))
    }

    // ---- Traversal -----------------------------------------------------------

    /// Returns `false` when the run should stop.
    fn run_suite(&mut self, suite: SuiteId) -> bool {
        if self.bail {
            return false;
        }
        match self.suite_inclusion(suite) {
            Inclusion::Filtered => return true,
            Inclusion::Skipped(reason) => {
                self.report_skipped_subtree(suite, Some(reason));
                return true;
            }
            Inclusion::Run => {}
        }
        if !self.subtree_runnable(suite) {
            self.report_skipped_subtree(suite, None);
            return true;
        }

        let path = self.registry.suite_path(suite);
        debug!(suite = %path, "entering suite");
        self.exec[suite.index()].entered = true;
        self.exec[suite.index()].state = SuiteState::Entered;

        let setup_ok = self.run_lineage_setup(suite);
        self.exec[suite.index()].state = if setup_ok {
            SuiteState::SetupOk
        } else {
            SuiteState::SetupFailed
        };

        if setup_ok && !self.bail {
            self.exec[suite.index()].state = SuiteState::TestsRunning;
            let tests = self.registry.suite(suite).tests.clone();
            for test in tests {
                if self.bail {
                    break;
                }
                match self.test_inclusion(test) {
                    Inclusion::Filtered => {}
                    Inclusion::Skipped(reason) => self.report_skip(test, reason),
                    Inclusion::Run => self.run_test(test),
                }
            }
        }

        if setup_ok && !self.bail {
            self.exec[suite.index()].state = SuiteState::ChildrenRunning;
            let children = self.registry.suite(suite).children.clone();
            for child in children {
                if !self.run_suite(child) {
                    self.bail = true;
                    break;
                }
            }
        }

        if self.exec[suite.index()].setup_ok {
            self.exec[suite.index()].state = SuiteState::TeardownAttempted;
            self.run_after_all(suite);
        }

        self.exec[suite.index()].state = SuiteState::Done;
        debug!(suite = %path, bail = self.bail, "leaving suite");
        !self.bail
    }

    /// Run each not-yet-run `before_all` in the lineage, root-most first.
    fn run_lineage_setup(&mut self, suite: SuiteId) -> bool {
        for sid in self.registry.lineage(suite) {
            let exec = self.exec[sid.index()];
            if exec.setup_ran {
                if exec.setup_ok {
                    continue;
                }
                return false;
            }
            self.exec[sid.index()].setup_ran = true;

            let hooks = self.registry.suite(sid).hooks.before_all.clone();
            let mut ok = true;
            for hook in hooks {
                if let Err(thrown) = self.invoke_hook(&hook, sid, "beforeAll") {
                    self.record_hook_failure(sid, BEFORE_ALL_HOOK, "beforeAll", thrown);
                    ok = false;
                    break;
                }
            }
            self.exec[sid.index()].setup_ok = ok;
            if !ok {
                return false;
            }
        }
        true
    }

    fn run_after_all(&mut self, suite: SuiteId) {
        let hooks = self.registry.suite(suite).hooks.after_all.clone();
        for hook in hooks {
            if let Err(thrown) = self.invoke_hook(&hook, suite, "afterAll") {
                self.record_hook_failure(suite, AFTER_ALL_HOOK, "afterAll", thrown);
            }
        }
    }

    fn run_test(&mut self, id: TestId) {
        let registry = self.registry;
        let test = registry.unit(id);
        let suite_path = registry.suite_path(test.suite);
        let lineage = registry.lineage(test.suite);

        self.emit(RunEvent::Start {
            suite: suite_path.clone(),
            test: test.name.clone(),
        });

        let collector = match &self.options.enhanced_errors {
            Some(enhanced) if enhanced.log_capture => Some(LogCollector::new()),
            _ => None,
        };
        let capture = match collector.as_ref().map(|c| c.start()) {
            Some(Err(e)) => {
                warn!(suite = %suite_path, test = %test.name, "log capture disabled: {e}");
                None
            }
            Some(Ok(capture)) => Some(capture),
            None => None,
        };
        let collector = collector.filter(|_| capture.is_some());
        let note = |message: String| {
            if let Some(c) = &collector {
                c.framework(message);
            }
        };

        let started = Instant::now();
        let start_ts = Utc::now();
        let mut failure: Option<Thrown> = None;
        let mut failed_in: Option<&'static str> = None;

        'before: for sid in &lineage {
            for hook in &registry.suite(*sid).hooks.before_each {
                note(format!("beforeEach hook of \"{}\"", self.suite_label(*sid)));
                if let Err(thrown) = self.invoke_hook(hook, *sid, "beforeEach") {
                    failure = Some(thrown);
                    failed_in = Some("beforeEach");
                    break 'before;
                }
            }
        }

        let budget = timeout::effective(
            test.timeout_ms,
            registry.suite_timeout(test.suite),
            self.options.timeout_ms,
        );
        if failure.is_none() {
            note(format!("running test body (timeout {budget:?}ms)"));
            let body = test.body.clone();
            let label = format!("Test \"{}\"", test.name);
            if let Err(thrown) = self.worker.run(move |token: &CancelToken| body(token), budget, &label) {
                if thrown.is_timeout() {
                    note(format!("{label} timed out"));
                }
                failure = Some(thrown);
            }
        }

        for sid in lineage.iter().rev() {
            for hook in &registry.suite(*sid).hooks.after_each {
                note(format!("afterEach hook of \"{}\"", self.suite_label(*sid)));
                if let Err(thrown) = self.invoke_hook(hook, *sid, "afterEach") {
                    if failure.is_none() {
                        failure = Some(thrown);
                        failed_in = Some("afterEach");
                    }
                }
            }
        }

        drop(capture);
        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let Some(thrown) = failure else {
            self.result.summary.passed += 1;
            if let Some(passed) = &mut self.result.passed {
                passed.push(PassRecord {
                    suite: suite_path.clone(),
                    test: test.name.clone(),
                    duration: duration_ms,
                });
            }
            self.emit(RunEvent::Pass {
                suite: suite_path,
                test: test.name.clone(),
                duration: duration_ms,
            });
            return;
        };

        let mut error = self.options.normalizer.normalize(&thrown);
        if let Some(hook) = failed_in {
            error = error.into_hook_failure(hook);
        }
        if let Some(enhanced) = &self.options.enhanced_errors {
            let logs = collector.as_ref().map(|c| {
                let mut logs = c.snapshot();
                logs.truncate_to_recent(enhanced.max_logs);
                logs
            });
            let timing = enhanced.timing.then(|| Timing {
                start: start_ts,
                end: Utc::now(),
                duration: duration_ms,
            });
            let mut metadata = Map::new();
            metadata.insert("tags".to_string(), json!(registry.test_tags(id)));
            if let Some(ms) = budget {
                metadata.insert("timeoutMs".to_string(), json!(ms));
            }
            error = enhance(
                error,
                ContextParts {
                    logs,
                    timing,
                    path: TestPath {
                        suite: suite_path.clone(),
                        test: test.name.clone(),
                    },
                    metadata,
                },
            );
        }
        let error = project(error, self.options.verbose_errors);
        self.record_failure(suite_path, test.name.clone(), error, duration_ms);
    }

    fn invoke_hook(&mut self, hook: &Callback, suite: SuiteId, kind: &str) -> Result<(), Thrown> {
        let budget = timeout::effective(None, self.registry.suite_timeout(suite), self.options.timeout_ms);
        let label = format!("{kind} hook in \"{}\"", self.suite_label(suite));
        debug!(hook = kind, suite = %self.suite_label(suite), "running hook");
        let hook = hook.clone();
        self.worker.run(move |token: &CancelToken| hook(token), budget, &label)
    }

    fn suite_label(&self, suite: SuiteId) -> String {
        if suite == SuiteId::ROOT {
            "<root>".to_string()
        } else {
            self.registry.suite_path(suite)
        }
    }

    // ---- Recording -----------------------------------------------------------

    fn record_hook_failure(&mut self, suite: SuiteId, pseudo_test: &str, hook: &str, thrown: Thrown) {
        warn!(suite = %self.suite_label(suite), hook, "hook failed");
        let error = self.options.normalizer.normalize(&thrown).into_hook_failure(hook);
        let error = project(error, self.options.verbose_errors);
        let suite_path = self.registry.suite_path(suite);
        self.record_failure(suite_path, pseudo_test.to_string(), error, 0.0);
    }

    fn record_failure(&mut self, suite: String, test: String, error: ErrorDescriptor, duration: f64) {
        self.result.summary.failed += 1;
        self.result.failures.push(FailureRecord {
            suite: suite.clone(),
            test: test.clone(),
            error: error.clone(),
            duration,
        });
        self.emit(RunEvent::Fail {
            suite,
            test,
            error,
            duration,
        });
        if self.options.bail {
            self.bail = true;
        }
    }

    fn report_skip(&mut self, id: TestId, reason: SkipReason) {
        let test = self.registry.unit(id);
        let suite = self.registry.suite_path(test.suite);
        self.result.summary.skipped += 1;
        if let Some(skipped) = &mut self.result.skipped {
            skipped.push(SkipRecord {
                suite: suite.clone(),
                test: test.name.clone(),
                reason,
            });
        }
        self.emit(RunEvent::Skip {
            suite,
            test: test.name.clone(),
            reason,
        });
    }

    /// Report every visible test below `suite` as skipped, without hooks.
    ///
    /// With `reason` set the whole subtree shares it; otherwise each test's own
    /// reason is used.
    fn report_skipped_subtree(&mut self, suite: SuiteId, reason: Option<SkipReason>) {
        let node = self.registry.suite(suite);
        for test in node.tests.clone() {
            match (self.test_inclusion(test), reason) {
                (Inclusion::Filtered, _) => {}
                (_, Some(reason)) => self.report_skip(test, reason),
                (Inclusion::Skipped(own), None) => self.report_skip(test, own),
                (Inclusion::Run, None) => {}
            }
        }
        for child in node.children.clone() {
            let child_reason = match self.suite_inclusion(child) {
                Inclusion::Filtered => continue,
                Inclusion::Skipped(r) => Some(reason.unwrap_or(r)),
                Inclusion::Run => reason,
            };
            self.report_skipped_subtree(child, child_reason);
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(handler) = &self.options.on_event {
            handler(&event);
        }
    }
}

/// Convert a [`RunEvent`] for a finished test into its outcome.
pub fn outcome_of(event: &RunEvent) -> Option<TestOutcome> {
    match event {
        RunEvent::Pass { duration, .. } => Some(TestOutcome::Passed {
            duration_ms: *duration,
        }),
        RunEvent::Fail { duration, error, .. } => Some(TestOutcome::Failed {
            duration_ms: *duration,
            error: error.clone(),
        }),
        RunEvent::Skip { reason, .. } => Some(TestOutcome::Skipped { reason: *reason }),
        _ => None,
    }
}

/// Collects events for inspection; handy in tests and custom reporters.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<parking_lot::Mutex<Vec<RunEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that appends to this log.
    pub fn handler(&self) -> impl Fn(&RunEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event: &RunEvent| events.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }
}
