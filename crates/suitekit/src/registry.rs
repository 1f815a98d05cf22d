//! The suite/test tree and the declaration API that builds it.
//!
//! A [`Registry`] owns every [`SuiteNode`] and [`TestUnit`] and a pointer to
//! the suite currently being declared. `describe` moves the pointer to a new
//! child for the duration of its body and always moves it back, even when the
//! body panics.
//!
//! ```rust
//! use suitekit::{Registry, RunOptions};
//!
//! let mut ctx = Registry::new();
//! ctx.describe("Calculator @unit", |ctx| {
//!     ctx.it("adds two numbers", || assert_eq!(2 + 3, 5));
//!     ctx.context("with negative numbers", |ctx| {
//!         ctx.it("handles negatives", || assert_eq!(-1 + 1, 0));
//!     });
//! });
//!
//! let result = ctx.run(RunOptions::default()).unwrap();
//! assert_eq!(result.summary.passed, 2);
//! ```

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{TestReturn, Thrown};
use crate::table::{format_name, Row, Table};
use crate::tags;
use crate::timeout::CancelToken;

/// A hook or test body, type-erased. Failures are panics or `Err` returns.
pub type Callback = Arc<dyn Fn(&CancelToken) -> Result<(), Thrown> + Send + Sync>;

fn callback(f: impl Fn() + Send + Sync + 'static) -> Callback {
    Arc::new(move |_: &CancelToken| {
        f();
        Ok(())
    })
}

fn fallible<R: TestReturn>(f: impl Fn() -> R + Send + Sync + 'static) -> Callback {
    Arc::new(move |_: &CancelToken| f().into_result())
}

#[cfg(feature = "async")]
fn async_callback<Fut, R>(f: impl Fn() -> Fut + Send + Sync + 'static) -> Callback
where
    Fut: std::future::Future<Output = R>,
    R: TestReturn,
{
    Arc::new(move |_: &CancelToken| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Thrown::from_error)?;
        runtime.block_on(f()).into_result()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuiteId(usize);

impl SuiteId {
    pub const ROOT: SuiteId = SuiteId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(usize);

impl TestId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Setup/teardown callbacks of one suite, in declaration order.
#[derive(Default, Clone)]
pub struct Hooks {
    pub before_all: Vec<Callback>,
    pub before_each: Vec<Callback>,
    pub after_each: Vec<Callback>,
    pub after_all: Vec<Callback>,
}

/// A `describe` block.
#[derive(Clone)]
pub struct SuiteNode {
    pub name: String,
    pub parent: Option<SuiteId>,
    pub children: Vec<SuiteId>,
    pub tests: Vec<TestId>,
    /// Own tags only; tests inherit them.
    pub tags: Vec<String>,
    pub hooks: Hooks,
    pub skip: bool,
    pub only: bool,
    pub timeout_ms: Option<u64>,
}

impl SuiteNode {
    fn new(name: String, parent: Option<SuiteId>, tags: Vec<String>) -> Self {
        SuiteNode {
            name,
            parent,
            children: Vec::new(),
            tests: Vec::new(),
            tags,
            hooks: Hooks::default(),
            skip: false,
            only: false,
            timeout_ms: None,
        }
    }

    fn root() -> Self {
        Self::new(String::new(), None, Vec::new())
    }
}

/// An `it` block.
#[derive(Clone)]
pub struct TestUnit {
    /// Display name, tags stripped.
    pub name: String,
    pub body: Callback,
    /// Own tags only; see [`Registry::test_tags`] for the effective set.
    pub tags: Vec<String>,
    pub suite: SuiteId,
    pub skip: bool,
    pub only: bool,
    pub timeout_ms: Option<u64>,
}

/// Owner of the declared tree.
pub struct Registry {
    suites: Vec<SuiteNode>,
    tests: Vec<TestUnit>,
    current: SuiteId,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            suites: vec![SuiteNode::root()],
            tests: Vec::new(),
            current: SuiteId::ROOT,
        }
    }

    /// Drop every declaration, leaving an empty root.
    pub fn reset(&mut self) {
        self.suites.truncate(1);
        self.suites[0] = SuiteNode::root();
        self.tests.clear();
        self.current = SuiteId::ROOT;
    }

    // ---- Tree queries --------------------------------------------------------

    pub fn root(&self) -> SuiteId {
        SuiteId::ROOT
    }

    pub fn suite(&self, id: SuiteId) -> &SuiteNode {
        &self.suites[id.0]
    }

    pub fn unit(&self, id: TestId) -> &TestUnit {
        &self.tests[id.0]
    }

    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    /// The suite currently receiving declarations.
    pub fn current(&self) -> SuiteId {
        self.current
    }

    /// `id` and its ancestors, innermost first, root included.
    pub fn ancestors(&self, id: SuiteId) -> impl Iterator<Item = SuiteId> + '_ {
        std::iter::successors(Some(id), move |s| self.suites[s.0].parent)
    }

    /// `id` and its ancestors, root first.
    pub fn lineage(&self, id: SuiteId) -> Vec<SuiteId> {
        let mut chain: Vec<SuiteId> = self.ancestors(id).collect();
        chain.reverse();
        chain
    }

    /// `"Outer > Inner"`; empty for the root.
    pub fn suite_path(&self, id: SuiteId) -> String {
        self.lineage(id)
            .into_iter()
            .filter(|s| *s != SuiteId::ROOT)
            .map(|s| self.suites[s.0].name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// Own tags followed by every ancestor's, de-duplicated.
    pub fn test_tags(&self, id: TestId) -> Vec<String> {
        let test = &self.tests[id.0];
        let mut all = test.tags.clone();
        for suite in self.ancestors(test.suite) {
            tags::merge(&mut all, &self.suites[suite.0].tags);
        }
        all
    }

    /// Effective timeout of the suite: nearest ancestor override, if any.
    pub fn suite_timeout(&self, id: SuiteId) -> Option<u64> {
        self.ancestors(id).find_map(|s| self.suites[s.0].timeout_ms)
    }

    /// Whether any suite or test anywhere is focused.
    pub fn has_only(&self) -> bool {
        self.suites.iter().any(|s| s.only) || self.tests.iter().any(|t| t.only)
    }

    /// Every test in traversal order: a suite's own tests, then its children.
    pub fn tests_in_order(&self) -> Vec<TestId> {
        let mut out = Vec::with_capacity(self.tests.len());
        self.collect_tests(SuiteId::ROOT, &mut out);
        out
    }

    fn collect_tests(&self, id: SuiteId, out: &mut Vec<TestId>) {
        let suite = &self.suites[id.0];
        out.extend(suite.tests.iter().copied());
        for child in &suite.children {
            self.collect_tests(*child, out);
        }
    }

    // ---- Describe / Context / When -------------------------------------------

    pub fn describe(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.describe_impl(name, false, false, body)
    }

    pub fn fdescribe(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.describe_impl(name, true, false, body)
    }

    pub fn xdescribe(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.describe_impl(name, false, true, body)
    }

    pub fn context(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.describe(name, body)
    }

    pub fn fcontext(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.fdescribe(name, body)
    }

    pub fn xcontext(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.xdescribe(name, body)
    }

    pub fn when(&mut self, name: &str, body: impl FnOnce(&mut Registry)) -> SuiteId {
        self.describe(name, body)
    }

    fn describe_impl(
        &mut self,
        name: &str,
        only: bool,
        skip: bool,
        body: impl FnOnce(&mut Registry),
    ) -> SuiteId {
        let (display, own_tags) = tags::extract(name);
        let id = SuiteId(self.suites.len());
        let mut node = SuiteNode::new(display, Some(self.current), own_tags);
        node.only = only;
        node.skip = skip;
        self.suites.push(node);
        self.suites[self.current.0].children.push(id);

        let previous = std::mem::replace(&mut self.current, id);
        let outcome = catch_unwind(AssertUnwindSafe(|| body(self)));
        self.current = previous;
        if let Err(panic) = outcome {
            resume_unwind(panic);
        }
        id
    }

    // ---- It / Specify / Test -------------------------------------------------

    /// Define a test case. Returns an [`ItBuilder`] for optional decorators.
    ///
    /// ```rust
    /// # let mut ctx = suitekit::Registry::new();
    /// ctx.it("works", || assert!(true));
    ///
    /// ctx.it("slow test @slow", || { /* ... */ })
    ///     .labels(&["db"])
    ///     .timeout(5_000);
    /// ```
    pub fn it(
        &mut self,
        name: &str,
        body: impl Fn() + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        ItBuilder::new(self, name, callback(body))
    }

    /// A test whose body returns a `Result`; an `Err` fails it.
    ///
    /// ```rust
    /// # let mut ctx = suitekit::Registry::new();
    /// ctx.it_try("parses", || "42".parse::<u32>().map(|_| ()));
    /// ```
    pub fn it_try<R: TestReturn>(
        &mut self,
        name: &str,
        body: impl Fn() -> R + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        ItBuilder::new(self, name, fallible(body))
    }

    pub fn fit(
        &mut self,
        name: &str,
        body: impl Fn() + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        self.it(name, body).only()
    }

    pub fn xit(
        &mut self,
        name: &str,
        body: impl Fn() + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        self.it(name, body).skip()
    }

    pub fn specify(
        &mut self,
        name: &str,
        body: impl Fn() + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        self.it(name, body)
    }

    pub fn test(
        &mut self,
        name: &str,
        body: impl Fn() + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        self.it(name, body)
    }

    /// A test whose body receives the [`CancelToken`] its timeout trips.
    pub fn it_cancellable(
        &mut self,
        name: &str,
        body: impl Fn(&CancelToken) + Send + Sync + 'static,
    ) -> ItBuilder<'_> {
        let cb: Callback = Arc::new(move |token: &CancelToken| {
            body(token);
            Ok(())
        });
        ItBuilder::new(self, name, cb)
    }

    /// A test driven by a current-thread tokio runtime.
    #[cfg(feature = "async")]
    pub fn it_async<Fut, R>(
        &mut self,
        name: &str,
        body: impl Fn() -> Fut + Send + Sync + 'static,
    ) -> ItBuilder<'_>
    where
        Fut: std::future::Future<Output = R>,
        R: TestReturn,
    {
        ItBuilder::new(self, name, async_callback(body))
    }

    fn add_test(&mut self, decl: TestDecl) -> TestId {
        let (display, mut own_tags) = tags::extract(&decl.name);
        tags::merge(&mut own_tags, &decl.labels);
        let id = TestId(self.tests.len());
        self.tests.push(TestUnit {
            name: display,
            body: decl.body,
            tags: own_tags,
            suite: self.current,
            skip: decl.skip,
            only: decl.only,
            timeout_ms: decl.timeout_ms,
        });
        self.suites[self.current.0].tests.push(id);
        id
    }

    // ---- Hooks ---------------------------------------------------------------

    pub fn before_all(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.current_mut().hooks.before_all.push(callback(hook));
    }

    pub fn before_each(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.current_mut().hooks.before_each.push(callback(hook));
    }

    pub fn after_each(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.current_mut().hooks.after_each.push(callback(hook));
    }

    pub fn after_all(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.current_mut().hooks.after_all.push(callback(hook));
    }

    /// Fallible `before_all`: an `Err` fails the suite's setup.
    pub fn before_all_try<R: TestReturn>(&mut self, hook: impl Fn() -> R + Send + Sync + 'static) {
        self.current_mut().hooks.before_all.push(fallible(hook));
    }

    pub fn before_each_try<R: TestReturn>(&mut self, hook: impl Fn() -> R + Send + Sync + 'static) {
        self.current_mut().hooks.before_each.push(fallible(hook));
    }

    pub fn after_each_try<R: TestReturn>(&mut self, hook: impl Fn() -> R + Send + Sync + 'static) {
        self.current_mut().hooks.after_each.push(fallible(hook));
    }

    pub fn after_all_try<R: TestReturn>(&mut self, hook: impl Fn() -> R + Send + Sync + 'static) {
        self.current_mut().hooks.after_all.push(fallible(hook));
    }

    #[cfg(feature = "async")]
    pub fn before_all_async<Fut, R>(&mut self, hook: impl Fn() -> Fut + Send + Sync + 'static)
    where
        Fut: std::future::Future<Output = R>,
        R: TestReturn,
    {
        self.current_mut().hooks.before_all.push(async_callback(hook));
    }

    #[cfg(feature = "async")]
    pub fn before_each_async<Fut, R>(&mut self, hook: impl Fn() -> Fut + Send + Sync + 'static)
    where
        Fut: std::future::Future<Output = R>,
        R: TestReturn,
    {
        self.current_mut().hooks.before_each.push(async_callback(hook));
    }

    #[cfg(feature = "async")]
    pub fn after_each_async<Fut, R>(&mut self, hook: impl Fn() -> Fut + Send + Sync + 'static)
    where
        Fut: std::future::Future<Output = R>,
        R: TestReturn,
    {
        self.current_mut().hooks.after_each.push(async_callback(hook));
    }

    #[cfg(feature = "async")]
    pub fn after_all_async<Fut, R>(&mut self, hook: impl Fn() -> Fut + Send + Sync + 'static)
    where
        Fut: std::future::Future<Output = R>,
        R: TestReturn,
    {
        self.current_mut().hooks.after_all.push(async_callback(hook));
    }

    // ---- Current-suite settings ----------------------------------------------

    /// Add tags to the current suite, as if written `@tag` in its name.
    pub fn labels(&mut self, labels: &[&str]) {
        let extra: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        tags::merge(&mut self.current_mut().tags, &extra);
    }

    /// Set the timeout override of the current suite.
    pub fn timeout(&mut self, ms: u64) {
        self.current_mut().timeout_ms = Some(ms);
    }

    fn current_mut(&mut self) -> &mut SuiteNode {
        &mut self.suites[self.current.0]
    }

    // ---- Table-driven --------------------------------------------------------

    /// Start a parameterized declaration over `table`.
    ///
    /// ```rust
    /// # use serde_json::json;
    /// # let mut ctx = suitekit::Registry::new();
    /// ctx.each(suitekit::Table::new(vec![json!([1, 2, 3]), json!([2, 3, 5])]))
    ///     .it("adds %d+%d=%d", |row| {
    ///         assert_eq!(row[0].as_i64().unwrap() + row[1].as_i64().unwrap(), row[2].as_i64().unwrap());
    ///     });
    /// ```
    pub fn each(&mut self, table: impl Into<Table>) -> EachBuilder<'_> {
        EachBuilder {
            registry: self,
            table: table.into(),
            timeout_ms: None,
        }
    }
}

struct TestDecl {
    name: String,
    body: Callback,
    only: bool,
    skip: bool,
    labels: Vec<String>,
    timeout_ms: Option<u64>,
}

// ============================================================================
// ItBuilder: fluent decorator API, registers the test on Drop
// ============================================================================

/// Builder returned by [`Registry::it`]. Registers the test when dropped.
pub struct ItBuilder<'r> {
    registry: &'r mut Registry,
    decl: Option<TestDecl>,
}

impl<'r> ItBuilder<'r> {
    fn new(registry: &'r mut Registry, name: &str, body: Callback) -> Self {
        ItBuilder {
            registry,
            decl: Some(TestDecl {
                name: name.to_string(),
                body,
                only: false,
                skip: false,
                labels: Vec::new(),
                timeout_ms: None,
            }),
        }
    }

    fn with(mut self, f: impl FnOnce(&mut TestDecl)) -> Self {
        if let Some(decl) = self.decl.as_mut() {
            f(decl);
        }
        self
    }

    /// Extra tags, as if written `@tag` in the name.
    pub fn labels(self, labels: &[&str]) -> Self {
        let extra: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.with(|d| tags::merge(&mut d.labels, &extra))
    }

    /// Fail the test if it runs longer than `ms` milliseconds.
    pub fn timeout(self, ms: u64) -> Self {
        self.with(|d| d.timeout_ms = Some(ms))
    }

    pub fn only(self) -> Self {
        self.with(|d| d.only = true)
    }

    pub fn skip(self) -> Self {
        self.with(|d| d.skip = true)
    }
}

impl Drop for ItBuilder<'_> {
    fn drop(&mut self) {
        if let Some(decl) = self.decl.take() {
            self.registry.add_test(decl);
        }
    }
}

// ============================================================================
// EachBuilder: one declaration per table row
// ============================================================================

/// Builder returned by [`Registry::each`].
#[must_use = "call it/describe to declare the rows"]
pub struct EachBuilder<'r> {
    registry: &'r mut Registry,
    table: Table,
    timeout_ms: Option<u64>,
}

impl EachBuilder<'_> {
    /// Timeout applied to every generated test.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn it(
        self,
        template: &str,
        body: impl Fn(&Row) + Send + Sync + 'static,
    ) -> Vec<TestId> {
        self.tests(template, false, false, move |row: &Row| {
            body(row);
            Ok::<(), std::convert::Infallible>(())
        })
    }

    pub fn fit(
        self,
        template: &str,
        body: impl Fn(&Row) + Send + Sync + 'static,
    ) -> Vec<TestId> {
        self.tests(template, true, false, move |row: &Row| {
            body(row);
            Ok::<(), std::convert::Infallible>(())
        })
    }

    pub fn xit(
        self,
        template: &str,
        body: impl Fn(&Row) + Send + Sync + 'static,
    ) -> Vec<TestId> {
        self.tests(template, false, true, move |row: &Row| {
            body(row);
            Ok::<(), std::convert::Infallible>(())
        })
    }

    /// Row tests whose body returns a `Result`.
    pub fn it_try<R: TestReturn>(
        self,
        template: &str,
        body: impl Fn(&Row) -> R + Send + Sync + 'static,
    ) -> Vec<TestId> {
        self.tests(template, false, false, body)
    }

    fn tests<R: TestReturn>(
        self,
        template: &str,
        only: bool,
        skip: bool,
        body: impl Fn(&Row) -> R + Send + Sync + 'static,
    ) -> Vec<TestId> {
        let body = Arc::new(body);
        let mut ids = Vec::with_capacity(self.table.len());
        for row in self.table.rows() {
            let name = format_name(template, row);
            let row = row.clone();
            let body = body.clone();
            let cb: Callback = Arc::new(move |_: &CancelToken| body(&row).into_result());
            ids.push(self.registry.add_test(TestDecl {
                name,
                body: cb,
                only,
                skip,
                labels: Vec::new(),
                timeout_ms: self.timeout_ms,
            }));
        }
        ids
    }

    pub fn describe(self, template: &str, body: impl Fn(&mut Registry, &Row)) -> Vec<SuiteId> {
        self.suites(template, false, false, body)
    }

    pub fn fdescribe(self, template: &str, body: impl Fn(&mut Registry, &Row)) -> Vec<SuiteId> {
        self.suites(template, true, false, body)
    }

    pub fn xdescribe(self, template: &str, body: impl Fn(&mut Registry, &Row)) -> Vec<SuiteId> {
        self.suites(template, false, true, body)
    }

    fn suites(
        self,
        template: &str,
        only: bool,
        skip: bool,
        body: impl Fn(&mut Registry, &Row),
    ) -> Vec<SuiteId> {
        let timeout_ms = self.timeout_ms;
        let mut ids = Vec::with_capacity(self.table.len());
        for row in self.table.rows() {
            let name = format_name(template, row);
            ids.push(self.registry.describe_impl(&name, only, skip, |ctx| {
                if let Some(ms) = timeout_ms {
                    ctx.timeout(ms);
                }
                body(ctx, row);
            }));
        }
        ids
    }
}
