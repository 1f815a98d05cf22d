//! # suitekit: a describe/it test execution engine
//!
//! Declare suites, tests and lifecycle hooks into a [`Registry`], then run or
//! list them with filtering, focus/skip, per-test timeouts, bail, and failure
//! descriptors enriched with the logs captured while the test ran.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! fn main() {
//!     suitekit::run(|ctx| {
//!         ctx.describe("Calculator @unit", |ctx| {
//!             ctx.before_each(|| suitekit::console::info("fresh calculator"));
//!
//!             ctx.it("adds two numbers", || {
//!                 assert_eq!(2 + 3, 5);
//!             });
//!
//!             ctx.context("with negative numbers", |ctx| {
//!                 ctx.it("handles negatives", || {
//!                     assert_eq!(-1 + 1, 0);
//!                 });
//!             });
//!         });
//!     });
//! }
//! ```
//!
//! Programmatic runs go through [`Registry::run`] and return a [`RunResult`]
//! instead of printing:
//!
//! ```rust
//! use suitekit::{Registry, RunOptions};
//!
//! let mut ctx = Registry::new();
//! ctx.it_try("fails", || -> Result<(), String> { Err("nope".into()) });
//! let result = ctx.run(RunOptions::default()).unwrap();
//! assert!(!result.summary.success);
//! assert_eq!(result.failures[0].error.message, "nope");
//! ```
//!
//! ## Features
//!
//! - `googletest`: re-exports `googletest` matchers via `suitekit::matchers`
//! - `async`: `it_async` and `*_async` hooks driven by a tokio runtime

pub mod descriptor;
pub mod error;
pub mod filter;
pub mod logs;
pub mod options;
pub mod panic;
pub mod registry;
pub mod report;
pub mod runner;
pub mod table;
pub mod tags;
pub mod timeout;

pub use descriptor::{ErrorDescriptor, ExecutionContext, Normalizer};
pub use error::{TableError, Thrown, TimeoutExceeded, UsageError};
pub use filter::{list, FilterCriteria, ListedTest, OnlySelector, Pattern};
pub use logs::{by, console, LogCollector, LogSink};
pub use options::{EnhancedErrors, RunConfig, RunOptions};
pub use registry::{EachBuilder, ItBuilder, Registry, SuiteId, TestId};
pub use report::ConsoleReporter;
pub use runner::{RunEvent, RunResult, SkipReason, Summary};
pub use table::{Row, Table};
pub use timeout::CancelToken;

/// Re-export of the [`googletest`] crate. Available with the `googletest` feature.
#[cfg(feature = "googletest")]
pub use googletest;

/// Composable matchers re-exported from [`googletest::prelude`].
///
/// `verify_that!` returns a `googletest::Result<()>`, which an `it_try` body can
/// return directly.
#[cfg(feature = "googletest")]
pub mod matchers {
    pub use googletest::prelude::*;
}

use std::sync::Arc;

/// Entry point for `harness = false` test targets.
///
/// Declares the tree, reads [`RunConfig::from_args`], then lists or runs it
/// with a [`ConsoleReporter`]. Exits with status 1 on any failure.
pub fn run(body: impl FnOnce(&mut Registry)) {
    let mut registry = Registry::new();
    body(&mut registry);

    let config = match RunConfig::from_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("suitekit: {e}");
            std::process::exit(1);
        }
    };

    let reporter = Arc::new(ConsoleReporter::new());
    if config.list {
        match registry.list(&config.options.criteria) {
            Ok(listed) => reporter.print_listing(&listed),
            Err(e) => {
                eprintln!("suitekit: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let options = config.options.on_event(reporter.handler());
    match registry.run(options) {
        Ok(result) => {
            reporter.print_summary(&result);
            if !result.summary.success {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("suitekit: {e}");
            std::process::exit(1);
        }
    }
}
