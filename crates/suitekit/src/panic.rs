//! Catching panics from callbacks along with where they happened.
//!
//! A process-wide panic hook is installed once. While a callback runs inside
//! [`capture`], the hook records the panic location (and a backtrace when
//! `RUST_BACKTRACE` asks for one) into a thread-local slot instead of printing.
//! Panics outside [`capture`] go to the previously installed hook unchanged.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::Once;

use serde::Serialize;

use crate::error::Thrown;

/// Where a caught panic originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicTrace {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Rendered backtrace, present only when backtraces are enabled.
    pub backtrace: Option<String>,
}

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_TRACE: RefCell<Option<PanicTrace>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            if CAPTURING.with(Cell::get) {
                let trace = record(info);
                LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn record(info: &PanicHookInfo<'_>) -> PanicTrace {
    let backtrace = Backtrace::capture();
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    };
    match info.location() {
        Some(loc) => PanicTrace {
            file: loc.file().to_string(),
            line: loc.line(),
            column: loc.column(),
            backtrace,
        },
        None => PanicTrace {
            file: String::new(),
            line: 0,
            column: 0,
            backtrace,
        },
    }
}

/// Run `f`, turning a panic into [`Thrown::Panic`] and a returned failure into
/// itself.
pub fn capture<F>(f: F) -> Result<(), Thrown>
where
    F: FnOnce() -> Result<(), Thrown>,
{
    install_hook();
    let was_capturing = CAPTURING.with(|c| c.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    CAPTURING.with(|c| c.set(was_capturing));

    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let trace = LAST_TRACE.with(|slot| slot.borrow_mut().take());
            Err(Thrown::Panic { payload, trace })
        }
    }
}
