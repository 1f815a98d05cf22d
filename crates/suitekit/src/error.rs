//! Error types.
//!
//! [`UsageError`] and [`TableError`] are programmer errors surfaced
//! synchronously. [`Thrown`] is whatever a test body or hook "threw": a caught
//! panic, a returned `Err`, or a [`TimeoutExceeded`].

use std::any::Any;
use std::fmt;
use thiserror::Error;

use crate::panic::PanicTrace;

/// Invalid arguments to `run` / `list`. Never part of a run result.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error(
        "{entry} expects an options object but received {received}; \
         pass an object instead, e.g. {entry}({example})"
    )]
    NotAnObject {
        entry: &'static str,
        received: &'static str,
        example: &'static str,
    },

    #[error("unknown option `{key}` passed to {entry}")]
    UnknownOption { entry: &'static str, key: String },

    #[error("option `{key}` expects {expected} but received {received}")]
    InvalidType {
        key: String,
        expected: &'static str,
        received: &'static str,
    },

    #[error("option `{key}` is not a valid regular expression: {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("option `{key}` is invalid: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error(
        "focused tests detected but fail_on_focus is set; \
         remove fdescribe/fit before pushing"
    )]
    FocusForbidden,
}

/// A malformed `each` table.
#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("table template has no header row")]
    MissingHeader,

    #[error("table template row {row} has {found} cells but the header has {expected}")]
    CellCount {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("table template header contains an empty column name")]
    EmptyColumn,
}

/// A [`LogCollector`](crate::logs::LogCollector) was started while another
/// one was still capturing.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a log collector is already active; end its capture before starting another")]
pub struct CollectorActive;

/// Raised by the timeout guard when an operation outlives its budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{label} exceeded timeout of {duration_ms}ms")]
pub struct TimeoutExceeded {
    pub label: String,
    pub duration_ms: u64,
}

/// Anything a test body or hook can fail with.
pub enum Thrown {
    /// A caught panic, with whatever the panic hook recorded about it.
    Panic {
        payload: Box<dyn Any + Send>,
        trace: Option<PanicTrace>,
    },
    /// An `Err` returned from a fallible callback.
    Error {
        name: String,
        message: String,
        debug: String,
    },
    Timeout(TimeoutExceeded),
}

impl Thrown {
    /// Wrap a returned error value, naming it by its type.
    pub fn from_error<E: fmt::Display + fmt::Debug>(err: E) -> Self {
        Thrown::Error {
            name: short_type_name::<E>(),
            message: err.to_string(),
            debug: format!("{err:?}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Thrown::Timeout(_))
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Thrown::Panic { trace, .. } => f
                .debug_struct("Panic")
                .field("message", &panic_message(self))
                .field("trace", trace)
                .finish(),
            Thrown::Error { name, message, .. } => f
                .debug_struct("Error")
                .field("name", name)
                .field("message", message)
                .finish(),
            Thrown::Timeout(t) => f.debug_tuple("Timeout").field(t).finish(),
        }
    }
}

/// The string message of a panic payload, if it carries one.
pub(crate) fn panic_message(thrown: &Thrown) -> Option<&str> {
    match thrown {
        Thrown::Panic { payload, .. } => payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
        _ => None,
    }
}

/// Last path segment of a type name, generics dropped: `my::Error<T>` → `Error`.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Return types a fallible (`*_try` or async) body or hook may have.
///
/// `()` always succeeds (failures are panics); `Result<(), E>` fails on `Err`.
pub trait TestReturn {
    fn into_result(self) -> Result<(), Thrown>;
}

impl TestReturn for () {
    fn into_result(self) -> Result<(), Thrown> {
        Ok(())
    }
}

impl<E: fmt::Display + fmt::Debug> TestReturn for Result<(), E> {
    fn into_result(self) -> Result<(), Thrown> {
        self.map_err(Thrown::from_error)
    }
}
