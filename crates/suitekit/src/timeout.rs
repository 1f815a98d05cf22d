//! Racing an operation against a timer.
//!
//! Operations run on a [`Worker`]: one long-lived thread that executes them in
//! submission order, so every hook and test body of a run shares a thread and
//! its thread-locals. The caller waits at most the budget for each operation.
//! Cancellation is cooperative only: a timed-out operation's thread is
//! abandoned, its [`CancelToken`] is tripped, and whatever it eventually
//! produces is discarded. The next operation gets a fresh thread. Nothing is
//! ever forcibly interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::warn;

use crate::error::{Thrown, TimeoutExceeded};
use crate::logs;
use crate::panic;

/// Signal an operation may poll to stop early after its guard gave up on it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Pick the effective budget: test override, then suite override, then the
/// process-wide default.
pub fn effective(test: Option<u64>, suite: Option<u64>, default: Option<u64>) -> Option<u64> {
    test.or(suite).or(default)
}

/// Run `operation`, failing with [`TimeoutExceeded`] if it takes longer than
/// `duration_ms`. A missing or zero budget runs it inline, unguarded.
///
/// Panics inside the operation are caught and returned as [`Thrown::Panic`]
/// either way.
pub fn guard<F>(operation: F, duration_ms: Option<u64>, label: &str) -> Result<(), Thrown>
where
    F: FnOnce(&CancelToken) -> Result<(), Thrown> + Send + 'static,
{
    match duration_ms {
        Some(ms) if ms > 0 => Worker::new(format!("suitekit: {label}")).run(operation, Some(ms), label),
        _ => {
            let token = CancelToken::new();
            panic::capture(|| operation(&token))
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct Lane {
    jobs: mpsc::Sender<Job>,
    thread: ThreadId,
}

/// A thread that runs guarded operations one after another.
///
/// The thread is spawned on first use and replaced after an operation times
/// out. Dropping the worker lets its thread finish once it goes idle.
pub struct Worker {
    name: String,
    lane: Option<Lane>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Worker {
            name: name.into(),
            lane: None,
        }
    }

    /// Run `operation` on the worker thread, waiting at most `duration_ms`
    /// for it. A missing or zero budget waits for as long as it takes.
    pub fn run<F>(&mut self, operation: F, duration_ms: Option<u64>, label: &str) -> Result<(), Thrown>
    where
        F: FnOnce(&CancelToken) -> Result<(), Thrown> + Send + 'static,
    {
        let lane = match self.lane.take() {
            Some(lane) => lane,
            None => self.spawn().map_err(Thrown::from_error)?,
        };

        let token = CancelToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::capture(|| operation(&worker_token));
            // The receiver is gone if we already timed out.
            let _ = tx.send(result);
        });
        if lane.jobs.send(job).is_err() {
            return Err(Thrown::from_error(format!("{label} worker is gone")));
        }

        let outcome = match duration_ms.filter(|ms| *ms > 0) {
            Some(ms) => rx.recv_timeout(Duration::from_millis(ms)),
            None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match outcome {
            Ok(result) => {
                self.lane = Some(lane);
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let ms = duration_ms.unwrap_or_default();
                token.cancel();
                logs::detach_thread(lane.thread);
                warn!(label, duration_ms = ms, "operation timed out");
                Err(Thrown::Timeout(TimeoutExceeded {
                    label: label.to_string(),
                    duration_ms: ms,
                }))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Thrown::from_error(format!(
                "{label} worker exited without reporting"
            ))),
        }
    }

    fn spawn(&self) -> std::io::Result<Lane> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(self.name.clone()).spawn(move || {
            for job in queue {
                job();
            }
        })?;
        Ok(Lane {
            jobs,
            thread: handle.thread().id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::panic_message;

    #[test]
    fn fast_operation_passes() {
        assert!(guard(|_| Ok(()), Some(1_000), "fast").is_ok());
    }

    #[test]
    fn slow_operation_times_out_and_is_cancelled() {
        let seen = Arc::new(AtomicBool::new(false));
        let seen_in_worker = seen.clone();
        let err = guard(
            move |token| {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                seen_in_worker.store(true, Ordering::SeqCst);
                Ok(())
            },
            Some(30),
            "slow op",
        )
        .unwrap_err();

        match err {
            Thrown::Timeout(t) => {
                assert_eq!(t.label, "slow op");
                assert_eq!(t.duration_ms, 30);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("worker never observed cancellation");
    }

    #[test]
    fn no_budget_runs_inline() {
        let here = std::thread::current().id();
        let result = guard(
            move |_| {
                assert_eq!(std::thread::current().id(), here);
                Ok(())
            },
            None,
            "inline",
        );
        assert!(result.is_ok());
        assert!(guard(|_| Ok(()), Some(0), "zero").is_ok());
    }

    #[test]
    fn panics_in_worker_are_returned() {
        let err = guard(|_| panic!("worker blew up"), Some(1_000), "p").unwrap_err();
        assert_eq!(panic_message(&err), Some("worker blew up"));
    }

    #[test]
    fn worker_keeps_one_thread_until_a_timeout() {
        thread_local! {
            static FIXTURE: std::cell::Cell<u32> = std::cell::Cell::new(0);
        }
        let mut worker = Worker::new("suitekit-test-worker");
        let set = worker.run(
            |_| {
                FIXTURE.with(|f| f.set(42));
                Ok(())
            },
            Some(1_000),
            "set",
        );
        assert!(set.is_ok());
        let read = worker.run(
            |_| {
                assert_eq!(FIXTURE.with(|f| f.get()), 42);
                Ok(())
            },
            None,
            "read",
        );
        assert!(read.is_ok());

        let stuck = worker.run(
            |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
            Some(20),
            "stuck",
        );
        assert!(matches!(stuck, Err(Thrown::Timeout(_))));
        let fresh = worker.run(
            |_| {
                assert_eq!(FIXTURE.with(|f| f.get()), 0);
                Ok(())
            },
            Some(1_000),
            "fresh",
        );
        assert!(fresh.is_ok());
    }

    #[test]
    fn worker_reports_panics_and_stays_usable() {
        let mut worker = Worker::new("suitekit-test-worker");
        let err = worker.run(|_| panic!("hook blew up"), None, "p").unwrap_err();
        assert_eq!(panic_message(&err), Some("hook blew up"));
        assert!(worker.run(|_| Ok(()), Some(1_000), "after").is_ok());
    }

    #[test]
    fn precedence_is_test_then_suite_then_default() {
        assert_eq!(effective(Some(1), Some(2), Some(3)), Some(1));
        assert_eq!(effective(None, Some(2), Some(3)), Some(2));
        assert_eq!(effective(None, None, Some(3)), Some(3));
        assert_eq!(effective(None, None, None), None);
    }
}
