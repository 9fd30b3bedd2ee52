//! Diagnostic channel for stressor workers.
//!
//! Stressors only decide *what* to say and how severe it is; routing and
//! formatting belong to the `tracing` subscriber installed by the binary.
//! `Fail` reports are also counted so callers (and the driver, through the
//! shared slot) can tell whether an instance saw a verified failure.

use nix::errno::Errno;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Fail,
    Warn,
    Info,
    Debug,
}

pub struct Reporter<'a> {
    name: &'a str,
    failures: Cell<u64>,
    sink: Option<&'a AtomicU64>,
}

impl<'a> Reporter<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            failures: Cell::new(0),
            sink: None,
        }
    }

    /// Mirror every counted failure into a shared counter as well.
    pub fn with_sink(mut self, sink: &'a AtomicU64) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Failures reported through this reporter (not the shared sink).
    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    pub fn report(&self, severity: Severity, message: &str) {
        let stressor = self.name;
        match severity {
            Severity::Fail => {
                self.failures.set(self.failures.get() + 1);
                if let Some(sink) = self.sink {
                    sink.fetch_add(1, Ordering::AcqRel);
                }
                tracing::error!(stressor, "{stressor}: {message}");
            }
            Severity::Warn => tracing::warn!(stressor, "{stressor}: {message}"),
            Severity::Info => tracing::info!(stressor, "{stressor}: {message}"),
            Severity::Debug => tracing::debug!(stressor, "{stressor}: {message}"),
        }
    }

    /// Counted failure of a named kernel call.
    pub fn fail_call(&self, call: &str, err: Errno) {
        self.report(
            Severity::Fail,
            &format!("{call} failed: errno={} ({})", err as i32, err.desc()),
        );
    }

    /// Uncounted note that a kernel call failed and the loop moved on.
    pub fn warn_call(&self, call: &str, err: Errno) {
        self.report(
            Severity::Warn,
            &format!("{call} failed: errno={} ({})", err as i32, err.desc()),
        );
    }

    pub fn info(&self, message: &str) {
        self.report(Severity::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.report(Severity::Debug, message);
    }
}
