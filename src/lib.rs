//! Shared library for the kstress harness.
//!
//! The crate exposes the stressor worker protocol (exit statuses, the shared
//! run flag, per-instance counters), the two kernel stressors (futex
//! wait/wake contention and NUMA page migration), and the driver that forks
//! one worker per instance and reports NDJSON run records. Public functions
//! here form the contract the `stress-run` binary depends on: stressor lookup
//! by name and list parsing for environment values.

pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod futex;
pub mod numa;
pub mod protocol;
pub mod record;
pub mod residency;
pub mod shared;

pub use config::RunConfig;
pub use diagnostics::{Reporter, Severity};
pub use protocol::{ExitStatus, RunFlag, StressArgs, Stressor, Unsupported};
pub use record::{RecordReadError, RunRecord, read_records, write_records};
pub use shared::{InstanceSlot, SharedSegment};

const STRESSORS: &[&str] = &["futex", "numa"];

/// Names accepted in `STRESS_STRESSORS`, in registry order.
pub fn known_stressors() -> &'static [&'static str] {
    STRESSORS
}

/// Build the stressor registered under `name`.
///
/// Stressors whose kernel interfaces only exist on Linux resolve to an
/// [`Unsupported`] stand-in elsewhere so a run still reports them.
pub fn stressor_for(name: &str, config: &RunConfig) -> Option<Box<dyn Stressor>> {
    match name {
        #[cfg(target_os = "linux")]
        "futex" => Some(Box::new(futex::FutexStressor::<futex::LinuxFutex>::default())),
        #[cfg(target_os = "linux")]
        "numa" => Some(Box::new(
            numa::NumaStressor::new(numa::LinuxNuma, &config.numa_root)
                .with_page_touch(config.touch_pages),
        )),
        #[cfg(not(target_os = "linux"))]
        "futex" => Some(Box::new(Unsupported { name: "futex" })),
        #[cfg(not(target_os = "linux"))]
        "numa" => {
            let _ = config;
            Some(Box::new(Unsupported { name: "numa" }))
        }
        _ => None,
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .replace(',', " ")
        .split_whitespace()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
