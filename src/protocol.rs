//! The worker contract every stressor obeys.
//!
//! A stressor runs until the shared run flag drops or its op counter reaches
//! the `max_ops` bound, bumping the counter once per unit of work. It never
//! panics or propagates errors to the driver: the outcome is an [`ExitStatus`]
//! and anything worth telling a human goes through the diagnostics reporter,
//! so one instance failing cannot take its siblings down with it.

use crate::diagnostics::Reporter;
use crate::shared::InstanceSlot;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Outcome of one stressor instance, doubling as the worker's exit code.
pub enum ExitStatus {
    Success,
    Failure,
    NoResource,
    NotImplemented,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::NoResource => 3,
            ExitStatus::NotImplemented => 4,
        }
    }

    /// Map a worker exit code back to a status; unknown codes are failures.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Success,
            3 => ExitStatus::NoResource,
            4 => ExitStatus::NotImplemented,
            _ => ExitStatus::Failure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Failure => "failure",
            ExitStatus::NoResource => "no_resource",
            ExitStatus::NotImplemented => "not_implemented",
        }
    }
}

/// Cooperative cancellation token shared by every stressor of a run.
///
/// The flag is borrowed, never owned: the driver keeps it in the shared
/// segment so forked workers observe a stop, tests keep it on the stack.
#[derive(Clone, Copy, Debug)]
pub struct RunFlag<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunFlag<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }

    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Request every observer to wind down. Never reset during a run.
    pub fn stop(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Everything one stressor instance is handed by the driver.
pub struct StressArgs<'a> {
    pub instance: u32,
    pub max_ops: u64,
    pub name: &'a str,
    pub run: RunFlag<'a>,
    pub verify: bool,
    /// Process group the run's workers join; `None` leaves membership alone.
    pub pgrp: Option<Pid>,
    pub slot: &'a InstanceSlot,
}

impl<'a> StressArgs<'a> {
    pub fn counter(&self) -> &'a AtomicU64 {
        &self.slot.ops
    }

    pub fn ops(&self) -> u64 {
        self.counter().load(Ordering::Acquire)
    }

    /// Loop condition shared by all stressors.
    pub fn keep_going(&self) -> bool {
        self.run.is_running() && (self.max_ops == 0 || self.ops() < self.max_ops)
    }

    /// Record one completed unit of work.
    pub fn bump(&self) {
        self.counter().fetch_add(1, Ordering::AcqRel);
    }

    /// Reporter keyed by this instance's name, mirroring failures into the slot.
    pub fn reporter(&self) -> Reporter<'a> {
        Reporter::new(self.name).with_sink(&self.slot.failures)
    }
}

/// A stressor entry point, selected once per run by the registry.
pub trait Stressor {
    fn name(&self) -> &'static str;
    fn run(&self, args: &StressArgs<'_>) -> ExitStatus;
}

/// Stand-in for a stressor whose kernel interface the host lacks.
#[derive(Debug, Clone, Copy)]
pub struct Unsupported {
    pub name: &'static str,
}

impl Stressor for Unsupported {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, args: &StressArgs<'_>) -> ExitStatus {
        Reporter::new(args.name).info("this stressor is not implemented on this system");
        ExitStatus::NotImplemented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip_through_from_code() {
        for status in [
            ExitStatus::Success,
            ExitStatus::Failure,
            ExitStatus::NoResource,
            ExitStatus::NotImplemented,
        ] {
            assert_eq!(ExitStatus::from_code(status.code()), status);
        }
        assert_eq!(ExitStatus::from_code(2), ExitStatus::Failure);
        assert_eq!(ExitStatus::from_code(-1), ExitStatus::Failure);
    }

    #[test]
    fn keep_going_honors_bound_and_flag() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let args = StressArgs {
            instance: 0,
            max_ops: 2,
            name: "unit",
            run: RunFlag::new(&flag),
            verify: false,
            pgrp: None,
            slot: &slot,
        };

        assert!(args.keep_going());
        args.bump();
        assert!(args.keep_going());
        args.bump();
        assert!(!args.keep_going(), "bound reached");

        let unbounded = StressArgs { max_ops: 0, ..args };
        assert!(unbounded.keep_going());
        unbounded.run.stop();
        assert!(!unbounded.keep_going(), "stop request ends the loop");
    }

    #[test]
    fn unsupported_stub_reports_not_implemented_without_side_effects() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let args = StressArgs {
            instance: 3,
            max_ops: 0,
            name: "stub",
            run: RunFlag::new(&flag),
            verify: true,
            pgrp: None,
            slot: &slot,
        };
        let stub = Unsupported { name: "futex" };
        assert_eq!(stub.run(&args), ExitStatus::NotImplemented);
        assert_eq!(args.ops(), 0);
        assert_eq!(slot.failures.load(Ordering::Relaxed), 0);
        assert!(flag.load(Ordering::Relaxed));
    }
}
