//! Futex contention stressor.
//!
//! Two processes share one futex word in the instance slot: the worker forks a
//! waiter that spins on short-timeout `FUTEX_WAIT` calls while the worker
//! itself issues `FUTEX_WAKE` as fast as it can. The point is not efficient
//! synchronization but saturating the kernel's wait/wake path; wakes issued
//! with nobody waiting are simply lost.
//!
//! The waker owns the waiter's lifetime ([`WaiterGuard`] kills and reaps it on
//! every exit path) and the waiter arms a parent-death signal so an
//! out-of-band kill of the waker cannot leak it.

use crate::diagnostics::Reporter;
use crate::protocol::StressArgs;
use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Waiter timeout; short on purpose to force rapid timer wakeups.
pub const WAIT_TIMEOUT: Duration = Duration::from_micros(5);
/// Timeouts tolerated before the idle waiter backs off, and the threshold step.
pub const BACKOFF_STEP: u64 = 100_000;
pub const BACKOFF_SLEEP: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Failed(Errno),
}

/// Kernel seam for the two futex operations the stressor issues.
pub trait FutexOps {
    /// Wake up to `waiters` waiters; returns how many were woken.
    fn wake(&self, word: &AtomicU32, waiters: i32) -> Result<usize, Errno>;
    fn wait(&self, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitOutcome;
}

#[derive(Clone, Copy, Debug)]
/// Idle-waiter pacing: after `step` more timeouts, sleep for `sleep`.
pub struct Backoff {
    pub wait_timeout: Duration,
    pub step: u64,
    pub sleep: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            wait_timeout: WAIT_TIMEOUT,
            step: BACKOFF_STEP,
            sleep: BACKOFF_SLEEP,
        }
    }
}

/// Waiter role: wait on the slot's futex word expecting 0.
///
/// Timeouts accumulate in the slot; once they pass the rolling threshold the
/// waiter calls `sleep` and raises the threshold, so a waiter nobody wakes
/// does not pin a CPU forever.
pub fn waiter_loop<F, S>(
    ops: &F,
    args: &StressArgs<'_>,
    reporter: &Reporter<'_>,
    backoff: &Backoff,
    mut sleep: S,
) where
    F: FutexOps,
    S: FnMut(Duration),
{
    let word = &args.slot.futex_word;
    let timeouts = &args.slot.futex_timeouts;
    let mut threshold = backoff.step;

    // keep_going re-checks the run flag right before each (bounded) wait.
    while args.keep_going() {
        match ops.wait(word, 0, backoff.wait_timeout) {
            WaitOutcome::TimedOut => {
                let seen = timeouts.fetch_add(1, Ordering::AcqRel) + 1;
                if seen > threshold {
                    sleep(backoff.sleep);
                    threshold += backoff.step;
                }
            }
            WaitOutcome::Failed(err) if args.verify => reporter.fail_call("futex wait", err),
            WaitOutcome::Failed(_) => {
                args.slot.soft_errors.fetch_add(1, Ordering::AcqRel);
                args.bump();
            }
            WaitOutcome::Woken => args.bump(),
        }
    }
}

/// Waker role: wake exactly one waiter per pass until stopped or bounded.
pub fn waker_loop<F: FutexOps>(ops: &F, args: &StressArgs<'_>, reporter: &Reporter<'_>) {
    let word = &args.slot.futex_word;
    while args.keep_going() {
        match ops.wake(word, 1) {
            Ok(_) => {}
            Err(err) if args.verify => reporter.fail_call("futex wake", err),
            Err(_) => {
                args.slot.soft_errors.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{FutexStressor, LinuxFutex, WaiterGuard};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::protocol::{ExitStatus, Stressor};
    use nix::sys::prctl::set_pdeathsig;
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, Pid, fork, getpid, getppid, setpgid};
    use std::{mem, ptr, thread};

    /// Raw `futex(2)` calls on the slot's word.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct LinuxFutex;

    impl FutexOps for LinuxFutex {
        fn wake(&self, word: &AtomicU32, waiters: i32) -> Result<usize, Errno> {
            // SAFETY: `word` is a live, aligned u32 for the duration of the call.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAKE,
                    waiters,
                    ptr::null::<libc::timespec>(),
                    ptr::null::<u32>(),
                    0,
                )
            };
            Errno::result(ret).map(|woken| woken as usize)
        }

        fn wait(&self, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitOutcome {
            // SAFETY: timespec is plain old data.
            let mut ts: libc::timespec = unsafe { mem::zeroed() };
            ts.tv_sec = timeout.as_secs() as libc::time_t;
            ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
            // SAFETY: `word` and `ts` outlive the call.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT,
                    expected,
                    &ts as *const libc::timespec,
                    ptr::null::<u32>(),
                    0,
                )
            };
            match Errno::result(ret) {
                Ok(_) => WaitOutcome::Woken,
                Err(Errno::ETIMEDOUT) => WaitOutcome::TimedOut,
                Err(err) => WaitOutcome::Failed(err),
            }
        }
    }

    /// Kill-and-reap ownership of the forked waiter process.
    ///
    /// `shutdown` is idempotent and also runs on drop, so fatal paths in the
    /// waker still clean the waiter up.
    #[derive(Debug)]
    pub struct WaiterGuard {
        pid: Option<Pid>,
    }

    impl WaiterGuard {
        pub fn new(pid: Pid) -> Self {
            Self { pid: Some(pid) }
        }

        pub fn pid(&self) -> Option<Pid> {
            self.pid
        }

        /// SIGKILL the waiter and block until it is reaped.
        ///
        /// Returns the wait status the first time, `None` once already reaped.
        pub fn shutdown(&mut self) -> nix::Result<Option<WaitStatus>> {
            let Some(pid) = self.pid.take() else {
                return Ok(None);
            };
            // ESRCH just means it already exited; the reap below still applies.
            let _ = kill(pid, Signal::SIGKILL);
            loop {
                match waitpid(pid, None) {
                    Ok(status) => return Ok(Some(status)),
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => return Ok(None),
                    Err(err) => return Err(err),
                }
            }
        }
    }

    impl Drop for WaiterGuard {
        fn drop(&mut self) {
            let _ = self.shutdown();
        }
    }

    /// The futex stressor, generic over its kernel seam for tests.
    #[derive(Debug, Default)]
    pub struct FutexStressor<F = LinuxFutex> {
        ops: F,
        backoff: Backoff,
    }

    impl<F: FutexOps> FutexStressor<F> {
        pub fn new(ops: F, backoff: Backoff) -> Self {
            Self { ops, backoff }
        }

        fn wait_role(&self, args: &StressArgs<'_>, reporter: &Reporter<'_>, parent: Pid) {
            if let Some(pgrp) = args.pgrp {
                let _ = setpgid(Pid::from_raw(0), pgrp);
            }
            // The waker may already be gone by the time the guard is armed.
            if set_pdeathsig(Signal::SIGKILL).is_err() || getppid() != parent {
                return;
            }
            waiter_loop(&self.ops, args, reporter, &self.backoff, thread::sleep);
        }

        fn wake_role(
            &self,
            args: &StressArgs<'_>,
            reporter: &Reporter<'_>,
            child: Pid,
        ) -> ExitStatus {
            let mut waiter = WaiterGuard::new(child);
            if let Some(pgrp) = args.pgrp {
                let _ = setpgid(Pid::from_raw(0), pgrp);
                let _ = setpgid(child, pgrp);
            }

            waker_loop(&self.ops, args, reporter);

            if let Err(err) = waiter.shutdown() {
                reporter.warn_call("waitpid", err);
            }
            reporter.debug(&format!(
                "futex timeouts: {}, unverified futex errors: {}",
                args.slot.futex_timeouts(),
                args.slot.soft_errors()
            ));

            if args.slot.failures() > 0 {
                ExitStatus::Failure
            } else {
                ExitStatus::Success
            }
        }
    }

    impl<F: FutexOps> Stressor for FutexStressor<F> {
        fn name(&self) -> &'static str {
            "futex"
        }

        fn run(&self, args: &StressArgs<'_>) -> ExitStatus {
            let reporter = args.reporter();
            let parent = getpid();

            let forked = loop {
                // SAFETY: the child branch only runs the wait loop over atomics
                // in the shared slot and leaves through `_exit`.
                match unsafe { fork() } {
                    Ok(result) => break result,
                    Err(Errno::EAGAIN) if args.run.is_running() => continue,
                    Err(Errno::EAGAIN) => return ExitStatus::Success,
                    Err(err) => {
                        reporter.fail_call("fork", err);
                        return ExitStatus::Failure;
                    }
                }
            };

            match forked {
                ForkResult::Child => {
                    self.wait_role(args, &reporter, parent);
                    // SAFETY: terminate the waiter without running the
                    // parent's atexit handlers or unwinding into its stack.
                    unsafe { libc::_exit(0) }
                }
                ForkResult::Parent { child } => self.wake_role(args, &reporter, child),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RunFlag;
    use crate::shared::InstanceSlot;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Scripted futex: pops wait outcomes, defaults to timing out.
    #[derive(Default)]
    struct ScriptedFutex {
        waits: RefCell<VecDeque<WaitOutcome>>,
        wake_result: Cell<Option<Errno>>,
        wakes: Cell<u64>,
    }

    impl FutexOps for ScriptedFutex {
        fn wake(&self, _word: &AtomicU32, _waiters: i32) -> Result<usize, Errno> {
            self.wakes.set(self.wakes.get() + 1);
            match self.wake_result.get() {
                Some(err) => Err(err),
                None => Ok(0),
            }
        }

        fn wait(&self, _word: &AtomicU32, expected: u32, _timeout: Duration) -> WaitOutcome {
            assert_eq!(expected, 0);
            self.waits
                .borrow_mut()
                .pop_front()
                .unwrap_or(WaitOutcome::TimedOut)
        }
    }

    fn args<'a>(flag: &'a AtomicBool, slot: &'a InstanceSlot, max_ops: u64) -> StressArgs<'a> {
        StressArgs {
            instance: 0,
            max_ops,
            name: "futex-test",
            run: RunFlag::new(flag),
            verify: true,
            pgrp: None,
            slot,
        }
    }

    #[test]
    fn idle_waiter_backs_off_past_threshold() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let args = args(&flag, &slot, 0);
        let reporter = Reporter::new("futex-test");
        let ops = ScriptedFutex::default();
        let backoff = Backoff {
            wait_timeout: Duration::from_micros(1),
            step: 3,
            sleep: Duration::from_millis(250),
        };

        let mut sleeps = Vec::new();
        waiter_loop(&ops, &args, &reporter, &backoff, |d| {
            sleeps.push((d, slot.futex_timeouts()));
            if sleeps.len() == 2 {
                args.run.stop();
            }
        });

        // threshold 3 -> sleep at 4, threshold 6 -> sleep at 7.
        assert_eq!(
            sleeps,
            vec![(Duration::from_millis(250), 4), (Duration::from_millis(250), 7)]
        );
        assert_eq!(slot.futex_timeouts(), 7);
        assert_eq!(args.ops(), 0);
        assert_eq!(reporter.failures(), 0);
    }

    #[test]
    fn waiter_counts_wakes_up_to_bound() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let args = args(&flag, &slot, 3);
        let reporter = Reporter::new("futex-test");
        let ops = ScriptedFutex::default();
        ops.waits.borrow_mut().extend([
            WaitOutcome::TimedOut,
            WaitOutcome::Woken,
            WaitOutcome::Woken,
            WaitOutcome::TimedOut,
            WaitOutcome::Woken,
            WaitOutcome::Woken,
        ]);

        waiter_loop(&ops, &args, &reporter, &Backoff::default(), |_| {
            panic!("no backoff expected")
        });

        assert_eq!(args.ops(), 3);
        assert_eq!(slot.futex_timeouts(), 2);
        // The final scripted wake is never consumed.
        assert_eq!(ops.waits.borrow().len(), 1);
    }

    #[test]
    fn verified_wait_errors_are_reported_not_counted() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let args = args(&flag, &slot, 1);
        let reporter = args.reporter();
        let ops = ScriptedFutex::default();
        ops.waits
            .borrow_mut()
            .extend([WaitOutcome::Failed(Errno::EFAULT), WaitOutcome::Woken]);

        waiter_loop(&ops, &args, &reporter, &Backoff::default(), |_| {});

        assert_eq!(args.ops(), 1);
        assert_eq!(reporter.failures(), 1);
        assert_eq!(slot.failures(), 1);
    }

    #[test]
    fn unverified_wait_errors_count_as_wakes() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let mut args = args(&flag, &slot, 2);
        args.verify = false;
        let reporter = args.reporter();
        let ops = ScriptedFutex::default();
        ops.waits
            .borrow_mut()
            .extend([WaitOutcome::Failed(Errno::EINTR), WaitOutcome::Woken]);

        waiter_loop(&ops, &args, &reporter, &Backoff::default(), |_| {});

        assert_eq!(args.ops(), 2);
        assert_eq!(slot.failures(), 0);
        assert_eq!(slot.soft_errors(), 1);
    }

    #[test]
    fn waker_reports_failures_only_when_verifying() {
        let flag = AtomicBool::new(true);
        let slot = InstanceSlot::default();
        let mut args = args(&flag, &slot, 0);
        let ops = ScriptedFutex::default();
        ops.wake_result.set(Some(Errno::EINVAL));

        // The waker never bumps the counter itself; stop it from inside wake.
        struct StopAfter<'a> {
            inner: &'a ScriptedFutex,
            flag: &'a AtomicBool,
            limit: u64,
        }
        impl FutexOps for StopAfter<'_> {
            fn wake(&self, word: &AtomicU32, waiters: i32) -> Result<usize, Errno> {
                let result = self.inner.wake(word, waiters);
                if self.inner.wakes.get() >= self.limit {
                    self.flag.store(false, Ordering::Release);
                }
                result
            }
            fn wait(&self, word: &AtomicU32, expected: u32, timeout: Duration) -> WaitOutcome {
                self.inner.wait(word, expected, timeout)
            }
        }

        let stopper = StopAfter {
            inner: &ops,
            flag: &flag,
            limit: 4,
        };
        let reporter = Reporter::new("futex-test");
        waker_loop(&stopper, &args, &reporter);
        assert_eq!(ops.wakes.get(), 4);
        assert_eq!(reporter.failures(), 4);
        assert_eq!(slot.soft_errors(), 0);

        flag.store(true, Ordering::Release);
        args.verify = false;
        let quiet = Reporter::new("futex-test");
        let stopper = StopAfter {
            inner: &ops,
            flag: &flag,
            limit: 8,
        };
        waker_loop(&stopper, &args, &quiet);
        assert_eq!(ops.wakes.get(), 8);
        assert_eq!(quiet.failures(), 0);
        assert_eq!(slot.soft_errors(), 4);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_wait_times_out_or_rejects_stale_value() {
        let word = AtomicU32::new(0);
        let futex = LinuxFutex;
        assert_eq!(
            futex.wait(&word, 0, Duration::from_micros(5)),
            WaitOutcome::TimedOut
        );
        assert_eq!(
            futex.wait(&word, 1, Duration::from_micros(5)),
            WaitOutcome::Failed(Errno::EAGAIN)
        );
        assert_eq!(futex.wake(&word, 1), Ok(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn waiter_guard_shutdown_is_idempotent() {
        use nix::sys::signal::{Signal, kill};
        use nix::sys::wait::WaitStatus;
        use nix::unistd::{ForkResult, fork};

        // SAFETY: the child only sleeps until it is killed.
        let child = match unsafe { fork() }.expect("fork") {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => child,
        };

        let mut guard = WaiterGuard::new(child);
        assert_eq!(guard.pid(), Some(child));
        let first = guard.shutdown().expect("first shutdown");
        assert_eq!(first, Some(WaitStatus::Signaled(child, Signal::SIGKILL, false)));
        assert_eq!(guard.shutdown().expect("second shutdown"), None);
        assert_eq!(guard.pid(), None);
        assert_eq!(kill(child, None), Err(Errno::ESRCH));
    }
}
