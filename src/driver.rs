//! Worker driver: fork, supervise, reap, aggregate.
//!
//! One process per (stressor, instance) pair, all sharing a single
//! [`SharedSegment`]. The driver owns the run flag inside the segment and
//! lowers it at the timeout or on an external interrupt; workers that are
//! still around a grace period later get SIGKILL. Every worker is reaped
//! before records are built, so the counters read back are final.

use crate::config::RunConfig;
use crate::protocol::{ExitStatus, StressArgs, Stressor};
use crate::record::RunRecord;
use crate::shared::{InstanceSlot, SharedSegment};
use crate::stressor_for;
use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpgrp, setpgid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const FORK_RETRY_PAUSE: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Worker {
    stressor: String,
    instance: u32,
    slot: usize,
    pid: Option<Pid>,
    status: Option<ExitStatus>,
}

/// Run every configured stressor instance to completion.
///
/// `interrupt` is polled while supervising; raising it (e.g. from a Ctrl-C
/// handler) stops the run early without losing the records.
pub fn run(config: &RunConfig, interrupt: &AtomicBool) -> Result<Vec<RunRecord>> {
    let plan = config
        .stressors
        .iter()
        .map(|name| {
            stressor_for(name, config)
                .map(|stressor| (name.clone(), stressor))
                .ok_or_else(|| anyhow!("Unknown stressor requested: {name}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let segment = SharedSegment::new(config.total_instances())
        .context("failed to allocate shared state segment")?;
    let pgrp = getpgrp();
    let started = Instant::now();

    let mut workers = Vec::with_capacity(config.total_instances());
    'spawn: for (name, stressor) in &plan {
        for instance in 0..config.instances {
            let slot = workers.len();
            match spawn_worker(stressor.as_ref(), name, instance, slot, &segment, config, pgrp) {
                Ok(Some(pid)) => {
                    tracing::debug!(stressor = %name, instance, pid = pid.as_raw(), "started");
                    workers.push(Worker {
                        stressor: name.clone(),
                        instance,
                        slot,
                        pid: Some(pid),
                        status: None,
                    });
                }
                Ok(None) => break 'spawn,
                Err(err) => {
                    tracing::error!("{err:#}");
                    segment.run_flag().stop();
                    break 'spawn;
                }
            }
        }
    }
    tracing::debug!("{} stressor instances spawned", workers.len());

    supervise(&mut workers, &segment, config.timeout, started, interrupt);

    Ok(workers
        .iter()
        .map(|worker| build_record(worker, segment.slot(worker.slot)))
        .collect())
}

/// Overall process exit code for a finished run.
pub fn exit_code(records: &[RunRecord]) -> u8 {
    if records.iter().any(|r| r.status == ExitStatus::Failure) {
        2
    } else if records.iter().any(|r| r.status == ExitStatus::NoResource) {
        3
    } else {
        0
    }
}

/// Fork one worker; `Ok(None)` when the run was stopped before it started.
fn spawn_worker(
    stressor: &dyn Stressor,
    name: &str,
    instance: u32,
    slot: usize,
    segment: &SharedSegment,
    config: &RunConfig,
    pgrp: Pid,
) -> Result<Option<Pid>> {
    let run = segment.run_flag();
    loop {
        if !run.is_running() {
            return Ok(None);
        }
        // SAFETY: the child runs the stressor and leaves through `_exit`
        // without returning into the caller's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let _ = setpgid(child, pgrp);
                return Ok(Some(child));
            }
            Ok(ForkResult::Child) => {
                let code = worker_main(stressor, name, instance, slot, segment, config, pgrp);
                // SAFETY: terminate the worker without running the driver's
                // atexit handlers.
                unsafe { libc::_exit(code) }
            }
            Err(Errno::EAGAIN) => thread::sleep(FORK_RETRY_PAUSE),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot fork {name} instance {instance}"));
            }
        }
    }
}

fn worker_main(
    stressor: &dyn Stressor,
    name: &str,
    instance: u32,
    slot: usize,
    segment: &SharedSegment,
    config: &RunConfig,
    pgrp: Pid,
) -> i32 {
    let _ = setpgid(Pid::from_raw(0), pgrp);
    #[cfg(target_os = "linux")]
    let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);

    let Some(slot) = segment.slot(slot) else {
        return ExitStatus::Failure.code();
    };
    let label = format!("kstress-{name}");
    let args = StressArgs {
        instance,
        max_ops: config.max_ops,
        name: &label,
        run: segment.run_flag(),
        verify: config.verify,
        pgrp: Some(pgrp),
        slot,
    };

    if !args.run.is_running() {
        return ExitStatus::Success.code();
    }
    let status = stressor.run(&args);
    tracing::debug!(stressor = %label, instance, status = status.as_str(), "exited");
    status.code()
}

fn supervise(
    workers: &mut [Worker],
    segment: &SharedSegment,
    timeout: Duration,
    started: Instant,
    interrupt: &AtomicBool,
) {
    let run = segment.run_flag();
    let mut stopped_at: Option<Instant> = None;
    let mut killed = false;

    loop {
        let mut pending = 0usize;
        for worker in workers.iter_mut().filter(|w| w.status.is_none()) {
            let Some(pid) = worker.pid else { continue };
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => match status_from_wait(status) {
                    Some(exit) => {
                        tracing::debug!(pid = pid.as_raw(), status = exit.as_str(), "reaped");
                        worker.status = Some(exit);
                    }
                    None => pending += 1,
                },
                Err(Errno::EINTR) => pending += 1,
                Err(err) => {
                    tracing::warn!(pid = pid.as_raw(), "waitpid failed: {err}");
                    worker.status = Some(ExitStatus::Failure);
                }
            }
        }
        if pending == 0 {
            break;
        }

        if run.is_running() {
            if interrupt.load(Ordering::Acquire) {
                tracing::info!("interrupt received, stopping stressors");
                run.stop();
            } else if started.elapsed() >= timeout {
                tracing::debug!("timeout reached, stopping stressors");
                run.stop();
            }
        }
        if !run.is_running() {
            let at = *stopped_at.get_or_insert_with(Instant::now);
            if !killed && at.elapsed() >= KILL_GRACE {
                for worker in workers.iter().filter(|w| w.status.is_none()) {
                    if let Some(pid) = worker.pid {
                        tracing::warn!(pid = pid.as_raw(), "stressor ignored stop, killing");
                        let _ = kill(pid, Signal::SIGKILL);
                    }
                }
                killed = true;
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn status_from_wait(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::from_code(code)),
        WaitStatus::Signaled(_, signal, _) => {
            tracing::debug!("worker terminated on signal {signal}");
            Some(ExitStatus::Failure)
        }
        _ => None,
    }
}

fn build_record(worker: &Worker, slot: Option<&InstanceSlot>) -> RunRecord {
    RunRecord {
        stressor: worker.stressor.clone(),
        instance: worker.instance,
        pid: worker.pid.map(Pid::as_raw),
        status: worker.status.unwrap_or(ExitStatus::Failure),
        ops: slot.map_or(0, InstanceSlot::ops),
        futex_timeouts: slot.map_or(0, InstanceSlot::futex_timeouts),
        failures: slot.map_or(0, InstanceSlot::failures),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ExitStatus) -> RunRecord {
        RunRecord {
            stressor: "futex".into(),
            instance: 0,
            pid: None,
            status,
            ops: 0,
            futex_timeouts: 0,
            failures: 0,
        }
    }

    #[test]
    fn exit_code_prefers_failure_over_resource_shortfall() {
        assert_eq!(exit_code(&[]), 0);
        assert_eq!(
            exit_code(&[record(ExitStatus::Success), record(ExitStatus::NotImplemented)]),
            0
        );
        assert_eq!(exit_code(&[record(ExitStatus::NoResource)]), 3);
        assert_eq!(
            exit_code(&[record(ExitStatus::NoResource), record(ExitStatus::Failure)]),
            2
        );
    }

    #[test]
    fn wait_statuses_map_to_exit_statuses() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            status_from_wait(WaitStatus::Exited(pid, 0)),
            Some(ExitStatus::Success)
        );
        assert_eq!(
            status_from_wait(WaitStatus::Exited(pid, 4)),
            Some(ExitStatus::NotImplemented)
        );
        assert_eq!(
            status_from_wait(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(ExitStatus::Failure)
        );
        assert_eq!(status_from_wait(WaitStatus::StillAlive), None);
    }

    #[test]
    fn missing_slot_yields_zero_counters() {
        let worker = Worker {
            stressor: "numa".into(),
            instance: 2,
            slot: 9,
            pid: Some(Pid::from_raw(77)),
            status: None,
        };
        let rec = build_record(&worker, None);
        assert_eq!(rec.pid, Some(77));
        assert_eq!(rec.status, ExitStatus::Failure);
        assert_eq!(rec.ops, 0);
    }
}
