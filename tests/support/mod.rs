#![allow(dead_code)]

use kstress::protocol::{RunFlag, StressArgs};
use kstress::shared::{InstanceSlot, SharedSegment};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tempfile::TempDir;

/// Serializes tests that fork workers so reaping stays easy to reason about.
pub fn fork_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

/// A sysfs-shaped node directory holding `nodeN` entries plus some noise.
pub fn fake_topology(ids: &[u32]) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for id in ids {
        fs::create_dir(dir.path().join(format!("node{id}"))).expect("node dir");
    }
    fs::create_dir(dir.path().join("power")).expect("noise dir");
    fs::write(dir.path().join("possible"), "0-1\n").expect("noise file");
    dir
}

pub fn stress_args<'a>(
    segment: &'a SharedSegment,
    index: usize,
    name: &'a str,
    max_ops: u64,
    verify: bool,
) -> StressArgs<'a> {
    let slot: &InstanceSlot = segment.slot(index).expect("slot in range");
    let run: RunFlag<'a> = segment.run_flag();
    StressArgs {
        instance: index as u32,
        max_ops,
        name,
        run,
        verify,
        pgrp: None,
        slot,
    }
}

pub fn stress_run_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stress-run"))
}

/// `stress-run` with a clean stressor environment and quiet logging.
pub fn stress_run_command() -> Command {
    let mut cmd = Command::new(stress_run_binary());
    for key in [
        "STRESS_STRESSORS",
        "STRESS_INSTANCES",
        "STRESS_MAX_OPS",
        "STRESS_TIMEOUT_SECS",
        "STRESS_VERIFY",
        "STRESS_MINCORE",
        "STRESS_NUMA_ROOT",
    ] {
        cmd.env_remove(key);
    }
    cmd.env("RUST_LOG", "warn");
    cmd
}
