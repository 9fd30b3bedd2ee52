//! stress-run: fork the configured stressors and report one record each.
//!
//! Configuration comes from the environment (see `--help`). Logs go to
//! stderr through `tracing` (`RUST_LOG`, default `info`); stdout carries only
//! NDJSON run records, one per stressor instance.
//!
//! Exit codes:
//! - 0: every instance succeeded, was unsupported, or had nothing to do
//! - 1: invalid configuration or driver error
//! - 2: at least one instance failed
//! - 3: no failures, but at least one instance lacked resources

use anyhow::{Context, Result, bail};
use kstress::config::{
    ENV_INSTANCES, ENV_MAX_OPS, ENV_MINCORE, ENV_NUMA_ROOT, ENV_STRESSORS, ENV_TIMEOUT_SECS,
    ENV_VERIFY,
};
use kstress::{RunConfig, driver, known_stressors, write_records};
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "stress-run".to_string());

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {}
        Some("-h" | "--help") => {
            print_usage(&program, io::stdout());
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("stress-run: unexpected argument: {other}");
            eprintln!();
            print_usage(&program, io::stderr());
            return ExitCode::from(1);
        }
    }

    init_tracing();

    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("stress-run: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let config = RunConfig::from_env()?;
    if config.stressors.is_empty() {
        bail!("no stressors selected");
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Release))
        .context("failed to install Ctrl-C handler")?;

    tracing::info!(
        stressors = %config.stressors.join(" "),
        instances = config.instances,
        timeout_secs = config.timeout.as_secs(),
        "dispatching hogs"
    );
    let records = driver::run(&config, &interrupt)?;

    for record in &records {
        tracing::info!(
            stressor = %record.stressor,
            instance = record.instance,
            status = record.status.as_str(),
            ops = record.ops,
            "instance finished"
        );
    }

    write_records(io::stdout().lock(), &records).context("failed to write run records")?;
    Ok(driver::exit_code(&records))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn print_usage(program: &str, mut out: impl Write) {
    let _ = writeln!(
        out,
        "Usage: {program} [--help]\n\n\
         Environment:\n  \
         {ENV_STRESSORS}     stressors to run, comma or space separated (known: {known}; default: all)\n  \
         {ENV_INSTANCES}     instances per stressor (default: 1)\n  \
         {ENV_MAX_OPS}       op bound per instance, 0 for none (default: 0)\n  \
         {ENV_TIMEOUT_SECS}  run duration in seconds (default: 10)\n  \
         {ENV_VERIFY}        verify syscall results, 1 to enable\n  \
         {ENV_MINCORE}       fault in non-resident buffer pages, 1 to enable\n  \
         {ENV_NUMA_ROOT}     NUMA topology directory (default: /sys/devices/system/node)",
        known = known_stressors().join(", "),
    );
}
