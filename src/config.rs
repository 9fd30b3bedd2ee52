//! Run configuration resolved from the environment.
//!
//! Mirrors how the harness helpers read `MODES`/`PROBES`: plain environment
//! variables, comma- or whitespace-separated lists, and "truthy" flags that
//! count as set when non-empty and not `0`. Resolution goes through a lookup
//! closure so tests never have to mutate the real process environment.

use crate::numa::SYSFS_NODE_ROOT;
use crate::{known_stressors, split_list};
use anyhow::{Context, Result, bail};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_STRESSORS: &str = "STRESS_STRESSORS";
pub const ENV_INSTANCES: &str = "STRESS_INSTANCES";
pub const ENV_MAX_OPS: &str = "STRESS_MAX_OPS";
pub const ENV_TIMEOUT_SECS: &str = "STRESS_TIMEOUT_SECS";
pub const ENV_VERIFY: &str = "STRESS_VERIFY";
pub const ENV_MINCORE: &str = "STRESS_MINCORE";
pub const ENV_NUMA_ROOT: &str = "STRESS_NUMA_ROOT";

const DEFAULT_STRESSORS: &[&str] = &["futex", "numa"];
const DEFAULT_INSTANCES: u32 = 1;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub stressors: Vec<String>,
    pub instances: u32,
    /// Per-instance op bound; 0 runs until the timeout.
    pub max_ops: u64,
    pub timeout: Duration,
    pub verify: bool,
    /// Fault in non-resident pages of working buffers (mincore).
    pub touch_pages: bool,
    pub numa_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stressors: DEFAULT_STRESSORS.iter().map(|s| s.to_string()).collect(),
            instances: DEFAULT_INSTANCES,
            max_ops: 0,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            verify: false,
            touch_pages: false,
            numa_root: PathBuf::from(SYSFS_NODE_ROOT),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RunConfig::default();

        if let Some(raw) = lookup(ENV_STRESSORS) {
            let names = split_list(&raw);
            if !names.is_empty() {
                config.stressors = names;
            }
        }
        let known = known_stressors();
        if let Some(bad) = config
            .stressors
            .iter()
            .find(|name| !known.contains(&name.as_str()))
        {
            bail!(
                "Unknown stressor requested: {bad} (known: {})",
                known.join(", ")
            );
        }

        if let Some(raw) = lookup(ENV_INSTANCES) {
            config.instances = parse_number(&raw, ENV_INSTANCES)?;
            if config.instances == 0 {
                bail!("{ENV_INSTANCES} must be greater than zero");
            }
        }
        if let Some(raw) = lookup(ENV_MAX_OPS) {
            config.max_ops = parse_number(&raw, ENV_MAX_OPS)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs: u64 = parse_number(&raw, ENV_TIMEOUT_SECS)?;
            if secs == 0 {
                bail!("{ENV_TIMEOUT_SECS} must be greater than zero");
            }
            config.timeout = Duration::from_secs(secs);
        }

        config.verify = lookup(ENV_VERIFY).is_some_and(|v| is_truthy(&v));
        config.touch_pages = lookup(ENV_MINCORE).is_some_and(|v| is_truthy(&v));

        if let Some(raw) = lookup(ENV_NUMA_ROOT) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                config.numa_root = PathBuf::from(trimmed);
            }
        }

        Ok(config)
    }

    /// Total worker processes the driver forks (futex adds one waiter each).
    pub fn total_instances(&self) -> usize {
        self.stressors.len() * self.instances as usize
    }
}

fn is_truthy(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && trimmed != "0"
}

fn parse_number<T>(raw: &str, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} expects a non-negative integer, got '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = RunConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.stressors, vec!["futex", "numa"]);
        assert_eq!(config.total_instances(), 2);
    }

    #[test]
    fn parses_every_key() {
        let config = RunConfig::from_lookup(lookup_from(&[
            (ENV_STRESSORS, "numa, futex"),
            (ENV_INSTANCES, "3"),
            (ENV_MAX_OPS, " 500 "),
            (ENV_TIMEOUT_SECS, "60"),
            (ENV_VERIFY, "1"),
            (ENV_MINCORE, "yes"),
            (ENV_NUMA_ROOT, "/tmp/fake-nodes"),
        ]))
        .unwrap();

        assert_eq!(config.stressors, vec!["numa", "futex"]);
        assert_eq!(config.instances, 3);
        assert_eq!(config.max_ops, 500);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.verify);
        assert!(config.touch_pages);
        assert_eq!(config.numa_root, PathBuf::from("/tmp/fake-nodes"));
        assert_eq!(config.total_instances(), 6);
    }

    #[test]
    fn zero_and_empty_flags_are_false() {
        let config =
            RunConfig::from_lookup(lookup_from(&[(ENV_VERIFY, "0"), (ENV_MINCORE, " ")])).unwrap();
        assert!(!config.verify);
        assert!(!config.touch_pages);
    }

    #[test]
    fn rejects_invalid_values() {
        for pairs in [
            vec![(ENV_STRESSORS, "futex cpu")],
            vec![(ENV_INSTANCES, "0")],
            vec![(ENV_INSTANCES, "two")],
            vec![(ENV_MAX_OPS, "-1")],
            vec![(ENV_TIMEOUT_SECS, "0")],
        ] {
            assert!(
                RunConfig::from_lookup(lookup_from(&pairs)).is_err(),
                "expected rejection for {pairs:?}"
            );
        }
    }
}
