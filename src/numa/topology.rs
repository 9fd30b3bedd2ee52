//! NUMA topology discovery.
//!
//! Nodes come from the per-node entries the kernel exposes under
//! `/sys/devices/system/node` (`node0`, `node1`, ...). The ids are kept as an
//! ordered ring with an explicit rotation index instead of a linked cycle.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRing {
    nodes: Vec<u32>,
    current: usize,
}

impl NodeRing {
    /// Build a ring from arbitrary ids; duplicates collapse, order is ascending.
    pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut nodes: Vec<u32> = ids.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        Self { nodes, current: 0 }
    }

    /// Enumerate `node<digits>` entries under `root`.
    ///
    /// A missing directory is a host without NUMA topology and yields an
    /// empty ring; any other read failure is an error.
    pub fn discover(root: &Path) -> Result<Self> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::from_ids([])),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading NUMA topology at {}", root.display()));
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("reading NUMA topology at {}", root.display()))?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_node_entry) {
                ids.push(id);
            }
        }
        Ok(Self::from_ids(ids))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether there is anything to migrate between.
    pub fn is_stressable(&self) -> bool {
        self.nodes.len() >= 2
    }

    pub fn ids(&self) -> &[u32] {
        &self.nodes
    }

    pub fn position(&self) -> usize {
        self.current
    }

    /// Node the next placement targets. Panics on an empty ring.
    pub fn current(&self) -> u32 {
        self.nodes[self.current]
    }

    pub fn advance(&mut self) {
        if !self.nodes.is_empty() {
            self.current = (self.current + 1) % self.nodes.len();
        }
    }

    /// Node `offset` steps past the current one, wrapping around.
    pub fn at_offset(&self, offset: usize) -> u32 {
        self.nodes[(self.current + offset) % self.nodes.len()]
    }

    pub fn max_id(&self) -> Option<u32> {
        self.nodes.last().copied()
    }
}

/// Parse `node<digits>` into the node id.
pub fn parse_node_entry(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("node")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
