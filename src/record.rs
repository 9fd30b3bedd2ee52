//! Per-instance run records.
//!
//! The driver prints one record per stressor instance as NDJSON on stdout once
//! every worker has been reaped. Records carry final counters only; no timing
//! or throughput is derived here.

use crate::protocol::ExitStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub stressor: String,
    pub instance: u32,
    /// Worker pid; `None` when the instance never started.
    #[serde(default)]
    pub pid: Option<i32>,
    pub status: ExitStatus,
    pub ops: u64,
    /// Futex wait timeouts left in the instance slot (0 for other stressors).
    #[serde(default)]
    pub futex_timeouts: u64,
    #[serde(default)]
    pub failures: u64,
}

/// Errors that can occur while reading NDJSON record streams.
#[derive(Debug)]
pub enum RecordReadError {
    Io(std::io::Error),
    Parse {
        line: usize,
        error: serde_json::Error,
    },
}

impl fmt::Display for RecordReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordReadError::Io(err) => write!(f, "failed to read NDJSON stream: {err}"),
            RecordReadError::Parse { line, error } => {
                write!(f, "line {line}: unable to parse run record ({error})")
            }
        }
    }
}

impl std::error::Error for RecordReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordReadError::Io(err) => Some(err),
            RecordReadError::Parse { error, .. } => Some(error),
        }
    }
}

/// Write records as NDJSON, one object per line.
pub fn write_records<W: Write>(mut out: W, records: &[RunRecord]) -> std::io::Result<()> {
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Read run records from an NDJSON stream.
///
/// Whitespace-only lines are skipped; parse errors carry the 1-based line.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<RunRecord>, RecordReadError> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(RecordReadError::Io)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str::<RunRecord>(trimmed).map_err(|error| {
            RecordReadError::Parse {
                line: idx + 1,
                error,
            }
        })?;
        records.push(record);
    }
    Ok(records)
}
