//! NUMA migration stressor.
//!
//! Discovers the node topology once, maps a demand-paged working buffer, then
//! cycles it through every page-placement mechanism the kernel offers:
//! preferred policy, strict and default `mbind`, whole-process
//! `migrate_pages`, and batched per-page `move_pages` spread over all nodes.
//! Each mechanism is followed by a fill so the kernel has to materialise the
//! pages under the new placement.
//!
//! A host with fewer than two nodes has nothing to migrate between; that is a
//! successful no-op rather than a failure.

pub mod mask;
pub mod syscalls;
pub mod topology;

pub use mask::NodeMask;
pub use syscalls::{BindMode, NumaOps};
pub use topology::{NodeRing, SYSFS_NODE_ROOT};

#[cfg(target_os = "linux")]
pub use syscalls::LinuxNuma;

use crate::diagnostics::{Reporter, Severity};
use crate::protocol::{ExitStatus, StressArgs, Stressor};
use crate::residency;
use memmap2::MmapMut;
use nix::errno::Errno;
use std::ffi::c_void;
use std::io;
use std::path::PathBuf;

pub const BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const MOVE_ROUNDS: usize = 16;

pub const FILL_PREFERRED: u8 = 0xff;
pub const FILL_STRICT_BIND: u8 = 0xaa;
pub const FILL_DEFAULT_BIND: u8 = 0x5c;

pub struct NumaStressor<O> {
    ops: O,
    topology_root: PathBuf,
    buffer_size: usize,
    touch_pages: bool,
}

impl<O: NumaOps> NumaStressor<O> {
    pub fn new(ops: O, topology_root: impl Into<PathBuf>) -> Self {
        Self {
            ops,
            topology_root: topology_root.into(),
            buffer_size: BUFFER_SIZE,
            touch_pages: false,
        }
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Fault in non-resident pages after every move round.
    pub fn with_page_touch(mut self, enabled: bool) -> Self {
        self.touch_pages = enabled;
        self
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }
}

impl<O: NumaOps> Stressor for NumaStressor<O> {
    fn name(&self) -> &'static str {
        "numa"
    }

    fn run(&self, args: &StressArgs<'_>) -> ExitStatus {
        let reporter = args.reporter();

        let ring = match NodeRing::discover(&self.topology_root) {
            Ok(ring) => ring,
            Err(err) => {
                reporter.report(Severity::Fail, &format!("{err:#}"));
                return ExitStatus::Failure;
            }
        };
        if !ring.is_stressable() {
            reporter.info("multiple NUMA nodes not found, skipping stressor");
            return ExitStatus::Success;
        }

        let mut migrator = match Migrator::new(&self.ops, ring, self.buffer_size, self.touch_pages)
        {
            Ok(migrator) => migrator,
            Err(err) => {
                reporter.report(
                    Severity::Fail,
                    &format!("mmap of {} byte buffer failed: {err}", self.buffer_size),
                );
                return match err.raw_os_error() {
                    Some(libc::ENOMEM) => ExitStatus::NoResource,
                    _ => ExitStatus::Failure,
                };
            }
        };

        while args.keep_going() {
            match migrator.iterate(args, &reporter) {
                Ok(()) => args.bump(),
                Err(Halt::Stopped) => break,
                Err(Halt::Fatal) => return ExitStatus::Failure,
            }
        }
        ExitStatus::Success
    }
}

/// Why an iteration ended before its last step.
#[derive(Debug, PartialEq, Eq)]
enum Halt {
    Stopped,
    Fatal,
}

/// Working buffer plus the per-page move tables, allocated once per run.
struct Migrator<'o, O> {
    ops: &'o O,
    ring: NodeRing,
    max_node: u32,
    buffer: MmapMut,
    pages: Vec<*mut c_void>,
    dest: Vec<i32>,
    status: Vec<i32>,
    policy: NodeMask,
    touch_pages: bool,
}

impl<'o, O: NumaOps> Migrator<'o, O> {
    fn new(ops: &'o O, ring: NodeRing, buffer_size: usize, touch_pages: bool) -> io::Result<Self> {
        let max_node = ring.max_id().unwrap_or(0);
        let page_size = residency::page_size();
        let mut buffer = MmapMut::map_anon(buffer_size)?;

        let num_pages = buffer_size / page_size;
        let base = buffer.as_mut_ptr();
        // SAFETY: every offset is below num_pages * page_size <= buffer_size.
        let pages = (0..num_pages)
            .map(|idx| unsafe { base.add(idx * page_size) }.cast::<c_void>())
            .collect();

        Ok(Self {
            ops,
            ring,
            max_node,
            buffer,
            pages,
            dest: vec![0; num_pages],
            status: vec![0; num_pages],
            policy: NodeMask::for_max_node(max_node),
            touch_pages,
        })
    }

    fn fill(&mut self, byte: u8) {
        self.buffer.fill(byte);
    }

    fn still_running(args: &StressArgs<'_>) -> Result<(), Halt> {
        if args.run.is_running() {
            Ok(())
        } else {
            Err(Halt::Stopped)
        }
    }

    /// Fatal under verification, logged and skipped otherwise.
    fn checked<T>(
        args: &StressArgs<'_>,
        reporter: &Reporter<'_>,
        call: &str,
        result: Result<T, Errno>,
    ) -> Result<Option<T>, Halt> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if args.verify => {
                reporter.fail_call(call, err);
                Err(Halt::Fatal)
            }
            Err(err) => {
                reporter.warn_call(call, err);
                Ok(None)
            }
        }
    }

    /// Bind the buffer to the current node; true when the bind took effect.
    ///
    /// `EIO` means existing pages could not be moved and is never a failure.
    fn bind(
        &self,
        args: &StressArgs<'_>,
        reporter: &Reporter<'_>,
        mode: BindMode,
    ) -> Result<bool, Halt> {
        let mask = NodeMask::single(self.max_node, self.ring.current());
        match self.ops.bind(&self.buffer, &mask, mode) {
            Err(Errno::EIO) => {
                reporter.debug(&format!("mbind ({mode:?}) could not move pages, skipping"));
                Ok(false)
            }
            result => Ok(Self::checked(args, reporter, "mbind", result)?.is_some()),
        }
    }

    fn iterate(&mut self, args: &StressArgs<'_>, reporter: &Reporter<'_>) -> Result<(), Halt> {
        self.policy.clear();
        let policy = self.ops.get_mempolicy(&mut self.policy, &self.buffer);
        Self::checked(args, reporter, "get_mempolicy", policy)?;
        Self::still_running(args)?;

        let preferred = NodeMask::single(self.max_node, self.ring.current());
        Self::checked(
            args,
            reporter,
            "set_mempolicy",
            self.ops.set_preferred(&preferred),
        )?;
        self.fill(FILL_PREFERRED);
        Self::still_running(args)?;

        // Placement sample is pure syscall pressure; the answer is unused.
        let _ = self.ops.getcpu();

        if self.bind(args, reporter, BindMode::Strict)? {
            self.fill(FILL_STRICT_BIND);
        }
        Self::still_running(args)?;

        if self.bind(args, reporter, BindMode::Default)? {
            self.fill(FILL_DEFAULT_BIND);
        }
        Self::still_running(args)?;

        self.ring.advance();

        let any = NodeMask::all(self.max_node);
        let target = NodeMask::single(self.max_node, self.ring.current());
        Self::checked(
            args,
            reporter,
            "migrate_pages",
            self.ops.migrate_all(&any, &target),
        )?;
        Self::still_running(args)?;

        // The destination walk carries on across rounds instead of restarting.
        let mut offset = 0usize;
        for round in 0..MOVE_ROUNDS {
            for dest in self.dest.iter_mut() {
                *dest = self.ring.at_offset(offset) as i32;
                offset += 1;
            }
            self.status.fill(0);
            let moved = self
                .ops
                .move_pages(&self.pages, &self.dest, &mut self.status);
            Self::checked(args, reporter, "move_pages", moved)?;

            self.fill(round as u8);
            if self.touch_pages {
                if let Err(err) = residency::touch_nonresident(&mut self.buffer) {
                    reporter.debug(&format!("mincore page touch failed: {err}"));
                }
            }
            if !args.run.is_running() {
                break;
            }
        }
        Ok(())
    }
}
