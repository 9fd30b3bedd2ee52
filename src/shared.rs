//! Process-shared state segment.
//!
//! The driver maps one anonymous `MAP_SHARED` region before forking so every
//! worker (and the futex waiter each futex worker forks in turn) sees the same
//! run flag and per-instance slots. Everything inside is an atomic, so the
//! zero-filled pages handed out by the kernel are a valid initial state.

use crate::protocol::RunFlag;
use anyhow::{Result, bail};
use std::io;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Per-instance record; one instance's process pair owns it exclusively.
#[repr(C)]
#[derive(Debug, Default)]
pub struct InstanceSlot {
    pub ops: AtomicU64,
    pub futex_word: AtomicU32,
    pub futex_timeouts: AtomicU64,
    pub failures: AtomicU64,
    /// Kernel-call errors looped past with verification off.
    pub soft_errors: AtomicU64,
}

impl InstanceSlot {
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Acquire)
    }

    pub fn futex_timeouts(&self) -> u64 {
        self.futex_timeouts.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn soft_errors(&self) -> u64 {
        self.soft_errors.load(Ordering::Acquire)
    }
}

#[repr(C)]
struct Header {
    run: AtomicBool,
}

/// Owner of the shared mapping. Instances borrow slots by index.
pub struct SharedSegment {
    base: NonNull<u8>,
    len: usize,
    slots: usize,
}

// SAFETY: the mapping is only ever accessed through atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Map a segment with `slots` zeroed instance slots and the run flag raised.
    pub fn new(slots: usize) -> Result<Self> {
        if slots == 0 {
            bail!("shared segment needs at least one instance slot");
        }
        let len = slots
            .checked_mul(mem::size_of::<InstanceSlot>())
            .and_then(|bytes| bytes.checked_add(Self::slots_offset()))
            .ok_or_else(|| anyhow::anyhow!("{slots} instance slots do not fit in memory"))?;

        // SAFETY: fresh anonymous mapping, no existing memory is aliased.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            bail!("failed to map {len} byte shared segment: {err}");
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| anyhow::anyhow!("mmap returned a null shared segment"))?;

        let segment = Self { base, len, slots };
        segment.header().run.store(true, Ordering::Release);
        Ok(segment)
    }

    fn slots_offset() -> usize {
        let align = mem::align_of::<InstanceSlot>();
        mem::size_of::<Header>().div_ceil(align) * align
    }

    fn header(&self) -> &Header {
        // SAFETY: offset 0 is inside the mapping and suitably aligned (page).
        unsafe { &*self.base.as_ptr().cast::<Header>() }
    }

    pub fn run_flag(&self) -> RunFlag<'_> {
        RunFlag::new(&self.header().run)
    }

    pub fn len(&self) -> usize {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// Borrow the slot for `index`, or `None` when out of range.
    pub fn slot(&self, index: usize) -> Option<&InstanceSlot> {
        if index >= self.slots {
            return None;
        }
        // SAFETY: index is bounds-checked and slots are laid out contiguously
        // after the header at InstanceSlot alignment.
        unsafe {
            let first = self
                .base
                .as_ptr()
                .add(Self::slots_offset())
                .cast::<InstanceSlot>();
            Some(&*first.add(index))
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = &InstanceSlot> {
        (0..self.slots).filter_map(move |idx| self.slot(idx))
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
