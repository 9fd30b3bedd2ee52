//! Memory-policy and page-migration syscalls behind a trait seam.

use crate::numa::mask::NodeMask;
use nix::errno::Errno;
use std::ffi::c_void;

pub const MPOL_DEFAULT: i32 = 0;
pub const MPOL_PREFERRED: i32 = 1;
pub const MPOL_BIND: i32 = 2;

pub const MPOL_F_ADDR: u32 = 1 << 1;

pub const MPOL_MF_STRICT: u32 = 1 << 0;
pub const MPOL_MF_MOVE: i32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Enforcement requested from `mbind(MPOL_BIND)`.
pub enum BindMode {
    /// `MPOL_MF_STRICT`: fail with `EIO` when existing pages cannot comply.
    Strict,
    Default,
}

impl BindMode {
    pub fn flags(self) -> u32 {
        match self {
            BindMode::Strict => MPOL_MF_STRICT,
            BindMode::Default => MPOL_DEFAULT as u32,
        }
    }
}

/// The page-placement calls the NUMA stressor choreographs.
///
/// Every method acts on the calling process; errors are raw errno values so
/// callers can single out the codes they tolerate.
pub trait NumaOps {
    /// Policy governing `region`'s first page; the node set lands in `mask`.
    fn get_mempolicy(&self, mask: &mut NodeMask, region: &[u8]) -> Result<i32, Errno>;
    /// Process policy `MPOL_PREFERRED` over `mask`.
    fn set_preferred(&self, mask: &NodeMask) -> Result<(), Errno>;
    /// Current (cpu, node) of the calling thread.
    fn getcpu(&self) -> Result<(u32, u32), Errno>;
    fn bind(&self, region: &[u8], mask: &NodeMask, mode: BindMode) -> Result<(), Errno>;
    /// Move every page of the process from `from` to `to`.
    fn migrate_all(&self, from: &NodeMask, to: &NodeMask) -> Result<(), Errno>;
    /// Move `pages[i]` to `nodes[i]`; per-page results land in `status`.
    fn move_pages(
        &self,
        pages: &[*mut c_void],
        nodes: &[i32],
        status: &mut [i32],
    ) -> Result<(), Errno>;
}

#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxNuma;

#[cfg(target_os = "linux")]
impl NumaOps for LinuxNuma {
    fn get_mempolicy(&self, mask: &mut NodeMask, region: &[u8]) -> Result<i32, Errno> {
        let mut mode: libc::c_int = 0;
        let maxnode = mask.max_nodes();
        // SAFETY: `mode` and `mask` are writable for `maxnode` bits.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut mode as *mut libc::c_int,
                mask.as_mut_ptr(),
                maxnode,
                region.as_ptr(),
                MPOL_F_ADDR as libc::c_ulong,
            )
        };
        Errno::result(ret).map(|_| mode)
    }

    fn set_preferred(&self, mask: &NodeMask) -> Result<(), Errno> {
        // SAFETY: `mask` is readable for `max_nodes` bits.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                MPOL_PREFERRED,
                mask.as_ptr(),
                mask.max_nodes(),
            )
        };
        Errno::result(ret).map(drop)
    }

    fn getcpu(&self) -> Result<(u32, u32), Errno> {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        // SAFETY: both out-pointers are valid; the cache argument is unused.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<c_void>(),
            )
        };
        Errno::result(ret).map(|_| (cpu, node))
    }

    fn bind(&self, region: &[u8], mask: &NodeMask, mode: BindMode) -> Result<(), Errno> {
        // SAFETY: mbind only changes the policy of the mapped range.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                region.as_ptr(),
                region.len() as libc::c_ulong,
                MPOL_BIND,
                mask.as_ptr(),
                mask.max_nodes(),
                mode.flags(),
            )
        };
        Errno::result(ret).map(drop)
    }

    fn migrate_all(&self, from: &NodeMask, to: &NodeMask) -> Result<(), Errno> {
        // SAFETY: both masks are readable for the capacity passed.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_migrate_pages,
                0 as libc::pid_t,
                from.max_nodes().min(to.max_nodes()),
                from.as_ptr(),
                to.as_ptr(),
            )
        };
        Errno::result(ret).map(drop)
    }

    fn move_pages(
        &self,
        pages: &[*mut c_void],
        nodes: &[i32],
        status: &mut [i32],
    ) -> Result<(), Errno> {
        let count = pages.len().min(nodes.len()).min(status.len());
        // SAFETY: all three arrays hold at least `count` entries; the kernel
        // validates the page addresses themselves.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as libc::pid_t,
                count as libc::c_ulong,
                pages.as_ptr(),
                nodes.as_ptr(),
                status.as_mut_ptr(),
                MPOL_MF_MOVE,
            )
        };
        Errno::result(ret).map(drop)
    }
}
