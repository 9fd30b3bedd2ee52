//! Page-residency helper.
//!
//! Given a page-aligned buffer, `touch_nonresident` asks the kernel which pages
//! are currently backed (`mincore`), faults the missing ones in by bumping one
//! byte per page, then puts every byte back. Buffer contents are unchanged.

use std::io;
use std::ptr;

/// System page size, falling back to 4 KiB when sysconf is unhelpful.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Number of pages needed to cover `len` bytes.
pub fn page_count(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size)
}

/// Fault in every non-resident page of `buf`; returns how many were touched.
///
/// `buf` must start on a page boundary (anything from `mmap` does).
#[cfg(unix)]
pub fn touch_nonresident(buf: &mut [u8]) -> io::Result<usize> {
    let page = page_size();
    let pages = page_count(buf.len(), page);
    if pages == 0 {
        return Ok(0);
    }

    let mut vec = vec![0u8; pages];
    // SAFETY: `vec` holds one byte per page of `buf`.
    let ret = unsafe {
        libc::mincore(
            buf.as_mut_ptr().cast(),
            buf.len(),
            vec.as_mut_ptr().cast(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let base = buf.as_mut_ptr();
    let missing: Vec<usize> = (0..pages).filter(|&idx| vec[idx] & 1 == 0).collect();
    // Volatile so the increment/decrement pair is not folded away.
    for &idx in &missing {
        // SAFETY: idx < pages, so the offset lies inside `buf`.
        unsafe {
            let byte = base.add(idx * page);
            ptr::write_volatile(byte, ptr::read_volatile(byte).wrapping_add(1));
        }
    }
    for &idx in &missing {
        // SAFETY: as above.
        unsafe {
            let byte = base.add(idx * page);
            ptr::write_volatile(byte, ptr::read_volatile(byte).wrapping_sub(1));
        }
    }

    Ok(missing.len())
}

#[cfg(not(unix))]
pub fn touch_nonresident(_buf: &mut [u8]) -> io::Result<usize> {
    Ok(0)
}
