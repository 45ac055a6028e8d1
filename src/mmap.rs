//! Low-level abstraction for allocating page-aligned regions of code memory
//! and flipping their protection between writable and executable.

use crate::error::CodeError;
use crate::prelude::*;
use crate::sys;
use core::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the host page size, caching the first query.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = sys::get_page_size();
            assert!(size != 0);
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        n => n,
    }
}

/// Round `bytes` up to a multiple of the host page size.
///
/// Returns an error if rounding up overflows.
pub fn round_up_to_host_pages(bytes: usize) -> Result<usize> {
    let page_size = host_page_size();
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
        .ok_or_else(|| CodeError::OutOfMemory { bytes }.into())
}

/// An owned, page-aligned mapping of memory destined to hold machine code.
///
/// Both the start address and the length are multiples of the host page
/// size. The mapping starts out readable and writable.
#[derive(Debug)]
pub struct Mmap {
    sys: sys::Mmap,
}

impl Mmap {
    /// Create a new `Mmap` pointing to at least `size` bytes of page-aligned
    /// accessible memory.
    pub fn with_at_least(size: usize) -> Result<Self> {
        let rounded_size = round_up_to_host_pages(size)?;
        if rounded_size == 0 {
            return Ok(Mmap {
                sys: sys::Mmap::new_empty(),
            });
        }
        let sys = sys::Mmap::new(rounded_size)
            .with_context(|| format!("mmap failed to allocate {rounded_size:#x} bytes"))?;
        log::trace!(
            "mapped {rounded_size:#x} bytes of code memory at {:p}",
            sys.as_ptr()
        );
        Ok(Mmap { sys })
    }

    /// Return the allocated memory as a slice of u8.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the range of bytes is readable, which
    /// holds for both protections this type ever applies.
    ///
    /// # Panics
    ///
    /// Panics of the `range` provided is outside of the limits of this mmap.
    #[inline]
    pub unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        // SAFETY: bounds checked above, readability is the caller's contract.
        unsafe {
            core::slice::from_raw_parts(self.as_ptr().add(range.start), range.end - range.start)
        }
    }

    /// Return the allocated memory as a mutable slice of u8.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `range` is currently writable and that no
    /// other reference to it exists, including a thread executing from it.
    ///
    /// # Panics
    ///
    /// Panics of the `range` provided is outside of the limits of this mmap.
    #[allow(clippy::mut_from_ref, reason = "exclusivity is the caller's contract")]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        // SAFETY: bounds checked above, exclusivity is the caller's contract.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.as_mut_ptr().add(range.start),
                range.end - range.start,
            )
        }
    }

    /// Return the allocated memory as a pointer to u8.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.sys.as_ptr()
    }

    /// Return the allocated memory as a mutable pointer to u8.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.sys.as_mut_ptr()
    }

    /// Return the length of the allocated memory.
    #[inline]
    pub fn len(&self) -> usize {
        self.sys.len()
    }

    /// Return whether any memory has been allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the specified `range` within this `Mmap` read/write.
    ///
    /// # Safety
    ///
    /// No thread may be executing from `range` until it's made executable
    /// again.
    ///
    /// # Panics
    ///
    /// Panics of `range` is out-of-bounds or not page-aligned.
    pub unsafe fn make_writable(&self, range: Range<usize>) -> Result<()> {
        self.check_protect_range(&range);
        if range.start == range.end {
            return Ok(());
        }
        // SAFETY: forwarded contract.
        unsafe { self.sys.make_writable(range) }.context("failed to make code memory writable")
    }

    /// Makes the specified `range` within this `Mmap` to be read/execute.
    ///
    /// # Safety
    ///
    /// This method is unsafe as it's generally not valid to simply make memory
    /// executable, so it's up to the caller to ensure that everything is in
    /// order and this doesn't overlap with other memory that should only be
    /// read or only read/write.
    ///
    /// # Panics
    ///
    /// Panics of `range` is out-of-bounds or not page-aligned.
    pub unsafe fn make_executable(
        &self,
        range: Range<usize>,
        enable_branch_protection: bool,
    ) -> Result<()> {
        self.check_protect_range(&range);
        if range.start == range.end {
            // A zero-sized mprotect (or equivalent) is allowed on some
            // platforms but not others. Treat it as a no-op everywhere.
            return Ok(());
        }
        // SAFETY: forwarded contract.
        unsafe { self.sys.make_executable(range, enable_branch_protection) }
            .context("failed to make memory executable")
    }

    fn check_protect_range(&self, range: &Range<usize>) {
        assert!(range.start <= self.len());
        assert!(range.end <= self.len());
        assert!(range.start <= range.end);
        assert!(
            range.start % host_page_size() == 0,
            "changing of protections isn't page-aligned",
        );
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Mmap>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_pages() {
        let page = host_page_size();
        assert_eq!(round_up_to_host_pages(0).unwrap(), 0);
        assert_eq!(round_up_to_host_pages(1).unwrap(), page);
        assert_eq!(round_up_to_host_pages(page).unwrap(), page);
        assert_eq!(round_up_to_host_pages(page + 1).unwrap(), 2 * page);
        assert!(round_up_to_host_pages(usize::MAX).is_err());
    }

    #[test]
    fn protect_zero_length() {
        let page = host_page_size();
        let mem = Mmap::with_at_least(2 * page).unwrap();
        assert_eq!(mem.len(), 2 * page);
        assert_eq!(mem.as_ptr() as usize % page, 0);
        unsafe {
            mem.make_executable(page..page, false).unwrap();
            mem.make_writable(page..page).unwrap();
        }
    }

    #[test]
    fn write_then_execute_then_write() {
        let page = host_page_size();
        let mem = Mmap::with_at_least(10).unwrap();
        assert_eq!(mem.len(), page);
        unsafe {
            mem.slice_mut(0..4).copy_from_slice(&[1, 2, 3, 4]);
            mem.make_executable(0..page, false).unwrap();
            assert_eq!(mem.slice(0..4), &[1, 2, 3, 4]);
            mem.make_writable(0..page).unwrap();
            mem.slice_mut(0..1)[0] = 9;
            assert_eq!(mem.slice(0..4), &[9, 2, 3, 4]);
        }
    }

    #[test]
    fn empty() {
        let mem = Mmap::with_at_least(0).unwrap();
        assert!(mem.is_empty());
    }
}
