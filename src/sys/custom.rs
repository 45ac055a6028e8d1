//! Fallback for platforms without `mmap`/`mprotect`: code memory comes from
//! the global allocator and protection changes are no-ops. Code produced here
//! can be linked and inspected but the host must arrange for it to be
//! executable itself.

use crate::error::CodeError;
use crate::prelude::*;
use std::alloc::Layout;
use std::ops::Range;
use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;

#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// SAFETY: the allocation is exclusively owned.
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Mmap {
        Mmap {
            memory: NonNull::slice_from_raw_parts(NonNull::dangling(), 0),
        }
    }

    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| CodeError::OutOfMemory { bytes: size })?;
        // SAFETY: callers never request a zero-sized mapping through `new`.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(CodeError::OutOfMemory { bytes: size })?;
        Ok(Mmap {
            memory: NonNull::slice_from_raw_parts(ptr, size),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr() as *const u8
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub unsafe fn make_writable(&self, _range: Range<usize>) -> Result<()> {
        Ok(())
    }

    pub unsafe fn make_executable(
        &self,
        _range: Range<usize>,
        _enable_branch_protection: bool,
    ) -> Result<()> {
        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let len = self.len();
        if len == 0 {
            return;
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { std::alloc::dealloc(self.as_mut_ptr(), layout) }
    }
}

pub fn get_page_size() -> usize {
    PAGE_SIZE
}
