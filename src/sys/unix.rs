use crate::error::CodeError;
use crate::prelude::*;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use std::ops::Range;
use std::ptr::{self, NonNull};

#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// SAFETY: the mapping is exclusively owned and raw access to its contents is
// mediated by `unsafe` methods on the wrapping types.
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Mmap {
        Mmap {
            memory: NonNull::slice_from_raw_parts(NonNull::dangling(), 0),
        }
    }

    /// Maps `size` bytes of zeroed read/write memory.
    pub fn new(size: usize) -> Result<Self> {
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .with_context(|| CodeError::OutOfMemory { bytes: size })?;
        let memory = ptr::slice_from_raw_parts_mut(ptr.cast::<u8>(), size);
        let memory = NonNull::new(memory).ok_or(CodeError::OutOfMemory { bytes: size })?;
        Ok(Mmap { memory })
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

    pub unsafe fn make_writable(&self, range: Range<usize>) -> Result<()> {
        let base = unsafe { self.as_mut_ptr().add(range.start).cast() };
        let len = range.end - range.start;
        unsafe { rustix::mm::mprotect(base, len, MprotectFlags::READ | MprotectFlags::WRITE)? };
        Ok(())
    }

    pub unsafe fn make_executable(
        &self,
        range: Range<usize>,
        enable_branch_protection: bool,
    ) -> Result<()> {
        let base = unsafe { self.as_mut_ptr().add(range.start).cast() };
        let len = range.end - range.start;

        let flags = MprotectFlags::READ | MprotectFlags::EXEC;
        let flags = if enable_branch_protection {
            #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
            if std::arch::is_aarch64_feature_detected!("bti") {
                MprotectFlags::from_bits_retain(flags.bits() | /* PROT_BTI */ 0x10)
            } else {
                flags
            }

            #[cfg(not(all(target_arch = "aarch64", target_os = "linux")))]
            flags
        } else {
            flags
        };

        unsafe { rustix::mm::mprotect(base, len, flags)? };
        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let len = self.len();
        if len == 0 {
            return;
        }
        // SAFETY: the mapping was created by `mmap_anonymous` with this length
        // and nothing borrows it past the owner's lifetime.
        unsafe {
            rustix::mm::munmap(self.as_mut_ptr().cast(), len).expect("munmap failed");
        }
    }
}

pub fn get_page_size() -> usize {
    rustix::param::page_size()
}
