//! Owned slabs of executable memory.

use crate::block::CodeBlock;
use crate::link::{self, LinkData, SymbolTable};
use crate::mmap::{Mmap, round_up_to_host_pages};
use crate::prelude::*;
use core::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A page-aligned region of executable memory holding the code of one or
/// more [`CodeBlock`]s.
///
/// A segment is either *exact*, created by [`CodeSegment::create_from_bytes`]
/// with its whole capacity in use, or *claimable*, created empty by
/// [`CodeSegment::create_empty`] and then carved into page-aligned pieces by
/// [`CodeSegment::claim_space`]. Claimable segments hold lazily generated
/// entry stubs and are shared between the stub blocks carved from them.
///
/// Pages are never writable and executable at the same time: a range is
/// written and linked while writable and then flipped to read/execute
/// before any block referring to it is published.
pub struct CodeSegment {
    mmap: Mmap,
    length: AtomicUsize,
    branch_protection: bool,
}

impl CodeSegment {
    /// Allocates an empty claimable segment of at least `capacity` bytes.
    pub fn create_empty(capacity: usize, branch_protection: bool) -> Result<Arc<CodeSegment>> {
        let mmap = Mmap::with_at_least(capacity)?;
        log::debug!(
            "allocated empty code segment of {:#x} bytes at {:p}",
            mmap.len(),
            mmap.as_ptr()
        );
        Ok(Arc::new(CodeSegment {
            mmap,
            length: AtomicUsize::new(0),
            branch_protection,
        }))
    }

    /// Allocates an exact segment holding a copy of `unlinked`, statically
    /// linked at its final address and made executable.
    ///
    /// When `shared_stubs` is provided its trap stub is what
    /// [`SymbolicAddress::HandleTrap`](crate::SymbolicAddress::HandleTrap)
    /// links against.
    pub fn create_from_bytes(
        unlinked: &[u8],
        link_data: &LinkData,
        symbols: &SymbolTable,
        shared_stubs: Option<&CodeBlock>,
        branch_protection: bool,
    ) -> Result<Arc<CodeSegment>> {
        let capacity = round_up_to_host_pages(unlinked.len())?;
        let mmap = Mmap::with_at_least(capacity)?;
        let segment = CodeSegment {
            mmap,
            length: AtomicUsize::new(capacity),
            branch_protection,
        };
        let trap_handler = shared_stubs.and_then(|stubs| stubs.trap_code());
        // SAFETY: the mapping is fresh, so nothing can be executing it, and
        // nothing else refers to it yet.
        unsafe {
            segment.link_and_make_executable(0, unlinked, link_data, symbols, trap_handler)?;
        }
        log::debug!(
            "created code segment of {:#x} bytes at {:#x}",
            capacity,
            segment.base()
        );
        Ok(Arc::new(segment))
    }

    /// Copies `unlinked` to `offset`, links it there and flips the range to
    /// read/execute.
    ///
    /// The range is made writable first, so this can be used on a claimed
    /// range of a claimable segment whose neighbours are already executable.
    ///
    /// # Safety
    ///
    /// `offset..offset + unlinked.len()` must be exclusively owned by the
    /// caller, e.g. by a prior [`CodeSegment::claim_space`], and no thread may
    /// be executing from it.
    pub(crate) unsafe fn link_and_make_executable(
        &self,
        offset: usize,
        unlinked: &[u8],
        link_data: &LinkData,
        symbols: &SymbolTable,
        trap_handler: Option<usize>,
    ) -> Result<()> {
        let pages = offset..offset + round_up_to_host_pages(unlinked.len())?;
        assert!(pages.end <= self.length());

        // SAFETY: exclusive ownership of `pages` is the caller's contract.
        unsafe {
            self.mmap.make_writable(pages.clone())?;
            let code = self.mmap.slice_mut(offset..offset + unlinked.len());
            code.copy_from_slice(unlinked);
            let linked =
                link::statically_link(code, self.base() + offset, link_data, symbols, trap_handler);
            // Even if linking failed the range goes back to read/execute: it's
            // never published, but it must not stay writable either.
            self.mmap.make_executable(pages, self.branch_protection)?;
            linked
        }
    }

    /// Absolute address of the first byte of this segment.
    pub fn base(&self) -> usize {
        self.mmap.as_ptr() as usize
    }

    /// Number of bytes in use.
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    /// Number of bytes allocated.
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    /// Returns whether `bytes`, a multiple of the page size, can still be
    /// claimed.
    pub fn has_space(&self, bytes: usize) -> bool {
        debug_assert_eq!(round_up_to_host_pages(bytes).ok(), Some(bytes));
        bytes <= self.capacity() && self.length() <= self.capacity() - bytes
    }

    /// Claims the next `bytes` of this segment and returns their offset.
    ///
    /// Claims never overlap. The caller must hold whatever lock serializes
    /// claims on this segment; see [`Code`](crate::Code), which claims under
    /// its exclusive guard.
    ///
    /// # Panics
    ///
    /// Panics if [`CodeSegment::has_space`] is false for `bytes`.
    pub fn claim_space(&self, bytes: usize) -> usize {
        assert!(self.has_space(bytes), "claimed more than the segment holds");
        self.length.fetch_add(bytes, Ordering::Relaxed)
    }

    /// Returns the bytes of `range`, relative to the segment base.
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the capacity.
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        // SAFETY: code memory is readable under both protections this type
        // applies, and writes happen only to claimed ranges before they're
        // handed out.
        unsafe { self.mmap.slice(range) }
    }

    /// Returns a copy of `range` with every link in `link_data` restored to
    /// its unlinked placeholder.
    pub fn unlinked_bytes(&self, range: Range<usize>, link_data: &LinkData) -> Result<Vec<u8>> {
        let mut bytes = self.bytes(range).to_vec();
        link::statically_unlink(&mut bytes, link_data)?;
        Ok(bytes)
    }
}

impl core::fmt::Debug for CodeSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeSegment")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("length", &self.length())
            .field("capacity", &self.capacity())
            .finish()
    }
}
