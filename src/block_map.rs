//! A concurrent index from program counter to the block of code containing
//! it.
//!
//! Lookups happen from signal handlers and sampling profilers, so they must
//! never take a lock a writer could be holding. The index is therefore
//! double-buffered: readers search a published, read-only vector while the
//! writer, serialized by a mutex, edits a private one. After each edit the
//! two are swapped, the writer waits for readers of the old published vector
//! to drain, and then repeats the same edit on it so that both vectors hold
//! the same entries again.

use crate::error::CodeError;
use crate::metadata::CodeRange;
use crate::prelude::*;
use core::hint;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Something occupying a range of code addresses.
pub trait CodeRegion: Send + Sync {
    /// Address of the first byte.
    fn code_start(&self) -> usize;

    /// Address one past the last byte.
    fn code_end(&self) -> usize;

    /// The finer-grained code range containing `pc`, if known.
    fn code_range_at(&self, _pc: usize) -> Option<&CodeRange> {
        None
    }
}

struct Entry<B> {
    start: usize,
    end: usize,
    block: Arc<B>,
}

impl<B> Clone for Entry<B> {
    fn clone(&self) -> Self {
        Entry {
            start: self.start,
            end: self.end,
            block: self.block.clone(),
        }
    }
}

type Entries<B> = Vec<Entry<B>>;

/// A set of non-overlapping [`CodeRegion`]s, searchable by address without
/// locking.
pub struct ThreadSafeCodeBlockMap<B> {
    /// The writer's private copy. Holding the lock is what makes the caller
    /// the writer.
    mutable: Mutex<NonNull<Entries<B>>>,
    /// The copy searched by `lookup`.
    readonly: AtomicPtr<Entries<B>>,
    num_active_lookups: AtomicUsize,
}

// SAFETY: both vectors are only reached through the protocol implemented
// below, which hands out `Arc<B>`s and shared references only.
unsafe impl<B: Send + Sync> Send for ThreadSafeCodeBlockMap<B> {}
// SAFETY: see above.
unsafe impl<B: Send + Sync> Sync for ThreadSafeCodeBlockMap<B> {}

impl<B: CodeRegion> Default for ThreadSafeCodeBlockMap<B> {
    fn default() -> Self {
        ThreadSafeCodeBlockMap::new()
    }
}

impl<B: CodeRegion> ThreadSafeCodeBlockMap<B> {
    /// Creates an empty map.
    pub fn new() -> ThreadSafeCodeBlockMap<B> {
        let mutable = NonNull::from(Box::leak(Box::new(Entries::<B>::new())));
        let readonly = Box::into_raw(Box::new(Entries::<B>::new()));
        ThreadSafeCodeBlockMap {
            mutable: Mutex::new(mutable),
            readonly: AtomicPtr::new(readonly),
            num_active_lookups: AtomicUsize::new(0),
        }
    }

    /// Returns the region containing `pc`.
    ///
    /// Never blocks. Safe to call concurrently with any other method.
    pub fn lookup(&self, pc: usize) -> Option<Arc<B>> {
        self.with_readonly(|entries| Some(find(entries, pc)?.block.clone()))
    }

    /// Returns the region containing `pc` along with the code range within
    /// it that contains `pc`.
    pub fn lookup_with_range(&self, pc: usize) -> Option<(Arc<B>, Option<CodeRange>)> {
        self.with_readonly(|entries| {
            let entry = find(entries, pc)?;
            let range = entry.block.code_range_at(pc).copied();
            Some((entry.block.clone(), range))
        })
    }

    /// Number of regions currently registered.
    pub fn len(&self) -> usize {
        self.with_readonly(|entries| entries.len())
    }

    /// Returns whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_readonly<R>(&self, f: impl FnOnce(&Entries<B>) -> R) -> R {
        // The increment must be visible to a writer before we read the
        // published pointer, so the writer can't miss us while it waits.
        self.num_active_lookups.fetch_add(1, Ordering::SeqCst);
        let _guard = LookupGuard(&self.num_active_lookups);
        let entries = self.readonly.load(Ordering::SeqCst);
        // SAFETY: the writer doesn't touch the vector it unpublished until
        // `num_active_lookups` drops to zero, which our guard prevents.
        f(unsafe { &*entries })
    }

    /// Registers `block`.
    ///
    /// Returns an error if there isn't enough memory to grow the index, in
    /// which case the map is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `block` overlaps a registered region.
    pub fn insert(&self, block: Arc<B>) -> Result<()> {
        let entry = Entry {
            start: block.code_start(),
            end: block.code_end(),
            block,
        };
        assert!(entry.start < entry.end, "registering an empty code region");

        let mut mutable = self.mutable.lock().unwrap();
        // SAFETY: only the lock holder touches the private vector.
        insert_entry(unsafe { mutable.as_mut() }, entry.clone())?;

        self.swap_and_wait(&mut mutable);

        // SAFETY: as above, and readers have drained from it.
        let entries = unsafe { mutable.as_mut() };
        if let Err(e) = insert_entry(entries, entry) {
            // The other vector is already published with the new entry, and
            // undoing that would need another swap that could fail the same
            // way.
            log::error!("failed to mirror code block registration: {e:?}");
            std::process::abort();
        }
        log::trace!("registered code region, {} now live", entries.len());
        Ok(())
    }

    /// Unregisters `block` and returns the number of regions left.
    ///
    /// # Panics
    ///
    /// Panics if `block` isn't registered.
    pub fn remove(&self, block: &B) -> usize {
        let mut mutable = self.mutable.lock().unwrap();
        // SAFETY: only the lock holder touches the private vector.
        remove_entry(unsafe { mutable.as_mut() }, block);
        self.swap_and_wait(&mut mutable);
        // SAFETY: as above, and readers have drained from it.
        let entries = unsafe { mutable.as_mut() };
        remove_entry(entries, block);
        entries.len()
    }

    fn swap_and_wait(&self, mutable: &mut NonNull<Entries<B>>) {
        // A lookup starting before this swap searches the old vector, one
        // starting after it searches the new one. Both are consistent.
        let previous = self.readonly.swap(mutable.as_ptr(), Ordering::SeqCst);
        // SAFETY: the published pointer is never null.
        *mutable = unsafe { NonNull::new_unchecked(previous) };

        // Lookups may still be searching `previous`. Wait for them before
        // it gets edited.
        let mut backoff = Backoff::new();
        while self.num_active_lookups.load(Ordering::SeqCst) > 0 {
            backoff.spin();
        }
    }
}

impl<B> Drop for ThreadSafeCodeBlockMap<B> {
    fn drop(&mut self) {
        let mutable = *self.mutable.get_mut().unwrap_or_else(|e| e.into_inner());
        // SAFETY: both vectors came from `Box::into_raw`/`Box::leak` in `new`
        // and `&mut self` rules out lookups.
        unsafe {
            drop(Box::from_raw(mutable.as_ptr()));
            drop(Box::from_raw(*self.readonly.get_mut()));
        }
    }
}

struct LookupGuard<'a>(&'a AtomicUsize);

impl Drop for LookupGuard<'_> {
    fn drop(&mut self) {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }
}

fn find<B>(entries: &Entries<B>, pc: usize) -> Option<&Entry<B>> {
    let index = entries.partition_point(|entry| entry.end <= pc);
    entries.get(index).filter(|entry| entry.start <= pc)
}

fn insert_entry<B>(entries: &mut Entries<B>, entry: Entry<B>) -> Result<()> {
    let index = entries.partition_point(|e| e.end <= entry.start);
    if let Some(next) = entries.get(index) {
        assert!(
            entry.end <= next.start,
            "code region {:#x}..{:#x} overlaps {:#x}..{:#x}",
            entry.start,
            entry.end,
            next.start,
            next.end
        );
    }
    entries.try_reserve(1).map_err(|_| CodeError::OutOfMemory {
        bytes: size_of::<Entry<B>>(),
    })?;
    entries.insert(index, entry);
    Ok(())
}

fn remove_entry<B>(entries: &mut Entries<B>, block: &B) {
    let index = entries
        .iter()
        .position(|entry| core::ptr::eq(Arc::as_ptr(&entry.block), block));
    match index {
        Some(index) => {
            entries.remove(index);
        }
        None => panic!("removing a code region that isn't registered"),
    }
}

/// An exponential backoff for the writer's drain loop.
///
/// Spins `2^exp` times per step, doubling up to a cap, and yields the thread
/// once the cap is reached so that a descheduled reader can finish.
#[derive(Debug)]
struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_EXPONENT: u8 = 6;

    fn new() -> Backoff {
        Backoff { exp: 0 }
    }

    fn spin(&mut self) {
        if self.exp >= Backoff::MAX_EXPONENT {
            std::thread::yield_now();
            return;
        }
        for _ in 0..1u32 << self.exp {
            hint::spin_loop();
        }
        self.exp += 1;
    }
}
