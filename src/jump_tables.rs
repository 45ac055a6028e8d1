//! Function-indexed tables of code pointers that compiled code dispatches
//! through.

use crate::block::CodeBlock;
use crate::config::CompileMode;
use crate::error::CodeError;
use crate::metadata::CodeRangeKind;
use crate::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The tiering table and the jit-entry table of one module.
///
/// Both tables have one slot per function, imports included. A slot holding
/// zero means nothing is installed yet.
///
/// The tiering table only exists in [`CompileMode::Tiering`]: calls between
/// functions go through it so that installing an optimized tier redirects
/// them. Its slots are overwritten by whichever thread installs a tier.
///
/// The jit-entry table holds the entry JIT code uses to call a function. Its
/// slots are monotonic: once non-zero they never change again, so a reader
/// that observed a value can keep using it. Plain loads of a slot are fine;
/// the code a slot points at is linked and executable before the slot is
/// written.
pub struct JumpTables {
    mode: CompileMode,
    tiering: Box<[AtomicUsize]>,
    jit: Box<[AtomicUsize]>,
}

fn zeroed_table(len: usize) -> Result<Box<[AtomicUsize]>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| CodeError::OutOfMemory {
            bytes: len * size_of::<AtomicUsize>(),
        })?;
    table.extend((0..len).map(|_| AtomicUsize::new(0)));
    Ok(table.into_boxed_slice())
}

impl JumpTables {
    /// Allocates both tables, sized to cover every function of the two
    /// blocks, and fills them from the function bodies and eager jit entries
    /// of `shared_stubs` and `tier1`.
    pub fn new(
        mode: CompileMode,
        shared_stubs: &CodeBlock,
        tier1: &CodeBlock,
    ) -> Result<JumpTables> {
        let num_funcs = shared_stubs
            .metadata()
            .funcs
            .end
            .max(tier1.metadata().funcs.end) as usize;
        let tiering = match mode {
            CompileMode::Tiering => zeroed_table(num_funcs)?,
            CompileMode::Once => Box::default(),
        };
        let tables = JumpTables {
            mode,
            tiering,
            jit: zeroed_table(num_funcs)?,
        };

        for block in [shared_stubs, tier1] {
            for range in block.code_ranges() {
                let Some(func_index) = range.func_index else {
                    continue;
                };
                let i = func_index as usize;
                match range.kind {
                    CodeRangeKind::Function => {
                        tables.set_tiering_entry(i, block.address_of(range.tier_entry))
                    }
                    CodeRangeKind::JitEntry => {
                        tables.set_jit_entry(i, block.address_of(range.begin))
                    }
                    _ => {}
                }
            }
        }
        Ok(tables)
    }

    /// Number of slots in each table.
    pub fn num_funcs(&self) -> usize {
        self.jit.len()
    }

    /// Points the tiering slot of function `i` at `target`.
    ///
    /// Does nothing unless compiling in [`CompileMode::Tiering`].
    pub fn set_tiering_entry(&self, i: usize, target: usize) {
        assert!(i < self.num_funcs());
        if self.mode == CompileMode::Tiering {
            self.tiering[i].store(target, Ordering::Relaxed);
        }
    }

    /// The tiering table, empty unless compiling in
    /// [`CompileMode::Tiering`].
    pub fn tiering(&self) -> &[AtomicUsize] {
        &self.tiering
    }

    /// Installs the jit entry of function `i` while the tables are still
    /// private to their creator.
    ///
    /// # Panics
    ///
    /// Panics if a different entry is already installed.
    pub fn set_jit_entry(&self, i: usize, target: usize) {
        let prev = self.jit[i].swap(target, Ordering::Relaxed);
        assert!(prev == 0 || prev == target, "jit entry {i} overwritten");
    }

    /// Installs `target` as the jit entry of function `i` unless an entry is
    /// already installed, and returns whichever entry is installed afterwards.
    ///
    /// Racing callers all get the same answer.
    pub fn set_jit_entry_if_null(&self, i: usize, target: usize) -> usize {
        assert!(target != 0);
        match self.jit[i].compare_exchange(0, target, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => target,
            Err(existing) => existing,
        }
    }

    /// The jit entry of function `i`, if one is installed.
    pub fn jit_entry(&self, i: usize) -> Option<usize> {
        match self.jit[i].load(Ordering::Relaxed) {
            0 => None,
            entry => Some(entry),
        }
    }

    /// The slot holding the jit entry of function `i`, for JIT code that
    /// calls indirectly through it.
    ///
    /// # Panics
    ///
    /// Panics if no entry is installed yet.
    pub fn address_of_jit_entry(&self, i: usize) -> &AtomicUsize {
        let slot = &self.jit[i];
        assert!(slot.load(Ordering::Relaxed) != 0, "no jit entry for {i}");
        slot
    }

    /// Recovers the function index from a slot returned by
    /// [`JumpTables::address_of_jit_entry`].
    ///
    /// # Panics
    ///
    /// Panics if `slot` isn't part of this table.
    pub fn func_index_from_jit_entry(&self, slot: *const AtomicUsize) -> usize {
        let base = self.jit.as_ptr() as usize;
        let addr = slot as usize;
        let offset = addr.wrapping_sub(base);
        assert!(
            addr >= base && offset % size_of::<AtomicUsize>() == 0,
            "not a jit entry slot"
        );
        let i = offset / size_of::<AtomicUsize>();
        assert!(i < self.num_funcs(), "not a jit entry slot");
        i
    }

    /// Bytes used by the tables.
    pub fn size_of_misc(&self) -> usize {
        size_of::<AtomicUsize>() * (self.tiering.len() + self.jit.len())
    }
}

impl core::fmt::Debug for JumpTables {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JumpTables")
            .field("mode", &self.mode)
            .field("num_funcs", &self.num_funcs())
            .finish()
    }
}
