//! The interface to the code generator that produces entry stubs on demand.

use crate::block::CodeBlock;
use crate::link::LinkData;
use crate::metadata::{CodeBlockMetadata, CodeRangeKind};
use crate::prelude::*;

/// One function that needs entry stubs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryStubRequest {
    /// The function being entered.
    pub func_index: u32,
    /// Index of the function's export in the tier block's export table.
    pub func_export_index: usize,
    /// Absolute address the stubs call.
    pub callee: usize,
}

/// The unlinked output of an [`EntryStubCompiler`].
///
/// `metadata` has one [`CodeRangeKind::InterpEntry`] range for every request
/// and optionally one [`CodeRangeKind::JitEntry`] range too, all with offsets
/// relative to the start of `bytes`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompiledStubs {
    /// Unlinked machine code.
    pub bytes: Vec<u8>,
    /// Patches to apply to `bytes`.
    pub link_data: LinkData,
    /// Metadata for `bytes`.
    pub metadata: CodeBlockMetadata,
}

impl CompiledStubs {
    /// Returns the indices of the interpreter and jit entry ranges of
    /// `func_index`.
    pub fn entries(&self, func_index: u32) -> Option<(u32, Option<u32>)> {
        let mut interp = None;
        let mut jit = None;
        for (i, range) in self.metadata.code_ranges.iter().enumerate() {
            if range.func_index != Some(func_index) {
                continue;
            }
            match range.kind {
                CodeRangeKind::InterpEntry => interp = interp.or(Some(i)),
                CodeRangeKind::JitEntry => jit = jit.or(Some(i)),
                _ => {}
            }
        }
        Some((u32::try_from(interp?).ok()?, jit.and_then(|i| u32::try_from(i).ok())))
    }
}

/// Compiles interpreter and jit entry stubs for functions of a tier.
///
/// Implemented by the code generator; the stubs it returns are linked into
/// a lazy-stub segment by [`Code`](crate::Code).
pub trait EntryStubCompiler: Send + Sync {
    /// Compiles entry stubs for every request into one buffer.
    fn compile_entry_stubs(
        &self,
        tier: &CodeBlock,
        requests: &[EntryStubRequest],
    ) -> Result<CompiledStubs>;
}
