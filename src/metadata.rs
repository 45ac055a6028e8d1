//! Address-keyed metadata describing a block of compiled code.
//!
//! All offsets in these tables are relative to the base of the
//! [`CodeSegment`](crate::CodeSegment) holding the code. A compiler produces
//! them relative to the start of its own buffer; when that buffer is placed
//! somewhere other than the start of a segment the tables are rebased with
//! [`CodeBlockMetadata::offset_by`].

use bitflags::bitflags;
use core::ops::Range;
use serde_derive::{Deserialize, Serialize};

/// What a [`CodeRange`] holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeRangeKind {
    /// The body of a defined function.
    Function,
    /// A stub called from the interpreter to enter a function.
    InterpEntry,
    /// A stub called from JIT code to enter a function.
    JitEntry,
    /// A stub calling an imported function through the interpreter ABI.
    ImportInterpExit,
    /// A stub calling an imported function through the JIT ABI.
    ImportJitExit,
    /// The stub that traps are redirected to.
    TrapExit,
    /// The stub that unwinds to an exception handler.
    Throw,
    /// A trampoline extending the range of near jumps.
    FarJumpIsland,
}

bitflags! {
    /// A selection of [`CodeRangeKind`]s, used to filter disassembly.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct CodeRangeKinds: u32 {
        /// [`CodeRangeKind::Function`]
        const FUNCTION = 1 << 0;
        /// [`CodeRangeKind::InterpEntry`]
        const INTERP_ENTRY = 1 << 1;
        /// [`CodeRangeKind::JitEntry`]
        const JIT_ENTRY = 1 << 2;
        /// [`CodeRangeKind::ImportInterpExit`]
        const IMPORT_INTERP_EXIT = 1 << 3;
        /// [`CodeRangeKind::ImportJitExit`]
        const IMPORT_JIT_EXIT = 1 << 4;
        /// [`CodeRangeKind::TrapExit`]
        const TRAP_EXIT = 1 << 5;
        /// [`CodeRangeKind::Throw`]
        const THROW = 1 << 6;
        /// [`CodeRangeKind::FarJumpIsland`]
        const FAR_JUMP_ISLAND = 1 << 7;
    }
}

impl CodeRangeKind {
    /// The selection containing only this kind.
    pub fn flag(self) -> CodeRangeKinds {
        match self {
            CodeRangeKind::Function => CodeRangeKinds::FUNCTION,
            CodeRangeKind::InterpEntry => CodeRangeKinds::INTERP_ENTRY,
            CodeRangeKind::JitEntry => CodeRangeKinds::JIT_ENTRY,
            CodeRangeKind::ImportInterpExit => CodeRangeKinds::IMPORT_INTERP_EXIT,
            CodeRangeKind::ImportJitExit => CodeRangeKinds::IMPORT_JIT_EXIT,
            CodeRangeKind::TrapExit => CodeRangeKinds::TRAP_EXIT,
            CodeRangeKind::Throw => CodeRangeKinds::THROW,
            CodeRangeKind::FarJumpIsland => CodeRangeKinds::FAR_JUMP_ISLAND,
        }
    }
}

/// A contiguous range of code with a single purpose.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
    /// What this range holds.
    pub kind: CodeRangeKind,
    /// The function this range belongs to, for function bodies, entry stubs
    /// and import exits.
    pub func_index: Option<u32>,
    /// Offset of the first byte.
    pub begin: u32,
    /// Offset one past the last byte.
    pub end: u32,
    /// Offset that the tiering jump table points at. Equal to `begin` for
    /// everything but function bodies, whose tier entry may skip a prologue.
    pub tier_entry: u32,
}

impl CodeRange {
    /// A range of `kind` covering `range`.
    pub fn new(kind: CodeRangeKind, func_index: Option<u32>, range: Range<u32>) -> CodeRange {
        assert!(range.start <= range.end);
        CodeRange {
            kind,
            func_index,
            begin: range.start,
            end: range.end,
            tier_entry: range.start,
        }
    }

    /// The body of function `func_index`, entered by the tiering table at
    /// `tier_entry`.
    pub fn function(func_index: u32, range: Range<u32>, tier_entry: u32) -> CodeRange {
        assert!(range.contains(&tier_entry));
        CodeRange {
            tier_entry,
            ..CodeRange::new(CodeRangeKind::Function, Some(func_index), range)
        }
    }

    /// Returns whether this is a function body.
    pub fn is_function(&self) -> bool {
        self.kind == CodeRangeKind::Function
    }

    /// Returns whether `offset` falls in this range.
    pub fn contains(&self, offset: u32) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    /// Returns whether this range is empty.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    fn offset_by(&mut self, delta: u32) {
        self.begin += delta;
        self.end += delta;
        self.tier_entry += delta;
    }
}

/// How a call site reaches its callee.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallSiteKind {
    /// A direct call to a function in the same module.
    Func,
    /// A call to an imported function.
    Import,
    /// A call through a table.
    Indirect,
    /// A call to a runtime entry point.
    Symbolic,
}

/// Offset of a Wasm instruction within its module's code section.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BytecodeOffset(pub u32);

/// A call instruction, keyed by the return address it pushes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Offset of the instruction following the call.
    pub return_address_offset: u32,
    /// How the callee is reached.
    pub kind: CallSiteKind,
    /// The Wasm instruction that made the call.
    pub bytecode: BytecodeOffset,
}

/// Why a trapping instruction traps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[expect(missing_docs, reason = "self-describing variants")]
pub enum Trap {
    Unreachable,
    IntegerOverflow,
    BadConversionToInteger,
    IntegerDivideByZero,
    OutOfBounds,
    UnalignedAccess,
    IndirectCallToNull,
    IndirectCallBadSig,
    NullPointerDereference,
    BadCast,
    StackOverflow,
    CheckInterrupt,
}

/// An instruction that may fault, and the trap it raises when it does.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapSite {
    /// Offset of the faulting instruction.
    pub pc_offset: u32,
    /// The trap raised.
    pub trap: Trap,
    /// The Wasm instruction that was compiled to the faulting instruction.
    pub bytecode: BytecodeOffset,
}

/// The GC roots live in a frame at a call's return address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMap {
    /// Offset of the return address this map describes.
    pub code_offset: u32,
    /// Size of the frame, in words.
    pub frame_words: u32,
    /// Word offsets, from the stack pointer, of slots holding references.
    pub ref_slots: Vec<u32>,
}

/// A range of code covered by an exception handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryNote {
    /// Offset of the first instruction of the try body.
    pub try_begin: u32,
    /// Offset one past the last instruction of the try body.
    pub try_end: u32,
    /// Offset of the handler.
    pub landing_pad_entry: u32,
    /// Depth of the frame, in bytes, expected by the handler.
    pub landing_pad_frame_depth: u32,
}

impl TryNote {
    /// Returns whether a call returning to `offset` was made from inside the
    /// try body.
    ///
    /// `offset` is a return address, so it's exclusive of the start and
    /// inclusive of the end.
    pub fn offset_within_try_body(&self, offset: u32) -> bool {
        offset > self.try_begin && offset <= self.try_end
    }
}

/// How to unwind a frame whose pc is at an unusual point of a prologue or
/// epilogue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnwindHow {
    /// The frame is fully set up; unwind normally.
    Normal,
    /// Neither frame pointer nor return address have been pushed yet.
    RestoreFpRa,
    /// The return address has been popped but the frame pointer has not.
    RestoreFp,
    /// The frame pointer and link register still hold the caller's values.
    UseFpLr,
    /// The frame pointer still holds the caller's value.
    UseFp,
}

/// The unwind behaviour starting at `offset`, up to the next entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRangeUnwindInfo {
    /// Offset where this behaviour starts.
    pub offset: u32,
    /// The behaviour.
    pub how: UnwindHow,
}

/// A function that may be called from outside of Wasm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncExport {
    /// The exported function.
    pub func_index: u32,
    /// Index of its signature in the module's type section.
    pub type_index: u32,
    /// Index in the block's code ranges of an interpreter entry stub compiled
    /// along with the tier, if one was.
    pub eager_interp_entry: Option<u32>,
}

/// An imported function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncImport {
    /// Index of its signature in the module's type section.
    pub type_index: u32,
}

/// The tables a compiler produces alongside one buffer of machine code.
///
/// Each table is sorted by offset, and `func_exports` by function index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlockMetadata {
    /// Function indices whose primary code range lives in this block.
    pub funcs: Range<u32>,
    /// Code ranges, sorted by `begin` and non-overlapping.
    pub code_ranges: Vec<CodeRange>,
    /// Call sites, sorted by return address.
    pub call_sites: Vec<CallSite>,
    /// Trap sites, sorted by pc.
    pub trap_sites: Vec<TrapSite>,
    /// Stack maps, sorted by code offset.
    pub stack_maps: Vec<StackMap>,
    /// Try notes, innermost first.
    pub try_notes: Vec<TryNote>,
    /// Unwind info, sorted by offset.
    pub unwind_infos: Vec<CodeRangeUnwindInfo>,
    /// Exported functions, sorted by function index.
    pub func_exports: Vec<FuncExport>,
}

impl CodeBlockMetadata {
    /// Adds `delta` to every code offset.
    pub fn offset_by(&mut self, delta: u32) {
        if delta == 0 {
            return;
        }
        for range in self.code_ranges.iter_mut() {
            range.offset_by(delta);
        }
        for site in self.call_sites.iter_mut() {
            site.return_address_offset += delta;
        }
        for site in self.trap_sites.iter_mut() {
            site.pc_offset += delta;
        }
        for map in self.stack_maps.iter_mut() {
            map.code_offset += delta;
        }
        for note in self.try_notes.iter_mut() {
            note.try_begin += delta;
            note.try_end += delta;
            note.landing_pad_entry += delta;
        }
        for info in self.unwind_infos.iter_mut() {
            info.offset += delta;
        }
    }

    /// Panics unless every table is in the order lookups rely on.
    pub(crate) fn assert_sorted(&self) {
        if let Err(msg) = self.check_sorted() {
            panic!("{msg}");
        }
    }

    /// Describes the first table that isn't in the order lookups rely on.
    pub(crate) fn check_sorted(&self) -> Result<(), &'static str> {
        if !self.code_ranges.windows(2).all(|w| w[0].end <= w[1].begin) {
            return Err("code ranges overlap or are unsorted");
        }
        if !self
            .call_sites
            .windows(2)
            .all(|w| w[0].return_address_offset < w[1].return_address_offset)
        {
            return Err("call sites are unsorted");
        }
        if !self
            .trap_sites
            .windows(2)
            .all(|w| w[0].pc_offset < w[1].pc_offset)
        {
            return Err("trap sites are unsorted");
        }
        if !self
            .stack_maps
            .windows(2)
            .all(|w| w[0].code_offset < w[1].code_offset)
        {
            return Err("stack maps are unsorted");
        }
        if !self
            .unwind_infos
            .windows(2)
            .all(|w| w[0].offset < w[1].offset)
        {
            return Err("unwind infos are unsorted");
        }
        if !self
            .func_exports
            .windows(2)
            .all(|w| w[0].func_index < w[1].func_index)
        {
            return Err("function exports are unsorted");
        }
        Ok(())
    }

    /// Describes the first offset that falls outside of `len` bytes of code.
    pub(crate) fn check_bounds(&self, len: u32) -> Result<(), String> {
        for r in self.code_ranges.iter() {
            if !(r.begin <= r.tier_entry && r.tier_entry <= r.end && r.end <= len) {
                return Err(format!("code range {:#x}..{:#x} out of bounds", r.begin, r.end));
            }
        }
        let offsets = self
            .call_sites
            .iter()
            .map(|s| s.return_address_offset)
            .chain(self.trap_sites.iter().map(|s| s.pc_offset))
            .chain(self.stack_maps.iter().map(|m| m.code_offset))
            .chain(self.unwind_infos.iter().map(|i| i.offset))
            .chain(
                self.try_notes
                    .iter()
                    .flat_map(|n| [n.try_begin, n.try_end, n.landing_pad_entry]),
            );
        for offset in offsets {
            if offset > len {
                return Err(format!("offset {offset:#x} out of bounds"));
            }
        }
        if let Some(note) = self.try_notes.iter().find(|n| n.try_begin > n.try_end) {
            return Err(format!("try note at {:#x} is inverted", note.try_begin));
        }
        let num_ranges = self.code_ranges.len();
        for export in self.func_exports.iter() {
            if export
                .eager_interp_entry
                .is_some_and(|i| i as usize >= num_ranges)
            {
                return Err(format!("entry of function {} out of bounds", export.func_index));
            }
        }
        Ok(())
    }

    pub(crate) fn lookup_range(&self, offset: u32) -> Option<&CodeRange> {
        let index = self
            .code_ranges
            .partition_point(|range| range.end <= offset);
        self.code_ranges
            .get(index)
            .filter(|range| range.contains(offset))
    }

    pub(crate) fn lookup_call_site(&self, offset: u32) -> Option<&CallSite> {
        let index = self
            .call_sites
            .binary_search_by_key(&offset, |site| site.return_address_offset)
            .ok()?;
        Some(&self.call_sites[index])
    }

    pub(crate) fn lookup_stack_map(&self, offset: u32) -> Option<&StackMap> {
        let index = self
            .stack_maps
            .binary_search_by_key(&offset, |map| map.code_offset)
            .ok()?;
        Some(&self.stack_maps[index])
    }

    pub(crate) fn lookup_trap(&self, offset: u32) -> Option<(Trap, BytecodeOffset)> {
        let index = self
            .trap_sites
            .binary_search_by_key(&offset, |site| site.pc_offset)
            .ok()?;
        let site = &self.trap_sites[index];
        Some((site.trap, site.bytecode))
    }

    pub(crate) fn lookup_try_note(&self, offset: u32) -> Option<&TryNote> {
        // Notes nest, so they can't be binary searched. The first hit is
        // the innermost handler.
        self.try_notes
            .iter()
            .find(|note| note.offset_within_try_body(offset))
    }

    pub(crate) fn lookup_unwind_info(&self, offset: u32) -> Option<&CodeRangeUnwindInfo> {
        let index = match self
            .unwind_infos
            .binary_search_by_key(&offset, |info| info.offset)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let info = &self.unwind_infos[index];
        match info.how {
            UnwindHow::Normal => None,
            _ => Some(info),
        }
    }

    pub(crate) fn lookup_func_export(&self, func_index: u32) -> Option<(usize, &FuncExport)> {
        let index = self
            .func_exports
            .binary_search_by_key(&func_index, |export| export.func_index)
            .ok()?;
        Some((index, &self.func_exports[index]))
    }

    /// Heap bytes used by each table, keyed by table name.
    pub(crate) fn table_sizes(&self) -> [(&'static str, usize); 7] {
        fn bytes<T>(v: &[T]) -> usize {
            size_of_val(v)
        }
        [
            ("code_ranges", bytes(&self.code_ranges)),
            ("call_sites", bytes(&self.call_sites)),
            ("trap_sites", bytes(&self.trap_sites)),
            (
                "stack_maps",
                bytes(&self.stack_maps)
                    + self
                        .stack_maps
                        .iter()
                        .map(|map| bytes(&map.ref_slots))
                        .sum::<usize>(),
            ),
            ("try_notes", bytes(&self.try_notes)),
            ("unwind_infos", bytes(&self.unwind_infos)),
            ("func_exports", bytes(&self.func_exports)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> CodeBlockMetadata {
        CodeBlockMetadata {
            funcs: 0..2,
            code_ranges: vec![
                CodeRange::function(0, 0x00..0x40, 0x08),
                CodeRange::function(1, 0x40..0x80, 0x48),
                CodeRange::new(CodeRangeKind::TrapExit, None, 0x90..0xa0),
            ],
            call_sites: vec![
                CallSite {
                    return_address_offset: 0x10,
                    kind: CallSiteKind::Func,
                    bytecode: BytecodeOffset(3),
                },
                CallSite {
                    return_address_offset: 0x50,
                    kind: CallSiteKind::Import,
                    bytecode: BytecodeOffset(9),
                },
            ],
            trap_sites: vec![TrapSite {
                pc_offset: 0x20,
                trap: Trap::OutOfBounds,
                bytecode: BytecodeOffset(5),
            }],
            stack_maps: vec![StackMap {
                code_offset: 0x10,
                frame_words: 4,
                ref_slots: vec![1, 3],
            }],
            try_notes: vec![
                TryNote {
                    try_begin: 0x48,
                    try_end: 0x58,
                    landing_pad_entry: 0x70,
                    landing_pad_frame_depth: 16,
                },
                TryNote {
                    try_begin: 0x44,
                    try_end: 0x68,
                    landing_pad_entry: 0x78,
                    landing_pad_frame_depth: 16,
                },
            ],
            unwind_infos: vec![
                CodeRangeUnwindInfo {
                    offset: 0x00,
                    how: UnwindHow::RestoreFpRa,
                },
                CodeRangeUnwindInfo {
                    offset: 0x04,
                    how: UnwindHow::Normal,
                },
                CodeRangeUnwindInfo {
                    offset: 0x3c,
                    how: UnwindHow::RestoreFp,
                },
            ],
            func_exports: vec![FuncExport {
                func_index: 1,
                type_index: 0,
                eager_interp_entry: None,
            }],
        }
    }

    #[test]
    fn range_lookup() {
        let m = metadata();
        m.assert_sorted();
        assert_eq!(m.lookup_range(0x00).unwrap().func_index, Some(0));
        assert_eq!(m.lookup_range(0x3f).unwrap().func_index, Some(0));
        assert_eq!(m.lookup_range(0x40).unwrap().func_index, Some(1));
        assert!(m.lookup_range(0x88).is_none());
        assert_eq!(m.lookup_range(0x90).unwrap().kind, CodeRangeKind::TrapExit);
        assert!(m.lookup_range(0xa0).is_none());
    }

    #[test]
    fn exact_lookups() {
        let m = metadata();
        assert_eq!(
            m.lookup_call_site(0x50).unwrap().bytecode,
            BytecodeOffset(9)
        );
        assert!(m.lookup_call_site(0x51).is_none());
        assert_eq!(m.lookup_stack_map(0x10).unwrap().ref_slots, [1, 3]);
        assert!(m.lookup_stack_map(0x11).is_none());
        assert_eq!(
            m.lookup_trap(0x20),
            Some((Trap::OutOfBounds, BytecodeOffset(5)))
        );
        assert!(m.lookup_trap(0x21).is_none());
    }

    #[test]
    fn innermost_try_note_wins() {
        let m = metadata();
        assert_eq!(m.lookup_try_note(0x50).unwrap().landing_pad_entry, 0x70);
        assert_eq!(m.lookup_try_note(0x60).unwrap().landing_pad_entry, 0x78);
        // Return addresses exclude the start of the body.
        assert!(m.lookup_try_note(0x44).is_none());
        assert_eq!(m.lookup_try_note(0x68).unwrap().landing_pad_entry, 0x78);
    }

    #[test]
    fn unwind_info_upper_bound() {
        let m = metadata();
        assert_eq!(
            m.lookup_unwind_info(0x02).unwrap().how,
            UnwindHow::RestoreFpRa
        );
        assert!(m.lookup_unwind_info(0x04).is_none());
        assert!(m.lookup_unwind_info(0x20).is_none());
        assert_eq!(
            m.lookup_unwind_info(0x3e).unwrap().how,
            UnwindHow::RestoreFp
        );
    }

    #[test]
    fn rebase() {
        let mut m = metadata();
        m.offset_by(0x1000);
        m.assert_sorted();
        assert_eq!(m.code_ranges[1].begin, 0x1040);
        assert_eq!(m.code_ranges[1].tier_entry, 0x1048);
        assert_eq!(
            m.lookup_call_site(0x1010).unwrap().bytecode,
            BytecodeOffset(3)
        );
        assert_eq!(m.lookup_try_note(0x1050).unwrap().landing_pad_entry, 0x1070);
        assert!(m.lookup_range(0x10).is_none());
    }

    #[test]
    #[should_panic(expected = "code ranges overlap")]
    fn overlapping_ranges_are_rejected() {
        let mut m = metadata();
        m.code_ranges[1].begin = 0x30;
        m.assert_sorted();
    }

    #[test]
    fn checks_name_the_bad_table() {
        let m = metadata();
        assert_eq!(m.check_sorted(), Ok(()));
        assert_eq!(m.check_bounds(0xa0), Ok(()));

        let mut unsorted = m.clone();
        unsorted.call_sites.swap(0, 1);
        assert_eq!(unsorted.check_sorted(), Err("call sites are unsorted"));

        let err = m.check_bounds(0x90).unwrap_err();
        assert!(err.contains("code range 0x90..0xa0"), "{err}");

        let mut bad_entry = m.clone();
        bad_entry.func_exports.push(FuncExport {
            func_index: 7,
            type_index: 0,
            eager_interp_entry: Some(3),
        });
        let err = bad_entry.check_bounds(0xa0).unwrap_err();
        assert!(err.contains("function 7"), "{err}");
    }

    #[test]
    fn kinds_selection() {
        let kinds = CodeRangeKinds::FUNCTION | CodeRangeKinds::TRAP_EXIT;
        assert!(kinds.contains(CodeRangeKind::Function.flag()));
        assert!(!kinds.contains(CodeRangeKind::JitEntry.flag()));
        assert!(CodeRangeKinds::all().contains(CodeRangeKind::FarJumpIsland.flag()));
    }
}
