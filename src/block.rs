//! Immutable bundles of compiled code and the metadata describing it.

use crate::code::Code;
use crate::error::CodeError;
use crate::link::{LinkData, SymbolTable};
use crate::metadata::{
    BytecodeOffset, CallSite, CodeBlockMetadata, CodeRange, CodeRangeKind, CodeRangeKinds,
    CodeRangeUnwindInfo, FuncExport, StackMap, Trap, TryNote,
};
use crate::prelude::*;
use crate::segment::CodeSegment;
use core::fmt::Write as _;
use core::ops::Range;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

/// What a [`CodeBlock`] holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeBlockKind {
    /// Stubs shared by every tier: import exits, the trap exit and friends.
    SharedStubs,
    /// Every function, compiled by the baseline compiler.
    BaselineTier,
    /// Every function, compiled by the optimizing compiler.
    OptimizedTier,
    /// Entry stubs created on demand.
    LazyStubs,
}

impl CodeBlockKind {
    /// The kind of block holding a complete `tier`.
    pub fn from_tier(tier: Tier) -> CodeBlockKind {
        match tier {
            Tier::Baseline => CodeBlockKind::BaselineTier,
            Tier::Optimized => CodeBlockKind::OptimizedTier,
        }
    }

    /// The kind of code range a function index maps to in this kind of
    /// block.
    pub(crate) fn primary_range_kind(self) -> CodeRangeKind {
        match self {
            CodeBlockKind::SharedStubs => CodeRangeKind::ImportInterpExit,
            CodeBlockKind::BaselineTier | CodeBlockKind::OptimizedTier => CodeRangeKind::Function,
            CodeBlockKind::LazyStubs => CodeRangeKind::InterpEntry,
        }
    }
}

/// A compilation tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Quick to compile, slow to run.
    Baseline,
    /// Slow to compile, quick to run.
    Optimized,
}

/// Sentinel stored in unfilled slots of a [`FuncToCodeRangeMap`].
pub const BAD_CODE_RANGE: u32 = u32::MAX;

/// Dense map from function index to the index of that function's code range
/// in a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FuncToCodeRangeMap {
    start_func_index: u32,
    func_to_code_range: Vec<u32>,
}

impl FuncToCodeRangeMap {
    /// Creates a map for `num_funcs` functions starting at
    /// `start_func_index`, with every slot unfilled.
    pub fn create_dense(start_func_index: u32, num_funcs: u32) -> Result<FuncToCodeRangeMap> {
        let len = usize::try_from(num_funcs)?;
        let mut func_to_code_range = Vec::new();
        func_to_code_range
            .try_reserve_exact(len)
            .map_err(|_| CodeError::OutOfMemory {
                bytes: len * size_of::<u32>(),
            })?;
        func_to_code_range.resize(len, BAD_CODE_RANGE);
        Ok(FuncToCodeRangeMap {
            start_func_index,
            func_to_code_range,
        })
    }

    fn slot(&self, func_index: u32) -> Option<usize> {
        let slot = usize::try_from(func_index.checked_sub(self.start_func_index)?).ok()?;
        (slot < self.func_to_code_range.len()).then_some(slot)
    }

    /// Returns the code range index of `func_index`, if it's covered and
    /// filled.
    pub fn lookup(&self, func_index: u32) -> Option<u32> {
        let index = self.func_to_code_range[self.slot(func_index)?];
        (index != BAD_CODE_RANGE).then_some(index)
    }

    /// Fills the slot of `func_index`, returning false if this map doesn't
    /// cover it.
    #[must_use]
    pub fn insert(&mut self, func_index: u32, code_range_index: u32) -> bool {
        match self.slot(func_index) {
            Some(slot) => {
                self.func_to_code_range[slot] = code_range_index;
                true
            }
            None => false,
        }
    }

    /// Fills the slot of `func_index`.
    ///
    /// # Panics
    ///
    /// Panics if this map doesn't cover `func_index`.
    pub fn insert_infallible(&mut self, func_index: u32, code_range_index: u32) {
        let inserted = self.insert(func_index, code_range_index);
        assert!(inserted, "function {func_index} is not covered by this map");
    }

    /// Panics if any slot is unfilled.
    pub fn assert_all_initialized(&self) {
        if let Some(slot) = self
            .func_to_code_range
            .iter()
            .position(|&index| index == BAD_CODE_RANGE)
        {
            panic!(
                "function {} has no code range",
                self.start_func_index as usize + slot
            );
        }
    }

    /// Number of functions covered.
    pub fn num_entries(&self) -> usize {
        self.func_to_code_range.len()
    }

    fn heap_size(&self) -> usize {
        size_of_val(self.func_to_code_range.as_slice())
    }
}

/// The output of compiling one block: unlinked machine code plus the tables
/// describing it, with offsets relative to the start of `bytes`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCodeBlock {
    /// What this block holds.
    pub kind: CodeBlockKind,
    /// Unlinked machine code.
    pub bytes: Vec<u8>,
    /// Metadata for `bytes`.
    pub metadata: CodeBlockMetadata,
}

/// One compiled tier, or a block of stubs, living in a [`CodeSegment`].
///
/// A block is immutable once constructed, apart from the one-time binding of
/// its owner in [`CodeBlock::initialize`], so its tables can be read from any
/// thread without locking.
pub struct CodeBlock {
    /// Non-owning: the owning `Code` holds this block, never the reverse.
    code: OnceLock<Weak<Code>>,
    kind: CodeBlockKind,
    segment: Arc<CodeSegment>,
    /// Segment-relative range of this block's code.
    range: Range<usize>,
    func_to_code_range: FuncToCodeRangeMap,
    metadata: CodeBlockMetadata,
    trap_code: Option<usize>,
}

impl CodeBlock {
    /// Creates a block for the code at `range` of `segment`, described by
    /// `metadata` whose offsets are already relative to the segment.
    ///
    /// # Panics
    ///
    /// Panics if the metadata tables aren't sorted, or if a code range falls
    /// outside of `range`.
    pub fn new(
        kind: CodeBlockKind,
        segment: Arc<CodeSegment>,
        range: Range<usize>,
        metadata: CodeBlockMetadata,
    ) -> Result<CodeBlock> {
        assert!(range.start <= range.end && range.end <= segment.length());
        metadata.assert_sorted();
        if let (Some(first), Some(last)) =
            (metadata.code_ranges.first(), metadata.code_ranges.last())
        {
            assert!(
                range.start <= first.begin as usize && last.end as usize <= range.end,
                "code ranges fall outside of the block"
            );
        }

        let funcs = metadata.funcs.clone();
        let mut func_to_code_range =
            FuncToCodeRangeMap::create_dense(funcs.start, funcs.end.saturating_sub(funcs.start))?;
        let primary = kind.primary_range_kind();
        for (index, code_range) in metadata.code_ranges.iter().enumerate() {
            let Some(func_index) = code_range.func_index else {
                continue;
            };
            if code_range.kind == primary
                && funcs.contains(&func_index)
                && func_to_code_range.lookup(func_index).is_none()
            {
                func_to_code_range.insert_infallible(func_index, u32::try_from(index)?);
            }
        }

        Ok(CodeBlock {
            code: OnceLock::new(),
            kind,
            segment,
            range,
            func_to_code_range,
            metadata,
            trap_code: None,
        })
    }

    /// Allocates an exact segment for `compiled`, links it and wraps it in a
    /// block.
    ///
    /// For a [`CodeBlockKind::SharedStubs`] block, `link_data.trap_offset`
    /// locates the trap exit returned by [`CodeBlock::trap_code`].
    pub fn from_compiled(
        compiled: &CompiledCodeBlock,
        link_data: &LinkData,
        symbols: &SymbolTable,
        shared_stubs: Option<&CodeBlock>,
        branch_protection: bool,
    ) -> Result<CodeBlock> {
        let segment = CodeSegment::create_from_bytes(
            &compiled.bytes,
            link_data,
            symbols,
            shared_stubs,
            branch_protection,
        )
        .with_context(|| format!("failed to create code segment for {:?}", compiled.kind))?;
        let base = segment.base();
        let mut block = CodeBlock::new(
            compiled.kind,
            segment,
            0..compiled.bytes.len(),
            compiled.metadata.clone(),
        )?;
        if compiled.kind == CodeBlockKind::SharedStubs {
            block.trap_code = Some(base + usize::try_from(link_data.trap_offset)?);
        }
        Ok(block)
    }

    /// Binds this block to its owner and checks that every function it
    /// covers has a code range.
    ///
    /// # Panics
    ///
    /// Panics if called twice or if a function slot is unfilled.
    pub fn initialize(&self, code: Weak<Code>) {
        self.func_to_code_range.assert_all_initialized();
        if self.code.set(code).is_err() {
            panic!("code block initialized twice");
        }
    }

    /// Returns whether [`CodeBlock::initialize`] has been called.
    pub fn initialized(&self) -> bool {
        self.code.get().is_some()
    }

    /// The owning [`Code`], if it's still alive.
    pub fn code(&self) -> Option<Arc<Code>> {
        self.code.get()?.upgrade()
    }

    /// What this block holds.
    pub fn kind(&self) -> CodeBlockKind {
        self.kind
    }

    /// The tier of a tier block.
    ///
    /// # Panics
    ///
    /// Panics for stub blocks.
    pub fn tier(&self) -> Tier {
        match self.kind {
            CodeBlockKind::BaselineTier => Tier::Baseline,
            CodeBlockKind::OptimizedTier => Tier::Optimized,
            kind => panic!("{kind:?} blocks have no tier"),
        }
    }

    /// The segment this block's code lives in.
    pub fn segment(&self) -> &Arc<CodeSegment> {
        &self.segment
    }

    /// Absolute address of this block's first byte.
    pub fn base(&self) -> usize {
        self.segment.base() + self.range.start
    }

    /// Length of this block's code.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns whether this block holds no code.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Segment-relative range of this block's code.
    pub fn segment_range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Returns whether `pc` points into this block's code.
    pub fn contains_code_pc(&self, pc: usize) -> bool {
        self.base() <= pc && pc < self.base() + self.len()
    }

    fn offset_of(&self, pc: usize) -> Option<u32> {
        if !self.contains_code_pc(pc) {
            return None;
        }
        u32::try_from(pc - self.segment.base()).ok()
    }

    /// Absolute address of the segment-relative `offset`.
    pub fn address_of(&self, offset: u32) -> usize {
        self.segment.base() + offset as usize
    }

    /// Address that trap handling redirects to, for the shared stubs.
    pub fn trap_code(&self) -> Option<usize> {
        self.trap_code
    }

    /// The tables describing this block, with segment-relative offsets.
    pub fn metadata(&self) -> &CodeBlockMetadata {
        &self.metadata
    }

    /// The function to code range map.
    pub fn func_to_code_range(&self) -> &FuncToCodeRangeMap {
        &self.func_to_code_range
    }

    /// All code ranges, sorted by address.
    pub fn code_ranges(&self) -> &[CodeRange] {
        &self.metadata.code_ranges
    }

    /// The code range at `index`.
    pub fn code_range(&self, index: u32) -> &CodeRange {
        &self.metadata.code_ranges[index as usize]
    }

    /// The primary code range of `func_index`, if this block covers it.
    pub fn code_range_for_func(&self, func_index: u32) -> Option<&CodeRange> {
        let index = self.func_to_code_range.lookup(func_index)?;
        Some(self.code_range(index))
    }

    /// The code range of an exported function.
    ///
    /// # Panics
    ///
    /// Panics if this block doesn't cover the function.
    pub fn code_range_for_export(&self, export: &FuncExport) -> &CodeRange {
        self.code_range_for_func(export.func_index)
            .unwrap_or_else(|| panic!("no code range for function {}", export.func_index))
    }

    /// Absolute address of the start of `func_index`'s primary code range.
    pub fn func_entry(&self, func_index: u32) -> Option<usize> {
        let range = self.code_range_for_func(func_index)?;
        Some(self.address_of(range.begin))
    }

    /// Exported functions, sorted by function index.
    pub fn func_exports(&self) -> &[FuncExport] {
        &self.metadata.func_exports
    }

    /// Returns the export of `func_index` and its index in
    /// [`CodeBlock::func_exports`].
    ///
    /// # Panics
    ///
    /// Panics if `func_index` isn't exported from this block.
    pub fn lookup_func_export(&self, func_index: u32) -> (usize, &FuncExport) {
        self.find_func_export(func_index)
            .unwrap_or_else(|| panic!("function {func_index} is not exported"))
    }

    /// Like [`CodeBlock::lookup_func_export`], but `None` if `func_index`
    /// isn't exported from this block.
    pub fn find_func_export(&self, func_index: u32) -> Option<(usize, &FuncExport)> {
        self.metadata.lookup_func_export(func_index)
    }

    /// The code range containing `pc`.
    pub fn lookup_range(&self, pc: usize) -> Option<&CodeRange> {
        self.metadata.lookup_range(self.offset_of(pc)?)
    }

    /// The call site whose return address is `pc`.
    pub fn lookup_call_site(&self, pc: usize) -> Option<&CallSite> {
        self.metadata.lookup_call_site(self.offset_of(pc)?)
    }

    /// The stack map for the return address `pc`.
    pub fn lookup_stack_map(&self, pc: usize) -> Option<&StackMap> {
        self.metadata.lookup_stack_map(self.offset_of(pc)?)
    }

    /// The innermost try note whose body contains the return address `pc`.
    pub fn lookup_try_note(&self, pc: usize) -> Option<&TryNote> {
        self.metadata.lookup_try_note(self.offset_of(pc)?)
    }

    /// The trap raised by the faulting instruction at `pc`.
    pub fn lookup_trap(&self, pc: usize) -> Option<(Trap, BytecodeOffset)> {
        self.metadata.lookup_trap(self.offset_of(pc)?)
    }

    /// Special unwind behaviour at `pc`; `None` means unwind normally.
    pub fn lookup_unwind_info(&self, pc: usize) -> Option<&CodeRangeUnwindInfo> {
        self.metadata.lookup_unwind_info(self.offset_of(pc)?)
    }

    /// Prints a header and a hex dump of each code range whose kind is in
    /// `kinds`.
    pub fn disassemble(&self, kinds: CodeRangeKinds, print: &mut dyn FnMut(&str)) {
        for range in self.code_ranges() {
            if !kinds.contains(range.kind.flag()) {
                continue;
            }
            let mut header = format!("{:?}", range.kind);
            if let Some(func_index) = range.func_index {
                let _ = write!(header, " func[{func_index}]");
            }
            let _ = write!(
                header,
                " {:#x}..{:#x}",
                self.address_of(range.begin),
                self.address_of(range.end)
            );
            print(&header);

            let bytes = self
                .segment
                .bytes(range.begin as usize..range.end as usize);
            for (i, chunk) in bytes.chunks(16).enumerate() {
                let mut line = format!("  {:#010x}:", self.address_of(range.begin) + i * 16);
                for byte in chunk {
                    let _ = write!(line, " {byte:02x}");
                }
                print(&line);
            }
        }
    }

    pub(crate) fn add_metadata_sizes(&self, sizes: &mut BTreeMap<&'static str, usize>) {
        *sizes.entry("func_to_code_range").or_default() += self.func_to_code_range.heap_size();
        for (name, bytes) in self.metadata.table_sizes() {
            *sizes.entry(name).or_default() += bytes;
        }
    }
}

impl crate::block_map::CodeRegion for CodeBlock {
    fn code_start(&self) -> usize {
        self.base()
    }

    fn code_end(&self) -> usize {
        self.base() + self.len()
    }

    fn code_range_at(&self, pc: usize) -> Option<&CodeRange> {
        self.lookup_range(pc)
    }
}

impl core::fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeBlock")
            .field("kind", &self.kind)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len())
            .field("code_ranges", &self.metadata.code_ranges.len())
            .finish()
    }
}
