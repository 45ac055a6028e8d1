//! The top-level owner of a module's compiled code.

use crate::block::{CodeBlock, CodeBlockKind, CompiledCodeBlock, Tier};
use crate::block_map::ThreadSafeCodeBlockMap;
use crate::config::{CodeConfig, CompileMode};
use crate::error::CodeError;
use crate::jump_tables::JumpTables;
use crate::link::{LinkData, SymbolTable};
use crate::metadata::{
    BytecodeOffset, CallSite, CodeRange, CodeRangeKind, CodeRangeKinds, CodeRangeUnwindInfo,
    FuncExport, FuncImport, StackMap, Trap, TryNote,
};
use crate::mmap::round_up_to_host_pages;
use crate::prelude::*;
use crate::registry;
use crate::segment::CodeSegment;
use crate::stubs::{EntryStubCompiler, EntryStubRequest};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// The pieces a module's code is assembled from.
pub struct CodeParts {
    /// Signatures of the imported functions, which take the lowest function
    /// indices.
    pub func_imports: Vec<FuncImport>,
    /// Linked shared stubs, covering the imported functions.
    pub shared_stubs: CodeBlock,
    /// Linked first tier, covering the defined functions.
    pub tier1: CodeBlock,
    /// Module name used in profiling labels.
    pub module_name: String,
    /// Function names used in profiling labels, by function index. Missing
    /// or empty names are synthesized.
    pub func_names: Vec<String>,
}

/// An entry stub created on demand, keyed by function index.
#[derive(Copy, Clone, Debug)]
struct LazyFuncExport {
    func_index: u32,
    lazy_stub_block_index: usize,
    func_code_range_index: u32,
    /// Kind of the block the stub calls into; only ever upgraded from
    /// baseline to optimized.
    func_kind: CodeBlockKind,
}

/// State that changes after construction, behind `Code::data`.
#[derive(Default)]
struct ProtectedData {
    /// Every block this code owns, in creation order. Lazy exports refer to
    /// stub blocks by index, so blocks are only ever appended.
    blocks: Vec<Arc<CodeBlock>>,
    /// Claimable segments holding lazy stubs. New stubs go in the last one.
    lazy_segments: Vec<Arc<CodeSegment>>,
    /// Sorted by function index.
    lazy_exports: Vec<LazyFuncExport>,
}

const TIER2_ABSENT: u8 = 0;
const TIER2_BUILDING: u8 = 1;
const TIER2_PUBLISHED: u8 = 2;

/// The optimized tier, installed at most once.
///
/// Goes from absent to building when an installer claims it, then either
/// back to absent if the install fails or to published. Nothing reads the
/// block until the published state has been observed with acquire ordering,
/// and once published the block never changes.
struct Tier2Slot {
    state: AtomicU8,
    block: AtomicPtr<Arc<CodeBlock>>,
}

impl Tier2Slot {
    fn new() -> Tier2Slot {
        Tier2Slot {
            state: AtomicU8::new(TIER2_ABSENT),
            block: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                TIER2_ABSENT,
                TIER2_BUILDING,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn abandon(&self) {
        let prev = self.state.swap(TIER2_ABSENT, Ordering::Release);
        debug_assert_eq!(prev, TIER2_BUILDING);
    }

    fn publish(&self, block: Arc<CodeBlock>) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), TIER2_BUILDING);
        self.block
            .store(Box::into_raw(Box::new(block)), Ordering::Relaxed);
        self.state.store(TIER2_PUBLISHED, Ordering::Release);
    }

    fn get(&self) -> Option<&Arc<CodeBlock>> {
        if self.state.load(Ordering::Acquire) != TIER2_PUBLISHED {
            return None;
        }
        // SAFETY: the pointer was written before the release store of the
        // published state we just acquired, and is never written again.
        Some(unsafe { &*self.block.load(Ordering::Relaxed) })
    }
}

impl Drop for Tier2Slot {
    fn drop(&mut self) {
        let block = *self.block.get_mut();
        if !block.is_null() {
            // SAFETY: came from `Box::into_raw` in `publish`.
            drop(unsafe { Box::from_raw(block) });
        }
    }
}

/// Compiled code and its metadata, shared by a module and all of its
/// instances.
///
/// The shared stubs and the first tier are fixed at construction. An
/// optimized second tier may be installed later, once, from a background
/// compilation thread with [`Code::finish_complete_tier2`], while other
/// threads keep running the first tier. Entry stubs for functions called
/// from outside of Wasm are created on first use by
/// [`Code::get_or_create_interp_entry`].
pub struct Code {
    config: CodeConfig,
    symbols: SymbolTable,
    stub_compiler: Arc<dyn EntryStubCompiler>,

    data: RwLock<ProtectedData>,
    block_map: ThreadSafeCodeBlockMap<CodeBlock>,

    shared_stubs: Arc<CodeBlock>,
    tier1: Arc<CodeBlock>,
    tier2: Tier2Slot,

    func_imports: Vec<FuncImport>,
    jump_tables: JumpTables,
    trap_code: Option<usize>,

    module_name: String,
    func_names: Vec<String>,
    /// Built on demand, under its own lock so profiling never waits on
    /// stub creation.
    profiling_labels: Mutex<Vec<String>>,

    me: Weak<Code>,
}

impl Code {
    /// Takes ownership of `parts`, registers its blocks and builds the jump
    /// tables.
    ///
    /// `stub_compiler` is used to create entry stubs on demand and
    /// `symbols` to link them.
    ///
    /// # Panics
    ///
    /// Panics if `parts.shared_stubs` isn't a shared-stubs block or
    /// `parts.tier1` isn't a tier block.
    pub fn new(
        config: CodeConfig,
        symbols: SymbolTable,
        stub_compiler: Arc<dyn EntryStubCompiler>,
        parts: CodeParts,
    ) -> Result<Arc<Code>> {
        let CodeParts {
            func_imports,
            shared_stubs,
            tier1,
            module_name,
            func_names,
        } = parts;
        assert_eq!(shared_stubs.kind(), CodeBlockKind::SharedStubs);
        assert!(matches!(
            tier1.kind(),
            CodeBlockKind::BaselineTier | CodeBlockKind::OptimizedTier
        ));

        let jump_tables = JumpTables::new(config.mode, &shared_stubs, &tier1)
            .context("failed to allocate jump tables")?;
        let trap_code = shared_stubs.trap_code();
        let profiling = config.profiling;

        let code = Arc::new_cyclic(|me: &Weak<Code>| {
            shared_stubs.initialize(me.clone());
            tier1.initialize(me.clone());
            Code {
                config,
                symbols,
                stub_compiler,
                data: RwLock::new(ProtectedData::default()),
                block_map: ThreadSafeCodeBlockMap::new(),
                shared_stubs: Arc::new(shared_stubs),
                tier1: Arc::new(tier1),
                tier2: Tier2Slot::new(),
                func_imports,
                jump_tables,
                trap_code,
                module_name,
                func_names,
                profiling_labels: Mutex::new(Vec::new()),
                me: me.clone(),
            }
        });

        {
            let mut data = code.data.write().unwrap();
            code.add_block(&mut data, code.shared_stubs.clone())?;
            code.add_block(&mut data, code.tier1.clone())?;
        }
        log::debug!(
            "created {:?} code for `{}`: {} functions, {} imports",
            code.tier1.tier(),
            code.module_name,
            code.jump_tables.num_funcs(),
            code.func_imports.len(),
        );

        code.ensure_profiling_labels(profiling);
        Ok(code)
    }

    /// Registers `block` and takes ownership of it, returning its index in
    /// `data.blocks`.
    fn add_block(&self, data: &mut ProtectedData, block: Arc<CodeBlock>) -> Result<usize> {
        data.blocks
            .try_reserve(1)
            .map_err(|_| CodeError::OutOfMemory {
                bytes: size_of::<Arc<CodeBlock>>(),
            })?;
        if !block.is_empty() {
            self.block_map.insert(block.clone())?;
            if let Err(e) = registry::register(&block) {
                self.block_map.remove(&block);
                return Err(e);
            }
        }
        data.blocks.push(block);
        Ok(data.blocks.len() - 1)
    }

    fn pop_block(&self, data: &mut ProtectedData, block: &Arc<CodeBlock>) {
        let popped = data.blocks.pop();
        assert!(popped.is_some_and(|b| Arc::ptr_eq(&b, block)));
        if !block.is_empty() {
            self.block_map.remove(block);
            registry::unregister(block);
        }
    }

    // ---------------------------------------------------------------------
    // Tiers

    /// Returns whether the optimized tier has been published.
    pub fn has_tier2(&self) -> bool {
        self.tier2.get().is_some()
    }

    /// The tier of the first tier, which never changes.
    pub fn stable_tier(&self) -> Tier {
        self.tier1.tier()
    }

    /// The best tier available right now. May change from baseline to
    /// optimized at any time.
    pub fn best_tier(&self) -> Tier {
        match self.tier2.get() {
            Some(tier2) => tier2.tier(),
            None => self.tier1.tier(),
        }
    }

    /// Returns whether a complete `tier` is available.
    pub fn has_tier(&self, tier: Tier) -> bool {
        self.tier1.tier() == tier || self.tier2.get().is_some_and(|t| t.tier() == tier)
    }

    /// The block holding the complete `tier`.
    ///
    /// # Panics
    ///
    /// Panics if the tier isn't available.
    pub fn code_block(&self, tier: Tier) -> &CodeBlock {
        if self.tier1.tier() == tier {
            return &self.tier1;
        }
        match self.tier2.get() {
            Some(tier2) if tier2.tier() == tier => &**tier2,
            _ => panic!("no {tier:?} code"),
        }
    }

    /// The shared stubs.
    pub fn shared_stubs(&self) -> &CodeBlock {
        &self.shared_stubs
    }

    /// The block that currently provides function `func_index`: the shared
    /// stubs for imports, the best tier otherwise.
    pub fn func_code_block(&self, func_index: u32) -> &CodeBlock {
        if (func_index as usize) < self.func_imports.len() {
            return &self.shared_stubs;
        }
        match self.tier2.get() {
            Some(tier2) => &**tier2,
            None => &*self.tier1,
        }
    }

    /// Returns whether `func_index` currently runs in `tier`.
    pub fn func_has_tier(&self, func_index: u32, tier: Tier) -> bool {
        self.func_code_block(func_index).tier() == tier
    }

    /// The tier that `range`, borrowed from one of this code's tier blocks,
    /// belongs to.
    pub fn lookup_function_tier(&self, range: &CodeRange) -> Option<Tier> {
        fn owns(block: &CodeBlock, range: &CodeRange) -> bool {
            block
                .code_ranges()
                .as_ptr_range()
                .contains(&core::ptr::from_ref(range))
        }
        if owns(&self.tier1, range) {
            return Some(self.tier1.tier());
        }
        let tier2 = self.tier2.get()?;
        owns(tier2, range).then(|| tier2.tier())
    }

    /// Links `compiled`, an optimized tier, and installs it.
    ///
    /// Existing lazy entry stubs are recompiled to call the new tier, the
    /// tier is published, and finally the tiering table is redirected to it.
    /// Jit entries that are already installed stay as they are.
    ///
    /// On failure nothing is published and the code keeps running on its
    /// first tier; installing may be retried.
    ///
    /// # Panics
    ///
    /// Panics unless the first tier is the baseline tier and `compiled` is
    /// an optimized tier.
    pub fn finish_complete_tier2(
        &self,
        link_data: &LinkData,
        compiled: &CompiledCodeBlock,
    ) -> Result<()> {
        assert_eq!(self.tier1.kind(), CodeBlockKind::BaselineTier);
        assert_eq!(compiled.kind, CodeBlockKind::OptimizedTier);
        if !self.tier2.begin() {
            return Err(CodeError::Tier2AlreadyInstalled.into());
        }
        match self.install_tier2(link_data, compiled) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("failed to install optimized tier, staying on tier 1: {e:?}");
                self.tier2.abandon();
                Err(e)
            }
        }
    }

    fn install_tier2(&self, link_data: &LinkData, compiled: &CompiledCodeBlock) -> Result<()> {
        let tier2 = CodeBlock::from_compiled(
            compiled,
            link_data,
            &self.symbols,
            Some(&self.shared_stubs),
            self.config.branch_protection,
        )?;
        tier2.initialize(self.me.clone());
        let tier2 = Arc::new(tier2);

        let mut data = self.data.write().unwrap();
        self.add_block(&mut data, tier2.clone())?;

        let stub_block_index = match self.create_tier2_lazy_entry_stubs(&mut data, &tier2) {
            Ok(index) => index,
            Err(e) => {
                self.pop_block(&mut data, &tier2);
                return Err(e);
            }
        };

        self.tier2.publish(tier2.clone());
        log::debug!(
            "published optimized tier at {:#x}..{:#x}",
            tier2.base(),
            tier2.base() + tier2.len()
        );

        for range in tier2.code_ranges() {
            let Some(func_index) = range.func_index else {
                continue;
            };
            let i = func_index as usize;
            match range.kind {
                CodeRangeKind::Function => {
                    self.jump_tables
                        .set_tiering_entry(i, tier2.address_of(range.tier_entry));
                }
                CodeRangeKind::JitEntry => {
                    self.jump_tables
                        .set_jit_entry_if_null(i, tier2.address_of(range.begin));
                }
                _ => {}
            }
        }
        if let Some(index) = stub_block_index {
            let stubs = &data.blocks[index];
            for range in stubs.code_ranges() {
                let Some(func_index) = range.func_index else {
                    continue;
                };
                if range.kind == CodeRangeKind::JitEntry {
                    let entry = stubs.address_of(range.begin);
                    self.jump_tables
                        .set_jit_entry_if_null(func_index as usize, entry);
                }
            }
        }
        Ok(())
    }

    /// Recompiles the lazy exports of first-tier functions against `tier2`
    /// into one stub block and repoints those exports at it.
    ///
    /// Stubs for imports call through the shared stubs and stay as they are.
    fn create_tier2_lazy_entry_stubs(
        &self,
        data: &mut ProtectedData,
        tier2: &CodeBlock,
    ) -> Result<Option<usize>> {
        let tier1_kind = self.tier1.kind();
        let upgraded = data
            .lazy_exports
            .iter()
            .filter(|e| e.func_kind == tier1_kind)
            .count();
        if upgraded == 0 {
            return Ok(None);
        }
        let mut requests = Vec::new();
        requests
            .try_reserve_exact(upgraded)
            .map_err(|_| CodeError::OutOfMemory {
                bytes: upgraded * size_of::<EntryStubRequest>(),
            })?;
        for export in data.lazy_exports.iter() {
            if export.func_kind != tier1_kind {
                continue;
            }
            let (func_export_index, _) = tier2
                .find_func_export(export.func_index)
                .ok_or_else(|| {
                    format_err!("function {} is not exported from tier 2", export.func_index)
                })?;
            requests.push(EntryStubRequest {
                func_index: export.func_index,
                func_export_index,
                callee: self.callee(tier2, export.func_index)?,
            });
        }

        let (index, entries) = self.create_many_lazy_entry_stubs(data, &requests, tier2)?;
        let exports = data
            .lazy_exports
            .iter_mut()
            .filter(|e| e.func_kind == tier1_kind);
        for (export, (interp, _)) in exports.zip(entries) {
            export.lazy_stub_block_index = index;
            export.func_code_range_index = interp;
            export.func_kind = tier2.kind();
        }
        Ok(Some(index))
    }

    // ---------------------------------------------------------------------
    // Entry stubs

    /// Returns the export of `func_index` and an interpreter entry for it,
    /// creating an entry stub if the function has none yet.
    ///
    /// Concurrent callers for the same function all get the same entry, and
    /// only one stub is created. On error, usually from running out of
    /// executable memory, nothing is installed and the caller can fall back
    /// to a slower way of calling the function.
    ///
    /// # Panics
    ///
    /// Panics if `func_index` isn't exported.
    pub fn get_or_create_interp_entry(&self, func_index: u32) -> Result<(FuncExport, usize)> {
        let block = self.func_code_block(func_index);
        let (_, export) = block.lookup_func_export(func_index);
        let export = *export;
        if let Some(range) = export.eager_interp_entry {
            return Ok((export, block.address_of(block.code_range(range).begin)));
        }

        // A jit entry is installed together with the lazy interpreter entry,
        // so if there is one the stub probably exists already.
        if self.jump_tables.jit_entry(func_index as usize).is_some() {
            let data = self.data.read().unwrap();
            if let Some(entry) = lookup_lazy_interp_entry(&data, func_index) {
                return Ok((export, entry));
            }
        }

        let mut data = self.data.write().unwrap();
        if let Some(entry) = lookup_lazy_interp_entry(&data, func_index) {
            return Ok((export, entry));
        }

        // The best tier may have changed while we were waiting for the lock.
        let block = self.func_code_block(func_index);
        let (func_export_index, export) = block.lookup_func_export(func_index);
        let entry = self
            .create_one_lazy_entry_stub(&mut data, func_export_index, block)
            .with_context(|| format!("failed to create entry stub for function {func_index}"))?;
        Ok((*export, entry))
    }

    fn create_one_lazy_entry_stub(
        &self,
        data: &mut ProtectedData,
        func_export_index: usize,
        tier: &CodeBlock,
    ) -> Result<usize> {
        let func_index = tier.func_exports()[func_export_index].func_index;
        let position = match data
            .lazy_exports
            .binary_search_by_key(&func_index, |e| e.func_index)
        {
            Ok(_) => unreachable!("lazy export for {func_index} created twice"),
            Err(position) => position,
        };
        data.lazy_exports
            .try_reserve(1)
            .map_err(|_| CodeError::OutOfMemory {
                bytes: size_of::<LazyFuncExport>(),
            })?;

        let request = EntryStubRequest {
            func_index,
            func_export_index,
            callee: self.callee(tier, func_index)?,
        };
        let (index, entries) = self.create_many_lazy_entry_stubs(data, &[request], tier)?;
        let (interp_range, jit_range) = entries[0];
        let stubs = data.blocks[index].clone();
        data.lazy_exports.insert(
            position,
            LazyFuncExport {
                func_index,
                lazy_stub_block_index: index,
                func_code_range_index: interp_range,
                func_kind: tier.kind(),
            },
        );

        if let Some(jit) = jit_range {
            let target = stubs.address_of(stubs.code_range(jit).begin);
            self.jump_tables
                .set_jit_entry_if_null(func_index as usize, target);
        }

        let entry = stubs.address_of(stubs.code_range(interp_range).begin);
        log::debug!("created lazy entry stub for function {func_index} at {entry:#x}");
        Ok(entry)
    }

    /// Compiles stubs for `requests`, links them into a lazy-stub segment and
    /// adds the resulting block.
    ///
    /// Returns the index of the block along with the indices of the
    /// interpreter and jit entry ranges of each request, in request order.
    fn create_many_lazy_entry_stubs(
        &self,
        data: &mut ProtectedData,
        requests: &[EntryStubRequest],
        tier: &CodeBlock,
    ) -> Result<(usize, Vec<(u32, Option<u32>)>)> {
        let stubs = self
            .stub_compiler
            .compile_entry_stubs(tier, requests)
            .context("failed to compile entry stubs")?;
        let entries = requests
            .iter()
            .map(|request| {
                stubs.entries(request.func_index).ok_or_else(|| {
                    format_err!(
                        "entry stubs lack an interpreter entry for function {}",
                        request.func_index
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let needed = round_up_to_host_pages(stubs.bytes.len())?;

        let reusable = data
            .lazy_segments
            .last()
            .filter(|segment| segment.has_space(needed))
            .cloned();
        let segment = match reusable {
            Some(segment) => segment,
            None => {
                let capacity =
                    round_up_to_host_pages(self.config.lazy_stub_segment_size)?.max(needed);
                data.lazy_segments
                    .try_reserve(1)
                    .map_err(|_| CodeError::OutOfMemory {
                        bytes: size_of::<Arc<CodeSegment>>(),
                    })?;
                let segment = CodeSegment::create_empty(capacity, self.config.branch_protection)
                    .context("failed to allocate lazy stub segment")?;
                data.lazy_segments.push(segment.clone());
                segment
            }
        };

        let offset = segment.claim_space(needed);
        // SAFETY: the range was just claimed, under the write lock, so
        // nothing else refers to it.
        unsafe {
            segment.link_and_make_executable(
                offset,
                &stubs.bytes,
                &stubs.link_data,
                &self.symbols,
                self.trap_code,
            )?;
        }

        let mut metadata = stubs.metadata;
        metadata.funcs = 0..0;
        metadata.offset_by(u32::try_from(offset)?);
        let block = CodeBlock::new(
            CodeBlockKind::LazyStubs,
            segment,
            offset..offset + stubs.bytes.len(),
            metadata,
        )?;
        block.initialize(self.me.clone());
        let index = self.add_block(data, Arc::new(block))?;
        Ok((index, entries))
    }

    fn callee(&self, tier: &CodeBlock, func_index: u32) -> Result<usize> {
        tier.func_entry(func_index)
            .ok_or_else(|| format_err!("function {func_index} has no code in {:?}", tier.kind()))
    }

    // ---------------------------------------------------------------------
    // Jump tables

    /// The jump tables.
    pub fn jump_tables(&self) -> &JumpTables {
        &self.jump_tables
    }

    /// The tiering table, present only when compiling in
    /// [`CompileMode::Tiering`].
    pub fn tiering_jump_table(&self) -> Option<&[AtomicUsize]> {
        match self.config.mode {
            CompileMode::Tiering => Some(self.jump_tables.tiering()),
            CompileMode::Once => None,
        }
    }

    /// See [`JumpTables::set_jit_entry_if_null`].
    pub fn set_jit_entry_if_null(&self, func_index: u32, target: usize) -> usize {
        self.jump_tables
            .set_jit_entry_if_null(func_index as usize, target)
    }

    /// See [`JumpTables::address_of_jit_entry`].
    pub fn address_of_jit_entry(&self, func_index: u32) -> &AtomicUsize {
        self.jump_tables.address_of_jit_entry(func_index as usize)
    }

    // ---------------------------------------------------------------------
    // Metadata lookups

    /// Where the signal handler redirects the pc of a trapping instruction.
    pub fn trap_code(&self) -> Option<usize> {
        self.trap_code
    }

    /// The configuration this code was created with.
    pub fn config(&self) -> &CodeConfig {
        &self.config
    }

    /// Signatures of the imported functions.
    pub fn func_imports(&self) -> &[FuncImport] {
        &self.func_imports
    }

    /// The import `func_index`.
    pub fn func_import(&self, func_index: u32) -> &FuncImport {
        &self.func_imports[func_index as usize]
    }

    /// The export of `func_index` in the block currently providing it.
    ///
    /// # Panics
    ///
    /// Panics if `func_index` isn't exported.
    pub fn lookup_func_export(&self, func_index: u32) -> FuncExport {
        let block = self.func_code_block(func_index);
        *block.lookup_func_export(func_index).1
    }

    /// The block of this code containing `pc`.
    pub fn lookup_block(&self, pc: usize) -> Option<Arc<CodeBlock>> {
        let block = self.block_map.lookup(pc);
        if block.is_none() {
            log::trace!("no code block at {pc:#x}");
        }
        block
    }

    /// The call site whose return address is `pc`.
    pub fn lookup_call_site(&self, pc: usize) -> Option<CallSite> {
        self.lookup_block(pc)?.lookup_call_site(pc).copied()
    }

    /// The function body containing `pc`, borrowed from the tier holding it
    /// so that [`Code::lookup_function_tier`] can tell which tier that is.
    pub fn lookup_func_range(&self, pc: usize) -> Option<&CodeRange> {
        let tier2 = self.tier2.get().map(|tier2| &**tier2);
        [Some(&*self.tier1), tier2]
            .into_iter()
            .flatten()
            .find_map(|block| block.lookup_range(pc))
            .filter(|range| range.is_function())
    }

    /// The stack map for the return address `pc`.
    pub fn lookup_stack_map(&self, pc: usize) -> Option<StackMap> {
        self.lookup_block(pc)?.lookup_stack_map(pc).cloned()
    }

    /// The innermost try note covering the return address `pc`, along with
    /// the block it belongs to.
    pub fn lookup_try_note(&self, pc: usize) -> Option<(Arc<CodeBlock>, TryNote)> {
        let block = self.lookup_block(pc)?;
        let note = *block.lookup_try_note(pc)?;
        Some((block, note))
    }

    /// The trap raised by the faulting instruction at `pc`.
    pub fn lookup_trap(&self, pc: usize) -> Option<(Trap, BytecodeOffset)> {
        self.lookup_block(pc)?.lookup_trap(pc)
    }

    /// Special unwind behaviour at `pc`.
    pub fn lookup_unwind_info(&self, pc: usize) -> Option<CodeRangeUnwindInfo> {
        self.lookup_block(pc)?.lookup_unwind_info(pc).copied()
    }

    // ---------------------------------------------------------------------
    // Diagnostics

    /// Builds the profiling labels if `enabled` and they haven't been built
    /// yet.
    pub fn ensure_profiling_labels(&self, enabled: bool) {
        if !enabled {
            return;
        }
        let mut labels = self.profiling_labels.lock().unwrap();
        if !labels.is_empty() {
            return;
        }
        let num_funcs = self.jump_tables.num_funcs();
        labels.reserve_exact(num_funcs);
        let module_name = &self.module_name;
        for func_index in 0..num_funcs {
            let label = match self.func_names.get(func_index) {
                Some(name) if !name.is_empty() => format!("{name} ({module_name}:{func_index})"),
                _ => format!("wasm-function[{func_index}] ({module_name}:{func_index})"),
            };
            labels.push(label);
        }
    }

    /// The profiling label of `func_index`, or `"?"` if labels haven't been
    /// built.
    pub fn profiling_label(&self, func_index: u32) -> String {
        let labels = self.profiling_labels.lock().unwrap();
        match labels.get(func_index as usize) {
            Some(label) => label.clone(),
            None => "?".to_string(),
        }
    }

    /// Dumps the code ranges of `tier` whose kind is in `kinds`.
    pub fn disassemble(&self, tier: Tier, kinds: CodeRangeKinds, print: &mut dyn FnMut(&str)) {
        self.code_block(tier).disassemble(kinds, print);
    }

    /// Bytes used by each kind of metadata across every block, plus the code
    /// itself and the jump tables.
    pub fn metadata_analysis(&self) -> BTreeMap<&'static str, usize> {
        let mut sizes = BTreeMap::new();
        let data = self.data.read().unwrap();
        for block in data.blocks.iter() {
            block.add_metadata_sizes(&mut sizes);
            *sizes.entry("code").or_default() += block.len();
        }
        sizes.insert("jump_tables", self.jump_tables.size_of_misc());
        sizes.insert("func_imports", size_of_val(self.func_imports.as_slice()));
        sizes
    }

    /// Executable memory reserved for the shared stubs and the first tier.
    pub fn tier1_code_memory_used(&self) -> usize {
        self.shared_stubs.segment().capacity() + self.tier1.segment().capacity()
    }

    /// Number of blocks owned, including stub blocks.
    pub fn num_blocks(&self) -> usize {
        self.data.read().unwrap().blocks.len()
    }

    /// Number of lazy-stub segments allocated.
    pub fn num_lazy_segments(&self) -> usize {
        self.data.read().unwrap().lazy_segments.len()
    }

    pub(crate) fn module_name(&self) -> &str {
        &self.module_name
    }

    pub(crate) fn func_names(&self) -> &[String] {
        &self.func_names
    }
}

impl Drop for Code {
    fn drop(&mut self) {
        let data = self.data.get_mut().unwrap_or_else(|e| e.into_inner());
        for block in data.blocks.iter().filter(|b| !b.is_empty()) {
            registry::unregister(block);
        }
        log::debug!("dropped code for `{}`", self.module_name);
    }
}

impl core::fmt::Debug for Code {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Code")
            .field("module_name", &self.module_name)
            .field("best_tier", &self.best_tier())
            .field("num_funcs", &self.jump_tables.num_funcs())
            .finish_non_exhaustive()
    }
}

fn lookup_lazy_interp_entry(data: &ProtectedData, func_index: u32) -> Option<usize> {
    let index = data
        .lazy_exports
        .binary_search_by_key(&func_index, |e| e.func_index)
        .ok()?;
    let export = &data.lazy_exports[index];
    let block = &data.blocks[export.lazy_stub_block_index];
    Some(block.address_of(block.code_range(export.func_code_range_index).begin))
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Code>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CodeBlockMetadata;
    use crate::stubs::CompiledStubs;

    struct NoStubs;

    impl EntryStubCompiler for NoStubs {
        fn compile_entry_stubs(
            &self,
            _tier: &CodeBlock,
            _requests: &[EntryStubRequest],
        ) -> Result<CompiledStubs> {
            bail!("no stubs here")
        }
    }

    fn compiled(
        kind: CodeBlockKind,
        funcs: core::ops::Range<u32>,
        code_ranges: Vec<CodeRange>,
        func_exports: Vec<FuncExport>,
    ) -> CompiledCodeBlock {
        CompiledCodeBlock {
            kind,
            bytes: vec![0xcc; 0x200],
            metadata: CodeBlockMetadata {
                funcs,
                code_ranges,
                func_exports,
                ..CodeBlockMetadata::default()
            },
        }
    }

    fn code(mode: CompileMode) -> Arc<Code> {
        let symbols = SymbolTable::new();
        let mut link_data = LinkData::new();
        link_data.trap_offset = 0x10;
        let stubs = compiled(
            CodeBlockKind::SharedStubs,
            0..1,
            vec![
                CodeRange::new(CodeRangeKind::ImportInterpExit, Some(0), 0x00..0x10),
                CodeRange::new(CodeRangeKind::TrapExit, None, 0x10..0x20),
            ],
            Vec::new(),
        );
        let stubs = CodeBlock::from_compiled(&stubs, &link_data, &symbols, None, false).unwrap();
        let tier1 = compiled(
            CodeBlockKind::BaselineTier,
            1..3,
            vec![
                CodeRange::function(1, 0x00..0x40, 0x08),
                CodeRange::new(CodeRangeKind::InterpEntry, Some(1), 0x40..0x50),
                CodeRange::function(2, 0x50..0x90, 0x58),
            ],
            vec![
                FuncExport {
                    func_index: 1,
                    type_index: 0,
                    eager_interp_entry: Some(1),
                },
                FuncExport {
                    func_index: 2,
                    type_index: 0,
                    eager_interp_entry: None,
                },
            ],
        );
        let tier1 =
            CodeBlock::from_compiled(&tier1, &LinkData::new(), &symbols, Some(&stubs), false)
                .unwrap();
        let mut config = CodeConfig::new();
        config.mode(mode);
        Code::new(
            config,
            symbols,
            Arc::new(NoStubs),
            CodeParts {
                func_imports: vec![FuncImport { type_index: 3 }],
                shared_stubs: stubs,
                tier1,
                module_name: "m".to_string(),
                func_names: vec![String::new(), "f".to_string()],
            },
        )
        .unwrap()
    }

    #[test]
    fn construction() {
        let code = code(CompileMode::Tiering);
        assert!(!code.has_tier2());
        assert_eq!(code.best_tier(), Tier::Baseline);
        assert_eq!(code.stable_tier(), Tier::Baseline);
        assert_eq!(code.num_blocks(), 2);
        assert_eq!(code.trap_code(), Some(code.shared_stubs().base() + 0x10));
        assert_eq!(code.func_import(0).type_index, 3);
        assert!(code.tier1.code().is_some());
        assert_eq!(code.func_code_block(0).kind(), CodeBlockKind::SharedStubs);
        assert!(code.func_has_tier(2, Tier::Baseline));

        let tiering = code.tiering_jump_table().unwrap();
        assert_eq!(
            tiering[2].load(Ordering::Relaxed),
            code.code_block(Tier::Baseline).base() + 0x58
        );
    }

    #[test]
    fn eager_entry_skips_the_stub_compiler() {
        let code = code(CompileMode::Once);
        assert!(code.tiering_jump_table().is_none());
        let (export, entry) = code.get_or_create_interp_entry(1).unwrap();
        assert_eq!(export.func_index, 1);
        assert_eq!(entry, code.tier1.base() + 0x40);
    }

    #[test]
    fn stub_failure_is_recoverable() {
        let code = code(CompileMode::Once);
        let err = code.get_or_create_interp_entry(2).unwrap_err();
        assert!(format!("{err:?}").contains("no stubs here"));
        assert_eq!(code.num_blocks(), 2);
        assert_eq!(code.jump_tables().jit_entry(2), None);
    }

    #[test]
    fn lookups() {
        let code = code(CompileMode::Once);
        let base = code.tier1.base();
        let range = code.lookup_func_range(base + 0x60).unwrap();
        assert_eq!(range.func_index, Some(2));
        assert!(code.lookup_func_range(base + 0x44).is_none());
        assert!(code.lookup_block(base + 0x1ff).is_some());
        assert!(code.lookup_block(base + 0x200).is_none());
        assert!(crate::registry::is_wasm_pc(base));

        assert_eq!(code.lookup_function_tier(range), Some(Tier::Baseline));
        let copied = *range;
        assert_eq!(code.lookup_function_tier(&copied), None);
    }

    #[test]
    fn profiling_labels() {
        let code = code(CompileMode::Once);
        assert_eq!(code.profiling_label(1), "?");
        code.ensure_profiling_labels(true);
        assert_eq!(code.profiling_label(1), "f (m:1)");
        assert_eq!(code.profiling_label(2), "wasm-function[2] (m:2)");
        assert_eq!(code.profiling_label(7), "?");
    }

    #[test]
    fn analysis() {
        let code = code(CompileMode::Tiering);
        let sizes = code.metadata_analysis();
        assert_eq!(sizes["code"], 0x400);
        assert_eq!(sizes["code_ranges"], 5 * size_of::<CodeRange>());
        assert_eq!(sizes["jump_tables"], 6 * size_of::<usize>());
    }

    #[test]
    fn drop_unregisters() {
        let code = code(CompileMode::Once);
        let base = code.tier1.base();
        assert!(crate::registry::is_wasm_pc(base));
        drop(code);
        assert!(!crate::registry::is_wasm_pc(base));
    }
}
