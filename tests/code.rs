use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wasmtime_code::*;

const NUM_FUNCS: u32 = 9;

/// Emits a 0x10-byte interpreter entry followed by a 0x10-byte jit entry for
/// every request. Each interpreter entry starts with a pointer-sized
/// reference to the trap handler.
#[derive(Default)]
struct FakeStubCompiler {
    calls: AtomicUsize,
    fail_optimized: AtomicBool,
    requests: Mutex<Vec<EntryStubRequest>>,
}

impl EntryStubCompiler for FakeStubCompiler {
    fn compile_entry_stubs(
        &self,
        tier: &CodeBlock,
        requests: &[EntryStubRequest],
    ) -> Result<CompiledStubs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if tier.kind() == CodeBlockKind::OptimizedTier && self.fail_optimized.load(Ordering::SeqCst)
        {
            return Err(CodeError::OutOfMemory { bytes: 0x1000 }.into());
        }
        self.requests.lock().unwrap().extend_from_slice(requests);

        let mut stubs = CompiledStubs::default();
        for (i, request) in requests.iter().enumerate() {
            let begin = u32::try_from(i * 0x20).unwrap();
            stubs.metadata.code_ranges.push(CodeRange::new(
                CodeRangeKind::InterpEntry,
                Some(request.func_index),
                begin..begin + 0x10,
            ));
            stubs.metadata.code_ranges.push(CodeRange::new(
                CodeRangeKind::JitEntry,
                Some(request.func_index),
                begin + 0x10..begin + 0x20,
            ));
            stubs
                .link_data
                .push_symbolic_link(SymbolicAddress::HandleTrap, begin);
        }
        stubs.bytes = vec![0xcc; requests.len() * 0x20];
        Ok(stubs)
    }
}

struct Module {
    shared_stubs: CompiledCodeBlock,
    shared_stubs_link_data: LinkData,
    tier1: CompiledCodeBlock,
    tier1_link_data: LinkData,
}

/// Function `f` occupies `f * stride..f * stride + stride`, with an extra
/// interpreter entry for function 1 after the last function.
fn tier(kind: CodeBlockKind, stride: u32) -> CompiledCodeBlock {
    let mut metadata = CodeBlockMetadata {
        funcs: 1..NUM_FUNCS,
        ..CodeBlockMetadata::default()
    };
    for f in 1..NUM_FUNCS {
        let begin = f * stride;
        metadata
            .code_ranges
            .push(CodeRange::function(f, begin..begin + stride, begin + 8));
        metadata.func_exports.push(FuncExport {
            func_index: f,
            type_index: 0,
            eager_interp_entry: None,
        });
    }
    let eager = NUM_FUNCS * stride;
    metadata.code_ranges.push(CodeRange::new(
        CodeRangeKind::InterpEntry,
        Some(1),
        eager..eager + 0x10,
    ));
    metadata.func_exports[0].eager_interp_entry = Some(NUM_FUNCS - 1);

    let call = 2 * stride + 0x10;
    metadata.call_sites.push(CallSite {
        return_address_offset: call,
        kind: CallSiteKind::Func,
        bytecode: BytecodeOffset(0x33),
    });
    metadata.trap_sites.push(TrapSite {
        pc_offset: call + 4,
        trap: Trap::OutOfBounds,
        bytecode: BytecodeOffset(0x34),
    });

    CompiledCodeBlock {
        kind,
        bytes: vec![0x90; (eager + 0x10) as usize],
        metadata,
    }
}

fn module() -> Module {
    let shared_stubs = CompiledCodeBlock {
        kind: CodeBlockKind::SharedStubs,
        bytes: vec![0xcc; 0x20],
        metadata: CodeBlockMetadata {
            funcs: 0..1,
            code_ranges: vec![
                CodeRange::new(CodeRangeKind::ImportInterpExit, Some(0), 0x00..0x10),
                CodeRange::new(CodeRangeKind::TrapExit, None, 0x10..0x20),
            ],
            ..CodeBlockMetadata::default()
        },
    };
    let mut shared_stubs_link_data = LinkData::new();
    shared_stubs_link_data.trap_offset = 0x10;

    let mut tier1_link_data = LinkData::new();
    tier1_link_data.push_internal_link(0x50, 0x80);
    tier1_link_data.push_symbolic_link(SymbolicAddress::MemoryGrow, 0x60);

    // Unlinked patch sites hold their placeholders.
    let mut tier1 = tier(CodeBlockKind::BaselineTier, 0x40);
    const PTR: usize = size_of::<usize>();
    tier1.bytes[0x50..0x50 + PTR].copy_from_slice(&0x80usize.to_ne_bytes());
    tier1.bytes[0x60..0x60 + PTR].copy_from_slice(&SYMBOLIC_PLACEHOLDER.to_ne_bytes());

    Module {
        shared_stubs,
        shared_stubs_link_data,
        tier1,
        tier1_link_data,
    }
}

fn symbols() -> SymbolTable {
    let mut symbols = SymbolTable::new();
    symbols.define(SymbolicAddress::MemoryGrow, 0xdead_beef);
    symbols
}

fn code(module: &Module, config: CodeConfig, stubs: Arc<FakeStubCompiler>) -> Arc<Code> {
    let _ = env_logger::try_init();
    let symbols = symbols();
    let shared_stubs = CodeBlock::from_compiled(
        &module.shared_stubs,
        &module.shared_stubs_link_data,
        &symbols,
        None,
        false,
    )
    .unwrap();
    let tier1 = CodeBlock::from_compiled(
        &module.tier1,
        &module.tier1_link_data,
        &symbols,
        Some(&shared_stubs),
        false,
    )
    .unwrap();
    Code::new(
        config,
        symbols,
        stubs,
        CodeParts {
            func_imports: vec![FuncImport { type_index: 0 }],
            shared_stubs,
            tier1,
            module_name: "test".to_string(),
            func_names: vec!["import".to_string(), "start".to_string()],
        },
    )
    .unwrap()
}

fn tiering() -> CodeConfig {
    let mut config = CodeConfig::new();
    config.mode(CompileMode::Tiering);
    config
}

fn load(bytes: &[u8], config: CodeConfig) -> Result<Arc<Code>> {
    // SAFETY: the code in these images is never called.
    unsafe {
        Code::deserialize(
            bytes,
            config,
            symbols(),
            Arc::new(FakeStubCompiler::default()),
        )
    }
}

fn read_usize(addr: usize) -> usize {
    unsafe { std::ptr::read_unaligned(addr as *const usize) }
}

#[test]
fn first_tier_is_linked() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let base = code.code_block(Tier::Baseline).base();
    assert_eq!(read_usize(base + 0x50), base + 0x80);
    assert_eq!(read_usize(base + 0x60), 0xdead_beef);
    assert_eq!(code.trap_code(), Some(code.shared_stubs().base() + 0x10));
}

#[test]
fn concurrent_interp_entries_create_one_stub() {
    let module = module();
    let stubs = Arc::new(FakeStubCompiler::default());
    let code = code(&module, CodeConfig::new(), stubs.clone());

    let entries = std::thread::scope(|s| {
        let handles = (0..8)
            .map(|_| s.spawn(|| code.get_or_create_interp_entry(7).unwrap()))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let (export, entry) = entries[0];
    assert_eq!(export.func_index, 7);
    assert!(entries.iter().all(|&(_, e)| e == entry));
    assert_eq!(stubs.calls.load(Ordering::SeqCst), 1);
    assert_eq!(code.num_blocks(), 3);

    let requests = stubs.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].callee,
        code.code_block(Tier::Baseline).func_entry(7).unwrap()
    );

    let block = code.lookup_block(entry).unwrap();
    assert_eq!(block.kind(), CodeBlockKind::LazyStubs);
    assert!(Arc::ptr_eq(&block.code().unwrap(), &code));
    assert_eq!(code.jump_tables().jit_entry(7), Some(entry + 0x10));
    assert_eq!(read_usize(entry), code.trap_code().unwrap());

    let (_, range) = lookup_code_range(entry).unwrap();
    let range = range.unwrap();
    assert_eq!(range.kind, CodeRangeKind::InterpEntry);
    assert_eq!(range.func_index, Some(7));
}

#[test]
fn eager_entries_need_no_stub() {
    let module = module();
    let stubs = Arc::new(FakeStubCompiler::default());
    let code = code(&module, CodeConfig::new(), stubs.clone());
    let (_, entry) = code.get_or_create_interp_entry(1).unwrap();
    assert_eq!(entry, code.code_block(Tier::Baseline).base() + 9 * 0x40);
    assert_eq!(stubs.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn stubs_share_lazy_segments() {
    let module = module();
    let mut config = CodeConfig::new();
    config.lazy_stub_segment_size(16 * host_page_size());
    let code = code(&module, config, Arc::default());
    let a = code.get_or_create_interp_entry(2).unwrap().1;
    let b = code.get_or_create_interp_entry(3).unwrap().1;
    let c = code.get_or_create_interp_entry(4).unwrap().1;
    assert_eq!(code.num_lazy_segments(), 1);
    assert_eq!(b - a, host_page_size());
    assert_eq!(c - b, host_page_size());
    assert_eq!(code.get_or_create_interp_entry(3).unwrap().1, b);
}

#[test]
fn small_lazy_segments_fill_up() {
    let module = module();
    let mut config = CodeConfig::new();
    config.lazy_stub_segment_size(0);
    let code = code(&module, config, Arc::default());
    for f in 2..5 {
        code.get_or_create_interp_entry(f).unwrap();
    }
    assert_eq!(code.num_lazy_segments(), 3);
}

#[test]
fn metadata_lookups() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let base = code.code_block(Tier::Baseline).base();

    let site = code.lookup_call_site(base + 0x90).unwrap();
    assert_eq!(site.bytecode, BytecodeOffset(0x33));
    assert!(code.lookup_call_site(base + 0x91).is_none());
    assert_eq!(
        code.lookup_trap(base + 0x94),
        Some((Trap::OutOfBounds, BytecodeOffset(0x34)))
    );
    assert!(code.lookup_stack_map(base + 0x90).is_none());
    assert!(code.lookup_try_note(base + 0x90).is_none());

    let range = code.lookup_func_range(base + 0x90).unwrap();
    assert_eq!(range.func_index, Some(2));
    assert_eq!(code.lookup_function_tier(range), Some(Tier::Baseline));
    assert!(code.lookup_func_range(base + 9 * 0x40).is_none());
    assert!(code.lookup_block(base + 0x250).is_none());
    assert!(is_wasm_pc(base + 0x40));
}

#[test]
fn tier2_failure_keeps_tier1_running() {
    let module = module();
    let stubs = Arc::new(FakeStubCompiler::default());
    let code = code(&module, tiering(), stubs.clone());
    let (_, entry) = code.get_or_create_interp_entry(2).unwrap();
    let tiering_before = code.tiering_jump_table().unwrap()[3].load(Ordering::SeqCst);

    stubs.fail_optimized.store(true, Ordering::SeqCst);
    let tier2 = tier(CodeBlockKind::OptimizedTier, 0x60);
    let err = code
        .finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap_err();
    assert!(CodeError::is_out_of_memory(&err), "{err:?}");

    assert!(!code.has_tier2());
    assert_eq!(code.best_tier(), Tier::Baseline);
    assert!(code.func_has_tier(3, Tier::Baseline));
    assert_eq!(code.get_or_create_interp_entry(2).unwrap().1, entry);
    assert_eq!(
        code.tiering_jump_table().unwrap()[3].load(Ordering::SeqCst),
        tiering_before
    );
    assert_eq!(code.num_blocks(), 3);

    // A later attempt may still succeed.
    stubs.fail_optimized.store(false, Ordering::SeqCst);
    code.finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap();
    assert!(code.has_tier2());
}

#[test]
fn tier2_is_published_once() {
    let module = module();
    let stubs = Arc::new(FakeStubCompiler::default());
    let code = code(&module, tiering(), stubs.clone());
    let (_, old_entry) = code.get_or_create_interp_entry(2).unwrap();
    let jit_before = code.jump_tables().jit_entry(2).unwrap();

    let tier2 = tier(CodeBlockKind::OptimizedTier, 0x60);
    code.finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap();

    assert!(code.has_tier2());
    assert_eq!(code.best_tier(), Tier::Optimized);
    assert_eq!(code.stable_tier(), Tier::Baseline);
    assert!(code.has_tier(Tier::Optimized));
    assert!(code.func_has_tier(5, Tier::Optimized));

    let optimized = code.code_block(Tier::Optimized);
    assert_eq!(
        code.tiering_jump_table().unwrap()[3].load(Ordering::SeqCst),
        optimized.base() + 3 * 0x60 + 8
    );

    // The lazy stub of function 2 was recompiled to call the new tier.
    let (_, new_entry) = code.get_or_create_interp_entry(2).unwrap();
    assert_ne!(new_entry, old_entry);
    let requests = stubs.requests.lock().unwrap().clone();
    assert_eq!(
        requests.last().unwrap().callee,
        optimized.func_entry(2).unwrap()
    );
    // Installed jit entries never change.
    assert_eq!(code.jump_tables().jit_entry(2), Some(jit_before));

    let range = code.lookup_func_range(optimized.base() + 4 * 0x60).unwrap();
    assert_eq!(range.func_index, Some(4));
    assert_eq!(code.lookup_function_tier(range), Some(Tier::Optimized));
    let tier1_pc = code.code_block(Tier::Baseline).base() + 4 * 0x40;
    let range = code.lookup_func_range(tier1_pc).unwrap();
    assert_eq!(code.lookup_function_tier(range), Some(Tier::Baseline));

    let err = code
        .finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<CodeError>(),
        Some(&CodeError::Tier2AlreadyInstalled)
    );
}

#[test]
fn racing_tier2_installs_publish_once() {
    let module = module();
    let code = code(&module, tiering(), Arc::default());
    let tier2 = tier(CodeBlockKind::OptimizedTier, 0x60);

    let results = std::thread::scope(|s| {
        let handles = (0..4)
            .map(|_| s.spawn(|| code.finish_complete_tier2(&LinkData::new(), &tier2)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(
            err.downcast_ref::<CodeError>(),
            Some(&CodeError::Tier2AlreadyInstalled)
        );
    }
    assert!(code.has_tier2());
    assert_eq!(code.num_blocks(), 3);
}

#[test]
fn import_stubs_survive_tier2() {
    let mut module = module();
    module.shared_stubs.metadata.func_exports.push(FuncExport {
        func_index: 0,
        type_index: 0,
        eager_interp_entry: None,
    });
    let stubs = Arc::new(FakeStubCompiler::default());
    let code = code(&module, tiering(), stubs.clone());

    let (export, import_entry) = code.get_or_create_interp_entry(0).unwrap();
    assert_eq!(export.func_index, 0);
    let (_, entry) = code.get_or_create_interp_entry(2).unwrap();
    assert_eq!(
        stubs.requests.lock().unwrap()[0].callee,
        code.shared_stubs().func_entry(0).unwrap()
    );

    let tier2 = tier(CodeBlockKind::OptimizedTier, 0x60);
    code.finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap();
    assert!(code.has_tier2());

    // Only the stub of the defined function is recompiled.
    let requests = stubs.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].func_index, 2);

    assert_eq!(code.get_or_create_interp_entry(0).unwrap().1, import_entry);
    assert_ne!(code.get_or_create_interp_entry(2).unwrap().1, entry);
    let (export, _) = code.get_or_create_interp_entry(3).unwrap();
    assert_eq!(export.func_index, 3);
}

#[test]
fn lookups_race_tier2_installation() {
    let module = module();
    let code = code(&module, tiering(), Arc::default());
    let tier1_pc = code.code_block(Tier::Baseline).base() + 0x90;
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    assert!(code.lookup_call_site(tier1_pc).is_some());
                    let tier = code.best_tier();
                    let block = code.code_block(tier);
                    assert_eq!(block.tier(), tier);
                }
            });
        }
        let tier2 = tier(CodeBlockKind::OptimizedTier, 0x60);
        code.finish_complete_tier2(&LinkData::new(), &tier2)
        .unwrap();
        done.store(true, Ordering::SeqCst);
    });
    assert!(code.has_tier2());
}

#[test]
fn serialize_round_trip() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let bytes = code
        .serialize(
            &module.shared_stubs_link_data,
            Tier::Baseline,
            &module.tier1_link_data,
        )
        .unwrap();

    let loaded = load(&bytes, CodeConfig::new()).unwrap();
    let tier1 = loaded.code_block(Tier::Baseline);
    assert_eq!(tier1.metadata(), &module.tier1.metadata);
    assert_eq!(read_usize(tier1.base() + 0x50), tier1.base() + 0x80);
    assert_eq!(read_usize(tier1.base() + 0x60), 0xdead_beef);
    assert_eq!(
        tier1
            .segment()
            .unlinked_bytes(tier1.segment_range(), &module.tier1_link_data)
            .unwrap(),
        module.tier1.bytes
    );
    assert_eq!(loaded.func_imports(), code.func_imports());

    loaded.ensure_profiling_labels(true);
    assert_eq!(loaded.profiling_label(1), "start (test:1)");

    let (_, entry) = loaded.get_or_create_interp_entry(6).unwrap();
    assert!(loaded.lookup_block(entry).is_some());
}

#[test]
fn bad_images_are_rejected() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let mut bytes = code
        .serialize(
            &module.shared_stubs_link_data,
            Tier::Baseline,
            &module.tier1_link_data,
        )
        .unwrap();

    let reject = |bytes: &[u8]| load(bytes, CodeConfig::new()).unwrap_err();
    let truncated = reject(&bytes[..bytes.len() / 2]);
    assert!(matches!(
        truncated.downcast_ref::<CodeError>(),
        Some(CodeError::Deserialize(_))
    ));
    assert!(reject(&[]).to_string().contains("empty image"));

    let err = load(&bytes, tiering()).unwrap_err();
    assert!(err.to_string().contains("compile mode Once"), "{err}");

    bytes[0] = 0xff;
    assert!(reject(&bytes).to_string().contains("unsupported version"));
}

#[test]
fn dropping_code_unregisters_blocks() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let (_, stub) = code.get_or_create_interp_entry(2).unwrap();
    let tier1_pc = code.code_block(Tier::Baseline).base();
    // Holding the blocks keeps their memory from being reused by other tests.
    let tier1 = code.lookup_block(tier1_pc).unwrap();
    let _stubs = code.lookup_block(stub).unwrap();
    assert!(is_wasm_pc(stub));
    assert!(is_wasm_pc(tier1_pc));

    drop(code);
    assert!(!is_wasm_pc(stub));
    assert!(!is_wasm_pc(tier1_pc));
    assert!(tier1.code().is_none());
}

#[test]
fn disassemble_selected_kinds() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let mut headers = 0;
    code.disassemble(Tier::Baseline, CodeRangeKinds::INTERP_ENTRY, &mut |line| {
        if !line.starts_with(' ') {
            assert!(line.starts_with("InterpEntry func[1] 0x"), "{line}");
            headers += 1;
        }
    });
    assert_eq!(headers, 1);
}

#[test]
fn metadata_analysis_counts_every_block() {
    let module = module();
    let code = code(&module, CodeConfig::new(), Arc::default());
    let before = code.metadata_analysis();
    code.get_or_create_interp_entry(2).unwrap();
    let after = code.metadata_analysis();
    assert_eq!(
        after["code_ranges"],
        before["code_ranges"] + 2 * size_of::<CodeRange>()
    );
    assert_eq!(after["code"], before["code"] + 0x20);
    assert!(code.tier1_code_memory_used() >= 0x20 + 10 * 0x40);
}
