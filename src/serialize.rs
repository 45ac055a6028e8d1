//! Saving compiled code to bytes and loading it back.
//!
//! The image holds the unlinked bytes and metadata of the shared stubs and of
//! one tier, along with the link data needed to relink them. Lazily created
//! stubs aren't saved; they're recreated on demand after loading.
//!
//! The format is [`postcard`] preceded by a version byte, and is only
//! meaningful to the same build of this crate. The settings the code was
//! compiled under are saved too, and loading checks them against the host's.

use crate::block::{CodeBlock, CodeBlockKind, CompiledCodeBlock, Tier};
use crate::code::{Code, CodeParts};
use crate::config::{CodeConfig, CompileMode};
use crate::error::CodeError;
use crate::link::{LinkData, SymbolTable};
use crate::metadata::{CodeRangeKind, FuncImport};
use crate::prelude::*;
use crate::stubs::EntryStubCompiler;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

const VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct SerializedCode {
    config: CodeConfig,
    func_imports: Vec<FuncImport>,
    module_name: String,
    func_names: Vec<String>,
    shared_stubs: CompiledCodeBlock,
    shared_stubs_link_data: LinkData,
    tier: CompiledCodeBlock,
    tier_link_data: LinkData,
}

fn unlinked(block: &CodeBlock, link_data: &LinkData) -> Result<CompiledCodeBlock> {
    // Only blocks with a segment of their own are saved, so segment offsets
    // and buffer offsets coincide.
    let range = block.segment_range();
    assert_eq!(range.start, 0, "{:?} block shares a segment", block.kind());
    Ok(CompiledCodeBlock {
        kind: block.kind(),
        bytes: block.segment().unlinked_bytes(range, link_data)?,
        metadata: block.metadata().clone(),
    })
}

impl SerializedCode {
    fn check_compatible(&self, config: &CodeConfig) -> Result<(), String> {
        check_mode(self.config.mode, config.mode)?;
        check_bool(
            self.config.branch_protection,
            config.branch_protection,
            "branch protection",
        )?;

        let stubs_funcs = &self.shared_stubs.metadata.funcs;
        let num_funcs = stubs_funcs.end.max(self.tier.metadata.funcs.end);
        check_block(&self.shared_stubs, CodeBlockKind::SharedStubs, num_funcs)?;
        let expected_tier = match self.tier.kind {
            CodeBlockKind::OptimizedTier => CodeBlockKind::OptimizedTier,
            _ => CodeBlockKind::BaselineTier,
        };
        check_block(&self.tier, expected_tier, num_funcs)?;

        let mut jit_entries = [&self.shared_stubs, &self.tier]
            .into_iter()
            .flat_map(|block| block.metadata.code_ranges.iter())
            .filter(|r| r.kind == CodeRangeKind::JitEntry)
            .filter_map(|r| r.func_index)
            .collect::<Vec<_>>();
        jit_entries.sort_unstable();
        if let Some(w) = jit_entries.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("function {} has two jit entries", w[0]));
        }

        let trap_offset = self.shared_stubs_link_data.trap_offset as usize;
        let len = self.shared_stubs.bytes.len();
        if len > 0 && trap_offset >= len {
            return Err(format!("trap exit {trap_offset:#x} out of bounds"));
        }
        Ok(())
    }
}

fn check_mode(found: CompileMode, expected: CompileMode) -> Result<(), String> {
    if found == expected {
        return Ok(());
    }
    Err(format!(
        "code was compiled with compile mode {found:?} but {expected:?} is expected for the host"
    ))
}

fn check_bool(found: bool, expected: bool, feature: &str) -> Result<(), String> {
    if found == expected {
        return Ok(());
    }
    Err(format!(
        "code was compiled {} {feature} but it is {} for the host",
        if found { "with" } else { "without" },
        if expected { "enabled" } else { "not enabled" },
    ))
}

/// Rejects a block whose tables `CodeBlock::new` and `JumpTables::new`
/// would panic on.
fn check_block(
    block: &CompiledCodeBlock,
    kind: CodeBlockKind,
    num_funcs: u32,
) -> Result<(), String> {
    if block.kind != kind {
        return Err(format!("expected a {kind:?} block, found {:?}", block.kind));
    }
    let metadata = &block.metadata;
    let len = u32::try_from(block.bytes.len())
        .map_err(|_| format!("{kind:?} block too large"))?;
    metadata
        .check_sorted()
        .map_err(|e| format!("{kind:?}: {e}"))?;
    metadata
        .check_bounds(len)
        .map_err(|e| format!("{kind:?}: {e}"))?;

    let funcs = metadata.funcs.clone();
    let out_of_range = metadata
        .code_ranges
        .iter()
        .filter_map(|r| r.func_index)
        .chain(metadata.func_exports.iter().map(|e| e.func_index))
        .find(|&i| i >= num_funcs);
    if let Some(func_index) = out_of_range {
        return Err(format!("{kind:?}: function {func_index} out of range"));
    }
    if funcs.start > funcs.end || funcs.len() > metadata.code_ranges.len() {
        return Err(format!("{kind:?}: bad function range {funcs:?}"));
    }

    let mut covered = vec![false; funcs.len()];
    let primary = kind.primary_range_kind();
    for range in metadata.code_ranges.iter().filter(|r| r.kind == primary) {
        if let Some(func_index) = range.func_index.filter(|i| funcs.contains(i)) {
            covered[(func_index - funcs.start) as usize] = true;
        }
    }
    if let Some(slot) = covered.iter().position(|&c| !c) {
        return Err(format!(
            "{kind:?}: function {} has no code range",
            funcs.start as usize + slot
        ));
    }
    Ok(())
}

impl Code {
    /// Saves the shared stubs and `tier` to a byte image.
    ///
    /// The link data must be what each block was linked with.
    ///
    /// # Panics
    ///
    /// Panics if `tier` isn't available.
    pub fn serialize(
        &self,
        shared_stubs_link_data: &LinkData,
        tier: Tier,
        tier_link_data: &LinkData,
    ) -> Result<Vec<u8>> {
        let image = SerializedCode {
            config: self.config().clone(),
            func_imports: self.func_imports().to_vec(),
            module_name: self.module_name().to_string(),
            func_names: self.func_names().to_vec(),
            shared_stubs: unlinked(self.shared_stubs(), shared_stubs_link_data)?,
            shared_stubs_link_data: shared_stubs_link_data.clone(),
            tier: unlinked(self.code_block(tier), tier_link_data)?,
            tier_link_data: tier_link_data.clone(),
        };
        postcard::to_extend(&image, vec![VERSION])
            .map_err(|e| format_err!("failed to serialize code: {e}"))
    }

    /// Loads an image produced by [`Code::serialize`], relinking it against
    /// `symbols`.
    ///
    /// The saved tier becomes the first tier of the new code. Images whose
    /// settings don't match `config`, or whose tables are inconsistent, are
    /// rejected with [`CodeError::Deserialize`].
    ///
    /// # Safety
    ///
    /// The machine code in `bytes` is made executable and will be run, and
    /// only its tables are checked. `bytes` must have been produced by
    /// [`Code::serialize`], or be otherwise trusted to contain valid code.
    pub unsafe fn deserialize(
        bytes: &[u8],
        config: CodeConfig,
        symbols: SymbolTable,
        stub_compiler: Arc<dyn EntryStubCompiler>,
    ) -> Result<Arc<Code>> {
        let image = match bytes.split_first() {
            Some((&VERSION, rest)) => postcard::from_bytes::<SerializedCode>(rest)
                .map_err(|e| CodeError::Deserialize(e.to_string()))?,
            Some((version, _)) => {
                return Err(CodeError::Deserialize(format!(
                    "unsupported version {version}, expected {VERSION}"
                ))
                .into());
            }
            None => return Err(CodeError::Deserialize("empty image".to_string()).into()),
        };
        log::debug!(
            "deserializing {:?} code for `{}`",
            image.tier.kind,
            image.module_name
        );
        image
            .check_compatible(&config)
            .map_err(CodeError::Deserialize)?;

        let shared_stubs = CodeBlock::from_compiled(
            &image.shared_stubs,
            &image.shared_stubs_link_data,
            &symbols,
            None,
            config.branch_protection,
        )?;
        let tier1 = CodeBlock::from_compiled(
            &image.tier,
            &image.tier_link_data,
            &symbols,
            Some(&shared_stubs),
            config.branch_protection,
        )?;
        Code::new(
            config,
            symbols,
            stub_compiler,
            CodeParts {
                func_imports: image.func_imports,
                shared_stubs,
                tier1,
                module_name: image.module_name,
                func_names: image.func_names,
            },
        )
    }
}
