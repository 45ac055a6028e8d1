//! The process-wide map of every registered [`CodeBlock`].
//!
//! Signal handlers and profilers only have a pc to go on. They consult this
//! map to find out whether the pc is in Wasm code and, if so, which block
//! describes it. Blocks are added by [`Code`](crate::Code) as they're
//! created and removed when it's dropped.

use crate::block::CodeBlock;
use crate::block_map::ThreadSafeCodeBlockMap;
use crate::metadata::CodeRange;
use crate::prelude::*;
use std::sync::{Arc, OnceLock};

fn global_code() -> &'static ThreadSafeCodeBlockMap<CodeBlock> {
    static GLOBAL_CODE: OnceLock<ThreadSafeCodeBlockMap<CodeBlock>> = OnceLock::new();
    GLOBAL_CODE.get_or_init(ThreadSafeCodeBlockMap::new)
}

/// Adds `block` to the process-wide map.
pub(crate) fn register(block: &Arc<CodeBlock>) -> Result<()> {
    if block.is_empty() {
        return Ok(());
    }
    global_code()
        .insert(block.clone())
        .context("failed to register code block")?;
    log::debug!(
        "registered {:?} block at {:#x}..{:#x}",
        block.kind(),
        block.base(),
        block.base() + block.len()
    );
    Ok(())
}

/// Removes `block` from the process-wide map.
pub(crate) fn unregister(block: &CodeBlock) {
    if block.is_empty() {
        return;
    }
    global_code().remove(block);
    log::debug!(
        "unregistered {:?} block at {:#x}",
        block.kind(),
        block.base()
    );
}

/// Returns the registered block containing `pc`.
pub fn lookup_code_block(pc: usize) -> Option<Arc<CodeBlock>> {
    global_code().lookup(pc)
}

/// Returns the registered block containing `pc` and the code range within it.
pub fn lookup_code_range(pc: usize) -> Option<(Arc<CodeBlock>, Option<CodeRange>)> {
    global_code().lookup_with_range(pc)
}

/// Returns whether `pc` is in registered Wasm code.
pub fn is_wasm_pc(pc: usize) -> bool {
    global_code().lookup(pc).is_some()
}
