//! Management of compiled WebAssembly code.
//!
//! > **⚠️ Warning ⚠️**: this crate is an internal-only crate for the Wasmtime
//! > project and is not intended for general use. APIs are not strictly
//! > reviewed for safety and usage outside of Wasmtime may have bugs. If
//! > you're interested in using this feel free to file an issue on the
//! > Wasmtime repository to start a discussion about doing so, but otherwise
//! > be aware that your usage of this crate is not supported.
//!
//! This crate owns the machine code of compiled modules once a compiler has
//! produced it:
//!
//! * [`CodeSegment`]s are slabs of executable memory. Code is copied in,
//!   statically linked against [`LinkData`] and made executable.
//! * [`CodeBlock`]s are one tier of a module, or a batch of stubs, together
//!   with the metadata tables that answer questions about a pc: which
//!   function is this, is this a call site, does this instruction trap.
//! * [`Code`] is the per-module owner of every block. It installs an
//!   optimized tier while the baseline tier keeps running, and creates entry
//!   stubs on demand.
//! * [`ThreadSafeCodeBlockMap`] maps a pc to a block without locking, and
//!   backs both the per-module and the process-wide registry.

#![deny(missing_docs)]

mod block;
mod block_map;
mod code;
mod config;
mod error;
mod jump_tables;
mod link;
mod metadata;
mod mmap;
mod registry;
mod segment;
mod serialize;
mod stubs;
mod sys;

pub use crate::block::{
    BAD_CODE_RANGE, CodeBlock, CodeBlockKind, CompiledCodeBlock, FuncToCodeRangeMap, Tier,
};
pub use crate::block_map::{CodeRegion, ThreadSafeCodeBlockMap};
pub use crate::code::{Code, CodeParts};
pub use crate::config::{CodeConfig, CompileMode};
pub use crate::error::CodeError;
pub use crate::jump_tables::JumpTables;
pub use crate::link::{
    InternalLink, LinkData, LinkMode, SYMBOLIC_PLACEHOLDER, SymbolTable, SymbolicAddress,
    SymbolicLinkArray, statically_link, statically_unlink,
};
pub use crate::metadata::*;
pub use crate::mmap::host_page_size;
pub use crate::registry::{is_wasm_pc, lookup_code_block, lookup_code_range};
pub use crate::segment::CodeSegment;
pub use crate::stubs::{CompiledStubs, EntryStubCompiler, EntryStubRequest};

pub use anyhow::{Error, Result};

mod prelude {
    pub use anyhow::{Context, Result, anyhow as format_err, bail};
}
