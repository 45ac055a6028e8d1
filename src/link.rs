//! Static linking of compiled code.
//!
//! The code generator emits machine code whose absolute addresses are not yet
//! known, along with a [`LinkData`] describing every place that needs to be
//! patched once the code lands at its final address. Patching happens exactly
//! once per code buffer, before the code becomes executable.
//!
//! Before linking, a patch site holds a placeholder: an internal link holds
//! its segment-relative target offset and a symbolic link holds
//! [`SYMBOLIC_PLACEHOLDER`]. [`statically_unlink`] writes those placeholders
//! back so a linked buffer can be persisted and re-linked elsewhere.

use crate::error::CodeError;
use crate::prelude::*;
use core::fmt;
use core::ops::{Index, IndexMut};
use serde_derive::{Deserialize, Serialize};

/// Value stored in a symbolic patch site while the code is unlinked.
pub const SYMBOLIC_PLACEHOLDER: usize = usize::MAX;

macro_rules! foreach_symbolic_address {
    ($mac:ident) => {
        $mac! {
            HandleTrap = "handle_trap",
            HandleThrow = "handle_throw",
            InterruptCheck = "interrupt_check",
            MemoryGrow = "memory_grow",
            MemorySize = "memory_size",
            MemoryFill = "memory_fill",
            MemoryCopy = "memory_copy",
            MemoryInit = "memory_init",
            DataDrop = "data_drop",
            TableGrow = "table_grow",
            TableGet = "table_get",
            TableSet = "table_set",
            TableFill = "table_fill",
            TableCopy = "table_copy",
            TableInit = "table_init",
            ElemDrop = "elem_drop",
            RefFunc = "ref_func",
            AtomicWait32 = "atomic_wait32",
            AtomicWait64 = "atomic_wait64",
            AtomicNotify = "atomic_notify",
        }
    };
}

macro_rules! define_symbolic_address {
    ($($name:ident = $str:literal,)*) => {
        /// A well-known runtime address that compiled code refers to by name.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum SymbolicAddress {
            $(
                #[doc = concat!("The `", $str, "` runtime entry point.")]
                $name,
            )*
        }

        impl SymbolicAddress {
            /// Every symbolic address, in declaration order.
            pub const ALL: &'static [SymbolicAddress] = &[$(SymbolicAddress::$name,)*];

            /// Number of distinct symbolic addresses.
            pub const COUNT: usize = SymbolicAddress::ALL.len();

            /// The symbol name of this address.
            pub fn name(self) -> &'static str {
                match self {
                    $(SymbolicAddress::$name => $str,)*
                }
            }
        }
    };
}

foreach_symbolic_address!(define_symbolic_address);

impl SymbolicAddress {
    fn index(self) -> usize {
        usize::from(self as u8)
    }
}

impl fmt::Display for SymbolicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How an internal link's patch site encodes its target.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    /// A pointer-sized absolute address.
    #[default]
    Absolute,
    /// A signed 32-bit displacement from the end of the 4-byte patch site.
    Relative32,
}

/// A reference from one place in a code segment to another.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLink {
    /// Segment-relative offset of the bytes to patch.
    pub patch_at_offset: u32,
    /// Segment-relative offset of the target.
    pub target_offset: u32,
    /// Encoding of the patch site.
    pub mode: LinkMode,
}

/// The patch sites of every [`SymbolicAddress`], indexed by address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u32>>", into = "Vec<Vec<u32>>")]
pub struct SymbolicLinkArray(Vec<Vec<u32>>);

impl Default for SymbolicLinkArray {
    fn default() -> SymbolicLinkArray {
        SymbolicLinkArray(vec![Vec::new(); SymbolicAddress::COUNT])
    }
}

impl SymbolicLinkArray {
    /// Returns whether no symbolic address has any patch site.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|offsets| offsets.is_empty())
    }

    /// Removes every patch site.
    pub fn clear(&mut self) {
        for offsets in self.0.iter_mut() {
            offsets.clear();
        }
    }

    /// Iterates over each symbolic address and its patch sites.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolicAddress, &[u32])> + '_ {
        SymbolicAddress::ALL
            .iter()
            .map(|&sym| (sym, self[sym].as_slice()))
    }
}

impl Index<SymbolicAddress> for SymbolicLinkArray {
    type Output = Vec<u32>;
    fn index(&self, sym: SymbolicAddress) -> &Vec<u32> {
        &self.0[sym.index()]
    }
}

impl IndexMut<SymbolicAddress> for SymbolicLinkArray {
    fn index_mut(&mut self, sym: SymbolicAddress) -> &mut Vec<u32> {
        &mut self.0[sym.index()]
    }
}

impl TryFrom<Vec<Vec<u32>>> for SymbolicLinkArray {
    type Error = CodeError;
    fn try_from(links: Vec<Vec<u32>>) -> Result<SymbolicLinkArray, CodeError> {
        if links.len() != SymbolicAddress::COUNT {
            return Err(CodeError::Deserialize(format!(
                "expected {} symbolic link lists, found {}",
                SymbolicAddress::COUNT,
                links.len()
            )));
        }
        Ok(SymbolicLinkArray(links))
    }
}

impl From<SymbolicLinkArray> for Vec<Vec<u32>> {
    fn from(links: SymbolicLinkArray) -> Vec<Vec<u32>> {
        links.0
    }
}

/// Everything needed to patch the absolute addresses of one code buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkData {
    /// Offset of the trap-handling stub, meaningful for the shared-stubs
    /// block only.
    pub trap_offset: u32,
    /// Links within the buffer itself.
    pub internal_links: Vec<InternalLink>,
    /// Links to runtime addresses.
    pub symbolic_links: SymbolicLinkArray,
}

impl LinkData {
    /// Creates empty link data.
    pub fn new() -> LinkData {
        LinkData::default()
    }

    /// Returns whether there is nothing to patch.
    pub fn is_empty(&self) -> bool {
        self.internal_links.is_empty() && self.symbolic_links.is_empty()
    }

    /// Removes every link.
    pub fn clear(&mut self) {
        self.internal_links.clear();
        self.symbolic_links.clear();
    }

    /// Records a pointer-sized absolute reference from `patch_at_offset` to
    /// `target_offset`.
    pub fn push_internal_link(&mut self, patch_at_offset: u32, target_offset: u32) {
        self.internal_links.push(InternalLink {
            patch_at_offset,
            target_offset,
            mode: LinkMode::Absolute,
        });
    }

    /// Records a reference to `sym` at `patch_at_offset`.
    pub fn push_symbolic_link(&mut self, sym: SymbolicAddress, patch_at_offset: u32) {
        self.symbolic_links[sym].push(patch_at_offset);
    }
}

/// Absolute addresses of the runtime's well-known symbols in this process.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    addresses: Vec<Option<usize>>,
}

impl Default for SymbolTable {
    fn default() -> SymbolTable {
        SymbolTable {
            addresses: vec![None; SymbolicAddress::COUNT],
        }
    }
}

impl SymbolTable {
    /// Creates a table with no symbols defined.
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Defines the address of `sym`.
    pub fn define(&mut self, sym: SymbolicAddress, address: usize) -> &mut Self {
        self.addresses[sym.index()] = Some(address);
        self
    }

    /// Returns the address of `sym`, if defined.
    pub fn get(&self, sym: SymbolicAddress) -> Option<usize> {
        self.addresses[sym.index()]
    }
}

/// Patches every link of `link_data` into `code`, which will live at `base`.
///
/// `trap_handler`, when provided, is the address that
/// [`SymbolicAddress::HandleTrap`] resolves to, overriding `symbols`.
pub fn statically_link(
    code: &mut [u8],
    base: usize,
    link_data: &LinkData,
    symbols: &SymbolTable,
    trap_handler: Option<usize>,
) -> Result<()> {
    for link in link_data.internal_links.iter() {
        let patch_at = usize::try_from(link.patch_at_offset)?;
        let target_offset = usize::try_from(link.target_offset)?;
        if target_offset > code.len() {
            return Err(CodeError::LinkOutOfBounds {
                offset: target_offset,
                len: code.len(),
            }
            .into());
        }
        let target = base + target_offset;
        match link.mode {
            LinkMode::Absolute => write_usize(code, patch_at, target)?,
            LinkMode::Relative32 => {
                let next = (base + patch_at + 4) as i64;
                let disp = i32::try_from(target as i64 - next)
                    .map_err(|_| CodeError::RelocationOverflow { offset: patch_at })?;
                write_u32(code, patch_at, disp as u32)?;
            }
        }
    }

    for (sym, offsets) in link_data.symbolic_links.iter() {
        if offsets.is_empty() {
            continue;
        }
        let target = match (sym, trap_handler) {
            (SymbolicAddress::HandleTrap, Some(addr)) => addr,
            _ => symbols.get(sym).ok_or(CodeError::UnresolvedSymbol(sym))?,
        };
        log::trace!("linking {} sites of `{sym}` to {target:#x}", offsets.len());
        for &offset in offsets {
            write_usize(code, usize::try_from(offset)?, target)?;
        }
    }

    Ok(())
}

/// Reverses [`statically_link`], restoring every patch site of `code` to its
/// unlinked placeholder.
pub fn statically_unlink(code: &mut [u8], link_data: &LinkData) -> Result<()> {
    for link in link_data.internal_links.iter() {
        let patch_at = usize::try_from(link.patch_at_offset)?;
        match link.mode {
            LinkMode::Absolute => {
                write_usize(code, patch_at, usize::try_from(link.target_offset)?)?
            }
            LinkMode::Relative32 => write_u32(code, patch_at, link.target_offset)?,
        }
    }
    for (_, offsets) in link_data.symbolic_links.iter() {
        for &offset in offsets {
            write_usize(code, usize::try_from(offset)?, SYMBOLIC_PLACEHOLDER)?;
        }
    }
    Ok(())
}

fn patch_site(code: &mut [u8], offset: usize, size: usize) -> Result<&mut [u8]> {
    let len = code.len();
    offset
        .checked_add(size)
        .and_then(|end| code.get_mut(offset..end))
        .ok_or_else(|| CodeError::LinkOutOfBounds { offset, len }.into())
}

fn write_usize(code: &mut [u8], offset: usize, value: usize) -> Result<()> {
    patch_site(code, offset, size_of::<usize>())?.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn write_u32(code: &mut [u8], offset: usize, value: u32) -> Result<()> {
    patch_site(code, offset, 4)?.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}
