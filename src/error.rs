//! Root causes attached to the `anyhow::Error`s returned by this crate.
//!
//! Every fallible operation returns [`crate::Result`], but environmental and
//! format failures carry one of these as their root cause so that embedders
//! can distinguish, for example, an out-of-memory condition (which usually
//! means "fall back to a slower path") from a malformed relocation (which
//! means the module can't be instantiated).

use crate::link::SymbolicAddress;

/// Typed failure reasons surfaced through `anyhow::Error::downcast_ref`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodeError {
    /// Executable memory or a metadata vector could not be allocated.
    #[error("failed to allocate {bytes:#x} bytes of code memory")]
    OutOfMemory {
        /// Number of bytes that were requested.
        bytes: usize,
    },

    /// A symbolic link names a runtime address that wasn't provided.
    #[error("unresolved symbolic address `{0}` while linking")]
    UnresolvedSymbol(SymbolicAddress),

    /// A relocation's patch site doesn't fit inside the code buffer.
    #[error("relocation at offset {offset:#x} is out of bounds of {len:#x}-byte code")]
    LinkOutOfBounds {
        /// Offset of the patch site.
        offset: usize,
        /// Length of the code buffer being linked.
        len: usize,
    },

    /// A pc-relative relocation can't encode its displacement in 32 bits.
    #[error("relocation at offset {offset:#x} is out of range of a 32-bit displacement")]
    RelocationOverflow {
        /// Offset of the patch site.
        offset: usize,
    },

    /// `finish_complete_tier2` was called after a tier-2 install started.
    #[error("an optimized tier has already been installed for this code")]
    Tier2AlreadyInstalled,

    /// A persisted code image couldn't be decoded.
    #[error("invalid serialized code: {0}")]
    Deserialize(String),
}

impl CodeError {
    /// Returns whether `err` was caused by an allocation failure.
    pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<CodeError>(),
            Some(CodeError::OutOfMemory { .. })
        )
    }
}
