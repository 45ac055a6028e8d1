//! OS-specific primitives for mapping code memory.
//!
//! Only anonymous, private mappings are needed here: code is always copied
//! into a fresh mapping, patched while writable, and then flipped to
//! read/execute.

cfg_if::cfg_if! {
    if #[cfg(all(unix, not(miri)))] {
        mod unix;
        pub use unix::*;
    } else {
        mod custom;
        pub use custom::*;
    }
}
