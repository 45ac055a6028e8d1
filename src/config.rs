//! Configuration knobs for how compiled code is managed.

use serde_derive::{Deserialize, Serialize};

/// How a module is compiled, which determines whether the tiering jump table
/// exists at all.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompileMode {
    /// A single tier is compiled and used forever.
    #[default]
    Once,
    /// A baseline tier runs first and an optimized tier may be installed
    /// later by a background compiler.
    Tiering,
}

/// Settings consulted by [`Code`](crate::Code) when it allocates segments and
/// builds entry stubs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConfig {
    pub(crate) mode: CompileMode,
    pub(crate) lazy_stub_segment_size: usize,
    pub(crate) branch_protection: bool,
    pub(crate) profiling: bool,
}

impl Default for CodeConfig {
    fn default() -> CodeConfig {
        CodeConfig {
            mode: CompileMode::Once,
            lazy_stub_segment_size: CodeConfig::DEFAULT_LAZY_STUB_SEGMENT_SIZE,
            branch_protection: false,
            profiling: false,
        }
    }
}

impl CodeConfig {
    /// Executable segments are 64KiB, and a lazy stub is usually a few KiB,
    /// so one lazy segment is shared by the stubs of many functions.
    pub const DEFAULT_LAZY_STUB_SEGMENT_SIZE: usize = 64 * 1024;

    /// Creates the default configuration.
    pub fn new() -> CodeConfig {
        CodeConfig::default()
    }

    /// Sets the compile mode.
    pub fn mode(&mut self, mode: CompileMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Sets the minimum capacity of a freshly allocated lazy-stub segment.
    ///
    /// The value is rounded up to the host page size when used. A single stub
    /// larger than this gets a segment of its own size.
    pub fn lazy_stub_segment_size(&mut self, size: usize) -> &mut Self {
        self.lazy_stub_segment_size = size;
        self
    }

    /// Requests branch target identification when code is made executable.
    ///
    /// Only has an effect on aarch64 Linux hosts that support BTI.
    pub fn branch_protection(&mut self, enable: bool) -> &mut Self {
        self.branch_protection = enable;
        self
    }

    /// Builds profiling labels eagerly when code is created.
    pub fn profiling(&mut self, enable: bool) -> &mut Self {
        self.profiling = enable;
        self
    }

    /// Returns the configured compile mode.
    pub fn compile_mode(&self) -> CompileMode {
        self.mode
    }
}
