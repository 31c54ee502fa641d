//! The consumed code-loader interface.
//!
//! Binary parsing and image mapping live outside this crate; the control layer
//! only asks a loader whether it has code and where execution should begin.

/// Supplies the initial guest program state at context start.
///
/// Implementations own all format concerns (ELF parsing, image mapping,
/// initial stack construction). The core consults the loader exactly once,
/// during [`ExecutionContext::init_core`](crate::context::ExecutionContext::init_core).
pub trait CodeLoader: Send {
    /// Whether the loader has code ready to execute.
    ///
    /// `init_core` fails without creating any thread when this is `false`.
    fn has_code(&self) -> bool;

    /// Guest virtual address of the first instruction to execute.
    fn entry_point(&self) -> u64;

    /// Initial guest stack pointer for the primary thread.
    fn stack_pointer(&self) -> u64;
}
