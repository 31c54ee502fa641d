//! Convenient re-exports of the types most frontends need.
//!
//! Import this module to get the context control surface, the backend seam,
//! and the clone/syscall types in one line:
//!
//! ```rust
//! use guestcore::prelude::*;
//! ```

/// The error type for all `guestcore` operations.
pub use crate::Error;

/// The result type used throughout `guestcore`.
pub use crate::Result;

/// Top-level owner of all per-process emulation state.
pub use crate::context::ExecutionContext;

/// Configuration fixed at context creation.
pub use crate::context::ContextConfig;

/// The externally observable execution state machine.
pub use crate::context::ExitReason;

/// The instruction-execution seam a backend implements.
pub use crate::cpu::{CpuBackend, TrapReason};

/// Register state and the backend selection types.
pub use crate::cpu::{BackendKind, CpuState, ExecutionMode, Gpr};

/// The consumed code-loader interface.
pub use crate::loader::CodeLoader;

/// Guest memory region bookkeeping.
pub use crate::memory::{MemoryMap, MemoryRegion};

/// Clone classification for thread/process creation.
pub use crate::threads::{classify_clone, CloneDisposition, CloneFlags, CloneRequest};

/// Guest thread handles and the registry.
pub use crate::threads::{ThreadHandle, ThreadRegistry};

/// Syscall handler plumbing for overrides and passthroughs.
pub use crate::syscalls::{Passthrough, SyscallArguments, SyscallHandler, ThreadContext};
