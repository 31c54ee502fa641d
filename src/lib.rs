#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]
// 'memory', 'threads/clone.rs', and 'syscalls' use raw pointer writes and
// libc::syscall for guest memory access and host relays; no other unsafe.

//! # guestcore
//!
//! A user-mode guest-execution control layer: process/thread lifecycle,
//! syscall dispatch, and guest memory translation for an x86-64 CPU emulator.
//!
//! `guestcore` is the layer between an instruction-executing backend (an
//! interpreter or JIT implementing [`CpuBackend`]) and the host OS. It owns
//! the state a running guest *process* needs beyond raw instruction
//! execution:
//!
//! - **Execution context** - [`ExecutionContext`] holds all per-process
//!   state and exposes the start/pause/shutdown control API with the
//!   [`ExitReason`] state machine.
//! - **Threads** - one host thread per guest thread; `clone` is emulated by
//!   classifying its flag set ([`classify_clone`]) and either spawning a new
//!   guest thread or forking the host process.
//! - **Syscalls** - per-mode fixed tables ([`SyscallTables`]) dispatch
//!   trapped syscalls to typed handlers; unhandled numbers surface as
//!   `-ENOSYS` to the guest rather than terminating emulation.
//! - **Memory** - an explicit guest-virtual to host-physical region map
//!   ([`MemoryMap`]); every guest pointer crossing into host code is
//!   translated, never dereferenced raw.
//!
//! Binary loading, instruction decoding, and signal handling live outside
//! this crate; the loader seam is the [`CodeLoader`] trait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use guestcore::prelude::*;
//!
//! # struct ElfLoader;
//! # impl CodeLoader for ElfLoader {
//! #     fn has_code(&self) -> bool { true }
//! #     fn entry_point(&self) -> u64 { 0x40_1000 }
//! #     fn stack_pointer(&self) -> u64 { 0x7fff_f000 }
//! # }
//! let context = ExecutionContext::new(ContextConfig::default());
//! context.initialize()?;
//! context.map_region(0x40_0000, 0x7f80_0000_0000, 0x20_0000)?;
//! context.init_core(&ElfLoader)?;
//!
//! match context.start(true)? {
//!     ExitReason::Shutdown => println!("guest exited cleanly"),
//!     reason => eprintln!("guest stopped: {reason}"),
//! }
//! # Ok::<(), guestcore::Error>(())
//! ```
//!
//! ## Threading model
//!
//! An [`ExecutionContext`] is shared via `Arc`; every control-API method is
//! safe to call from any host thread. Each guest thread is driven by a
//! dedicated host thread that loops trap to trap. Pausing is cooperative:
//! [`ExecutionContext::pause`] raises an advisory flag that each loop polls
//! at its next trap boundary.

/// Execution context, lifecycle control, and the exit-reason state machine.
///
/// # Key Types
///
/// - [`context::ExecutionContext`] - owner of all per-process emulation state
/// - [`context::ContextConfig`] - creation-time configuration
/// - [`context::ExitReason`] - the externally observable state machine
///
/// # Example
///
/// ```rust,no_run
/// use guestcore::{ContextConfig, ExecutionContext};
///
/// let context = ExecutionContext::new(ContextConfig::default());
/// context.initialize()?;
/// # Ok::<(), guestcore::Error>(())
/// ```
pub mod context;

/// CPU register state, execution modes, and the backend seam.
///
/// # Key Types
///
/// - [`cpu::CpuState`] - the guest-visible x86-64 register file
/// - [`cpu::CpuBackend`] - the trait an interpreter or JIT implements
/// - [`cpu::TrapReason`] - why a backend returned control
/// - [`cpu::BackendRegistry`] - factory slots for backend selection
pub mod cpu;

/// The consumed code-loader interface.
pub mod loader;

/// Guest-virtual to host-physical address translation.
///
/// Every guest pointer that crosses into host code goes through
/// [`memory::MemoryMap::translate`] or
/// [`memory::MemoryMap::translate_range`]; nothing dereferences a guest
/// address raw.
pub mod memory;

/// Syscall tables, argument marshaling, and dispatch.
///
/// # Key Types
///
/// - [`syscalls::SyscallTables`] - the immutable per-mode default tables
/// - [`syscalls::SyscallHandler`] - the typed handler trait
/// - [`syscalls::ThreadContext`] - the per-invocation thread view
/// - [`syscalls::Passthrough`] - one-to-one host relays
pub mod syscalls;

/// Guest thread records, the registry, and clone emulation.
///
/// # Key Types
///
/// - [`threads::ThreadHandle`] - one guest thread's state
/// - [`threads::ThreadRegistry`] - the per-context thread table
/// - [`threads::CloneFlags`] / [`threads::CloneDisposition`] - clone
///   classification
pub mod threads;

mod error;

pub mod prelude;

pub use crate::context::{ContextConfig, ExecutionContext, ExitReason};
pub use crate::cpu::{
    BackendFactory, BackendKind, BackendRegistry, CpuBackend, CpuState, ExecutionMode, Gpr,
    TrapReason,
};
pub use crate::error::Error;
pub use crate::loader::CodeLoader;
pub use crate::memory::{MemoryMap, MemoryRegion};
pub use crate::syscalls::{
    errno_result, host_result, Passthrough, SyscallArguments, SyscallHandler, SyscallTable,
    SyscallTables, ThreadContext, MAX_ARGS, TABLE_CAPACITY,
};
pub use crate::threads::{
    classify_clone, CloneDisposition, CloneFlags, CloneRequest, ThreadHandle, ThreadManager,
    ThreadRegistry,
};

/// The result type used throughout `guestcore`.
pub type Result<T> = std::result::Result<T, Error>;
