use thiserror::Error;

use crate::cpu::BackendKind;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Variants fall into two broad groups that callers are expected to treat differently:
///
/// # Fatal emulation gaps
///
/// These indicate a capability the emulator does not have, not a condition the guest can
/// correct. The per-thread run loop surfaces them as a diagnostic and drives the context to
/// [`ExitReason::UnknownError`](crate::context::ExitReason::UnknownError):
///
/// - [`Error::NamespacesUnsupported`] - The guest requested namespace isolation via clone
/// - [`Error::UnsupportedCloneFlags`] - A clone-flag combination the emulation cannot honor
/// - [`Error::AlreadyInitialized`] - A context was initialized twice
///
/// # Per-operation failures
///
/// These fail only the requested operation and leave the context usable:
///
/// - [`Error::RegionOverlap`] / [`Error::DuplicateRegion`] / [`Error::EmptyRegion`] - Invalid
///   memory-region registration
/// - [`Error::SyscallOutOfRange`] - Override target past the fixed table capacity
/// - [`Error::UnmappedAddress`] - A guest address with no registered backing region
/// - [`Error::NoBackendFactory`] / [`Error::FallbackDispatch`] - Backend registration problems
/// - [`Error::NoCode`] / [`Error::CoreNotReady`] - Startup ordering problems
///
/// # Examples
///
/// ```rust
/// use guestcore::{Error, ExecutionContext, ContextConfig};
///
/// let context = ExecutionContext::new(ContextConfig::default());
/// context.map_region(0x1000, 0x7f00_0000_0000, 0x1000)?;
///
/// match context.map_region(0x1800, 0x7f00_0000_1000, 0x1000) {
///     Err(Error::RegionOverlap { virtual_base }) => {
///         eprintln!("overlaps existing mapping at {virtual_base:#x}");
///     }
///     other => { other?; }
/// }
/// # Ok::<(), guestcore::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The guest requested namespace isolation through clone.
    ///
    /// Namespace emulation is explicitly rejected, not emulated. This is fatal to the
    /// emulated process because it indicates a capability gap.
    #[error("clone: namespaces are not supported (flags {flags:#x})")]
    NamespacesUnsupported {
        /// The raw clone-flag mask the guest supplied.
        flags: u64,
    },

    /// A clone-flag combination outside the supported profiles.
    ///
    /// The emulation supports exactly two shapes: the POSIX-thread "all shared" profile
    /// (`CLONE_THREAD` with sysvsem/fs/files/sighand all set) and the plain-fork profile
    /// (no resource sharing at all). Anything in between is fatal.
    #[error("clone: unsupported flag combination {flags:#x}: {reason}")]
    UnsupportedCloneFlags {
        /// The raw clone-flag mask the guest supplied.
        flags: u64,
        /// Which supported profile the mask failed to match.
        reason: &'static str,
    },

    /// The context was initialized more than once.
    ///
    /// Process-wide syscall-table construction is idempotent, but initializing the same
    /// context twice indicates a frontend sequencing bug and is reported as a conflict.
    #[error("execution context was already initialized")]
    AlreadyInitialized,

    /// A memory region would overlap an existing registration.
    ///
    /// The region table is left unchanged when this is returned.
    #[error("memory region overlaps an existing mapping at {virtual_base:#x}")]
    RegionOverlap {
        /// Virtual base of the rejected region.
        virtual_base: u64,
    },

    /// A memory region was already registered at this virtual base.
    ///
    /// Duplicate registrations are rejected, not merged.
    #[error("memory region already registered at {virtual_base:#x}")]
    DuplicateRegion {
        /// Virtual base of the rejected region.
        virtual_base: u64,
    },

    /// A memory region with a zero size was rejected.
    #[error("memory region at {virtual_base:#x} has zero size")]
    EmptyRegion {
        /// Virtual base of the rejected region.
        virtual_base: u64,
    },

    /// A guest virtual address has no registered backing region.
    ///
    /// Guest pointers are only usable after translation through the region table;
    /// handlers map this to a guest-visible `EFAULT`.
    #[error("guest address {address:#x} is not mapped")]
    UnmappedAddress {
        /// The untranslatable guest virtual address.
        address: u64,
    },

    /// A syscall number exceeds the fixed table capacity.
    #[error("syscall number {number} exceeds table capacity {capacity}")]
    SyscallOutOfRange {
        /// The requested syscall number.
        number: u64,
        /// The table's fixed capacity.
        capacity: usize,
    },

    /// No backend factory is registered for the requested kind.
    #[error("no backend factory registered for kind {kind}")]
    NoBackendFactory {
        /// The backend kind that has no factory.
        kind: BackendKind,
    },

    /// A fallback backend claimed to perform its own instruction dispatch.
    ///
    /// Fallback backends exist purely to interpret single unsupported opcodes; their
    /// `needs_dispatch` capability must report `false`.
    #[error("fallback backend must not perform its own instruction dispatch")]
    FallbackDispatch,

    /// The code loader reported that it has nothing to load.
    #[error("code loader has no code to load")]
    NoCode,

    /// Execution was started before the core was initialized with a loader.
    #[error("core has not been initialized with a loader")]
    CoreNotReady,

    /// Failed to lock target.
    ///
    /// Thread synchronization failed, typically because a mutex or rwlock was poisoned
    /// by a panicking thread.
    #[error("failed to lock target")]
    LockError,

    /// Host I/O error, e.g. while spawning an execution thread.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
