//! Guest CPU state and pluggable execution backends.
//!
//! This module defines the guest's externally visible register file ([`CpuState`]),
//! the calling-convention mode ([`ExecutionMode`]), and the seam between the control
//! layer and the components that actually execute guest instructions: the
//! [`CpuBackend`] trait plus the [`BackendRegistry`] of factory closures.
//!
//! The control layer never inspects backend internals. A backend is asked to run
//! until it traps (syscall or guest exit), or to step a single instruction in debug
//! mode, and everything else about instruction decode and code generation stays
//! behind the trait.
//!
//! # Backend kinds
//!
//! Three factory slots exist, selected by [`BackendKind`]:
//!
//! - `Default` - the ordinary interpreter/compiler backend
//! - `Custom` - a frontend-supplied backend, typically for debugging
//! - `Fallback` - interprets single unsupported opcodes only; it must report
//!   `needs_dispatch() == false` and is rejected otherwise at instantiation

use std::sync::Arc;

use crate::{Error, Result};

/// Calling-convention mode a guest thread executes under.
///
/// Syscall numbers and argument layouts differ between the native 64-bit
/// convention and the 32-bit compatibility convention, so each mode carries its
/// own syscall table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ExecutionMode {
    /// Native 64-bit convention: arguments in rdi, rsi, rdx, r10, r8, r9.
    Native,
    /// 32-bit compatibility convention: arguments in ebx, ecx, edx, esi, edi, ebp.
    Compat,
}

/// General-purpose register indices into [`CpuState::gpr`].
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Gpr {
    /// rax / eax - syscall number and return value.
    Rax = 0,
    /// rbx / ebx.
    Rbx,
    /// rcx / ecx.
    Rcx,
    /// rdx / edx.
    Rdx,
    /// rsi / esi.
    Rsi,
    /// rdi / edi.
    Rdi,
    /// rbp / ebp.
    Rbp,
    /// rsp / esp - stack pointer.
    Rsp,
    /// r8.
    R8,
    /// r9.
    R9,
    /// r10.
    R10,
    /// r11.
    R11,
    /// r12.
    R12,
    /// r13.
    R13,
    /// r14.
    R14,
    /// r15.
    R15,
}

/// The guest's visible register file.
///
/// This is a plain value type with copy semantics: [`ExecutionContext::cpu_state`]
/// (crate::context::ExecutionContext::cpu_state) returns a snapshot and
/// `set_cpu_state` copies a snapshot back in; neither aliases the live state.
///
/// Writes from a thread's own backend are only meaningfully observable once that
/// thread is paused or has exited. Reading the register file of a concurrently
/// running thread is a race that callers must exclude externally, e.g. by pausing
/// first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuState {
    /// Instruction pointer.
    pub rip: u64,
    /// General-purpose registers, indexed by [`Gpr`].
    pub gpr: [u64; 16],
    /// Flags register.
    pub rflags: u64,
    /// fs segment base; holds the TLS pointer for native guests.
    pub fs_base: u64,
    /// gs segment base.
    pub gs_base: u64,
}

impl CpuState {
    /// Reads a general-purpose register.
    #[must_use]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg as usize]
    }

    /// Writes a general-purpose register.
    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg as usize] = value;
    }
}

/// Why a backend stopped executing and returned control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapReason {
    /// The guest issued a system call.
    ///
    /// The backend has already advanced the instruction pointer past the trapping
    /// instruction; the syscall number is whatever the guest placed in its
    /// number register at the time of the trap.
    Syscall {
        /// Guest syscall number.
        number: u64,
    },
    /// The guest thread finished executing.
    Exit {
        /// Guest-supplied exit status.
        status: i32,
    },
}

/// A pluggable component that executes guest instructions.
///
/// Implementations run guest code until the next trap boundary and report why
/// they stopped. The control layer owns the loop around these calls: it
/// dispatches syscalls, polls the cooperative pause flag between traps, and
/// decides when the thread retires.
pub trait CpuBackend: Send {
    /// Short human-readable backend name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this backend performs its own full opcode dispatch.
    ///
    /// Fallback backends exist purely to interpret single unsupported opcodes
    /// and must return `false` here.
    fn needs_dispatch(&self) -> bool {
        true
    }

    /// Executes guest code until a syscall or guest exit.
    ///
    /// # Errors
    ///
    /// Returns an error for conditions the backend cannot express as guest
    /// state, such as an undecodable instruction with no fallback available.
    fn run(&mut self, cpu: &mut CpuState) -> Result<TrapReason>;

    /// Executes exactly one guest instruction.
    ///
    /// Used by single-step debug mode. A non-trapping instruction should be
    /// reported as a [`TrapReason::Syscall`]-free completion by the caller's
    /// convention; backends that cannot step return an error.
    ///
    /// # Errors
    ///
    /// Same conditions as [`CpuBackend::run`].
    fn step(&mut self, cpu: &mut CpuState) -> Result<TrapReason>;
}

impl std::fmt::Debug for dyn CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("name", &self.name())
            .finish()
    }
}

/// Which factory slot a backend constructor occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum BackendKind {
    /// The ordinary execution backend.
    Default,
    /// A frontend-supplied backend, typically for debugging.
    Custom,
    /// Interprets single unsupported opcodes only; never dispatches itself.
    Fallback,
}

/// Constructor for an execution backend.
///
/// The factory receives the initial register file of the thread the backend
/// will drive. Factories are shared across threads, so they are `Send + Sync`
/// and every invocation must produce an independent backend instance.
pub type BackendFactory = Arc<dyn Fn(&CpuState) -> Box<dyn CpuBackend> + Send + Sync>;

/// Registry of backend factories, one optional slot per [`BackendKind`].
///
/// The embedding frontend populates this before execution starts. Which slot is
/// used for new threads is decided by the context configuration.
#[derive(Default)]
pub struct BackendRegistry {
    default: Option<BackendFactory>,
    custom: Option<BackendFactory>,
    fallback: Option<BackendFactory>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a factory for the given kind, replacing any previous one.
    pub fn set(&mut self, kind: BackendKind, factory: BackendFactory) {
        match kind {
            BackendKind::Default => self.default = Some(factory),
            BackendKind::Custom => self.custom = Some(factory),
            BackendKind::Fallback => self.fallback = Some(factory),
        }
    }

    /// Returns the factory registered for the given kind, if any.
    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Option<BackendFactory> {
        match kind {
            BackendKind::Default => self.default.clone(),
            BackendKind::Custom => self.custom.clone(),
            BackendKind::Fallback => self.fallback.clone(),
        }
    }

    /// Constructs a backend of the given kind for a thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBackendFactory`] if no factory is registered for
    /// `kind`, and [`Error::FallbackDispatch`] if a fallback factory produced a
    /// backend that claims to perform its own instruction dispatch.
    pub fn instantiate(&self, kind: BackendKind, cpu: &CpuState) -> Result<Box<dyn CpuBackend>> {
        let factory = self.get(kind).ok_or(Error::NoBackendFactory { kind })?;
        let backend = factory(cpu);

        if kind == BackendKind::Fallback && backend.needs_dispatch() {
            return Err(Error::FallbackDispatch);
        }

        Ok(backend)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("default", &self.default.is_some())
            .field("custom", &self.custom.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend {
        dispatches: bool,
    }

    impl CpuBackend for NullBackend {
        fn name(&self) -> &'static str {
            "null"
        }

        fn needs_dispatch(&self) -> bool {
            self.dispatches
        }

        fn run(&mut self, _cpu: &mut CpuState) -> Result<TrapReason> {
            Ok(TrapReason::Exit { status: 0 })
        }

        fn step(&mut self, _cpu: &mut CpuState) -> Result<TrapReason> {
            Ok(TrapReason::Exit { status: 0 })
        }
    }

    #[test]
    fn test_gpr_roundtrip() {
        let mut cpu = CpuState::default();
        cpu.set_gpr(Gpr::Rdi, 0xdead_beef);
        cpu.set_gpr(Gpr::R10, 42);

        assert_eq!(cpu.gpr(Gpr::Rdi), 0xdead_beef);
        assert_eq!(cpu.gpr(Gpr::R10), 42);
        assert_eq!(cpu.gpr(Gpr::Rax), 0);
    }

    #[test]
    fn test_registry_missing_factory() {
        let registry = BackendRegistry::new();
        let err = registry
            .instantiate(BackendKind::Default, &CpuState::default())
            .unwrap_err();

        assert!(matches!(
            err,
            Error::NoBackendFactory {
                kind: BackendKind::Default
            }
        ));
    }

    #[test]
    fn test_registry_instantiate() {
        let mut registry = BackendRegistry::new();
        registry.set(
            BackendKind::Default,
            Arc::new(|_| Box::new(NullBackend { dispatches: true })),
        );

        let backend = registry
            .instantiate(BackendKind::Default, &CpuState::default())
            .unwrap();
        assert_eq!(backend.name(), "null");
    }

    #[test]
    fn test_fallback_must_not_dispatch() {
        let mut registry = BackendRegistry::new();
        registry.set(
            BackendKind::Fallback,
            Arc::new(|_| Box::new(NullBackend { dispatches: true })),
        );

        let err = registry
            .instantiate(BackendKind::Fallback, &CpuState::default())
            .unwrap_err();
        assert!(matches!(err, Error::FallbackDispatch));

        registry.set(
            BackendKind::Fallback,
            Arc::new(|_| Box::new(NullBackend { dispatches: false })),
        );
        assert!(registry
            .instantiate(BackendKind::Fallback, &CpuState::default())
            .is_ok());
    }
}
