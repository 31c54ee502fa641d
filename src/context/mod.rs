//! The execution context: top-level owner of all per-process emulation state.
//!
//! An [`ExecutionContext`] owns the thread registry, the guest memory map, the
//! backend registry, the syscall-override layer, and the externally observable
//! execution state machine ([`ExitReason`]). It is designed to be shared across
//! host threads via `Arc`: each guest thread's execution loop holds a reference,
//! and the embedding frontend polls or blocks on the control API from its own
//! thread.
//!
//! # Lifecycle
//!
//! ```text
//! new() -> initialize() -> map_region()* -> init_core(loader) -> start(blocking)
//! ```
//!
//! `start(true)` parks the caller until a terminal exit reason is observed
//! system-wide (or, in single-step mode, until one instruction completes).
//! `start(false)` returns immediately with [`ExitReason::AsyncRun`]; the
//! frontend then polls [`ExecutionContext::is_done`].
//!
//! # Pausing
//!
//! [`ExecutionContext::pause`] is advisory and cooperative: each thread's loop
//! polls the flag at its trap boundary and stops at the next safe point.
//! Nothing is forcibly suspended, and a thread parked inside a blocking host
//! syscall will not observe the flag until it returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use crate::{
    cpu::{
        BackendFactory, BackendKind, BackendRegistry, CpuBackend, CpuState, ExecutionMode, Gpr,
        TrapReason,
    },
    loader::CodeLoader,
    memory::MemoryMap,
    syscalls::{self, SyscallArguments, SyscallHandler, TableEntry, ThreadContext, TABLE_CAPACITY},
    threads::{ThreadHandle, ThreadRegistry},
    Error, Result,
};

/// The externally observable execution state of a context.
///
/// `Shutdown` and `UnknownError` are terminal: once stored, no further
/// transition is possible. `DebugStop` is the cooperative paused state and can
/// be left by starting execution again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum ExitReason {
    /// Execution has not been started.
    None = 0,
    /// A blocking start is running and the control thread is waiting.
    Waiting = 1,
    /// A non-blocking start is running.
    AsyncRun = 2,
    /// The guest exited; terminal.
    Shutdown = 3,
    /// Execution stopped at a cooperative pause point or after a single step.
    DebugStop = 4,
    /// An unrecoverable emulation failure; terminal.
    UnknownError = 5,
}

impl ExitReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Waiting,
            2 => Self::AsyncRun,
            3 => Self::Shutdown,
            4 => Self::DebugStop,
            _ => Self::UnknownError,
        }
    }
}

/// Atomically updated exit-reason cell with sticky terminal states.
struct ExitFlag(AtomicU8);

impl ExitFlag {
    fn new() -> Self {
        Self(AtomicU8::new(ExitReason::None as u8))
    }

    fn load(&self) -> ExitReason {
        ExitReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `next` unless the current reason is terminal. Returns whether
    /// the transition was applied.
    fn store(&self, next: ExitReason) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let reason = ExitReason::from_u8(current);
            if matches!(reason, ExitReason::Shutdown | ExitReason::UnknownError) {
                return false;
            }
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Configuration fixed at context creation.
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Which backend factory slot drives guest threads.
    pub backend: BackendKind,
    /// Calling-convention mode for syscall dispatch.
    pub mode: ExecutionMode,
    /// Single-step debug mode: each start executes one instruction and stops
    /// with [`ExitReason::DebugStop`].
    pub single_step: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Default,
            mode: ExecutionMode::Native,
            single_step: false,
        }
    }
}

/// Top-level owner of all per-process emulation state.
///
/// Created once per emulated process and shared via `Arc`. Independent
/// contexts are fully isolated from one another; only the default syscall
/// tables are process-wide (and immutable).
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use guestcore::{ContextConfig, ExecutionContext};
///
/// # struct MyLoader;
/// # impl guestcore::CodeLoader for MyLoader {
/// #     fn has_code(&self) -> bool { true }
/// #     fn entry_point(&self) -> u64 { 0x40_0000 }
/// #     fn stack_pointer(&self) -> u64 { 0x7fff_0000 }
/// # }
/// let context = ExecutionContext::new(ContextConfig::default());
/// context.initialize()?;
/// context.map_region(0x40_0000, 0x7f00_0000_0000, 0x10_0000)?;
/// context.init_core(&MyLoader)?;
///
/// let reason = context.start(true)?;
/// println!("guest finished: {reason}");
/// # Ok::<(), guestcore::Error>(())
/// ```
pub struct ExecutionContext {
    weak_self: Weak<ExecutionContext>,
    config: ContextConfig,
    threads: ThreadRegistry,
    memory: MemoryMap,
    backends: RwLock<BackendRegistry>,
    overrides: RwLock<HashMap<(ExecutionMode, u64), TableEntry>>,
    exit: ExitFlag,
    pause: AtomicBool,
    initialized: AtomicBool,
    core_ready: AtomicBool,
    app_name: RwLock<Option<String>>,
    idle: Mutex<()>,
    idle_signal: Condvar,
}

impl ExecutionContext {
    /// Creates a new, empty context.
    ///
    /// Thread-safe to call multiple times; each call yields an independent
    /// context.
    #[must_use]
    pub fn new(config: ContextConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config,
            threads: ThreadRegistry::new(),
            memory: MemoryMap::new(),
            backends: RwLock::new(BackendRegistry::new()),
            overrides: RwLock::new(HashMap::new()),
            exit: ExitFlag::new(),
            pause: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            core_ready: AtomicBool::new(false),
            app_name: RwLock::new(None),
            idle: Mutex::new(()),
            idle_signal: Condvar::new(),
        })
    }

    /// Performs one-time initialization, including the process-wide syscall
    /// table construction.
    ///
    /// Table construction itself is idempotent across contexts; initializing
    /// the *same* context twice is a frontend sequencing conflict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] on a second call.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        syscalls::tables()?;
        Ok(())
    }

    /// Context configuration (immutable after creation).
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The guest memory map.
    #[must_use]
    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// The thread registry.
    #[must_use]
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Registers a guest-virtual to host-physical memory mapping.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::map`]; failures leave the region table unchanged.
    pub fn map_region(&self, virtual_base: u64, physical_base: u64, size: u64) -> Result<()> {
        self.memory.map(virtual_base, physical_base, size)
    }

    /// Sets the application identity used in diagnostics.
    pub fn set_application_name(&self, name: impl Into<String>) {
        if let Ok(mut slot) = self.app_name.write() {
            *slot = Some(name.into());
        }
    }

    /// The application identity, if one was set.
    #[must_use]
    pub fn application_name(&self) -> Option<String> {
        self.app_name.read().ok().and_then(|n| n.clone())
    }

    /// Consults the loader and creates the primary guest thread.
    ///
    /// The primary thread's register file starts at the loader's entry point
    /// with the loader's initial stack pointer. No host thread is spawned
    /// until [`ExecutionContext::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCode`] if the loader reports nothing to load; no
    /// thread is created in that case.
    pub fn init_core(&self, loader: &dyn CodeLoader) -> Result<()> {
        if !loader.has_code() {
            return Err(Error::NoCode);
        }

        let mut cpu = CpuState::default();
        cpu.rip = loader.entry_point();
        cpu.set_gpr(Gpr::Rsp, loader.stack_pointer());

        let thread = self.threads.create(cpu);
        self.threads.set_primary(thread.tid());
        self.core_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Installs a backend factory for the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn set_backend_factory(&self, kind: BackendKind, factory: BackendFactory) -> Result<()> {
        self.backends
            .write()
            .map_err(|_| Error::LockError)?
            .set(kind, factory);
        Ok(())
    }

    /// Replaces a syscall-table entry for this context only.
    ///
    /// The process-wide default tables stay immutable; overrides are consulted
    /// first during dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyscallOutOfRange`] if `number` exceeds the fixed
    /// table capacity.
    pub fn register_syscall_override(
        &self,
        mode: ExecutionMode,
        number: u64,
        arg_count: u8,
        handler: impl SyscallHandler + 'static,
    ) -> Result<()> {
        if number as usize >= TABLE_CAPACITY {
            return Err(Error::SyscallOutOfRange {
                number,
                capacity: TABLE_CAPACITY,
            });
        }

        self.overrides
            .write()
            .map_err(|_| Error::LockError)?
            .insert(
                (mode, number),
                TableEntry {
                    handler: Arc::new(handler),
                    arg_count,
                },
            );
        Ok(())
    }

    pub(crate) fn syscall_override(&self, mode: ExecutionMode, number: u64) -> Option<TableEntry> {
        self.overrides
            .read()
            .ok()
            .and_then(|map| map.get(&(mode, number)).cloned())
    }

    /// Starts executing the primary thread.
    ///
    /// With `blocking` set, the call parks until the exit reason becomes
    /// terminal (`Shutdown`, `DebugStop` after a pause or single step, or
    /// `UnknownError`) and returns it. Otherwise execution proceeds
    /// asynchronously and [`ExitReason::AsyncRun`] is returned immediately.
    ///
    /// Starting a context stopped in `DebugStop` resumes every paused thread
    /// from its saved register state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoreNotReady`] if [`ExecutionContext::init_core`] has
    /// not succeeded, plus backend-instantiation and thread-spawn failures.
    pub fn start(&self, blocking: bool) -> Result<ExitReason> {
        if !self.core_ready.load(Ordering::Acquire) {
            return Err(Error::CoreNotReady);
        }
        let primary = self.threads.primary().ok_or(Error::CoreNotReady)?;

        self.pause.store(false, Ordering::Release);
        self.exit.store(if blocking {
            ExitReason::Waiting
        } else {
            ExitReason::AsyncRun
        });

        let paused = self.threads.paused();
        if paused.is_empty() {
            if !primary.is_running() {
                self.run_thread(&primary)?;
            }
        } else {
            // A cooperative stop parks every thread that observed the flag;
            // all of them pick their work back up, not just the primary.
            for thread in &paused {
                self.run_thread(thread)?;
            }
        }

        if blocking {
            self.wait_for_idle()?;
            Ok(self.exit_reason())
        } else {
            Ok(ExitReason::AsyncRun)
        }
    }

    /// The current exit reason.
    ///
    /// Safe to call concurrently with running execution threads; repeated
    /// calls without an intervening state change return the same value.
    #[must_use]
    pub fn exit_reason(&self) -> ExitReason {
        self.exit.load()
    }

    /// Whether the context is done working or paused.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.exit.load(),
            ExitReason::Shutdown | ExitReason::DebugStop | ExitReason::UnknownError
        )
    }

    /// Requests a cooperative pause.
    ///
    /// Each thread's loop observes the flag at its next trap boundary and
    /// stops with [`ExitReason::DebugStop`]. Advisory only: nothing is
    /// forcibly suspended.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    /// Drives the context to [`ExitReason::Shutdown`].
    ///
    /// Running threads observe the terminal state at their next trap boundary.
    pub fn shutdown(&self) {
        self.request_shutdown();
    }

    pub(crate) fn request_shutdown(&self) {
        self.exit.store(ExitReason::Shutdown);
        self.notify_idle();
    }

    /// Returns a snapshot of the primary thread's register file.
    ///
    /// Copy semantics; only meaningful once the thread is paused or exited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoreNotReady`] before [`ExecutionContext::init_core`].
    pub fn cpu_state(&self) -> Result<CpuState> {
        self.threads
            .primary()
            .ok_or(Error::CoreNotReady)?
            .cpu_state()
    }

    /// Replaces the primary thread's register file with a copy of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoreNotReady`] before [`ExecutionContext::init_core`].
    pub fn set_cpu_state(&self, state: &CpuState) -> Result<()> {
        self.threads
            .primary()
            .ok_or(Error::CoreNotReady)?
            .set_cpu_state(state)
    }

    /// Looks up a thread by guest thread id.
    #[must_use]
    pub fn thread(&self, tid: u64) -> Option<Arc<ThreadHandle>> {
        self.threads.get(tid)
    }

    /// Invokes a syscall handler directly on a thread, for debugging.
    ///
    /// Arguments are supplied explicitly instead of being marshaled from
    /// registers; they are truncated to the entry's declared count.
    ///
    /// # Errors
    ///
    /// Fatal handler errors propagate; guest-visible failures are encoded in
    /// the returned value.
    pub fn handle_syscall(
        &self,
        thread: &Arc<ThreadHandle>,
        number: u64,
        args: &SyscallArguments,
    ) -> Result<u64> {
        let shared = self.shared();
        let mut cpu = thread.cpu()?;
        let mut tctx = ThreadContext::new(&shared, thread, &mut cpu);
        syscalls::dispatch_args(&mut tctx, self.config.mode, number, args)
    }

    pub(crate) fn create_thread(&self, cpu: CpuState) -> Arc<ThreadHandle> {
        self.threads.create(cpu)
    }

    /// Instantiates a backend for `thread` and spawns its host execution loop.
    pub(crate) fn run_thread(&self, thread: &Arc<ThreadHandle>) -> Result<()> {
        let snapshot = thread.cpu_state()?;
        let backend = self
            .backends
            .read()
            .map_err(|_| Error::LockError)?
            .instantiate(self.config.backend, &snapshot)?;

        thread.mark_running();

        let context = self.shared();
        let handle = Arc::clone(thread);
        let spawned = std::thread::Builder::new()
            .name(format!("guest-{}", thread.tid()))
            .spawn(move || thread_main(context, handle, backend));

        match spawned {
            Ok(join) => thread.set_join(join),
            Err(err) => {
                thread.retire();
                Err(err.into())
            }
        }
    }

    /// The owning `Arc`, recovered through the self-reference installed by
    /// [`ExecutionContext::new`].
    ///
    /// `new` is the only constructor, so the backing allocation is alive for
    /// as long as any `&self` exists.
    fn shared(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("context is always allocated through ExecutionContext::new")
    }

    fn wait_for_idle(&self) -> Result<()> {
        let mut guard = self.idle.lock().map_err(|_| Error::LockError)?;
        while !self.is_done() {
            guard = self.idle_signal.wait(guard).map_err(|_| Error::LockError)?;
        }
        Ok(())
    }

    fn notify_idle(&self) {
        // Taking the mutex orders the store against a waiter's predicate check.
        let _guard = self.idle.lock();
        self.idle_signal.notify_all();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("exit_reason", &self.exit_reason())
            .field("threads", &self.threads.len())
            .field("regions", &self.memory.region_count())
            .finish()
    }
}

enum LoopOutcome {
    Exited,
    Paused,
    Fatal,
}

/// Per-guest-thread execution loop.
///
/// Owns the thread's backend and drives it trap to trap: dispatching syscalls,
/// polling the cooperative pause flag at each boundary, and tearing the thread
/// down when the guest exits or a fatal emulation gap surfaces.
fn thread_main(
    context: Arc<ExecutionContext>,
    thread: Arc<ThreadHandle>,
    mut backend: Box<dyn CpuBackend>,
) {
    if let Ok(mut manager) = thread.manager_mut() {
        manager.host_tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    }
    log::debug!(
        "thread {} running on backend '{}'",
        thread.tid(),
        backend.name()
    );

    let single_step = context.config.single_step;

    let outcome = loop {
        if matches!(
            context.exit_reason(),
            ExitReason::Shutdown | ExitReason::UnknownError
        ) {
            break LoopOutcome::Exited;
        }

        let mut cpu = match thread.cpu() {
            Ok(guard) => guard,
            Err(err) => {
                log::error!("thread {}: {err}", thread.tid());
                break LoopOutcome::Fatal;
            }
        };

        let trap = if single_step {
            backend.step(&mut cpu)
        } else {
            backend.run(&mut cpu)
        };

        match trap {
            Ok(TrapReason::Syscall { number }) => {
                let dispatched = {
                    let mut tctx = ThreadContext::new(&context, &thread, &mut cpu);
                    syscalls::dispatch(&mut tctx, context.config.mode, number)
                };
                match dispatched {
                    Ok(result) => cpu.set_gpr(Gpr::Rax, result),
                    Err(err) => {
                        log::error!(
                            "thread {}: fatal while handling syscall {number}: {err}",
                            thread.tid()
                        );
                        break LoopOutcome::Fatal;
                    }
                }
            }
            Ok(TrapReason::Exit { status }) => {
                log::debug!("thread {} exited with status {status}", thread.tid());
                break LoopOutcome::Exited;
            }
            Err(err) => {
                log::error!("thread {}: backend error: {err}", thread.tid());
                break LoopOutcome::Fatal;
            }
        }

        drop(cpu);

        if !thread.is_running() {
            // The guest retired this thread through an exit-family syscall.
            break LoopOutcome::Exited;
        }
        if single_step || context.pause_requested() {
            break LoopOutcome::Paused;
        }
    };

    match outcome {
        LoopOutcome::Exited => {
            clear_child_tid(&context, &thread);
            thread.retire();
            // Paused siblings still hold unfinished guest work; the context
            // is only done when nothing is left to resume.
            if context.threads.running_count() == 0 && context.threads.paused_count() == 0 {
                context.exit.store(ExitReason::Shutdown);
                context.notify_idle();
            }
        }
        LoopOutcome::Paused => {
            thread.mark_paused();
            context.exit.store(ExitReason::DebugStop);
            context.notify_idle();
        }
        LoopOutcome::Fatal => {
            thread.retire();
            context.exit.store(ExitReason::UnknownError);
            context.notify_idle();
        }
    }
}

/// CLONE_CHILD_CLEARTID / set_tid_address exit protocol: clear the recorded
/// guest word and wake any futex waiters on it.
fn clear_child_tid(context: &ExecutionContext, thread: &ThreadHandle) {
    let addr = thread
        .manager()
        .map(|manager| manager.clear_child_tid)
        .unwrap_or(0);
    if addr == 0 {
        return;
    }

    match context.memory().translate_range(addr, 4) {
        Ok(host) => unsafe {
            std::ptr::write(host as *mut u32, 0);
            libc::syscall(
                libc::SYS_futex,
                host,
                libc::FUTEX_WAKE,
                libc::INT_MAX,
                0u64,
                0u64,
                0u64,
            );
        },
        Err(_) => log::debug!(
            "thread {}: clear_child_tid address {addr:#x} is unmapped",
            thread.tid()
        ),
    }
}
