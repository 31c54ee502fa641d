//! Syscall tables, argument marshaling, and dispatch.
//!
//! Each calling-convention mode carries its own fixed-capacity table, because
//! syscall numbers and argument layouts differ between the native and
//! compatibility conventions. A table entry is a typed [`SyscallHandler`] plus
//! the declared argument count; dispatch marshals exactly that many raw values
//! from the trapping thread's registers and invokes the handler.
//!
//! The default tables are built once per process behind a `OnceLock` and are
//! immutable afterwards. The only sanctioned runtime mutation path is the
//! per-context override layer
//! ([`ExecutionContext::register_syscall_override`](crate::context::ExecutionContext::register_syscall_override)),
//! which is consulted before the static tables.
//!
//! # Result convention
//!
//! Handlers return a raw 64-bit value using the kernel convention: a negative
//! errno encoded into the value for guest-visible failure, anything else
//! returned to the guest unmodified. Host `libc` failures (`-1` plus `errno`)
//! are converted with [`host_result`]-style mapping so the guest cannot tell
//! an emulated failure from a real one. A missing table entry yields `-ENOSYS`
//! and touches nothing else.
//!
//! Fatal conditions - emulation capability gaps rather than guest-correctable
//! failures - propagate as [`Error`] so the run loop owns the termination
//! decision; dispatch itself never terminates anything.

mod passthrough;
mod thread;

pub use passthrough::Passthrough;

use std::sync::{Arc, OnceLock};

use crate::{
    context::ExecutionContext,
    cpu::{CpuState, ExecutionMode, Gpr},
    memory::MemoryMap,
    threads::ThreadHandle,
    Error, Result,
};

/// Maximum number of syscall arguments in either calling convention.
pub const MAX_ARGS: usize = 6;

/// Fixed capacity of each per-mode syscall table.
pub const TABLE_CAPACITY: usize = 512;

/// An ordered, fixed-arity sequence of raw syscall argument values.
///
/// Immutable once marshaled; slots past the declared count read as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallArguments {
    values: [u64; MAX_ARGS],
    count: u8,
}

impl SyscallArguments {
    /// Builds an argument list from up to [`MAX_ARGS`] raw values.
    #[must_use]
    pub fn new(values: &[u64]) -> Self {
        let count = values.len().min(MAX_ARGS);
        let mut slots = [0u64; MAX_ARGS];
        slots[..count].copy_from_slice(&values[..count]);
        Self {
            values: slots,
            count: count as u8,
        }
    }

    /// Marshals arguments from a register file per the calling convention.
    ///
    /// Compatibility-mode registers are truncated to 32 bits, matching what
    /// the guest ABI can actually pass.
    pub(crate) fn from_cpu(cpu: &CpuState, mode: ExecutionMode, count: u8) -> Self {
        let order: [Gpr; MAX_ARGS] = match mode {
            ExecutionMode::Native => {
                [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::R10, Gpr::R8, Gpr::R9]
            }
            ExecutionMode::Compat => {
                [Gpr::Rbx, Gpr::Rcx, Gpr::Rdx, Gpr::Rsi, Gpr::Rdi, Gpr::Rbp]
            }
        };

        let count = (count as usize).min(MAX_ARGS);
        let mut values = [0u64; MAX_ARGS];
        for (slot, reg) in values.iter_mut().zip(order.iter()).take(count) {
            *slot = match mode {
                ExecutionMode::Native => cpu.gpr(*reg),
                ExecutionMode::Compat => cpu.gpr(*reg) & 0xFFFF_FFFF,
            };
        }

        Self {
            values,
            count: count as u8,
        }
    }

    /// Returns argument `index`, or zero past the declared count.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        if index < self.count as usize {
            self.values[index]
        } else {
            0
        }
    }

    /// Declared argument count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// The declared arguments as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.values[..self.count as usize]
    }

    /// Returns a copy truncated to at most `count` arguments.
    #[must_use]
    pub fn truncated(&self, count: u8) -> Self {
        let count = (count as usize).min(self.count as usize);
        let mut values = [0u64; MAX_ARGS];
        values[..count].copy_from_slice(&self.values[..count]);
        Self {
            values,
            count: count as u8,
        }
    }
}

/// Per-invocation view of the thread a syscall executes on behalf of.
///
/// Handlers receive the owning thread's register file mutably (the thread is
/// parked in its trap handler for the duration), plus access to the owning
/// context for memory translation and thread/process emulation.
pub struct ThreadContext<'a> {
    context: &'a Arc<ExecutionContext>,
    thread: &'a Arc<ThreadHandle>,
    /// The calling thread's live register file.
    pub cpu: &'a mut CpuState,
}

impl<'a> ThreadContext<'a> {
    pub(crate) fn new(
        context: &'a Arc<ExecutionContext>,
        thread: &'a Arc<ThreadHandle>,
        cpu: &'a mut CpuState,
    ) -> Self {
        Self {
            context,
            thread,
            cpu,
        }
    }

    /// The owning execution context.
    #[must_use]
    pub fn context(&self) -> &Arc<ExecutionContext> {
        self.context
    }

    /// The calling thread's handle.
    #[must_use]
    pub fn thread(&self) -> &Arc<ThreadHandle> {
        self.thread
    }

    /// The context's guest memory map, for address translation.
    #[must_use]
    pub fn memory(&self) -> &MemoryMap {
        self.context.memory()
    }
}

/// A typed syscall handler: one `invoke` operation.
///
/// Implemented automatically for matching closures, so table population and
/// overrides can use either plain functions or capturing closures.
pub trait SyscallHandler: Send + Sync {
    /// Executes the syscall on behalf of `ctx`'s thread.
    ///
    /// Returns the raw guest-visible result (kernel negative-errno
    /// convention).
    ///
    /// # Errors
    ///
    /// Only for fatal emulation gaps; guest-visible failures are encoded in
    /// the `Ok` value.
    fn invoke(&self, ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64>;
}

impl<F> SyscallHandler for F
where
    F: Fn(&mut ThreadContext<'_>, &SyscallArguments) -> Result<u64> + Send + Sync,
{
    fn invoke(&self, ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
        self(ctx, args)
    }
}

#[derive(Clone)]
pub(crate) struct TableEntry {
    pub(crate) handler: Arc<dyn SyscallHandler>,
    pub(crate) arg_count: u8,
}

/// A fixed-capacity syscall table for one calling-convention mode.
pub struct SyscallTable {
    entries: Vec<Option<TableEntry>>,
}

impl SyscallTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
        }
    }

    /// Registers a handler with its declared argument count.
    ///
    /// Only table construction uses this; the runtime mutation path for
    /// embedders is the per-context override layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyscallOutOfRange`] if `number` exceeds the table's
    /// fixed capacity.
    pub(crate) fn register(
        &mut self,
        number: usize,
        arg_count: u8,
        handler: impl SyscallHandler + 'static,
    ) -> Result<()> {
        if number >= self.entries.len() {
            return Err(Error::SyscallOutOfRange {
                number: number as u64,
                capacity: self.entries.len(),
            });
        }

        self.entries[number] = Some(TableEntry {
            handler: Arc::new(handler),
            arg_count,
        });
        Ok(())
    }

    pub(crate) fn lookup(&self, number: u64) -> Option<&TableEntry> {
        self.entries.get(number as usize).and_then(Option::as_ref)
    }

    /// The table's fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of populated entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Whether no entries are populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable")
            .field("capacity", &self.capacity())
            .field("registered", &self.len())
            .finish()
    }
}

/// The process-wide default syscall tables, one per execution mode.
///
/// Built once at initialization and immutable thereafter; contexts layer their
/// overrides on top rather than mutating these.
pub struct SyscallTables {
    native: SyscallTable,
    compat: SyscallTable,
}

impl SyscallTables {
    fn build() -> Result<Self> {
        let mut native = SyscallTable::with_capacity(TABLE_CAPACITY);
        let mut compat = SyscallTable::with_capacity(TABLE_CAPACITY);

        thread::register_native(&mut native)?;
        thread::register_compat(&mut compat)?;
        passthrough::register_native(&mut native)?;
        passthrough::register_compat(&mut compat)?;

        Ok(Self { native, compat })
    }

    /// The table for the given execution mode.
    #[must_use]
    pub fn table(&self, mode: ExecutionMode) -> &SyscallTable {
        match mode {
            ExecutionMode::Native => &self.native,
            ExecutionMode::Compat => &self.compat,
        }
    }
}

static TABLES: OnceLock<SyscallTables> = OnceLock::new();

/// Returns the process-wide default tables, building them on first use.
///
/// Construction is idempotent: concurrent first calls race to build and the
/// winner's tables are kept.
///
/// # Errors
///
/// Propagates a table-construction failure on the first call.
pub fn tables() -> Result<&'static SyscallTables> {
    if let Some(tables) = TABLES.get() {
        return Ok(tables);
    }

    let built = SyscallTables::build()?;
    Ok(TABLES.get_or_init(|| built))
}

/// Dispatches a trapped syscall, marshaling arguments from the thread's
/// registers.
///
/// Lookup consults the context's override layer first, then the immutable
/// default table for the thread's mode. A miss returns the guest-visible
/// `-ENOSYS` without touching any other state.
///
/// # Errors
///
/// Fatal handler errors propagate for the run loop to act on.
pub(crate) fn dispatch(
    ctx: &mut ThreadContext<'_>,
    mode: ExecutionMode,
    number: u64,
) -> Result<u64> {
    let Some(entry) = resolve(ctx.context(), mode, number)? else {
        log::debug!("syscall {number} ({mode}): no handler, returning ENOSYS");
        return Ok(errno_result(libc::ENOSYS));
    };

    let args = SyscallArguments::from_cpu(ctx.cpu, mode, entry.arg_count);
    entry.handler.invoke(ctx, &args)
}

/// Dispatches with caller-supplied arguments, for manual/debug invocation.
///
/// The provided arguments are truncated to the entry's declared count so the
/// handler sees exactly what register marshaling would have produced.
///
/// # Errors
///
/// Same as [`dispatch`].
pub(crate) fn dispatch_args(
    ctx: &mut ThreadContext<'_>,
    mode: ExecutionMode,
    number: u64,
    args: &SyscallArguments,
) -> Result<u64> {
    let Some(entry) = resolve(ctx.context(), mode, number)? else {
        return Ok(errno_result(libc::ENOSYS));
    };

    let args = args.truncated(entry.arg_count);
    entry.handler.invoke(ctx, &args)
}

fn resolve(
    context: &Arc<ExecutionContext>,
    mode: ExecutionMode,
    number: u64,
) -> Result<Option<TableEntry>> {
    if let Some(entry) = context.syscall_override(mode, number) {
        return Ok(Some(entry));
    }
    Ok(tables()?.table(mode).lookup(number).cloned())
}

/// Converts a host `libc` result (`-1` plus `errno`) to the kernel
/// negative-errno convention the guest expects.
#[must_use]
pub fn host_result(ret: i64) -> u64 {
    if ret == -1 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        errno_result(errno)
    } else {
        ret as u64
    }
}

/// Encodes an errno as a guest-visible kernel-convention failure value.
#[must_use]
pub fn errno_result(errno: i32) -> u64 {
    (-i64::from(errno)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_argument_order() {
        let mut cpu = CpuState::default();
        cpu.set_gpr(Gpr::Rdi, 1);
        cpu.set_gpr(Gpr::Rsi, 2);
        cpu.set_gpr(Gpr::Rdx, 3);
        cpu.set_gpr(Gpr::R10, 4);
        cpu.set_gpr(Gpr::R8, 5);
        cpu.set_gpr(Gpr::R9, 6);

        let args = SyscallArguments::from_cpu(&cpu, ExecutionMode::Native, 6);
        assert_eq!(args.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_compat_argument_order_and_truncation() {
        let mut cpu = CpuState::default();
        cpu.set_gpr(Gpr::Rbx, 0xFFFF_FFFF_0000_0001);
        cpu.set_gpr(Gpr::Rcx, 2);
        cpu.set_gpr(Gpr::Rdx, 3);
        cpu.set_gpr(Gpr::Rsi, 4);
        cpu.set_gpr(Gpr::Rdi, 5);
        cpu.set_gpr(Gpr::Rbp, 6);

        let args = SyscallArguments::from_cpu(&cpu, ExecutionMode::Compat, 6);
        // Upper halves never cross the 32-bit ABI boundary.
        assert_eq!(args.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_declared_count_limits_marshaling() {
        let mut cpu = CpuState::default();
        cpu.set_gpr(Gpr::Rdi, 1);
        cpu.set_gpr(Gpr::Rsi, 2);
        cpu.set_gpr(Gpr::Rdx, 3);

        let args = SyscallArguments::from_cpu(&cpu, ExecutionMode::Native, 2);
        assert_eq!(args.count(), 2);
        assert_eq!(args.get(0), 1);
        assert_eq!(args.get(1), 2);
        // Past the declared count reads as zero even though the register holds 3.
        assert_eq!(args.get(2), 0);
    }

    #[test]
    fn test_register_out_of_range() {
        let mut table = SyscallTable::with_capacity(TABLE_CAPACITY);
        let err = table
            .register(TABLE_CAPACITY, 0, |_: &mut ThreadContext<'_>, _: &SyscallArguments| Ok(0))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::SyscallOutOfRange {
                number,
                capacity: TABLE_CAPACITY,
            } if number == TABLE_CAPACITY as u64
        ));
    }

    #[test]
    fn test_errno_result_encoding() {
        assert_eq!(errno_result(libc::ENOSYS), (-38i64) as u64);
        assert_eq!(host_result(42), 42);
        assert_eq!(host_result(0), 0);
    }

    #[test]
    fn test_default_tables_populate_both_modes() {
        let tables = tables().unwrap();
        assert!(!tables.table(ExecutionMode::Native).is_empty());
        assert!(!tables.table(ExecutionMode::Compat).is_empty());

        // clone lives at different numbers per mode.
        assert!(tables.table(ExecutionMode::Native).lookup(56).is_some());
        assert!(tables.table(ExecutionMode::Compat).lookup(120).is_some());
    }

    #[test]
    fn test_truncated_arguments() {
        let args = SyscallArguments::new(&[9, 8, 7, 6]);
        let cut = args.truncated(2);
        assert_eq!(cut.count(), 2);
        assert_eq!(cut.as_slice(), &[9, 8]);
        assert_eq!(cut.get(3), 0);
    }
}
