//! Guest thread/process creation and the futex / robust-list relays.
//!
//! The guest's `clone` request is interpreted in two stages. [`classify_clone`]
//! is a pure function that validates the flag mask and decides between the
//! "new host thread" and "new host process" paths; it performs no side effects,
//! so unsupported combinations can be tested in isolation. [`emulate_clone`]
//! then acts on the disposition: spawning a host thread that shares everything,
//! or duplicating the host process for the fork-style profile.
//!
//! Only two flag profiles are supported:
//!
//! - **Thread**: `CLONE_THREAD` with `CLONE_SYSVSEM | CLONE_FS | CLONE_FILES |
//!   CLONE_SIGHAND` all set (the POSIX-thread "all shared" shape)
//! - **Fork**: no `CLONE_THREAD` and no shared-resource bits at all
//!
//! vfork without shared memory degrades to a plain fork - an explicit
//! compatibility decision, logged rather than silently applied. Namespace
//! requests are always rejected. Ptrace-related bits are logged and ignored.

use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    cpu::Gpr,
    memory::MemoryMap,
    syscalls::{errno_result, host_result, ThreadContext},
    Error, Result,
};

bitflags! {
    /// Linux clone-flag bitmask as supplied by the guest.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CloneFlags: u64 {
        /// Mask of the termination-signal bits.
        const CSIGNAL = 0x0000_00FF;
        /// Share the memory space.
        const VM = 0x0000_0100;
        /// Share filesystem information.
        const FS = 0x0000_0200;
        /// Share the file-descriptor table.
        const FILES = 0x0000_0400;
        /// Share signal handlers.
        const SIGHAND = 0x0000_0800;
        /// Legacy ptrace continuation.
        const PTRACE = 0x0000_2000;
        /// Suspend the caller until the child execs or exits.
        const VFORK = 0x0000_4000;
        /// Child gets the caller's parent.
        const PARENT = 0x0000_8000;
        /// Place the child in the caller's thread group.
        const THREAD = 0x0001_0000;
        /// New mount namespace.
        const NEWNS = 0x0002_0000;
        /// Share System V semaphore undo values.
        const SYSVSEM = 0x0004_0000;
        /// Set the child's TLS descriptor.
        const SETTLS = 0x0008_0000;
        /// Write the child tid to the parent's memory.
        const PARENT_SETTID = 0x0010_0000;
        /// Clear the child tid and futex-wake on exit.
        const CHILD_CLEARTID = 0x0020_0000;
        /// Historical, ignored.
        const DETACHED = 0x0040_0000;
        /// Do not let a tracer force CLONE_PTRACE.
        const UNTRACED = 0x0080_0000;
        /// Write the child tid to the child's memory.
        const CHILD_SETTID = 0x0100_0000;
        /// New cgroup namespace.
        const NEWCGROUP = 0x0200_0000;
        /// New UTS namespace.
        const NEWUTS = 0x0400_0000;
        /// New IPC namespace.
        const NEWIPC = 0x0800_0000;
        /// New user namespace.
        const NEWUSER = 0x1000_0000;
        /// New pid namespace.
        const NEWPID = 0x2000_0000;
        /// New network namespace.
        const NEWNET = 0x4000_0000;
        /// Share I/O context.
        const IO = 0x8000_0000;

        /// All namespace-request bits; always rejected.
        const NAMESPACES = Self::NEWNS.bits()
            | Self::NEWCGROUP.bits()
            | Self::NEWUTS.bits()
            | Self::NEWIPC.bits()
            | Self::NEWUSER.bits()
            | Self::NEWPID.bits()
            | Self::NEWNET.bits();

        /// The resource-sharing group that must be all-set with `THREAD` and
        /// all-clear without it.
        const SHARED_RESOURCES =
            Self::SYSVSEM.bits() | Self::FS.bits() | Self::FILES.bits() | Self::SIGHAND.bits();
    }
}

/// A guest request to create a new thread of control.
#[derive(Clone, Copy, Debug)]
pub struct CloneRequest {
    /// Clone-flag bitmask.
    pub flags: CloneFlags,
    /// Stack pointer for the child, zero to inherit.
    pub stack: u64,
    /// Guest address receiving the child tid in the parent (`PARENT_SETTID`).
    pub parent_tid: u64,
    /// Guest address receiving the child tid in the child (`CHILD_SETTID`) and
    /// cleared on exit (`CHILD_CLEARTID`).
    pub child_tid: u64,
    /// TLS pointer for the child (`SETTLS`).
    pub tls: u64,
}

/// The validated routing decision for a clone request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneDisposition {
    /// Duplicate the host process; carries the flag mask after any vfork
    /// degrade has been applied.
    Fork(CloneFlags),
    /// Spawn a new host thread sharing everything with the caller.
    Thread(CloneFlags),
}

/// Validates a clone-flag mask and routes it to the thread or fork path.
///
/// This is a pure classification: no thread or process state is created, which
/// keeps the fatal combinations testable without side effects. The caller acts
/// on the returned [`CloneDisposition`].
///
/// # Errors
///
/// - [`Error::NamespacesUnsupported`] if any namespace bit is set
/// - [`Error::UnsupportedCloneFlags`] for partial resource sharing without
///   `CLONE_THREAD`, or for `CLONE_THREAD` without the full shared profile
///
/// Both are fatal to the emulated process: they indicate an emulation
/// capability gap, not a guest-correctable condition.
pub fn classify_clone(flags: CloneFlags) -> Result<CloneDisposition> {
    if flags.intersects(CloneFlags::NAMESPACES) {
        return Err(Error::NamespacesUnsupported {
            flags: flags.bits(),
        });
    }

    if flags.intersects(CloneFlags::PTRACE | CloneFlags::UNTRACED) {
        log::debug!("clone: ptrace-related flags ignored ({:#x})", flags.bits());
    }

    if !flags.contains(CloneFlags::THREAD) {
        let mut flags = flags;

        if flags.contains(CloneFlags::VFORK) && !flags.contains(CloneFlags::VM) {
            // vfork without full sharing degrades to fork.
            flags.remove(CloneFlags::VFORK | CloneFlags::VM);
            log::warn!("clone: CLONE_VFORK without CLONE_THREAD degrades to plain fork");
        }

        if flags.intersects(CloneFlags::SHARED_RESOURCES | CloneFlags::VM) {
            return Err(Error::UnsupportedCloneFlags {
                flags: flags.bits(),
                reason: "shared resources without CLONE_THREAD",
            });
        }

        // CLONE_PARENT is ignored; it is implied by CLONE_THREAD.
        return Ok(CloneDisposition::Fork(flags));
    }

    if !flags.contains(CloneFlags::SHARED_RESOURCES) {
        return Err(Error::UnsupportedCloneFlags {
            flags: flags.bits(),
            reason: "CLONE_THREAD requires sysvsem, fs, files, and sighand to all be shared",
        });
    }

    Ok(CloneDisposition::Thread(flags))
}

/// Emulates a guest clone request on behalf of the calling thread.
///
/// Classification failures propagate as errors so the run loop can surface the
/// diagnostic and terminate; everything the guest can observe (including host
/// fork failure) is returned as a kernel-convention value inside `Ok`.
///
/// # Errors
///
/// The fatal classification errors of [`classify_clone`], plus internal
/// failures while spawning the host thread.
pub(crate) fn emulate_clone(ctx: &mut ThreadContext<'_>, req: &CloneRequest) -> Result<u64> {
    log_clone_flags(req.flags);

    match classify_clone(req.flags)? {
        CloneDisposition::Fork(flags) => Ok(fork_guest(ctx, flags)),
        CloneDisposition::Thread(flags) => clone_thread(ctx, flags, req),
    }
}

/// Process-fork path: duplicate the host process.
///
/// The emulator state is duplicated wholesale with the host process, so the
/// child resumes inside its own copy of the run loop with the syscall result
/// register holding zero.
fn fork_guest(ctx: &ThreadContext<'_>, _flags: CloneFlags) -> u64 {
    let running = ctx.context().threads().running_count();
    if running > 1 {
        log::warn!(
            "clone: forking a guest with {running} live threads; \
             only single-threaded fork is well-defined, continuing"
        );
    } else {
        log::debug!("clone: forking guest process");
    }

    let pid = unsafe { libc::fork() };
    host_result(i64::from(pid))
}

/// Shared-thread path: spawn a new host thread sharing everything.
fn clone_thread(
    ctx: &mut ThreadContext<'_>,
    flags: CloneFlags,
    req: &CloneRequest,
) -> Result<u64> {
    let context = Arc::clone(ctx.context());

    // The child continues at the parent's post-syscall instruction pointer
    // with the requested stack, TLS base, and a zero syscall result.
    let mut child_cpu = ctx.cpu.clone();
    child_cpu.set_gpr(Gpr::Rax, 0);
    if req.stack != 0 {
        child_cpu.set_gpr(Gpr::Rsp, req.stack);
    }
    if flags.contains(CloneFlags::SETTLS) {
        child_cpu.fs_base = req.tls;
    }

    // Resolve the tid write-back addresses before any thread state exists, so
    // a bad pointer fails the request without leaving an unrunnable entry in
    // the registry.
    let parent_tid_host = if flags.contains(CloneFlags::PARENT_SETTID) {
        match context.memory().translate_range(req.parent_tid, 4) {
            Ok(host) => Some(host),
            Err(err) => {
                log::debug!("clone: parent tid address {:#x} unusable: {err}", req.parent_tid);
                return Ok(errno_result(libc::EFAULT));
            }
        }
    } else {
        None
    };
    let child_tid_host = if flags.contains(CloneFlags::CHILD_SETTID) {
        match context.memory().translate_range(req.child_tid, 4) {
            Ok(host) => Some(host),
            Err(err) => {
                log::debug!("clone: child tid address {:#x} unusable: {err}", req.child_tid);
                return Ok(errno_result(libc::EFAULT));
            }
        }
    } else {
        None
    };

    let child = context.create_thread(child_cpu);
    let child_tid = child.tid();

    if flags.contains(CloneFlags::CHILD_CLEARTID) {
        child.manager_mut()?.clear_child_tid = req.child_tid;
    }

    if let Some(host) = parent_tid_host {
        write_tid(host, child_tid as u32);
    }
    if let Some(host) = child_tid_host {
        write_tid(host, child_tid as u32);
    }

    log::debug!(
        "clone: child {child_tid} starting at {:#x}, parent at {:#x}",
        child.cpu_state()?.rip,
        ctx.cpu.rip
    );

    context.run_thread(&child)?;

    if flags.contains(CloneFlags::VFORK) {
        // The caller is suspended until the child execs or exits: a
        // thread-to-thread join, not a context-wide block.
        if let Some(handle) = child.take_join() {
            if handle.join().is_err() {
                log::warn!("clone: vfork child thread panicked");
            }
        }
    }

    Ok(child_tid)
}

/// Writes a thread id through an already-translated host address.
fn write_tid(host: u64, tid: u32) {
    unsafe { std::ptr::write(host as *mut u32, tid) };
}

/// Relays a futex operation to the host primitive.
///
/// The guest and host futex word layouts are assumed bit-compatible; this is an
/// explicit compatibility assumption validated per target platform, not a
/// guarantee. Operation code, value, and timeout pass through unmodified; only
/// the addresses cross the translation boundary.
pub(crate) fn futex_relay(
    memory: &MemoryMap,
    uaddr: u64,
    op: u64,
    val: u64,
    timeout: u64,
    uaddr2: u64,
    val3: u64,
) -> u64 {
    let Ok(uaddr_host) = memory.translate_range(uaddr, 4) else {
        return errno_result(libc::EFAULT);
    };
    // A null timeout stays null; some ops reuse this slot as a plain value, in
    // which case translation does not apply and the raw value is relayed. Both
    // modifier bits must be stripped before the command compare, or a wait op
    // carrying FUTEX_CLOCK_REALTIME would relay its timespec untranslated.
    let cmd = op as i32 & !(libc::FUTEX_PRIVATE_FLAG | libc::FUTEX_CLOCK_REALTIME);
    let timeout_host = match cmd {
        libc::FUTEX_WAIT
        | libc::FUTEX_WAIT_BITSET
        | libc::FUTEX_LOCK_PI
        | libc::FUTEX_WAIT_REQUEUE_PI
            if timeout != 0 =>
        {
            match memory.translate_range(timeout, 16) {
                Ok(host) => host,
                Err(_) => return errno_result(libc::EFAULT),
            }
        }
        _ => timeout,
    };
    let uaddr2_host = if uaddr2 != 0 {
        match memory.translate_range(uaddr2, 4) {
            Ok(host) => host,
            Err(_) => return errno_result(libc::EFAULT),
        }
    } else {
        0
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr_host,
            op,
            val,
            timeout_host,
            uaddr2_host,
            val3,
        )
    };
    host_result(ret)
}

/// Relays a robust-list registration to the host.
pub(crate) fn set_robust_list_relay(memory: &MemoryMap, head: u64, len: u64) -> u64 {
    let Ok(head_host) = memory.translate_range(head, len.max(1)) else {
        return errno_result(libc::EFAULT);
    };

    let ret = unsafe { libc::syscall(libc::SYS_set_robust_list, head_host, len) };
    host_result(ret)
}

/// Relays a robust-list query to the host; the list contents pass through
/// untranslated.
pub(crate) fn get_robust_list_relay(
    memory: &MemoryMap,
    pid: u64,
    head_ptr: u64,
    len_ptr: u64,
) -> u64 {
    let Ok(head_host) = memory.translate_range(head_ptr, 8) else {
        return errno_result(libc::EFAULT);
    };
    let Ok(len_host) = memory.translate_range(len_ptr, 8) else {
        return errno_result(libc::EFAULT);
    };

    let ret = unsafe { libc::syscall(libc::SYS_get_robust_list, pid, head_host, len_host) };
    host_result(ret)
}

fn log_clone_flags(flags: CloneFlags) {
    if log::log_enabled!(log::Level::Debug) {
        for (name, flag) in flags.iter_names() {
            log::debug!("clone: flag {name} ({:#x})", flag.bits());
        }
    }
}
