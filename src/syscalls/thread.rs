//! Thread-family syscall handlers: clone, futex, robust lists, TLS.
//!
//! These are the translating handlers - the ones that need semantic work
//! beyond relaying to the host. Clone routes through the thread/process
//! emulation in [`crate::threads`]; the futex and robust-list entries relay to
//! the host primitive after address translation; the TLS entries mutate the
//! calling thread's segment bases directly.

use crate::{
    syscalls::{errno_result, SyscallArguments, SyscallTable, ThreadContext},
    threads::{
        emulate_clone, futex_relay, get_robust_list_relay, set_robust_list_relay, CloneFlags,
        CloneRequest,
    },
    Result,
};

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

pub(crate) fn register_native(table: &mut SyscallTable) -> Result<()> {
    table.register(56, 5, sys_clone)?; // clone
    table.register(60, 1, sys_exit)?; // exit
    table.register(158, 2, sys_arch_prctl)?; // arch_prctl
    table.register(202, 6, sys_futex)?; // futex
    table.register(218, 1, sys_set_tid_address)?; // set_tid_address
    table.register(231, 1, sys_exit_group)?; // exit_group
    table.register(273, 2, sys_set_robust_list)?; // set_robust_list
    table.register(274, 3, sys_get_robust_list)?; // get_robust_list
    Ok(())
}

pub(crate) fn register_compat(table: &mut SyscallTable) -> Result<()> {
    table.register(1, 1, sys_exit)?; // exit
    table.register(120, 5, sys_clone_compat)?; // clone
    table.register(240, 6, sys_futex)?; // futex
    table.register(243, 1, sys_set_thread_area)?; // set_thread_area
    table.register(252, 1, sys_exit_group)?; // exit_group
    table.register(258, 1, sys_set_tid_address)?; // set_tid_address
    table.register(311, 2, sys_set_robust_list)?; // set_robust_list
    table.register(312, 3, sys_get_robust_list)?; // get_robust_list
    Ok(())
}

/// clone(flags, stack, parent_tid, child_tid, tls) - native argument order.
fn sys_clone(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    let request = CloneRequest {
        flags: CloneFlags::from_bits_retain(args.get(0)),
        stack: args.get(1),
        parent_tid: args.get(2),
        child_tid: args.get(3),
        tls: args.get(4),
    };
    emulate_clone(ctx, &request)
}

/// clone(flags, stack, parent_tid, tls, child_tid) - the compatibility
/// convention swaps the last two arguments.
fn sys_clone_compat(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    let request = CloneRequest {
        flags: CloneFlags::from_bits_retain(args.get(0)),
        stack: args.get(1),
        parent_tid: args.get(2),
        tls: args.get(3),
        child_tid: args.get(4),
    };
    emulate_clone(ctx, &request)
}

/// futex(uaddr, op, val, timeout, uaddr2, val3) - direct relay to the host
/// primitive after address translation.
fn sys_futex(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    Ok(futex_relay(
        ctx.memory(),
        args.get(0),
        args.get(1),
        args.get(2),
        args.get(3),
        args.get(4),
        args.get(5),
    ))
}

/// set_robust_list(head, len) - records the guest head pointer in the thread's
/// bookkeeping, then relays the registration to the host.
fn sys_set_robust_list(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    let head = args.get(0);
    ctx.thread().manager_mut()?.robust_list_head = head;
    Ok(set_robust_list_relay(ctx.memory(), head, args.get(1)))
}

/// get_robust_list(pid, head_ptr, len_ptr) - relay, with the guest thread id
/// resolved to the backing host thread first.
fn sys_get_robust_list(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    let host_tid = match args.get(0) {
        0 => 0,
        tid => match ctx.context().threads().get(tid) {
            Some(thread) => thread.manager()?.host_tid,
            None => return Ok(errno_result(libc::ESRCH)),
        },
    };

    Ok(get_robust_list_relay(
        ctx.memory(),
        host_tid,
        args.get(1),
        args.get(2),
    ))
}

/// set_tid_address(tidptr) - records the clear-on-exit address and returns the
/// caller's thread id.
fn sys_set_tid_address(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    ctx.thread().manager_mut()?.clear_child_tid = args.get(0);
    Ok(ctx.thread().tid())
}

/// arch_prctl(code, addr) - segment-base access for native guests.
fn sys_arch_prctl(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    match args.get(0) {
        ARCH_SET_FS => {
            ctx.cpu.fs_base = args.get(1);
            Ok(0)
        }
        ARCH_SET_GS => {
            ctx.cpu.gs_base = args.get(1);
            Ok(0)
        }
        ARCH_GET_FS => write_u64(ctx, args.get(1), ctx.cpu.fs_base),
        ARCH_GET_GS => write_u64(ctx, args.get(1), ctx.cpu.gs_base),
        _ => Ok(errno_result(libc::EINVAL)),
    }
}

/// set_thread_area(user_desc) - compatibility-mode TLS assignment. Only the
/// base address of the descriptor is honored; the emulated CPU has no real
/// descriptor table.
fn sys_set_thread_area(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    let desc = args.get(0);
    // user_desc: entry_number at offset 0, base_addr at offset 4.
    let Ok(host) = ctx.memory().translate_range(desc, 16) else {
        return Ok(errno_result(libc::EFAULT));
    };

    let base = unsafe { std::ptr::read((host + 4) as *const u32) };
    ctx.cpu.fs_base = u64::from(base);
    Ok(0)
}

/// exit(status) - retires the calling thread; the run loop tears it down at
/// the trap boundary.
fn sys_exit(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    log::debug!(
        "thread {} exiting with status {}",
        ctx.thread().tid(),
        args.get(0) as i64
    );
    ctx.thread().retire();
    Ok(0)
}

/// exit_group(status) - drives the whole context to shutdown.
fn sys_exit_group(ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
    log::debug!("guest exit_group with status {}", args.get(0) as i64);
    ctx.thread().retire();
    ctx.context().request_shutdown();
    Ok(0)
}

fn write_u64(ctx: &ThreadContext<'_>, guest_addr: u64, value: u64) -> Result<u64> {
    let Ok(host) = ctx.memory().translate_range(guest_addr, 8) else {
        return Ok(errno_result(libc::EFAULT));
    };
    unsafe { std::ptr::write(host as *mut u64, value) };
    Ok(0)
}
