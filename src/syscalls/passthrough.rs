//! Generic passthrough handler and the default passthrough registrations.
//!
//! A [`Passthrough`] entry relays a guest syscall one-to-one to an equivalent
//! host syscall, preserving the host errno exactly. Arguments flagged as
//! pointers cross the guest address-translation boundary first; everything
//! else is relayed raw. Null pointers stay null.

use crate::{
    syscalls::{errno_result, host_result, SyscallArguments, SyscallTable, ThreadContext},
    Result,
};

/// A one-to-one relay from a guest syscall to a host syscall.
///
/// # Examples
///
/// ```rust
/// use guestcore::Passthrough;
///
/// // gettimeofday(tv, tz): both arguments are pointers.
/// let handler = Passthrough::new(libc::SYS_gettimeofday).with_pointer_args(0b11);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Passthrough {
    host_nr: libc::c_long,
    pointer_args: u8,
}

impl Passthrough {
    /// Creates a passthrough to the given host syscall number with no pointer
    /// arguments.
    #[must_use]
    pub fn new(host_nr: libc::c_long) -> Self {
        Self {
            host_nr,
            pointer_args: 0,
        }
    }

    /// Marks arguments as guest pointers by bit position.
    ///
    /// Flagged arguments are translated to host addresses before the relay; a
    /// non-null value with no backing region yields a guest-visible `EFAULT`.
    #[must_use]
    pub fn with_pointer_args(mut self, mask: u8) -> Self {
        self.pointer_args = mask;
        self
    }
}

impl crate::syscalls::SyscallHandler for Passthrough {
    fn invoke(&self, ctx: &mut ThreadContext<'_>, args: &SyscallArguments) -> Result<u64> {
        let mut host_args = [0u64; 6];

        for (index, slot) in host_args.iter_mut().enumerate().take(args.count()) {
            let value = args.get(index);
            *slot = if self.pointer_args & (1 << index) != 0 && value != 0 {
                match ctx.memory().translate(value) {
                    Ok(host) => host,
                    Err(_) => return Ok(errno_result(libc::EFAULT)),
                }
            } else {
                value
            };
        }

        let ret = unsafe {
            libc::syscall(
                self.host_nr,
                host_args[0],
                host_args[1],
                host_args[2],
                host_args[3],
                host_args[4],
                host_args[5],
            )
        };
        Ok(host_result(ret))
    }
}

pub(crate) fn register_native(table: &mut SyscallTable) -> Result<()> {
    table.register(16, 3, Passthrough::new(libc::SYS_ioctl).with_pointer_args(0b100))?; // ioctl
    table.register(24, 0, Passthrough::new(libc::SYS_sched_yield))?; // sched_yield
    table.register(34, 0, Passthrough::new(libc::SYS_pause))?; // pause
    table.register(39, 0, Passthrough::new(libc::SYS_getpid))?; // getpid
    table.register(96, 2, Passthrough::new(libc::SYS_gettimeofday).with_pointer_args(0b11))?; // gettimeofday
    table.register(100, 1, Passthrough::new(libc::SYS_times).with_pointer_args(0b1))?; // times
    table.register(186, 0, Passthrough::new(libc::SYS_gettid))?; // gettid
    table.register(201, 1, Passthrough::new(libc::SYS_time).with_pointer_args(0b1))?; // time
    Ok(())
}

pub(crate) fn register_compat(table: &mut SyscallTable) -> Result<()> {
    table.register(13, 1, Passthrough::new(libc::SYS_time).with_pointer_args(0b1))?; // time
    table.register(20, 0, Passthrough::new(libc::SYS_getpid))?; // getpid
    table.register(29, 0, Passthrough::new(libc::SYS_pause))?; // pause
    table.register(43, 1, Passthrough::new(libc::SYS_times).with_pointer_args(0b1))?; // times
    table.register(54, 3, Passthrough::new(libc::SYS_ioctl).with_pointer_args(0b100))?; // ioctl
    table.register(78, 2, Passthrough::new(libc::SYS_gettimeofday).with_pointer_args(0b11))?; // gettimeofday
    table.register(158, 0, Passthrough::new(libc::SYS_sched_yield))?; // sched_yield
    table.register(224, 0, Passthrough::new(libc::SYS_gettid))?; // gettid
    Ok(())
}
