//! End-to-end lifecycle tests driving an [`ExecutionContext`] with a scripted
//! backend.
//!
//! The scripted backend stands in for a real interpreter: each `run` or `step`
//! call plays the next step of a per-thread script, loading argument registers
//! and returning a trap. This exercises the real run loop, syscall dispatch,
//! clone emulation, and teardown paths without any instruction decoding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guestcore::prelude::*;
use guestcore::{errno_result, BackendFactory, SyscallArguments};

const GUEST_BASE: u64 = 0x1000_0000;
const ENTRY: u64 = 0x40_1000;
const STACK_TOP: u64 = 0x7fff_f000;

#[derive(Clone)]
enum Step {
    /// Load registers, then trap with the given syscall number.
    Syscall(u64, Vec<(Gpr, u64)>),
    /// Report guest exit with the given status.
    Exit(i32),
}

struct ScriptedBackend {
    steps: Vec<Step>,
    cursor: usize,
}

impl ScriptedBackend {
    fn play(&mut self, cpu: &mut CpuState) -> guestcore::Result<TrapReason> {
        let Some(step) = self.steps.get(self.cursor).cloned() else {
            return Ok(TrapReason::Exit { status: 0 });
        };
        self.cursor += 1;

        match step {
            Step::Syscall(number, regs) => {
                for (reg, value) in regs {
                    cpu.set_gpr(reg, value);
                }
                Ok(TrapReason::Syscall { number })
            }
            Step::Exit(status) => Ok(TrapReason::Exit { status }),
        }
    }
}

impl CpuBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn run(&mut self, cpu: &mut CpuState) -> guestcore::Result<TrapReason> {
        self.play(cpu)
    }

    fn step(&mut self, cpu: &mut CpuState) -> guestcore::Result<TrapReason> {
        self.play(cpu)
    }
}

/// Hands out one script per backend instantiation, in order; later
/// instantiations replay the final script.
fn scripted_factory(scripts: Vec<Vec<Step>>) -> BackendFactory {
    let scripts = Arc::new(scripts);
    let instantiated = Arc::new(AtomicUsize::new(0));

    Arc::new(move |_initial: &CpuState| {
        let index = instantiated
            .fetch_add(1, Ordering::SeqCst)
            .min(scripts.len() - 1);
        Box::new(ScriptedBackend {
            steps: scripts[index].clone(),
            cursor: 0,
        })
    })
}

struct FixedLoader {
    has_code: bool,
}

impl CodeLoader for FixedLoader {
    fn has_code(&self) -> bool {
        self.has_code
    }

    fn entry_point(&self) -> u64 {
        ENTRY
    }

    fn stack_pointer(&self) -> u64 {
        STACK_TOP
    }
}

fn ready_context(config: ContextConfig, scripts: Vec<Vec<Step>>) -> Arc<ExecutionContext> {
    let context = ExecutionContext::new(config);
    context.initialize().unwrap();
    context
        .set_backend_factory(BackendKind::Default, scripted_factory(scripts))
        .unwrap();
    context.init_core(&FixedLoader { has_code: true }).unwrap();
    context
}

/// An 8-byte-aligned host buffer mapped at [`GUEST_BASE`].
fn map_scratch(context: &ExecutionContext, words: usize) -> Vec<u64> {
    let buffer = vec![0u64; words];
    context
        .map_region(GUEST_BASE, buffer.as_ptr() as u64, (words * 8) as u64)
        .unwrap();
    buffer
}

fn wait_done(context: &ExecutionContext) {
    for _ in 0..5000 {
        if context.is_done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("context did not reach a terminal state");
}

#[test]
fn test_empty_loader_creates_no_thread() {
    let context = ExecutionContext::new(ContextConfig::default());
    context.initialize().unwrap();

    let err = context
        .init_core(&FixedLoader { has_code: false })
        .unwrap_err();
    assert!(matches!(err, Error::NoCode));
    assert!(context.threads().is_empty());
    assert!(matches!(context.start(true), Err(Error::CoreNotReady)));
}

#[test]
fn test_blocking_run_to_shutdown() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);

    let primary = context.threads().primary().unwrap();
    assert_eq!(primary.cpu_state().unwrap().rip, ENTRY);
    assert_eq!(primary.cpu_state().unwrap().gpr(Gpr::Rsp), STACK_TOP);

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
    assert!(context.is_done());
    assert!(!primary.is_running());
}

#[test]
fn test_async_run_reaches_shutdown() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);

    assert_eq!(context.start(false).unwrap(), ExitReason::AsyncRun);
    wait_done(&context);
    assert_eq!(context.exit_reason(), ExitReason::Shutdown);
}

#[test]
fn test_exit_group_shuts_down_context() {
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![Step::Syscall(231, vec![(Gpr::Rdi, 7)])]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
    assert_eq!(context.exit_reason(), ExitReason::Shutdown);
}

#[test]
fn test_unhandled_syscall_returns_enosys_and_continues() {
    // 499 is inside the table but never registered.
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![Step::Syscall(499, vec![]), Step::Exit(0)]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);

    let final_state = context.cpu_state().unwrap();
    assert_eq!(final_state.gpr(Gpr::Rax), errno_result(libc::ENOSYS));
}

#[test]
fn test_passthrough_getpid() {
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![Step::Syscall(39, vec![]), Step::Exit(0)]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
    assert_eq!(
        context.cpu_state().unwrap().gpr(Gpr::Rax),
        u64::from(std::process::id())
    );
}

#[test]
fn test_clone_spawns_guest_thread() {
    let flags = CloneFlags::THREAD
        | CloneFlags::SYSVSEM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::VM
        | CloneFlags::SETTLS
        | CloneFlags::PARENT_SETTID
        | CloneFlags::CHILD_SETTID;

    let parent_tid_addr = GUEST_BASE; // word 0
    let child_tid_addr = GUEST_BASE + 8; // word 1
    let child_stack = GUEST_BASE + 0x100;
    let child_tls = 0x7000;

    let parent = vec![
        Step::Syscall(
            56,
            vec![
                (Gpr::Rdi, flags.bits()),
                (Gpr::Rsi, child_stack),
                (Gpr::Rdx, parent_tid_addr),
                (Gpr::R10, child_tid_addr),
                (Gpr::R8, child_tls),
            ],
        ),
        Step::Exit(0),
    ];
    let child = vec![Step::Exit(0)];

    let context = ready_context(ContextConfig::default(), vec![parent, child]);
    let scratch = map_scratch(&context, 64);

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);

    // The clone result register in the parent holds the child tid.
    assert_eq!(context.cpu_state().unwrap().gpr(Gpr::Rax), 2);
    assert_eq!(context.threads().len(), 2);

    // Both tid write-backs landed in guest memory.
    assert_eq!(scratch[0] as u32, 2);
    assert_eq!(scratch[1] as u32, 2);

    // The child started from a copy of the parent's state with the requested
    // stack and TLS, and saw a zero clone result.
    let child = context.thread(2).unwrap();
    let child_state = child.cpu_state().unwrap();
    assert_eq!(child_state.rip, ENTRY);
    assert_eq!(child_state.gpr(Gpr::Rsp), child_stack);
    assert_eq!(child_state.fs_base, child_tls);
    assert_eq!(child_state.gpr(Gpr::Rax), 0);
    assert!(!child.is_running());
}

#[test]
fn test_child_cleartid_clears_word_on_exit() {
    let flags = CloneFlags::THREAD
        | CloneFlags::SYSVSEM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::VM
        | CloneFlags::CHILD_SETTID
        | CloneFlags::CHILD_CLEARTID;

    let child_tid_addr = GUEST_BASE;
    let parent = vec![
        Step::Syscall(
            56,
            vec![
                (Gpr::Rdi, flags.bits()),
                (Gpr::Rsi, 0),
                (Gpr::Rdx, 0),
                (Gpr::R10, child_tid_addr),
                (Gpr::R8, 0),
            ],
        ),
        Step::Exit(0),
    ];

    let context = ready_context(ContextConfig::default(), vec![parent, vec![Step::Exit(0)]]);
    let scratch = map_scratch(&context, 16);

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);

    // Set to the child tid at creation, cleared again at child exit.
    assert_eq!(scratch[0] as u32, 0);
}

#[test]
fn test_invalid_clone_profile_is_fatal() {
    // CLONE_THREAD without the full shared-resource profile.
    let flags = CloneFlags::THREAD | CloneFlags::VM;
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![
            Step::Syscall(56, vec![(Gpr::Rdi, flags.bits())]),
            Step::Exit(0),
        ]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::UnknownError);
    assert_eq!(context.threads().len(), 1);
}

#[test]
fn test_namespace_clone_is_fatal() {
    let flags = CloneFlags::NEWPID;
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![Step::Syscall(56, vec![(Gpr::Rdi, flags.bits())])]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::UnknownError);
}

#[test]
fn test_futex_wait_value_mismatch() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);
    let mut scratch = map_scratch(&context, 16);
    scratch[0] = 5;

    let thread = context.threads().primary().unwrap();
    let op = u64::from((libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG) as u32);

    // Expected value 6 against a stored 5: the host reports EAGAIN without
    // blocking.
    let result = context
        .handle_syscall(
            &thread,
            202,
            &SyscallArguments::new(&[GUEST_BASE, op, 6, 0, 0, 0]),
        )
        .unwrap();
    assert_eq!(result, errno_result(libc::EAGAIN));

    // An unmapped futex word is a guest-visible EFAULT.
    let result = context
        .handle_syscall(
            &thread,
            202,
            &SyscallArguments::new(&[0xdead_0000, op, 6, 0, 0, 0]),
        )
        .unwrap();
    assert_eq!(result, errno_result(libc::EFAULT));
}

#[test]
fn test_set_tid_address_records_and_returns_tid() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);
    let _scratch = map_scratch(&context, 16);

    let thread = context.threads().primary().unwrap();
    let result = context
        .handle_syscall(&thread, 218, &SyscallArguments::new(&[GUEST_BASE]))
        .unwrap();

    assert_eq!(result, thread.tid());
    assert_eq!(thread.manager().unwrap().clear_child_tid, GUEST_BASE);
}

#[test]
fn test_syscall_override_shadows_default_table() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);
    context
        .register_syscall_override(
            ExecutionMode::Native,
            39,
            2,
            |_: &mut ThreadContext<'_>, args: &SyscallArguments| Ok(args.get(0) + args.get(1)),
        )
        .unwrap();

    let thread = context.threads().primary().unwrap();
    let result = context
        .handle_syscall(&thread, 39, &SyscallArguments::new(&[40, 2]))
        .unwrap();
    assert_eq!(result, 42);

    // Other contexts keep the default table.
    let other = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);
    let other_thread = other.threads().primary().unwrap();
    let pid = other
        .handle_syscall(&other_thread, 39, &SyscallArguments::new(&[]))
        .unwrap();
    assert_eq!(pid, u64::from(std::process::id()));
}

#[test]
fn test_pause_stops_at_trap_boundary_and_resumes() {
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![Step::Syscall(90, vec![])], vec![Step::Exit(0)]],
    );

    // A handler that raises the pause flag mid-run; the loop must observe it
    // at the next boundary.
    context
        .register_syscall_override(
            ExecutionMode::Native,
            90,
            0,
            |ctx: &mut ThreadContext<'_>, _: &SyscallArguments| {
                ctx.context().pause();
                Ok(0)
            },
        )
        .unwrap();

    assert_eq!(context.start(true).unwrap(), ExitReason::DebugStop);
    assert!(context.is_done());

    // Restarting leaves DebugStop and runs to completion.
    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
}

#[test]
fn test_pause_and_resume_covers_all_threads() {
    let flags = CloneFlags::THREAD
        | CloneFlags::SYSVSEM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::VM;

    // Each thread pauses itself right after syscall 90, so both stop with
    // unfinished work; after resuming, each reports in through syscall 92.
    let parent = vec![
        Step::Syscall(
            56,
            vec![
                (Gpr::Rdi, flags.bits()),
                (Gpr::Rsi, 0),
                (Gpr::Rdx, 0),
                (Gpr::R10, 0),
                (Gpr::R8, 0),
            ],
        ),
        Step::Syscall(90, vec![]),
    ];
    let child = vec![Step::Syscall(90, vec![])];
    let resumed = vec![Step::Syscall(92, vec![]), Step::Exit(0)];

    let context = ready_context(
        ContextConfig::default(),
        vec![parent, child, resumed.clone(), resumed],
    );

    context
        .register_syscall_override(
            ExecutionMode::Native,
            90,
            0,
            |ctx: &mut ThreadContext<'_>, _: &SyscallArguments| {
                ctx.context().pause();
                Ok(0)
            },
        )
        .unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let tally = Arc::clone(&completions);
    context
        .register_syscall_override(
            ExecutionMode::Native,
            92,
            0,
            move |_: &mut ThreadContext<'_>, _: &SyscallArguments| {
                tally.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            },
        )
        .unwrap();

    assert_eq!(context.start(true).unwrap(), ExitReason::DebugStop);

    // The blocking start returns at the first DebugStop store; the sibling
    // may still be on its way to the pause point.
    for _ in 0..5000 {
        if context.threads().paused_count() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(context.threads().paused_count(), 2);

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert_eq!(context.threads().paused_count(), 0);
}

#[test]
fn test_clone_with_bad_tid_pointer_leaves_no_thread() {
    let flags = CloneFlags::THREAD
        | CloneFlags::SYSVSEM
        | CloneFlags::FS
        | CloneFlags::FILES
        | CloneFlags::SIGHAND
        | CloneFlags::VM
        | CloneFlags::CHILD_SETTID;

    // Nothing is mapped, so the tid write-back address cannot resolve.
    let context = ready_context(
        ContextConfig::default(),
        vec![vec![
            Step::Syscall(
                56,
                vec![
                    (Gpr::Rdi, flags.bits()),
                    (Gpr::Rsi, 0),
                    (Gpr::Rdx, 0),
                    (Gpr::R10, 0xdead_0000),
                    (Gpr::R8, 0),
                ],
            ),
            Step::Exit(0),
        ]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);

    // The guest sees EFAULT and no phantom thread lingers in the registry.
    assert_eq!(
        context.cpu_state().unwrap().gpr(Gpr::Rax),
        errno_result(libc::EFAULT)
    );
    assert_eq!(context.threads().len(), 1);
}

#[test]
fn test_single_step_stops_after_one_instruction() {
    let config = ContextConfig {
        single_step: true,
        ..ContextConfig::default()
    };
    let context = ready_context(
        config,
        vec![vec![Step::Syscall(39, vec![])], vec![Step::Exit(0)]],
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::DebugStop);
    assert_eq!(
        context.cpu_state().unwrap().gpr(Gpr::Rax),
        u64::from(std::process::id())
    );

    assert_eq!(context.start(true).unwrap(), ExitReason::Shutdown);
}

#[test]
fn test_cpu_state_round_trip_while_stopped() {
    let context = ready_context(ContextConfig::default(), vec![vec![Step::Exit(0)]]);

    let mut state = context.cpu_state().unwrap();
    state.rip = 0x50_0000;
    state.set_gpr(Gpr::R15, 0xfeed);
    context.set_cpu_state(&state).unwrap();

    let restored = context.cpu_state().unwrap();
    assert_eq!(restored.rip, 0x50_0000);
    assert_eq!(restored.gpr(Gpr::R15), 0xfeed);
}

#[test]
fn test_application_name_round_trip() {
    let context = ExecutionContext::new(ContextConfig::default());
    assert!(context.application_name().is_none());

    context.set_application_name("guest-app");
    assert_eq!(context.application_name().as_deref(), Some("guest-app"));
}
