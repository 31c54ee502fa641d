//! Benchmarks for the syscall dispatch path.
//!
//! Measures the per-trap overhead the control layer adds on top of the host
//! syscall itself: table lookup, override-layer consultation, argument
//! marshaling, and handler invocation.

extern crate guestcore;

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use guestcore::{ContextConfig, ExecutionContext, ExecutionMode, SyscallArguments, ThreadContext};

fn bench_dispatch_passthrough(c: &mut Criterion) {
    let context = ExecutionContext::new(ContextConfig::default());
    context.initialize().unwrap();
    context
        .init_core(&StubLoader {
            entry: 0x40_1000,
            stack: 0x7fff_f000,
        })
        .unwrap();
    let thread = context.threads().primary().unwrap();

    // getpid: the cheapest host relay, so the measurement is dominated by the
    // dispatch plumbing.
    let args = SyscallArguments::new(&[]);
    c.bench_function("dispatch_getpid", |b| {
        b.iter(|| {
            let result = context
                .handle_syscall(&thread, black_box(39), &args)
                .unwrap();
            black_box(result)
        });
    });
}

fn bench_dispatch_override(c: &mut Criterion) {
    let context = ExecutionContext::new(ContextConfig::default());
    context.initialize().unwrap();
    context
        .init_core(&StubLoader {
            entry: 0x40_1000,
            stack: 0x7fff_f000,
        })
        .unwrap();
    context
        .register_syscall_override(
            ExecutionMode::Native,
            300,
            2,
            |_: &mut ThreadContext<'_>, args: &SyscallArguments| Ok(args.get(0) + args.get(1)),
        )
        .unwrap();
    let thread = context.threads().primary().unwrap();

    let args = SyscallArguments::new(&[11, 31]);
    c.bench_function("dispatch_override", |b| {
        b.iter(|| {
            let result = context
                .handle_syscall(&thread, black_box(300), &args)
                .unwrap();
            black_box(result)
        });
    });
}

fn bench_argument_marshaling(c: &mut Criterion) {
    use guestcore::{CpuState, Gpr};

    let mut cpu = CpuState::default();
    cpu.set_gpr(Gpr::Rdi, 1);
    cpu.set_gpr(Gpr::Rsi, 2);
    cpu.set_gpr(Gpr::Rdx, 3);
    cpu.set_gpr(Gpr::R10, 4);
    cpu.set_gpr(Gpr::R8, 5);
    cpu.set_gpr(Gpr::R9, 6);

    c.bench_function("arguments_new", |b| {
        b.iter(|| {
            let args = SyscallArguments::new(black_box(&[1, 2, 3, 4, 5, 6]));
            black_box(args.get(5))
        });
    });
}

struct StubLoader {
    entry: u64,
    stack: u64,
}

impl guestcore::CodeLoader for StubLoader {
    fn has_code(&self) -> bool {
        true
    }

    fn entry_point(&self) -> u64 {
        self.entry
    }

    fn stack_pointer(&self) -> u64 {
        self.stack
    }
}

criterion_group!(
    benches,
    bench_dispatch_passthrough,
    bench_dispatch_override,
    bench_argument_marshaling
);
criterion_main!(benches);
