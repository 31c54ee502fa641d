//! Per-guest-thread records and the thread registry.
//!
//! Each guest thread is represented by a [`ThreadHandle`]: its visible register
//! file, a [`ThreadManager`] bookkeeping record (host thread id, robust-list
//! head, TID write-back addresses), and the host `JoinHandle` driving it. The
//! scheduling model is one host thread per guest thread.
//!
//! A handle's register file is mutated only by its own execution loop and by
//! clone emulation at creation time. It becomes meaningfully observable through
//! [`ThreadHandle::cpu_state`] once the thread is paused or has exited; reading
//! it while the thread runs is a documented race.

mod clone;

pub use clone::{classify_clone, CloneDisposition, CloneFlags, CloneRequest};
pub(crate) use clone::{
    emulate_clone, futex_relay, get_robust_list_relay, set_robust_list_relay,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use dashmap::DashMap;

use crate::{cpu::CpuState, Error, Result};

/// Thread-local OS bookkeeping for a guest thread.
///
/// Tracks the host thread identity and the guest-supplied addresses the kernel
/// ABI expects to be written or cleared on lifecycle events.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadManager {
    /// Host OS thread id backing this guest thread; zero until the execution
    /// loop has started.
    pub host_tid: u64,
    /// Guest address of the robust-list head registered via `set_robust_list`,
    /// zero when unregistered.
    pub robust_list_head: u64,
    /// Guest address to clear and futex-wake when the thread exits
    /// (`CLONE_CHILD_CLEARTID` / `set_tid_address`), zero when unset.
    pub clear_child_tid: u64,
}

/// A single guest thread: register file, bookkeeping, and host execution state.
pub struct ThreadHandle {
    tid: u64,
    cpu: Mutex<CpuState>,
    manager: Mutex<ThreadManager>,
    join: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    paused: AtomicBool,
}

impl ThreadHandle {
    pub(crate) fn new(tid: u64, cpu: CpuState) -> Arc<Self> {
        Arc::new(Self {
            tid,
            cpu: Mutex::new(cpu),
            manager: Mutex::new(ThreadManager::default()),
            join: Mutex::new(None),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        })
    }

    /// Guest thread id.
    #[must_use]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Whether the thread's execution loop is currently live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the thread stopped at a cooperative pause point and is waiting
    /// to be resumed.
    ///
    /// A paused thread has not exited: its remaining guest work resumes on the
    /// next start.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn mark_running(&self) {
        self.paused.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn mark_paused(&self) {
        self.running.store(false, Ordering::Release);
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn retire(&self) {
        self.running.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    /// Returns a copy of the thread's register file.
    ///
    /// Only meaningful once the thread is paused or has exited; concurrent
    /// reads of a running thread race with its backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the state lock is poisoned.
    pub fn cpu_state(&self) -> Result<CpuState> {
        Ok(self.cpu.lock().map_err(|_| Error::LockError)?.clone())
    }

    /// Replaces the thread's register file with a copy of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the state lock is poisoned.
    pub fn set_cpu_state(&self, state: &CpuState) -> Result<()> {
        *self.cpu.lock().map_err(|_| Error::LockError)? = state.clone();
        Ok(())
    }

    /// Returns a copy of the thread's bookkeeping record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the manager lock is poisoned.
    pub fn manager(&self) -> Result<ThreadManager> {
        Ok(*self.manager.lock().map_err(|_| Error::LockError)?)
    }

    pub(crate) fn cpu(&self) -> Result<MutexGuard<'_, CpuState>> {
        self.cpu.lock().map_err(|_| Error::LockError)
    }

    pub(crate) fn manager_mut(&self) -> Result<MutexGuard<'_, ThreadManager>> {
        self.manager.lock().map_err(|_| Error::LockError)
    }

    pub(crate) fn set_join(&self, handle: JoinHandle<()>) -> Result<()> {
        *self.join.lock().map_err(|_| Error::LockError)? = Some(handle);
        Ok(())
    }

    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().ok().and_then(|mut j| j.take())
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("tid", &self.tid)
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Concurrent registry of all guest threads in a context.
///
/// Keys are guest thread ids allocated sequentially starting at 1. Handles stay
/// registered after a thread exits so the frontend can still inspect final
/// register state; [`ThreadHandle::is_running`] distinguishes live threads.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: DashMap<u64, Arc<ThreadHandle>>,
    next_tid: AtomicU64,
    primary: AtomicU64,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
            next_tid: AtomicU64::new(1),
            primary: AtomicU64::new(0),
        }
    }

    pub(crate) fn create(&self, cpu: CpuState) -> Arc<ThreadHandle> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let handle = ThreadHandle::new(tid, cpu);
        self.threads.insert(tid, Arc::clone(&handle));
        handle
    }

    pub(crate) fn set_primary(&self, tid: u64) {
        self.primary.store(tid, Ordering::Release);
    }

    /// Returns the primary (initial) thread, if the core has been initialized.
    #[must_use]
    pub fn primary(&self) -> Option<Arc<ThreadHandle>> {
        match self.primary.load(Ordering::Acquire) {
            0 => None,
            tid => self.get(tid),
        }
    }

    /// Looks up a thread by guest thread id.
    #[must_use]
    pub fn get(&self, tid: u64) -> Option<Arc<ThreadHandle>> {
        self.threads.get(&tid).map(|t| Arc::clone(t.value()))
    }

    /// Total number of registered threads, running or exited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no threads have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Number of threads whose execution loops are currently live.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.threads
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }

    /// Number of threads stopped at a cooperative pause point.
    #[must_use]
    pub fn paused_count(&self) -> usize {
        self.threads
            .iter()
            .filter(|entry| entry.value().is_paused())
            .count()
    }

    pub(crate) fn paused(&self) -> Vec<Arc<ThreadHandle>> {
        self.threads
            .iter()
            .filter(|entry| entry.value().is_paused())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.threads.len())
            .field("running", &self.running_count())
            .finish()
    }
}
