//! Background worker that walks the huge-bin caches every 30 seconds and
//! evicts entries from buckets that have gone stale, shrinking any
//! demand-extended cache capacity back toward its base.
//!
//! The thread is created lazily by the first huge allocation, runs at low
//! priority, and normally outlives the process. `shutdown()` exists so
//! tests can join it deterministically.

#[cfg(not(loom))]
use std::time::Duration;

#[cfg(not(loom))]
use crate::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(loom))]
use super::size_class::REAPER_INTERVAL_MS;
#[cfg(not(loom))]
use super::spin::RawSpinLock;

#[cfg(not(loom))]
pub(crate) struct Reaper {
    started: AtomicBool,
    start_lock: RawSpinLock,
    // std primitives on purpose: the reaper is excluded from loom models,
    // and a Condvar is the only way to get an interruptible timed sleep.
    state: std::sync::Mutex<ReaperState>,
    wake: std::sync::Condvar,
}

#[cfg(not(loom))]
struct ReaperState {
    shutdown: bool,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(not(loom))]
impl Reaper {
    pub const fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            start_lock: RawSpinLock::new(),
            state: std::sync::Mutex::new(ReaperState {
                shutdown: false,
                handle: None,
            }),
            wake: std::sync::Condvar::new(),
        }
    }

    /// Starts the worker once. Double-checked: the fenced flag read keeps
    /// the hot path to a single load, the spin lock serializes creation,
    /// and the flag is published only after the thread exists.
    pub fn ensure_started(&'static self, alloc: &'static super::allocator::Allocator) {
        if self.started.load(Ordering::SeqCst) {
            return;
        }

        let _guard = self.start_lock.lock();
        if self.started.load(Ordering::SeqCst) {
            return;
        }

        let handle = std::thread::Builder::new()
            .name("parlloc-reaper".into())
            .spawn(move || Self::run(self, alloc));

        match handle {
            Ok(handle) => {
                self.state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .handle = Some(handle);
                self.started.store(true, Ordering::SeqCst);
            }
            Err(_) => {
                // Couldn't spawn (resource exhaustion): leave the flag
                // clear so a later allocation retries. The cache still
                // works, it just never ages out.
            }
        }
    }

    fn run(&self, alloc: &super::allocator::Allocator) {
        lower_priority();

        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if guard.shutdown {
                return;
            }
            let (next, _timeout) = self
                .wake
                .wait_timeout(guard, Duration::from_millis(REAPER_INTERVAL_MS))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
            if guard.shutdown {
                return;
            }
            drop(guard);

            alloc.clean_huge_cache();

            guard = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Stops and joins the worker. Safe to call when it never started, or
    /// twice.
    pub fn shutdown(&self) {
        let handle = {
            let mut guard = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.shutdown = true;
            guard.handle.take()
        };
        self.wake.notify_all();
        if let Some(handle) = handle {
            drop(handle.join());
        }
    }
}

/// Best-effort: cache reaping is bookkeeping and must never compete with
/// allocating threads for CPU.
#[cfg(not(loom))]
fn lower_priority() {
    #[cfg(all(target_os = "linux", not(miri)))]
    // Safety: FFI call to setpriority; on Linux PRIO_PROCESS with pid 0
    // applies to the calling thread.
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, 19);
    }
}

// Under loom no background thread exists; the facade's calls compile to
// no-ops and eviction is exercised by calling clean_huge_cache directly.
#[cfg(loom)]
pub(crate) struct Reaper;

#[cfg(loom)]
impl Reaper {
    pub fn new() -> Self {
        Reaper
    }

    pub fn ensure_started(&self, _alloc: &super::allocator::Allocator) {}

    pub fn shutdown(&self) {}
}
