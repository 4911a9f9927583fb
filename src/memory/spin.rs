//! Spin locks used by the engine.
//!
//! All waiting is bounded exponential back-off: a growing burst of `pause`
//! instructions, with a scheduler yield every 1024 spins so a preempted
//! lock holder can run. No engine path ever parks a thread.

use crate::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "steal")]
use crate::sync::atomic::AtomicU16;
use crate::sync::cell::UnsafeCell;
use crate::sync::{hint, thread};

const YIELD_EVERY: u32 = 1024;
const MAX_BURST_SHIFT: u32 = 6;

#[inline]
fn backoff(spins: &mut u32) {
    *spins += 1;
    if spins.is_multiple_of(YIELD_EVERY) {
        thread::yield_now();
    } else {
        // Burst length doubles with each failed attempt, capped at 64.
        let burst = 1u32 << (*spins).min(MAX_BURST_SHIFT);
        for _ in 0..burst {
            hint::spin_loop();
        }
    }
}

/// Word-sized test-and-set lock with no payload. Used where the protected
/// state spans several structures (a bin's public chain threads through
/// group headers).
pub(crate) struct RawSpinLock(AtomicU32);

impl RawSpinLock {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn lock(&self) -> RawSpinGuard<'_> {
        let mut spins = 0u32;
        loop {
            if self
                .0
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RawSpinGuard { lock: self };
            }
            while self.0.load(Ordering::Relaxed) != 0 {
                backoff(&mut spins);
            }
        }
    }
}

pub(crate) struct RawSpinGuard<'a> {
    lock: &'a RawSpinLock,
}

impl RawSpinGuard<'_> {
    /// Release before the end of scope. Equivalent to `drop(guard)`; reads
    /// better at call sites that continue with unrelated work.
    #[inline]
    pub fn unlock(self) {}
}

impl Drop for RawSpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.store(0, Ordering::Release);
    }
}

/// A value guarded by a [`RawSpinLock`]. The guard derefs to the value;
/// there is no poisoning (the engine holds no invariants a panic could
/// half-apply that outlive the process).
pub(crate) struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `lock`.
unsafe impl<T: Send> Send for SpinLock<T> {}
// Safety: access to `value` is serialized by `lock`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        SpinGuard {
            _raw: self.lock.lock(),
            value: &self.value,
        }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    _raw: RawSpinGuard<'a>,
    value: &'a UnsafeCell<T>,
}

impl<T> std::ops::Deref for SpinGuard<'_, T> {
    type Target = T;

    #[cfg(not(loom))]
    fn deref(&self) -> &T {
        // Safety: the raw lock is held for the guard's lifetime.
        unsafe { &*self.value.get() }
    }

    #[cfg(loom)]
    fn deref(&self) -> &T {
        // Safety: the raw lock is held for the guard's lifetime.
        self.value.with(|p| unsafe { &*p })
    }
}

impl<T> std::ops::DerefMut for SpinGuard<'_, T> {
    #[cfg(not(loom))]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the raw lock is held for the guard's lifetime.
        unsafe { &mut *self.value.get() }
    }

    #[cfg(loom)]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the raw lock is held for the guard's lifetime.
        crate::sync::unsafe_cell_get_mut!(self.value)
    }
}

/// Bit-spin-lock over an in-place `AtomicU16`: the top bit is the lock
/// state, the low 15 bits carry a value (the active-range offset of a
/// stolen location). Locking and value access go through an RAII holder.
#[cfg(feature = "steal")]
pub(crate) struct BitLockGuard<'a> {
    word: &'a AtomicU16,
    low: u16,
}

#[cfg(feature = "steal")]
pub(crate) const BIT_LOCK: u16 = 1 << 15;

#[cfg(feature = "steal")]
impl<'a> BitLockGuard<'a> {
    pub fn acquire(word: &'a AtomicU16) -> Self {
        let mut spins = 0u32;
        loop {
            let current = word.load(Ordering::Relaxed);
            if current & BIT_LOCK == 0
                && word
                    .compare_exchange_weak(
                        current,
                        current | BIT_LOCK,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return Self {
                    word,
                    low: current & !BIT_LOCK,
                };
            }
            backoff(&mut spins);
        }
    }

    #[inline]
    pub fn low(&self) -> u16 {
        self.low
    }

    #[inline]
    pub fn set_low(&mut self, value: u16) {
        debug_assert!(value & BIT_LOCK == 0, "offset overflows the 15-bit field");
        self.low = value;
    }

    #[inline]
    pub fn add_low(&mut self, delta: u16) {
        self.set_low(self.low + delta);
    }
}

#[cfg(feature = "steal")]
impl Drop for BitLockGuard<'_> {
    fn drop(&mut self) {
        // Publishes the (possibly updated) low bits and clears the lock bit.
        self.word.store(self.low, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_raw_spin_lock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let l = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *l.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_raw_guard_unlock_releases() {
        let lock = RawSpinLock::new();
        let guard = lock.lock();
        guard.unlock();
        // Re-acquiring must not dead spin.
        drop(lock.lock());
    }

    #[cfg(feature = "steal")]
    #[test]
    fn test_bit_lock_preserves_low_bits() {
        let word = AtomicU16::new(0x123);
        {
            let mut guard = BitLockGuard::acquire(&word);
            assert_eq!(guard.low(), 0x123);
            assert_eq!(word.load(Ordering::Relaxed) & BIT_LOCK, BIT_LOCK);
            guard.add_low(5);
        }
        assert_eq!(word.load(Ordering::Relaxed), 0x128);
    }

    #[cfg(feature = "steal")]
    #[test]
    fn test_bit_lock_contention() {
        let word = Arc::new(AtomicU16::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let w = word.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = BitLockGuard::acquire(&w);
                    let v = guard.low();
                    guard.set_low((v + 1) & !BIT_LOCK & 0x7FFF);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(word.load(Ordering::Relaxed), 4000 & 0x7FFF);
    }
}
