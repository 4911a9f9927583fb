//! Pool of fixed-size metadata records (block descriptors, thread contexts,
//! block allocators) carved from page-source slabs.
//!
//! Objects are packed behind a 64-byte slab header holding a free bitmap,
//! so several records share one page and a record allocation rarely page
//! faults. The slab of a returned object is recovered from the object's
//! address by masking, which is why slabs are aligned to their own size.

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

use super::list::{IntrusiveList, ListNode};
use super::page_source::{PageOps, PlatformPages};
use super::size_class::CACHE_LINE_SIZE;
use super::spin::SpinLock;
use super::stats;

const SLAB_HEADER_SIZE: usize = CACHE_LINE_SIZE;

/// Per-slab bookkeeping, stored in the slab's first cache line.
#[repr(C)]
struct SlabHeader {
    node: ListNode,
    /// Bit `i` set means object `i` is free.
    bitmap: u64,
    free_objects: u32,
    _pad: [u8; SLAB_HEADER_SIZE - size_of::<ListNode>() - 8 - 4],
}

const _: () = assert!(size_of::<SlabHeader>() == SLAB_HEADER_SIZE);

struct PoolState {
    /// Front slab is the active one. Invariant: if the front slab has no
    /// free objects, none of the others do either (returns rotate slabs
    /// with space toward the front).
    slabs: IntrusiveList,
    /// Double-free / double-alloc detection, keyed by slab base address.
    #[cfg(debug_assertions)]
    free_maps: Vec<(usize, FixedBitSet)>,
}

pub(crate) struct ObjectPool {
    state: SpinLock<PoolState>,
    slab_size: usize, // power of two; slabs are aligned to it
    object_size: usize,
    cache_slabs: u32,
}

// Safety: all slab access is serialized by the internal spin lock.
unsafe impl Send for ObjectPool {}
// Safety: all slab access is serialized by the internal spin lock.
unsafe impl Sync for ObjectPool {}

impl ObjectPool {
    pub fn new(slab_size: usize, object_size: usize, cache_slabs: u32) -> Self {
        debug_assert!(slab_size.is_power_of_two());
        debug_assert!(object_size >= size_of::<ListNode>());
        debug_assert!(
            (slab_size - SLAB_HEADER_SIZE) / object_size <= 64,
            "slab bitmap covers at most 64 objects"
        );

        Self {
            state: SpinLock::new(PoolState {
                slabs: IntrusiveList::new(),
                #[cfg(debug_assertions)]
                free_maps: Vec::new(),
            }),
            slab_size,
            object_size,
            cache_slabs,
        }
    }

    #[inline]
    fn max_objects(&self) -> u32 {
        ((self.slab_size - SLAB_HEADER_SIZE) / self.object_size) as u32
    }

    #[inline]
    fn full_mask(&self) -> u64 {
        let max = self.max_objects();
        if max == 64 { u64::MAX } else { (1u64 << max) - 1 }
    }

    /// Gets a record from the pool, mapping a new slab when none has room.
    /// Returns `None` only when the page source is exhausted.
    pub fn get(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();

        let mut slab = state.slabs.first().cast::<SlabHeader>();
        // Safety: a linked slab header stays valid while the pool owns it.
        if slab.is_null() || unsafe { (*slab).free_objects } == 0 {
            slab = self.map_slab(&mut state)?;
        }

        // Safety: slab points at a valid header with free_objects > 0.
        unsafe {
            let index = (*slab).bitmap.trailing_zeros();
            (*slab).bitmap &= !(1u64 << index);
            (*slab).free_objects -= 1;

            #[cfg(debug_assertions)]
            {
                let base = slab as usize;
                let map = state
                    .free_maps
                    .iter_mut()
                    .find(|(addr, _)| *addr == base)
                    .map(|(_, m)| m)
                    .expect("slab has no free map");
                assert!(
                    !map.contains(index as usize),
                    "object pool corruption: object {index} handed out twice"
                );
                map.insert(index as usize);
            }

            let addr = slab
                .cast::<u8>()
                .add(SLAB_HEADER_SIZE + index as usize * self.object_size);
            Some(NonNull::new_unchecked(addr))
        }
    }

    /// Returns a record to the pool.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`get`](Self::get) on this pool and
    /// not returned since.
    pub unsafe fn put(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let slab_addr = addr & !(self.slab_size - 1);
        let slab = slab_addr as *mut SlabHeader;
        let index = ((addr - slab_addr - SLAB_HEADER_SIZE) / self.object_size) as u32;

        let mut state = self.state.lock();

        #[cfg(debug_assertions)]
        {
            let map = state
                .free_maps
                .iter_mut()
                .find(|(a, _)| *a == slab_addr)
                .map(|(_, m)| m)
                .expect("returned object belongs to no slab of this pool");
            assert!(
                map.contains(index as usize),
                "object pool corruption: double return of object {index}"
            );
            map.remove(index as usize);
        }

        // Safety: slab base recovered by masking is a live header of this
        // pool (upheld by the caller's contract).
        unsafe {
            (*slab).bitmap |= 1u64 << index;
            (*slab).free_objects += 1;
        }

        let first = state.slabs.first().cast::<SlabHeader>();
        if slab != first {
            // Safety: slab is linked; header reads are under the lock.
            unsafe {
                if (*slab).free_objects == self.max_objects()
                    && state.slabs.count() > self.cache_slabs
                    && !first.is_null()
                    && (*first).free_objects > 0
                {
                    // Keep `cache_slabs` empty slabs around; release the rest.
                    state.slabs.remove(slab.cast::<ListNode>());
                    self.unmap_slab(&mut state, slab);
                } else {
                    self.make_slab_active(&mut state, slab);
                }
            }
        }
    }

    /// Rotates a slab with newly-freed space toward the front. The slab
    /// becomes active only when the current front is nearly exhausted and
    /// this one has more room; otherwise it parks in second position, which
    /// preserves the front-is-fullest invariant.
    unsafe fn make_slab_active(&self, state: &mut PoolState, slab: *mut SlabHeader) {
        let first = state.slabs.first().cast::<SlabHeader>();
        if first.is_null() {
            // Safety: slab is valid and currently unlinked.
            unsafe { state.slabs.push_front(slab.cast()) };
            return;
        }

        // Safety: both headers are linked slabs of this pool.
        unsafe {
            let first_free = (*first).free_objects;
            state.slabs.remove(slab.cast::<ListNode>());
            if first_free <= self.max_objects() / 4 && (*slab).free_objects > first_free {
                state.slabs.push_front(slab.cast());
            } else {
                state.slabs.insert_after(state.slabs.first(), slab.cast());
            }
        }
    }

    fn map_slab(&self, state: &mut PoolState) -> Option<*mut SlabHeader> {
        // Safety: FFI page mapping; slab_size is a power of two.
        let ptr = unsafe { PlatformPages::alloc_pages(self.slab_size, self.slab_size, 0) }.ok()?;
        let slab = ptr.as_ptr().cast::<SlabHeader>();

        // Safety: fresh mapping large enough for the header.
        unsafe {
            slab.write(SlabHeader {
                node: ListNode::new(),
                bitmap: self.full_mask(),
                free_objects: self.max_objects(),
                _pad: [0; SLAB_HEADER_SIZE - size_of::<ListNode>() - 8 - 4],
            });
            state.slabs.push_front(slab.cast());
        }

        #[cfg(debug_assertions)]
        state
            .free_maps
            .push((slab as usize, FixedBitSet::with_capacity(self.max_objects() as usize)));

        stats::TOTAL_MAPPED.add(self.slab_size);
        stats::POOL_BYTES.add(self.slab_size);
        Some(slab)
    }

    fn unmap_slab(&self, _state: &mut PoolState, slab: *mut SlabHeader) {
        #[cfg(debug_assertions)]
        _state.free_maps.retain(|(addr, _)| *addr != slab as usize);

        // Safety: the slab was mapped by map_slab with this exact size.
        unsafe {
            drop(PlatformPages::free_pages(
                NonNull::new_unchecked(slab.cast()),
                self.slab_size,
            ));
        }
        stats::TOTAL_MAPPED.sub(self.slab_size);
        stats::POOL_BYTES.sub(self.slab_size);
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        loop {
            let slab = state.slabs.pop_front().cast::<SlabHeader>();
            if slab.is_null() {
                break;
            }
            self.unmap_slab(&mut state, slab);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::{BLOCK_DESCRIPTOR_SIZE, BLOCK_DESCRIPTOR_SLAB_SIZE};
    use crate::sync::Arc;
    use crate::sync::thread;

    fn descriptor_pool() -> ObjectPool {
        ObjectPool::new(BLOCK_DESCRIPTOR_SLAB_SIZE, BLOCK_DESCRIPTOR_SIZE, 2)
    }

    #[test]
    fn test_get_put_roundtrip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = descriptor_pool();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a, b);

        // Records must not overlap.
        let distance = (b.as_ptr() as usize).abs_diff(a.as_ptr() as usize);
        assert!(distance >= BLOCK_DESCRIPTOR_SIZE);

        // Safety: test code.
        unsafe {
            a.as_ptr().write_bytes(0xAA, BLOCK_DESCRIPTOR_SIZE);
            pool.put(a);
            pool.put(b);
        }
    }

    #[test]
    fn test_reuse_most_recent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = descriptor_pool();

        let a = pool.get().unwrap();
        // Safety: test code.
        unsafe { pool.put(a) };
        let b = pool.get().unwrap();
        assert_eq!(a, b, "freed record should be reused");
        // Safety: test code.
        unsafe { pool.put(b) };
    }

    #[test]
    fn test_slab_overflow_allocates_new_slab() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = descriptor_pool();
        let per_slab = (BLOCK_DESCRIPTOR_SLAB_SIZE - 64) / BLOCK_DESCRIPTOR_SIZE;

        let mut ptrs = Vec::new();
        for _ in 0..per_slab + 5 {
            ptrs.push(pool.get().unwrap());
        }

        // Two distinct slab bases must be in play.
        let mask = !(BLOCK_DESCRIPTOR_SLAB_SIZE - 1);
        let mut bases: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize & mask).collect();
        bases.sort_unstable();
        bases.dedup();
        assert!(bases.len() >= 2);

        for p in ptrs {
            // Safety: test code.
            unsafe { pool.put(p) };
        }
    }

    #[test]
    fn test_concurrent_get_put() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(ObjectPool::new(64 * 1024, 2368, 1));
        let mut handles = Vec::new();

        for t in 0u8..4 {
            let p = pool.clone();
            handles.push(thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..100 {
                    let obj = p.get().unwrap();
                    // Safety: test code.
                    unsafe { obj.as_ptr().write(t.wrapping_add(i)) };
                    held.push((obj, t.wrapping_add(i)));

                    if i % 3 == 0 {
                        let (obj, _) = held.pop().unwrap();
                        // Safety: test code.
                        unsafe { p.put(obj) };
                    }
                }
                for (obj, val) in held {
                    // Safety: test code.
                    unsafe {
                        assert_eq!(obj.as_ptr().read(), val, "pool record was clobbered");
                        p.put(obj);
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double return")]
    fn test_double_put_detected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = descriptor_pool();
        let a = pool.get().unwrap();
        // Safety: test code (intentional double free).
        unsafe {
            pool.put(a);
            pool.put(a);
        }
    }
}
