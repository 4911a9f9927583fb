//! Per-thread state: one bin per size class, each holding the thread's
//! groups for that class (front of the list = active group).
//!
//! Contexts are pooled records handed out on a thread's first allocation
//! and returned when the thread exits. Everything in a context belongs to
//! its owner thread except each bin's public-group chain head, which
//! foreign threads link under the bin's spin lock.

use crate::sync::atomic::AtomicUsize;
use crate::sync::cell::{Cell, UnsafeCell};

use super::list::IntrusiveList;
use super::size_class::{
    LARGE_BIN_SIZE, LARGE_BINS, LARGE_GROUP_SIZE, RETURN_PARTIAL_MASK, SMALL_BIN_SIZE, SMALL_BINS,
    SMALL_GROUP_SIZE, THREAD_CONTEXT_SIZE,
};
use super::spin::RawSpinLock;

/// Per (thread x size-class) bin.
/// Per (thread x size-class) bin. One cache line.
#[repr(C)]
pub(crate) struct Bin {
    /// Insertion-ordered groups owned by this thread; owner-only.
    groups: UnsafeCell<IntrusiveList>,
    /// Head of the chain of groups with pending public frees. Guarded by
    /// `public_lock`; the chain links through the groups' next_public.
    pub public_group: AtomicUsize,
    /// Group currently stolen from (an active group of a larger bin).
    pub stolen_group: Cell<usize>,
    pub public_lock: RawSpinLock,
    pub number: u32,
    /// Groups the bin keeps before returning one to the block allocator;
    /// grows by one each time the bin surrenders its last spare group, so
    /// a group is never bounced back and forth.
    pub return_allowed: Cell<u32>,
    pub stolen_locations: Cell<u32>,
    pub max_stolen_locations: u32,
    pub can_return_partial: bool,
    pub can_steal: Cell<bool>,
}

// Safety: only `public_group`/`public_lock` are touched by foreign threads;
// the rest is owner-only by protocol.
unsafe impl Sync for Bin {}

impl Bin {
    unsafe fn initialize(this: *mut Bin, number: u32, class_size: usize, group_size: usize, can_return_partial: bool) {
        // Safety: exclusive access to fresh storage.
        unsafe {
            this.write(Bin {
                groups: UnsafeCell::new(IntrusiveList::new()),
                public_group: AtomicUsize::new(0),
                stolen_group: Cell::new(0),
                public_lock: RawSpinLock::new(),
                number,
                return_allowed: Cell::new(1),
                stolen_locations: Cell::new(0),
                max_stolen_locations: (group_size / class_size / 2) as u32,
                can_return_partial,
                can_steal: Cell::new(true),
            });
        }
    }

    /// The owner's view of the group list.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn groups(&self) -> &mut IntrusiveList {
        // Safety: single-writer by the ownership protocol.
        crate::sync::unsafe_cell_get_mut!(self.groups)
    }
}

#[repr(C)]
pub(crate) struct ThreadContext {
    pub thread_id: u64,
    pub numa_node: u32,
    _pad: u32,
    /// Bitmap of bins whose active group is steal-eligible; owner-only.
    stealable_bins: Cell<u64>,
    pub small_bins: [Bin; SMALL_BINS],
    pub large_bins: [Bin; LARGE_BINS],
}

// Safety: see Bin; the scalar fields are set once at initialization.
unsafe impl Sync for ThreadContext {}

/// Pool object size for contexts. The declared limit is asserted, not
/// assumed, so layout drift fails loudly.
pub(crate) const fn context_object_size() -> usize {
    size_of::<ThreadContext>().next_multiple_of(64)
}

#[cfg(not(loom))]
const _: () = assert!(context_object_size() <= THREAD_CONTEXT_SIZE);

impl ThreadContext {
    /// Constructs a context in place (contexts live in pooled memory).
    ///
    /// # Safety
    /// `this` must point at uninitialized storage of sufficient size.
    pub unsafe fn initialize(this: *mut ThreadContext, thread_id: u64, numa_node: u32) {
        // Safety: exclusive access to fresh storage; bins are initialized
        // individually below.
        unsafe {
            (&raw mut (*this).thread_id).write(thread_id);
            (&raw mut (*this).numa_node).write(numa_node);
            (&raw mut (*this)._pad).write(0);
            (&raw mut (*this).stealable_bins).write(Cell::new(0));

            for number in 0..SMALL_BINS {
                Bin::initialize(
                    &raw mut (*this).small_bins[number],
                    number as u32,
                    SMALL_BIN_SIZE[number],
                    SMALL_GROUP_SIZE,
                    RETURN_PARTIAL_MASK & (1 << number) != 0,
                );
            }
            for number in 0..LARGE_BINS {
                Bin::initialize(
                    &raw mut (*this).large_bins[number],
                    number as u32,
                    LARGE_BIN_SIZE[number],
                    LARGE_GROUP_SIZE,
                    // Every large class is cache-line-granular.
                    true,
                );
            }
        }
    }

    /// Marks `bin` (small tier) as having, or not having, an active group
    /// that other bins may steal from.
    #[inline]
    pub fn set_stealable(&self, bin: u32, available: bool) {
        let map = self.stealable_bins.get();
        if available {
            self.stealable_bins.set(map | (1 << bin));
        } else {
            self.stealable_bins.set(map & !(1 << bin));
        }
    }

    /// First steal candidate at `from` or above, if any.
    #[inline]
    pub fn find_stealable(&self, from: u32) -> Option<u32> {
        if from as usize >= SMALL_BINS {
            return None;
        }
        let masked = self.stealable_bins.get() & (u64::MAX << from);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros())
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::alloc::Layout;

    fn with_context(f: impl FnOnce(&ThreadContext)) {
        let layout = Layout::from_size_align(context_object_size(), 64).unwrap();
        // Safety: test code.
        unsafe {
            let raw = std::alloc::alloc_zeroed(layout).cast::<ThreadContext>();
            assert!(!raw.is_null());
            ThreadContext::initialize(raw, 17, 0);
            f(&*raw);
            std::alloc::dealloc(raw.cast(), layout);
        }
    }

    #[test]
    fn test_bin_initialization() {
        with_context(|ctx| {
            assert_eq!(ctx.thread_id, 17);

            let bin9 = &ctx.small_bins[9]; // 64-byte class
            assert_eq!(bin9.number, 9);
            assert_eq!(bin9.return_allowed.get(), 1);
            assert!(bin9.can_return_partial);
            assert_eq!(bin9.max_stolen_locations, (16384 / 64 / 2) as u32);

            let bin0 = &ctx.small_bins[0]; // 8-byte class
            assert!(!bin0.can_return_partial);

            let large0 = &ctx.large_bins[0];
            assert!(large0.can_return_partial);
            assert_eq!(large0.max_stolen_locations, (65536 / 3200 / 2) as u32);

            // Safety: single-threaded owner access.
            unsafe {
                assert_eq!(bin9.groups().count(), 0);
            }
        });
    }

    #[test]
    fn test_stealable_bitmap_scan() {
        with_context(|ctx| {
            assert_eq!(ctx.find_stealable(0), None);

            ctx.set_stealable(5, true);
            ctx.set_stealable(20, true);

            assert_eq!(ctx.find_stealable(0), Some(5));
            assert_eq!(ctx.find_stealable(5), Some(5));
            assert_eq!(ctx.find_stealable(6), Some(20));
            assert_eq!(ctx.find_stealable(21), None);

            ctx.set_stealable(5, false);
            assert_eq!(ctx.find_stealable(0), Some(20));
        });
    }

    #[test]
    fn test_find_stealable_out_of_range() {
        with_context(|ctx| {
            ctx.set_stealable(30, true);
            assert_eq!(ctx.find_stealable(30), Some(30));
            assert_eq!(ctx.find_stealable(31), None);
            assert_eq!(ctx.find_stealable(64), None);
        });
    }
}
