//! The large-tier group: a 64 KB region made of four 16 KB subgroups.
//!
//! Every subgroup reserves its first 192 bytes; the group header occupies
//! that window in subgroup 0, while the other three windows hold only a
//! marker node whose tagged next word lets the deallocation path walk back
//! to the group base. Locations pack behind the windows so each subgroup is
//! filled exactly (the large class sizes are chosen for that).
//!
//! With at most 20 locations per group, free tracking is a bitmap instead
//! of intrusive lists: one private word for the owner and a packed
//! `(count:32, bitmap:32)` word CAS-mutated by foreign frees.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::group::NOT_QUEUED;
use super::list::ListNode;
use super::size_class::{
    CACHE_LINE_SIZE, LARGE_GROUP_HEADER_SIZE, LARGE_GROUP_SIZE, SMALL_GROUP_SIZE,
};

const BITMAP_SHIFT: u32 = 0;
const COUNT_SHIFT: u32 = 32;

#[inline]
fn pack_public(count: u32, bitmap: u32) -> u64 {
    (u64::from(count) << COUNT_SHIFT) | (u64::from(bitmap) << BITMAP_SHIFT)
}

#[inline]
fn unpack_public(word: u64) -> (u32, u32) {
    ((word >> COUNT_SHIFT) as u32, (word >> BITMAP_SHIFT) as u32)
}

/// 2-bit-per-location mapping from location index to subgroup, precomputed
/// at initialization to replace a division on every address calculation.
#[derive(Clone, Copy)]
struct SubgroupMap(u64);

impl SubgroupMap {
    fn build(total: u32, per_subgroup: u32) -> Self {
        let mut mask = 0u64;
        for i in 0..total {
            mask |= u64::from(i / per_subgroup) << (i * 2);
        }
        Self(mask)
    }

    #[inline]
    fn subgroup(self, index: u32) -> u32 {
        ((self.0 >> (index * 2)) & 0b11) as u32
    }
}

#[repr(C)]
pub(crate) struct LargeGroupHeader {
    // Cache line 1: the bin list node. Its next word carries the large-tier
    // flag and subgroup 0; the marker nodes of subgroups 1..3 reuse the
    // same layout.
    pub node: ListNode,
    _pad1: [u8; CACHE_LINE_SIZE - 16],
    // ------------------------------ END OF CACHE LINE 1 ------------------

    pub parent_bin: AtomicUsize,
    pub parent_block: AtomicUsize,
    /// Link in the owner bin's public-group chain.
    pub next_public: AtomicUsize,
    pub owner_thread: AtomicU64,
    pub location_size: AtomicU32,
    pub location_count: AtomicU32,
    /// Owner-only: count of free locations known to the owner.
    private_free: AtomicU32,
    /// Owner-only: bit set = location free.
    private_bitmap: AtomicU32,
    subgroups: AtomicU64,
    _pad2: [u8; CACHE_LINE_SIZE - 4 * 8 - 4 * 4 - 8],
    // ------------------------------ END OF CACHE LINE 2 ------------------

    /// Packed `(count:32, bitmap:32)` cross-thread free set.
    public_word: AtomicU64,
    _pad3: [u8; CACHE_LINE_SIZE - 8],
    // ------------------------------ END OF CACHE LINE 3 ------------------
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<LargeGroupHeader>() == LARGE_GROUP_HEADER_SIZE);

impl LargeGroupHeader {
    /// Recovers the group base from any address inside the group: mask to
    /// the 16 KB boundary, then walk back over the subgroup index stored in
    /// that boundary's marker node.
    #[inline]
    pub fn from_location(addr: usize) -> *mut LargeGroupHeader {
        let aligned = addr & !(SMALL_GROUP_SIZE - 1);
        // Safety: every subgroup boundary of a live large group holds a
        // marker node.
        let subgroup = unsafe { (*(aligned as *const ListNode)).next.subgroup() };
        (aligned - subgroup as usize * SMALL_GROUP_SIZE) as *mut LargeGroupHeader
    }

    #[inline]
    pub fn base(&self) -> usize {
        self as *const LargeGroupHeader as usize
    }

    #[inline]
    pub fn location_size(&self) -> usize {
        self.location_size.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn location_count(&self) -> u32 {
        self.location_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn subgroup_map(&self) -> SubgroupMap {
        SubgroupMap(self.subgroups.load(Ordering::Relaxed))
    }

    #[inline]
    fn location_to_address(&self, index: u32) -> usize {
        self.base()
            + (self.subgroup_map().subgroup(index) as usize + 1) * LARGE_GROUP_HEADER_SIZE
            + self.location_size() * index as usize
    }

    #[inline]
    fn address_to_location(&self, addr: usize) -> u32 {
        // The per-location stride dominates the 192-byte windows, so plain
        // division recovers the index (window bytes never sum past one
        // location size).
        ((addr - self.base()) / self.location_size()) as u32
    }

    /// Writes a fresh header for a group with every location free and marks
    /// the four subgroup boundaries.
    ///
    /// # Safety
    /// `this` must point at the base of a 64 KB group held exclusively by
    /// the caller (block allocator lock).
    pub unsafe fn initialize_unused(
        this: *mut LargeGroupHeader,
        location_size: u32,
        locations: u32,
        thread: u64,
    ) {
        // Safety: exclusive access per the caller contract.
        unsafe {
            let parent_block = (*this).parent_block.load(Ordering::Relaxed);
            this.write(LargeGroupHeader {
                node: ListNode::new(),
                _pad1: [0; CACHE_LINE_SIZE - 16],
                parent_bin: AtomicUsize::new(0),
                parent_block: AtomicUsize::new(parent_block),
                next_public: AtomicUsize::new(NOT_QUEUED),
                owner_thread: AtomicU64::new(thread),
                location_size: AtomicU32::new(location_size),
                location_count: AtomicU32::new(locations),
                private_free: AtomicU32::new(locations),
                private_bitmap: AtomicU32::new(full_bitmap(locations)),
                subgroups: AtomicU64::new(SubgroupMap::build(locations, locations / 4).0),
                _pad2: [0; CACHE_LINE_SIZE - 4 * 8 - 4 * 4 - 8],
                public_word: AtomicU64::new(0),
                _pad3: [0; CACHE_LINE_SIZE - 8],
            });

            // Mark every subgroup boundary so deallocation can find the
            // group base by walking backwards.
            let base = this as usize;
            for subgroup in 0..4u32 {
                let marker = (base + subgroup as usize * SMALL_GROUP_SIZE) as *mut ListNode;
                (*marker).next.set_large_tier();
                (*marker).next.set_subgroup(subgroup);
            }
        }
    }

    /// Re-adopts a partially used group: assigns the new owner and folds
    /// the public set into the private one.
    pub unsafe fn initialize_used(&self, thread: u64) {
        self.owner_thread.store(thread, Ordering::Relaxed);
        if self.private_free.load(Ordering::Relaxed) != self.location_count() {
            self.merge_bitmaps();
        }
    }

    // ------------------------------------------------------------------
    // Predicates (mirroring the small group's)
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_empty_enough(&self) -> bool {
        self.private_free.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn can_be_stolen(&self) -> bool {
        self.private_free.load(Ordering::Relaxed) >= self.location_count() / 4
    }

    #[inline]
    pub fn should_return(&self) -> bool {
        self.private_free.load(Ordering::Relaxed) >= self.location_count() * 3 / 4
            && self.public_word.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn is_all_free(&self) -> bool {
        self.private_free.load(Ordering::Relaxed) == self.location_count()
            && self.public_word.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn may_be_full(&self, publics: u32) -> bool {
        self.private_free.load(Ordering::Relaxed) + publics == self.location_count()
    }

    #[inline]
    pub fn has_public(&self) -> bool {
        self.public_word.load(Ordering::Acquire) != 0
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Captures the public set into the private bitmap.
    fn merge_bitmaps(&self) {
        let mut word;
        loop {
            word = self.public_word.load(Ordering::Acquire);
            if word == 0 {
                return;
            }
            if self
                .public_word
                .compare_exchange_weak(word, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let (count, bitmap) = unpack_public(word);
        self.private_bitmap.store(
            self.private_bitmap.load(Ordering::Relaxed) | bitmap,
            Ordering::Relaxed,
        );
        self.private_free.store(
            self.private_free.load(Ordering::Relaxed) + count,
            Ordering::Relaxed,
        );
    }

    /// Takes a free location from the private bitmap.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    pub unsafe fn get_private_location(&self) -> Option<NonNull<u8>> {
        if self.private_free.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let bitmap = self.private_bitmap.load(Ordering::Relaxed);
        let index = bitmap.trailing_zeros();
        self.private_bitmap
            .store(bitmap & !(1 << index), Ordering::Relaxed);
        self.private_free.store(
            self.private_free.load(Ordering::Relaxed) - 1,
            Ordering::Relaxed,
        );
        NonNull::new(self.location_to_address(index) as *mut u8)
    }

    /// Folds the public set in and retries.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    pub unsafe fn get_public_location(&self) -> Option<NonNull<u8>> {
        if self.public_word.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.merge_bitmaps();
        // Safety: owner-side.
        unsafe { self.get_private_location() }
    }

    /// Allocation order of the group: private bitmap, then public capture.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    pub unsafe fn get_location(&self) -> Option<NonNull<u8>> {
        // Safety: owner-side.
        unsafe {
            if let Some(address) = self.get_private_location() {
                return Some(address);
            }
            self.get_public_location()
        }
    }

    // ------------------------------------------------------------------
    // Frees
    // ------------------------------------------------------------------

    /// Owner-thread free: set the location's bit.
    ///
    /// # Safety
    /// `addr` must be a live location of this group; caller must be the
    /// owning thread.
    pub unsafe fn return_private_location(&self, addr: usize) {
        let index = self.address_to_location(addr);
        debug_assert!(index < self.location_count());
        self.private_bitmap.store(
            self.private_bitmap.load(Ordering::Relaxed) | (1 << index),
            Ordering::Relaxed,
        );
        self.private_free.store(
            self.private_free.load(Ordering::Relaxed) + 1,
            Ordering::Relaxed,
        );
    }

    /// Cross-thread free: CAS the location's bit into the public set.
    /// Returns the new public count.
    pub fn return_public_location(&self, addr: usize) -> u32 {
        let index = self.address_to_location(addr);
        debug_assert!(index < self.location_count());

        loop {
            let old = self.public_word.load(Ordering::Acquire);
            let (count, bitmap) = unpack_public(old);
            debug_assert!(bitmap & (1 << index) == 0, "location {index} freed twice");
            let new = pack_public(count + 1, bitmap | (1 << index));
            if self
                .public_word
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return count + 1;
            }
        }
    }
}

#[inline]
fn full_bitmap(locations: u32) -> u32 {
    if locations == 32 {
        u32::MAX
    } else {
        (1u32 << locations) - 1
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::{LARGE_BIN_SIZE, LARGE_GROUP_SIZE};
    use std::alloc::Layout;

    struct TestGroup {
        base: *mut u8,
    }

    impl TestGroup {
        fn new(location_size: u32, thread: u64) -> Self {
            let layout = Layout::from_size_align(LARGE_GROUP_SIZE, SMALL_GROUP_SIZE).unwrap();
            // Safety: test code; layout is non-zero.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            let locations =
                ((LARGE_GROUP_SIZE - LARGE_GROUP_HEADER_SIZE) / location_size as usize) as u32;
            // Safety: fresh exclusive allocation.
            unsafe {
                LargeGroupHeader::initialize_unused(base.cast(), location_size, locations, thread);
            }
            Self { base }
        }

        fn header(&self) -> &LargeGroupHeader {
            // Safety: initialized in new().
            unsafe { &*self.base.cast::<LargeGroupHeader>() }
        }
    }

    impl Drop for TestGroup {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(LARGE_GROUP_SIZE, SMALL_GROUP_SIZE).unwrap();
            // Safety: allocated in new() with the same layout.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    #[test]
    fn test_subgroup_map() {
        let map = SubgroupMap::build(20, 5);
        assert_eq!(map.subgroup(0), 0);
        assert_eq!(map.subgroup(4), 0);
        assert_eq!(map.subgroup(5), 1);
        assert_eq!(map.subgroup(14), 2);
        assert_eq!(map.subgroup(19), 3);
    }

    #[test]
    fn test_locations_respect_subgroup_windows() {
        for &class in &LARGE_BIN_SIZE {
            let g = TestGroup::new(class as u32, 1);
            let h = g.header();
            let per_subgroup = h.location_count() / 4;

            for index in 0..h.location_count() {
                let addr = h.location_to_address(index);
                let offset = addr - h.base();
                let subgroup = offset / SMALL_GROUP_SIZE;
                assert_eq!(subgroup as u32, index / per_subgroup, "class {class} loc {index}");
                assert!(
                    offset % SMALL_GROUP_SIZE >= LARGE_GROUP_HEADER_SIZE,
                    "class {class} location {index} intrudes into the marker window"
                );
                assert!(offset + class <= LARGE_GROUP_SIZE, "class {class} overruns");
                assert_eq!(h.address_to_location(addr), index, "class {class}");
            }
        }
    }

    #[test]
    fn test_boundary_markers_route_back_to_base() {
        let g = TestGroup::new(8096, 1);
        let h = g.header();

        // Safety: single-threaded test.
        unsafe {
            let mut seen = Vec::new();
            while let Some(p) = h.get_location() {
                seen.push(p.as_ptr() as usize);
            }
            assert_eq!(seen.len() as u32, h.location_count());

            for addr in seen {
                let found = LargeGroupHeader::from_location(addr);
                assert_eq!(found as usize, h.base(), "location {addr:#x} misrouted");
            }
        }
    }

    #[test]
    fn test_bitmap_alloc_free_roundtrip() {
        let g = TestGroup::new(3200, 1);
        let h = g.header();
        assert_eq!(h.location_count(), 20);

        // Safety: single-threaded test.
        unsafe {
            let a = h.get_location().unwrap().as_ptr() as usize;
            let b = h.get_location().unwrap().as_ptr() as usize;
            assert_ne!(a, b);
            assert_eq!(h.private_free.load(Ordering::Relaxed), 18);

            h.return_private_location(a);
            assert_eq!(h.private_free.load(Ordering::Relaxed), 19);

            // Lowest-index-first: a comes back before anything later.
            let again = h.get_location().unwrap().as_ptr() as usize;
            assert_eq!(again, a);
        }
    }

    #[test]
    fn test_public_word_merge() {
        let g = TestGroup::new(4048, 1);
        let h = g.header();

        // Safety: single-threaded test driving both roles.
        unsafe {
            let mut taken = Vec::new();
            while let Some(p) = h.get_location() {
                taken.push(p.as_ptr() as usize);
            }
            assert!(!h.is_empty_enough());

            assert_eq!(h.return_public_location(taken[0]), 1);
            assert_eq!(h.return_public_location(taken[1]), 2);
            assert!(h.has_public());
            assert!(!h.is_all_free());

            let merged = h.get_location().unwrap().as_ptr() as usize;
            assert!(merged == taken[0] || merged == taken[1]);
            assert!(!h.has_public());

            // Free everything and verify the terminal predicates.
            h.return_private_location(merged);
            for &addr in &taken[2..] {
                h.return_private_location(addr);
            }
            let last = if merged == taken[0] { taken[1] } else { taken[0] };
            h.return_public_location(last);
            h.merge_bitmaps();
            assert!(h.is_all_free());
            assert!(h.should_return());
        }
    }

    #[test]
    fn test_may_be_full_with_pending_publics() {
        let g = TestGroup::new(8096, 3);
        let h = g.header();

        // Safety: single-threaded test.
        unsafe {
            let mut taken = Vec::new();
            while let Some(p) = h.get_location() {
                taken.push(p.as_ptr() as usize);
            }

            let mut publics = 0;
            for addr in taken {
                publics = h.return_public_location(addr);
            }
            assert_eq!(publics, h.location_count());
            assert!(h.may_be_full(publics));
        }
    }

    #[test]
    fn test_reinitialize_preserves_block() {
        let g = TestGroup::new(3200, 1);
        let h = g.header();
        h.parent_block.store(0xB10C, Ordering::Relaxed);

        // Safety: single-threaded test.
        unsafe {
            let a = h.get_location().unwrap().as_ptr() as usize;
            h.return_public_location(a);
            h.initialize_used(9);
        }
        assert_eq!(h.owner_thread.load(Ordering::Relaxed), 9);
        assert_eq!(h.parent_block.load(Ordering::Relaxed), 0xB10C);
        assert!(!h.has_public());
        assert!(h.is_all_free());
    }
}
