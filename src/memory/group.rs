//! The small-tier group: a 16 KB region, aligned to its size, holding a
//! 256-byte header followed by equal-sized locations.
//!
//! The header spans four cache lines so that fields with different sharing
//! patterns never ride the same line:
//!   1. the bin list node (plus the tier tag read by deallocation);
//!   2. identity fields written on adoption and read by every thread;
//!   3. allocation state written only by the owner thread;
//!   4. the cross-thread free list, mutated by CAS from any thread.
//!
//! Freed locations link through their own first word. The public list head
//! packs `(count:16, first:48)` into one `AtomicU64`; privatizing swaps the
//! whole word for zero, so a single CAS transfers the entire chain.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::list::ListNode;
use super::size_class::{
    CACHE_LINE_SIZE, NOT_STOLEN, SMALL_GROUP_HEADER_SIZE, SMALL_GROUP_SIZE,
};
#[cfg(feature = "steal")]
use super::spin::RawSpinLock;
#[cfg(feature = "steal")]
use crate::sync::atomic::AtomicU16;

/// Empty-list marker for the intrusive location lists. Location addresses
/// are never zero, so the null address is free to act as the terminator.
pub(crate) const LIST_END: usize = 0;

/// Sentinel for `next_public` meaning the group is not linked into its
/// bin's public-group chain (0 marks the end of the chain). Linking is
/// gated on this value so a group can never enter the chain twice.
pub(crate) const NOT_QUEUED: usize = usize::MAX;

const COUNT_SHIFT: u32 = 48;
const FIRST_MASK: u64 = (1u64 << COUNT_SHIFT) - 1;

#[inline]
fn pack_head(count: u32, first: usize) -> u64 {
    debug_assert!(first as u64 <= FIRST_MASK, "address {first:#x} exceeds 48 bits");
    (u64::from(count as u16) << COUNT_SHIFT) | first as u64
}

#[inline]
fn unpack_head(word: u64) -> (u32, usize) {
    ((word >> COUNT_SHIFT) as u32, (word & FIRST_MASK) as usize)
}

// Freed-location link accessors. The link is a plain word: cross-thread
// visibility comes from the release/acquire pairing on the public head CAS,
// never from the link itself. Unaligned accesses are required because the
// 12- and 20-byte classes place locations on 4-byte boundaries.
#[cfg(not(loom))]
#[inline]
pub(crate) unsafe fn read_link(addr: usize) -> usize {
    // Safety: caller guarantees addr is a freed location of at least
    // word size.
    unsafe { (addr as *const usize).read_unaligned() }
}

#[cfg(not(loom))]
#[inline]
pub(crate) unsafe fn write_link(addr: usize, value: usize) {
    // Safety: caller guarantees addr is a freed location of at least
    // word size.
    unsafe { (addr as *mut usize).write_unaligned(value) }
}

// Under loom the links must be model-visible: tests place loom atomics at
// the link offsets (locations there are always 8-aligned).
#[cfg(loom)]
pub(crate) unsafe fn read_link(addr: usize) -> usize {
    unsafe { (*(addr as *const AtomicUsize)).load(Ordering::Relaxed) }
}

#[cfg(loom)]
pub(crate) unsafe fn write_link(addr: usize, value: usize) {
    unsafe { (*(addr as *const AtomicUsize)).store(value, Ordering::Relaxed) }
}

#[repr(C)]
pub(crate) struct GroupHeader {
    // The first cache line holds only the list node; its tagged next word
    // is what Deallocate inspects to route by tier.
    pub node: ListNode,
    _pad1: [u8; CACHE_LINE_SIZE - 16],
    // ------------------------------ END OF CACHE LINE 1 ------------------

    /// Owning bin, or 0 when the group is held by the block allocator.
    /// The authoritative ownership pointer: foreign threads re-verify it
    /// after taking the bin's public lock.
    pub parent_bin: AtomicUsize,
    /// Enclosing block descriptor.
    pub parent_block: AtomicUsize,
    /// Active stolen location being sub-divided, or 0.
    pub stolen: AtomicUsize,
    /// Identifier of the owning thread; stale once parent_bin is 0.
    pub owner_thread: AtomicU64,
    pub location_size: AtomicU32,
    pub location_count: AtomicU32,
    /// Smallest bin index that stole from this group, or NOT_STOLEN.
    pub smallest_stealer: AtomicU32,
    _pad2: [u8; CACHE_LINE_SIZE - 4 * 8 - 3 * 4],
    // ------------------------------ END OF CACHE LINE 2 ------------------

    // Owner-only allocation state. Plain-store atomics: the owner is the
    // single writer, other threads never read these.
    bump_cursor: AtomicUsize,
    bump_limit: AtomicUsize,
    private_head: AtomicUsize,
    private_tail: AtomicUsize,
    /// In-use locations from the owner's viewpoint: allocations increment,
    /// owner frees decrement, and merging the public list subtracts the
    /// captured count. Pending public frees therefore still count as used.
    private_used: AtomicU32,
    _pad3: [u8; CACHE_LINE_SIZE - 4 * 8 - 4],
    // ------------------------------ END OF CACHE LINE 3 ------------------

    /// Packed `(count:16, first:48)` head of the cross-thread free list.
    public_head: AtomicU64,
    /// Link in the owner bin's public-group chain.
    pub next_public: AtomicUsize,
    /// Serializes stolen-range mutation against foreign frees.
    #[cfg(feature = "steal")]
    pub public_lock: RawSpinLock,
    #[cfg(feature = "steal")]
    _pad4: [u8; CACHE_LINE_SIZE - 2 * 8 - 4],
    #[cfg(not(feature = "steal"))]
    _pad4: [u8; CACHE_LINE_SIZE - 2 * 8],
    // ------------------------------ END OF CACHE LINE 4 ------------------
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<GroupHeader>() == SMALL_GROUP_HEADER_SIZE);

impl GroupHeader {
    /// Group base from any address inside the group.
    #[inline]
    pub fn from_location(addr: usize) -> *mut GroupHeader {
        (addr & !(SMALL_GROUP_SIZE - 1)) as *mut GroupHeader
    }

    #[inline]
    pub fn base(&self) -> usize {
        self as *const GroupHeader as usize
    }

    #[cfg_attr(not(feature = "steal"), allow(dead_code))]
    #[inline]
    fn first_location(&self) -> usize {
        self.base() + SMALL_GROUP_HEADER_SIZE
    }

    #[inline]
    pub fn location_size(&self) -> usize {
        self.location_size.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn location_count(&self) -> u32 {
        self.location_count.load(Ordering::Relaxed)
    }

    /// Writes a fresh header for a group with every location free,
    /// preserving the block back-reference.
    ///
    /// # Safety
    /// `this` must point at the base of a 16 KB group held exclusively by
    /// the caller (block allocator lock).
    pub unsafe fn initialize_unused(
        this: *mut GroupHeader,
        location_size: u32,
        locations: u32,
        thread: u64,
    ) {
        // Safety: exclusive access per the caller contract.
        unsafe {
            let parent_block = (*this).parent_block.load(Ordering::Relaxed);
            let base = this as usize;
            this.write(GroupHeader {
                node: ListNode::new(),
                _pad1: [0; CACHE_LINE_SIZE - 16],
                parent_bin: AtomicUsize::new(0),
                parent_block: AtomicUsize::new(parent_block),
                stolen: AtomicUsize::new(0),
                owner_thread: AtomicU64::new(thread),
                location_size: AtomicU32::new(location_size),
                location_count: AtomicU32::new(locations),
                smallest_stealer: AtomicU32::new(NOT_STOLEN),
                _pad2: [0; CACHE_LINE_SIZE - 4 * 8 - 3 * 4],
                bump_cursor: AtomicUsize::new(base + SMALL_GROUP_HEADER_SIZE),
                bump_limit: AtomicUsize::new(
                    base + SMALL_GROUP_HEADER_SIZE + location_size as usize * locations as usize,
                ),
                private_head: AtomicUsize::new(LIST_END),
                private_tail: AtomicUsize::new(LIST_END),
                private_used: AtomicU32::new(0),
                _pad3: [0; CACHE_LINE_SIZE - 4 * 8 - 4],
                public_head: AtomicU64::new(0),
                next_public: AtomicUsize::new(NOT_QUEUED),
                #[cfg(feature = "steal")]
                public_lock: RawSpinLock::new(),
                #[cfg(feature = "steal")]
                _pad4: [0; CACHE_LINE_SIZE - 2 * 8 - 4],
                #[cfg(not(feature = "steal"))]
                _pad4: [0; CACHE_LINE_SIZE - 2 * 8],
            });
        }
    }

    /// Re-adopts a partially used group: assigns the new owner and folds
    /// any cross-thread frees into the private list.
    pub unsafe fn initialize_used(&self, thread: u64) {
        self.owner_thread.store(thread, Ordering::Relaxed);
        self.smallest_stealer.store(NOT_STOLEN, Ordering::Relaxed);
        // Safety: adoption runs under the block allocator lock; no other
        // thread owns the private side.
        unsafe { self.merge_public() };
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// Some location is free for the owner (bump space or lists).
    #[inline]
    pub fn is_empty_enough(&self) -> bool {
        self.private_used.load(Ordering::Relaxed) < self.location_count()
    }

    /// Steal-eligibility: at least 25% of the locations are free.
    #[inline]
    pub fn can_be_stolen(&self) -> bool {
        self.private_used.load(Ordering::Relaxed) <= self.location_count() * 3 / 4
    }

    /// The group is empty enough (>= 75% free) to be handed back to the
    /// block allocator while still partially used.
    #[inline]
    pub fn should_return(&self) -> bool {
        self.private_used.load(Ordering::Relaxed) <= self.location_count() / 4
            && self.public_head.load(Ordering::Acquire) == 0
    }

    /// Every location is free.
    #[inline]
    pub fn is_all_free(&self) -> bool {
        self.private_used.load(Ordering::Relaxed) == 0
            && self.public_head.load(Ordering::Acquire) == 0
    }

    /// After a public push that produced `publics` entries, the group may
    /// have no location in use. The read of `private_used` is foreign and
    /// only meaningful for orphaned groups, whose private side is frozen.
    #[inline]
    pub fn may_be_full(&self, publics: u32) -> bool {
        self.private_used.load(Ordering::Relaxed) == publics
    }

    #[inline]
    pub fn has_public(&self) -> bool {
        self.public_head.load(Ordering::Acquire) != 0
    }

    // ------------------------------------------------------------------
    // Owner allocation
    // ------------------------------------------------------------------

    /// Takes a location without touching the public list: bump space first,
    /// then the private free list.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    pub unsafe fn get_private_location(&self) -> Option<NonNull<u8>> {
        let cursor = self.bump_cursor.load(Ordering::Relaxed);
        if cursor < self.bump_limit.load(Ordering::Relaxed) {
            self.bump_cursor
                .store(cursor + self.location_size(), Ordering::Relaxed);
            self.private_used.store(
                self.private_used.load(Ordering::Relaxed).wrapping_add(1),
                Ordering::Relaxed,
            );
            // Safety: cursor is inside the group.
            return Some(unsafe { NonNull::new_unchecked(cursor as *mut u8) });
        }

        let head = self.private_head.load(Ordering::Relaxed);
        if head != LIST_END {
            // Safety: head is a freed location holding a link word.
            let next = unsafe { read_link(head) };
            self.private_head.store(next, Ordering::Relaxed);
            if next == LIST_END {
                self.private_tail.store(LIST_END, Ordering::Relaxed);
            }
            self.private_used.store(
                self.private_used.load(Ordering::Relaxed).wrapping_add(1),
                Ordering::Relaxed,
            );
            // Safety: list entries are valid locations.
            return Some(unsafe { NonNull::new_unchecked(head as *mut u8) });
        }

        None
    }

    /// Folds the public list into the private one and retries. Returns
    /// `None` when the group is exhausted.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    pub unsafe fn get_public_location(&self) -> Option<NonNull<u8>> {
        if self.public_head.load(Ordering::Acquire) == 0 {
            return None;
        }
        // Safety: owner-side merge.
        unsafe {
            self.merge_public();
            self.get_private_location()
        }
    }

    /// Allocation order of the group: bump, private list, public capture.
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

    /// Atomically captures the whole public chain, leaving the head empty.
    /// Returns `(count, first)`, both zero when there was nothing.
    fn take_public(&self) -> (u32, usize) {
        loop {
            let old = self.public_head.load(Ordering::Acquire);
            if old == 0 {
                return (0, LIST_END);
            }
            if self
                .public_head
                .compare_exchange_weak(old, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return unpack_head(old);
            }
        }
    }

    /// Splices the captured public chain onto the private list, appending
    /// at the tail so the list order survives. Subtracts the captured count
    /// from `private_used`; with pending captures the counter may pass
    /// through wrap-around transients, which is why it is compared only for
    /// equality.
    ///
    /// # Safety
    /// Caller must own the private side (owner thread, or the block
    /// allocator lock during adoption).
    pub unsafe fn merge_public(&self) {
        let (count, first) = self.take_public();
        if count == 0 {
            return;
        }

        #[cfg(feature = "sort")]
        // Safety: the captured chain is exclusively ours now.
        let first = unsafe { sort_chain(first) };

        // Safety: chain entries are freed locations linked through their
        // first word, null-terminated by the first public push.
        let tail = unsafe { chain_tail(first) };

        let old_tail = self.private_tail.load(Ordering::Relaxed);
        if old_tail == LIST_END {
            debug_assert_eq!(self.private_head.load(Ordering::Relaxed), LIST_END);
            self.private_head.store(first, Ordering::Relaxed);
        } else {
            // Safety: old_tail is the last freed location of the private list.
            unsafe { write_link(old_tail, first) };
        }
        self.private_tail.store(tail, Ordering::Relaxed);

        self.private_used.store(
            self.private_used
                .load(Ordering::Relaxed)
                .wrapping_sub(count),
            Ordering::Relaxed,
        );
    }

    // ------------------------------------------------------------------
    // Frees
    // ------------------------------------------------------------------

    /// Owner-thread free: push onto the private LIFO.
    ///
    /// # Safety
    /// `addr` must be a live location of this group; caller must be the
    /// owning thread.
    pub unsafe fn return_private_location(&self, addr: usize) {
        debug_assert!(addr != 0);

        #[cfg(feature = "steal")]
        let addr = if (addr - self.first_location()) % self.location_size() != 0 {
            // Safety: misaligned offsets only arise from stolen ranges.
            match unsafe { self.return_stolen(addr, true) } {
                Some(whole) => whole,
                None => return, // the stolen location is not empty yet
            }
        } else {
            addr
        };

        // Safety: addr is now a whole freed location.
        unsafe { write_link(addr, self.private_head.load(Ordering::Relaxed)) };
        if self.private_tail.load(Ordering::Relaxed) == LIST_END {
            self.private_tail.store(addr, Ordering::Relaxed);
        }
        self.private_head.store(addr, Ordering::Relaxed);
        self.private_used.store(
            self.private_used.load(Ordering::Relaxed).wrapping_sub(1),
            Ordering::Relaxed,
        );
    }

    /// Cross-thread free: CAS-push onto the public list. Returns the new
    /// public count, or 0 when the free was absorbed by a stolen range.
    ///
    /// # Safety
    /// `addr` must be a live location of this group allocated by its
    /// current owner lineage.
    pub unsafe fn return_public_location(&self, addr: usize) -> u32 {
        #[cfg(feature = "steal")]
        let addr = if (addr - self.first_location()) % self.location_size() != 0 {
            // Foreign frees of stolen sub-locations serialize against the
            // owner's range mutation on the group's own lock.
            let guard = self.public_lock.lock();
            // Safety: misaligned offsets only arise from stolen ranges.
            let whole = unsafe { self.return_stolen(addr, false) };
            guard.unlock();
            match whole {
                Some(whole) => whole,
                None => return 0, // the stolen location is not empty yet
            }
        } else {
            addr
        };

        loop {
            let old = self.public_head.load(Ordering::Acquire);
            let (count, first) = unpack_head(old);
            // Safety: addr is a freed location; linking it before the CAS
            // publishes it together with the new head.
            unsafe { write_link(addr, first) };
            let new = pack_head(count + 1, addr);
            if self
                .public_head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return count + 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Stealing (see the stolen-range layout below)
    // ------------------------------------------------------------------

    /// Carves a location of `size` bytes out of this group's larger
    /// locations. Called by the owner thread for one of its smaller bins.
    ///
    /// # Safety
    /// Caller must be the owning thread.
    #[cfg(feature = "steal")]
    pub unsafe fn steal_location(&self, size: u32) -> Option<NonNull<u8>> {
        let stolen = self.stolen.load(Ordering::Relaxed);

        if stolen == 0 {
            // Safety: owner-side allocation of a whole victim location.
            let location = unsafe { self.get_location()? }.as_ptr() as usize;

            if self.location_size() != 12 {
                // Safety: location is a fresh whole location of this group.
                let first = unsafe {
                    stolen_range::initialize(location, self.location_size() as u32, size)
                };
                return match first {
                    Some(first) => {
                        self.stolen.store(location, Ordering::Relaxed);
                        NonNull::new(first as *mut u8)
                    }
                    None => {
                        // The request plus headers does not fit this class;
                        // hand the location straight back.
                        // Safety: owner-side free of the location just taken.
                        unsafe { self.return_private_location(location) };
                        None
                    }
                };
            }

            // A 12-byte location fits a single 8-byte sub-location, at
            // offset 0 or 4 depending on where the 8-byte boundary falls.
            let address = if location % 8 == 0 { location } else { location + 4 };
            return NonNull::new(address as *mut u8);
        }

        // Safety: `stolen` points at a live stolen location of this group.
        let grabbed = unsafe { stolen_range::allocate(stolen, size) };
        if let Some(address) = grabbed {
            return NonNull::new(address as *mut u8);
        }

        // The active stolen location is exhausted. Take another if the
        // group still has enough slack.
        self.stolen.store(0, Ordering::Relaxed);
        if self.can_be_stolen() {
            // Safety: same contract.
            unsafe { self.steal_location(size) }
        } else {
            None
        }
    }

    /// Usable bytes of a stolen sub-location (its range's slot size).
    ///
    /// # Safety
    /// `addr` must lie inside a stolen location of this group.
    #[cfg(feature = "steal")]
    pub unsafe fn stolen_slot_size(&self, addr: usize) -> usize {
        let offset = addr - self.first_location();
        if self.location_size() == 12 {
            return 8;
        }
        let base = self.first_location() + (offset / self.location_size()) * self.location_size();
        // Safety: base is the stolen location holding `addr`.
        unsafe { stolen_range::slot_size(base, addr) as usize }
    }

    /// Handles the free of an address inside a stolen location. Returns
    /// `Some(base)` when the whole victim location became free and should
    /// take the normal free path (owner calls only); foreign calls reset
    /// the emptied location for reuse instead, keeping the owner's active
    /// pointer valid, and never return `Some`.
    ///
    /// # Safety
    /// `addr` must lie inside a stolen location of this group. Foreign
    /// callers must hold the group's public lock.
    #[cfg(feature = "steal")]
    unsafe fn return_stolen(&self, addr: usize, owner: bool) -> Option<usize> {
        let offset = addr - self.first_location();

        if self.location_size() == 12 {
            // The 8-byte sub-location occupies the whole 12-byte slot;
            // rewind to the slot base and free it as a normal location.
            return Some(self.first_location() + (offset / 12) * 12);
        }

        let base = self.first_location() + (offset / self.location_size()) * self.location_size();
        // A foreign thread cannot retire the owner's active stolen
        // location; when its free empties the whole location it is rearmed
        // (under the same lock acquisition) instead of reclaimed.
        // Safety: base is the stolen location holding `addr`.
        let freed =
            unsafe { stolen_range::free(base, addr, self.location_size() as u32, owner) };

        if !freed {
            return None;
        }

        if self.stolen.load(Ordering::Relaxed) == base {
            // Do not let future steals touch a location that is about to
            // re-enter the free lists.
            self.stolen.store(0, Ordering::Relaxed);
        }
        Some(base)
    }
}

/// Sub-allocator for stolen locations.
///
/// A stolen location starts with a 4-byte header `(free:16, position:16)`;
/// the position word's top bit is a spin lock and the low 15 bits are the
/// offset of the active range. Ranges follow, each a 4-byte header
/// `(number:8, freed:8, size:13 | alignment:2 | last:1)` plus 0..12
/// alignment bytes and then `number` sub-locations of `size` bytes.
#[cfg(feature = "steal")]
mod stolen_range {
    use super::*;
    use crate::memory::spin::BitLockGuard;

    const STOLEN_HEADER: usize = 4;
    const RANGE_HEADER: usize = 4;

    const SIZE_MASK: u16 = 0x1FFF;
    const ALIGN_MASK: u16 = 0x6000;
    // The gap is a byte count in {0,4,8,12}; shifting the raw value by 11
    // puts its two significant bits exactly in bits 13..14.
    const ALIGN_SHIFT: u32 = 11;
    const LAST_BIT: u16 = 0x8000;

    #[inline]
    unsafe fn free_bytes(base: usize) -> *mut u16 {
        base as *mut u16
    }

    #[inline]
    unsafe fn position_word<'a>(base: usize) -> &'a AtomicU16 {
        // Safety: stolen locations are at least 4-aligned (their class
        // sizes are multiples of 4), so base + 2 holds an aligned u16.
        unsafe { &*((base + 2) as *const AtomicU16) }
    }

    #[inline]
    unsafe fn number(range: usize) -> *mut u8 {
        range as *mut u8
    }

    #[inline]
    unsafe fn freed(range: usize) -> *mut u8 {
        (range + 1) as *mut u8
    }

    #[inline]
    unsafe fn size_word(range: usize) -> *mut u16 {
        (range + 2) as *mut u16
    }

    #[inline]
    unsafe fn range_payload_size(range: usize) -> u32 {
        // Safety: range points at an initialized range header.
        unsafe { u32::from(*size_word(range) & SIZE_MASK) }
    }

    #[inline]
    unsafe fn range_alignment_bytes(range: usize) -> u32 {
        // Safety: range points at an initialized range header.
        unsafe { u32::from((*size_word(range) & ALIGN_MASK) >> ALIGN_SHIFT) }
    }

    #[inline]
    unsafe fn is_last(range: usize) -> bool {
        // Safety: range points at an initialized range header.
        unsafe { *size_word(range) & LAST_BIT != 0 }
    }

    #[inline]
    unsafe fn set_last(range: usize) {
        // Safety: range points at an initialized range header.
        unsafe { *size_word(range) |= LAST_BIT };
    }

    #[inline]
    unsafe fn reset_last(range: usize) {
        // Safety: range points at an initialized range header.
        unsafe { *size_word(range) &= !LAST_BIT };
    }

    #[inline]
    unsafe fn is_empty(range: usize) -> bool {
        // Safety: range points at an initialized range header.
        unsafe { *number(range) == *freed(range) }
    }

    /// Header plus alignment plus every slot handed out so far; the next
    /// slot is allocated right past this.
    #[inline]
    unsafe fn range_size(range: usize) -> usize {
        // Safety: range points at an initialized range header.
        unsafe {
            range_payload_size(range) as usize * usize::from(*number(range))
                + RANGE_HEADER
                + range_alignment_bytes(range) as usize
        }
    }

    /// Required alignment of a sub-location: 16 when the size is a multiple
    /// of 16, 8 otherwise.
    #[inline]
    fn location_alignment(size: u32) -> u32 {
        if size % 16 == 0 { 16 } else { 8 }
    }

    /// Padding between a range header at `range` and its first slot.
    #[inline]
    fn alignment_gap(range: usize, size: u32) -> u32 {
        let alignment = location_alignment(size) as usize;
        let position = range + RANGE_HEADER;
        let aligned = (position + alignment - 1) & !(alignment - 1);
        (aligned - position) as u32
    }

    unsafe fn create_range(range: usize, size: u32, gap: u32) {
        debug_assert!(size <= u32::from(SIZE_MASK));
        debug_assert!(gap <= 12 && gap % 4 == 0);
        // Safety: caller reserves the header bytes at `range`.
        unsafe {
            *number(range) = 0;
            *freed(range) = 0;
            *size_word(range) = size as u16 | ((gap as u16) << ALIGN_SHIFT) | LAST_BIT;
        }
    }

    unsafe fn take_slot(range: usize) -> usize {
        // Safety: caller verified the slot fits; the next slot lives right
        // past the bytes handed out so far.
        unsafe {
            let address = range + range_size(range);
            *number(range) += 1;
            address
        }
    }

    /// Lays out the first range inside a fresh stolen location and takes
    /// one slot from it. Not locked: the location is not yet published.
    /// Returns `None` when the class is too small for the request plus the
    /// headers (possible when the victim class is only one step larger).
    pub(super) unsafe fn initialize(base: usize, location_size: u32, size: u32) -> Option<usize> {
        let range = base + STOLEN_HEADER;
        let gap = alignment_gap(range, size);
        let overhead = (STOLEN_HEADER + RANGE_HEADER) as u32 + gap;
        if location_size < size + overhead {
            return None;
        }

        // Safety: the location is exclusively ours.
        unsafe {
            create_range(range, size, gap);
            position_word(base).store(STOLEN_HEADER as u16, Ordering::Relaxed);
            *free_bytes(base) = (location_size - size - overhead) as u16;
            Some(take_slot(range))
        }
    }

    /// Allocates a slot of `size` from the active range, opening a new
    /// range when the active one has a different size or is saturated.
    /// Returns `None` when the location has no room left.
    pub(super) unsafe fn allocate(base: usize, size: u32) -> Option<usize> {
        let mut guard = BitLockGuard::acquire(unsafe { position_word(base) });
        // Safety: the lock serializes all range mutation.
        unsafe {
            let free = u32::from(*free_bytes(base));
            if free < size {
                return None;
            }

            let range = base + guard.low() as usize;
            if range_payload_size(range) == size && *number(range) < 255 {
                *free_bytes(base) = (free - size) as u16;
                return Some(take_slot(range));
            }

            // Open a new range past the active one.
            let range_offset = range_size(range);
            let new_range = range + range_offset;
            let gap = alignment_gap(new_range, size);

            if free >= size + RANGE_HEADER as u32 + gap {
                reset_last(range);
                create_range(new_range, size, gap);
                *free_bytes(base) = (free - size - RANGE_HEADER as u32 - gap) as u16;
                guard.add_low(range_offset as u16);
                return Some(take_slot(new_range));
            }

            None
        }
    }

    /// Records the free of the slot holding `addr`. Returns true when every
    /// range of the location is now empty and the location was reclaimed.
    /// Otherwise rewinds the active offset over any trailing run of empty
    /// ranges. When `reclaim` is false (foreign caller), an all-empty
    /// location is rearmed as a single fresh range instead — still under
    /// the same lock acquisition — and false is returned.
    pub(super) unsafe fn free(base: usize, addr: usize, location_size: u32, reclaim: bool) -> bool {
        let mut guard = BitLockGuard::acquire(unsafe { position_word(base) });
        // Safety: the lock serializes all range mutation.
        unsafe {
            let mut previous: Option<usize> = None;
            let mut series_start: Option<usize> = None;
            let mut series_prev: Option<usize> = None;
            let mut series_size = 0usize;
            let mut range = base + STOLEN_HEADER;

            loop {
                if let Some(prev) = previous {
                    if is_empty(prev) {
                        series_size += range_size(prev);
                        if series_start.is_none() {
                            series_start = Some(prev);
                        }
                    } else {
                        series_start = None;
                        series_prev = Some(prev);
                        series_size = 0;
                    }
                }

                let range_end = range + range_size(range);
                if addr > range && addr < range_end {
                    *freed(range) += 1;

                    if !(is_empty(range) && is_last(range)) {
                        return false;
                    }

                    // The trailing series (preceding empties plus this
                    // range) can be reclaimed.
                    return match (series_start, series_prev) {
                        (Some(_), None) | (None, None) => {
                            // Empty all the way from the first range: the
                            // whole location is free.
                            if reclaim {
                                true
                            } else {
                                rearm(base, location_size, &mut guard);
                                false
                            }
                        }
                        (_, Some(before)) => {
                            set_last(before);
                            guard.set_low((before - base) as u16);
                            *free_bytes(base) += (series_size + range_size(range)) as u16;
                            false
                        }
                    };
                }

                if is_last(range) {
                    debug_assert!(false, "stolen free for {addr:#x} found no range");
                    return false;
                }
                previous = Some(range);
                range = range_end;
            }
        }
    }

    /// Slot size of the range containing `addr`.
    pub(super) unsafe fn slot_size(base: usize, addr: usize) -> u32 {
        let _guard = BitLockGuard::acquire(unsafe { position_word(base) });
        // Safety: the lock serializes all range mutation.
        unsafe {
            let mut range = base + STOLEN_HEADER;
            loop {
                let range_end = range + range_size(range);
                if addr > range && addr < range_end {
                    return range_payload_size(range);
                }
                if is_last(range) {
                    debug_assert!(false, "stolen slot lookup for {addr:#x} found no range");
                    return 0;
                }
                range = range_end;
            }
        }
    }

    /// Resets a fully-empty stolen location back to a single empty range,
    /// so the owner's active pointer stays valid. The caller holds the lock.
    unsafe fn rearm(base: usize, location_size: u32, guard: &mut BitLockGuard<'_>) {
        // Safety: all ranges are empty and the lock keeps the owner out.
        unsafe {
            let range = base + STOLEN_HEADER;
            let size = range_payload_size(range);
            let gap = alignment_gap(range, size);
            create_range(range, size, gap);
            *free_bytes(base) =
                (location_size - (STOLEN_HEADER + RANGE_HEADER) as u32 - gap) as u16;
        }
        guard.set_low(STOLEN_HEADER as u16);
    }
}

#[cfg(feature = "sort")]
/// In-place merge sort of a freed-location chain by ascending address.
/// Keeps the private list address-ordered across public merges.
unsafe fn sort_chain(head: usize) -> usize {
    // Safety: the chain is exclusively owned by the caller.
    unsafe {
        if head == LIST_END || read_link(head) == LIST_END {
            return head;
        }

        // Split around the middle using a slow/fast walk.
        let mut slow = head;
        let mut fast = read_link(head);
        while fast != LIST_END {
            fast = read_link(fast);
            if fast != LIST_END {
                slow = read_link(slow);
                fast = read_link(fast);
            }
        }
        let second = read_link(slow);
        write_link(slow, LIST_END);

        let mut a = sort_chain(head);
        let mut b = sort_chain(second);

        // Merge ascending.
        let mut merged = LIST_END;
        let mut tail = LIST_END;
        while a != LIST_END || b != LIST_END {
            let take_a = b == LIST_END || (a != LIST_END && a < b);
            let next = if take_a { &mut a } else { &mut b };
            let node = *next;
            *next = read_link(node);
            if tail == LIST_END {
                merged = node;
            } else {
                write_link(tail, node);
            }
            tail = node;
        }
        if tail != LIST_END {
            write_link(tail, LIST_END);
        }
        merged
    }
}

/// Walks a null-terminated chain to its last entry.
///
/// # Safety
/// `head` must be a valid chain head (not LIST_END).
unsafe fn chain_tail(head: usize) -> usize {
    debug_assert!(head != LIST_END);
    let mut tail = head;
    // Safety: every chain entry holds a link word.
    unsafe {
        loop {
            let next = read_link(tail);
            if next == LIST_END {
                return tail;
            }
            tail = next;
        }
    }
}
