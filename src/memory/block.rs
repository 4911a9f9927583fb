//! Per (tier x NUMA node) supplier of 1 MB blocks split into groups.
//!
//! A block descriptor tracks its groups in a 64-bit occupancy bitmap (bit
//! set = group free for allocation). Descriptors live in an object pool and
//! sit on one of two lists: `full_blocks` (at least one free group) or
//! `empty_blocks` (every group handed out). Groups returned by owners while
//! still partially used wait on per-class partial lists until another
//! thread adopts them.
//!
//! Bitmap flips are atomic so the common return (no list transition) never
//! takes the allocator lock; list surgery and the partial lists are guarded
//! by one spin lock per allocator.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;

use super::context::{Bin, ThreadContext};
use super::huge::HugeHeader;
use super::list::{IntrusiveList, ListNode};
use super::object_pool::ObjectPool;
use super::page_source::{PageOps, PlatformPages};
use super::size_class::{
    BLOCK_DESCRIPTOR_CACHE, BLOCK_DESCRIPTOR_SIZE, BLOCK_DESCRIPTOR_SLAB_SIZE, BLOCK_SIZE,
    ClassInfo, SMALL_BINS, SMALL_GROUP_SIZE,
};
use super::spin::RawSpinLock;
use super::stats;

/// Static dispatch table for everything that differs between the small and
/// large tiers: layout constants, class lookup, group-header operations and
/// the per-context bin array. The allocator facade and the block allocator
/// are generic over this trait; `SmallTier` and `LargeTier` are its only
/// implementations (in `allocator.rs`, where the engine type is in scope).
pub(crate) trait Tier: Sized + 'static {
    const GROUP_SIZE: usize;
    const HEADER_SIZE: usize;
    const BIN_COUNT: usize;
    /// Fully-free blocks kept cached before releasing to the OS.
    const BLOCK_CACHE: u32;
    const ALLOW_STEAL: bool;

    fn class_of(size: usize) -> ClassInfo;
    fn bins(context: &ThreadContext) -> &[Bin];
    fn block_allocator(alloc: &super::allocator::Allocator, node: u32) -> &BlockAllocator<Self>;

    fn can_return_partial(bin: &Bin) -> bool {
        bin.can_return_partial
    }

    /// Serves the request out of a larger class's group. Small tier only;
    /// the large tier keeps the default refusal.
    ///
    /// # Safety
    /// Caller must own `context` (be its thread).
    unsafe fn try_steal(
        _alloc: &super::allocator::Allocator,
        _context: &ThreadContext,
        _bin: &Bin,
        _info: ClassInfo,
    ) -> Option<NonNull<u8>> {
        None
    }

    /// Drops stale `stolen_group` references before `group` leaves this
    /// thread. No-op for the large tier, which never lends locations.
    ///
    /// # Safety
    /// Caller must own `context`.
    unsafe fn clear_steal_refs(_context: &ThreadContext, _group: usize, _owner_bin: u32) {}

    /// Usable bytes of a stolen sub-location at `addr`. Only reachable on
    /// tiers that allow stealing.
    ///
    /// # Safety
    /// `addr` must lie inside a stolen location of `group`.
    unsafe fn stolen_slot_size(_group: usize, _addr: usize) -> usize {
        debug_assert!(false, "stolen sub-locations cannot exist on this tier");
        0
    }

    // Group header operations, all keyed by the group base address.
    unsafe fn init_unused(group: usize, location_size: u32, locations: u32, thread: u64);
    unsafe fn init_used(group: usize, thread: u64);
    unsafe fn parent_bin(group: usize) -> usize;
    unsafe fn set_parent_bin(group: usize, bin: usize);
    unsafe fn parent_block(group: usize) -> usize;
    unsafe fn set_parent_block(group: usize, block: usize);
    unsafe fn owner_thread(group: usize) -> u64;
    unsafe fn location_size(group: usize) -> usize;
    unsafe fn next_public(group: usize) -> usize;
    unsafe fn set_next_public(group: usize, next: usize);

    unsafe fn get_private_location(group: usize) -> Option<NonNull<u8>>;
    unsafe fn get_location(group: usize) -> Option<NonNull<u8>>;
    unsafe fn return_private_location(group: usize, addr: usize);
    unsafe fn return_public_location(group: usize, addr: usize) -> u32;

    unsafe fn is_empty_enough(group: usize) -> bool;
    unsafe fn can_be_stolen(group: usize) -> bool;
    unsafe fn should_return(group: usize) -> bool;
    unsafe fn is_all_free(group: usize) -> bool;
    unsafe fn may_be_full(group: usize, publics: u32) -> bool;
    unsafe fn has_public(group: usize) -> bool;
}

/// Pooled, 64-byte descriptor of one 1 MB block.
#[repr(C)]
pub(crate) struct BlockDescriptor {
    pub node: ListNode,
    /// Base of the underlying mapping (what free_pages receives).
    pub real_address: usize,
    /// Base of group 0; equals real_address except for carved windows.
    pub start_address: usize,
    /// Bit set = group free for allocation.
    pub group_bitmap: AtomicU64,
    /// Bitmap value when every group is free.
    pub full_mask: u64,
    /// Huge location this block was carved from, or 0.
    pub huge_parent: AtomicUsize,
    pub free_groups: u32,
    pub numa_node: u32,
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<BlockDescriptor>() == BLOCK_DESCRIPTOR_SIZE);

pub(crate) enum PartialAction {
    Add,
    Remove,
}

struct BlockLists {
    full_blocks: IntrusiveList,
    empty_blocks: IntrusiveList,
    partial_groups: [IntrusiveList; SMALL_BINS],
}

pub(crate) struct BlockAllocator<T: Tier> {
    lock: RawSpinLock,
    lists: UnsafeCell<BlockLists>,
    descriptor_pool: ObjectPool,
    node: u32,
    _tier: PhantomData<T>,
}

// Safety: every access to `lists` happens under `lock`; the pool has its
// own lock; descriptors are plain data guarded the same way.
unsafe impl<T: Tier> Send for BlockAllocator<T> {}
// Safety: see Send.
unsafe impl<T: Tier> Sync for BlockAllocator<T> {}

impl<T: Tier> BlockAllocator<T> {
    const GROUPS_PER_BLOCK: usize = BLOCK_SIZE / T::GROUP_SIZE;

    const fn empty_mask() -> u64 {
        // Shifting by 64 is undefined; the small tier uses the full word.
        if BLOCK_SIZE / T::GROUP_SIZE == 64 {
            u64::MAX
        } else {
            (1u64 << (BLOCK_SIZE / T::GROUP_SIZE)) - 1
        }
    }

    /// Constructs the allocator in place (descriptors of this type live in
    /// pooled memory).
    ///
    /// # Safety
    /// `this` must point at uninitialized storage of sufficient size.
    pub unsafe fn initialize(this: *mut Self, node: u32) {
        // Safety: exclusive access to fresh storage.
        unsafe {
            this.write(Self {
                lock: RawSpinLock::new(),
                lists: UnsafeCell::new(BlockLists {
                    full_blocks: IntrusiveList::new(),
                    empty_blocks: IntrusiveList::new(),
                    partial_groups: [const { IntrusiveList::new() }; SMALL_BINS],
                }),
                descriptor_pool: ObjectPool::new(
                    BLOCK_DESCRIPTOR_SLAB_SIZE,
                    BLOCK_DESCRIPTOR_SIZE,
                    BLOCK_DESCRIPTOR_CACHE,
                ),
                node,
                _tier: PhantomData,
            });
        }
    }

    /// Lists accessor; the caller must hold `self.lock`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn lists(&self) -> &mut BlockLists {
        // Safety: serialized by the spin lock per the caller contract.
        crate::sync::unsafe_cell_get_mut!(self.lists)
    }

    /// Tries to satisfy a group request from memory the allocator already
    /// holds: the class's partial list first, then the first block with a
    /// free group. Returns `None` when a new block (or a NUMA peer) is
    /// needed.
    pub fn get_cached_group(
        &self,
        info: ClassInfo,
        locations: u32,
        bin: usize,
        thread: u64,
    ) -> Option<NonNull<u8>> {
        let guard = self.lock.lock();
        // Safety: lock held.
        let lists = unsafe { self.lists() };

        // Partially used groups returned by previous owners are the best
        // candidates: their locations are likely cache- and TLB-warm.
        let group = lists.partial_groups[info.bin as usize].pop_front();
        if !group.is_null() {
            let group = group as usize;
            // Safety: the group was parked by return_partial_group and is
            // exclusively ours under the lock.
            unsafe {
                T::init_used(group, thread);
                T::set_parent_bin(group, bin);
            }
            drop(guard);
            return NonNull::new(group as *mut u8);
        }

        let descriptor = lists.full_blocks.first().cast::<BlockDescriptor>();
        if descriptor.is_null() {
            return None;
        }

        // Safety: linked descriptors are valid; lock held.
        let group = unsafe {
            let (group, block_drained) = self.take_group_from_block(descriptor);
            if block_drained {
                lists.full_blocks.remove(descriptor.cast());
                lists.empty_blocks.push_front(descriptor.cast());
            }
            T::init_unused(group, info.size, locations, thread);
            T::set_parent_bin(group, bin);
            group
        };
        drop(guard);
        NonNull::new(group as *mut u8)
    }

    /// Takes a free group from the first block of another node's allocator
    /// without growing it. The caller initializes the group.
    #[cfg(feature = "numa")]
    pub fn try_get_group(&self) -> Option<NonNull<u8>> {
        let _guard = self.lock.lock();
        // Safety: lock held.
        let lists = unsafe { self.lists() };

        let descriptor = lists.full_blocks.first().cast::<BlockDescriptor>();
        if descriptor.is_null() {
            return None;
        }

        // Safety: linked descriptors are valid; lock held.
        unsafe {
            let (group, block_drained) = self.take_group_from_block(descriptor);
            if block_drained {
                lists.full_blocks.remove(descriptor.cast());
                lists.empty_blocks.push_front(descriptor.cast());
            }
            NonNull::new(group as *mut u8)
        }
    }

    /// Maps a fresh block and takes its first group.
    pub fn get_group_new_block(
        &self,
        info: ClassInfo,
        locations: u32,
        bin: usize,
        thread: u64,
    ) -> Option<NonNull<u8>> {
        let descriptor = self.allocate_block()?;

        let guard = self.lock.lock();
        // Safety: lock held; descriptor is fresh and exclusively ours.
        let group = unsafe {
            let lists = self.lists();
            lists.full_blocks.push_front(descriptor.cast());
            // A fresh block cannot drain from a single take (64 or 16
            // groups per block).
            let (group, _) = self.take_group_from_block(descriptor);
            T::init_unused(group, info.size, locations, thread);
            T::set_parent_bin(group, bin);
            group
        };
        drop(guard);
        NonNull::new(group as *mut u8)
    }

    /// Flips one free bit off the block and wires the group's block
    /// back-reference. Returns the group address and whether the block ran
    /// out of free groups.
    ///
    /// # Safety
    /// Lock held; `descriptor` must have at least one free group.
    unsafe fn take_group_from_block(&self, descriptor: *mut BlockDescriptor) -> (usize, bool) {
        // Safety: per contract.
        unsafe {
            let bitmap = (*descriptor).group_bitmap.load(Ordering::Relaxed);
            debug_assert!(bitmap != 0);
            let index = bitmap.trailing_zeros() as usize;
            // Returning threads only set bits, so clearing ours cannot lose
            // their updates; the RMW keeps both sides consistent.
            let old = (*descriptor)
                .group_bitmap
                .fetch_and(!(1u64 << index), Ordering::AcqRel);
            let drained = old & !(1u64 << index) == 0;

            let group = (*descriptor).start_address + index * T::GROUP_SIZE;
            T::set_parent_block(group, descriptor as usize);

            let parent = (*descriptor).huge_parent.load(Ordering::Relaxed);
            if parent != 0 {
                (*(parent as *const HugeHeader)).add_ref();
            }

            (group, drained)
        }
    }

    /// Returns a fully-free group to its block, handling every list
    /// transition the flip can trigger. The hot case (block keeps both free
    /// and used groups) touches only the bitmap.
    ///
    /// # Safety
    /// `group` must be a group of this allocator with no live locations.
    pub unsafe fn return_full_group(&self, group: usize) {
        // Safety: the group's block reference is valid while the group is
        // checked out.
        let descriptor = unsafe { T::parent_block(group) as *mut BlockDescriptor };

        #[cfg(feature = "numa")]
        // Safety: descriptor is valid.
        if unsafe { (*descriptor).numa_node } != self.node {
            // The group was borrowed from a peer node; hand it home so
            // node-local memory stays node-local.
            debug_assert!(false, "misrouted cross-node group return");
        }

        // Safety: descriptor is valid; bitmap flips are atomic.
        unsafe {
            let index = (group - (*descriptor).start_address) / T::GROUP_SIZE;
            let bit = 1u64 << index;
            let old = (*descriptor).group_bitmap.fetch_or(bit, Ordering::AcqRel);
            debug_assert!(old & bit == 0, "group {index} returned twice");

            let was_empty = old == 0;
            let now_full = old | bit == (*descriptor).full_mask;
            let parent = (*descriptor).huge_parent.load(Ordering::Relaxed);
            let huge_done = parent != 0 && (*(parent as *const HugeHeader)).release();

            if huge_done {
                // Last reference into the carved region: the whole huge
                // mapping goes back to the OS.
                let guard = self.lock.lock();
                let lists = self.lists();
                if was_empty {
                    lists.empty_blocks.remove(descriptor.cast());
                } else {
                    lists.full_blocks.remove(descriptor.cast());
                }
                drop(guard);
                self.release_block(descriptor);
                return;
            }

            if was_empty {
                let _guard = self.lock.lock();
                let lists = self.lists();
                // The bitmap reads zero only while a taker holds the lock,
                // so a non-zero re-read means nobody re-drained the block.
                if (*descriptor).group_bitmap.load(Ordering::Relaxed) != 0 {
                    lists.empty_blocks.remove(descriptor.cast());
                    lists.full_blocks.push_front(descriptor.cast());
                }
            } else if now_full {
                let guard = self.lock.lock();
                let lists = self.lists();
                // Keep a few fully-free blocks cached; carved blocks are
                // reclaimed through their huge parent's refcount instead.
                if (*descriptor).group_bitmap.load(Ordering::Relaxed) == (*descriptor).full_mask
                    && lists.full_blocks.count() + lists.empty_blocks.count() > T::BLOCK_CACHE
                    && parent == 0
                {
                    lists.full_blocks.remove(descriptor.cast());
                    drop(guard);
                    self.release_block(descriptor);
                }
            }
        }
    }

    /// Adds or removes a partially-used group on the class's partial list.
    /// Both directions re-verify ownership under the lock: the request may
    /// be stale by the time the lock is held (the group re-adopted, or
    /// already pulled off the list).
    ///
    /// # Safety
    /// `group` must be a group of this allocator.
    pub unsafe fn return_partial_group(
        &self,
        group: usize,
        action: PartialAction,
        class_bin: u32,
        thread: u64,
    ) {
        let guard = self.lock.lock();
        // Safety: lock held.
        let lists = unsafe { self.lists() };

        match action {
            PartialAction::Add => {
                // Safety: group header reads are valid while checked out.
                unsafe {
                    if T::owner_thread(group) != thread {
                        // Someone else already adopted the group; this add
                        // raced and lost.
                        return;
                    }
                    T::set_parent_bin(group, 0);
                    lists.partial_groups[class_bin as usize].push_front(group as *mut ListNode);
                }
                stats::PARTIAL_RETURNS.hit();
            }
            PartialAction::Remove => {
                // Safety: group header reads are valid while checked out.
                unsafe {
                    if T::parent_bin(group) != 0 {
                        // The group left the partial list (re-adopted)
                        // before this request took the lock.
                        return;
                    }
                    lists.partial_groups[class_bin as usize].remove(group as *mut ListNode);
                    guard.unlock();
                    self.return_full_group(group);
                }
            }
        }
    }

    /// Creates a descriptor for a group window carved out of a huge
    /// allocation's slack and makes it allocatable.
    ///
    /// # Safety
    /// `[start, start + groups * GROUP_SIZE)` must be an exclusive,
    /// group-aligned window inside the huge mapping at `parent`.
    pub unsafe fn add_block(
        &self,
        start: usize,
        real: usize,
        bitmap: u64,
        groups: u32,
        parent: usize,
    ) -> Option<*mut BlockDescriptor> {
        let descriptor = self.descriptor_pool.get()?.as_ptr().cast::<BlockDescriptor>();

        // Safety: fresh pooled storage.
        unsafe {
            descriptor.write(BlockDescriptor {
                node: ListNode::new(),
                real_address: real,
                start_address: start,
                group_bitmap: AtomicU64::new(bitmap),
                full_mask: bitmap,
                huge_parent: AtomicUsize::new(parent),
                free_groups: groups,
                numa_node: self.node,
            });
        }

        let _guard = self.lock.lock();
        // Safety: lock held; descriptor is unlinked.
        unsafe { self.lists().full_blocks.push_front(descriptor.cast()) };
        Some(descriptor)
    }

    /// Drops a carved block descriptor and releases the backing huge
    /// mapping. Invoked when the parent's refcount hits zero on the huge
    /// side.
    ///
    /// # Safety
    /// `descriptor` must be a descriptor of this allocator with every group
    /// free.
    pub unsafe fn remove_block(&self, descriptor: *mut BlockDescriptor) {
        let guard = self.lock.lock();
        // Safety: all groups free implies the block is on the full list.
        unsafe {
            debug_assert_eq!(
                (*descriptor).group_bitmap.load(Ordering::Relaxed),
                (*descriptor).full_mask
            );
            self.lists().full_blocks.remove(descriptor.cast());
        }
        drop(guard);
        self.release_block(descriptor);
    }

    fn allocate_block(&self) -> Option<*mut BlockDescriptor> {
        let descriptor = self.descriptor_pool.get()?.as_ptr().cast::<BlockDescriptor>();

        // Groups must start on group-size boundaries for the address
        // masking in Deallocate to work.
        // Safety: FFI page mapping.
        let pages = match unsafe { PlatformPages::alloc_pages(BLOCK_SIZE, SMALL_GROUP_SIZE, self.node) }
        {
            Ok(pages) => pages.as_ptr() as usize,
            Err(_) => {
                // Safety: descriptor came from our pool just above.
                unsafe { self.descriptor_pool.put(NonNull::new_unchecked(descriptor.cast())) };
                return None;
            }
        };

        // Safety: fresh pooled storage.
        unsafe {
            descriptor.write(BlockDescriptor {
                node: ListNode::new(),
                real_address: pages,
                start_address: pages,
                group_bitmap: AtomicU64::new(Self::empty_mask()),
                full_mask: Self::empty_mask(),
                huge_parent: AtomicUsize::new(0),
                free_groups: Self::GROUPS_PER_BLOCK as u32,
                numa_node: self.node,
            });
        }

        stats::TOTAL_MAPPED.add(BLOCK_SIZE);
        stats::BLOCK_BYTES.add(BLOCK_SIZE);
        Some(descriptor)
    }

    fn release_block(&self, descriptor: *mut BlockDescriptor) {
        // Safety: descriptor fields are stable once unlinked.
        unsafe {
            let parent = (*descriptor).huge_parent.load(Ordering::Relaxed);
            if parent != 0 {
                // Carved block: the mapping belongs to the huge region.
                let header = &*(parent as *const HugeHeader);
                let (addr, size) = (header.address(), header.size());
                drop(PlatformPages::free_pages(
                    NonNull::new_unchecked(addr as *mut u8),
                    size,
                ));
                stats::TOTAL_MAPPED.sub(size);
                stats::HUGE_BYTES.sub(size);
            } else {
                drop(PlatformPages::free_pages(
                    NonNull::new_unchecked((*descriptor).real_address as *mut u8),
                    BLOCK_SIZE,
                ));
                stats::TOTAL_MAPPED.sub(BLOCK_SIZE);
                stats::BLOCK_BYTES.sub(BLOCK_SIZE);
            }
            self.descriptor_pool.put(NonNull::new_unchecked(descriptor.cast()));
        }
    }

    #[cfg(test)]
    pub fn full_block_count(&self) -> u32 {
        let _guard = self.lock.lock();
        // Safety: lock held.
        unsafe { self.lists().full_blocks.count() }
    }

    #[cfg(test)]
    pub fn empty_block_count(&self) -> u32 {
        let _guard = self.lock.lock();
        // Safety: lock held.
        unsafe { self.lists().empty_blocks.count() }
    }

    #[cfg(test)]
    pub fn partial_count(&self, class_bin: u32) -> u32 {
        let _guard = self.lock.lock();
        // Safety: lock held.
        unsafe { self.lists().partial_groups[class_bin as usize].count() }
    }
}

impl<T: Tier> Drop for BlockAllocator<T> {
    fn drop(&mut self) {
        // Engine teardown: every cached block goes back to the OS. Blocks
        // with live groups are the caller's leak, not ours to touch.
        let guard = self.lock.lock();
        // Safety: lock held (and exclusive access via &mut anyway).
        let lists = unsafe { self.lists() };
        let mut releasable = Vec::new();
        loop {
            let descriptor = lists.full_blocks.pop_front().cast::<BlockDescriptor>();
            if descriptor.is_null() {
                break;
            }
            // Safety: descriptor is valid while listed.
            unsafe {
                if (*descriptor).group_bitmap.load(Ordering::Relaxed) == (*descriptor).full_mask
                    && (*descriptor).huge_parent.load(Ordering::Relaxed) == 0
                {
                    releasable.push(descriptor);
                }
            }
        }
        drop(guard);
        for descriptor in releasable {
            self.release_block(descriptor);
        }
    }
}
