//! The allocator facade: classifies sizes, routes requests to the right
//! tier, owns the per-node block allocators and the huge-bin caches, and
//! reconciles frees that cross thread or lifecycle boundaries.
//!
//! Allocation order inside a bin (small and large tiers alike):
//!   1. the active group's private locations;
//!   2. the second group, if it has room (made active first) — if it has
//!      none, no later group does either;
//!   3. a group from the bin's public chain (privatizes its foreign frees);
//!   4. a location stolen from a larger class (small tier);
//!   5. a group from the block allocator: partial list, NUMA peer, or a
//!      fresh block.
//!
//! Deallocation recovers the group from the pointer by masking and reads
//! the tier marker out of the group's header; offsets within the first 64
//! bytes of a 16 KB boundary belong to the huge or OS headers instead.

use std::ptr::NonNull;

use crate::sync::OnceLock;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::cell::Cell;

use super::block::{BlockAllocator, BlockDescriptor, PartialAction, Tier};
use super::context::{Bin, ThreadContext, context_object_size};
use super::group::{GroupHeader, NOT_QUEUED};
use super::huge::{HugeBin, HugeHeader, uptime_secs};
use super::large_group::LargeGroupHeader;
use super::list::ListNode;
use super::object_pool::ObjectPool;
use super::page_source::{PageError, PageOps, PlatformPages, topology};
use super::reaper::Reaper;
use super::size_class::{
    BLOCK_ALLOCATOR_CACHE, BLOCK_ALLOCATOR_SIZE, BLOCK_ALLOCATOR_SLAB_SIZE, BLOCK_LARGE_CACHE,
    BLOCK_SMALL_CACHE, ClassInfo, GROUPS_PER_BLOCK, HUGE_BIN_SLOTS, HUGE_FIRST_BIN,
    HUGE_GRANULARITY, HUGE_HEADER_SIZE, HUGE_SPLIT_POSITION, LARGE_BINS, LARGE_GROUP_HEADER_SIZE,
    LARGE_GROUP_SIZE, MAX_HUGE_SIZE, MAX_LARGE_SIZE, MAX_NUMA_NODES, MAX_SMALL_SIZE,
    OS_GRANULARITY, OS_HEADER_SIZE, SMALL_BINS, SMALL_GROUP_HEADER_SIZE, SMALL_GROUP_SIZE,
    THREAD_CONTEXT_CACHE, THREAD_CONTEXT_SLAB_SIZE, large_class, small_class,
};
use super::stats::{self, MemoryStats};

/// `parent_bin` value while an owner is mid-way through returning the
/// group: already out of the bin (foreigners must not link it into the
/// public chain) but not yet on the block allocator's partial list
/// (foreigners must not request a partial-list transition either).
const BIN_PENDING: usize = usize::MAX;

/// Header in front of pass-through OS allocations; the client pointer sits
/// at offset 16 from a 16 KB boundary, which is how deallocation tells
/// these apart from huge locations (offset 64) and group locations
/// (offset >= 192).
#[repr(C)]
struct OsHeader {
    real_address: usize,
    mapped_size: usize,
}

const _: () = assert!(size_of::<OsHeader>() == OS_HEADER_SIZE);

// ---------------------------------------------------------------------------
// Tier dispatch tables
// ---------------------------------------------------------------------------

pub(crate) struct SmallTier;
pub(crate) struct LargeTier;

macro_rules! group_header_ops {
    ($Header:ty) => {
        #[inline]
        unsafe fn init_used(group: usize, thread: u64) {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).initialize_used(thread) }
        }

        #[inline]
        unsafe fn parent_bin(group: usize) -> usize {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).parent_bin.load(Ordering::Acquire) }
        }

        #[inline]
        unsafe fn set_parent_bin(group: usize, bin: usize) {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).parent_bin.store(bin, Ordering::Release) }
        }

        #[inline]
        unsafe fn parent_block(group: usize) -> usize {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).parent_block.load(Ordering::Relaxed) }
        }

        #[inline]
        unsafe fn set_parent_block(group: usize, block: usize) {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).parent_block.store(block, Ordering::Relaxed) }
        }

        #[inline]
        unsafe fn owner_thread(group: usize) -> u64 {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).owner_thread.load(Ordering::Relaxed) }
        }

        #[inline]
        unsafe fn location_size(group: usize) -> usize {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).location_size() }
        }

        #[inline]
        unsafe fn next_public(group: usize) -> usize {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).next_public.load(Ordering::Relaxed) }
        }

        #[inline]
        unsafe fn set_next_public(group: usize, next: usize) {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).next_public.store(next, Ordering::Relaxed) }
        }

        #[inline]
        unsafe fn get_private_location(group: usize) -> Option<NonNull<u8>> {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).get_private_location() }
        }

        #[inline]
        unsafe fn get_location(group: usize) -> Option<NonNull<u8>> {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).get_location() }
        }

        #[inline]
        unsafe fn return_private_location(group: usize, addr: usize) {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).return_private_location(addr) }
        }

        #[inline]
        unsafe fn return_public_location(group: usize, addr: usize) -> u32 {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).return_public_location(addr) }
        }

        #[inline]
        unsafe fn is_empty_enough(group: usize) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).is_empty_enough() }
        }

        #[inline]
        unsafe fn can_be_stolen(group: usize) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).can_be_stolen() }
        }

        #[inline]
        unsafe fn should_return(group: usize) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).should_return() }
        }

        #[inline]
        unsafe fn is_all_free(group: usize) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).is_all_free() }
        }

        #[inline]
        unsafe fn may_be_full(group: usize, publics: u32) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).may_be_full(publics) }
        }

        #[inline]
        unsafe fn has_public(group: usize) -> bool {
            // Safety: forwarded caller contract.
            unsafe { (*(group as *const $Header)).has_public() }
        }
    };
}

impl Tier for SmallTier {
    const GROUP_SIZE: usize = SMALL_GROUP_SIZE;
    const HEADER_SIZE: usize = SMALL_GROUP_HEADER_SIZE;
    const BIN_COUNT: usize = SMALL_BINS;
    const BLOCK_CACHE: u32 = BLOCK_SMALL_CACHE;
    const ALLOW_STEAL: bool = cfg!(feature = "steal");

    fn class_of(size: usize) -> ClassInfo {
        small_class(size)
    }

    fn bins(context: &ThreadContext) -> &[Bin] {
        &context.small_bins
    }

    fn block_allocator(alloc: &Allocator, node: u32) -> &BlockAllocator<Self> {
        alloc.small_allocator(node)
    }

    #[cfg(feature = "steal")]
    unsafe fn try_steal(
        _alloc: &Allocator,
        context: &ThreadContext,
        bin: &Bin,
        info: ClassInfo,
    ) -> Option<NonNull<u8>> {
        // Safety: owner-thread access per the caller contract.
        unsafe {
            let mut victim = bin.stolen_group.get();

            if victim == 0 && bin.can_steal.get() {
                if let Some(index) = context.find_stealable(bin.number + 1) {
                    let candidate = context.small_bins[index as usize].groups().first() as usize;
                    // The bitmap is refreshed only when a group is
                    // initialized or made active; recheck the group itself.
                    if candidate != 0 && (*(candidate as *const GroupHeader)).can_be_stolen() {
                        victim = candidate;
                        bin.stolen_group.set(victim);
                        let header = &*(candidate as *const GroupHeader);
                        if bin.number < header.smallest_stealer.load(Ordering::Relaxed) {
                            header.smallest_stealer.store(bin.number, Ordering::Relaxed);
                        }
                    }
                }
            }

            if victim != 0 {
                if let Some(address) = (*(victim as *const GroupHeader)).steal_location(info.size) {
                    bin.stolen_locations.set(bin.stolen_locations.get() + 1);
                    bin.can_steal
                        .set(bin.stolen_locations.get() < bin.max_stolen_locations);
                    stats::LOCATIONS_STOLEN.hit();
                    return Some(address);
                }
                // The victim ran dry.
                bin.stolen_group.set(0);
            }

            None
        }
    }

    #[cfg(feature = "steal")]
    unsafe fn clear_steal_refs(context: &ThreadContext, group: usize, owner_bin: u32) {
        // Safety: owner-thread access per the caller contract.
        unsafe {
            let smallest = (*(group as *const GroupHeader))
                .smallest_stealer
                .load(Ordering::Relaxed);
            if smallest == super::size_class::NOT_STOLEN {
                return;
            }
            // Only bins below the owner can have stolen from the group.
            for number in smallest..owner_bin {
                let bin = &context.small_bins[number as usize];
                if bin.stolen_group.get() == group {
                    bin.stolen_group.set(0);
                }
            }
        }
    }

    #[cfg(feature = "steal")]
    unsafe fn stolen_slot_size(group: usize, addr: usize) -> usize {
        // Safety: forwarded caller contract.
        unsafe { (*(group as *const GroupHeader)).stolen_slot_size(addr) }
    }

    #[inline]
    unsafe fn init_unused(group: usize, location_size: u32, locations: u32, thread: u64) {
        // Safety: forwarded caller contract.
        unsafe {
            GroupHeader::initialize_unused(group as *mut GroupHeader, location_size, locations, thread)
        }
    }

    group_header_ops!(GroupHeader);
}

impl Tier for LargeTier {
    const GROUP_SIZE: usize = LARGE_GROUP_SIZE;
    const HEADER_SIZE: usize = LARGE_GROUP_HEADER_SIZE;
    const BIN_COUNT: usize = LARGE_BINS;
    const BLOCK_CACHE: u32 = BLOCK_LARGE_CACHE;
    const ALLOW_STEAL: bool = false;

    fn class_of(size: usize) -> ClassInfo {
        large_class(size)
    }

    fn bins(context: &ThreadContext) -> &[Bin] {
        &context.large_bins
    }

    fn block_allocator(alloc: &Allocator, node: u32) -> &BlockAllocator<Self> {
        alloc.large_allocator(node)
    }

    #[inline]
    unsafe fn init_unused(group: usize, location_size: u32, locations: u32, thread: u64) {
        // Safety: forwarded caller contract.
        unsafe {
            LargeGroupHeader::initialize_unused(
                group as *mut LargeGroupHeader,
                location_size,
                locations,
                thread,
            )
        }
    }

    group_header_ops!(LargeGroupHeader);
}

// ---------------------------------------------------------------------------
// Thread context handle (TLS)
// ---------------------------------------------------------------------------

crate::sync::static_atomic! {
    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
}

/// Per-thread slot binding the thread to its context. A thread uses at
/// most one engine at a time; rebinding to a different engine abandons the
/// old context into its owner's pool (reclaimed wholesale when that engine
/// drops). Thread exit returns the context only to the process-wide
/// engine, which is the only one guaranteed to still be alive.
struct ContextHandle {
    allocator: Cell<usize>,
    context: Cell<usize>,
    thread_id: Cell<u64>,
}

impl ContextHandle {
    fn new() -> Self {
        Self {
            allocator: Cell::new(0),
            context: Cell::new(0),
            thread_id: Cell::new(0),
        }
    }

    /// Process-unique, never-reused thread identifier, assigned lazily so
    /// threads that only free never pay for context creation.
    fn thread_id(&self) -> u64 {
        let id = self.thread_id.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        self.thread_id.set(id);
        id
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        let context = self.context.get();
        if context == 0 {
            return;
        }
        if let Some(global) = GLOBAL_INSTANCE.get() {
            if self.allocator.get() == global as *const Allocator as usize {
                // Safety: the context belongs to the global engine and this
                // thread is done with it.
                unsafe {
                    global.release_context(NonNull::new_unchecked(context as *mut ThreadContext));
                }
            }
        }
    }
}

thread_local! {
    static CONTEXT: ContextHandle = ContextHandle::new();
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

static GLOBAL_INSTANCE: OnceLock<Allocator> = OnceLock::new();

pub struct Allocator {
    small_nodes: [AtomicUsize; MAX_NUMA_NODES],
    large_nodes: [AtomicUsize; MAX_NUMA_NODES],
    node_count: u32,
    context_pool: ObjectPool,
    allocator_pool: ObjectPool,
    huge_bins: [HugeBin; HUGE_BIN_SLOTS],
    reaper: Reaper,
}

/// Pool object size for block allocators (both tiers share one pool).
fn allocator_object_size() -> usize {
    size_of::<BlockAllocator<SmallTier>>()
        .max(size_of::<BlockAllocator<LargeTier>>())
        .next_multiple_of(64)
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<BlockAllocator<SmallTier>>() <= BLOCK_ALLOCATOR_SIZE);
#[cfg(not(loom))]
const _: () = assert!(size_of::<BlockAllocator<LargeTier>>() <= BLOCK_ALLOCATOR_SIZE);

impl Allocator {
    /// Builds a standalone engine: per-node block allocators for both
    /// tiers, the context pool, and the huge bins. Page source first, then
    /// pools, then block allocators — nothing may enter the allocate path
    /// before this returns.
    pub fn new() -> Result<Allocator, PageError> {
        let node_count = topology().node_count().min(MAX_NUMA_NODES as u32);

        let allocator = Allocator {
            small_nodes: [const { AtomicUsize::new(0) }; MAX_NUMA_NODES],
            large_nodes: [const { AtomicUsize::new(0) }; MAX_NUMA_NODES],
            node_count,
            context_pool: ObjectPool::new(
                THREAD_CONTEXT_SLAB_SIZE,
                context_object_size(),
                THREAD_CONTEXT_CACHE,
            ),
            allocator_pool: ObjectPool::new(
                BLOCK_ALLOCATOR_SLAB_SIZE,
                allocator_object_size(),
                BLOCK_ALLOCATOR_CACHE,
            ),
            huge_bins: std::array::from_fn(|bucket| HugeBin::new(bucket as u32)),
            reaper: Reaper::new(),
        };

        for node in 0..node_count {
            let small = allocator.allocator_pool.get().ok_or_else(out_of_records)?;
            // Safety: fresh pooled storage of sufficient size (asserted).
            unsafe {
                BlockAllocator::<SmallTier>::initialize(small.as_ptr().cast(), node);
            }
            allocator.small_nodes[node as usize].store(small.as_ptr() as usize, Ordering::Release);

            let large = allocator.allocator_pool.get().ok_or_else(out_of_records)?;
            // Safety: as above.
            unsafe {
                BlockAllocator::<LargeTier>::initialize(large.as_ptr().cast(), node);
            }
            allocator.large_nodes[node as usize].store(large.as_ptr() as usize, Ordering::Release);
        }

        Ok(allocator)
    }

    pub(crate) fn small_allocator(&self, node: u32) -> &BlockAllocator<SmallTier> {
        let addr = self.small_nodes[node as usize].load(Ordering::Acquire);
        debug_assert!(addr != 0, "block allocator for node {node} missing");
        // Safety: initialized in new() and immutable afterwards.
        unsafe { &*(addr as *const BlockAllocator<SmallTier>) }
    }

    pub(crate) fn large_allocator(&self, node: u32) -> &BlockAllocator<LargeTier> {
        let addr = self.large_nodes[node as usize].load(Ordering::Acquire);
        debug_assert!(addr != 0, "block allocator for node {node} missing");
        // Safety: initialized in new() and immutable afterwards.
        unsafe { &*(addr as *const BlockAllocator<LargeTier>) }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats::snapshot()
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Returns a location of at least `size` bytes, or null when the
    /// system is out of memory. Small and large classes align to 8 or 16
    /// bytes depending on the class size; huge and OS locations align to
    /// 16.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let address = if size <= MAX_SMALL_SIZE {
            self.allocate_tier::<SmallTier>(small_class(size))
        } else if size <= MAX_LARGE_SIZE {
            self.allocate_tier::<LargeTier>(large_class(size))
        } else if size <= MAX_HUGE_SIZE {
            self.allocate_huge(size)
        } else {
            self.allocate_from_os(size)
        };
        address.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Frees a location returned by [`allocate`](Self::allocate). Null is
    /// a no-op; anything else not from this engine is undefined.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this engine.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let addr = ptr as usize;
        let aligned = addr & !(SMALL_GROUP_SIZE - 1);
        let offset = addr - aligned;

        // Safety: live allocations guarantee the headers read below.
        unsafe {
            if offset <= HUGE_HEADER_SIZE {
                // Group locations start at offset 192 or later, so this
                // window belongs to the front-of-mapping headers.
                if offset <= OS_HEADER_SIZE {
                    self.deallocate_os(addr);
                } else {
                    self.free_huge(addr);
                }
                return;
            }

            let marker = &*(aligned as *const ListNode);
            if marker.next.is_large_tier() {
                let group = aligned - marker.next.subgroup() as usize * SMALL_GROUP_SIZE;
                self.deallocate_tier::<LargeTier>(addr, group);
            } else {
                self.deallocate_tier::<SmallTier>(addr, aligned);
            }
        }
    }

    /// Resizes a location, moving it if the current class cannot hold
    /// `new_size`. The copy is a plain byte move.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this engine.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.deallocate(ptr) };
            return std::ptr::null_mut();
        }

        // Safety: ptr is a live allocation.
        let usable = unsafe { self.usable_size(ptr as usize) };
        if new_size <= usable {
            return ptr;
        }

        let fresh = self.allocate(new_size);
        if fresh.is_null() {
            return std::ptr::null_mut();
        }
        // Safety: both regions are live and at least `usable` /
        // `new_size` bytes; they cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, fresh, usable.min(new_size));
            self.deallocate(ptr);
        }
        fresh
    }

    /// Stops the background cache reaper (it restarts on the next huge
    /// allocation). Exposed for deterministic teardown in tests.
    pub fn shutdown_reaper(&self) {
        self.reaper.shutdown();
    }

    /// Returns the calling thread's context (with all its groups) to this
    /// engine. Used by tests and on thread exit; afterwards the thread can
    /// keep allocating, which creates a fresh context.
    pub fn release_thread_context(&self) {
        CONTEXT.with(|handle| {
            if handle.allocator.get() != self as *const Allocator as usize {
                return;
            }
            let context = handle.context.get();
            handle.allocator.set(0);
            handle.context.set(0);
            if let Some(context) = NonNull::new(context as *mut ThreadContext) {
                // Safety: the context was created by this engine and the
                // calling thread owns it.
                unsafe { self.release_context(context) };
            }
        });
    }

    // ------------------------------------------------------------------
    // Thread contexts
    // ------------------------------------------------------------------

    fn thread_id(&self) -> u64 {
        CONTEXT.with(ContextHandle::thread_id)
    }

    /// The calling thread's context for this engine, created on first use.
    fn context(&self) -> Option<NonNull<ThreadContext>> {
        CONTEXT.with(|handle| {
            if handle.allocator.get() == self as *const Allocator as usize {
                if let Some(context) = NonNull::new(handle.context.get() as *mut ThreadContext) {
                    return Some(context);
                }
            }
            self.create_context(handle)
        })
    }

    /// The context only if it already exists (never creates).
    fn existing_context(&self) -> Option<NonNull<ThreadContext>> {
        CONTEXT.with(|handle| {
            if handle.allocator.get() == self as *const Allocator as usize {
                NonNull::new(handle.context.get() as *mut ThreadContext)
            } else {
                None
            }
        })
    }

    #[cold]
    fn create_context(&self, handle: &ContextHandle) -> Option<NonNull<ThreadContext>> {
        let record = self.context_pool.get()?;
        let node = topology().current_node().min(self.node_count - 1);
        // Safety: fresh pooled record of context_object_size() bytes.
        unsafe {
            ThreadContext::initialize(record.as_ptr().cast(), handle.thread_id(), node);
        }
        handle.allocator.set(self as *const Allocator as usize);
        handle.context.set(record.as_ptr() as usize);
        stats::CONTEXTS_CREATED.hit();
        Some(record.cast())
    }

    /// Returns every group of the context to the block allocators, then
    /// the context record to the pool.
    ///
    /// # Safety
    /// The calling thread must own `context` and stop using it afterwards.
    pub(crate) unsafe fn release_context(&self, context: NonNull<ThreadContext>) {
        // Safety: forwarded caller contract.
        unsafe {
            self.release_tier_bins::<SmallTier>(context.as_ref());
            self.release_tier_bins::<LargeTier>(context.as_ref());
            self.context_pool.put(context.cast());
        }
    }

    unsafe fn release_tier_bins<T: Tier>(&self, context: &ThreadContext) {
        for bin in T::bins(context) {
            loop {
                // Safety: owner-thread bin access.
                let group = unsafe { bin.groups().pop_front() } as usize;
                if group == 0 {
                    break;
                }

                // Safety: the group is owned by this context.
                unsafe {
                    let guard = bin.public_lock.lock();
                    T::set_parent_bin(group, BIN_PENDING);
                    self.unlink_public_chain::<T>(bin, group);
                    guard.unlock();

                    T::clear_steal_refs(context, group, bin.number);
                    let node =
                        (*(T::parent_block(group) as *const BlockDescriptor)).numa_node;
                    if T::is_all_free(group) {
                        T::set_parent_bin(group, 0);
                        stats::GROUPS_RETURNED.hit();
                        T::block_allocator(self, node).return_full_group(group);
                    } else {
                        let class_bin = T::class_of(T::location_size(group)).bin;
                        T::block_allocator(self, node).return_partial_group(
                            group,
                            PartialAction::Add,
                            class_bin,
                            context.thread_id,
                        );
                    }
                }
            }
            bin.stolen_group.set(0);
        }
    }

    // ------------------------------------------------------------------
    // Small/large tier allocation
    // ------------------------------------------------------------------

    fn allocate_tier<T: Tier>(&self, info: ClassInfo) -> Option<NonNull<u8>> {
        let context = self.context()?;
        // Safety: the context is this thread's; the reference does not
        // outlive the call.
        let context = unsafe { context.as_ref() };
        let bin = &T::bins(context)[info.bin as usize];

        // 1. The active group.
        // Safety: owner-thread bin access (each `bin.groups()` borrow is
        // scoped to its statement).
        let active = unsafe { bin.groups().first() } as usize;
        if active != 0 {
            // Safety: owned group.
            if let Some(address) = unsafe { T::get_private_location(active) } {
                return Some(address);
            }
        }

        // 2. The second group. If it has no room, no later group does
        // either (returns keep that invariant), so don't scan further.
        // Safety: owner-thread bin access.
        if unsafe { bin.groups().count() } >= 2 {
            // Safety: count >= 2 implies a linked second node.
            let second = unsafe { (*bin.groups().first()).next.ptr() } as usize;
            // Safety: owned group.
            if unsafe { T::is_empty_enough(second) } {
                self.make_group_active::<T>(bin, second);
                if T::ALLOW_STEAL {
                    // Safety: owned group.
                    context.set_stealable(info.bin, unsafe { T::can_be_stolen(second) });
                }
                // Safety: owned group; room was just verified.
                return unsafe { T::get_location(second) };
            }
        }

        // 3. A group some foreign thread freed into.
        if bin.public_group.load(Ordering::Acquire) != 0 {
            let guard = bin.public_lock.lock();
            let group = bin.public_group.load(Ordering::Relaxed);
            if group != 0 {
                // Safety: chained groups are owned by this bin.
                unsafe {
                    bin.public_group.store(T::next_public(group), Ordering::Relaxed);
                    T::set_next_public(group, NOT_QUEUED);
                }
            }
            guard.unlock();

            if group != 0 {
                // Safety: owner-thread bin access.
                if group != unsafe { bin.groups().first() } as usize {
                    self.make_group_active::<T>(bin, group);
                }
                // Safety: owned group; privatizes the public list.
                let address = unsafe { T::get_location(group) };
                if T::ALLOW_STEAL {
                    // Safety: owned group.
                    context.set_stealable(info.bin, unsafe { T::can_be_stolen(group) });
                }
                if address.is_some() {
                    return address;
                }
            }
        }

        // 4. Steal from a larger class.
        if T::ALLOW_STEAL {
            // Safety: owner-thread context access.
            if let Some(address) = unsafe { T::try_steal(self, context, bin, info) } {
                return Some(address);
            }
        }

        // 5. A group from the block allocator. A group recycled off the
        // partial list can arrive with no free location (its owner died
        // with it full); keep it in the bin and ask for another.
        let locations = ((T::GROUP_SIZE - T::HEADER_SIZE) / info.size as usize) as u32;
        let bin_addr = bin as *const Bin as usize;
        let thread = context.thread_id;

        for _ in 0..GROUPS_PER_BLOCK {
            let allocator = T::block_allocator(self, context.numa_node);
            let mut group = allocator
                .get_cached_group(info, locations, bin_addr, thread)
                .map_or(0, |p| p.as_ptr() as usize);

            #[cfg(feature = "numa")]
            if group == 0 {
                if let Some(borrowed) = self.borrow_peer_group::<T>(context.numa_node) {
                    let borrowed = borrowed.as_ptr() as usize;
                    // Safety: the peer handed the group over exclusively.
                    unsafe {
                        T::init_unused(borrowed, info.size, locations, thread);
                        T::set_parent_bin(borrowed, bin_addr);
                    }
                    group = borrowed;
                }
            }

            if group == 0 {
                group = allocator
                    .get_group_new_block(info, locations, bin_addr, thread)
                    .map_or(0, |p| p.as_ptr() as usize);
            }

            if group == 0 {
                return None; // out of memory
            }

            stats::GROUPS_OBTAINED.hit();
            // Safety: the group is exclusively ours; it becomes the active
            // group of this bin.
            unsafe { bin.groups().push_front(group as *mut ListNode) };
            if T::ALLOW_STEAL {
                context.set_stealable(info.bin, true);
                bin.can_steal.set(true);
                bin.stolen_locations.set(0);
            }

            // Safety: owned group.
            if let Some(address) = unsafe { T::get_location(group) } {
                return Some(address);
            }
        }

        None
    }

    /// First candidate group from another node's allocator.
    #[cfg(feature = "numa")]
    fn borrow_peer_group<T: Tier>(&self, local: u32) -> Option<NonNull<u8>> {
        if !topology().is_numa() {
            return None;
        }
        for node in 0..self.node_count {
            if node == local {
                continue;
            }
            if let Some(group) = T::block_allocator(self, node).try_get_group() {
                return Some(group);
            }
        }
        None
    }

    /// Rotates the old active group to the back and brings `group` to the
    /// front of the bin.
    fn make_group_active<T: Tier>(&self, bin: &Bin, group: usize) {
        // Safety: owner-thread bin access; both nodes are linked here.
        unsafe {
            let groups = bin.groups();
            let old_active = groups.pop_front();
            groups.push_back(old_active);
            if groups.first() as usize != group {
                groups.remove(group as *mut ListNode);
                groups.push_front(group as *mut ListNode);
            }
        }
    }

    // ------------------------------------------------------------------
    // Small/large tier deallocation
    // ------------------------------------------------------------------

    unsafe fn deallocate_tier<T: Tier>(&self, addr: usize, group: usize) {
        // Safety: the group header is live while any location is.
        unsafe {
            let bin_addr = T::parent_bin(group);

            if bin_addr != 0 && bin_addr != BIN_PENDING {
                if T::owner_thread(group) == self.thread_id() {
                    self.deallocate_owned::<T>(addr, group, bin_addr);
                } else {
                    self.deallocate_public::<T>(addr, group, bin_addr);
                }
                return;
            }

            // Orphan: the owner gave the group back while this location
            // was still out. The free goes through the public list; if it
            // was the last one, the group graduates from the partial list
            // to its block.
            let publics = T::return_public_location(group, addr);
            stats::PUBLIC_FREES.hit();
            if publics != 0 && bin_addr == 0 && T::may_be_full(group, publics) {
                let node = (*(T::parent_block(group) as *const BlockDescriptor)).numa_node;
                let class_bin = T::class_of(T::location_size(group)).bin;
                T::block_allocator(self, node).return_partial_group(
                    group,
                    PartialAction::Remove,
                    class_bin,
                    0,
                );
            }
        }
    }

    unsafe fn deallocate_owned<T: Tier>(&self, addr: usize, group: usize, bin_addr: usize) {
        // Safety: owner-thread access throughout; every `bin.groups()`
        // borrow is scoped to its statement.
        unsafe {
            T::return_private_location(group, addr);

            let bin = &*(bin_addr as *const Bin);

            if T::is_all_free(group) && bin.groups().count() > bin.return_allowed.get() - 1 {
                if let Some(context) = self.existing_context() {
                    self.return_unused_group::<T>(group, bin, context.as_ref());
                }
                return;
            }

            let first = bin.groups().first() as usize;
            if group == first {
                return;
            }

            if T::can_return_partial(bin)
                && T::should_return(group)
                && bin.groups().count() > bin.return_allowed.get() - 1
            {
                if let Some(context) = self.existing_context() {
                    self.return_partially_used_group::<T>(group, bin, context.as_ref());
                }
                return;
            }

            // Keep the group in second position so the second-group-empty
            // test in the allocation ladder stays meaningful (and the next
            // allocations of this class stay cache-warm).
            let second = (*(first as *mut ListNode)).next.ptr() as usize;
            if group != second {
                let groups = bin.groups();
                groups.remove(group as *mut ListNode);
                groups.insert_after(first as *mut ListNode, group as *mut ListNode);
            }
        }
    }

    /// Cross-thread free: CAS-push, and on the 0 -> 1 transition link the
    /// group into its owner bin's public chain — unless the owner returned
    /// the group in the meantime, in which case the orphan path takes over.
    unsafe fn deallocate_public<T: Tier>(&self, addr: usize, group: usize, bin_addr: usize) {
        // Safety: forwarded caller contract.
        unsafe {
            let publics = T::return_public_location(group, addr);
            stats::PUBLIC_FREES.hit();
            if publics != 1 {
                return;
            }

            let bin = &*(bin_addr as *const Bin);
            let guard = bin.public_lock.lock();
            if T::parent_bin(group) == bin_addr {
                if T::next_public(group) == NOT_QUEUED {
                    T::set_next_public(group, bin.public_group.load(Ordering::Relaxed));
                    bin.public_group.store(group, Ordering::Relaxed);
                }
                return;
            }
            guard.unlock();

            // The owner won the race and returned the group. If this free
            // completed it, move it from the partial list to its block.
            if T::parent_bin(group) == 0 && T::may_be_full(group, publics) {
                let node = (*(T::parent_block(group) as *const BlockDescriptor)).numa_node;
                let class_bin = T::class_of(T::location_size(group)).bin;
                T::block_allocator(self, node).return_partial_group(
                    group,
                    PartialAction::Remove,
                    class_bin,
                    0,
                );
            }
        }
    }

    /// Returns a completely free group to its block.
    unsafe fn return_unused_group<T: Tier>(&self, group: usize, bin: &Bin, context: &ThreadContext) {
        // Safety: owner-thread access; the group has no live locations, so
        // no foreign free can race this.
        unsafe {
            T::set_parent_bin(group, 0);
            bin.groups().remove(group as *mut ListNode);
            T::clear_steal_refs(context, group, bin.number);

            // The group may linger in the public chain from an earlier
            // merged batch of foreign frees.
            if T::next_public(group) != NOT_QUEUED {
                let _guard = bin.public_lock.lock();
                self.unlink_public_chain::<T>(bin, group);
            }

            let node = (*(T::parent_block(group) as *const BlockDescriptor)).numa_node;
            stats::GROUPS_RETURNED.hit();
            T::block_allocator(self, node).return_full_group(group);

            // The last spare group is surrendered only once per level.
            if bin.groups().count() == bin.return_allowed.get() - 1 {
                bin.return_allowed.set(bin.return_allowed.get() + 1);
            }
        }
    }

    /// Returns a mostly-free group to the block allocator's partial list
    /// so another thread can adopt it.
    unsafe fn return_partially_used_group<T: Tier>(
        &self,
        group: usize,
        bin: &Bin,
        context: &ThreadContext,
    ) {
        // Safety: owner-thread access.
        unsafe {
            bin.groups().remove(group as *mut ListNode);
            T::clear_steal_refs(context, group, bin.number);

            // Foreign frees may still be in flight: mark the handoff under
            // the public lock so they neither link the group into the
            // chain nor request list transitions before it is listed.
            let guard = bin.public_lock.lock();
            T::set_parent_bin(group, BIN_PENDING);
            self.unlink_public_chain::<T>(bin, group);
            guard.unlock();

            let node = (*(T::parent_block(group) as *const BlockDescriptor)).numa_node;
            let class_bin = T::class_of(T::location_size(group)).bin;
            stats::GROUPS_RETURNED.hit();
            T::block_allocator(self, node).return_partial_group(
                group,
                PartialAction::Add,
                class_bin,
                context.thread_id,
            );

            if bin.groups().count() == bin.return_allowed.get() - 1 {
                bin.return_allowed.set(bin.return_allowed.get() + 1);
            }
        }
    }

    /// Unlinks `group` from the bin's public chain (head or middle).
    /// Caller holds the bin's public lock.
    unsafe fn unlink_public_chain<T: Tier>(&self, bin: &Bin, group: usize) {
        // Safety: lock held per contract; chain entries are live groups.
        unsafe {
            if T::next_public(group) == NOT_QUEUED {
                return;
            }

            let head = bin.public_group.load(Ordering::Relaxed);
            if head == group {
                bin.public_group.store(T::next_public(group), Ordering::Relaxed);
            } else {
                let mut current = head;
                while current != 0 {
                    let next = T::next_public(current);
                    if next == group {
                        T::set_next_public(current, T::next_public(group));
                        break;
                    }
                    current = next;
                }
            }
            T::set_next_public(group, NOT_QUEUED);
        }
    }

    // ------------------------------------------------------------------
    // Huge tier
    // ------------------------------------------------------------------

    fn ensure_reaper(&self) {
        if let Some(global) = GLOBAL_INSTANCE.get() {
            if std::ptr::eq(global, self) {
                global.reaper.ensure_started(global);
            }
        }
    }

    fn allocate_huge(&self, size: usize) -> Option<NonNull<u8>> {
        self.ensure_reaper();

        let total = size + HUGE_HEADER_SIZE;
        let bucket = total.div_ceil(HUGE_GRANULARITY);
        let bin = &self.huge_bins[bucket];

        if let Some(header) = bin.stack.pop() {
            stats::HUGE_CACHE_HITS.hit();
            return NonNull::new(HugeHeader::to_client(header.as_ptr() as usize) as *mut u8);
        }

        // Round the mapping to the OS granularity and put the slack to
        // work: small requests seed the cache with siblings of the same
        // bucket, larger ones donate a group window to the small tier.
        let object_size = total.next_multiple_of(HUGE_GRANULARITY);
        let mapped_size = total.next_multiple_of(OS_GRANULARITY);
        let node = topology().current_node().min(self.node_count - 1);

        // Safety: FFI page mapping.
        let base = unsafe { PlatformPages::alloc_pages(mapped_size, OS_GRANULARITY, node) }
            .ok()?
            .as_ptr() as usize;
        stats::TOTAL_MAPPED.add(mapped_size);
        stats::HUGE_BYTES.add(mapped_size);

        let slack_start = base + object_size;
        let slack_end = base + mapped_size;

        // Safety: the mapping is exclusively ours until the client pointer
        // escapes.
        let carved = unsafe {
            if object_size <= HUGE_SPLIT_POSITION {
                self.carve_siblings(base, mapped_size, slack_start, slack_end, bucket as u32, object_size, node)
            } else {
                self.carve_trailing_block(base, mapped_size, slack_start, slack_end, bucket as u32, object_size, node)
            }
        };

        if !carved {
            // Slack too small to use; the location is its mapping's only
            // tenant.
            // Safety: exclusive fresh mapping.
            unsafe {
                HugeHeader::initialize(base as *mut HugeHeader, bucket as u32, mapped_size);
            }
        }

        NonNull::new(HugeHeader::to_client(base) as *mut u8)
    }

    /// Partitions the slack into cache entries of the same bucket. Every
    /// sibling (and the parent location itself) holds a reference on the
    /// parent; the mapping is released when the last one dies.
    #[allow(clippy::too_many_arguments)]
    unsafe fn carve_siblings(
        &self,
        base: usize,
        mapped_size: usize,
        slack_start: usize,
        slack_end: usize,
        bucket: u32,
        object_size: usize,
        node: u32,
    ) -> bool {
        let parent = base as *mut HugeHeader;
        let bin = &self.huge_bins[bucket as usize];
        let mut position = slack_start;
        let mut found = false;

        // Safety: the whole mapping is exclusively ours.
        unsafe {
            while position < slack_end {
                // Siblings sit on group boundaries so their headers are
                // recognizable by offset, like any huge location.
                position = position.next_multiple_of(SMALL_GROUP_SIZE);
                if position + object_size > slack_end {
                    break;
                }

                if !found {
                    found = true;
                    HugeHeader::initialize_linked(
                        parent,
                        bucket,
                        object_size as u32,
                        mapped_size,
                        parent as usize,
                        0,
                    );
                    // The parent location's own liveness reference.
                    (*parent).add_ref();
                }

                let sibling = position as *mut HugeHeader;
                HugeHeader::initialize_linked(
                    sibling,
                    bucket,
                    object_size as u32,
                    0,
                    parent as usize,
                    0,
                );
                (*parent).add_ref();

                match bin
                    .stack
                    .push(NonNull::new_unchecked(sibling), bin.cache_size())
                {
                    Ok(()) => {}
                    Err(_) => {
                        // Cache full: back out this sibling and offer the
                        // rest of the slack to the small tier instead.
                        (*parent).release();
                        self.attach_block_window(parent, position, slack_end, node);
                        break;
                    }
                }

                position += object_size;
            }
        }

        found
    }

    /// Initializes the parent and donates the 16 KB-aligned tail window to
    /// the small block allocator.
    #[allow(clippy::too_many_arguments)]
    unsafe fn carve_trailing_block(
        &self,
        base: usize,
        mapped_size: usize,
        slack_start: usize,
        slack_end: usize,
        bucket: u32,
        object_size: usize,
        node: u32,
    ) -> bool {
        let parent = base as *mut HugeHeader;
        // Safety: the whole mapping is exclusively ours.
        unsafe {
            HugeHeader::initialize_linked(
                parent,
                bucket,
                object_size as u32,
                mapped_size,
                parent as usize,
                0,
            );
            (*parent).add_ref(); // the location's own liveness reference
            self.attach_block_window(parent, slack_start, slack_end, node);
        }
        true
    }

    /// Offers `[start, end)` (rounded inward to group alignment) to the
    /// small tier as a carved block. A failed offer is not fatal — the
    /// slack just stays unused. No reference is taken for the window
    /// itself: each group checked out of it holds one, so the parent's own
    /// liveness reference covers the idle block (the last release routes
    /// through `remove_block`, which unregisters it).
    unsafe fn attach_block_window(
        &self,
        parent: *mut HugeHeader,
        start: usize,
        end: usize,
        node: u32,
    ) {
        let start = start.next_multiple_of(SMALL_GROUP_SIZE);
        if end < start + SMALL_GROUP_SIZE {
            return;
        }
        let groups = ((end - start) / SMALL_GROUP_SIZE).min(GROUPS_PER_BLOCK) as u32;
        let bitmap = if groups == 64 { u64::MAX } else { (1u64 << groups) - 1 };

        // Safety: parent is live; the window is exclusively ours.
        unsafe {
            if let Some(descriptor) = self.small_allocator(node).add_block(
                start,
                (*parent).address(),
                bitmap,
                groups,
                parent as usize,
            ) {
                (*parent).set_block(descriptor as usize);
            }
        }
    }

    unsafe fn free_huge(&self, addr: usize) {
        // Safety: addr is a live huge client pointer.
        unsafe {
            let header = HugeHeader::from_client(addr);
            let bin = &self.huge_bins[(*header).bin() as usize];

            match bin
                .stack
                .push(NonNull::new_unchecked(header), bin.cache_size())
            {
                Ok(()) => {}
                Err(rejected) => {
                    bin.note_rejected();
                    self.dispose_huge(rejected);
                }
            }
        }
    }

    /// Final disposal of a huge location that is not going back into the
    /// cache. Children unref their parent; the last reference releases the
    /// mapping (through the block allocator when a block was carved from
    /// it).
    unsafe fn dispose_huge(&self, header: NonNull<HugeHeader>) {
        // Safety: the header is live and exclusively ours.
        unsafe {
            let header = header.as_ref();
            let parent_addr = header.parent();

            if parent_addr == 0 {
                let (addr, size) = (header.address(), header.size());
                drop(PlatformPages::free_pages(
                    NonNull::new_unchecked(addr as *mut u8),
                    size,
                ));
                stats::TOTAL_MAPPED.sub(size);
                stats::HUGE_BYTES.sub(size);
                return;
            }

            let parent = &*(parent_addr as *const HugeHeader);
            if parent.release() {
                let block = parent.block();
                if block != 0 {
                    // The carved window's groups are all back (the block's
                    // standing reference was the last): route the release
                    // through the descriptor's owner.
                    let descriptor = block as *mut BlockDescriptor;
                    let node = (*descriptor).numa_node;
                    self.small_allocator(node).remove_block(descriptor);
                } else {
                    let (addr, size) = (parent.address(), parent.size());
                    drop(PlatformPages::free_pages(
                        NonNull::new_unchecked(addr as *mut u8),
                        size,
                    ));
                    stats::TOTAL_MAPPED.sub(size);
                    stats::HUGE_BYTES.sub(size);
                }
            }
        }
    }

    /// One reaper pass: evict half of every stale bucket (one entry
    /// minimum) and decay extended cache capacities.
    pub(crate) fn clean_huge_cache(&self) {
        let now = uptime_secs();

        for bucket in HUGE_FIRST_BIN..HUGE_BIN_SLOTS {
            let bin = &self.huge_bins[bucket];
            let count = bin.stack.count();
            if count == 0 {
                continue;
            }
            if now.saturating_sub(bin.stack.stamp()) <= bin.age_limit() {
                continue;
            }

            let evict = (count / 2).max(1);
            for _ in 0..evict {
                match bin.stack.pop() {
                    Some(header) => {
                        stats::HUGE_CACHE_EVICTIONS.hit();
                        // Safety: popped entries are exclusively ours.
                        unsafe { self.dispose_huge(header) };
                    }
                    None => break,
                }
            }
            bin.decay();
        }
    }

    // ------------------------------------------------------------------
    // OS pass-through
    // ------------------------------------------------------------------

    fn allocate_from_os(&self, size: usize) -> Option<NonNull<u8>> {
        let mapped_size = (size + OS_HEADER_SIZE).next_multiple_of(OS_GRANULARITY);
        let node = topology().current_node().min(self.node_count - 1);

        // Safety: FFI page mapping.
        let base = unsafe { PlatformPages::alloc_pages(mapped_size, OS_GRANULARITY, node) }
            .ok()?
            .as_ptr() as usize;

        stats::TOTAL_MAPPED.add(mapped_size);
        stats::OS_BYTES.add(mapped_size);

        // Safety: exclusive fresh mapping.
        unsafe {
            (base as *mut OsHeader).write(OsHeader {
                real_address: base,
                mapped_size,
            });
        }
        NonNull::new((base + OS_HEADER_SIZE) as *mut u8)
    }

    unsafe fn deallocate_os(&self, addr: usize) {
        // Safety: addr is a live OS-tier client pointer.
        unsafe {
            let header = &*((addr - OS_HEADER_SIZE) as *const OsHeader);
            let (real, size) = (header.real_address, header.mapped_size);
            drop(PlatformPages::free_pages(
                NonNull::new_unchecked(real as *mut u8),
                size,
            ));
            stats::TOTAL_MAPPED.sub(size);
            stats::OS_BYTES.sub(size);
        }
    }

    // ------------------------------------------------------------------
    // Introspection for realloc
    // ------------------------------------------------------------------

    /// Bytes usable at `addr` (its class or span size).
    ///
    /// # Safety
    /// `addr` must be a live allocation of this engine.
    unsafe fn usable_size(&self, addr: usize) -> usize {
        let aligned = addr & !(SMALL_GROUP_SIZE - 1);
        let offset = addr - aligned;

        // Safety: live allocations guarantee the headers read below.
        unsafe {
            if offset <= OS_HEADER_SIZE {
                let header = &*((addr - OS_HEADER_SIZE) as *const OsHeader);
                return header.mapped_size - OS_HEADER_SIZE;
            }
            if offset <= HUGE_HEADER_SIZE {
                let header = &*HugeHeader::from_client(addr);
                return header.span() - HUGE_HEADER_SIZE;
            }

            let marker = &*(aligned as *const ListNode);
            if marker.next.is_large_tier() {
                let group = aligned - marker.next.subgroup() as usize * SMALL_GROUP_SIZE;
                return LargeTier::location_size(group);
            }

            let group = aligned;
            let class = SmallTier::location_size(group);
            if (addr - group - SMALL_GROUP_HEADER_SIZE) % class != 0 {
                // Inside a stolen range: the slot is smaller than the
                // victim class.
                return SmallTier::stolen_slot_size(group, addr);
            }
            class
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.reaper.shutdown();

        // Flush the huge caches while the block allocators (which own the
        // carved-window descriptors) are still alive.
        for bin in &self.huge_bins {
            while let Some(header) = bin.stack.pop() {
                // Safety: popped entries are exclusively ours.
                unsafe { self.dispose_huge(header) };
            }
        }

        for node in 0..self.node_count as usize {
            let small = self.small_nodes[node].swap(0, Ordering::AcqRel);
            if small != 0 {
                // Safety: initialized in new(); nobody uses the engine
                // during drop.
                unsafe {
                    std::ptr::drop_in_place(small as *mut BlockAllocator<SmallTier>);
                    self.allocator_pool.put(NonNull::new_unchecked(small as *mut u8));
                }
            }
            let large = self.large_nodes[node].swap(0, Ordering::AcqRel);
            if large != 0 {
                // Safety: as above.
                unsafe {
                    std::ptr::drop_in_place(large as *mut BlockAllocator<LargeTier>);
                    self.allocator_pool.put(NonNull::new_unchecked(large as *mut u8));
                }
            }
        }
    }
}

#[cold]
fn out_of_records() -> PageError {
    PageError::InitializationFailed("metadata pool exhausted during engine construction".into())
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

/// Zero-sized handle to the process-wide engine, usable as
/// `#[global_allocator]`.
///
/// Alignments up to 16 map onto the size classes; anything larger takes a
/// dedicated page mapping (sized deallocation makes the route recoverable
/// without headers).
pub struct GlobalAllocator;

impl GlobalAllocator {
    /// The process-wide engine, constructed on first use.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot be constructed (the page source or the
    /// metadata pools failed), in which case no allocation can succeed
    /// anyway.
    pub fn get() -> &'static Allocator {
        GLOBAL_INSTANCE.get_or_init(|| Allocator::new().expect("allocator engine init failed"))
    }
}

impl Allocator {
    /// Class walk honoring a layout alignment (8 or 16): the class size
    /// itself must be a multiple of the alignment, otherwise locations of
    /// odd-stride classes land off-boundary.
    fn allocate_layout(&self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align <= 16);

        let address = if size <= MAX_SMALL_SIZE {
            let mut info = small_class(size);
            while info.size as usize % align != 0 {
                let bin = info.bin as usize + 1;
                info = ClassInfo {
                    size: super::size_class::SMALL_BIN_SIZE[bin] as u32,
                    bin: bin as u32,
                };
            }
            self.allocate_tier::<SmallTier>(info)
        } else if size <= MAX_LARGE_SIZE {
            let mut info = large_class(size);
            if info.size as usize % align != 0 {
                // Only the 5397 class has an unaligned stride.
                info = large_class(MAX_LARGE_SIZE);
            }
            self.allocate_tier::<LargeTier>(info)
        } else if size <= MAX_HUGE_SIZE {
            self.allocate_huge(size)
        } else {
            self.allocate_from_os(size)
        };
        address.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }
}

// Safety: implementation follows the GlobalAlloc contract; every path
// routes through the engine's tier logic.
unsafe impl std::alloc::GlobalAlloc for GlobalAllocator {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        let engine = GlobalAllocator::get();
        if layout.size() == 0 {
            return layout.align() as *mut u8; // dangling, aligned
        }
        if layout.align() > 16 {
            let mapped = layout.size().next_multiple_of(OS_GRANULARITY);
            let align = layout.align().max(OS_GRANULARITY);
            // Safety: FFI page mapping.
            return match unsafe { PlatformPages::alloc_pages(mapped, align, 0) } {
                Ok(pages) => {
                    stats::TOTAL_MAPPED.add(mapped);
                    stats::OS_BYTES.add(mapped);
                    pages.as_ptr()
                }
                Err(_) => std::ptr::null_mut(),
            };
        }
        engine.allocate_layout(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        if layout.size() == 0 || ptr.is_null() {
            return;
        }
        if layout.align() > 16 {
            let mapped = layout.size().next_multiple_of(OS_GRANULARITY);
            // Safety: allocated in alloc() with exactly this size.
            unsafe {
                drop(PlatformPages::free_pages(NonNull::new_unchecked(ptr), mapped));
            }
            stats::TOTAL_MAPPED.sub(mapped);
            stats::OS_BYTES.sub(mapped);
            return;
        }
        // Safety: forwarded GlobalAlloc contract.
        unsafe { GlobalAllocator::get().deallocate(ptr) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: std::alloc::Layout, new_size: usize) -> *mut u8 {
        if layout.align() > 16 || layout.size() == 0 || new_size == 0 {
            // Uncommon shapes take the default alloc+copy+dealloc route.
            // Safety: forwarded GlobalAlloc contract.
            unsafe {
                let new_layout =
                    std::alloc::Layout::from_size_align_unchecked(new_size, layout.align());
                let fresh = std::alloc::GlobalAlloc::alloc(self, new_layout);
                if !fresh.is_null() && layout.size() != 0 {
                    std::ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
                    std::alloc::GlobalAlloc::dealloc(self, ptr, layout);
                }
                return fresh;
            }
        }
        // Safety: forwarded GlobalAlloc contract.
        unsafe { GlobalAllocator::get().reallocate(ptr, new_size) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_roundtrip_small() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        let a = engine.allocate(24);
        let b = engine.allocate(24);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);

        // Safety: test code.
        unsafe {
            a.write_bytes(0xAA, 24);
            b.write_bytes(0xBB, 24);
            assert_eq!(a.read(), 0xAA);
            assert_eq!(b.read(), 0xBB);
            engine.deallocate(a);
            engine.deallocate(b);
        }
        engine.release_thread_context();
    }

    #[test]
    fn test_deallocate_null_is_noop() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();
        // Safety: null is explicitly allowed.
        unsafe { engine.deallocate(std::ptr::null_mut()) };
    }

    #[test]
    fn test_tier_routing_by_boundary_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        // (size, expected offset class) — offsets within the 16 KB mask
        // identify the tier: 16 = OS header, 64 = huge header, >= 192 is a
        // group location.
        let cases: &[(usize, &str)] = &[
            (0, "small"),
            (1, "small"),
            (8, "small"),
            (9, "small"),
            (64, "small"),
            (65, "small"),
            (895, "small"),
            (896, "small"),
            (897, "small"),
            (2688, "small"),
            (2689, "large"),
            (8128, "large"),
            (8129, "huge"),
            (1_048_512, "huge"),
            (1_048_513, "os"),
            (2_000_000, "os"),
        ];

        for &(size, expected) in cases {
            let ptr = engine.allocate(size);
            assert!(!ptr.is_null(), "size {size}");
            let offset = ptr as usize & (SMALL_GROUP_SIZE - 1);
            let tier = if offset == OS_HEADER_SIZE {
                "os"
            } else if offset == HUGE_HEADER_SIZE {
                "huge"
            } else {
                // Safety: group headers are live.
                let aligned = ptr as usize & !(SMALL_GROUP_SIZE - 1);
                if unsafe { (*(aligned as *const ListNode)).next.is_large_tier() } {
                    "large"
                } else {
                    "small"
                }
            };
            assert_eq!(tier, expected, "size {size} routed to the wrong tier");
            // Safety: test code.
            unsafe { engine.deallocate(ptr) };
        }
        engine.release_thread_context();
        engine.shutdown_reaper();
    }

    #[test]
    fn test_alignment_of_classes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        // Classes that are multiples of 16 must hand out 16-aligned
        // locations; huge and OS tiers always align to 16.
        for &(size, align) in
            &[(16usize, 16usize), (64, 16), (512, 16), (2688, 16), (100_000, 16), (2_000_000, 16)]
        {
            let ptr = engine.allocate(size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0, "size {size} misaligned");
            // Safety: test code.
            unsafe { engine.deallocate(ptr) };
        }
        engine.release_thread_context();
        engine.shutdown_reaper();
    }

    #[test]
    fn test_free_reuses_location() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        let a = engine.allocate(48);
        // Safety: test code.
        unsafe { engine.deallocate(a) };
        let b = engine.allocate(48);
        assert_eq!(a, b, "freed location must be served before new ones");
        // Safety: test code.
        unsafe { engine.deallocate(b) };
        engine.release_thread_context();
    }

    #[test]
    fn test_huge_cache_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        let a = engine.allocate(60_000);
        assert!(!a.is_null());
        // Safety: test code.
        unsafe {
            a.write(0xEE);
            engine.deallocate(a);
        }
        let b = engine.allocate(60_000);
        assert_eq!(a, b, "huge location must come back from the bucket cache");
        // Safety: test code.
        unsafe { engine.deallocate(b) };
        engine.release_thread_context();
        engine.shutdown_reaper();
    }

    #[test]
    fn test_huge_sibling_carving() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        // A 17 KB request maps 2 x 16 KB... rounded to 64 KB: the slack
        // carves at least one sibling into the same bucket, so a second
        // allocation of the same size is a cache hit inside the same
        // mapping.
        let a = engine.allocate(17_000);
        assert!(!a.is_null());
        let b = engine.allocate(17_000);
        assert!(!b.is_null());
        let same_mapping = (a as usize & !(OS_GRANULARITY - 1))
            == (b as usize & !(OS_GRANULARITY - 1));
        assert!(same_mapping, "second allocation should reuse carved slack");

        // Safety: test code.
        unsafe {
            engine.deallocate(a);
            engine.deallocate(b);
        }
        engine.release_thread_context();
        engine.shutdown_reaper();
    }

    #[test]
    fn test_reallocate_grows_and_preserves() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        let a = engine.allocate(100);
        // Safety: test code.
        unsafe {
            for i in 0..100 {
                a.add(i).write(i as u8);
            }
            let b = engine.reallocate(a, 5000);
            assert!(!b.is_null());
            for i in 0..100 {
                assert_eq!(b.add(i).read(), i as u8, "realloc lost byte {i}");
            }
            let c = engine.reallocate(b, 50); // shrink stays in place
            assert_eq!(b, c);
            engine.deallocate(c);
        }
        engine.release_thread_context();
    }

    #[test]
    fn test_cross_thread_free() {
        // Write lock: the test asserts on process-wide counters.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        use crate::sync::Arc;
        use crate::sync::thread;

        let engine = Arc::new(Allocator::new().unwrap());

        // Fill one 128-byte group exactly so the owner has neither bump
        // space nor private entries left.
        let capacity = (SMALL_GROUP_SIZE - SMALL_GROUP_HEADER_SIZE) / 128;
        let mut ptrs = Vec::new();
        for _ in 0..capacity {
            let p = engine.allocate(128) as usize;
            assert!(p != 0);
            ptrs.push(p);
        }

        let remote = engine.clone();
        let moved = ptrs.split_off(capacity / 2);
        let moved_count = moved.len();
        thread::spawn(move || {
            for p in moved {
                // Safety: test code; pointers are live.
                unsafe { remote.deallocate(p as *mut u8) };
            }
        })
        .join()
        .unwrap();

        // The owner must reuse the foreign frees before mapping new groups.
        let before = MemoryStats::snapshot().groups_obtained;
        for _ in 0..moved_count {
            assert!(!engine.allocate(128).is_null());
        }
        let after = MemoryStats::snapshot().groups_obtained;
        assert_eq!(before, after, "foreign frees were not privatized");

        for p in ptrs {
            // Safety: test code.
            unsafe { engine.deallocate(p as *mut u8) };
        }
        engine.release_thread_context();
    }

    #[test]
    fn test_global_allocator_layouts() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        use std::alloc::{GlobalAlloc, Layout};

        let g = GlobalAllocator;
        for &(size, align) in &[(1usize, 1usize), (24, 8), (100, 16), (5000, 8), (5000, 16)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            // Safety: test code.
            unsafe {
                let p = g.alloc(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0, "{size}/{align} misaligned");
                p.write_bytes(0x5A, size);
                g.dealloc(p, layout);
            }
        }

        // Zero-sized: dangling aligned pointer, no dealloc effect.
        let layout = Layout::from_size_align(0, 8).unwrap();
        // Safety: test code.
        unsafe {
            let p = g.alloc(layout);
            assert_eq!(p as usize, 8);
            g.dealloc(p, layout);
        }
        GlobalAllocator::get().release_thread_context();
    }

    #[test]
    fn test_global_allocator_over_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        use std::alloc::{GlobalAlloc, Layout};

        let g = GlobalAllocator;
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        // Safety: test code.
        unsafe {
            let p = g.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 4096, 0);
            p.write_bytes(0x7E, 4096);
            g.dealloc(p, layout);
        }
    }

    #[test]
    fn test_unused_groups_return_to_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let engine = Allocator::new().unwrap();

        // Fill several groups of one class, then free everything: the
        // spare groups must flow back to the block allocator.
        let mut ptrs = Vec::new();
        for _ in 0..1000 {
            let p = engine.allocate(64);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        for p in ptrs {
            // Safety: test code.
            unsafe { engine.deallocate(p) };
        }
        engine.release_thread_context();

        let small = engine.small_allocator(0);
        assert_eq!(
            small.empty_block_count(),
            0,
            "all groups returned, no block should be fully checked out"
        );
        assert!(small.full_block_count() >= 1);
    }
}
