//! Huge-tier bookkeeping: the 64-byte location header, the per-bucket
//! cache of freed locations, and the generation-tagged lock-free stack the
//! cache is built on.
//!
//! Buckets are 4 KB-granular. Each keeps a bounded LIFO of freed locations
//! so a hot size never pays the page-mapping round trip twice in a row; a
//! bucket's capacity is inverse-proportional to the location size and grows
//! under sustained demand (the reaper shrinks it back).

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU128, AtomicUsize, Ordering};
use crate::sync::hint;

use super::size_class::HUGE_HEADER_SIZE;

/// Seconds since the engine first asked for the time. Used only for cache
/// aging; wrap-around after 136 years is not this crate's problem.
pub(crate) fn uptime_secs() -> u32 {
    use crate::sync::OnceLock;
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    EPOCH.get_or_init(std::time::Instant::now).elapsed().as_secs() as u32
}

/// Header at the front of every huge-tier OS allocation. The client sees
/// `base + 64`; `base` is always 16 KB-aligned so the deallocation path can
/// classify the pointer by its offset from the group mask.
#[repr(C)]
pub(crate) struct HugeHeader {
    /// Cache-stack link.
    next: AtomicUsize,
    /// Base of the OS mapping this location lives in.
    address: usize,
    /// Full mapped size; meaningful on parents (headers that own the
    /// mapping).
    size: usize,
    /// User-visible extent of this location, header included.
    span: u32,
    /// Bucket index.
    bin: u32,
    /// Owning parent header (self for parents), or 0 when the location is
    /// its mapping's only tenant.
    parent: AtomicUsize,
    /// Block descriptor carved from the trailing window, or 0.
    block: AtomicUsize,
    /// Live carved children plus carved block descriptors, plus one for
    /// the parent location itself while it is live.
    refs: AtomicU32,
    _pad: [u8; HUGE_HEADER_SIZE - 5 * 8 - 3 * 4],
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<HugeHeader>() == HUGE_HEADER_SIZE);

impl HugeHeader {
    #[inline]
    pub fn from_client(addr: usize) -> *mut HugeHeader {
        (addr - HUGE_HEADER_SIZE) as *mut HugeHeader
    }

    #[inline]
    pub fn to_client(base: usize) -> usize {
        base + HUGE_HEADER_SIZE
    }

    /// Initializes a standalone location: sole tenant of its mapping.
    ///
    /// # Safety
    /// `this` must point at the (exclusively held) mapping base.
    pub unsafe fn initialize(this: *mut HugeHeader, bin: u32, size: usize) {
        // Safety: exclusive access per the caller contract.
        unsafe {
            this.write(HugeHeader {
                next: AtomicUsize::new(0),
                address: this as usize,
                size,
                span: size as u32,
                bin,
                parent: AtomicUsize::new(0),
                block: AtomicUsize::new(0),
                refs: AtomicU32::new(0),
                _pad: [0; HUGE_HEADER_SIZE - 5 * 8 - 3 * 4],
            });
        }
    }

    /// Initializes a location that shares its mapping: a parent (pass
    /// `parent == this`) or a carved sibling.
    ///
    /// # Safety
    /// Same as [`initialize`](Self::initialize); `parent` must be the
    /// mapping's parent header.
    pub unsafe fn initialize_linked(
        this: *mut HugeHeader,
        bin: u32,
        span: u32,
        mapped_size: usize,
        parent: usize,
        block: usize,
    ) {
        // Safety: exclusive access per the caller contract.
        unsafe {
            this.write(HugeHeader {
                next: AtomicUsize::new(0),
                address: this as usize,
                size: mapped_size,
                span,
                bin,
                parent: AtomicUsize::new(parent),
                block: AtomicUsize::new(block),
                refs: AtomicU32::new(0),
                _pad: [0; HUGE_HEADER_SIZE - 5 * 8 - 3 * 4],
            });
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.span as usize
    }

    #[inline]
    pub fn bin(&self) -> u32 {
        self.bin
    }

    #[inline]
    pub fn parent(&self) -> usize {
        self.parent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn block(&self) -> usize {
        self.block.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_block(&self, block: usize) {
        self.block.store(block, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; true when it was the last.
    #[inline]
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// 128-bit tagged head for the ABA-safe cache stack.
///
/// ```text
///   bits [127:64]  generation counter
///   bits [63:0]    header pointer (full virtual address)
/// ```
///
/// The generation increments by two on every successful push or pop, so a
/// node that is popped, reused and pushed back at the same address cannot
/// satisfy a stale CAS. An odd generation marks the head as reserved by an
/// in-flight pop that is still reading the node's link; both push and pop
/// wait out odd generations before operating.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedHead(u128);

impl TaggedHead {
    #[inline]
    fn new(ptr: usize, generation: u64) -> Self {
        Self((u128::from(generation) << 64) | ptr as u128)
    }

    #[inline]
    fn ptr(self) -> usize {
        self.0 as u64 as usize
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

/// RAII rollback for a pop reservation: if the critical section unwinds,
/// the head is restored with an even generation so other threads stop
/// spinning on the reservation.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedHead,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let restored = TaggedHead::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// Bounded lock-free LIFO of freed huge locations.
pub(crate) struct TaggedStack {
    head: AtomicU128,
    count: AtomicU32,
    /// Uptime seconds of the last push or pop; the reaper treats a bucket
    /// untouched for longer than its age limit as stale.
    stamp: AtomicU32,
}

impl TaggedStack {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            head: AtomicU128::new(0),
            count: AtomicU32::new(0),
            stamp: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            head: AtomicU128::new(0),
            count: AtomicU32::new(0),
            stamp: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stamp(&self) -> u32 {
        self.stamp.load(Ordering::Relaxed)
    }

    /// Pushes unless the stack already holds `limit` entries; on rejection
    /// the node is handed back for disposal.
    pub fn push(
        &self,
        node: NonNull<HugeHeader>,
        limit: u32,
    ) -> Result<(), NonNull<HugeHeader>> {
        // Optimistic reservation; strict consistency of the count is not
        // required, it only bounds the cache approximately.
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        if previous >= limit {
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Err(node);
        }

        let node_addr = node.as_ptr() as usize;
        loop {
            let old = TaggedHead(self.head.load(Ordering::Acquire));

            if !old.generation().is_multiple_of(2) {
                // A pop holds the reservation; wait for it to settle.
                hint::spin_loop();
                continue;
            }

            // Safety: the node is exclusively ours until the CAS publishes.
            unsafe {
                (*node.as_ptr()).next.store(old.ptr(), Ordering::Relaxed);
            }

            let new = TaggedHead::new(node_addr, old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.stamp.store(uptime_secs(), Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    pub fn pop(&self) -> Option<NonNull<HugeHeader>> {
        loop {
            let old = TaggedHead(self.head.load(Ordering::Acquire));
            if old.ptr() == 0 {
                return None;
            }

            if !old.generation().is_multiple_of(2) {
                hint::spin_loop();
                continue;
            }

            // Reserve (even -> odd) to pin the node while its link is read.
            let reserved = TaggedHead::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, reserved.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Safety: the reservation pins the node.
            let next = unsafe { (*(old.ptr() as *const HugeHeader)).next.load(Ordering::Relaxed) };

            // Commit (odd -> even) with the successor as the new head.
            let successor = TaggedHead::new(next, old.generation().wrapping_add(2));
            let committed = self
                .head
                .compare_exchange(reserved.0, successor.0, Ordering::Release, Ordering::Relaxed);
            debug_assert!(committed.is_ok(), "stack reservation broken");
            guard.committed = true;

            self.count.fetch_sub(1, Ordering::Relaxed);
            self.stamp.store(uptime_secs(), Ordering::Relaxed);
            return NonNull::new(old.ptr() as *mut HugeHeader);
        }
    }
}

// Safety: the stack is CAS-only plus two relaxed counters.
unsafe impl Send for TaggedStack {}
// Safety: see Send.
unsafe impl Sync for TaggedStack {}

/// Per-bucket cache with adaptive capacity.
pub(crate) struct HugeBin {
    pub stack: TaggedStack,
    cache_size: AtomicU32,
    base_size: u32,
    extended_max: u32,
    age_limit: u32,
    full_hits: AtomicU32,
}

impl HugeBin {
    pub fn new(bucket: u32) -> Self {
        let (base_size, age_limit) = cache_curve(bucket);
        Self {
            stack: TaggedStack::new(),
            cache_size: AtomicU32::new(base_size),
            base_size,
            extended_max: base_size * 8,
            age_limit,
            full_hits: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn cache_size(&self) -> u32 {
        self.cache_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn age_limit(&self) -> u32 {
        self.age_limit
    }

    /// Called when a push was rejected for capacity: every 4th rejection
    /// grows the cache by one, up to eight times the configured base.
    pub fn note_rejected(&self) {
        if (self.full_hits.fetch_add(1, Ordering::Relaxed) + 1).is_multiple_of(4) {
            let current = self.cache_size.load(Ordering::Relaxed);
            if current < self.extended_max {
                self.cache_size.store(current + 1, Ordering::Relaxed);
            }
        }
    }

    /// Reaper-side decay: halve the distance back toward the base size.
    pub fn decay(&self) {
        let current = self.cache_size.load(Ordering::Relaxed);
        if current > self.base_size {
            self.cache_size
                .store((current + self.base_size) / 2, Ordering::Relaxed);
        }
    }
}

/// Capacity and age limit per bucket. Small buckets (hot sizes) cache up
/// to 32 entries and keep them for eight minutes; capacity and patience
/// decay monotonically to one entry / 30 seconds for the megabyte-class
/// buckets.
fn cache_curve(bucket: u32) -> (u32, u32) {
    let bucket = bucket.max(1);
    let size = (96 / bucket).clamp(1, 32);
    let age = (1440 / bucket).clamp(30, 480);
    (size, age)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::alloc::Layout;

    fn header_box() -> (*mut HugeHeader, Layout) {
        let layout = Layout::from_size_align(HUGE_HEADER_SIZE, 64).unwrap();
        // Safety: test code.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<HugeHeader>();
        assert!(!raw.is_null());
        // Safety: fresh exclusive allocation.
        unsafe { HugeHeader::initialize(raw, 5, 4096) };
        (raw, layout)
    }

    #[test]
    fn test_header_client_roundtrip() {
        let (h, layout) = header_box();
        let client = HugeHeader::to_client(h as usize);
        assert_eq!(HugeHeader::from_client(client), h);
        // Safety: test code.
        unsafe { std::alloc::dealloc(h.cast(), layout) };
    }

    #[test]
    fn test_refcount_lifecycle() {
        let (h, layout) = header_box();
        // Safety: initialized above.
        let header = unsafe { &*h };

        header.add_ref();
        header.add_ref();
        assert!(!header.release());
        assert!(header.release());

        // Safety: test code.
        unsafe { std::alloc::dealloc(h.cast(), layout) };
    }

    #[test]
    fn test_stack_lifo_and_limit() {
        let stack = TaggedStack::new();
        let (a, la) = header_box();
        let (b, lb) = header_box();
        let (c, lc) = header_box();

        let nn = |p: *mut HugeHeader| NonNull::new(p).unwrap();

        assert!(stack.push(nn(a), 2).is_ok());
        assert!(stack.push(nn(b), 2).is_ok());
        assert_eq!(stack.count(), 2);

        // Third push exceeds the limit and hands the node back.
        assert_eq!(stack.push(nn(c), 2).unwrap_err().as_ptr(), c);

        assert_eq!(stack.pop().unwrap().as_ptr(), b);
        assert_eq!(stack.pop().unwrap().as_ptr(), a);
        assert!(stack.pop().is_none());
        assert_eq!(stack.count(), 0);

        // Safety: test code.
        unsafe {
            std::alloc::dealloc(a.cast(), la);
            std::alloc::dealloc(b.cast(), lb);
            std::alloc::dealloc(c.cast(), lc);
        }
    }

    #[test]
    fn test_stack_concurrent_push_pop() {
        use crate::sync::Arc;
        use crate::sync::thread;

        let stack = Arc::new(TaggedStack::new());
        let mut headers = Vec::new();
        for _ in 0..64 {
            headers.push(header_box());
        }

        let addresses: Vec<usize> = headers.iter().map(|(p, _)| *p as usize).collect();
        let mut handles = Vec::new();
        for chunk in addresses.chunks(16) {
            let s = stack.clone();
            let chunk = chunk.to_vec();
            handles.push(thread::spawn(move || {
                for addr in chunk {
                    let node = NonNull::new(addr as *mut HugeHeader).unwrap();
                    assert!(s.push(node, 1024).is_ok());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stack.count(), 64);

        let mut popped = Vec::new();
        while let Some(p) = stack.pop() {
            popped.push(p.as_ptr() as usize);
        }
        popped.sort_unstable();
        let mut expected = addresses.clone();
        expected.sort_unstable();
        assert_eq!(popped, expected, "push/pop lost or duplicated a node");

        for (p, l) in headers {
            // Safety: test code.
            unsafe { std::alloc::dealloc(p.cast(), l) };
        }
    }

    #[test]
    fn test_adaptive_growth_and_decay() {
        let bin = HugeBin::new(16);
        let base = bin.cache_size();
        assert_eq!(base, 6); // 96 / 16

        // Three rejections: no growth yet; the fourth grows by one.
        bin.note_rejected();
        bin.note_rejected();
        bin.note_rejected();
        assert_eq!(bin.cache_size(), base);
        bin.note_rejected();
        assert_eq!(bin.cache_size(), base + 1);

        // Growth saturates at 8x base.
        for _ in 0..1000 {
            bin.note_rejected();
        }
        assert_eq!(bin.cache_size(), base * 8);

        // Decay halves back toward the base.
        bin.decay();
        assert_eq!(bin.cache_size(), (base * 8 + base) / 2);
        for _ in 0..16 {
            bin.decay();
        }
        assert_eq!(bin.cache_size(), base);
    }

    #[test]
    fn test_cache_curve_monotone() {
        let mut last_size = u32::MAX;
        let mut last_age = u32::MAX;
        for bucket in 3..=256 {
            let (size, age) = cache_curve(bucket);
            assert!(size <= last_size && (1..=32).contains(&size), "bucket {bucket}");
            assert!(age <= last_age && (30..=480).contains(&age), "bucket {bucket}");
            last_size = size;
            last_age = age;
        }
    }
}
