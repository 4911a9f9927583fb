use std::fmt;
use std::ptr::NonNull;

#[cfg(any(target_os = "windows", loom, miri, test))]
use super::size_class::OS_GRANULARITY;
#[cfg(feature = "numa")]
use super::size_class::MAX_NUMA_NODES;

#[derive(Debug)]
pub enum PageError {
    MapFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            PageError::ReleaseFailed(e) => write!(f, "page release failed: {e}"),
            PageError::InitializationFailed(msg) => {
                write!(f, "page source initialization failed: {msg}")
            }
        }
    }
}

impl std::error::Error for PageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PageError::MapFailed(e) | PageError::ReleaseFailed(e) => Some(e),
            PageError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for committed page allocation.
///
/// Unlike a reserve/commit split, every mapping returned here is immediately
/// readable and writable: the engine hands whole 16 KB groups and 1 MB
/// blocks to threads and commits them up front to avoid a fault storm on
/// first touch.
pub(crate) trait PageOps {
    /// Map `size` bytes of committed, zero-initialized memory whose base is
    /// aligned to `align` (a power of two, at least the page size). `node`
    /// is the preferred NUMA node; it is advisory.
    unsafe fn alloc_pages(size: usize, align: usize, node: u32) -> Result<NonNull<u8>, PageError>;

    /// Unmap a region previously returned by [`alloc_pages`](Self::alloc_pages).
    /// `size` must be the exact size passed at allocation.
    unsafe fn free_pages(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformPages;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageError, PageOps, PlatformPages};
    use std::io;

    /// mmap never guarantees more than page alignment, so over-map by
    /// `align` and trim the misaligned head and the tail back to the OS.
    /// The trimmed pieces are released immediately; the surviving window is
    /// exactly `size` bytes at an `align` boundary and can be unmapped on
    /// its own later.
    ///
    /// Sub-page sizes and alignments are legal (the descriptor-pool slabs
    /// are 4 KB while macOS pages are 16 KB): both round up to the page,
    /// and munmap rounds the same way on free.
    unsafe fn map_aligned(size: usize, align: usize) -> Result<NonNull<u8>, PageError> {
        let page = PlatformPages::page_size();
        debug_assert!(align.is_power_of_two());
        let align = align.max(page);
        let size = size.next_multiple_of(page);

        let over = size + align - page;

        // Safety: FFI call to mmap.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                over,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(PageError::MapFailed(io::Error::last_os_error()));
        }

        let raw_addr = raw as usize;
        let aligned = (raw_addr + align - 1) & !(align - 1);
        let head = aligned - raw_addr;
        let tail = over - head - size;

        // Safety: the head/tail sub-ranges are within the fresh mapping and
        // are page-aligned by construction.
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, tail);
            }
        }

        // Safety: aligned is non-zero (mmap succeeded).
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    impl PageOps for PlatformPages {
        unsafe fn alloc_pages(
            size: usize,
            align: usize,
            _node: u32,
        ) -> Result<NonNull<u8>, PageError> {
            // Safety: forwarded preconditions.
            let ptr = unsafe { map_aligned(size, align)? };

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise. Blocks and groups are handed to
            // threads right after mapping; ask for immediate physical
            // backing to avoid a minor-fault storm on the bump path.
            unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED);
            }

            #[cfg(feature = "numa")]
            if super::topology().is_numa() {
                // First-touch placement: walk the pages so they are
                // committed on the requesting thread's node. `_node` is the
                // caller's node by construction (contexts allocate on their
                // own node), so touching from this thread is enough.
                let page = Self::page_size();
                let mut position = ptr.as_ptr();
                // Safety: position stays within the fresh mapping.
                unsafe {
                    let end = ptr.as_ptr().add(size);
                    while position < end {
                        position.cast::<u8>().write_volatile(0);
                        position = position.add(page);
                    }
                }
            }

            Ok(ptr)
        }

        unsafe fn free_pages(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(PageError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; the
                // page size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::*;
    use std::io;

    impl PageOps for PlatformPages {
        unsafe fn alloc_pages(
            size: usize,
            align: usize,
            _node: u32,
        ) -> Result<NonNull<u8>, PageError> {
            // VirtualAlloc reservations are 64 KB-aligned, which covers
            // every alignment the engine requests. Larger alignments use
            // the probe-and-retry idiom: take a throwaway reservation to
            // learn a suitable address, release it, and re-reserve at the
            // aligned address inside it.
            if align <= OS_GRANULARITY {
                // Safety: FFI call to VirtualAlloc.
                let ptr = unsafe {
                    libc::VirtualAlloc(
                        std::ptr::null_mut(),
                        size,
                        libc::MEM_RESERVE | libc::MEM_COMMIT,
                        libc::PAGE_READWRITE,
                    )
                };
                return match NonNull::new(ptr.cast::<u8>()) {
                    Some(p) => Ok(p),
                    None => Err(PageError::MapFailed(io::Error::last_os_error())),
                };
            }

            for _ in 0..16 {
                // Safety: FFI call to VirtualAlloc (probe reservation).
                let probe = unsafe {
                    libc::VirtualAlloc(
                        std::ptr::null_mut(),
                        size + align,
                        libc::MEM_RESERVE,
                        libc::PAGE_NOACCESS,
                    )
                };
                if probe.is_null() {
                    return Err(PageError::MapFailed(io::Error::last_os_error()));
                }

                let aligned = ((probe as usize) + align - 1) & !(align - 1);
                // Safety: FFI call to VirtualFree; probe is a reservation base.
                unsafe {
                    libc::VirtualFree(probe, 0, libc::MEM_RELEASE);
                }

                // Safety: FFI call to VirtualAlloc at the computed address.
                // Another thread may take the window between the release and
                // this call; retry on failure.
                let ptr = unsafe {
                    libc::VirtualAlloc(
                        aligned as *mut libc::c_void,
                        size,
                        libc::MEM_RESERVE | libc::MEM_COMMIT,
                        libc::PAGE_READWRITE,
                    )
                };
                if let Some(p) = NonNull::new(ptr.cast::<u8>()) {
                    return Ok(p);
                }
            }

            Err(PageError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "aligned reservation window kept disappearing",
            )))
        }

        unsafe fn free_pages(ptr: NonNull<u8>, _size: usize) -> Result<(), PageError> {
            // VirtualFree with MEM_RELEASE takes size 0 and the base address.
            // Safety: FFI call to VirtualFree.
            if unsafe { libc::VirtualFree(ptr.as_ptr().cast::<libc::c_void>(), 0, libc::MEM_RELEASE) }
                == 0
            {
                return Err(PageError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *PAGE_SIZE.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed pages (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Every "mapping" is a plain heap
// allocation aligned to the OS granularity, which satisfies every alignment
// the engine requests in tests. This is sufficient for checking the
// *synchronization* logic; page placement is exercised by the platform
// implementations in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageOps for PlatformPages {
    unsafe fn alloc_pages(size: usize, align: usize, _node: u32) -> Result<NonNull<u8>, PageError> {
        assert!(
            align <= OS_GRANULARITY,
            "mock page source supports alignment up to {OS_GRANULARITY}, got {align}"
        );
        let layout = std::alloc::Layout::from_size_align(size, OS_GRANULARITY)
            .map_err(|e| PageError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            PageError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn free_pages(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
        let layout = std::alloc::Layout::from_size_align(size, OS_GRANULARITY)
            .map_err(|e| PageError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `alloc_pages`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

// ---------------------------------------------------------------------------
// NUMA topology
// ---------------------------------------------------------------------------

/// Static view of the machine's NUMA layout. Without the `numa` feature (or
/// on single-node machines) everything maps to node 0 and peer borrowing is
/// disabled.
pub(crate) struct NumaTopology {
    node_count: u32,
    is_numa: bool,
    #[cfg(feature = "numa")]
    cpu_to_node: [u8; MAX_CPUS],
}

#[cfg(feature = "numa")]
pub(crate) const MAX_CPUS: usize = 256;

impl NumaTopology {
    #[cfg(not(feature = "numa"))]
    fn detect() -> Self {
        Self {
            node_count: 1,
            is_numa: false,
        }
    }

    /// Probe /sys for the node layout. Reports what the kernel exposes;
    /// nodes with no CPUs are skipped like the allocation path skips them.
    #[cfg(feature = "numa")]
    fn detect() -> Self {
        let mut cpu_to_node = [0u8; MAX_CPUS];
        let mut node_count = 0u32;

        #[cfg(target_os = "linux")]
        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            let mut nodes: Vec<usize> = entries
                .flatten()
                .filter_map(|entry| {
                    let name = entry.file_name();
                    let name = name.to_string_lossy().into_owned();
                    name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok())
                })
                .collect();
            nodes.sort_unstable();

            for sys_node in nodes {
                let path = format!("/sys/devices/system/node/node{sys_node}/cpulist");
                let Ok(list) = std::fs::read_to_string(path) else {
                    continue;
                };
                let mut any_cpu = false;
                for range in list.trim().split(',') {
                    let (lo, hi) = match range.split_once('-') {
                        Some((lo, hi)) => (lo.parse::<usize>(), hi.parse::<usize>()),
                        None => (range.parse::<usize>(), range.parse::<usize>()),
                    };
                    if let (Ok(lo), Ok(hi)) = (lo, hi) {
                        for cpu in lo..=hi.min(MAX_CPUS - 1) {
                            cpu_to_node[cpu] = node_count.min(u8::MAX as u32) as u8;
                            any_cpu = true;
                        }
                    }
                }
                if any_cpu {
                    node_count += 1;
                }
            }
        }

        if node_count <= 1 {
            return Self {
                node_count: 1,
                is_numa: false,
                cpu_to_node: [0; MAX_CPUS],
            };
        }

        Self {
            node_count: node_count.min(MAX_NUMA_NODES as u32),
            is_numa: true,
            cpu_to_node,
        }
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn is_numa(&self) -> bool {
        self.is_numa
    }

    /// Node of the CPU the calling thread is currently running on. Threads
    /// keep the node observed at context creation for their lifetime.
    #[cfg(feature = "numa")]
    pub fn current_node(&self) -> u32 {
        if !self.is_numa {
            return 0;
        }
        #[cfg(all(target_os = "linux", not(any(loom, miri))))]
        {
            // Safety: FFI call to sched_getcpu.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 && (cpu as usize) < MAX_CPUS {
                return u32::from(self.cpu_to_node[cpu as usize]);
            }
        }
        0
    }

    #[cfg(not(feature = "numa"))]
    pub fn current_node(&self) -> u32 {
        0
    }
}

/// Process-wide topology snapshot, probed once.
pub(crate) fn topology() -> &'static NumaTopology {
    use crate::sync::OnceLock;
    static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();
    TOPOLOGY.get_or_init(NumaTopology::detect)
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_basic() {
        let size = OS_GRANULARITY;
        // Safety: test code.
        unsafe {
            let ptr = PlatformPages::alloc_pages(size, OS_GRANULARITY, 0).expect("alloc failed");
            assert_eq!(ptr.as_ptr() as usize % OS_GRANULARITY, 0, "misaligned mapping");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformPages::free_pages(ptr, size).expect("free failed");
        }
    }

    #[test]
    fn test_alloc_is_zeroed() {
        let size = PlatformPages::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformPages::alloc_pages(size, size, 0).expect("alloc failed");
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh mapping not zeroed");
            PlatformPages::free_pages(ptr, size).expect("free failed");
        }
    }

    #[test]
    fn test_alignment_held_across_sizes() {
        for &(size, align) in &[
            (16 * 1024, 16 * 1024),
            (OS_GRANULARITY, OS_GRANULARITY),
            (1024 * 1024, 16 * 1024),
            (1024 * 1024 + OS_GRANULARITY, OS_GRANULARITY),
        ] {
            // Safety: test code.
            unsafe {
                let ptr = PlatformPages::alloc_pages(size, align, 0).expect("alloc failed");
                assert_eq!(
                    ptr.as_ptr() as usize % align,
                    0,
                    "size {size} align {align} not honored"
                );
                // Edges must be mapped after head/tail trimming.
                ptr.as_ptr().write(1);
                ptr.as_ptr().add(size - 1).write(1);
                PlatformPages::free_pages(ptr, size).expect("free failed");
            }
        }
    }

    #[test]
    fn test_multiple_mappings_independent() {
        let size = OS_GRANULARITY;
        // Safety: test code.
        unsafe {
            let a = PlatformPages::alloc_pages(size, OS_GRANULARITY, 0).unwrap();
            let b = PlatformPages::alloc_pages(size, OS_GRANULARITY, 0).unwrap();
            assert_ne!(a, b);

            a.as_ptr().write(1);
            b.as_ptr().write(2);
            assert_eq!(a.as_ptr().read(), 1);
            assert_eq!(b.as_ptr().read(), 2);

            PlatformPages::free_pages(a, size).unwrap();
            assert_eq!(b.as_ptr().read(), 2);
            PlatformPages::free_pages(b, size).unwrap();
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformPages::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_topology_has_at_least_one_node() {
        let topo = topology();
        assert!(topo.node_count() >= 1);
        assert!(topo.current_node() < topo.node_count());
    }
}
