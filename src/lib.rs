#[cfg(not(target_pointer_width = "64"))]
compile_error!("parlloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator engine
pub use memory::allocator::{Allocator, GlobalAllocator};

// page source
pub use memory::page_source::PageError;

// statistics
pub use memory::stats::MemoryStats;
