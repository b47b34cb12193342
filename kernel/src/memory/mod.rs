// kernel/src/memory/mod.rs
//
// Tunables for the user-space virtual memory subsystem, plus the
// physical-memory-offset bookkeeping the whole subsystem is built on.

use x86_64::VirtAddr;
use core::sync::atomic::{AtomicU64, Ordering};

pub mod address_space;
pub mod exec;
pub mod fault;
pub mod fork;
pub mod frame;
pub mod page_table;
pub mod resident_queue;
pub mod swap;
pub mod user_image;
pub mod vma;

/// Size of one frame/page. The subsystem only deals in whole pages.
pub const PAGE_SIZE: u64 = 4096;

/// Exclusive upper bound of the user stack region. The stack occupies
/// `USER_TOP - stack_size .. USER_TOP`, growing downward.
pub const USER_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Addresses at or above this belong to the kernel (or the canonical
/// hole); user code may never map or access them.
pub const KERNEL_BASE: u64 = 0x0000_8000_0000_0000;

/// Per-process cap on resident pages. Also the swap-slot table's
/// capacity in this fixed-capacity design.
pub const MAX_RESIDENT: usize = 64;

#[inline]
pub const fn round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn round_up(addr: u64) -> u64 {
    round_down(addr + PAGE_SIZE - 1)
}

static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Initialize the physical memory offset (call once from kernel_main).
pub fn init(physical_memory_offset: VirtAddr) {
    PHYSICAL_MEMORY_OFFSET.store(physical_memory_offset.as_u64(), Ordering::Relaxed);
}

/// Get the physical memory offset.
pub fn physical_memory_offset() -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Relaxed))
}
