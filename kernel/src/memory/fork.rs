// kernel/src/memory/fork.rs
//
// Fork's memory side: build the child's address space by walking the
// parent's user range page by page. Directly modeled on `copyuvm`: resident
// writable pages are stripped of `WRITABLE` in both parent and child and
// the frame's refcount is bumped instead of copied, so the first write on
// either side triggers the fault handler's copy-on-write split. Absent
// pages are skipped. Swapped-out pages get the resolved treatment from the
// fork+swap open question: the child gets an independent slot holding a
// duplicate of the bytes, rather than sharing the parent's slot (sharing it
// would let one side's `release` free a slot the other still thinks it
// owns).

use x86_64::{VirtAddr, structures::paging::{Page, PageTableFlags}};

use super::address_space::AddressSpace;
use super::resident_queue::ResidentQueue;
use super::swap::SwapTable;
use super::{round_up, PAGE_SIZE};

/// Build a fresh address space for the child, sharing the parent's resident
/// frames copy-on-write and duplicating its swapped-out pages.
///
/// # Safety
/// Buddy allocator must be initialized (same precondition as
/// `AddressSpace::new_user`).
pub unsafe fn fork_copy(
    parent_space: &AddressSpace,
    parent_swap: &mut SwapTable,
    child_swap: &mut SwapTable,
    size: u64,
    stack_size: u64,
) -> Result<(AddressSpace, ResidentQueue), &'static str> {
    let mut child_space = AddressSpace::new_user()?;
    let mut child_queue = ResidentQueue::new();

    copy_region(&mut child_space, &mut child_queue, parent_space, parent_swap, child_swap, 0, size)?;
    copy_region(
        &mut child_space,
        &mut child_queue,
        parent_space,
        parent_swap,
        child_swap,
        super::USER_TOP - stack_size,
        super::USER_TOP,
    )?;

    crate::serial_println!("fork: copied address space (size={:#x}, stack_size={:#x})", size, stack_size);
    Ok((child_space, child_queue))
}

fn copy_region(
    child_space: &mut AddressSpace,
    child_queue: &mut ResidentQueue,
    parent_space: &AddressSpace,
    parent_swap: &mut SwapTable,
    child_swap: &mut SwapTable,
    start: u64,
    end: u64,
) -> Result<(), &'static str> {
    let start = round_up(start).min(end);
    let mut addr = start;

    while addr < end {
        let va = VirtAddr::new(addr);

        if parent_space.page_table.is_paged_out(va)? {
            parent_swap.duplicate_into(addr, child_swap)?;
            // The child's PTE mirrors the parent's: absent + PAGED_OUT. The
            // intermediate tables must exist so the walk can reach the leaf.
            let _ = child_space.page_table.walk(va, true)?;
            child_space.page_table.mark_swapped(va)?;
        } else if let Some((frame, flags)) = parent_space.page_table.translate(va)? {
            let shared_flags = flags & !PageTableFlags::WRITABLE;
            parent_space.page_table.set_flags(va, shared_flags)?;
            super::frame::incr(frame)?;
            child_space.page_table.map(Page::containing_address(va), frame, shared_flags)?;
            child_queue.enroll(addr)?;
        }
        // else: page was never mapped (a hole below `size`); nothing to copy.

        addr += PAGE_SIZE;
    }

    Ok(())
}
