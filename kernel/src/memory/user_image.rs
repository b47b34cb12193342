// kernel/src/memory/user_image.rs
//
// Grow/shrink the user heap region `0..size`. Modeled directly on the
// original's `allocuvm`/`deallocuvm`: same precondition ordering (new size
// must not cross into the stack guard), same per-page loop evicting the
// resident-queue tail once the process is at `MAX_RESIDENT`, same
// skip-if-absent behavior on shrink, same roll-back-the-whole-attempted-
// range-via-shrink on a mid-loop failure. The shrink-path bug flagged in the
// original (an unconditional panic where "not swapped" should just mean
// "skip") is not reproduced: `swap.release` returns a `Result` and a
// not-found slot is simply not a swapped page.

use x86_64::{VirtAddr, structures::paging::{Page, PageTableFlags}};

use super::address_space::AddressSpace;
use super::resident_queue::ResidentQueue;
use super::swap::SwapTable;
use super::{round_up, PAGE_SIZE, USER_TOP};

/// Grow a process's user image from `old_size` to `new_size`, mapping and
/// zeroing each new page and enrolling it in the resident queue, evicting
/// the oldest resident page first whenever the cap is already hit.
///
/// Mirrors `allocuvm`'s ordering: validate the new top doesn't cross into
/// the stack guard *before* mapping anything, then map page by page.
pub fn grow(
    space: &AddressSpace,
    queue: &mut ResidentQueue,
    swap: &mut SwapTable,
    old_size: u64,
    new_size: u64,
    stack_size: u64,
) -> Result<u64, &'static str> {
    if new_size <= old_size {
        return Ok(old_size);
    }
    if new_size > USER_TOP - stack_size - PAGE_SIZE {
        return Err("user_image: grow would cross into the stack guard");
    }

    let start = round_up(old_size);
    let end = round_up(new_size);

    let mut addr = start;
    while addr < end {
        if let Err(e) = grow_one_page(space, queue, swap, addr) {
            // Mirrors allocuvm's `deallocuvm(pgdir, newsz, oldsz)` on
            // failure: roll back the *entire* requested range, not just the
            // prefix that got mapped before the failure. shrink() skips
            // pages that were never mapped, so this is safe even when the
            // very first page is the one that failed.
            let _ = shrink(space, queue, swap, new_size, old_size);
            return Err(e);
        }

        addr += PAGE_SIZE;
    }

    crate::serial_println!("user_image: grew {:#x} -> {:#x}", old_size, new_size);
    Ok(new_size)
}

fn grow_one_page(
    space: &AddressSpace,
    queue: &mut ResidentQueue,
    swap: &mut SwapTable,
    addr: u64,
) -> Result<(), &'static str> {
    if queue.is_full() {
        evict_one(space, queue, swap)?;
    }

    let page: Page = Page::containing_address(VirtAddr::new(addr));
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let frame = space.page_table.map_new(page, flags)?;
    unsafe { super::page_table::OwnedPageTable::zero_frame(frame) };
    queue.enroll(addr)?;
    Ok(())
}

/// Shrink a process's user image from `old_size` to `new_size`. Pages in
/// the freed range that are resident get unmapped (frame refcount
/// decremented, dropped from the resident queue); pages that are swapped
/// out get their slot released instead. Pages already absent are skipped —
/// this is the branch the original's bug lived in.
pub fn shrink(
    space: &AddressSpace,
    queue: &mut ResidentQueue,
    swap: &mut SwapTable,
    old_size: u64,
    new_size: u64,
) -> Result<u64, &'static str> {
    if new_size >= old_size {
        return Ok(old_size);
    }

    let start = round_up(new_size);
    let end = round_up(old_size);

    let mut addr = start;
    while addr < end {
        if space.page_table.is_paged_out(VirtAddr::new(addr))? {
            let _ = swap.release(addr);
        } else if space.page_table.translate(VirtAddr::new(addr))?.is_some() {
            let page: Page = Page::containing_address(VirtAddr::new(addr));
            let frame = space.page_table.unmap(page)?;
            let _ = super::frame::free(frame);
            queue.remove(addr);
        }
        // else: never mapped in this range (page hole); nothing to do.

        addr += PAGE_SIZE;
    }

    crate::serial_println!("user_image: shrank {:#x} -> {:#x}", old_size, new_size);
    Ok(new_size)
}

fn evict_one(space: &AddressSpace, queue: &mut ResidentQueue, swap: &mut SwapTable) -> Result<(), &'static str> {
    let victim = queue.evict_oldest().ok_or("user_image: evict requested on an empty resident queue")?;
    let page: Page = Page::containing_address(VirtAddr::new(victim));
    let frame = space.page_table.unmap(page)?;
    swap.swap_out(victim, frame)?;
    let _ = super::frame::free(frame);
    space.page_table.mark_swapped(VirtAddr::new(victim))?;
    Ok(())
}
