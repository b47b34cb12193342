// kernel/src/memory/fault.rs
//
// Page-fault dispatch. The decision tree is lifted straight from the
// original's `pagefault()`: swapped-PTE first, then the null-pointer guard,
// then the stack-grow gap, then the kernel-address guard, then a lazy
// heap allocation or a copy-on-write decision for everything else. Ordering
// matters here — e.g. the null guard has to run before the heap-range check
// or address 0 would be treated as "just below the heap" instead of killed.
//
// Low-level pieces (CR2 read via inline asm, zero-and-map a fresh frame)
// follow the kernel's earlier demand-paging code; the dispatch table itself,
// including the `"init"`/`"sh"` name bypass in the swap-in path, follows the
// original `pagefault()`/`swappage()` unchanged — that bypass's rationale is
// unclear and it should be re-examined rather than assumed correct.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{VirtAddr, structures::paging::{Page, PageTableFlags}};

use super::address_space::AddressSpace;
use super::page_table::PAGED_OUT;
use super::resident_queue::ResidentQueue;
use super::swap::SwapTable;
use super::{KERNEL_BASE, PAGE_SIZE, USER_TOP};

/// Outcome of a dispatched fault that the caller (the trap handler) turns
/// into "resume" or "kill this process".
pub enum Outcome {
    Resolved,
    Kill(&'static str),
}

static INIT_SH_BYPASS_COUNT: AtomicU64 = AtomicU64::new(0);

#[inline]
fn read_cr2() -> u64 {
    let addr: u64;
    unsafe { core::arch::asm!("mov {}, cr2", out(reg) addr) };
    addr
}

/// Per-process memory state the dispatcher needs. Bundled so the trap
/// handler (which only has a `&mut Process`) can pass one argument instead
/// of five.
pub struct FaultContext<'a> {
    pub space: &'a AddressSpace,
    pub queue: &'a mut ResidentQueue,
    pub swap: &'a mut SwapTable,
    pub size: u64,
    pub stack_size: &'a mut u64,
    pub stack_growing: &'a mut bool,
    pub name: &'a str,
}

pub fn handle_page_fault(ctx: &mut FaultContext, error_code: u64) -> Result<Outcome, &'static str> {
    let fault_addr = read_cr2();
    let va = VirtAddr::new(fault_addr & !(PAGE_SIZE - 1));
    let _ = error_code; // the CPU error code doesn't change the dispatch below

    if ctx.space.page_table.is_paged_out(va)? {
        return swap_in(ctx, va);
    }

    if fault_addr < PAGE_SIZE {
        return Ok(Outcome::Kill("fault: null pointer dereference"));
    }

    if fault_addr >= KERNEL_BASE {
        return Ok(Outcome::Kill("fault: access to kernel address space"));
    }

    if fault_addr >= ctx.size + PAGE_SIZE && fault_addr < USER_TOP - *ctx.stack_size {
        return grow_stack(ctx, va);
    }

    match ctx.space.page_table.translate(va)? {
        None => {
            if fault_addr < ctx.size {
                lazy_alloc(ctx, va)
            } else {
                Ok(Outcome::Kill("fault: access to an unmapped, non-growable address"))
            }
        }
        Some((frame, flags)) => {
            if flags.contains(PageTableFlags::WRITABLE) {
                panic!("fault: write fault on a page already marked writable");
            }
            let refcount = super::frame::refcount(frame)?;
            if refcount <= 1 {
                reclaim(ctx, va, frame, flags)
            } else {
                cow_split(ctx, va, frame, flags)
            }
        }
    }
}

fn swap_in(ctx: &mut FaultContext, va: VirtAddr) -> Result<Outcome, &'static str> {
    if ctx.name == "init" || ctx.name == "sh" {
        // Carried over unresolved: the original skips the actual swap-in for
        // these two process names and just counts the occurrence, without
        // ever making the PTE resident. Bumping `resident_count` the way the
        // original does (see DESIGN.md) would count a page twice — once in
        // the queue, once still PAGED_OUT — and break the invariant that
        // every queue entry has a matching Resident PTE, so that part is not
        // reproduced: the counter below is observational only and the queue
        // is left untouched. The PTE stays PAGED_OUT, so the next access to
        // this address faults here again.
        INIT_SH_BYPASS_COUNT.fetch_add(1, Ordering::Relaxed);
        crate::serial_println!("fault: swap-in bypass for process {:?} at {:#x}", ctx.name, va.as_u64());
        return Ok(Outcome::Resolved);
    }

    if ctx.queue.is_full() {
        swap_in_by_exchange(ctx, va)?;
    } else {
        let frame = super::frame::alloc()?;
        if let Err(e) = ctx.swap.swap_in(va.as_u64(), frame) {
            let _ = super::frame::free(frame);
            return Err(e);
        }

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        ctx.space.page_table.mark_resident(va, frame, flags)?;
        ctx.queue.enroll(va.as_u64())?;
    }

    crate::serial_println!("fault: swapped in {:#x}", va.as_u64());
    Ok(Outcome::Resolved)
}

/// Swap `va` in when the resident queue is already at `MAX_RESIDENT`: detach
/// the oldest resident page (the victim) and reuse its frame and `va`'s own
/// slot directly instead of evicting the victim into a fresh slot first.
/// `SwapTable::exchange` does the four-quarter-page content swap in place,
/// so this never needs a second free slot — evicting the victim the way
/// `evict_resident_victim` does (reserve a new slot, *then* free `va`'s)
/// can fail with every slot occupied even though the resident queue holds
/// pages to spare.
fn swap_in_by_exchange(ctx: &mut FaultContext, va: VirtAddr) -> Result<(), &'static str> {
    let victim = ctx.queue.evict_oldest().ok_or("fault: eviction requested on an empty resident queue")?;
    let victim_va = VirtAddr::new(victim);
    let victim_page: Page = Page::containing_address(victim_va);

    let (frame, _) = ctx.space.page_table.translate(victim_va)?
        .ok_or("fault: resident-queue entry has no resident PTE")?;
    ctx.space.page_table.unmap(victim_page)?;

    ctx.swap.exchange(va.as_u64(), victim, frame)?;

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    ctx.space.page_table.mark_resident(va, frame, flags)?;
    ctx.space.page_table.mark_swapped(victim_va)?;
    ctx.queue.enroll(va.as_u64())?;
    Ok(())
}

fn evict_resident_victim(ctx: &mut FaultContext) -> Result<(), &'static str> {
    let victim = ctx.queue.evict_oldest().ok_or("fault: eviction requested on an empty resident queue")?;
    let page: Page = Page::containing_address(VirtAddr::new(victim));
    let frame = ctx.space.page_table.unmap(page)?;
    ctx.swap.swap_out(victim, frame)?;
    let _ = super::frame::free(frame);
    ctx.space.page_table.mark_swapped(VirtAddr::new(victim))?;
    Ok(())
}

fn grow_stack(ctx: &mut FaultContext, va: VirtAddr) -> Result<Outcome, &'static str> {
    *ctx.stack_growing = true;
    let result = grow_stack_inner(ctx, va);
    *ctx.stack_growing = false;
    result
}

fn grow_stack_inner(ctx: &mut FaultContext, va: VirtAddr) -> Result<Outcome, &'static str> {
    let new_stack_top = USER_TOP - va.as_u64();
    let new_stack_size = super::round_up(new_stack_top);

    if ctx.queue.is_full() {
        evict_resident_victim(ctx)?;
    }

    let page: Page = Page::containing_address(va);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let frame = ctx.space.page_table.map_new(page, flags)?;
    unsafe { super::page_table::OwnedPageTable::zero_frame(frame) };
    ctx.queue.enroll(va.as_u64())?;
    *ctx.stack_size = new_stack_size;

    crate::serial_println!("fault: grew stack to {:#x} bytes", *ctx.stack_size);
    Ok(Outcome::Resolved)
}

fn lazy_alloc(ctx: &mut FaultContext, va: VirtAddr) -> Result<Outcome, &'static str> {
    if ctx.queue.is_full() {
        evict_resident_victim(ctx)?;
    }

    let page: Page = Page::containing_address(va);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let frame = ctx.space.page_table.map_new(page, flags)?;
    unsafe { super::page_table::OwnedPageTable::zero_frame(frame) };
    ctx.queue.enroll(va.as_u64())?;

    crate::serial_println!("fault: lazily allocated {:#x}", va.as_u64());
    Ok(Outcome::Resolved)
}

fn reclaim(ctx: &mut FaultContext, va: VirtAddr, frame: x86_64::structures::paging::PhysFrame, flags: PageTableFlags) -> Result<Outcome, &'static str> {
    let _ = frame;
    let writable = flags | PageTableFlags::WRITABLE;
    ctx.space.page_table.set_flags(va, writable)?;
    crate::serial_println!("fault: reclaimed write access at {:#x}", va.as_u64());
    Ok(Outcome::Resolved)
}

fn cow_split(ctx: &mut FaultContext, va: VirtAddr, old_frame: x86_64::structures::paging::PhysFrame, flags: PageTableFlags) -> Result<Outcome, &'static str> {
    let new_frame = super::frame::alloc()?;
    unsafe {
        super::page_table::OwnedPageTable::zero_frame(new_frame);
        let mut buf = [0u8; PAGE_SIZE as usize];
        super::page_table::OwnedPageTable::read_from_frame(old_frame, &mut buf, 0);
        super::page_table::OwnedPageTable::write_to_frame(new_frame, &buf, 0);
    }

    let page: Page = Page::containing_address(va);
    ctx.space.page_table.unmap(page)?;
    let writable = (flags | PageTableFlags::WRITABLE) & !PAGED_OUT;
    ctx.space.page_table.map(page, new_frame, writable)?;
    let _ = super::frame::free(old_frame);

    crate::serial_println!("fault: copy-on-write split at {:#x}", va.as_u64());
    Ok(Outcome::Resolved)
}
