// kernel/src/memory/page_table.rs
//
// Per-process page tables. Same buddy-backed PML4 allocation and
// copy-kernel-entries-except-user-range construction as the kernel's earlier
// page-table manager, but the two hardcoded user addresses are replaced by indices
// derived from PAGE_SIZE/USER_TOP, and the module grows a raw PTE walker
// (`walk`) so the fault handler and swap code can read/write the software
// PAGED_OUT bit directly instead of only going through the `Mapper` trait.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags,
        PageTableEntry, PhysFrame, Size4KiB,
        mapper::MapToError,
    },
};

use crate::allocator::buddy_allocator::BUDDY;
use super::{frame, PAGE_SIZE, USER_TOP};

/// Software bit marking a PTE whose page has been swapped out. Never set at
/// the same time as `PRESENT` (spec invariant).
pub const PAGED_OUT: PageTableFlags = PageTableFlags::BIT_9;

#[inline]
const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

/// PML4 entries a user address space owns outright and therefore must never
/// share with the kernel's copy-down at construction time.
const USER_PML4_ENTRIES: [usize; 2] = [pml4_index(PAGE_SIZE), pml4_index(USER_TOP - 1)];

fn is_user_pml4_entry(index: usize) -> bool {
    USER_PML4_ENTRIES.contains(&index)
}

pub struct BuddyFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for BuddyFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        unsafe {
            BUDDY.lock()
                .allocate(12)
                .map(|addr| PhysFrame::containing_address(addr))
        }
    }
}

fn alloc_table_frame() -> Result<PhysFrame, &'static str> {
    unsafe { BUDDY.lock().allocate(12) }
        .map(PhysFrame::containing_address)
        .ok_or("page_table: out of memory for page-table frame")
}

unsafe fn table_from_frame<'a>(frame: PhysFrame) -> &'a mut PageTable {
    let phys_offset = crate::memory::physical_memory_offset();
    let virt = phys_offset + frame.start_address().as_u64();
    &mut *virt.as_mut_ptr::<PageTable>()
}

pub struct OwnedPageTable {
    pml4_frame: PhysFrame,
    owned: bool,
}

unsafe impl Send for OwnedPageTable {}
unsafe impl Sync for OwnedPageTable {}

impl OwnedPageTable {
    /// Wrap the currently-active (kernel) page table. Used for kernel-only
    /// processes that never touch user mappings.
    pub fn from_current() -> Self {
        let (frame, _) = Cr3::read();
        Self { pml4_frame: frame, owned: false }
    }

    /// Build a fresh page table for a user process: allocate a PML4 frame,
    /// copy every kernel entry except the two this address space will own.
    pub unsafe fn build_fresh() -> Result<Self, &'static str> {
        let phys_offset = crate::memory::physical_memory_offset();

        let new_frame = alloc_table_frame()?;
        let new_pml4 = table_from_frame(new_frame);
        new_pml4.zero();

        let (kernel_frame, _) = Cr3::read();
        let kernel_pml4_virt = phys_offset + kernel_frame.start_address().as_u64();
        let kernel_pml4: &PageTable = &*kernel_pml4_virt.as_ptr::<PageTable>();

        let mut copied = 0u16;
        let mut skipped = 0u16;
        for i in 0..512 {
            if kernel_pml4[i].is_unused() {
                continue;
            }
            if is_user_pml4_entry(i) {
                skipped += 1;
                continue;
            }
            new_pml4[i] = kernel_pml4[i].clone();
            copied += 1;
        }

        crate::serial_println!(
            "page_table: built fresh PML4 {:#x} ({} copied, {} skipped)",
            new_frame.start_address().as_u64(), copied, skipped
        );

        Ok(Self { pml4_frame: new_frame, owned: true })
    }

    pub fn root_frame(&self) -> PhysFrame {
        self.pml4_frame
    }

    #[inline]
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4_frame.start_address()
    }

    /// Switch the CPU to this page table. No-op if CR3 already matches.
    pub unsafe fn activate(&self) {
        let (current_frame, _) = Cr3::read();
        if current_frame == self.pml4_frame {
            return;
        }
        Cr3::write(self.pml4_frame, Cr3Flags::empty());
    }

    /// Force a TLB flush of this table even when it's already the active
    /// one. `fork_copy` strips `WRITABLE` from live parent PTEs in place;
    /// `activate` would see CR3 already matches and skip the reload
    /// entirely, leaving a stale writable translation cached. Used there
    /// and nowhere else `activate`'s no-op shortcut wouldn't be correct.
    pub unsafe fn reload(&self) {
        Cr3::write(self.pml4_frame, Cr3Flags::empty());
    }

    unsafe fn create_mapper(&self) -> OffsetPageTable<'static> {
        let phys_offset = crate::memory::physical_memory_offset();
        let pml4_virt = phys_offset + self.pml4_phys().as_u64();
        let pml4: &mut PageTable = &mut *pml4_virt.as_mut_ptr::<PageTable>();
        OffsetPageTable::new(pml4, phys_offset)
    }

    /// Walk to the leaf (level-1) PTE for `addr`, creating intermediate
    /// tables along the way when `create` is set. Returns `Ok(None)` if an
    /// intermediate table is missing and `create` is false.
    pub fn walk(&self, addr: VirtAddr, create: bool) -> Result<Option<&mut PageTableEntry>, &'static str> {
        let p4 = pml4_index(addr.as_u64());
        let p3 = ((addr.as_u64() >> 30) & 0x1FF) as usize;
        let p2 = ((addr.as_u64() >> 21) & 0x1FF) as usize;
        let p1 = ((addr.as_u64() >> 12) & 0x1FF) as usize;

        let mut frame = self.pml4_frame;
        for idx in [p4, p3, p2] {
            let table = unsafe { table_from_frame(frame) };
            let entry = &mut table[idx];
            if entry.is_unused() {
                if !create {
                    return Ok(None);
                }
                let child = alloc_table_frame()?;
                unsafe { table_from_frame(child).zero(); }
                entry.set_addr(
                    child.start_address(),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                );
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err("page_table: huge page in walk path");
            }
            frame = entry.frame().map_err(|_| "page_table: bad intermediate entry")?;
        }

        let pt = unsafe { table_from_frame(frame) };
        Ok(Some(&mut pt[p1]))
    }

    /// Map `page` to an already-owned `frame` with `flags`. Does not touch
    /// the frame's refcount; callers that just allocated the frame via
    /// `frame::alloc` already own the one reference it starts with.
    pub fn map(&self, page: Page<Size4KiB>, frame: PhysFrame, flags: PageTableFlags) -> Result<(), &'static str> {
        let mut allocator = BuddyFrameAllocator;
        let mut mapper = unsafe { self.create_mapper() };
        unsafe {
            mapper.map_to(page, frame, flags, &mut allocator)
                .map_err(|e| map_error_str(e))?
                .flush();
        }
        Ok(())
    }

    /// Allocate a fresh frame and map it; the common case for lazy alloc,
    /// stack growth and loading zero-filled segments.
    pub fn map_new(&self, page: Page<Size4KiB>, flags: PageTableFlags) -> Result<PhysFrame, &'static str> {
        let new_frame = frame::alloc()?;
        if let Err(e) = self.map(page, new_frame, flags) {
            let _ = frame::free(new_frame);
            return Err(e);
        }
        Ok(new_frame)
    }

    /// Unmap a resident page, returning the frame it was mapped to. Does not
    /// drop the frame's refcount — callers decide whether to `frame::free`
    /// it (they may be keeping it around to hand to swap-out).
    pub fn unmap(&self, page: Page<Size4KiB>) -> Result<PhysFrame, &'static str> {
        let mut mapper = unsafe { self.create_mapper() };
        let (frame, flush) = mapper.unmap(page).map_err(|_| "page_table: unmap on a non-resident page")?;
        flush.flush();
        Ok(frame)
    }

    /// Clear the `PRESENT` bit and set `PAGED_OUT`, leaving the address bits
    /// zeroed. The caller has already moved the page's bytes to swap and
    /// freed the data frame.
    pub fn mark_swapped(&self, addr: VirtAddr) -> Result<(), &'static str> {
        let entry = self.walk(addr, false)?.ok_or("page_table: mark_swapped on an unmapped address")?;
        entry.set_unused();
        entry.set_flags(PAGED_OUT);
        tlb::flush(addr);
        Ok(())
    }

    /// Install `frame` at `addr` with `flags`, clearing any `PAGED_OUT`
    /// marker. Used by the swap-in path once bytes are back in memory.
    pub fn mark_resident(&self, addr: VirtAddr, new_frame: PhysFrame, flags: PageTableFlags) -> Result<(), &'static str> {
        let page = Page::containing_address(addr);
        self.map(page, new_frame, flags)
    }

    /// Current frame and flags for a resident (non-swapped) page.
    pub fn translate(&self, addr: VirtAddr) -> Result<Option<(PhysFrame, PageTableFlags)>, &'static str> {
        let entry = match self.walk(addr, false)? {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.is_unused() || entry.flags().contains(PAGED_OUT) {
            return Ok(None);
        }
        let frame = entry.frame().map_err(|_| "page_table: huge/bad leaf entry")?;
        Ok(Some((frame, entry.flags())))
    }

    /// True if the page at `addr` is marked swapped out.
    pub fn is_paged_out(&self, addr: VirtAddr) -> Result<bool, &'static str> {
        Ok(self.walk(addr, false)?
            .map(|e| !e.is_unused() && e.flags().contains(PAGED_OUT))
            .unwrap_or(false))
    }

    /// Overwrite the flags of a resident PTE, keeping its frame. Used to
    /// reclaim the write bit (fault handler) or strip it (fork).
    pub fn set_flags(&self, addr: VirtAddr, flags: PageTableFlags) -> Result<(), &'static str> {
        let entry = self.walk(addr, false)?.ok_or("page_table: set_flags on an unmapped address")?;
        let f = entry.frame().map_err(|_| "page_table: set_flags on a huge/bad leaf entry")?;
        entry.set_addr(f.start_address(), flags);
        // `Mapper::map_to`'s `MapperFlush` handles invalidation when we go through
        // the trait; this path edits the raw entry directly, so the stale
        // translation has to be flushed by hand or the next access refaults forever.
        tlb::flush(addr);
        Ok(())
    }

    /// Unmap every resident page in `[start, start + num_pages*PAGE_SIZE)`,
    /// dropping each data frame's refcount. Swapped-out pages are skipped —
    /// releasing their swap slots is the swap table's job, not this one's.
    pub fn unmap_range(&self, start: VirtAddr, num_pages: usize) -> Result<(), &'static str> {
        for i in 0..num_pages {
            let addr = start + (i as u64) * PAGE_SIZE;
            if self.is_paged_out(addr)? {
                continue;
            }
            if self.translate(addr)?.is_none() {
                continue;
            }
            let page = Page::containing_address(addr);
            let frame = self.unmap(page)?;
            let _ = frame::free(frame);
        }
        Ok(())
    }

    /// Free every user-owned page-table frame and data frame this address
    /// space holds, leaving the PML4 entries for the user range unused. The
    /// PML4 itself is not freed here; `destroy` does that.
    pub fn clear_user(&self) -> Result<(), &'static str> {
        let pml4 = unsafe { table_from_frame(self.pml4_frame) };
        for &idx in USER_PML4_ENTRIES.iter() {
            let entry = &mut pml4[idx];
            if entry.is_unused() {
                continue;
            }
            let pdpt_frame = entry.frame().map_err(|_| "page_table: bad pml4 entry")?;
            free_pdpt(pdpt_frame);
            entry.set_unused();
        }
        Ok(())
    }

    /// Tear down this address space entirely: free the user subtree, then
    /// the PML4 frame itself. No-op for page tables that merely alias the
    /// kernel's (`from_current`).
    pub fn destroy(self) -> Result<(), &'static str> {
        if !self.owned {
            return Ok(());
        }
        self.clear_user()?;
        unsafe { BUDDY.lock().deallocate(self.pml4_frame.start_address(), 12) };
        Ok(())
    }

    /// Write raw bytes into a physical frame via the phys offset.
    pub unsafe fn write_to_frame(frame: PhysFrame, data: &[u8], offset: usize) {
        let phys_offset = crate::memory::physical_memory_offset();
        let dst = (phys_offset + frame.start_address().as_u64())
            .as_mut_ptr::<u8>()
            .add(offset);
        core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }

    /// Read raw bytes out of a physical frame via the phys offset.
    pub unsafe fn read_from_frame(frame: PhysFrame, buf: &mut [u8], offset: usize) {
        let phys_offset = crate::memory::physical_memory_offset();
        let src = (phys_offset + frame.start_address().as_u64())
            .as_ptr::<u8>()
            .add(offset);
        core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
    }

    /// Zero an entire 4 KiB physical frame.
    pub unsafe fn zero_frame(frame: PhysFrame) {
        let phys_offset = crate::memory::physical_memory_offset();
        let virt = phys_offset + frame.start_address().as_u64();
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
}

fn free_pdpt(frame: PhysFrame) {
    let table = unsafe { table_from_frame(frame) };
    for entry in table.iter() {
        if entry.is_unused() {
            continue;
        }
        if let Ok(pd_frame) = entry.frame() {
            free_pd(pd_frame);
        }
    }
    unsafe { BUDDY.lock().deallocate(frame.start_address(), 12) };
}

fn free_pd(frame: PhysFrame) {
    let table = unsafe { table_from_frame(frame) };
    for entry in table.iter() {
        if entry.is_unused() {
            continue;
        }
        if let Ok(pt_frame) = entry.frame() {
            free_pt(pt_frame);
        }
    }
    unsafe { BUDDY.lock().deallocate(frame.start_address(), 12) };
}

fn free_pt(frame: PhysFrame) {
    let table = unsafe { table_from_frame(frame) };
    for entry in table.iter() {
        if entry.is_unused() {
            continue;
        }
        if entry.flags().contains(PAGED_OUT) {
            continue;
        }
        if let Ok(data_frame) = entry.frame() {
            let _ = frame::free(data_frame);
        }
    }
    unsafe { BUDDY.lock().deallocate(frame.start_address(), 12) };
}

fn map_error_str(e: MapToError<Size4KiB>) -> &'static str {
    match e {
        MapToError::FrameAllocationFailed => "page_table: out of memory mapping page",
        MapToError::ParentEntryHugePage => "page_table: parent entry is a huge page",
        MapToError::PageAlreadyMapped(_) => "page_table: page already mapped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pml4_index_matches_bit_extraction() {
        assert_eq!(pml4_index(0x0000_0000_0040_0000), 0);
        assert_eq!(pml4_index(PAGE_SIZE), 0);
    }

    #[test]
    fn user_pml4_entries_are_distinct_or_stable() {
        // Whatever PAGE_SIZE/USER_TOP resolve to, the derived indices must
        // stay within a valid PML4 range.
        for idx in USER_PML4_ENTRIES {
            assert!(idx < 512);
        }
    }
}
