// kernel/src/memory/address_space.rs
//
// AddressSpace: groups a process's page table + VMAs into a single unit
// that does not depend on PID, plus the user-pointer helpers exec/syscalls
// need to move bytes across the kernel/user boundary.

use x86_64::{PhysAddr, VirtAddr, structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB}};

use super::page_table::OwnedPageTable;
use super::vma::{Vma, VmaList};
use super::PAGE_SIZE;

pub struct AddressSpace {
    pub page_table: OwnedPageTable,
    pub vmas: VmaList,
}

unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Kernel address space: wraps the current CR3, no VMAs. Used by the
    /// idle and shell processes, which share the kernel's own mappings.
    pub fn kernel() -> Self {
        Self {
            page_table: OwnedPageTable::from_current(),
            vmas: VmaList::new(),
        }
    }

    /// New user address space: fresh page table with kernel entries
    /// copied in, empty VMA list.
    ///
    /// # Safety
    /// Buddy allocator must be initialized.
    pub unsafe fn new_user() -> Result<Self, &'static str> {
        let page_table = OwnedPageTable::build_fresh()?;
        Ok(Self { page_table, vmas: VmaList::new() })
    }

    pub fn add_vma(&mut self, vma: Vma) -> Result<(), &'static str> {
        self.vmas.add(vma)
    }

    pub fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.vmas.find(addr).copied()
    }

    pub fn dump_vmas(&self, label: usize) {
        self.vmas.dump(label);
    }

    pub unsafe fn activate(&self) {
        self.page_table.activate();
    }

    /// Force-reload this space's page table even if it's already active —
    /// see `OwnedPageTable::reload`.
    pub unsafe fn reload(&self) {
        self.page_table.reload();
    }

    /// Tear down a user address space: frees every resident data frame plus
    /// the page-table structure itself. No-op for a space built by
    /// `kernel()`, which only aliases the shared kernel table.
    pub fn destroy(self) -> Result<(), &'static str> {
        self.page_table.destroy()
    }

    pub fn map_user_page(&self, page: Page<Size4KiB>, flags: PageTableFlags) -> Result<PhysFrame, &'static str> {
        self.page_table.map_new(page, flags)
    }

    pub fn pml4_phys(&self) -> PhysAddr {
        self.page_table.pml4_phys()
    }

    pub fn root_frame(&self) -> PhysFrame {
        self.page_table.root_frame()
    }

    /// Translate a user virtual address to a kernel-accessible pointer into
    /// the frame backing it. Fails if the page isn't resident (swapped out
    /// or unmapped) — callers must fault it in first.
    pub fn user_to_kernel_ptr(&self, uva: VirtAddr) -> Result<*mut u8, &'static str> {
        let page_addr = VirtAddr::new(uva.as_u64() & !(PAGE_SIZE - 1));
        let (frame, _flags) = self.page_table.translate(page_addr)?
            .ok_or("address_space: user_to_kernel_ptr on a non-resident page")?;
        let offset = uva.as_u64() - page_addr.as_u64();
        let phys_offset = super::physical_memory_offset();
        let ptr = (phys_offset + frame.start_address().as_u64()).as_mut_ptr::<u8>();
        Ok(unsafe { ptr.add(offset as usize) })
    }

    /// Copy `src` into user memory starting at `dst_uva`. Used by `exec` to
    /// push argv onto the freshly built stack. Fails rather than straddling
    /// a page boundary silently wrong — callers are expected to call this
    /// once per page-sized (or smaller) chunk, matching how the original
    /// pushed argv one word/string at a time.
    pub fn copy_out(&self, dst_uva: VirtAddr, src: &[u8]) -> Result<(), &'static str> {
        let page_addr = VirtAddr::new(dst_uva.as_u64() & !(PAGE_SIZE - 1));
        let offset = (dst_uva.as_u64() - page_addr.as_u64()) as usize;
        if offset + src.len() > PAGE_SIZE as usize {
            return Err("address_space: copy_out write crosses a page boundary");
        }
        let ptr = self.user_to_kernel_ptr(dst_uva)?;
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len()) };
        Ok(())
    }

    /// Copy bytes out of user memory into `dst`. The read-side counterpart
    /// of `copy_out`, same single-page restriction.
    pub fn copy_in(&self, src_uva: VirtAddr, dst: &mut [u8]) -> Result<(), &'static str> {
        let page_addr = VirtAddr::new(src_uva.as_u64() & !(PAGE_SIZE - 1));
        let offset = (src_uva.as_u64() - page_addr.as_u64()) as usize;
        if offset + dst.len() > PAGE_SIZE as usize {
            return Err("address_space: copy_in read crosses a page boundary");
        }
        let ptr = self.user_to_kernel_ptr(src_uva)?;
        unsafe { core::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}
