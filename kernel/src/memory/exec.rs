// kernel/src/memory/exec.rs
//
// Install a program image into a fresh address space: load the (flat,
// already-loaded-bytes) program, install the first stack page, push argv,
// and hand back everything needed to commit. Modeled on the original's
// `exec()`, with one simplification Rust's ownership makes free: instead of
// snapshotting every memory-management field of the running process before
// mutating it and manually restoring them on a `bad:` goto, this builds the
// new address space, resident queue and swap table as values the caller
// never sees until `exec_install` returns `Ok`. A failure partway through
// just drops the half-built `ExecResult` pieces — the running process's
// actual state was never touched, so there's nothing to restore.
//
// There's no ELF parser here, same as the rest of this kernel: `program` is
// the flat byte image to copy into user pages starting at `load_addr`,
// exactly how `init::processes` already loads its embedded test programs.

use alloc::vec::Vec;
use x86_64::{VirtAddr, structures::paging::{Page, PageTableFlags}};

use super::address_space::AddressSpace;
use super::resident_queue::ResidentQueue;
use super::swap::SwapTable;
use super::{round_up, PAGE_SIZE, USER_TOP};

const MAX_ARGS: usize = 32;

pub struct ExecResult {
    pub space: AddressSpace,
    pub queue: ResidentQueue,
    pub swap: SwapTable,
    pub size: u64,
    pub stack_size: u64,
    pub entry: VirtAddr,
    pub stack_pointer: VirtAddr,
}

/// Build a fresh address space loaded with `program` at `load_addr`, a
/// one-page stack, and `argv` pushed onto it C-runtime style (argc, argv
/// pointer array, then the strings themselves, highest addresses first).
///
/// # Safety
/// Buddy allocator must be initialized.
pub unsafe fn exec_install(program: &[u8], load_addr: u64, argv: &[&str]) -> Result<ExecResult, &'static str> {
    if argv.len() > MAX_ARGS {
        return Err("exec: too many arguments");
    }
    if load_addr % PAGE_SIZE != 0 {
        return Err("exec: load address must be page-aligned");
    }

    let space = AddressSpace::new_user()?;
    let mut queue = ResidentQueue::new();
    let swap = SwapTable::with_heap_backing();

    let size = load_program(&space, &mut queue, load_addr, program)?;
    let size = round_up(size);

    let stack_size = install_stack(&space, &mut queue)?;
    let stack_pointer = push_argv(&space, argv)?;

    crate::serial_println!(
        "exec: installed program at {:#x} (size={:#x}), sp={:#x}",
        load_addr, size, stack_pointer.as_u64()
    );

    Ok(ExecResult {
        space,
        queue,
        swap,
        size,
        stack_size,
        entry: VirtAddr::new(load_addr),
        stack_pointer,
    })
}

fn load_program(space: &AddressSpace, queue: &mut ResidentQueue, load_addr: u64, program: &[u8]) -> Result<u64, &'static str> {
    let num_pages = (program.len() as u64 + PAGE_SIZE - 1) / PAGE_SIZE;
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    for i in 0..num_pages {
        let page_addr = load_addr + i * PAGE_SIZE;
        let page: Page = Page::containing_address(VirtAddr::new(page_addr));
        let frame = space.page_table.map_new(page, flags)?;

        let start = (i * PAGE_SIZE) as usize;
        let end = (start + PAGE_SIZE as usize).min(program.len());
        let chunk = &program[start..end];

        unsafe {
            super::page_table::OwnedPageTable::zero_frame(frame);
            super::page_table::OwnedPageTable::write_to_frame(frame, chunk, 0);
        }
        queue.enroll(page_addr)?;
    }

    Ok(load_addr + program.len() as u64)
}

fn install_stack(space: &AddressSpace, queue: &mut ResidentQueue) -> Result<u64, &'static str> {
    let stack_page_addr = USER_TOP - PAGE_SIZE;
    let page: Page = Page::containing_address(VirtAddr::new(stack_page_addr));
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let frame = space.page_table.map_new(page, flags)?;
    unsafe { super::page_table::OwnedPageTable::zero_frame(frame) };
    queue.enroll(stack_page_addr)?;
    Ok(PAGE_SIZE)
}

/// Push argv strings and the argc/argv header onto the single stack page,
/// returning the stack pointer execution should resume at.
fn push_argv(space: &AddressSpace, argv: &[&str]) -> Result<VirtAddr, &'static str> {
    let mut sp = USER_TOP;
    let mut pointers: Vec<u64> = Vec::with_capacity(argv.len());

    for arg in argv {
        let bytes = arg.as_bytes();
        let len_with_nul = bytes.len() + 1;
        sp = (sp - len_with_nul as u64) & !0x7;

        let mut buf = Vec::with_capacity(len_with_nul);
        buf.extend_from_slice(bytes);
        buf.push(0);
        space.copy_out(VirtAddr::new(sp), &buf)?;
        pointers.push(sp);
    }

    // Null terminator for the argv pointer array.
    pointers.push(0);

    let argv_array_bytes = pointers.len() * 8;
    sp = (sp - argv_array_bytes as u64) & !0x7;
    let argv_ptr = sp;
    for (i, ptr) in pointers.iter().enumerate() {
        space.copy_out(VirtAddr::new(sp + (i as u64) * 8), &ptr.to_ne_bytes())?;
    }

    // Fake return address, argc, argv — the three words a freshly started
    // user stack needs before the entry point runs.
    let argc = (pointers.len() - 1) as u64;
    let header = [0xffff_ffff_ffff_ffffu64, argc, argv_ptr];
    sp -= (header.len() * 8) as u64;
    for (i, word) in header.iter().enumerate() {
        space.copy_out(VirtAddr::new(sp + (i as u64) * 8), &word.to_ne_bytes())?;
    }

    Ok(VirtAddr::new(sp))
}
