// kernel/src/init/processes.rs
//
// Process creation (idle, user, shell) and entry points.

use alloc::{boxed::Box, format};
use x86_64::VirtAddr;

use crate::{
    memory::{address_space::AddressSpace, exec},
    process::{
        Pid, Process,
        allocate_kernel_stack,
        scheduler::SCHEDULER,
        user_test_fileio,
    },
    serial_println,
};

// ============================================================================
// PUBLIC API
// ============================================================================

/// Create all processes: idle, user×2, shell.
pub fn init_all() {
    serial_println!("\n🔧 Creating processes with isolated address spaces...");

    create_idle_process();
    create_user_processes(2);
    create_shell_process();

    serial_println!("✅ All processes created!\n");
}

/// Print open file descriptors for every process (debug).
pub fn debug_file_descriptors() {
    let scheduler = SCHEDULER.lock();
    for proc in scheduler.iter_all() {
        serial_println!("Process {}: open files:", proc.pid.0);
        proc.files.debug_list();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// The embedded test programs are raw `extern "C" fn() -> !` entry points
/// baked in by `global_asm!`, not a loadable byte image — `code_size` is
/// the same "how big could this function reasonably be" heuristic
/// `init::processes` has always used to carve out a handful of pages
/// around it for `exec_install` to copy.
const EMBEDDED_TEST_CODE_SIZE: usize = 4096;

// ============================================================================
// PROCESS CREATORS
// ============================================================================

/// Idle process — uses kernel address space.
fn create_idle_process() {
    let kernel_stack = allocate_kernel_stack();
    let address_space = AddressSpace::kernel();

    let mut idle_proc = Box::new(Process::new_kernel(
        Pid(0),
        VirtAddr::new(idle_task as *const () as u64),
        kernel_stack,
        address_space,
    ));

    idle_proc.set_name("idle");
    idle_proc.set_priority(0);

    {
        let mut scheduler = SCHEDULER.lock();
        scheduler.add_process(idle_proc);
    }

    serial_println!("✅ Created idle process (PID 0)");
}

/// User processes — each gets its own address space built by
/// `memory::exec::exec_install`, which gives them the `size`/`stack_size`
/// bookkeeping the fault handler's lazy-alloc/stack-grow/CoW dispatch
/// needs. No VMA bookkeeping here any more: the fault handler never
/// consults one, so hand-registering "this is the code region, that's the
/// stack" would just be dead state.
fn create_user_processes(num_processes: usize) {
    let test_name = "write";
    const CODE_LOAD_ADDR: u64 = 0x0000_0000_0040_0000;

    user_test_fileio::print_available_tests();
    serial_println!("\n📝 Using test: '{}'", test_name);

    for i in 0..num_processes {
        let kernel_stack = allocate_kernel_stack();

        let code_ptr = user_test_fileio::get_test_ptr(test_name);
        let program = unsafe {
            core::slice::from_raw_parts(code_ptr, EMBEDDED_TEST_CODE_SIZE)
        };

        let argv = [test_name];
        let exec_result = unsafe {
            exec::exec_install(program, CODE_LOAD_ADDR, &argv)
                .expect("Failed to install user program")
        };

        serial_println!(
            "Created address space for process {}: PML4 at {:#x}, entry {:#x}",
            i,
            exec_result.space.root_frame().start_address().as_u64(),
            exec_result.entry.as_u64(),
        );

        let pid = {
            let mut scheduler = SCHEDULER.lock();
            scheduler.allocate_pid()
        };

        let mut user_proc = Box::new(Process::new_user(pid, exec_result, kernel_stack));
        user_proc.set_name(&format!("user_{}", i));

        {
            let mut scheduler = SCHEDULER.lock();
            scheduler.add_process(user_proc);
        }

        serial_println!("✅ Created user process {} (PID {})", i, pid.0);
    }
}

/// Shell process — kernel, uses kernel address space.
fn create_shell_process() {
    let kernel_stack = allocate_kernel_stack();
    let address_space = AddressSpace::kernel();

    let pid = {
        let mut scheduler = SCHEDULER.lock();
        let pid = scheduler.allocate_pid();

        let mut shell = Box::new(Process::new_kernel(
            pid,
            VirtAddr::new(shell_process as *const () as u64),
            kernel_stack,
            address_space,
        ));

        shell.set_name("shell");
        shell.set_priority(8);

        scheduler.add_process(shell);
        pid
    };

    serial_println!("✅ Created shell process (PID {})", pid.0);
}

// ============================================================================
// PROCESS ENTRY POINTS
// ============================================================================

fn idle_task() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt"); }
    }
}

fn shell_process() -> ! {
    let mut repl = crate::repl::Repl::new(10, 50);
    repl.show_prompt();

    loop {
        if let Some(character) = crate::keyboard::read_key() {
            repl.handle_char(character);
        }
        unsafe { core::arch::asm!("pause"); }
    }
}
