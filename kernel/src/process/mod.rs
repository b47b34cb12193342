// kernel/src/process/mod.rs

use alloc::boxed::Box;
use x86_64::VirtAddr;

use crate::memory::address_space::AddressSpace;
use crate::memory::exec::ExecResult;
use crate::memory::resident_queue::ResidentQueue;
use crate::memory::swap::SwapTable;

pub mod context;
pub mod file;
pub mod syscall;
pub mod trapframe;
pub mod trapret;
pub mod tss;
pub mod userspace;
pub mod scheduler;
pub mod timer_preempt;
pub mod user_test_fileio;
pub mod user_test_minimal;

use context::Context;
use file::FileDescriptorTable;
use trapframe::TrapFrame;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

/// Estado del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,      // Listo para ejecutar
    Running,    // Ejecutándose actualmente
    Sleeping,   // Esperando I/O
    Zombie,     // Terminado pero no recolectado
}

/// Privilege level del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,  // Ring 0
    User,    // Ring 3
}

/// Process Control Block (PCB). Carries its own address space, resident
/// page queue and swap table instead of reaching into global tables — the
/// fault handler borrows these three straight off the current process via
/// a `memory::fault::FaultContext`.
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub context: Context,
    pub kernel_stack: VirtAddr,
    pub user_stack: Option<VirtAddr>,
    pub privilege: PrivilegeLevel,
    pub address_space: AddressSpace,
    pub resident_queue: ResidentQueue,
    pub swap_table: SwapTable,
    /// Size in bytes of the program-image/heap region, `[0, size)`. Grown by
    /// `sbrk`, consulted by the fault handler to tell a lazy heap page from
    /// an out-of-range access.
    pub size: u64,
    /// Size in bytes of the user stack, growing down from `USER_TOP`.
    pub stack_size: u64,
    /// Reentrancy guard held for the duration of a stack-growth allocation;
    /// distinguishes a stack-grow call from a heap-grow call to
    /// `memory::user_image::grow` sharing the same code path.
    pub stack_growing: bool,
    /// Set by a fault or syscall the process can't survive; the scheduler
    /// reaps processes in this state instead of resuming them.
    pub killed: Option<&'static str>,
    pub files: FileDescriptorTable,
    /// Saved user-mode register state. `None` for kernel processes, which
    /// never take the ring3->ring0 trap path.
    pub trapframe: Option<Box<TrapFrame>>,
    pub priority: u8,
    pub name: [u8; 32],
}

impl Process {
    /// Crea un nuevo proceso de kernel (Ring 0). Shares the kernel's own
    /// address space — there is nothing for the fault handler to do here,
    /// so the VM fields are just empty placeholders.
    pub fn new_kernel(pid: Pid, entry_point: VirtAddr, kernel_stack: VirtAddr, address_space: AddressSpace) -> Self {
        Self {
            pid,
            state: ProcessState::Ready,
            context: Context::new(entry_point, kernel_stack),
            kernel_stack,
            user_stack: None,
            privilege: PrivilegeLevel::Kernel,
            address_space,
            resident_queue: ResidentQueue::new(),
            swap_table: SwapTable::with_heap_backing(),
            size: 0,
            stack_size: 0,
            stack_growing: false,
            killed: None,
            files: FileDescriptorTable::new_with_stdio(),
            trapframe: None,
            priority: 0,
            name: [0; 32],
        }
    }

    /// Crea un proceso de user space (Ring 3) a partir del resultado de
    /// `memory::exec::exec_install`. The trapframe is primed to resume at
    /// the installed entry point with the argv-laden stack pointer `exec`
    /// built; the saved `Context` points at the kernel-side trampoline that
    /// performs the first IRETQ into user mode.
    pub fn new_user(pid: Pid, exec: ExecResult, kernel_stack: VirtAddr) -> Self {
        let (user_cs, user_ss) = tss::get_user_selectors();
        let trapframe = TrapFrame::new_user(
            exec.entry.as_u64(),
            exec.stack_pointer.as_u64(),
            user_cs.0 as u64,
            user_ss.0 as u64,
        );

        Self {
            pid,
            state: ProcessState::Ready,
            context: Context::new_user(exec.entry, kernel_stack, exec.stack_pointer),
            kernel_stack,
            user_stack: Some(exec.stack_pointer),
            privilege: PrivilegeLevel::User,
            address_space: exec.space,
            resident_queue: exec.queue,
            swap_table: exec.swap,
            size: exec.size,
            stack_size: exec.stack_size,
            stack_growing: false,
            killed: None,
            files: FileDescriptorTable::new_with_stdio(),
            trapframe: Some(Box::new(trapframe)),
            priority: 5,
            name: [0; 32],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(31);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }
}

/// Allocate a fresh kernel stack (one page) from the buddy allocator.
/// Shared by initial process creation (`init::processes`) and `fork`,
/// which both need a kernel stack for a brand-new `Process`.
pub fn allocate_kernel_stack() -> VirtAddr {
    let phys_addr = unsafe {
        crate::allocator::buddy_allocator::BUDDY.lock()
            .allocate(14)
            .expect("Failed to allocate kernel stack from buddy")
    };

    let virt_addr = crate::memory::physical_memory_offset() + phys_addr.as_u64();
    VirtAddr::new(virt_addr.as_u64() + 4096)
}

/// Yield CPU para permitir context switch
pub fn yield_cpu() {
    use context::switch_context;

    let switch_info = {
        let mut scheduler = scheduler::SCHEDULER.lock();
        scheduler.switch_to_next()
    };

    if let Some((old_ctx, new_ctx)) = switch_info {
        unsafe {
            switch_context(old_ctx, new_ctx);
        }
    }
}

/// Función de prueba que ejecuta en Ring 3
#[no_mangle]
pub extern "C" fn user_test_function() -> ! {
    // Obtener PID
    let pid = userspace::sys_getpid();

    // Mensaje de prueba
    let msg = b"Hello from userspace! PID=";
    userspace::sys_write(1, msg.as_ptr(), msg.len());

    if pid < 10 {
        let c = b'0' + pid as u8;
        userspace::sys_write(1, &c as *const u8, 1);
    } else {
        let tens = b'0' + (pid / 10) as u8;
        let ones = b'0' + (pid % 10) as u8;
        userspace::sys_write(1, &tens as *const u8, 1);
        userspace::sys_write(1, &ones as *const u8, 1);
    }

    let newline = b"\n";
    userspace::sys_write(1, newline.as_ptr(), newline.len());

    userspace::sys_exit(0);
}
