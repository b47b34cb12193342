// kernel/src/process/syscall.rs

use core::arch::global_asm;
use x86_64::VirtAddr;

// ✅ Assembly correcto que preserva TODOS los registros
global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
    
    // Guardar TODOS los registros
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    
    // Ahora RSP apunta al principio del bloque guardado
    // Pasar RSP como único argumento (puntero a los registros)
    "mov rdi, rsp",
    "call syscall_handler_asm",
    
    // RAX tiene el resultado, lo guardamos en el stack
    "mov [rsp], rax",  // Sobreescribir el RAX guardado con el resultado
    
    // Restaurar registros
    "pop rax",         // Este es el resultado ahora
    "pop rbx",
    "pop rcx",
    "pop rdx",
    "pop rsi",
    "pop rdi",
    "pop rbp",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    
    "iretq",
);

// ✅ Estructura que representa los registros guardados
#[repr(C)]
struct SavedRegisters {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
}

/// The CPU pushes this frame automatically before `syscall_entry` runs,
/// directly above the manually-pushed `SavedRegisters` block (the stack
/// grows down, so these five words sit at higher addresses than `rax`).
/// `fork` reads it to learn where the parent was about to resume; `execve`
/// rewrites it so the same `iretq` in `syscall_entry` lands in the new
/// program instead of back into the caller.
#[repr(C)]
struct IretqFrame {
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

impl SavedRegisters {
    /// # Safety
    /// Only valid while called from `syscall_handler_asm` with `self`
    /// pointing at the live `syscall_entry` stack frame.
    unsafe fn iretq_frame(&self) -> &IretqFrame {
        &*(self as *const Self).cast::<u8>()
            .add(core::mem::size_of::<Self>())
            .cast::<IretqFrame>()
    }

    /// # Safety
    /// Same as `iretq_frame`; the caller must not hold this past the
    /// `iretq` that consumes it.
    unsafe fn iretq_frame_mut(&mut self) -> &mut IretqFrame {
        &mut *(self as *mut Self).cast::<u8>()
            .add(core::mem::size_of::<Self>())
            .cast::<IretqFrame>()
    }
}

// ✅ Wrapper que lee los registros del stack
#[no_mangle]
extern "C" fn syscall_handler_asm(regs: &mut SavedRegisters) -> i64 {
    let (rax, rdi, rsi, rdx, r10, r8, r9) =
        (regs.rax, regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9);
    syscall_handler(rax, rdi, rsi, rdx, r10, r8, r9, regs)
}

/// Números de syscall compatibles con Linux x86_64
#[derive(Debug, Clone, Copy)]
#[repr(u64)]
pub enum SyscallNumber {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Brk = 12,
    Fork = 57,
    Execve = 59,
    Exit = 60,
    GetPid = 39,
}

impl SyscallNumber {
    pub fn from_u64(n: u64) -> Option<Self> {
        match n {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Open),
            3 => Some(Self::Close),
            12 => Some(Self::Brk),
            39 => Some(Self::GetPid),
            57 => Some(Self::Fork),
            59 => Some(Self::Execve),
            60 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Resultado de una syscall
pub type SyscallResult = i64;

/// Códigos de error compatibles con Linux (negados)
#[allow(dead_code)]
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const ESRCH: i64 = -3;
    pub const EINTR: i64 = -4;
    pub const EIO: i64 = -5;
    pub const ENXIO: i64 = -6;
    pub const EBADF: i64 = -9;
    pub const ENOMEM: i64 = -12;
    pub const EACCES: i64 = -13;
    pub const EFAULT: i64 = -14;
    pub const ENOTBLK: i64 = -15;
    pub const EBUSY: i64 = -16;
    pub const EEXIST: i64 = -17;
    pub const EINVAL: i64 = -22;
    pub const ENOSYS: i64 = -38;
}

/// Handler principal de syscalls
pub fn syscall_handler(
    syscall_num: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
    frame: &mut SavedRegisters,
) -> SyscallResult {
    crate::serial_println!(
        "SYSCALL: num={}, args=({:#x}, {:#x}, {:#x})",
        syscall_num, arg1, arg2, arg3
    );

    let syscall = match SyscallNumber::from_u64(syscall_num) {
        Some(s) => s,
        None => {
            crate::serial_println!("  Unknown syscall: {}", syscall_num);
            return errno::ENOSYS;
        }
    };

    match syscall {
        SyscallNumber::Write => sys_write(arg1 as i32, arg2 as usize, arg3 as usize),
        SyscallNumber::Read => sys_read(arg1 as i32, arg2 as usize, arg3 as usize),
        SyscallNumber::Exit => sys_exit(arg1 as i32),
        SyscallNumber::GetPid => sys_getpid(),
        SyscallNumber::Open => errno::ENOSYS,
        SyscallNumber::Close => errno::ENOSYS,
        SyscallNumber::Brk => sys_brk(arg1 as i64),
        SyscallNumber::Fork => sys_fork(frame),
        SyscallNumber::Execve => sys_execve(arg1, arg2, frame),
    }
}

/// sys_write(fd, buf, count)
fn sys_write(fd: i32, buf: usize, count: usize) -> SyscallResult {
    crate::serial_println!("  sys_write(fd={}, buf={:#x}, count={})", fd, buf, count);

    if fd != 1 && fd != 2 {
        return errno::EBADF;
    }

    if buf == 0 {
        return errno::EFAULT;
    }

    let slice = unsafe {
        core::slice::from_raw_parts(buf as *const u8, count)
    };

    for &byte in slice {
        unsafe {
            let mut port = x86_64::instructions::port::Port::<u8>::new(0x3F8);
            port.write(byte);
        }
    }

    count as SyscallResult
}

/// sys_read(fd, buf, count)
fn sys_read(_fd: i32, _buf: usize, _count: usize) -> SyscallResult {
    errno::ENOSYS
}

/// sys_exit(status)
fn sys_exit(status: i32) -> SyscallResult {
    crate::serial_println!("  sys_exit(status={})", status);
    
    {
        let mut scheduler = super::scheduler::SCHEDULER.lock();
        
        for proc in scheduler.processes.iter_mut() {
            if proc.state == super::ProcessState::Running {
                proc.state = super::ProcessState::Zombie;
                crate::serial_println!("  Process PID {} exited with status {}", proc.pid.0, status);
                break;
            }
        }
    }
    
    // ✅ FIX: Hacer yield manualmente en lugar de llamar a yield_cpu()
    loop {
        use super::context::switch_context;
        
        let switch_info = {
            let mut scheduler = super::scheduler::SCHEDULER.lock();
            scheduler.switch_to_next()
        };
        
        if let Some((old_ctx, new_ctx)) = switch_info {
            unsafe {
                switch_context(old_ctx, new_ctx);
            }
        }
    }
}

/// sys_getpid()
fn sys_getpid() -> SyscallResult {
    let scheduler = super::scheduler::SCHEDULER.lock();

    if let Some(pid) = scheduler.current {
        crate::serial_println!("  sys_getpid() -> {}", pid.0);
        pid.0 as SyscallResult
    } else {
        0
    }
}

/// sys_brk(increment) — grow or shrink the current process's heap image by
/// `increment` bytes, xv6-style: returns the *previous* break, not the new
/// one.
fn sys_brk(increment: i64) -> SyscallResult {
    use crate::memory::user_image;

    let mut scheduler = super::scheduler::SCHEDULER.lock();
    let proc = match scheduler.current_process() {
        Some(p) => p,
        None => return errno::ESRCH,
    };

    let old_size = proc.size;
    let new_size = if increment >= 0 {
        old_size + increment as u64
    } else {
        old_size.saturating_sub((-increment) as u64)
    };

    let result = if new_size > old_size {
        user_image::grow(
            &proc.address_space,
            &mut proc.resident_queue,
            &mut proc.swap_table,
            old_size,
            new_size,
            proc.stack_size,
        )
    } else {
        user_image::shrink(
            &proc.address_space,
            &mut proc.resident_queue,
            &mut proc.swap_table,
            old_size,
            new_size,
        )
    };

    match result {
        Ok(_) => {
            proc.size = new_size;
            old_size as SyscallResult
        }
        Err(e) => {
            crate::serial_println!("  sys_brk: {}", e);
            errno::ENOMEM
        }
    }
}

/// sys_fork() — duplicate the calling process's memory image and enqueue
/// the child as a fresh `Process`. The child's `ExecResult` is assembled by
/// hand from `fork_copy`'s output plus the parent's current `rip`/`rsp`
/// (read out of the syscall's own IRETQ frame) so it can go through
/// `Process::new_user`, the same constructor `exec` uses — no separate
/// "build a process from scratch" path needed for fork.
///
/// File descriptors are not duplicated into the child: this kernel has no
/// file system, so there is nothing behind a descriptor worth sharing.
fn sys_fork(frame: &mut SavedRegisters) -> SyscallResult {
    use crate::memory::exec::ExecResult;
    use crate::memory::fork;
    use crate::memory::swap::SwapTable;

    let (parent_rip, parent_rsp) = unsafe {
        let iretq = frame.iretq_frame();
        (iretq.rip, iretq.rsp)
    };

    let mut scheduler = super::scheduler::SCHEDULER.lock();
    let parent = match scheduler.current_process() {
        Some(p) => p,
        None => return errno::ESRCH,
    };

    let mut child_swap = SwapTable::with_heap_backing();
    let fork_result = unsafe {
        fork::fork_copy(
            &parent.address_space,
            &mut parent.swap_table,
            &mut child_swap,
            parent.size,
            parent.stack_size,
        )
    };

    let (child_space, child_queue) = match fork_result {
        Ok(pair) => pair,
        Err(e) => {
            crate::serial_println!("  sys_fork: {}", e);
            return errno::ENOMEM;
        }
    };

    // fork_copy stripped WRITABLE from the parent's own resident PTEs in
    // place; force a CR3 reload so the parent's TLB drops any stale
    // writable translations for those pages before it resumes.
    unsafe { parent.address_space.reload() };

    let parent_size = parent.size;
    let parent_stack_size = parent.stack_size;
    let parent_name = parent.name;

    let exec_result = ExecResult {
        space: child_space,
        queue: child_queue,
        swap: child_swap,
        size: parent_size,
        stack_size: parent_stack_size,
        entry: VirtAddr::new(parent_rip),
        stack_pointer: VirtAddr::new(parent_rsp),
    };

    let child_pid = scheduler.allocate_pid();
    let kernel_stack = super::allocate_kernel_stack();
    let mut child = alloc::boxed::Box::new(super::Process::new_user(child_pid, exec_result, kernel_stack));
    child.name = parent_name;

    crate::serial_println!("  sys_fork: new child PID {}", child_pid.0);
    scheduler.add_process(child);

    child_pid.0 as SyscallResult
}

/// Read a NUL-terminated string out of a raw pointer, same flat-pointer
/// assumption `sys_write`/`sys_read` already make instead of walking the
/// page table. Truncates at `max_len` rather than faulting.
unsafe fn read_c_string(ptr: *const u8, max_len: usize) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let mut len = 0;
    while len < max_len.min(buf.len()) {
        let byte = *ptr.add(len);
        if byte == 0 {
            break;
        }
        buf[len] = byte;
        len += 1;
    }
    buf
}

/// sys_execve(path, argv, frame) — replace the calling process's image in
/// place. There is no file system here, so `path` names one of the
/// embedded test programs `user_test_fileio` already serves up to
/// `init::processes` at boot; this is the same program-loader stand-in,
/// just reachable from a running process instead of only at startup.
/// `argv` beyond the program name is unused for the same reason: the
/// embedded programs don't read arguments.
///
/// Rewrites the live IRETQ frame so the `iretq` already queued up in
/// `syscall_entry` lands in the new program instead of back into the
/// caller — `execve` never returns on success.
fn sys_execve(path_ptr: u64, _argv_ptr: u64, frame: &mut SavedRegisters) -> SyscallResult {
    use crate::memory::exec;
    use crate::process::user_test_fileio;

    if path_ptr == 0 {
        return errno::EFAULT;
    }

    let name_buf = unsafe { read_c_string(path_ptr as *const u8, 31) };
    let nul = name_buf.iter().position(|&b| b == 0).unwrap_or(name_buf.len());
    let name = match core::str::from_utf8(&name_buf[..nul]) {
        Ok(s) if !s.is_empty() => s,
        _ => return errno::EFAULT,
    };

    const CODE_LOAD_ADDR: u64 = 0x0000_0000_0040_0000;
    const EMBEDDED_TEST_CODE_SIZE: usize = 4096;

    let code_ptr = user_test_fileio::get_test_ptr(name);
    let program = unsafe { core::slice::from_raw_parts(code_ptr, EMBEDDED_TEST_CODE_SIZE) };

    let argv = [name];
    let exec_result = match unsafe { exec::exec_install(program, CODE_LOAD_ADDR, &argv) } {
        Ok(r) => r,
        Err(e) => {
            crate::serial_println!("  sys_execve: {}", e);
            return errno::ENOMEM;
        }
    };

    let mut scheduler = super::scheduler::SCHEDULER.lock();
    let proc = match scheduler.current_process() {
        Some(p) => p,
        None => return errno::ESRCH,
    };

    let old_space = core::mem::replace(&mut proc.address_space, exec_result.space);
    // Reload CR3 onto the new space before tearing down the old one — its
    // PML4 frame is about to be freed back to the allocator and must not
    // still be the live root when that happens.
    unsafe { proc.address_space.activate() };
    if let Err(e) = old_space.destroy() {
        crate::serial_println!("  sys_execve: failed to tear down old address space: {}", e);
    }

    proc.resident_queue = exec_result.queue;
    proc.swap_table = exec_result.swap;
    proc.size = exec_result.size;
    proc.stack_size = exec_result.stack_size;
    proc.user_stack = Some(exec_result.stack_pointer);

    unsafe {
        let iretq = frame.iretq_frame_mut();
        iretq.rip = exec_result.entry.as_u64();
        iretq.rsp = exec_result.stack_pointer.as_u64();
    }

    crate::serial_println!("  sys_execve: '{}' installed, entry={:#x}", name, exec_result.entry.as_u64());
    0
}