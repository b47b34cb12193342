// kernel/src/process/scheduler.rs

use alloc::collections::VecDeque;
use alloc::boxed::Box;
use spin::Mutex;

use super::{Process, Pid, ProcessState};
use super::context::Context;
use super::trapframe::TrapFrame;

pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

pub struct Scheduler {
    pub processes: VecDeque<Box<Process>>,
    pub current: Option<Pid>,
    next_pid: usize,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            processes: VecDeque::new(),
            current: None,
            next_pid: 1,
        }
    }

    /// Crea un nuevo PID
    pub fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Agrega un proceso a la cola de ready
    pub fn add_process(&mut self, mut process: Box<Process>) {
        process.state = ProcessState::Ready;
        crate::serial_println!("Scheduler: Added process PID {}", process.pid.0);
        self.processes.push_back(process);
    }

    /// Obtiene el proceso actual
    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    /// Mutable reference to the currently running process, if any.
    pub fn current_process(&mut self) -> Option<&mut Process> {
        let pid = self.current?;
        self.processes.iter_mut().find(|p| p.pid == pid).map(|b| &mut **b)
    }

    /// Iterate over every process the scheduler knows about, regardless of
    /// state. Used by debug tooling (`init::processes::debug_file_descriptors`)
    /// and anything else that needs a full census rather than "the current one".
    pub fn iter_all(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter().map(|b| &**b)
    }

    /// Scheduler round-robin: elige el siguiente proceso
    pub fn schedule(&mut self) -> Option<&mut Process> {
        if self.processes.is_empty() {
            return None;
        }

        // Mover el proceso actual al final (si existe)
        if let Some(current_pid) = self.current {
            if let Some(idx) = self.processes.iter().position(|p| p.pid == current_pid) {
                if let Some(mut proc) = self.processes.remove(idx) {
                    if proc.state == ProcessState::Running {
                        proc.state = ProcessState::Ready;
                    }
                    self.processes.push_back(proc);
                }
            }
        }

        // Tomar el siguiente proceso ready
        while let Some(mut proc) = self.processes.pop_front() {
            if proc.state == ProcessState::Ready {
                proc.state = ProcessState::Running;
                self.current = Some(proc.pid);

                self.processes.push_back(proc);

                return self.processes.back_mut().map(|b| &mut **b);
            } else {
                self.processes.push_back(proc);
            }
        }

        None
    }

    /// Hace context switch y retorna (proceso_anterior, proceso_siguiente).
    /// Retorna None si no hay cambio de contexto necesario.
    pub fn switch_to_next(&mut self) -> Option<(*mut Context, *const Context)> {
        if self.processes.is_empty() {
            return None;
        }

        let old_pid = self.current;

        if let Some(current_pid) = self.current {
            if let Some(idx) = self.processes.iter().position(|p| p.pid == current_pid) {
                if let Some(mut proc) = self.processes.remove(idx) {
                    if proc.state == ProcessState::Running {
                        proc.state = ProcessState::Ready;
                    }
                    self.processes.push_back(proc);
                }
            }
        }

        let mut rotations = 0;
        let len = self.processes.len();

        while rotations < len {
            if let Some(proc) = self.processes.front_mut() {
                if proc.state == ProcessState::Ready {
                    proc.state = ProcessState::Running;
                    let next_pid = proc.pid;
                    self.current = Some(next_pid);

                    if old_pid == Some(next_pid) {
                        return None;
                    }

                    unsafe { proc.address_space.activate() };
                    unsafe { super::tss::set_kernel_stack(proc.kernel_stack) };

                    let new_ctx = &proc.context as *const Context;

                    if let Some(old_pid) = old_pid {
                        if let Some(old_proc) = self.processes.iter_mut()
                            .find(|p| p.pid == old_pid)
                        {
                            let old_ctx = &mut old_proc.context as *mut Context;

                            crate::serial_println!(
                                "Context switch: {} -> {}",
                                old_pid.0,
                                next_pid.0
                            );

                            return Some((old_ctx, new_ctx));
                        }
                    }

                    return None;
                }
            }

            if let Some(proc) = self.processes.pop_front() {
                self.processes.push_back(proc);
            }
            rotations += 1;
        }

        None
    }

    /// Marca el proceso actual como bloqueado (sleeping)
    pub fn block_current(&mut self) {
        if let Some(current_pid) = self.current {
            if let Some(proc) = self.processes.iter_mut().find(|p| p.pid == current_pid) {
                proc.state = ProcessState::Sleeping;
            }
        }
    }

    /// Desbloquea un proceso
    pub fn unblock(&mut self, pid: Pid) {
        if let Some(proc) = self.processes.iter_mut().find(|p| p.pid == pid) {
            if proc.state == ProcessState::Sleeping {
                proc.state = ProcessState::Ready;
            }
        }
    }

    /// Mark the current process as killed, tear down its memory, and find
    /// the next runnable *user* process to resume via `iretq`. Called from
    /// exception handlers that catch a fault in ring 3 — the caller
    /// overwrites its `ExceptionStackFrame` with the returned frame's fields
    /// so the hardware `iretq` lands on whatever this picks.
    ///
    /// Kernel processes (idle, shell) never run on the `iretq`-from-trap
    /// path, so they're skipped when looking for the next process; if none
    /// is ready this panics; a teaching kernel with no other runnable user
    /// process has nothing sensible left to resume into.
    pub fn kill_and_switch(&mut self, reason: &'static str) -> TrapFrame {
        if let Some(current_pid) = self.current {
            if let Some(idx) = self.processes.iter().position(|p| p.pid == current_pid) {
                if let Some(mut dying) = self.processes.remove(idx) {
                    dying.state = ProcessState::Zombie;
                    dying.killed = Some(reason);
                    crate::serial_println!(
                        "Scheduler: killed PID {} ({}): {}",
                        dying.pid.0, dying.name_str(), reason
                    );
                }
            }
        }

        let len = self.processes.len();
        for _ in 0..len {
            if let Some(mut proc) = self.processes.pop_front() {
                if proc.state == ProcessState::Ready && proc.privilege == super::PrivilegeLevel::User {
                    proc.state = ProcessState::Running;
                    self.current = Some(proc.pid);
                    unsafe { proc.address_space.activate() };
                    unsafe { super::tss::set_kernel_stack(proc.kernel_stack) };
                    let tf = *proc.trapframe.as_ref()
                        .expect("user process scheduled without a trapframe");
                    self.processes.push_back(proc);
                    return tf;
                }
                self.processes.push_back(proc);
            }
        }

        panic!("kill_and_switch: no user process left to resume");
    }
}
