// =============================================================================
// MinimalOS NextGen — Context Switch
// =============================================================================
//
// The callee-saved register layout and the raw `context_switch_asm` stub
// below are carried over unchanged from the teacher's process model: push
// the six callee-saved GPRs plus the return address onto the outgoing
// task's stack, swap RSP, pop the same six registers from the incoming
// task's stack, `ret`. What changed is what the stack swap resumes
// *into* — here it's always `task_entry_trampoline`, which branches on
// whether the task is a kernel or user task (spec.md §4.6 doesn't split
// `init_task` into two cases, so the branch lives in the trampoline
// instead of at stack-preparation time).
// =============================================================================

use core::arch::global_asm;

use crate::memory::mapper::Mapper;
use crate::task::scheduler;
use crate::task::usermode::{self, IretqFrame};

/// Ring-3 code/stack selectors, matching the GDT layout the teacher's
/// usermode jump already assumes (`usermode::jump_to_ring3`'s callers).
const USER_CODE_SELECTOR: u16 = 0x23;
const USER_DATA_SELECTOR: u16 = 0x1b;

/// Callee-saved register context `context_switch_asm` pushes/pops.
/// Layout must match the push/pop order in the assembly below.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

global_asm!(
    ".global context_switch_asm",
    "context_switch_asm:",
    // rdi = &mut old_stack_pointer, rsi = new_stack_pointer
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn context_switch_asm(old_rsp_ptr: *mut u64, new_rsp: u64);
}

/// Swaps the current kernel stack for `new_rsp`, saving the outgoing
/// stack pointer through `old_rsp_ptr` first.
///
/// # Safety
/// Both stack pointers must address live, correctly laid-out kernel
/// stacks prepared by `prepare_initial_stack` (or a prior switch).
pub unsafe fn context_switch(old_rsp_ptr: *mut u64, new_rsp: u64) {
    unsafe { context_switch_asm(old_rsp_ptr, new_rsp) };
}

/// Lays down an initial `Context` at the top of a fresh stack so that the
/// first `context_switch` into it `ret`s into `trampoline`.
pub fn prepare_initial_stack(stack_top: u64, trampoline: u64) -> u64 {
    let sp = stack_top - 7 * 8;
    // SAFETY: `stack_top` is the top of a stack at least 7 words deep
    // (every task stack is `STACK_SIZE_WORDS` words, far larger).
    unsafe {
        let ptr = sp as *mut u64;
        ptr.add(0).write(0); // r15
        ptr.add(1).write(0); // r14
        ptr.add(2).write(0); // r13
        ptr.add(3).write(0); // r12
        ptr.add(4).write(0); // rbx
        ptr.add(5).write(0); // rbp
        ptr.add(6).write(trampoline); // rip (ret target)
    }
    sp
}

/// Where every task's kernel stack `ret`s into on its first switch-in.
/// Reads the entry point and (for user tasks) the user stack pointer off
/// the now-current task and either calls straight into kernel code or
/// drops to ring 3.
///
/// Monomorphized per concrete `Mapper`, since the kernel only ever runs
/// one mapper implementation at a time; taking its address as a raw
/// `u64` for `prepare_initial_stack` is ordinary function-pointer use.
pub extern "C" fn task_entry_trampoline<M: Mapper>() -> ! {
    let (entry, kernel, user_rsp) = scheduler::current_entry_info::<M>();

    if kernel {
        // SAFETY: `entry` was supplied by `Task::create` as a kernel
        // function pointer of this exact signature.
        let f: extern "C" fn() -> ! = unsafe { core::mem::transmute(entry as usize) };
        f()
    } else {
        let user_rsp = user_rsp.expect("user task without a user stack pointer");
        let frame = IretqFrame::new(entry, USER_CODE_SELECTOR, USER_DATA_SELECTOR, user_rsp);
        unsafe { usermode::jump_to_ring3(&frame) }
    }
}
