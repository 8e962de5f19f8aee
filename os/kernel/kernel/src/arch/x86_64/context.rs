//! Kernel thread contexts and the stack switch.
//!
//! A context is just the saved stack pointer. Everything else a suspended
//! thread needs sits on its own stack, pushed by [`switch_stacks`]:
//!
//! ```text
//!   context.rsp ─► r15
//!                  r14
//!                  r13
//!                  r12
//!                  rbx
//!                  rbp
//!                  return address
//! ```
//!
//! A fresh stack is primed with three frames, top down:
//!
//! ```text
//!   top ─►         FreshThread        start record, 16-byte aligned
//!                  exit_shim          where the entry function returns to
//!                  ss, rsp, rflags,   iretq frame into entry_shim with
//!                  cs, rip            interrupts enabled
//!   context.rsp ─► switch frame       r12 = entry, r13 = arg,
//!                                     r14 = &FreshThread, ret = trampoline
//! ```
//!
//! The trampoline releases the scheduler lock handed over by the switch,
//! then `iretq`s into the entry function.

use super::pic::Pic8259;
use crate::interrupts::{IrqController, TIMER_IRQ};
use core::arch::naked_asm;
use kernel_sched::{Platform, Stack, ThreadStart};
use kernel_sync::irq::X86Interrupts;
use kernel_sync::{Cpu, InterruptControl};

/// Callee-saved registers plus the return address.
const SWITCH_FRAME_WORDS: usize = 7;

/// `rip`, `cs`, `rflags`, `rsp`, `ss`.
const IRET_FRAME_WORDS: usize = 5;

#[allow(clippy::cast_lossless)]
const KERNEL_CS: u64 = super::KERNEL_CS as u64;
const KERNEL_SS: u64 = 0x10;

/// IF set, plus the always-one bit 1.
const RFLAGS_ENTRY: u64 = 0x202;

/// Saved state of a thread that is not on the CPU.
#[repr(C)]
#[derive(Debug)]
pub struct X86Context {
    rsp: u64,
}

/// What the trampoline of a never-run thread picks up from its stack.
struct FreshThread {
    start: ThreadStart,
    platform: &'static X86Platform,
}

pub struct X86Platform {
    cpu: Cpu<X86Interrupts>,
    pic: Pic8259,
}

impl X86Platform {
    #[must_use]
    pub const fn new(pic: Pic8259) -> Self {
        Self {
            cpu: Cpu::new(X86Interrupts),
            pic,
        }
    }
}

impl Platform for X86Platform {
    type Context = X86Context;
    type Interrupts = X86Interrupts;

    fn cpu(&self) -> &Cpu<X86Interrupts> {
        &self.cpu
    }

    fn bootstrap_context(&self) -> X86Context {
        // filled in by the first switch away from the boot thread
        X86Context { rsp: 0 }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn prime_new_stack(&'static self, stack: &Stack, start: ThreadStart) -> X86Context {
        // the start record sits above everything the entry function pushes
        let fresh = (stack.top().as_u64() - size_of::<FreshThread>() as u64) & !0xF;
        let exit_slot = fresh - 8;
        let iret = exit_slot - (IRET_FRAME_WORDS * 8) as u64;
        let frame = iret - (SWITCH_FRAME_WORDS * 8) as u64;

        let iret_frame: [u64; IRET_FRAME_WORDS] = [
            entry_shim as usize as u64,
            KERNEL_CS,
            RFLAGS_ENTRY,
            exit_slot,
            KERNEL_SS,
        ];
        let switch_frame: [u64; SWITCH_FRAME_WORDS] = [
            0,                              // r15
            fresh,                          // r14
            start.arg() as u64,             // r13
            start.entry() as usize as u64,  // r12
            0,                              // rbx
            0,                              // rbp
            thread_trampoline as usize as u64,
        ];

        unsafe {
            core::ptr::with_exposed_provenance_mut::<u64>(exit_slot as usize)
                .write(exit_shim as usize as u64);
            core::ptr::with_exposed_provenance_mut::<FreshThread>(fresh as usize).write(FreshThread {
                start,
                platform: self,
            });
            core::ptr::with_exposed_provenance_mut::<[u64; IRET_FRAME_WORDS]>(iret as usize)
                .write(iret_frame);
            core::ptr::with_exposed_provenance_mut::<[u64; SWITCH_FRAME_WORDS]>(frame as usize)
                .write(switch_frame);
        }

        X86Context { rsp: frame }
    }

    unsafe fn switch(&self, from: *mut X86Context, to: *const X86Context) {
        unsafe { switch_stacks(from, to) }
    }

    unsafe fn switch_final(&self, to: *const X86Context) -> ! {
        unsafe { resume_stack(to) }
    }

    fn halt(&self) -> ! {
        loop {
            self.cpu.interrupts().disable();
            unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
        }
    }
}

/// Save the callee-saved registers of the running thread on its stack,
/// store the stack pointer in `from` and return on the stack of `to`.
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(from: *mut X86Context, to: *const X86Context) {
    naked_asm!(
        "push rbp", "push rbx", "push r12", "push r13", "push r14", "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop rbx", "pop rbp",
        "ret",
    )
}

/// Like [`switch_stacks`] without saving anything.
#[unsafe(naked)]
unsafe extern "C" fn resume_stack(to: *const X86Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi]",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop rbx", "pop rbp",
        "ret",
    )
}

/// First code a new thread runs, entered through the `ret` of a switch
/// with the `iretq` frame on top of the stack.
#[unsafe(naked)]
unsafe extern "C" fn thread_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r14",
        "call {first_run}",
        "iretq",
        first_run = sym first_run,
    )
}

extern "C" fn first_run(fresh: &FreshThread) {
    // a switch out of the timer handler left the timer line masked
    fresh.platform.pic.unmask(TIMER_IRQ);
    unsafe { fresh.start.release() };
}

/// Calls `entry(arg)` as if from `exit_shim`.
#[unsafe(naked)]
unsafe extern "C" fn entry_shim() -> ! {
    naked_asm!("mov rdi, r13", "jmp r12")
}

/// Return address of every entry function.
#[unsafe(naked)]
unsafe extern "C" fn exit_shim() -> ! {
    naked_asm!(
        "mov rdi, r14",
        "call {exit}",
        "ud2",
        exit = sym thread_exit,
    )
}

extern "C" fn thread_exit(fresh: &FreshThread) -> ! {
    unsafe { fresh.start.exit() }
}
