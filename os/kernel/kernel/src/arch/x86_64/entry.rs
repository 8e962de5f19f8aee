//! Bare-metal entry: the kernel statics, the interrupt stubs and
//! [`kernel_main`], which the loader jumps to with interrupts disabled.
//!
//! Each of the 256 stubs is 16 bytes long and pushes a zero error code
//! (unless the CPU already pushed one) and its vector number before joining
//! `isr_common`, which completes an [`InterruptContext`] on the stack:
//!
//! ```text
//!   ss, rsp, rflags, cs, rip     pushed by the CPU
//!   error code, vector           pushed by the stub
//!   rax .. r15                   pushed by isr_common
//!   ds, es, fs, gs, cr2          pushed by isr_common
//! ```

use super::context::X86Platform;
use super::idt::Idt;
use super::mmu::X86Mmu;
use super::pic::Pic8259;
use super::{DIRECT_MAP_OFFSET, KERNEL_CS, X86, pit};
use crate::interrupts::{InterruptContext, IrqController, PIC_VECTOR_BASE, TIMER_IRQ, VECTOR_COUNT};
use crate::{Fatal, Kernel, KernelScheduler, KernelStacks, Memory};
use core::arch::global_asm;
use kernel_info::boot::BootInfo;
use kernel_info::memory::{PagingMode, TIMER_FREQUENCY_HZ};
use kernel_qemu::QemuLogger;
use kernel_sched::Scheduler;
use kernel_sync::{InterruptControl, UpCell};
use kernel_alloc::phys_mapper::OffsetPhysMapper;
use log::LevelFilter;

/// Bytes between two consecutive interrupt stubs.
const STUB_STRIDE: u64 = 16;

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
static MAPPER: OffsetPhysMapper = OffsetPhysMapper::new(DIRECT_MAP_OFFSET);
static MMU: X86Mmu = X86Mmu;
static MEMORY: Memory<OffsetPhysMapper, X86Mmu> = Memory::new();
static SCHEDULER: KernelScheduler<X86> =
    Scheduler::new(X86Platform::new(Pic8259::new()), KernelStacks::new(&MEMORY));
static KERNEL: Kernel<X86> = Kernel::new(&MEMORY, &SCHEDULER, Pic8259::new());
static IDT: UpCell<Idt> = UpCell::new(Idt::new());

unsafe extern "C" {
    /// First of the 256 interrupt stubs below.
    static isr_stubs: u8;
}

global_asm!(
    r#"
    .section .text
    .p2align 4
    .globl isr_stubs
isr_stubs:
    .set isr_vector_no, 0
    .rept 256
    .p2align 4
    .if isr_vector_no < 32
    .if (0x60227D00 >> isr_vector_no) & 1
    .else
    pushq $0
    .endif
    .else
    pushq $0
    .endif
    pushq $isr_vector_no
    jmp isr_common
    .set isr_vector_no, isr_vector_no + 1
    .endr

isr_common:
    cld
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %ds, %rax
    pushq %rax
    movq %es, %rax
    pushq %rax
    movq %fs, %rax
    pushq %rax
    movq %gs, %rax
    pushq %rax
    movq %cr2, %rax
    pushq %rax

    movq %rsp, %rdi
    subq $8, %rsp
    call {dispatch}
    addq $8, %rsp

    addq $40, %rsp
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq
"#,
    dispatch = sym interrupt_dispatch,
    options(att_syntax)
);

extern "C" fn interrupt_dispatch(context: &mut InterruptContext) {
    if let Err(fatal) = KERNEL.dispatch(context) {
        KERNEL.halt(&fatal);
    }
}

/// Kernel entry point.
///
/// # Safety
/// Called once by the loader, in ring 0 with interrupts disabled, on a
/// valid stack, with `boot` pointing at a complete [`BootInfo`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_main(boot: *const BootInfo) -> ! {
    if LOGGER.init().is_err() {
        kernel_qemu::qemu_trace!("logger already installed\n");
    }

    let boot = unsafe { &*boot };
    if let Err(fatal) = unsafe { bring_up(boot) } {
        KERNEL.halt(&fatal);
    }

    loop {
        let reaped = SCHEDULER.reap();
        if reaped > 0 {
            log::debug!("reaped {reaped} thread(s)");
        }
        if let Err(e) = SCHEDULER.yield_now() {
            KERNEL.halt(&Fatal::from(e));
        }
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

/// # Safety
/// See [`kernel_main`].
unsafe fn bring_up(boot: &BootInfo) -> Result<(), Fatal> {
    if boot.paging_mode != PagingMode::Long {
        return Err(Fatal::UnsupportedPaging(boot.paging_mode));
    }
    if boot.physical_offset != DIRECT_MAP_OFFSET {
        return Err(Fatal::DirectMapMismatch {
            found: boot.physical_offset,
            expected: DIRECT_MAP_OFFSET,
        });
    }

    let stubs = (&raw const isr_stubs).addr() as u64;
    IDT.try_with(|idt| {
        for vector in 0..VECTOR_COUNT {
            idt[vector]
                .set_handler(stubs + vector as u64 * STUB_STRIDE)
                .selector(KERNEL_CS)
                .present(true)
                .gate_interrupt();
        }
        // the table lives in a static
        unsafe { idt.load() };
    })?;

    let pic = KERNEL.irq();
    unsafe {
        pic.init(PIC_VECTOR_BASE);
        pit::start(TIMER_FREQUENCY_HZ);
    }

    KERNEL.boot(boot, &MAPPER, &MMU)?;

    pic.unmask(TIMER_IRQ);
    KERNEL.cpu().interrupts().enable();
    Ok(())
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {info}");
    loop {
        unsafe { core::arch::asm!("cli; hlt", options(nomem, nostack)) };
    }
}
