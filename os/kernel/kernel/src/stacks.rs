use crate::{Fatal, Memory};
use kernel_alloc::VmmError;
use kernel_info::memory::PAGE_SIZE;
use kernel_sched::{Stack, StackAllocator};
use kernel_sync::{Cpu, InterruptControl};
use kernel_vmem::{Mmu, PhysMapper, align_up};

/// Kernel thread stacks carved out of the VMM heap.
///
/// Stack pages are committed up front: a stack that faulted itself in would
/// need the fault handler to run on the very page it is about to create.
/// Released stacks give their frames back but keep their virtual range,
/// since the heap cursor never moves down.
pub struct KernelStacks<M: PhysMapper + 'static, U: Mmu + 'static> {
    memory: &'static Memory<M, U>,
}

impl<M: PhysMapper, U: Mmu> KernelStacks<M, U> {
    #[must_use]
    pub const fn new(memory: &'static Memory<M, U>) -> Self {
        Self { memory }
    }
}

impl<M: PhysMapper, U: Mmu> StackAllocator for KernelStacks<M, U> {
    fn allocate<I: InterruptControl>(&self, cpu: &Cpu<I>, size: u64) -> Option<Stack> {
        let size = align_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let committed = self.memory.with(cpu, |vmm| {
            let base = vmm
                .alloc(size)?
                .ok_or(VmmError::OutOfVirtualSpace { requested: size })?;
            for offset in (0..size).step_by(PAGE_SIZE as usize) {
                vmm.commit(base + offset)?;
            }
            Ok::<_, VmmError>(base)
        });

        match committed.and_then(|base| base.map_err(Fatal::from)) {
            Ok(base) => Some(Stack::new(base, size)),
            Err(error) => {
                log::error!("no stack of {size:#x} bytes: {error}");
                None
            }
        }
    }

    fn release<I: InterruptControl>(&self, cpu: &Cpu<I>, stack: Stack) {
        let released = self
            .memory
            .with(cpu, |vmm| vmm.release(stack.base(), stack.size()))
            .and_then(|done| done.map_err(Fatal::from));
        match released {
            Ok(()) => log::debug!("released stack at {}", stack.base()),
            Err(error) => log::error!("leaking stack at {}: {error}", stack.base()),
        }
    }
}
