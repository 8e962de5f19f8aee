use crate::Fatal;
use kernel_alloc::{MemoryStats, Vmm};
use kernel_sync::{Cpu, InterruptControl, UpCell};
use kernel_vmem::{Mmu, PhysMapper};

/// The kernel's one virtual memory manager, once it exists.
///
/// Empty until [`install`](Self::install). Every access after that runs
/// with interrupts disabled, so no timer tick can switch threads while the
/// page tables or the free stack are half updated. A fault taken in the
/// middle of such an update is reported as [`Fatal::Reentrant`] instead of
/// aliasing the tables.
pub struct Memory<M: PhysMapper + 'static, U: Mmu + 'static> {
    vmm: UpCell<Option<Vmm<'static, M, U>>>,
}

// Safety: there is one CPU, and `UpCell` hands out one borrow at a time to
// whatever runs on it. The mapper and MMU are only reached through the VMM.
unsafe impl<M: PhysMapper, U: Mmu> Sync for Memory<M, U> {}

impl<M: PhysMapper, U: Mmu> Memory<M, U> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vmm: UpCell::new(None),
        }
    }

    /// Hand the freshly initialized VMM over.
    ///
    /// # Errors
    /// [`Fatal::Reentrant`] if called from within [`with`](Self::with).
    pub fn install(&self, vmm: Vmm<'static, M, U>) -> Result<(), Fatal> {
        self.vmm.try_with(|slot| *slot = Some(vmm))?;
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.vmm.try_with(|slot| slot.is_some()).unwrap_or(true)
    }

    /// Run `f` with exclusive access to the VMM and interrupts off on `cpu`.
    ///
    /// # Errors
    /// [`Fatal::NotInitialized`] before [`install`](Self::install),
    /// [`Fatal::Reentrant`] when nested.
    pub fn with<I: InterruptControl, R>(
        &self,
        cpu: &Cpu<I>,
        f: impl FnOnce(&mut Vmm<'static, M, U>) -> R,
    ) -> Result<R, Fatal> {
        cpu.push_off();
        let result = self.vmm.try_with(|slot| slot.as_mut().map(f));
        cpu.pop_off();
        result?.ok_or(Fatal::NotInitialized)
    }

    /// Current page counters, if they can be read right now.
    #[must_use]
    pub fn stats<I: InterruptControl>(&self, cpu: &Cpu<I>) -> Option<MemoryStats> {
        self.with(cpu, |vmm| vmm.stats()).ok()
    }
}

impl<M: PhysMapper, U: Mmu> Default for Memory<M, U> {
    fn default() -> Self {
        Self::new()
    }
}
