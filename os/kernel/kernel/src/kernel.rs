use crate::interrupts::{
    Handler, InterruptContext, InterruptTable, IrqController, PAGE_FAULT_VECTOR, TIMER_VECTOR,
};
use crate::services::Services;
use crate::{Fatal, KernelStacks, Memory};
use kernel_alloc::{Pmm, Vmm};
use kernel_info::boot::BootInfo;
use kernel_sched::{Platform, Scheduler, ThreadId};
use kernel_sync::{Cpu, InterruptControl};
use kernel_vmem::{Mmu, PageFaultError, PhysMapper, VirtualAddress};

/// Everything that differs between the real machine and a hosted test.
pub trait Arch: Sized + 'static {
    type Platform: Platform;
    type Mapper: PhysMapper + 'static;
    type Mmu: Mmu + 'static;
    type Irq: IrqController + Sync;
}

pub type KernelScheduler<A> = Scheduler<
    <A as Arch>::Platform,
    KernelStacks<<A as Arch>::Mapper, <A as Arch>::Mmu>,
>;

/// The kernel context.
///
/// Lives in a `static` (or is leaked) so that interrupt handlers and newly
/// started threads can reach it.
pub struct Kernel<A: Arch> {
    memory: &'static Memory<A::Mapper, A::Mmu>,
    scheduler: &'static KernelScheduler<A>,
    interrupts: InterruptTable<Self>,
    irq: A::Irq,
    pub(crate) services: Services,
}

impl<A: Arch> Kernel<A> {
    #[must_use]
    pub const fn new(
        memory: &'static Memory<A::Mapper, A::Mmu>,
        scheduler: &'static KernelScheduler<A>,
        irq: A::Irq,
    ) -> Self {
        Self {
            memory,
            scheduler,
            interrupts: InterruptTable::new(),
            irq,
            services: Services::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &'static Memory<A::Mapper, A::Mmu> {
        self.memory
    }

    #[inline]
    #[must_use]
    pub const fn scheduler(&self) -> &'static KernelScheduler<A> {
        self.scheduler
    }

    #[inline]
    #[must_use]
    pub const fn interrupts(&self) -> &InterruptTable<Self> {
        &self.interrupts
    }

    #[inline]
    #[must_use]
    pub const fn irq(&self) -> &A::Irq {
        &self.irq
    }

    #[inline]
    #[must_use]
    pub fn cpu(&self) -> &Cpu<<A::Platform as Platform>::Interrupts> {
        self.scheduler.cpu()
    }

    /// Bring up memory management from the boot handoff, then [`start`](Self::start).
    ///
    /// # Errors
    /// No usable memory, physical exhaustion while taking over the page
    /// tables, or anything [`start`](Self::start) fails with.
    pub fn boot(
        &self,
        boot: &BootInfo,
        mapper: &'static A::Mapper,
        mmu: &'static A::Mmu,
    ) -> Result<ThreadId, Fatal> {
        let mut pmm = Pmm::new();
        pmm.init(boot)?;
        let vmm = Vmm::init(pmm, mapper, mmu)?;
        self.start(vmm)
    }

    /// Take over `vmm`, install the page-fault and timer handlers and adopt
    /// the running code as the first thread.
    ///
    /// Interrupts are not touched; the caller enables them once the
    /// hardware is programmed.
    ///
    /// # Errors
    /// A handler is already installed, or the scheduler was started before.
    pub fn start(&self, vmm: Vmm<'static, A::Mapper, A::Mmu>) -> Result<ThreadId, Fatal> {
        self.memory.install(vmm)?;

        let cpu = self.cpu();
        self.interrupts
            .register(cpu, PAGE_FAULT_VECTOR, Handler::Kernel(Self::on_page_fault))?;
        self.interrupts
            .register(cpu, TIMER_VECTOR, Handler::Kernel(Self::on_timer))?;

        let boot_thread = self.scheduler.start()?;
        if let Some(stats) = self.memory.stats(self.cpu()) {
            log::info!("kernel up as thread {boot_thread}, {stats}");
        }
        Ok(boot_thread)
    }

    /// Entry point for every interrupt and exception.
    ///
    /// # Errors
    /// See [`InterruptTable::dispatch`].
    pub fn dispatch(&self, context: &mut InterruptContext) -> Result<bool, Fatal> {
        self.interrupts
            .dispatch(self, self.cpu(), &self.irq, context)
    }

    fn on_page_fault(&self, context: &mut InterruptContext) -> Result<bool, Fatal> {
        let address = VirtualAddress::new(context.cr2);
        let error = PageFaultError::from_bits(context.error);
        self.memory
            .with(self.cpu(), |vmm| vmm.handle_page_fault(address, error))??;
        Ok(true)
    }

    fn on_timer(&self, _: &mut InterruptContext) -> Result<bool, Fatal> {
        self.scheduler.tick()?;
        Ok(true)
    }

    /// Report `fatal` and stop the machine.
    pub fn halt(&self, fatal: &Fatal) -> ! {
        log::error!("Fatal error: {fatal}");
        if let Some(stats) = self.memory.stats(self.cpu()) {
            log::error!("memory: {stats}");
        }
        self.cpu().interrupts().disable();
        self.scheduler.platform().halt()
    }
}
