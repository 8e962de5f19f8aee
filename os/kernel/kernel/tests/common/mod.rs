//! A hosted kernel: simulated RAM behind the memory managers, std threads
//! behind the scheduler and a PIC that only takes notes.

#![allow(dead_code)]

use kernel::{Arch, IrqController, Kernel, KernelStacks, Memory};
use kernel_info::boot::{BootInfo, KernelImage, MemoryMap, MemoryType};
use kernel_info::memory::PagingMode;
use kernel_sched::Scheduler;
use kernel_sched::hosted::HostedPlatform;
use kernel_vmem::testing::{BumpFrames, RecordingMmu, SimulatedRam};
use kernel_vmem::{FrameAlloc, PhysicalAddress};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub const KERNEL_START: u64 = 0x10_0000;
pub const FREE_START: u64 = 0x14_0000;
pub const FREE_END: u64 = 0x40_0000;

pub struct Hosted;

impl Arch for Hosted {
    type Platform = HostedPlatform;
    type Mapper = SimulatedRam;
    type Mmu = RecordingMmu;
    type Irq = RecordingPic;
}

pub type HostedKernel = Kernel<Hosted>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PicEvent {
    Mask(u8),
    Unmask(u8),
    Eoi(u8),
}

#[derive(Default)]
pub struct RecordingPic {
    events: Mutex<Vec<PicEvent>>,
    spurious: AtomicBool,
}

impl RecordingPic {
    pub fn take_events(&self) -> Vec<PicEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Report every following IRQ 7 or 15 as spurious.
    pub fn raise_spurious(&self) {
        self.spurious.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: PicEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl IrqController for RecordingPic {
    fn is_spurious(&self, irq: u8) -> bool {
        matches!(irq, 7 | 15) && self.spurious.load(Ordering::SeqCst)
    }

    fn mask(&self, irq: u8) {
        self.record(PicEvent::Mask(irq));
    }

    fn unmask(&self, irq: u8) {
        self.record(PicEvent::Unmask(irq));
    }

    fn end_of_interrupt(&self, irq: u8) {
        self.record(PicEvent::Eoi(irq));
    }
}

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Loader handoff for 3 MiB of RAM above the kernel image.
pub fn boot_info(mode: PagingMode) -> BootInfo {
    let mut memory_map = MemoryMap::new();
    memory_map
        .add(KERNEL_START, FREE_END, MemoryType::Available)
        .unwrap();
    BootInfo {
        memory_map,
        kernel_image: KernelImage {
            start: PhysicalAddress::new(KERNEL_START),
            end: PhysicalAddress::new(FREE_START),
        },
        paging_mode: mode,
        physical_offset: 0,
    }
}

/// Root table the loader leaves in CR3.
pub fn loader_root() -> PhysicalAddress {
    BumpFrames::new(0x1000, 0x8_0000).alloc_frame().unwrap()
}

/// A booted kernel whose caller is the boot thread.
pub fn boot(mode: PagingMode) -> &'static HostedKernel {
    boot_on::<Hosted>(mode, leak(RecordingMmu::new(loader_root())))
}

/// Like [`boot`], with a paging unit of the test's choosing.
pub fn boot_on<A>(mode: PagingMode, mmu: &'static A::Mmu) -> &'static Kernel<A>
where
    A: Arch<Platform = HostedPlatform, Mapper = SimulatedRam, Irq = RecordingPic>,
{
    let ram = leak(SimulatedRam::new());
    for page in (FREE_START..FREE_END).step_by(4096) {
        ram.fill(PhysicalAddress::new(page), 0xFF);
    }

    let memory = leak(Memory::new());
    let scheduler = leak(Scheduler::new(HostedPlatform::new(), KernelStacks::new(memory)));
    let kernel = leak(Kernel::new(memory, scheduler, RecordingPic::default()));
    kernel.boot(&boot_info(mode), ram, mmu).unwrap();
    kernel
}

/// Pass a `'static` reference through a thread's context word.
pub fn word<T>(value: &'static T) -> usize {
    std::ptr::from_ref(value).expose_provenance()
}

/// # Safety
/// `word` came from [`word`] with the same `T`.
pub unsafe fn unword<T>(word: usize) -> &'static T {
    unsafe { &*std::ptr::with_exposed_provenance::<T>(word) }
}
