//! # Interrupt dispatch
//!
//! Every vector lands in one [`InterruptTable`]. The architecture's entry
//! stubs save the interrupted state as an [`InterruptContext`] and pass it to
//! [`InterruptTable::dispatch`], which
//!
//! 1. drops spurious IRQs from the legacy PIC,
//! 2. masks and acknowledges a real IRQ before the handler runs,
//! 3. calls the registered [`Handler`],
//! 4. unmasks the IRQ again.
//!
//! A handler may switch threads (the timer does). The unmask in step 4 then
//! only happens once the interrupted thread is scheduled again, so threads
//! entered for the first time unmask the timer themselves.

use crate::Fatal;
use kernel_sync::{Cpu, InterruptControl, SpinLock};

pub const VECTOR_COUNT: usize = 256;

/// Page-fault exception.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Where the PIC delivers IRQ 0.
pub const PIC_VECTOR_BASE: u8 = 32;
pub const PIC_IRQ_COUNT: u8 = 16;

/// IRQ line of the interval timer.
pub const TIMER_IRQ: u8 = 0;
pub const TIMER_VECTOR: u8 = PIC_VECTOR_BASE + TIMER_IRQ;

/// Register state saved by the interrupt entry stubs, lowest address first.
///
/// `vector` and `error` are pushed by the stubs (`error` is zero for
/// vectors without a CPU error code); `rip` through `ss` is the frame the
/// CPU pushed.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct InterruptContext {
    /// Faulting address for page faults.
    pub cr2: u64,
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<InterruptContext>() == 27 * 8);

impl InterruptContext {
    /// A context as the stubs would build it for `vector`.
    #[must_use]
    pub const fn for_vector(vector: u8) -> Self {
        let mut context = Self::ZERO;
        context.vector = vector as u64;
        context
    }

    const ZERO: Self = Self {
        cr2: 0,
        gs: 0,
        fs: 0,
        es: 0,
        ds: 0,
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: 0,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        vector: 0,
        error: 0,
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
    };

    #[must_use]
    pub const fn with_error(mut self, error: u64) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub const fn with_cr2(mut self, cr2: u64) -> Self {
        self.cr2 = cr2;
        self
    }
}

/// Interrupt routine of a driver, called with the word it was installed
/// with. Returns whether it handled the interrupt.
pub type ServiceRoutine = fn(usize) -> bool;

/// What runs for a vector. `K` is the kernel context handed to built-in
/// handlers.
pub enum Handler<K> {
    Kernel(fn(&K, &mut InterruptContext) -> Result<bool, Fatal>),
    Service {
        routine: ServiceRoutine,
        context: usize,
    },
}

impl<K> Clone for Handler<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handler<K> {}

impl<K> core::fmt::Debug for Handler<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Kernel(_) => f.write_str("Kernel"),
            Self::Service { context, .. } => {
                f.debug_struct("Service").field("context", context).finish()
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegisterError {
    #[error("vector {0} already has a handler")]
    Occupied(u8),
}

/// The legacy interrupt controller, as far as dispatch needs it.
pub trait IrqController {
    /// Whether an interrupt announced on `irq` came without a device behind it.
    fn is_spurious(&self, irq: u8) -> bool;
    fn mask(&self, irq: u8);
    fn unmask(&self, irq: u8);
    fn end_of_interrupt(&self, irq: u8);
}

impl<C: IrqController> IrqController for &C {
    fn is_spurious(&self, irq: u8) -> bool {
        (**self).is_spurious(irq)
    }

    fn mask(&self, irq: u8) {
        (**self).mask(irq);
    }

    fn unmask(&self, irq: u8) {
        (**self).unmask(irq);
    }

    fn end_of_interrupt(&self, irq: u8) {
        (**self).end_of_interrupt(irq);
    }
}

/// IRQ line behind `vector`, if it is one of the PIC's.
#[must_use]
pub const fn pic_irq(vector: u64) -> Option<u8> {
    let base = PIC_VECTOR_BASE as u64;
    if vector >= base && vector < base + PIC_IRQ_COUNT as u64 {
        #[allow(clippy::cast_possible_truncation)]
        Some((vector - base) as u8)
    } else {
        None
    }
}

/// Handler slots for all 256 vectors.
pub struct InterruptTable<K> {
    slots: SpinLock<[Option<Handler<K>>; VECTOR_COUNT]>,
}

impl<K> InterruptTable<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::new([const { None }; VECTOR_COUNT]),
        }
    }

    /// Install `handler` for `vector`.
    ///
    /// # Errors
    /// [`RegisterError::Occupied`] if the vector already has one.
    pub fn register<I: InterruptControl>(
        &self,
        cpu: &Cpu<I>,
        vector: u8,
        handler: Handler<K>,
    ) -> Result<(), RegisterError> {
        let mut slots = self.slots.lock(cpu);
        let slot = &mut slots[usize::from(vector)];
        if slot.is_some() {
            return Err(RegisterError::Occupied(vector));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Clear `vector` and return what was installed.
    pub fn unregister<I: InterruptControl>(&self, cpu: &Cpu<I>, vector: u8) -> Option<Handler<K>> {
        self.slots.lock(cpu)[usize::from(vector)].take()
    }

    #[must_use]
    pub fn handler<I: InterruptControl>(&self, cpu: &Cpu<I>, vector: u8) -> Option<Handler<K>> {
        self.slots.lock(cpu)[usize::from(vector)]
    }

    /// Run the handler for `context.vector`.
    ///
    /// The table lock is not held while the handler runs, so handlers may
    /// switch threads or change the table.
    ///
    /// # Errors
    /// [`Fatal::UnhandledInterrupt`] for a vector without handler, or
    /// whatever the handler fails with.
    pub fn dispatch<I: InterruptControl>(
        &self,
        kernel: &K,
        cpu: &Cpu<I>,
        irq: &impl IrqController,
        context: &mut InterruptContext,
    ) -> Result<bool, Fatal> {
        let line = pic_irq(context.vector);
        if let Some(line) = line {
            if irq.is_spurious(line) {
                log::trace!("spurious IRQ {line}");
                return Ok(false);
            }
            irq.mask(line);
            irq.end_of_interrupt(line);
        }

        let handler = u8::try_from(context.vector)
            .ok()
            .and_then(|vector| self.handler(cpu, vector));

        let handled = match handler {
            Some(Handler::Kernel(handler)) => handler(kernel, context),
            Some(Handler::Service { routine, context: word }) => Ok(routine(word)),
            None => Err(Fatal::UnhandledInterrupt {
                vector: context.vector,
                error: context.error,
                rip: context.rip,
            }),
        };

        if let Some(line) = line {
            irq.unmask(line);
        }
        handled
    }
}

impl<K> Default for InterruptTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Flag(AtomicBool);

    impl InterruptControl for Flag {
        fn enabled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn disable(&self) {
            self.0.store(false, Ordering::SeqCst);
        }

        fn enable(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Pic {
        spurious: Option<u8>,
        log: Mutex<Vec<String>>,
    }

    impl Pic {
        fn record(&self, what: &str, irq: u8) {
            self.log.lock().unwrap().push(format!("{what} {irq}"));
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl IrqController for Pic {
        fn is_spurious(&self, irq: u8) -> bool {
            self.spurious == Some(irq)
        }

        fn mask(&self, irq: u8) {
            self.record("mask", irq);
        }

        fn unmask(&self, irq: u8) {
            self.record("unmask", irq);
        }

        fn end_of_interrupt(&self, irq: u8) {
            self.record("eoi", irq);
        }
    }

    /// Stand-in kernel: counts handler calls and records the PIC traffic
    /// seen from inside the handler.
    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        pic: Pic,
        seen: Mutex<Vec<String>>,
    }

    fn count(kernel: &Counter, _: &mut InterruptContext) -> Result<bool, Fatal> {
        kernel.calls.fetch_add(1, Ordering::SeqCst);
        *kernel.seen.lock().unwrap() = kernel.pic.events();
        Ok(true)
    }

    fn cpu() -> Cpu<Flag> {
        Cpu::new(Flag(AtomicBool::new(true)))
    }

    #[test]
    fn irq_is_masked_and_acknowledged_around_the_handler() {
        let cpu = cpu();
        let kernel = Counter::default();
        let table = InterruptTable::<Counter>::new();
        table.register(&cpu, 33, Handler::Kernel(count)).unwrap();

        let handled = table
            .dispatch(&kernel, &cpu, &kernel.pic, &mut InterruptContext::for_vector(33))
            .unwrap();

        assert!(handled);
        assert_eq!(*kernel.seen.lock().unwrap(), ["mask 1", "eoi 1"]);
        assert_eq!(kernel.pic.events(), ["mask 1", "eoi 1", "unmask 1"]);
        assert!(cpu.interrupts().enabled());
    }

    #[test]
    fn spurious_irq_never_reaches_the_handler() {
        let cpu = cpu();
        let kernel = Counter {
            pic: Pic {
                spurious: Some(7),
                ..Pic::default()
            },
            ..Counter::default()
        };
        let table = InterruptTable::<Counter>::new();
        table.register(&cpu, 39, Handler::Kernel(count)).unwrap();

        let handled = table
            .dispatch(&kernel, &cpu, &kernel.pic, &mut InterruptContext::for_vector(39))
            .unwrap();

        assert!(!handled);
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 0);
        assert!(kernel.pic.events().is_empty());
    }

    #[test]
    fn exceptions_bypass_the_pic() {
        let cpu = cpu();
        let kernel = Counter::default();
        let table = InterruptTable::<Counter>::new();
        table.register(&cpu, 3, Handler::Kernel(count)).unwrap();

        table
            .dispatch(&kernel, &cpu, &kernel.pic, &mut InterruptContext::for_vector(3))
            .unwrap();

        assert_eq!(kernel.calls.load(Ordering::SeqCst), 1);
        assert!(kernel.pic.events().is_empty());
    }

    #[test]
    fn missing_handler_is_fatal_and_still_unmasks() {
        let cpu = cpu();
        let kernel = Counter::default();
        let table = InterruptTable::<Counter>::new();
        let mut context = InterruptContext::for_vector(40).with_error(0x11);
        context.rip = 0xC010_0000;

        let result = table.dispatch(&kernel, &cpu, &kernel.pic, &mut context);

        assert_eq!(
            result,
            Err(Fatal::UnhandledInterrupt {
                vector: 40,
                error: 0x11,
                rip: 0xC010_0000
            })
        );
        assert_eq!(kernel.pic.events(), ["mask 8", "eoi 8", "unmask 8"]);
    }

    #[test]
    fn service_routines_get_their_context_word() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn routine(context: usize) -> bool {
            SEEN.store(context, Ordering::SeqCst);
            false
        }

        let cpu = cpu();
        let kernel = Counter::default();
        let table = InterruptTable::<Counter>::new();
        table
            .register(&cpu, 41, Handler::Service { routine, context: 0xACE })
            .unwrap();

        let handled = table
            .dispatch(&kernel, &cpu, &kernel.pic, &mut InterruptContext::for_vector(41))
            .unwrap();

        assert!(!handled);
        assert_eq!(SEEN.load(Ordering::SeqCst), 0xACE);
    }

    #[test]
    fn occupied_vectors_are_refused_until_cleared() {
        let cpu = cpu();
        let table = InterruptTable::<Counter>::new();
        table.register(&cpu, 14, Handler::Kernel(count)).unwrap();

        assert_eq!(
            table.register(&cpu, 14, Handler::Kernel(count)),
            Err(RegisterError::Occupied(14))
        );
        assert!(table.unregister(&cpu, 14).is_some());
        assert!(table.unregister(&cpu, 14).is_none());
        assert!(table.register(&cpu, 14, Handler::Kernel(count)).is_ok());
    }

    #[test]
    fn only_pic_vectors_map_to_irq_lines() {
        assert_eq!(pic_irq(31), None);
        assert_eq!(pic_irq(32), Some(0));
        assert_eq!(pic_irq(47), Some(15));
        assert_eq!(pic_irq(48), None);
    }
}
