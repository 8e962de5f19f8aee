mod common;

use common::{HostedKernel, PicEvent, unword, word};
use kernel::InterruptContext;
use kernel::interrupts::PAGE_FAULT_VECTOR;
use kernel::services::{MAX_LOCKS, MAX_SEMAPHORES, SemaphoreHandle, ServiceError, Timeout};
use kernel_info::memory::PagingMode;
use kernel_sched::ThreadId;
use kernel_sync::InterruptControl;
use kernel_vmem::{PAGE_SIZE, PageState, PhysicalAddress};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn boot() -> &'static HostedKernel {
    common::boot(PagingMode::Long)
}

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Raises timer interrupts until told to stop.
struct Ticker {
    kernel: &'static HostedKernel,
    stop: AtomicBool,
}

extern "C" fn tick_until_stopped(arg: usize) {
    let ticker = unsafe { unword::<Ticker>(arg) };
    while !ticker.stop.load(Ordering::SeqCst) {
        let mut tick = InterruptContext::for_vector(kernel::interrupts::TIMER_VECTOR);
        ticker.kernel.dispatch(&mut tick).unwrap();
    }
}

fn start_ticker(kernel: &'static HostedKernel) -> (&'static Ticker, ThreadId) {
    let ticker = leak(Ticker {
        kernel,
        stop: AtomicBool::new(false),
    });
    let id = kernel.execute(tick_until_stopped, word(ticker)).unwrap();
    (ticker, id)
}

fn stop_ticker(kernel: &'static HostedKernel, (ticker, id): (&'static Ticker, ThreadId)) {
    ticker.stop.store(true, Ordering::SeqCst);
    kernel.scheduler().join(id).unwrap();
}

/// One semaphore operation to run on another thread.
struct SemaphoreJob {
    kernel: &'static HostedKernel,
    handle: SemaphoreHandle,
    result: Mutex<Option<Result<(), ServiceError>>>,
}

impl SemaphoreJob {
    fn new(kernel: &'static HostedKernel, handle: SemaphoreHandle) -> &'static Self {
        leak(Self {
            kernel,
            handle,
            result: Mutex::new(None),
        })
    }

    fn result(&self) -> Option<Result<(), ServiceError>> {
        *self.result.lock().unwrap()
    }
}

extern "C" fn signal_once(arg: usize) {
    let job = unsafe { unword::<SemaphoreJob>(arg) };
    let result = job.kernel.signal_semaphore(job.handle, 1);
    *job.result.lock().unwrap() = Some(result);
}

extern "C" fn wait_forever(arg: usize) {
    let job = unsafe { unword::<SemaphoreJob>(arg) };
    let result = job.kernel.wait_semaphore(job.handle, 1, Timeout::Forever);
    *job.result.lock().unwrap() = Some(result);
}

#[test]
fn timeouts_use_the_16_bit_encoding() {
    assert_eq!(Timeout::from_millis(0), Timeout::DoNotWait);
    assert_eq!(Timeout::from_millis(0xFFFF), Timeout::Forever);
    assert_eq!(Timeout::from_millis(250), Timeout::Millis(250));
}

#[test]
fn semaphore_units_are_taken_all_or_nothing() {
    let kernel = boot();
    let sem = kernel.create_semaphore(3).unwrap();

    kernel.wait_semaphore(sem, 2, Timeout::DoNotWait).unwrap();
    assert_eq!(
        kernel.wait_semaphore(sem, 2, Timeout::DoNotWait),
        Err(ServiceError::Timeout)
    );

    // the unit taken by the failed wait was given back
    kernel.wait_semaphore(sem, 1, Timeout::DoNotWait).unwrap();
    assert_eq!(
        kernel.wait_semaphore(sem, 1, Timeout::DoNotWait),
        Err(ServiceError::Timeout)
    );

    kernel.signal_semaphore(sem, 2).unwrap();
    kernel.wait_semaphore(sem, 2, Timeout::DoNotWait).unwrap();
    kernel.delete_semaphore(sem).unwrap();
}

#[test]
fn deleted_semaphores_are_rejected() {
    let kernel = boot();
    let sem = kernel.create_semaphore(1).unwrap();
    kernel.delete_semaphore(sem).unwrap();

    assert_eq!(kernel.signal_semaphore(sem, 1), Err(ServiceError::BadParameter));
    assert_eq!(
        kernel.wait_semaphore(sem, 1, Timeout::DoNotWait),
        Err(ServiceError::BadParameter)
    );
    assert_eq!(kernel.delete_semaphore(sem), Err(ServiceError::BadParameter));
}

#[test]
fn semaphore_pool_runs_out_and_recovers() {
    let kernel = boot();
    let handles: Vec<_> = (0..MAX_SEMAPHORES)
        .map(|_| kernel.create_semaphore(0).unwrap())
        .collect();
    assert_eq!(kernel.create_semaphore(0), Err(ServiceError::NoMemory));
    assert_eq!(kernel.create_mutex(), Err(ServiceError::NoMemory));

    kernel.delete_semaphore(handles[17]).unwrap();
    let again = kernel.create_semaphore(5).unwrap();
    kernel.wait_semaphore(again, 5, Timeout::DoNotWait).unwrap();
}

#[test]
fn timed_wait_gives_up_at_the_deadline() {
    let kernel = boot();
    let sem = kernel.create_semaphore(0).unwrap();
    let ticker = start_ticker(kernel);

    assert_eq!(
        kernel.wait_semaphore(sem, 1, Timeout::Millis(5)),
        Err(ServiceError::Timeout)
    );
    assert!(kernel.scheduler().ticks() >= 5);

    stop_ticker(kernel, ticker);
}

#[test]
fn timed_wait_returns_once_signalled() {
    let kernel = boot();
    let sem = kernel.create_semaphore(0).unwrap();
    let job = SemaphoreJob::new(kernel, sem);
    let signaller = kernel.execute(signal_once, word(job)).unwrap();

    kernel.wait_semaphore(sem, 1, Timeout::Millis(100)).unwrap();
    assert_eq!(job.result(), Some(Ok(())));
    kernel.scheduler().join(signaller).unwrap();
}

#[test]
fn endless_wait_sleeps_until_signalled() {
    let kernel = boot();
    let sem = kernel.create_semaphore(0).unwrap();
    let job = SemaphoreJob::new(kernel, sem);
    let signaller = kernel.execute(signal_once, word(job)).unwrap();

    kernel.wait_semaphore(sem, 1, Timeout::Forever).unwrap();
    assert_eq!(job.result(), Some(Ok(())));
    kernel.scheduler().join(signaller).unwrap();
}

#[test]
fn semaphore_with_waiters_cannot_be_deleted() {
    let kernel = boot();
    let sem = kernel.create_semaphore(0).unwrap();
    let job = SemaphoreJob::new(kernel, sem);
    let waiter = kernel.execute(wait_forever, word(job)).unwrap();

    kernel.scheduler().yield_now().unwrap();
    assert_eq!(job.result(), None);
    assert_eq!(kernel.delete_semaphore(sem), Err(ServiceError::InUse));

    kernel.signal_semaphore(sem, 1).unwrap();
    kernel.scheduler().join(waiter).unwrap();
    assert_eq!(job.result(), Some(Ok(())));
    kernel.delete_semaphore(sem).unwrap();
}

#[test]
fn mutex_admits_one_holder() {
    let kernel = boot();
    let mutex = kernel.create_mutex().unwrap();

    kernel.acquire_mutex(mutex, Timeout::DoNotWait).unwrap();
    assert_eq!(
        kernel.acquire_mutex(mutex, Timeout::DoNotWait),
        Err(ServiceError::Timeout)
    );
    kernel.release_mutex(mutex).unwrap();
    kernel.acquire_mutex(mutex, Timeout::from_millis(10)).unwrap();
    kernel.release_mutex(mutex).unwrap();
    kernel.delete_mutex(mutex).unwrap();
}

#[test]
fn held_locks_keep_interrupts_off() {
    let kernel = boot();
    let outer = kernel.create_lock().unwrap();
    let inner = kernel.create_lock().unwrap();
    let interrupts = kernel.cpu().interrupts();
    assert!(interrupts.enabled());

    let outer_flags = kernel.acquire_lock(outer).unwrap();
    let inner_flags = kernel.acquire_lock(inner).unwrap();
    assert!(!interrupts.enabled());

    kernel.release_lock(inner, inner_flags).unwrap();
    assert!(!interrupts.enabled());
    assert_eq!(kernel.delete_lock(outer), Err(ServiceError::InUse));

    kernel.release_lock(outer, outer_flags).unwrap();
    assert!(interrupts.enabled());

    assert_eq!(
        kernel.release_lock(outer, outer_flags),
        Err(ServiceError::BadParameter)
    );
    kernel.delete_lock(outer).unwrap();
    kernel.delete_lock(inner).unwrap();
}

#[test]
fn lock_pool_is_bounded() {
    let kernel = boot();
    for _ in 0..MAX_LOCKS {
        kernel.create_lock().unwrap();
    }
    assert_eq!(kernel.create_lock(), Err(ServiceError::NoMemory));
}

static SERVICE_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_service_call(context: usize) -> bool {
    SERVICE_CALLS.fetch_add(context, Ordering::SeqCst);
    true
}

#[test]
fn one_service_routine_can_be_installed() {
    let kernel = boot();

    assert_eq!(
        kernel.install_interrupt_handler(300, count_service_call, 1),
        Err(ServiceError::BadParameter)
    );
    assert_eq!(
        kernel.install_interrupt_handler(u32::from(PAGE_FAULT_VECTOR), count_service_call, 1),
        Err(ServiceError::AlreadyExists)
    );

    kernel.install_interrupt_handler(41, count_service_call, 7).unwrap();
    assert_eq!(
        kernel.install_interrupt_handler(42, count_service_call, 1),
        Err(ServiceError::AlreadyExists)
    );

    assert_eq!(kernel.dispatch(&mut InterruptContext::for_vector(41)), Ok(true));
    assert_eq!(SERVICE_CALLS.load(Ordering::SeqCst), 7);
    assert_eq!(
        kernel.irq().take_events(),
        [PicEvent::Mask(9), PicEvent::Eoi(9), PicEvent::Unmask(9)]
    );

    assert_eq!(kernel.remove_interrupt_handler(42), Err(ServiceError::NotExist));
    kernel.remove_interrupt_handler(41).unwrap();
    assert!(kernel.dispatch(&mut InterruptContext::for_vector(41)).is_err());
    kernel.install_interrupt_handler(42, count_service_call, 1).unwrap();
}

struct Identity {
    kernel: &'static HostedKernel,
    seen: Mutex<Option<ThreadId>>,
}

extern "C" fn report_identity(arg: usize) {
    let identity = unsafe { unword::<Identity>(arg) };
    *identity.seen.lock().unwrap() = identity.kernel.thread_id().ok();
}

#[test]
fn executed_threads_know_who_they_are() {
    let kernel = boot();
    let me = kernel.thread_id().unwrap();
    let identity = leak(Identity {
        kernel,
        seen: Mutex::new(None),
    });

    let id = kernel.execute(report_identity, word(identity)).unwrap();
    assert_ne!(id, me);
    kernel.scheduler().join(id).unwrap();

    assert_eq!(*identity.seen.lock().unwrap(), Some(id));
    assert_eq!(kernel.thread_id().unwrap(), me);
}

#[test]
fn sleep_waits_for_timer_ticks() {
    let kernel = boot();
    let ticker = start_ticker(kernel);

    kernel.sleep(3).unwrap();
    assert!(kernel.scheduler().ticks() >= 3);
    assert!(kernel.timer() >= 30_000);

    stop_ticker(kernel, ticker);
}

#[test]
fn timer_counts_in_hundred_nanosecond_units() {
    let kernel = boot();
    assert_eq!(kernel.timer(), 0);
    kernel.scheduler().tick().unwrap();
    kernel.scheduler().tick().unwrap();
    assert_eq!(kernel.timer(), 20_000);
}

#[test]
fn device_memory_is_mapped_with_its_page_offset() {
    let kernel = boot();
    let device = PhysicalAddress::new(0xFEC0_0010);

    let va = kernel.map_memory(device, 2 * PAGE_SIZE).unwrap().unwrap();
    assert_eq!(va.page_offset(), 0x10);
    let translated = kernel.memory().with(kernel.cpu(), |vmm| vmm.translate(va)).unwrap();
    assert_eq!(translated, Some(device));

    kernel.unmap_memory(va, 2 * PAGE_SIZE).unwrap();
    let state = kernel.memory().with(kernel.cpu(), |vmm| vmm.page_state(va)).unwrap();
    assert_eq!(state, PageState::Unmapped);

    assert_eq!(kernel.map_memory(device, 0), Ok(None));
}
