//! Test harness: a port with a manually advanced clock.
use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::Thread,
};

use crate::{Alarm, AlarmSystem, CoreId, PortThreading, PortTimer, Time};

mod arming;

pub(crate) fn init_logger() {
    // `is_test(true)` would drop log messages from other threads
    let _ = env_logger::try_init();
}

thread_local! {
    /// The core the current thread pretends to run on.
    static CURRENT_CORE: Cell<CoreId> = Cell::new(0);

    /// The waiter registered by `suspend_current_on`, consumed by
    /// `reschedule`.
    static PENDING_WAIT: RefCell<Option<Arc<Waiter>>> = RefCell::new(None);
}

pub(crate) fn set_current_core(core: CoreId) {
    CURRENT_CORE.with(|c| c.set(core));
}

#[derive(Debug)]
struct Waiter {
    thread: Thread,
    woken: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct MockWaitSet {
    waiters: spin::Mutex<Vec<Arc<Waiter>>>,
}

impl MockWaitSet {
    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// A port driven by the test code. Timer interrupts are never delivered
/// automatically; tests call `check_alarms` themselves.
#[derive(Debug)]
pub(crate) struct MockPort {
    num_cores: usize,
    now: AtomicU64,
    sched_lock: spin::Mutex<()>,
    /// The deadline most recently programmed for each core. `u64::MAX`
    /// means disarmed.
    timers: Vec<AtomicU64>,
    timer_arm_count: AtomicUsize,
    /// The number of threads currently in `arm_core_timer`, which is only
    /// called with the alarm lock held.
    timer_arms_in_progress: AtomicUsize,
    max_timer_arms_in_progress: AtomicUsize,
}

pub(crate) const DISARMED: u64 = u64::MAX;

impl MockPort {
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            now: AtomicU64::new(0),
            sched_lock: spin::Mutex::new(()),
            timers: (0..num_cores).map(|_| AtomicU64::new(DISARMED)).collect(),
            timer_arm_count: AtomicUsize::new(0),
            timer_arms_in_progress: AtomicUsize::new(0),
            max_timer_arms_in_progress: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_now(&self, now: Time) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Get the deadline of the virtual timer of `core`.
    pub(crate) fn timer(&self, core: CoreId) -> Option<Time> {
        match self.timers[core].load(Ordering::SeqCst) {
            DISARMED => None,
            x => Some(x),
        }
    }

    pub(crate) fn timer_arm_count(&self) -> usize {
        self.timer_arm_count.load(Ordering::SeqCst)
    }

    /// Get the largest number of threads that were ever in `arm_core_timer`
    /// at the same time.
    pub(crate) fn max_timer_arms_in_progress(&self) -> usize {
        self.max_timer_arms_in_progress.load(Ordering::SeqCst)
    }
}

unsafe impl PortThreading for MockPort {
    type WaitSet = MockWaitSet;

    #[allow(clippy::declare_interior_mutable_const)]
    const WAIT_SET_INIT: Self::WaitSet = MockWaitSet {
        waiters: spin::Mutex::new(Vec::new()),
    };

    fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn current_core(&self) -> CoreId {
        CURRENT_CORE.with(|c| c.get())
    }

    unsafe fn lock_scheduler(&self) {
        std::mem::forget(self.sched_lock.lock());
    }

    unsafe fn unlock_scheduler(&self) {
        // Safety: The lock was acquired by `lock_scheduler`
        unsafe { self.sched_lock.force_unlock() };
    }

    unsafe fn suspend_current_on(&self, wait_set: &Self::WaitSet) {
        let waiter = Arc::new(Waiter {
            thread: std::thread::current(),
            woken: AtomicBool::new(false),
        });
        wait_set.waiters.lock().push(Arc::clone(&waiter));
        PENDING_WAIT.with(|w| *w.borrow_mut() = Some(waiter));
    }

    unsafe fn reschedule(&self) {
        let Some(waiter) = PENDING_WAIT.with(|w| w.borrow_mut().take()) else {
            std::thread::yield_now();
            return;
        };

        // Let other threads use the scheduler while we are blocked
        unsafe { self.unlock_scheduler() };
        while !waiter.woken.load(Ordering::Acquire) {
            std::thread::park();
        }
        unsafe { self.lock_scheduler() };
    }

    fn resume_all_on(&self, wait_set: &Self::WaitSet) {
        for waiter in wait_set.waiters.lock().drain(..) {
            waiter.woken.store(true, Ordering::Release);
            waiter.thread.unpark();
        }
    }
}

impl PortTimer for MockPort {
    /// Identifies the interrupted context in callbacks.
    type Context = u32;
    type Instant = Time;

    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }

    fn to_instant(&self, time: Time) -> Self::Instant {
        time
    }

    fn arm_core_timer(&self, core: CoreId, at: Option<Self::Instant>) {
        let depth = self.timer_arms_in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_timer_arms_in_progress.fetch_max(depth, Ordering::SeqCst);

        self.timers[core].store(at.unwrap_or(DISARMED), Ordering::SeqCst);
        self.timer_arm_count.fetch_add(1, Ordering::SeqCst);

        // Widen the window for overlapping callers
        std::thread::yield_now();
        self.timer_arms_in_progress.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) type System = AlarmSystem<MockPort>;

pub(crate) fn new_system() -> System {
    init_logger();
    set_current_core(0);
    AlarmSystem::new(MockPort::new(3))
}

/// Allocate an initialized alarm that lives until the end of the test
/// process.
pub(crate) fn new_alarm(system: &System) -> &'static Alarm<MockPort> {
    let alarm = Box::leak(Box::new(Alarm::new()));
    system.create_alarm(alarm);
    alarm
}
