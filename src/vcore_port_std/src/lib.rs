#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};
use vcore_alarm::{AlarmSystem, CoreId, PortThreading, PortTimer, Time};

mod config;
mod sim;
mod threading;


pub use self::{
    config::{ClockSource, PortConfig},
    sim::Simulator,
    threading::WaitSet,
};

/// Used by doctests and integration tests
#[doc(hidden)]
pub extern crate env_logger;

/// The alarm facility running on [`StdPort`].
pub type System = AlarmSystem<StdPort>;

/// The execution context interrupted by a timer interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterruptedContext {
    /// The core whose timer expired.
    pub core: CoreId,
    /// The time the interrupt was taken.
    pub time: Time,
}

thread_local! {
    /// The core the current thread is bound to.
    static CURRENT_CORE: Cell<Option<CoreId>> = Cell::new(None);
}

/// Bind the current thread to `core`. Operations that arm alarms will use the
/// queue of this core from now on.
///
/// Threads spawned by [`Simulator::spawn_on_core`] and the timer threads are
/// bound automatically.
pub fn bind_current_thread(core: CoreId) {
    log::trace!("binding {:?} to core {core}", std::thread::current().id());
    CURRENT_CORE.with(|c| c.set(Some(core)));
}

pub(crate) fn unbind_current_thread() {
    CURRENT_CORE.with(|c| c.set(None));
}

/// Get the core the current thread is bound to.
pub fn current_core() -> Option<CoreId> {
    CURRENT_CORE.with(|c| c.get())
}

/// The internal state of the port.
#[derive(Debug)]
pub struct StdPort {
    num_cores: usize,
    clock: Clock,
    /// The scheduler lock. Acquired by [`PortThreading::lock_scheduler`] and
    /// released by a matching call to [`PortThreading::unlock_scheduler`],
    /// so the guard isn't kept anywhere.
    sched_lock: SpinMutex<()>,
    timers: Box<[CoreTimer]>,
}

#[derive(Debug)]
enum Clock {
    Host { origin: Instant },
    Manual { now: AtomicU64 },
}

/// The virtual interrupt timer of a core.
#[derive(Debug, Default)]
struct CoreTimer {
    /// The deadline most recently programmed by the alarm facility.
    armed: SpinMutex<Option<Duration>>,
    /// The channel to the timer thread. `None` if there's no timer thread.
    cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
}

#[derive(Debug)]
enum TimerCmd {
    SetTimeout { at: Option<Duration> },
}

impl StdPort {
    pub fn new(config: &PortConfig) -> Self {
        assert!(config.num_cores > 0, "a system needs at least one core");
        log::debug!("creating a port with {config:?}");

        let clock = match config.clock {
            ClockSource::Host => Clock::Host {
                origin: Instant::now(),
            },
            ClockSource::Manual => Clock::Manual { now: 0.into() },
        };

        Self {
            num_cores: config.num_cores,
            clock,
            sched_lock: SpinMutex::new(()),
            timers: (0..config.num_cores).map(|_| CoreTimer::default()).collect(),
        }
    }

    #[inline]
    pub fn clock_source(&self) -> ClockSource {
        match self.clock {
            Clock::Host { .. } => ClockSource::Host,
            Clock::Manual { .. } => ClockSource::Manual,
        }
    }

    /// Move the manual clock forward by `ticks`.
    ///
    /// # Panics
    ///
    /// Panics if the port uses the host clock.
    #[track_caller]
    pub fn advance(&self, ticks: u64) {
        match &self.clock {
            Clock::Manual { now } => {
                let old = now.fetch_add(ticks, Ordering::SeqCst);
                log::trace!("manual clock: {old} -> {}", old.saturating_add(ticks));
            }
            Clock::Host { .. } => panic!("the host clock can't be advanced"),
        }
    }

    /// Get the deadline the virtual timer of `core` is currently programmed
    /// for.
    pub fn armed_timer(&self, core: CoreId) -> Option<Time> {
        self.timers[core].armed.lock().map(duration_to_time)
    }

    /// Connect the virtual timer of `core` to a timer thread.
    fn attach_timer_thread(&self, core: CoreId, cmd_send: mpsc::Sender<TimerCmd>) {
        // Forward the deadline programmed so far
        let mut cmd_send_cell = self.timers[core].cmd_send.lock();
        let at = *self.timers[core].armed.lock();
        if at.is_some() {
            let _ = cmd_send.send(TimerCmd::SetTimeout { at });
        }
        *cmd_send_cell = Some(cmd_send);
    }

    /// Disconnect the timer thread of `core`. `mpsc::Receiver::recv` in the
    /// timer thread will return `Err(_)` when the sender is dropped.
    fn detach_timer_thread(&self, core: CoreId) {
        *self.timers[core].cmd_send.lock() = None;
    }

    /// Convert an offset from the origin to a host instant. Returns `None` if
    /// it's not representable.
    fn host_instant(&self, at: Duration) -> Option<Instant> {
        match self.clock {
            Clock::Host { origin } => origin.checked_add(at),
            Clock::Manual { .. } => None,
        }
    }
}

fn duration_to_time(x: Duration) -> Time {
    u64::try_from(x.as_micros()).unwrap_or(Time::MAX)
}

// Safety: The alarm facility is the only caller of these methods
unsafe impl PortThreading for StdPort {
    type WaitSet = WaitSet;

    #[allow(clippy::declare_interior_mutable_const)]
    const WAIT_SET_INIT: Self::WaitSet = WaitSet::new();

    fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn current_core(&self) -> CoreId {
        let core = current_core().expect("the current thread is not bound to a core");
        assert!(core < self.num_cores, "core {core} does not exist");
        core
    }

    unsafe fn lock_scheduler(&self) {
        std::mem::forget(self.sched_lock.lock());
    }

    unsafe fn unlock_scheduler(&self) {
        // Safety: The lock was acquired by `lock_scheduler`
        unsafe { self.sched_lock.force_unlock() };
    }

    unsafe fn suspend_current_on(&self, wait_set: &Self::WaitSet) {
        threading::suspend_current_on(wait_set);
    }

    unsafe fn reschedule(&self) {
        let Some(waiter) = threading::take_pending_wait() else {
            std::thread::yield_now();
            return;
        };

        // Release the scheduler while we are parked
        unsafe { self.unlock_scheduler() };
        waiter.park();
        unsafe { self.lock_scheduler() };
    }

    fn resume_all_on(&self, wait_set: &Self::WaitSet) {
        wait_set.resume_all();
    }
}

impl PortTimer for StdPort {
    type Context = InterruptedContext;

    /// An offset from the time origin of the port.
    type Instant = Duration;

    fn now(&self) -> Time {
        match &self.clock {
            Clock::Host { origin } => duration_to_time(origin.elapsed()),
            Clock::Manual { now } => now.load(Ordering::SeqCst),
        }
    }

    fn to_instant(&self, time: Time) -> Self::Instant {
        Duration::from_micros(time)
    }

    fn arm_core_timer(&self, core: CoreId, at: Option<Self::Instant>) {
        log::trace!("arm_core_timer({core}, {at:?})");
        let timer = &self.timers[core];
        *timer.armed.lock() = at;

        if let Some(cmd_send) = &*timer.cmd_send.lock() {
            // The timer thread might be gone if we are shutting down
            let _ = cmd_send.send(TimerCmd::SetTimeout { at });
        }
    }
}
