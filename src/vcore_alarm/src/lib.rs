#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

pub mod abi;
mod alarm;
mod error;
mod klock;
mod queue;
mod trigger;

#[cfg(test)]
mod tests;

pub use self::{
    alarm::{Alarm, AlarmCallback, AlarmState, ALARM_TAG},
    error::{CancelAlarmError, ResultCode, WaitAlarmError},
};

/// An absolute point of time, measured in kernel time units.
pub type Time = u64;

/// A span of time, measured in kernel time units.
pub type Ticks = u64;

/// Identifies an emulated core. The valid range is
/// `0..`[`PortThreading::num_cores`]`()`.
pub type CoreId = usize;

/// Implemented by a port. This trait contains items related to the
/// scheduler of the surrounding kernel.
///
/// # Safety
///
/// These methods are only meant to be called by the alarm facility.
pub unsafe trait PortThreading: Send + Sync + 'static {
    /// The set of threads blocked on a single alarm.
    type WaitSet: Send + Sync + 'static;

    /// The initial value of [`Self::WaitSet`]. It's used to construct
    /// [`Alarm`]s in a `const` context.
    #[allow(clippy::declare_interior_mutable_const)]
    const WAIT_SET_INIT: Self::WaitSet;

    /// Get the number of emulated cores. Must not change over the lifetime
    /// of the port.
    fn num_cores(&self) -> usize;

    /// Get the core the calling thread is executing on.
    fn current_core(&self) -> CoreId;

    /// Acquire the scheduler lock.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the alarm facility. Must be balanced by
    /// [`Self::unlock_scheduler`].
    unsafe fn lock_scheduler(&self);

    /// Release the scheduler lock.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held by the calling thread.
    unsafe fn unlock_scheduler(&self);

    /// Put the calling thread into `wait_set`. The thread keeps running until
    /// the next call to [`Self::reschedule`], but a wake issued through
    /// [`Self::resume_all_on`] after this point must not be lost.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held by the calling thread.
    unsafe fn suspend_current_on(&self, wait_set: &Self::WaitSet);

    /// Yield the processor. If the calling thread was suspended by
    /// [`Self::suspend_current_on`], this returns only after the thread was
    /// woken up.
    ///
    /// The scheduler lock may be released while the calling thread is
    /// descheduled, but it's held again when this method returns.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held by the calling thread. The alarm lock
    /// must not be held.
    unsafe fn reschedule(&self);

    /// Wake up every thread in `wait_set`.
    ///
    /// This is called with the alarm lock held, so it must not try to
    /// acquire the scheduler lock.
    fn resume_all_on(&self, wait_set: &Self::WaitSet);
}

/// Implemented by a port. This trait contains items related to the clock and
/// the per-core virtual interrupt timer.
pub trait PortTimer: Send + Sync + 'static {
    /// The execution context interrupted by a timer interrupt. Handed to the
    /// trigger engine and passed through to alarm callbacks.
    type Context: Copy + Send + Sync + 'static;

    /// The absolute time representation used by the interrupt controller.
    type Instant: Copy + Ord;

    /// Get the current time.
    fn now(&self) -> Time;

    /// Convert a kernel time value to the interrupt controller's
    /// representation.
    fn to_instant(&self, time: Time) -> Self::Instant;

    /// Schedule the next invocation of [`AlarmSystem::check_alarms`] for
    /// `core`. `None` disarms the timer.
    ///
    /// Replaces whatever deadline was previously set for `core`. Called with
    /// the alarm lock held.
    fn arm_core_timer(&self, core: CoreId, at: Option<Self::Instant>);
}

/// The complete set of collaborators needed by [`AlarmSystem`].
pub trait Port: PortThreading + PortTimer {}
impl<T: PortThreading + PortTimer> Port for T {}

/// The alarm facility of a single kernel instance.
///
/// This is a process-scoped context object: it's created once before any
/// core starts running and is passed to every operation. There's no teardown
/// beyond dropping it after all cores have stopped.
pub struct AlarmSystem<P: Port> {
    port: P,
    /// The alarm lock and the per-core queues it protects.
    alarms: spin::Mutex<klock::AlarmGlobals<P>>,
}

impl<P: Port> AlarmSystem<P> {
    /// Perform the one-time initialization of the alarm facility.
    pub fn new(port: P) -> Self {
        let num_cores = port.num_cores();
        assert!(num_cores > 0, "a system needs at least one core");
        log::debug!("initializing alarm queues for {num_cores} core(s)");

        let queues: Vec<_> = (0..num_cores).map(|_| queue::AlarmQueue::new()).collect();
        Self {
            port,
            alarms: spin::Mutex::new(klock::AlarmGlobals {
                queues: Box::from(queues),
            }),
        }
    }

    /// Get the port this system was created with.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: Port> core::fmt::Debug for AlarmSystem<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("AlarmSystem")
            .field("num_cores", &self.port.num_cores())
            .finish_non_exhaustive()
    }
}
