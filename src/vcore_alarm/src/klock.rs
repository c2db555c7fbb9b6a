//! The alarm lock and the scheduler lock
use alloc::boxed::Box;
use core::ops;

use crate::{alarm::Alarm, queue::AlarmQueue, AlarmSystem, CoreId, Port, PortThreading};

/// The state protected by the alarm lock, apart from the alarm records
/// themselves.
pub(super) struct AlarmGlobals<P: Port> {
    /// The per-core alarm queues, indexed by [`CoreId`].
    pub(super) queues: Box<[AlarmQueue<&'static Alarm<P>>]>,
}

impl<P: Port> AlarmGlobals<P> {
    #[track_caller]
    pub(super) fn queue(&self, core: CoreId) -> &AlarmQueue<&'static Alarm<P>> {
        self.queues
            .get(core)
            .unwrap_or_else(|| panic!("core {core} does not exist"))
    }

    #[track_caller]
    pub(super) fn queue_mut(&mut self, core: CoreId) -> &mut AlarmQueue<&'static Alarm<P>> {
        self.queues
            .get_mut(core)
            .unwrap_or_else(|| panic!("core {core} does not exist"))
    }
}

/// RAII guard for the alarm lock.
///
/// The alarm lock is a busy-wait lock. It's taken from interrupt-time code
/// (the trigger engine), where descheduling is not an option, so it must
/// never be replaced with a blocking lock.
///
/// Alarm control blocks can only be accessed by presenting a reference to
/// this type. See [`Alarm::cb`].
pub(super) struct AlarmLockGuard<'a, P: Port> {
    globals: spin::MutexGuard<'a, AlarmGlobals<P>>,
}

impl<P: Port> AlarmSystem<P> {
    /// Acquire the alarm lock.
    #[inline]
    pub(super) fn lock_alarms(&self) -> AlarmLockGuard<'_, P> {
        AlarmLockGuard {
            globals: self.alarms.lock(),
        }
    }
}

impl<P: Port> ops::Deref for AlarmLockGuard<'_, P> {
    type Target = AlarmGlobals<P>;
    fn deref(&self) -> &Self::Target {
        &self.globals
    }
}

impl<P: Port> ops::DerefMut for AlarmLockGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.globals
    }
}

/// Acquire the scheduler lock and get an RAII guard.
pub(super) fn lock_scheduler<Traits: PortThreading>(
    port: &Traits,
) -> SchedulerLockGuard<'_, Traits> {
    // Safety: We are the alarm facility, and the guard releases the lock
    unsafe { port.lock_scheduler() };
    SchedulerLockGuard { port }
}

/// RAII guard for the scheduler lock.
///
/// The scheduler lock must be acquired before the alarm lock in any path that
/// holds both. Use [`AlarmSystem::lock_alarms`] only after this.
pub(super) struct SchedulerLockGuard<'a, Traits: PortThreading> {
    port: &'a Traits,
}

impl<Traits: PortThreading> SchedulerLockGuard<'_, Traits> {
    /// Put the current thread into `wait_set`.
    #[inline]
    pub(super) fn suspend_current_on(&mut self, wait_set: &Traits::WaitSet) {
        // Safety: The scheduler lock is held
        unsafe { self.port.suspend_current_on(wait_set) };
    }

    /// Yield the processor until the current thread is woken up.
    ///
    /// Taking the alarm lock guard by value proves that the alarm lock was
    /// released before descheduling.
    #[inline]
    pub(super) fn reschedule<P: Port>(&mut self, alarm_lock: AlarmLockGuard<'_, P>) {
        drop(alarm_lock);
        // Safety: The scheduler lock is held, the alarm lock isn't
        unsafe { self.port.reschedule() };
    }
}

impl<Traits: PortThreading> Drop for SchedulerLockGuard<'_, Traits> {
    fn drop(&mut self) {
        // Safety: The scheduler lock is currently held, and it's us who
        //         acquired it
        unsafe { self.port.unlock_scheduler() };
    }
}
