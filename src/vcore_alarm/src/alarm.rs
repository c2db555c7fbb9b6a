//! Alarms
use core::fmt;

use crate::{
    error::{CancelAlarmError, WaitAlarmError},
    klock::{lock_scheduler, AlarmLockGuard},
    queue::QueueSlot,
    AlarmSystem, CoreId, Port, Ticks, Time,
};

/// The identity tag stamped into every initialized [`Alarm`].
pub const ALARM_TAG: u32 = u32::from_be_bytes(*b"aLrM");

/// The function called when an alarm fires.
///
/// It's called with the alarm lock released, so it may call any method of
/// [`AlarmSystem`], including ones targeting the alarm being fired. It must
/// not block if the port delivers timer interrupts on a thread that other
/// threads depend on.
pub type AlarmCallback<P> =
    fn(&AlarmSystem<P>, &'static Alarm<P>, <P as crate::PortTimer>::Context);

/// The state of an [`Alarm`].
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                            fire (periodic)
///                              .-----.
///                              |     |
///                              v     |
///   .----------.   arm    .-----------.  cancel   .-----------.
///   | Inactive |--------->|   Armed   |---------->| Cancelled |
///   '----------'          '-----------'           '-----------'
///        ^                  |       ^                   |
///        |  fire (one-shot) |       |        arm        |
///        '------------------'       '-------------------'
/// ```
)]
///
/// </center>
///
/// An alarm is linked into exactly one per-core queue iff it's Armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmState {
    /// Never armed, or fired as a one-shot alarm.
    Inactive,
    /// Waiting to fire.
    Armed,
    /// Cancelled while Armed.
    Cancelled,
}

/// The location of an alarm in the per-core queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct QueueLink {
    pub(super) core: CoreId,
    pub(super) slot: QueueSlot,
}

/// A one-shot or periodic alarm.
///
/// The storage is owned by the caller. An alarm must be initialized by
/// [`AlarmSystem::create_alarm`] before it's passed to any other operation.
/// Arming requires a `&'static` reference because the per-core queue refers
/// to the alarm until it fires or is cancelled.
pub struct Alarm<P: Port> {
    /// The control block. Only accessed while holding the alarm lock.
    ///
    /// The alarm lock serializes every access except [`fmt::Debug`], which
    /// only holds this `SpinMutex` while formatting. It could be even
    /// `UnsafeCell` if it weren't for that.
    cb: spin::Mutex<AlarmCb<P>>,

    /// The threads blocked in [`AlarmSystem::wait_alarm`]. Synchronized by the
    /// port.
    pub(super) wait_set: P::WaitSet,
}

/// *Alarm control block* - the state data of an alarm.
pub(super) struct AlarmCb<P: Port> {
    /// [`ALARM_TAG`] if initialized.
    pub(super) tag: u32,
    pub(super) name: Option<&'static str>,
    pub(super) state: AlarmState,
    /// `Some(_)` iff `state == Armed`.
    pub(super) next_fire: Option<Time>,
    /// Zero for a one-shot alarm.
    pub(super) period: Ticks,
    pub(super) callback: Option<AlarmCallback<P>>,
    /// The context the alarm last fired in. Cleared by arming.
    pub(super) context: Option<P::Context>,
    pub(super) group_tag: u32,
    pub(super) user_data: usize,
    /// `Some(_)` iff `state == Armed`.
    pub(super) link: Option<QueueLink>,
}

impl<P: Port> AlarmCb<P> {
    const UNINIT: Self = Self {
        tag: 0,
        name: None,
        state: AlarmState::Inactive,
        next_fire: None,
        period: 0,
        callback: None,
        context: None,
        group_tag: 0,
        user_data: 0,
        link: None,
    };
}

impl<P: Port> Alarm<P> {
    /// Construct an uninitialized alarm.
    pub const fn new() -> Self {
        Self {
            cb: spin::Mutex::new(AlarmCb::UNINIT),
            wait_set: P::WAIT_SET_INIT,
        }
    }

    /// Get the set of threads blocked on this alarm.
    #[inline]
    pub fn wait_set(&self) -> &P::WaitSet {
        &self.wait_set
    }

    /// Borrow the control block without validating it.
    ///
    /// The alarm lock guard only serves as proof that the lock is held; the
    /// returned guard doesn't borrow it. This may spin briefly if another
    /// thread is formatting the alarm.
    pub(super) fn cb_unchecked<'a>(
        &'a self,
        _lock: &AlarmLockGuard<'_, P>,
    ) -> spin::MutexGuard<'a, AlarmCb<P>> {
        self.cb.lock()
    }

    /// Borrow the control block, panicking if the alarm wasn't initialized.
    #[track_caller]
    pub(super) fn cb<'a>(
        &'a self,
        lock: &AlarmLockGuard<'_, P>,
    ) -> spin::MutexGuard<'a, AlarmCb<P>> {
        let cb = self.cb_unchecked(lock);
        assert_eq!(
            cb.tag, ALARM_TAG,
            "{:p} is not an initialized alarm",
            self
        );
        cb
    }
}

impl<P: Port> Default for Alarm<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> fmt::Debug for Alarm<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Don't wait for the alarm lock; someone might be holding it while
        // formatting
        match self.cb.try_lock() {
            Some(cb) => f
                .debug_struct("Alarm")
                .field("self", &(self as *const _))
                .field("name", &cb.name)
                .field("state", &cb.state)
                .field("next_fire", &cb.next_fire)
                .field("period", &cb.period)
                .field("group_tag", &cb.group_tag)
                .field("link", &cb.link)
                .finish(),
            None => f
                .debug_struct("Alarm")
                .field("self", &(self as *const _))
                .finish_non_exhaustive(),
        }
    }
}

impl<P: Port> AlarmSystem<P> {
    /// Initialize `alarm`. Always succeeds.
    ///
    /// Every field is reset. If the alarm is still linked into a queue from
    /// an earlier arming, it's unlinked first; waiters are not woken.
    pub fn create_alarm(&self, alarm: &Alarm<P>) {
        self.create_alarm_inner(alarm, None);
    }

    /// Initialize `alarm` and give it a name for diagnostic purposes.
    pub fn create_alarm_named(&self, alarm: &Alarm<P>, name: &'static str) {
        self.create_alarm_inner(alarm, Some(name));
    }

    fn create_alarm_inner(&self, alarm: &Alarm<P>, name: Option<&'static str>) {
        log::trace!("create_alarm({alarm:p}, {name:?})");
        let mut lock = self.lock_alarms();
        let mut cb = alarm.cb_unchecked(&lock);

        if cb.tag == ALARM_TAG {
            if let Some(link) = cb.link.take() {
                lock.queue_mut(link.core).remove(link.slot);
            }
        }

        *cb = AlarmCb {
            tag: ALARM_TAG,
            name,
            ..AlarmCb::UNINIT
        };
    }

    /// Arm `alarm` to fire once after `delay`. Equivalent to
    /// [`Self::set_periodic_alarm`] with `start = now + delay` and
    /// `period = 0`.
    pub fn set_alarm(
        &self,
        alarm: &'static Alarm<P>,
        delay: Ticks,
        callback: Option<AlarmCallback<P>>,
    ) {
        let start = self.port.now().saturating_add(delay);
        self.set_periodic_alarm(alarm, start, 0, callback);
    }

    /// Arm `alarm` to fire at `start` and then every `period` (or only once
    /// if `period` is zero). Always succeeds.
    ///
    /// The alarm is moved to the queue of the current core, whose virtual
    /// timer is then programmed for `start` unconditionally. A nearer
    /// deadline already in the queue is restored by the next
    /// [`Self::check_alarms`].
    pub fn set_periodic_alarm(
        &self,
        alarm: &'static Alarm<P>,
        start: Time,
        period: Ticks,
        callback: Option<AlarmCallback<P>>,
    ) {
        let core = self.port.current_core();
        log::trace!("set_periodic_alarm({alarm:p}, {start}, {period}) on core {core}");

        let mut lock = self.lock_alarms();
        let mut cb = alarm.cb(&lock);

        cb.next_fire = Some(start);
        cb.period = period;
        cb.callback = callback;
        cb.context = None;
        cb.state = AlarmState::Armed;

        // Erase from the old queue
        if let Some(link) = cb.link.take() {
            lock.queue_mut(link.core).remove(link.slot);
        }

        // Add to this core's queue
        let slot = lock.queue_mut(core).push(alarm);
        cb.link = Some(QueueLink { core, slot });
        drop(cb);

        self.port.arm_core_timer(core, Some(self.port.to_instant(start)));
    }

    /// Cancel `alarm`.
    ///
    /// Returns `Err(BadObjectState)` unless the alarm is Armed. Every thread
    /// waiting on the alarm is woken up and observes the cancellation.
    pub fn cancel_alarm(&self, alarm: &Alarm<P>) -> Result<(), CancelAlarmError> {
        let mut lock = self.lock_alarms();
        self.cancel_alarm_locked(&mut lock, alarm)
    }

    /// Cancel every Armed alarm tagged with `group_tag`, on every core.
    pub fn cancel_alarms(&self, group_tag: u32) {
        log::trace!("cancel_alarms({group_tag})");
        let mut lock = self.lock_alarms();

        for core in 0..lock.queues.len() {
            // Cancelling unlinks alarms, so don't iterate over the queue
            // while doing that
            let matching: alloc::vec::Vec<&'static Alarm<P>> = lock
                .queue(core)
                .iter()
                .copied()
                .filter(|alarm| alarm.cb(&lock).group_tag == group_tag)
                .collect();

            for alarm in matching {
                // Queue members are always Armed
                let result = self.cancel_alarm_locked(&mut lock, alarm);
                debug_assert!(result.is_ok());
            }
        }
    }

    fn cancel_alarm_locked(
        &self,
        lock: &mut AlarmLockGuard<'_, P>,
        alarm: &Alarm<P>,
    ) -> Result<(), CancelAlarmError> {
        let mut cb = alarm.cb(lock);
        if cb.state != AlarmState::Armed {
            return Err(CancelAlarmError::BadObjectState);
        }
        log::trace!("cancelling {alarm:p}");

        cb.state = AlarmState::Cancelled;
        cb.next_fire = None;
        cb.period = 0;

        if let Some(link) = cb.link.take() {
            lock.queue_mut(link.core).remove(link.slot);
        }
        drop(cb);

        self.port.resume_all_on(&alarm.wait_set);
        Ok(())
    }

    /// Block the current thread until `alarm` fires or is cancelled.
    ///
    /// Returns `Err(BadObjectState)` without blocking if the alarm is not
    /// Armed. Returns `Err(Cancelled)` if the alarm was cancelled by the time
    /// the thread got to run again, `Ok(())` otherwise.
    pub fn wait_alarm(&self, alarm: &Alarm<P>) -> Result<(), WaitAlarmError> {
        let mut sched_lock = lock_scheduler(&self.port);
        let lock = self.lock_alarms();

        if alarm.cb(&lock).state != AlarmState::Armed {
            return Err(WaitAlarmError::BadObjectState);
        }

        log::trace!("waiting on {alarm:p}");
        sched_lock.suspend_current_on(&alarm.wait_set);
        sched_lock.reschedule(lock);

        // Don't trust the wake reason; look at the state again
        let lock = self.lock_alarms();
        let state = alarm.cb(&lock).state;
        drop(lock);
        drop(sched_lock);

        log::trace!("woken up from {alarm:p} ({state:?})");
        if state == AlarmState::Cancelled {
            Err(WaitAlarmError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Set the group tag used by [`Self::cancel_alarms`].
    pub fn set_alarm_tag(&self, alarm: &Alarm<P>, group_tag: u32) {
        let lock = self.lock_alarms();
        alarm.cb(&lock).group_tag = group_tag;
    }

    /// Set the opaque user data value. It's never interpreted by the alarm
    /// facility.
    pub fn set_alarm_user_data(&self, alarm: &Alarm<P>, user_data: usize) {
        let lock = self.lock_alarms();
        alarm.cb(&lock).user_data = user_data;
    }

    /// Get the value set by [`Self::set_alarm_user_data`].
    pub fn alarm_user_data(&self, alarm: &Alarm<P>) -> usize {
        alarm.cb(&self.lock_alarms()).user_data
    }

    /// Get the current state of `alarm`.
    pub fn alarm_state(&self, alarm: &Alarm<P>) -> AlarmState {
        alarm.cb(&self.lock_alarms()).state
    }

    /// Get the time `alarm` fires next. `Some(_)` iff the alarm is Armed.
    pub fn alarm_next_fire(&self, alarm: &Alarm<P>) -> Option<Time> {
        alarm.cb(&self.lock_alarms()).next_fire
    }

    /// Get the period of `alarm`. Zero for a one-shot alarm.
    pub fn alarm_period(&self, alarm: &Alarm<P>) -> Ticks {
        alarm.cb(&self.lock_alarms()).period
    }

    /// Get the core whose queue `alarm` is linked into.
    pub fn alarm_core(&self, alarm: &Alarm<P>) -> Option<CoreId> {
        let lock = self.lock_alarms();
        let link = alarm.cb(&lock).link;
        if let Some(link) = link {
            debug_assert!(core::ptr::eq(
                *lock.queue(link.core).get(link.slot).unwrap(),
                alarm
            ));
        }
        link.map(|link| link.core)
    }

    /// Get the context `alarm` last fired in. Cleared when the alarm is armed.
    pub fn alarm_context(&self, alarm: &Alarm<P>) -> Option<P::Context> {
        alarm.cb(&self.lock_alarms()).context
    }

    /// Get the name given by [`Self::create_alarm_named`].
    pub fn alarm_name(&self, alarm: &Alarm<P>) -> Option<&'static str> {
        alarm.cb(&self.lock_alarms()).name
    }

    /// Get the number of alarms linked into the queue of `core`.
    pub fn queued_alarms(&self, core: CoreId) -> usize {
        self.lock_alarms().queue(core).len()
    }
}
