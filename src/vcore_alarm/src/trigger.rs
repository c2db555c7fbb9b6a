//! The trigger engine
use alloc::vec::Vec;
use core::ptr;

use crate::{
    alarm::{Alarm, AlarmState},
    klock::AlarmLockGuard,
    AlarmSystem, CoreId, Port, Time,
};

impl<P: Port> AlarmSystem<P> {
    /// Fire every due alarm in the queue of `core`, then program the core's
    /// virtual timer for the earliest remaining deadline.
    ///
    /// The port calls this when the virtual timer of `core` expires, passing
    /// the interrupted execution context. Alarms fire in the order they were
    /// armed. A due alarm armed on `core` by a callback fires in the same
    /// check, after the alarms that were already there. Each alarm fires at
    /// most once per check; a periodic alarm that is still due afterwards
    /// waits for the next one. The timer is reprogrammed even if nothing
    /// fired, so it always agrees with the queue contents.
    pub fn check_alarms(&self, core: CoreId, context: P::Context) {
        let now = self.port.now();
        let mut lock = self.lock_alarms();

        // Callbacks run with the lock released and may arm or cancel alarms
        // on this queue. Scan snapshots of the members and re-validate each
        // one before firing it. Repeat while the previous round fired
        // something, since that's when new members can show up.
        let mut fired: Vec<&'static Alarm<P>> = Vec::new();
        loop {
            let members: Vec<&'static Alarm<P>> = lock
                .queue(core)
                .iter()
                .copied()
                .filter(|alarm| !fired.iter().any(|f| ptr::eq(*f, *alarm)))
                .collect();
            log::trace!("check_alarms(core {core}) at {now}: {} member(s)", members.len());

            let num_fired = fired.len();
            for alarm in members {
                let is_due = {
                    let cb = alarm.cb(&lock);
                    cb.state == AlarmState::Armed
                        && cb.link.map(|link| link.core) == Some(core)
                        && cb.next_fire.map_or(false, |next_fire| next_fire <= now)
                };

                if is_due {
                    fired.push(alarm);
                    lock = self.fire_alarm(lock, alarm, now, context);
                }
            }

            if fired.len() == num_fired {
                break;
            }
        }

        let next = next_deadline(&lock, core);
        log::trace!("core {core}: next deadline = {next:?}");
        self.port.arm_core_timer(core, next.map(|time| self.port.to_instant(time)));
    }

    /// Fire `alarm`. The alarm lock is released while the callback runs.
    fn fire_alarm<'a>(
        &'a self,
        mut lock: AlarmLockGuard<'a, P>,
        alarm: &'static Alarm<P>,
        now: Time,
        context: P::Context,
    ) -> AlarmLockGuard<'a, P> {
        let callback = {
            let mut cb = alarm.cb(&lock);
            cb.context = Some(context);

            if cb.period != 0 {
                // Stay in the queue
                cb.next_fire = Some(now.saturating_add(cb.period));
            } else {
                cb.next_fire = None;
                cb.state = AlarmState::Inactive;
                if let Some(link) = cb.link.take() {
                    lock.queue_mut(link.core).remove(link.slot);
                }
            }

            log::trace!("firing {alarm:p} (next = {:?})", cb.next_fire);
            cb.callback
        };

        if let Some(callback) = callback {
            // Release the alarm lock before calling the callback so that it
            // can re-enter us
            drop(lock);
            callback(self, alarm, context);
            lock = self.lock_alarms();
        }

        // Waiters only care that a fire occurred
        self.port.resume_all_on(&alarm.wait_set);
        lock
    }
}

/// Find the earliest fire time among the Armed alarms of `core`.
fn next_deadline<P: Port>(lock: &AlarmLockGuard<'_, P>, core: CoreId) -> Option<Time> {
    lock.queue(core)
        .iter()
        .filter_map(|alarm| {
            let cb = alarm.cb(lock);
            debug_assert_eq!(cb.state, AlarmState::Armed);
            cb.next_fire
        })
        .min()
}
