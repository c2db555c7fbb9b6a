//! Guest-callable entry points.
//!
//! Guest software only sees boolean results. These functions wrap the typed
//! methods of [`AlarmSystem`] and collapse their results into [`Bool`],
//! preserving the return-value contract of the guest ABI:
//!
//! | Entry point            | Returns `FALSE` iff                           |
//! |------------------------|-----------------------------------------------|
//! | [`set_alarm`]          | never                                         |
//! | [`set_periodic_alarm`] | never                                         |
//! | [`cancel_alarm`]       | the alarm was not Armed                       |
//! | [`wait_alarm`]         | not Armed on entry, or resolved by cancelling |
use core::fmt;

use crate::{Alarm, AlarmCallback, AlarmSystem, Port, ResultCode, Ticks, Time};

/// The boolean type of the guest ABI.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Bool(pub i32);

impl Bool {
    pub const FALSE: Self = Self(0);
    pub const TRUE: Self = Self(1);

    /// Any nonzero value is true.
    #[inline]
    pub fn get(self) -> bool {
        self.0 != 0
    }
}

impl From<bool> for Bool {
    #[inline]
    fn from(x: bool) -> Self {
        if x {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

impl From<ResultCode> for Bool {
    #[inline]
    fn from(x: ResultCode) -> Self {
        x.is_ok().into()
    }
}

impl fmt::Debug for Bool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(if self.get() { "TRUE" } else { "FALSE" })
    }
}

/// Convert a typed result to [`Bool`] by way of [`ResultCode`].
#[inline]
fn to_bool<E>(result: Result<(), E>) -> Bool
where
    ResultCode: From<Result<(), E>>,
{
    ResultCode::from(result).into()
}

pub fn create_alarm<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>) {
    system.create_alarm(alarm);
}

pub fn create_alarm_ex<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>, name: &'static str) {
    system.create_alarm_named(alarm, name);
}

pub fn set_alarm<P: Port>(
    system: &AlarmSystem<P>,
    alarm: &'static Alarm<P>,
    delay: Ticks,
    callback: Option<AlarmCallback<P>>,
) -> Bool {
    system.set_alarm(alarm, delay, callback);
    Bool::TRUE
}

pub fn set_periodic_alarm<P: Port>(
    system: &AlarmSystem<P>,
    alarm: &'static Alarm<P>,
    start: Time,
    period: Ticks,
    callback: Option<AlarmCallback<P>>,
) -> Bool {
    system.set_periodic_alarm(alarm, start, period, callback);
    Bool::TRUE
}

pub fn cancel_alarm<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>) -> Bool {
    to_bool(system.cancel_alarm(alarm))
}

pub fn cancel_alarms<P: Port>(system: &AlarmSystem<P>, group_tag: u32) {
    system.cancel_alarms(group_tag);
}

pub fn wait_alarm<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>) -> Bool {
    to_bool(system.wait_alarm(alarm))
}

pub fn get_alarm_user_data<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>) -> usize {
    system.alarm_user_data(alarm)
}

pub fn set_alarm_user_data<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>, user_data: usize) {
    system.set_alarm_user_data(alarm, user_data);
}

pub fn set_alarm_tag<P: Port>(system: &AlarmSystem<P>, alarm: &Alarm<P>, group_tag: u32) {
    system.set_alarm_tag(alarm, group_tag);
}
