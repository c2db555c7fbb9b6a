//! Creation, arming, cancellation, and accessors
use quickcheck_macros::quickcheck;

use super::*;
use crate::{AlarmState, CancelAlarmError, WaitAlarmError};

#[test]
fn created_alarm_is_inactive() {
    let system = new_system();
    let alarm = new_alarm(&system);

    assert_eq!(system.alarm_state(alarm), AlarmState::Inactive);
    assert_eq!(system.alarm_next_fire(alarm), None);
    assert_eq!(system.alarm_core(alarm), None);
    assert_eq!(system.alarm_name(alarm), None);
    assert_eq!(system.alarm_user_data(alarm), 0);
}

#[test]
fn named_alarm() {
    let system = new_system();
    let alarm: &'static Alarm<MockPort> = Box::leak(Box::new(Alarm::new()));
    system.create_alarm_named(alarm, "vsync");
    assert_eq!(system.alarm_name(alarm), Some("vsync"));
}

#[test]
#[should_panic(expected = "is not an initialized alarm")]
fn uninitialized_alarm_is_rejected() {
    let system = new_system();
    let alarm: &'static Alarm<MockPort> = Box::leak(Box::new(Alarm::new()));
    let _ = system.cancel_alarm(alarm);
}

#[test]
fn set_alarm_links_into_current_core() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.port().set_now(1000);
    set_current_core(2);
    system.set_alarm(alarm, 100, None);

    assert_eq!(system.alarm_state(alarm), AlarmState::Armed);
    assert_eq!(system.alarm_next_fire(alarm), Some(1100));
    assert_eq!(system.alarm_period(alarm), 0);
    assert_eq!(system.alarm_core(alarm), Some(2));
    assert_eq!(system.queued_alarms(2), 1);
    assert_eq!(system.queued_alarms(0), 0);
    assert_eq!(system.port().timer(2), Some(1100));
}

#[test]
fn arming_programs_timer_unconditionally() {
    let system = new_system();
    let near = new_alarm(&system);
    let far = new_alarm(&system);

    system.set_alarm(near, 50, None);
    system.set_alarm(far, 500, None);

    // The later deadline overwrites the nearer one until the next check
    assert_eq!(system.port().timer(0), Some(500));

    system.port().set_now(10);
    system.check_alarms(0, 0);
    assert_eq!(system.port().timer(0), Some(50));
}

#[test]
fn rearming_moves_between_cores() {
    let system = new_system();
    let alarm = new_alarm(&system);

    set_current_core(0);
    system.set_periodic_alarm(alarm, 100, 10, None);
    assert_eq!(system.alarm_core(alarm), Some(0));

    set_current_core(1);
    system.set_periodic_alarm(alarm, 200, 0, None);
    assert_eq!(system.alarm_core(alarm), Some(1));
    assert_eq!(system.alarm_period(alarm), 0);
    assert_eq!(system.queued_alarms(0), 0);
    assert_eq!(system.queued_alarms(1), 1);
}

#[test]
fn cancel_armed_alarm() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.set_periodic_alarm(alarm, 100, 25, None);
    assert_eq!(system.cancel_alarm(alarm), Ok(()));

    assert_eq!(system.alarm_state(alarm), AlarmState::Cancelled);
    assert_eq!(system.alarm_next_fire(alarm), None);
    assert_eq!(system.alarm_period(alarm), 0);
    assert_eq!(system.alarm_core(alarm), None);
    assert_eq!(system.queued_alarms(0), 0);
}

#[test]
fn cancel_twice_fails_second_time() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.set_alarm(alarm, 100, None);
    assert_eq!(system.cancel_alarm(alarm), Ok(()));
    assert_eq!(
        system.cancel_alarm(alarm),
        Err(CancelAlarmError::BadObjectState)
    );
}

#[test]
fn cancel_inactive_alarm_fails() {
    let system = new_system();
    let alarm = new_alarm(&system);
    assert_eq!(
        system.cancel_alarm(alarm),
        Err(CancelAlarmError::BadObjectState)
    );
}

#[test]
fn wait_after_cancel_fails_without_blocking() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.set_alarm(alarm, 100, None);
    system.cancel_alarm(alarm).unwrap();
    assert_eq!(
        system.wait_alarm(alarm),
        Err(WaitAlarmError::BadObjectState)
    );

    // Until it's armed again
    system.set_alarm(alarm, 100, None);
    assert_eq!(system.alarm_state(alarm), AlarmState::Armed);
}

#[test]
fn wait_on_inactive_alarm_fails() {
    let system = new_system();
    let alarm = new_alarm(&system);
    assert_eq!(
        system.wait_alarm(alarm),
        Err(WaitAlarmError::BadObjectState)
    );
}

#[test]
fn cancel_alarms_by_tag_across_cores() {
    let system = new_system();
    let d = new_alarm(&system);
    let e = new_alarm(&system);
    let other = new_alarm(&system);

    system.set_alarm_tag(d, 7);
    system.set_alarm_tag(e, 7);
    system.set_alarm_tag(other, 9);

    set_current_core(0);
    system.set_alarm(d, 100, None);
    set_current_core(1);
    system.set_alarm(e, 100, None);
    set_current_core(2);
    system.set_alarm(other, 100, None);

    system.cancel_alarms(7);

    assert_eq!(system.alarm_state(d), AlarmState::Cancelled);
    assert_eq!(system.alarm_state(e), AlarmState::Cancelled);
    assert_eq!(system.alarm_state(other), AlarmState::Armed);
    assert_eq!(system.alarm_core(other), Some(2));
}

#[test]
fn cancel_alarms_ignores_inactive_alarms() {
    let system = new_system();
    let alarm = new_alarm(&system);
    system.set_alarm_tag(alarm, 3);

    system.cancel_alarms(3);
    assert_eq!(system.alarm_state(alarm), AlarmState::Inactive);
}

#[test]
fn user_data_and_tag_have_no_state_effect() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.set_alarm(alarm, 100, None);
    system.set_alarm_user_data(alarm, 0xdead_beef);
    system.set_alarm_tag(alarm, 42);

    assert_eq!(system.alarm_user_data(alarm), 0xdead_beef);
    assert_eq!(system.alarm_state(alarm), AlarmState::Armed);
    assert_eq!(system.alarm_next_fire(alarm), Some(100));
}

#[test]
fn recreate_unlinks_armed_alarm() {
    let system = new_system();
    let alarm = new_alarm(&system);

    system.set_alarm(alarm, 100, None);
    system.create_alarm(alarm);

    assert_eq!(system.alarm_state(alarm), AlarmState::Inactive);
    assert_eq!(system.queued_alarms(0), 0);
}

/// Arms alarms with random tags on random cores, cancels one tag, and checks
/// that exactly the matching Armed alarms were cancelled and that queue
/// membership agrees with the state of every alarm.
#[quickcheck]
fn cancel_alarms_matches_exactly(alarms: Vec<(u8, u8, bool)>, target: u8) {
    let system = new_system();
    let target = u32::from(target % 4);

    let alarms: Vec<_> = alarms
        .into_iter()
        .map(|(tag, core, armed)| {
            let alarm = new_alarm(&system);
            let tag = u32::from(tag % 4);
            system.set_alarm_tag(alarm, tag);
            if armed {
                set_current_core(usize::from(core % 3));
                system.set_alarm(alarm, 1000, None);
            }
            (alarm, tag, armed)
        })
        .collect();

    system.cancel_alarms(target);

    let mut queued = 0;
    for &(alarm, tag, armed) in &alarms {
        let expected = match (armed, tag == target) {
            (false, _) => AlarmState::Inactive,
            (true, true) => AlarmState::Cancelled,
            (true, false) => AlarmState::Armed,
        };
        let state = system.alarm_state(alarm);
        assert_eq!(state, expected);
        assert_eq!(system.alarm_core(alarm).is_some(), state == AlarmState::Armed);
        queued += usize::from(state == AlarmState::Armed);
    }

    assert_eq!((0..3).map(|core| system.queued_alarms(core)).sum::<usize>(), queued);
}
