use cubesat_obc::state_machine::*;
use cubesat_obc::PowerStatus;

fn power(battery: f32, external: bool, ts: u64) -> Event {
    Event::PowerUpdate(PowerStatus::new(Some(battery), external, ts))
}

fn machine_in(state: OperatingState) -> StateMachine {
    let mut sm = StateMachine::new(StateMachineConfig::default(), 0);
    if state == OperatingState::Boot {
        return sm;
    }
    sm.apply(Event::Connectivity(ConnectivityEvent::Connected), 1);
    sm.apply(power(80.0, true, 2), 2);

    match state {
        OperatingState::Nominal => {}
        OperatingState::LowPower => {
            sm.apply(power(20.0, false, 3), 3);
        }
        OperatingState::SafeMode => {
            sm.apply(Event::Command(StateCommand::EnterSafeMode), 3);
        }
        OperatingState::CriticalFault => {
            for t in 3..6 {
                sm.apply(Event::Tick { power_stale: true }, t);
            }
        }
        OperatingState::Shutdown => {
            sm.apply(Event::Command(StateCommand::Shutdown), 3);
        }
        OperatingState::Boot => unreachable!(),
    }
    assert_eq!(sm.state(), state);
    sm
}

const NON_TERMINAL: [OperatingState; 5] = [
    OperatingState::Boot,
    OperatingState::Nominal,
    OperatingState::LowPower,
    OperatingState::SafeMode,
    OperatingState::CriticalFault,
];

#[test]
fn test_power_scenario_through_all_thresholds() {
    let mut sm = StateMachine::new(StateMachineConfig::default(), 0);
    sm.apply(Event::Connectivity(ConnectivityEvent::Connected), 0);

    sm.apply(power(80.0, true, 1), 1);
    assert_eq!(sm.state(), OperatingState::Nominal);
    sm.apply(power(20.0, false, 2), 2);
    assert_eq!(sm.state(), OperatingState::LowPower);
    sm.apply(power(10.0, false, 3), 3);
    assert_eq!(sm.state(), OperatingState::SafeMode);
    sm.apply(power(60.0, true, 4), 4);
    assert_eq!(sm.state(), OperatingState::Nominal);

    let causes: Vec<TransitionCause> = sm.history().map(|c| c.cause).collect();
    assert_eq!(
        causes,
        vec![
            TransitionCause::BootComplete,
            TransitionCause::BatteryLow,
            TransitionCause::BatteryCritical,
            TransitionCause::PowerRestored,
        ]
    );
}

#[test]
fn test_nominal_never_jumps_to_safe_mode_on_power() {
    for battery in (0..=100).map(|b| b as f32) {
        for external in [false, true] {
            let mut sm = machine_in(OperatingState::Nominal);
            sm.apply(power(battery, external, 10), 10);
            assert_ne!(
                sm.state(),
                OperatingState::SafeMode,
                "battery={battery} external={external}"
            );
        }
    }
}

#[test]
fn test_hysteresis_band_holds_state() {
    let mut sm = machine_in(OperatingState::LowPower);
    // Above the low-power line but not above recovery: stays put.
    sm.apply(power(40.0, true, 10), 10);
    assert_eq!(sm.state(), OperatingState::LowPower);
    // Recovery level reached but on battery only.
    sm.apply(power(90.0, false, 11), 11);
    assert_eq!(sm.state(), OperatingState::LowPower);
}

#[test]
fn test_shutdown_is_terminal_from_every_state() {
    for state in NON_TERMINAL {
        let mut sm = machine_in(state);
        let change = sm
            .apply(Event::Command(StateCommand::Shutdown), 100)
            .expect("shutdown transition");
        assert_eq!(change.from, state);
        assert_eq!(sm.state(), OperatingState::Shutdown);

        let history_len = sm.history().count();
        let followups = [
            power(90.0, true, 200),
            power(5.0, false, 201),
            Event::Command(StateCommand::EnterSafeMode),
            Event::Command(StateCommand::Resume),
            Event::Tick { power_stale: true },
            Event::Tick { power_stale: true },
            Event::Tick { power_stale: true },
            Event::Tick { power_stale: true },
            Event::Connectivity(ConnectivityEvent::Disconnected),
            Event::Connectivity(ConnectivityEvent::Connected),
        ];
        for event in followups {
            assert!(sm.apply(event, 300).is_none());
            assert_eq!(sm.state(), OperatingState::Shutdown);
        }
        assert_eq!(sm.history().count(), history_len);
    }
}

#[test]
fn test_stale_ticks_fault_from_every_non_terminal_state() {
    for state in NON_TERMINAL {
        if state == OperatingState::CriticalFault {
            continue;
        }
        let mut sm = machine_in(state);
        assert!(sm.apply(Event::Tick { power_stale: true }, 10).is_none());
        assert!(sm.apply(Event::Tick { power_stale: true }, 11).is_none());
        let change = sm
            .apply(Event::Tick { power_stale: true }, 12)
            .expect("fault after third stale tick");
        assert_eq!(change.from, state);
        assert_eq!(change.to, OperatingState::CriticalFault);
        assert_eq!(change.cause, TransitionCause::PowerDataStale);
    }
}

#[test]
fn test_fresh_reading_resets_stale_count() {
    let mut sm = machine_in(OperatingState::Nominal);
    sm.apply(Event::Tick { power_stale: true }, 10);
    sm.apply(Event::Tick { power_stale: true }, 11);
    sm.apply(power(70.0, true, 12), 12);
    assert_eq!(sm.stale_ticks(), 0);
    sm.apply(Event::Tick { power_stale: true }, 13);
    sm.apply(Event::Tick { power_stale: true }, 14);
    assert_eq!(sm.state(), OperatingState::Nominal);
}

#[test]
fn test_fault_recovery_targets() {
    let mut sm = machine_in(OperatingState::CriticalFault);
    sm.apply(power(20.0, false, 10), 10);
    assert_eq!(sm.state(), OperatingState::LowPower);
    assert_eq!(sm.last_cause(), Some(TransitionCause::FaultRecovered));

    let mut sm = machine_in(OperatingState::CriticalFault);
    sm.apply(power(20.0, true, 10), 10);
    assert_eq!(sm.state(), OperatingState::Nominal);
}

#[test]
fn test_boot_waits_for_connection() {
    let mut sm = StateMachine::new(StateMachineConfig::default(), 0);
    sm.apply(power(80.0, true, 1), 1);
    assert_eq!(sm.state(), OperatingState::Boot);

    sm.apply(Event::Connectivity(ConnectivityEvent::Connected), 2);
    sm.apply(power(80.0, true, 3), 3);
    assert_eq!(sm.state(), OperatingState::Nominal);
}

#[test]
fn test_resume_from_safe_mode() {
    let mut sm = machine_in(OperatingState::SafeMode);
    assert!(sm.validate_command(StateCommand::Resume).is_ok());
    sm.apply(Event::Command(StateCommand::Resume), 10);
    assert_eq!(sm.state(), OperatingState::Nominal);

    let mut sm = machine_in(OperatingState::SafeMode);
    sm.apply(Event::Tick { power_stale: true }, 10);
    assert_eq!(
        sm.validate_command(StateCommand::Resume),
        Err(CommandRejection::ResumeRejected)
    );
}

#[test]
fn test_history_is_bounded() {
    let mut sm = machine_in(OperatingState::Nominal);
    for i in 0..(HISTORY_CAPACITY as u64 * 2) {
        sm.apply(Event::Command(StateCommand::EnterSafeMode), 10 + 2 * i);
        sm.apply(power(90.0, true, 11 + 2 * i), 11 + 2 * i);
    }
    assert_eq!(sm.history().count(), HISTORY_CAPACITY);
    let last = sm.history().last().unwrap();
    assert_eq!(last.to, OperatingState::Nominal);
}
