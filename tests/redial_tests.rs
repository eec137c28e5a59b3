use std::cell::RefCell;
use std::rc::Rc;

use ecallsim::config::{EcallConfig, OperatingMode, RedialConfig, RedialPolicy, TimerConfig};
use ecallsim::ecall::{EcallSession, EcallStateId, EcallStateMachine};
use ecallsim::service::{
    CallService, CallState, Notification, RedialReason, SimulatedCallService, TimerEvent,
};
use ecallsim::timers::{TimerId, TimerStatus};

type SharedSim = Rc<RefCell<SimulatedCallService>>;

fn redial_config(policy: RedialPolicy) -> EcallConfig {
    let mut config = EcallConfig::default();
    config.policy = policy;
    config.timers = TimerConfig {
        t2_ms: 30_000,
        t7_ms: 4_000,
        t9_ms: 60_000,
        t10_ms: 90_000,
    };
    config.redial = RedialConfig {
        call_orig_gaps_ms: vec![100, 200, 300],
        call_drop_gaps_ms: vec![100, 200],
    };
    config
}

fn build(config: &EcallConfig) -> (EcallStateMachine, SharedSim) {
    let service = Rc::new(RefCell::new(SimulatedCallService::new(config)));
    let ecall = EcallStateMachine::new(service.clone(), EcallSession::from_config(config));
    (ecall, service)
}

fn count_call_states(journal: &[Notification], wanted: CallState) -> usize {
    journal
        .iter()
        .filter(|entry| {
            matches!(entry, Notification::CallState { state, .. } if *state == wanted)
        })
        .count()
}

fn count_redials(journal: &[Notification], wanted_redial: bool, wanted: RedialReason) -> usize {
    journal
        .iter()
        .filter(|entry| {
            matches!(
                entry,
                Notification::Redial { will_redial, reason, .. }
                    if *will_redial == wanted_redial && *reason == wanted
            )
        })
        .count()
}

fn timer_entries(journal: &[Notification], wanted: TimerId) -> Vec<TimerEvent> {
    journal
        .iter()
        .filter_map(|entry| match entry {
            Notification::Timer { timer, event } if *timer == wanted => Some(*event),
            _ => None,
        })
        .collect()
}

#[test]
fn test_callorig_runs_every_configured_attempt() {
    let config = redial_config(RedialPolicy::CallOrig);
    let (mut ecall, service) = build(&config);

    ecall.start();
    assert_eq!(ecall.current_state_id(), EcallStateId::PsapCallback as u32);
    service.borrow_mut().take_notifications();

    ecall.run_until_idle();

    assert_eq!(ecall.current_state_id(), EcallStateId::ModemRedial as u32);
    let svc = service.borrow();
    let journal = svc.notifications();

    // Three configured attempts: three dialing/ended cycles, two will-redial
    // notices and one exhausted notice.
    assert_eq!(count_call_states(journal, CallState::Dialing), 3);
    assert_eq!(count_call_states(journal, CallState::Ended), 3);
    assert_eq!(
        count_redials(journal, true, RedialReason::CallOrigFailure),
        2
    );
    assert_eq!(
        count_redials(journal, false, RedialReason::MaxRedialAttempted),
        1
    );
    // Normal operating mode never touches T10.
    assert!(timer_entries(journal, TimerId::T10).is_empty());
}

#[test]
fn test_callorig_under_ecall_only_wraps_attempts_with_t10() {
    let mut config = redial_config(RedialPolicy::CallOrig);
    config.operating_mode = OperatingMode::EcallOnly;
    let (mut ecall, service) = build(&config);

    ecall.start();
    service.borrow_mut().take_notifications();
    ecall.run_until_idle();

    let svc = service.borrow();
    let t10 = timer_entries(svc.notifications(), TimerId::T10);

    // Start/stop around each intermediate attempt, one final start for the
    // callback window.
    assert_eq!(
        t10,
        vec![
            TimerEvent::Started,
            TimerEvent::Stopped,
            TimerEvent::Started,
            TimerEvent::Stopped,
            TimerEvent::Started,
        ]
    );
    assert_eq!(svc.timer_status(TimerId::T10), TimerStatus::Active);
}

#[test]
fn test_calldrop_redials_without_t10_activity() {
    let mut config = redial_config(RedialPolicy::CallDrop);
    config.operating_mode = OperatingMode::EcallOnly;
    let (mut ecall, service) = build(&config);

    ecall.start();
    assert_eq!(ecall.current_state_id(), EcallStateId::DecodeSendMsd as u32);

    // The armed T5 watcher forces the transmission failure that drops the
    // call into the callback/redial path.
    service.borrow_mut().advance(5_000);
    ecall.run_until_idle();

    assert_eq!(ecall.current_state_id(), EcallStateId::ModemRedial as u32);
    let svc = service.borrow();
    let journal = svc.notifications();

    assert!(
        timer_entries(journal, TimerId::T10).is_empty(),
        "CALLDROP sessions must never touch T10"
    );
    assert_eq!(count_redials(journal, true, RedialReason::CallDrop), 2);
    assert_eq!(count_redials(journal, true, RedialReason::CallOrigFailure), 0);
    assert_eq!(
        count_redials(journal, false, RedialReason::MaxRedialAttempted),
        1
    );
}

#[test]
fn test_redial_expiries_only_settle_bookkeeping() {
    let mut config = redial_config(RedialPolicy::CallOrig);
    config.timers.t9_ms = 2_000;
    let (mut ecall, _service) = build(&config);

    ecall.start();
    ecall.run_until_idle();
    assert_eq!(ecall.current_state_id(), EcallStateId::ModemRedial as u32);

    // T9 came due while the retry loop was pacing; its delivery inside
    // ModemRedial must not move or stop the machine.
    ecall.run_until_idle();
    assert!(ecall.is_started());
    assert_eq!(ecall.current_state_id(), EcallStateId::ModemRedial as u32);
}

#[test]
fn test_new_attempt_resets_callback_timers() {
    let mut config = redial_config(RedialPolicy::CallOrig);
    config.operating_mode = OperatingMode::EcallOnly;
    let (mut ecall, service) = build(&config);

    ecall.start();
    ecall.run_until_idle();
    assert_eq!(
        service.borrow().timer_status(TimerId::T10),
        TimerStatus::Active
    );

    // A superseding attempt on the same line: starting T2 clears the
    // leftover callback-window timers.
    ecall.stop();
    let mut follow_up = redial_config(RedialPolicy::Success);
    follow_up.operating_mode = OperatingMode::EcallOnly;
    let mut second =
        EcallStateMachine::new(service.clone(), EcallSession::from_config(&follow_up));
    service.borrow_mut().take_notifications();
    second.start();

    assert_eq!(
        service.borrow().timer_status(TimerId::T10),
        TimerStatus::Inactive
    );
    let svc = service.borrow();
    assert!(timer_entries(svc.notifications(), TimerId::T10).contains(&TimerEvent::Stopped));
}
