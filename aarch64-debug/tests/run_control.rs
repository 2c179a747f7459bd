mod common;

use aarch64_debug::{
    architecture::armv8a::instructions::{NOP, WFI},
    CoreStatus, Error, HaltReason, RegisterId, ResumeOptions, TargetEvent,
};
use common::{cluster, open, record_events, start_at, CLUSTER, PC, SPIN};
use pretty_assertions::assert_eq;

#[test]
fn halt_read_registers_and_resume() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[SPIN]);
    target.set_register(2, 5, 0xdead_beef);

    let info = session.halt(2).expect("Failed to halt cpu2");
    assert_eq!(info.pc, 0x1000);
    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Request)
    );

    {
        let mut core = session.core(2).unwrap();
        assert_eq!(core.read_core_reg(RegisterId::x(5)).unwrap(), 0xdead_beef);
        core.write_core_reg(RegisterId::x(6), 42).unwrap();
    }

    session
        .resume(2, ResumeOptions::default())
        .expect("Failed to resume cpu2");

    assert_eq!(session.cached_status(2).unwrap(), CoreStatus::Running);
    assert!(!target.is_halted(2));
    assert_eq!(target.register(2, 6), 42);
    assert_eq!(target.register(2, 5), 0xdead_beef);
}

#[test]
fn halt_of_halted_core_keeps_state() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[SPIN]);

    session.halt(2).unwrap();
    let info = session.halt(2).unwrap();

    assert_eq!(info.pc, 0x1000);
    assert!(session.cached_status(2).unwrap().is_halted());
}

#[test]
fn resume_of_running_core_is_rejected() {
    let (mut session, _target) = cluster();

    assert!(matches!(
        session.resume(2, ResumeOptions::default()),
        Err(Error::NotHalted(2))
    ));
}

#[test]
fn resume_at_address() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[SPIN]);
    target.load_program(0x2000, &[NOP, NOP, SPIN]);

    session.halt(2).unwrap();
    session
        .resume(
            2,
            ResumeOptions {
                address: Some(0x2000),
                ..Default::default()
            },
        )
        .unwrap();

    session.halt(2).unwrap();
    assert_eq!(target.register(2, PC), 0x2008);
}

#[test]
fn events_are_dispatched_for_halt_and_resume() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[SPIN]);
    let events = record_events(&mut session);

    session.halt(2).unwrap();
    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(
        *events.borrow(),
        vec![(2, TargetEvent::Halted), (2, TargetEvent::Resumed)]
    );
}

#[test]
fn single_step_executes_one_instruction() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, SPIN]);

    session.halt(2).unwrap();
    let info = session.step(2, None, false).expect("Failed to step");

    assert_eq!(info.pc, 0x1004);
    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Step)
    );
    assert!(target.is_halted(2));
}

#[test]
fn step_over_wfi_forces_a_halt() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[WFI, NOP, SPIN]);

    session.halt(2).unwrap();
    let info = session.step(2, None, false).expect("Failed to step over WFI");

    assert_eq!(info.pc, 0x1004);
    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Request)
    );
}

#[test]
fn waiting_core_can_be_halted() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[WFI, SPIN]);
    session.halt(2).unwrap();

    session.resume(2, ResumeOptions::default()).unwrap();
    assert!(target.is_waiting(2));
    assert_eq!(session.poll(2).unwrap(), CoreStatus::Running);

    let info = session.halt(2).unwrap();
    assert_eq!(info.pc, 0x1004);
    assert!(!target.is_waiting(2));
}

#[test]
fn step_through_core_handle() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, SPIN]);
    session.halt(2).unwrap();

    let mut core = session.core(2).unwrap();
    let info = core.step(Some(0x1004), false).unwrap();

    assert_eq!(info.pc, 0x1008);
    assert_eq!(core.status().unwrap(), CoreStatus::Halted(HaltReason::Step));
}

#[test]
fn smp_halt_reaches_every_member() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    let events = record_events(&mut session);

    let info = session.halt(1).expect("Failed to halt the cluster");

    assert_eq!(info.pc, 0x2000);
    for core in [0, 1] {
        assert_eq!(
            session.cached_status(core).unwrap(),
            CoreStatus::Halted(HaltReason::Request)
        );
        assert!(target.is_halted(core));
    }
    assert!(!target.is_halted(2));
    assert_eq!(
        *events.borrow(),
        vec![(0, TargetEvent::Halted), (1, TargetEvent::Halted)]
    );
}

#[test]
fn smp_halt_retries_a_lost_request() {
    let (mut session, target) = cluster();
    target.ignore_halt_requests(1, 1);

    session.halt(0).expect("Retry should halt cpu1");

    assert!(session.cached_status(0).unwrap().is_halted());
    assert!(session.cached_status(1).unwrap().is_halted());
}

#[test]
fn smp_halt_without_retry_times_out() {
    let yaml = CLUSTER.replace(
        "    cores: [cpu0, cpu1]\n",
        "    cores: [cpu0, cpu1]\n    smp_halt_retry: false\n",
    );
    let (mut session, target) = open(&yaml);
    target.ignore_halt_requests(1, 1);

    let result = session.halt(0);

    assert!(matches!(
        result,
        Err(Error::Timeout {
            core: 1,
            operation: "SMP halt"
        })
    ));
    assert!(target.is_halted(0));
    assert!(!target.is_halted(1));
}

#[test]
fn unhaltable_member_times_out() {
    let (mut session, target) = cluster();
    target.set_unhaltable(1, true);

    assert!(matches!(
        session.halt(0),
        Err(Error::Timeout {
            core: 1,
            operation: "SMP halt"
        })
    ));
}

#[test]
fn smp_resume_restarts_every_member() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();
    let events = record_events(&mut session);

    session.resume(0, ResumeOptions::default()).unwrap();

    for core in [0, 1] {
        assert_eq!(session.cached_status(core).unwrap(), CoreStatus::Running);
        assert!(!target.is_halted(core));
    }
    assert_eq!(
        *events.borrow(),
        vec![(1, TargetEvent::Resumed), (0, TargetEvent::Resumed)]
    );
    // Halt channel closed, restart channel open.
    assert_eq!(target.cti_gate(0), 0b10);
    assert_eq!(target.cti_gate(1), 0b10);
}

#[test]
fn smp_halt_reaches_a_debug_running_member() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();
    session
        .resume(
            0,
            ResumeOptions {
                debug_execution: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(session.cached_status(0).unwrap(), CoreStatus::DebugRunning);
    let events = record_events(&mut session);

    let info = session.halt(0).expect("Failed to halt the cluster");

    assert_eq!(info.pc, 0x1000);
    for core in [0, 1] {
        assert!(target.is_halted(core));
        assert_eq!(
            session.cached_status(core).unwrap(),
            CoreStatus::Halted(HaltReason::Request)
        );
    }
    assert_eq!(
        *events.borrow(),
        vec![(0, TargetEvent::DebugHalted), (1, TargetEvent::Halted)]
    );
}

#[test]
fn core_handle_resume_leaves_peers_halted() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();

    session
        .core(0)
        .unwrap()
        .resume(ResumeOptions::default())
        .unwrap();

    assert!(!target.is_halted(0));
    assert!(target.is_halted(1));
}

#[test]
fn smp_step_resumes_peers() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[NOP, SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();

    let info = session.step(0, None, false).expect("Failed to step cpu0");

    assert_eq!(info.pc, 0x1004);
    assert!(target.is_halted(0));
    assert!(!target.is_halted(1));
    assert_eq!(session.cached_status(1).unwrap(), CoreStatus::Running);
}

#[test]
fn member_halting_on_its_own_halts_the_group() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[NOP, NOP, SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();
    session
        .core(0)
        .unwrap()
        .add_breakpoint(0x1004, 4, aarch64_debug::BreakpointKind::Hardware)
        .unwrap();
    session.resume(0, ResumeOptions::default()).unwrap();
    let events = record_events(&mut session);

    let status = session.poll(0).unwrap();

    assert_eq!(
        status,
        CoreStatus::Halted(HaltReason::Breakpoint(
            aarch64_debug::BreakpointCause::Hardware
        ))
    );
    assert_eq!(
        session.cached_status(1).unwrap(),
        CoreStatus::Halted(HaltReason::Request)
    );
    assert!(target.is_halted(1));
    assert_eq!(
        *events.borrow(),
        vec![(0, TargetEvent::Halted), (1, TargetEvent::Halted)]
    );
}

#[test]
fn foreground_core_is_left_to_its_own_poll() {
    let (mut session, target) = cluster();
    start_at(&target, 0, 0x1000, &[NOP, NOP, SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();
    session
        .core(0)
        .unwrap()
        .add_breakpoint(0x1004, 4, aarch64_debug::BreakpointKind::Hardware)
        .unwrap();
    session.resume(0, ResumeOptions::default()).unwrap();
    session.set_foreground_core(Some(1)).unwrap();
    let events = record_events(&mut session);

    session.poll(0).unwrap();

    assert!(target.is_halted(1));
    assert_eq!(session.cached_status(1).unwrap(), CoreStatus::Running);
    assert_eq!(*events.borrow(), vec![(0, TargetEvent::Halted)]);

    assert_eq!(
        session.poll(1).unwrap(),
        CoreStatus::Halted(HaltReason::Request)
    );
    assert_eq!(
        *events.borrow(),
        vec![(0, TargetEvent::Halted), (1, TargetEvent::Halted)]
    );
}

#[test]
fn poll_all_reports_nothing_for_idle_cores() {
    let (mut session, _target) = cluster();
    let events = record_events(&mut session);

    session.poll_all().unwrap();

    assert!(events.borrow().is_empty());
}

#[test]
fn powered_down_member_is_skipped() {
    let config = aarch64_debug::SessionConfig::from_yaml_str(CLUSTER).unwrap();
    let target = aarch64_debug::FakeTarget::from_config(&config);
    target.set_powered(1, false);

    let mut session = aarch64_debug::Session::new(Box::new(target.clone()), &config)
        .expect("A powered down core must not fail the session");

    assert_eq!(session.cached_status(1).unwrap(), CoreStatus::Unknown);

    session.halt(0).expect("Failed to halt the powered members");
    assert!(target.is_halted(0));
    assert!(!target.is_halted(1));
}

#[test]
fn lost_probe_is_reported() {
    let (mut session, target) = cluster();
    target.fail_transport_after(0);

    assert!(matches!(
        session.halt(2),
        Err(Error::Transport(aarch64_debug::TransportError::NotConnected))
    ));
}
