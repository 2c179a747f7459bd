mod common;

use aarch64_debug::{
    architecture::armv8a::{debug_regs::Edscr, instructions::NOP},
    BreakpointCause, BreakpointKind, CoreStatus, HaltReason, RegisterId, ResumeOptions,
    TargetEvent,
};
use common::{cluster, cluster_with_cpu2_reset_catch, open, record_events, start_at, SPIN};
use pretty_assertions::assert_eq;

const RESET_VECTOR: u64 = 0x4000;

#[test]
fn reset_catch_halts_at_the_reset_vector() {
    let (mut session, target) = open(&cluster_with_cpu2_reset_catch(""));
    target.set_reset_vector(2, RESET_VECTOR);
    target.load_program(RESET_VECTOR, &[NOP, SPIN]);
    let events = record_events(&mut session);

    session.assert_reset(2).expect("Failed to assert reset");
    assert_eq!(session.cached_status(2).unwrap(), CoreStatus::Reset);
    session.deassert_reset(2).expect("Failed to release reset");

    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Exception)
    );
    assert_eq!(target.halt_status(2), Edscr::STATUS_RESET_CATCH);
    assert_eq!(
        session
            .core(2)
            .unwrap()
            .read_core_reg(RegisterId::PC)
            .unwrap(),
        RESET_VECTOR
    );
    assert_eq!(
        *events.borrow(),
        vec![
            (0, TargetEvent::ResetAsserted),
            (1, TargetEvent::ResetAsserted),
            (2, TargetEvent::ResetAsserted),
            (0, TargetEvent::ResetDeasserted),
            (1, TargetEvent::ResetDeasserted),
            (2, TargetEvent::ResetDeasserted),
            (2, TargetEvent::Halted),
        ]
    );
}

#[test]
fn core_runs_after_reset_without_catch() {
    let (mut session, target) = cluster();
    target.set_reset_vector(2, RESET_VECTOR);
    target.load_program(RESET_VECTOR, &[NOP, NOP, SPIN]);

    session.assert_reset(2).unwrap();
    session.deassert_reset(2).unwrap();

    assert_eq!(session.cached_status(2).unwrap(), CoreStatus::Running);
    let info = session.halt(2).unwrap();
    assert_eq!(info.pc, RESET_VECTOR + 8);
}

#[test]
fn breakpoints_survive_reset() {
    let (mut session, target) = open(&cluster_with_cpu2_reset_catch(""));
    target.set_reset_vector(2, RESET_VECTOR);
    target.load_program(RESET_VECTOR, &[NOP, NOP, SPIN]);
    session
        .core(2)
        .unwrap()
        .add_breakpoint(RESET_VECTOR + 4, 4, BreakpointKind::Hardware)
        .unwrap();

    session.assert_reset(2).unwrap();
    assert_eq!(target.breakpoint_unit(2, 0).1 & 1, 0, "reset clears the units");
    session.deassert_reset(2).unwrap();
    let (value, control) = target.breakpoint_unit(2, 0);
    assert_eq!(value, RESET_VECTOR + 4);
    assert_eq!(control & 1, 1);

    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(
        session.poll(2).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Hardware))
    );
    assert_eq!(target.register(2, common::PC), RESET_VECTOR + 4);
}

#[test]
fn warm_reset_leaves_other_cores_alone() {
    let (mut session, target) =
        open(&cluster_with_cpu2_reset_catch("    reset_strategy: warm_reset\n"));
    target.set_reset_vector(2, RESET_VECTOR);
    target.load_program(RESET_VECTOR, &[SPIN]);
    start_at(&target, 0, 0x1000, &[SPIN]);
    start_at(&target, 1, 0x2000, &[SPIN]);
    session.halt(0).unwrap();
    let events = record_events(&mut session);

    session.assert_reset(2).unwrap();
    session.deassert_reset(2).unwrap();

    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Exception)
    );
    for core in [0, 1] {
        assert!(target.is_halted(core));
        assert_eq!(
            session.cached_status(core).unwrap(),
            CoreStatus::Halted(HaltReason::Request)
        );
    }
    assert_eq!(
        *events.borrow(),
        vec![
            (2, TargetEvent::ResetAsserted),
            (2, TargetEvent::ResetDeasserted),
            (2, TargetEvent::Halted),
        ]
    );
}
