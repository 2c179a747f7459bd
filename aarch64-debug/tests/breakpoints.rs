mod common;

use aarch64_debug::{
    architecture::armv8a::{
        instructions::{build_hlt, build_hlt_t32, build_movz, NOP},
        Armv8aError,
    },
    BreakpointCause, BreakpointKind, CoreStatus, Error, HaltReason, ResumeOptions, SlotResource,
    TransportError, WatchpointAccess,
};
use common::{cluster, start_at, LOAD_W3_FROM_X1, PC, SPIN, STORE_W2_TO_X1};
use pretty_assertions::assert_eq;
use rand::prelude::*;
use test_case::test_case;

/// Debug register base of cpu2.
const CPU2_DEBUG: u64 = 0x8001_4000;

const ENABLE: u32 = 1;

#[test]
fn hardware_breakpoint_halts_the_core() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, NOP, SPIN]);
    session.halt(2).unwrap();

    session
        .core(2)
        .unwrap()
        .add_breakpoint(0x1008, 4, BreakpointKind::Hardware)
        .expect("Failed to set a breakpoint");
    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(
        session.poll(2).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Hardware))
    );
    assert_eq!(target.register(2, PC), 0x1008);
}

#[test]
fn resume_steps_over_breakpoint_at_pc() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, SPIN]);
    session.halt(2).unwrap();
    session
        .core(2)
        .unwrap()
        .add_breakpoint(0x1000, 4, BreakpointKind::Hardware)
        .unwrap();

    session
        .resume(
            2,
            ResumeOptions {
                handle_breakpoints: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(session.poll(2).unwrap(), CoreStatus::Running);
    assert!(!target.is_halted(2));
    // Put back after the step.
    assert_eq!(target.breakpoint_unit(2, 0).1 & ENABLE, ENABLE);
}

#[test]
fn breakpoints_use_distinct_units() {
    let (mut session, target) = cluster();
    let mut core = session.core(2).unwrap();

    for address in [0x1000, 0x2000, 0x3000] {
        core.add_breakpoint(address, 4, BreakpointKind::Hardware)
            .unwrap();
    }

    let values: Vec<u64> = (0..3).map(|slot| target.breakpoint_unit(2, slot).0).collect();
    assert_eq!(values, vec![0x1000, 0x2000, 0x3000]);
    assert_eq!(target.breakpoint_unit(2, 3).1, 0);
}

#[test]
fn address_units_run_out() {
    let (mut session, _target) = cluster();
    let mut core = session.core(2).unwrap();

    let ids: Vec<_> = (0..4)
        .map(|n| {
            core.add_breakpoint(0x1000 + n * 4, 4, BreakpointKind::Hardware)
                .unwrap()
        })
        .collect();

    assert!(matches!(
        core.add_breakpoint(0x2000, 4, BreakpointKind::Hardware),
        Err(Error::ResourceExhausted {
            core: 2,
            resource: SlotResource::Breakpoint
        })
    ));

    core.remove_breakpoint(ids[1]).unwrap();
    core.add_breakpoint(0x2000, 4, BreakpointKind::Hardware)
        .expect("A released unit must be reusable");
}

#[test]
fn random_add_and_remove_keeps_units_consistent() {
    let (mut session, target) = cluster();
    let mut core = session.core(2).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut live = Vec::new();

    for _ in 0..200 {
        if live.len() < 4 && (live.is_empty() || rng.gen_bool(0.6)) {
            let address = 0x1000 + rng.gen_range(0..0x400u64) * 4;
            let id = core
                .add_breakpoint(address, 4, BreakpointKind::Hardware)
                .unwrap();
            live.push((id, address));
        } else if live.len() == 4 && rng.gen_bool(0.2) {
            assert!(matches!(
                core.add_breakpoint(0x8000, 4, BreakpointKind::Hardware),
                Err(Error::ResourceExhausted { .. })
            ));
        } else {
            let (id, _) = live.swap_remove(rng.gen_range(0..live.len()));
            core.remove_breakpoint(id).unwrap();
        }

        let mut programmed: Vec<u64> = (0..4)
            .map(|slot| target.breakpoint_unit(2, slot))
            .filter(|(_, control)| control & ENABLE != 0)
            .map(|(value, _)| value)
            .collect();
        let mut expected: Vec<u64> = live.iter().map(|(_, address)| *address).collect();
        programmed.sort_unstable();
        expected.sort_unstable();
        assert_eq!(programmed, expected);
    }
}

#[test]
fn context_breakpoint_matches_context_id() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, SPIN]);
    target.set_contextidr(2, 0x42);
    session.halt(2).unwrap();

    session
        .core(2)
        .unwrap()
        .add_context_breakpoint(0x42, 4)
        .unwrap();
    // Context units are the top two.
    assert_eq!(target.breakpoint_unit(2, 4).0, 0x42);

    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(
        session.poll(2).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Hardware))
    );
}

#[test_case(0x42, true ; "matching context")]
#[test_case(0x43, false ; "other context")]
fn hybrid_breakpoint(contextidr: u32, halts: bool) {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, SPIN]);
    target.set_contextidr(2, contextidr);
    session.halt(2).unwrap();

    session
        .core(2)
        .unwrap()
        .add_hybrid_breakpoint(0x1004, 0x42, 4)
        .unwrap();
    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(session.poll(2).unwrap().is_halted(), halts);
    if halts {
        assert_eq!(target.register(2, PC), 0x1004);
    }
}

#[test]
fn hybrid_breakpoint_needs_both_units() {
    let (mut session, _target) = cluster();
    let mut core = session.core(2).unwrap();

    for n in 0..4 {
        core.add_breakpoint(0x1000 + n * 4, 4, BreakpointKind::Hardware)
            .unwrap();
    }

    assert!(matches!(
        core.add_hybrid_breakpoint(0x2000, 1, 4),
        Err(Error::ResourceExhausted {
            resource: SlotResource::Breakpoint,
            ..
        })
    ));

    // No context unit was claimed on the way.
    core.add_context_breakpoint(1, 4).unwrap();
    core.add_context_breakpoint(2, 4).unwrap();
    assert!(matches!(
        core.add_context_breakpoint(3, 4),
        Err(Error::ResourceExhausted {
            resource: SlotResource::ContextBreakpoint,
            ..
        })
    ));
}

#[test]
fn failed_hybrid_breakpoint_releases_context_unit() {
    let (mut session, target) = cluster();
    // Value register of address unit 0.
    target.fail_write_to(CPU2_DEBUG + 0x400);

    let mut core = session.core(2).unwrap();
    assert!(matches!(
        core.add_hybrid_breakpoint(0x2000, 7, 4),
        Err(Error::Transport(TransportError::Fault { .. }))
    ));
    assert_eq!(target.breakpoint_unit(2, 4).1 & ENABLE, 0);

    core.add_context_breakpoint(1, 4).unwrap();
    core.add_context_breakpoint(2, 4).unwrap();
    core.add_breakpoint(0x2000, 4, BreakpointKind::Hardware)
        .unwrap();
}

#[test]
fn unsupported_breakpoint_length() {
    let (mut session, _target) = cluster();

    assert!(matches!(
        session
            .core(2)
            .unwrap()
            .add_breakpoint(0x1000, 8, BreakpointKind::Hardware),
        Err(Error::Armv8a(_))
    ));
}

#[test_case(4, build_hlt(0xB).to_le_bytes().to_vec() ; "a64")]
#[test_case(2, build_hlt_t32(0xB).to_le_bytes().to_vec() ; "t32")]
fn software_breakpoint_round_trip(length: u32, trap: Vec<u8>) {
    let (mut session, target) = cluster();
    let original = [0x1F, 0x20, 0x03, 0xD5];
    target.write_memory(0x1000, &original);
    start_at(&target, 2, 0x2000, &[SPIN]);
    session.halt(2).unwrap();

    let mut core = session.core(2).unwrap();
    let id = core
        .add_breakpoint(0x1000, length, BreakpointKind::Software)
        .expect("Failed to set a software breakpoint");

    let mut expected = original.to_vec();
    expected[..trap.len()].copy_from_slice(&trap);
    assert_eq!(target.read_memory(0x1000, 4), expected);
    assert!(target.cache_maintenance_count(2) > 0);

    core.remove_breakpoint(id).unwrap();
    assert_eq!(target.read_memory(0x1000, 4), original.to_vec());
}

#[test]
fn software_breakpoint_twice_at_one_address() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, SPIN]);
    session.halt(2).unwrap();

    let mut core = session.core(2).unwrap();
    core.add_breakpoint(0x1000, 4, BreakpointKind::Software)
        .unwrap();

    assert!(matches!(
        core.add_breakpoint(0x1000, 4, BreakpointKind::Software),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn software_breakpoint_is_hit_and_stepped_over() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, NOP, SPIN]);
    session.halt(2).unwrap();
    session
        .core(2)
        .unwrap()
        .add_breakpoint(0x1004, 4, BreakpointKind::Software)
        .unwrap();

    session.resume(2, ResumeOptions::default()).unwrap();
    assert_eq!(
        session.poll(2).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Software))
    );
    assert_eq!(target.register(2, PC), 0x1004);

    session
        .resume(
            2,
            ResumeOptions {
                handle_breakpoints: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(session.poll(2).unwrap(), CoreStatus::Running);
    assert_eq!(
        target.memory_word(0x1004),
        build_hlt(0xB),
        "the trap is back in place"
    );
}

#[test]
fn step_from_software_breakpoint_reinserts_the_trap() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, NOP, SPIN]);
    session.halt(2).unwrap();
    session
        .core(2)
        .unwrap()
        .add_breakpoint(0x1000, 4, BreakpointKind::Software)
        .unwrap();

    let info = session
        .step(2, None, true)
        .expect("Failed to step off the breakpoint");

    assert_eq!(info.pc, 0x1004);
    assert_eq!(
        session.cached_status(2).unwrap(),
        CoreStatus::Halted(HaltReason::Step)
    );
    assert_eq!(target.memory_word(0x1000), build_hlt(0xB));
}

#[test]
fn lost_restore_write_is_repeated() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, SPIN]);
    session.halt(2).unwrap();
    let mut core = session.core(2).unwrap();
    let id = core
        .add_breakpoint(0x1000, 4, BreakpointKind::Software)
        .unwrap();

    target.lose_writes_to(0x1000, 1);
    core.remove_breakpoint(id)
        .expect("The second restore should stick");

    assert_eq!(target.memory_word(0x1000), NOP);
}

#[test]
fn restore_that_never_sticks_is_reported() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, SPIN]);
    session.halt(2).unwrap();
    let mut core = session.core(2).unwrap();
    let id = core
        .add_breakpoint(0x1000, 4, BreakpointKind::Software)
        .unwrap();

    target.lose_writes_to(0x1000, 2);

    assert!(matches!(
        core.remove_breakpoint(id),
        Err(Error::Armv8a(Armv8aError::BreakpointRestoreFailed(0x1000)))
    ));
    assert_eq!(target.memory_word(0x1000), build_hlt(0xB));
}

#[test]
fn session_drop_restores_software_breakpoints() {
    let (mut session, target) = cluster();
    start_at(&target, 2, 0x1000, &[NOP, SPIN]);
    session.halt(2).unwrap();
    session
        .core(2)
        .unwrap()
        .add_breakpoint(0x1000, 4, BreakpointKind::Software)
        .unwrap();

    drop(session);

    assert_eq!(target.memory_word(0x1000), NOP);
}

fn watch_program(target: &aarch64_debug::FakeTarget, access: u32) {
    start_at(
        target,
        2,
        0x1000,
        &[build_movz(1, 0x2000, 0), build_movz(2, 0x55, 0), access, SPIN],
    );
}

#[test_case(STORE_W2_TO_X1, WatchpointAccess::Write, true ; "store on write watch")]
#[test_case(STORE_W2_TO_X1, WatchpointAccess::Read, false ; "store on read watch")]
#[test_case(LOAD_W3_FROM_X1, WatchpointAccess::Read, true ; "load on read watch")]
#[test_case(LOAD_W3_FROM_X1, WatchpointAccess::ReadWrite, true ; "load on access watch")]
fn watchpoint(instruction: u32, access: WatchpointAccess, halts: bool) {
    let (mut session, target) = cluster();
    watch_program(&target, instruction);
    session.halt(2).unwrap();

    session
        .core(2)
        .unwrap()
        .add_watchpoint(0x2000, 4, access)
        .unwrap();
    session.resume(2, ResumeOptions::default()).unwrap();

    let status = session.poll(2).unwrap();
    if halts {
        assert_eq!(status, CoreStatus::Halted(HaltReason::Watchpoint));
        assert_eq!(target.register(2, PC), 0x1008);
        assert_eq!(
            session.core(2).unwrap().watchpoint_hit_address(),
            Some(0x2000)
        );
    } else {
        assert_eq!(status, CoreStatus::Running);
        assert_eq!(target.memory_word(0x2000), 0x55);
    }
}

#[test]
fn large_watchpoint_uses_address_mask() {
    let (mut session, target) = cluster();
    watch_program(&target, STORE_W2_TO_X1);
    session.halt(2).unwrap();

    session
        .core(2)
        .unwrap()
        .add_watchpoint(0x2000, 0x100, WatchpointAccess::Write)
        .unwrap();
    session.resume(2, ResumeOptions::default()).unwrap();

    assert_eq!(
        session.poll(2).unwrap(),
        CoreStatus::Halted(HaltReason::Watchpoint)
    );
}

#[test]
fn watchpoint_units_run_out() {
    let (mut session, target) = cluster();
    let mut core = session.core(2).unwrap();

    let ids: Vec<_> = (0..4)
        .map(|n| {
            core.add_watchpoint(0x2000 + n * 8, 4, WatchpointAccess::Write)
                .unwrap()
        })
        .collect();
    assert!(matches!(
        core.add_watchpoint(0x3000, 4, WatchpointAccess::Write),
        Err(Error::ResourceExhausted {
            resource: SlotResource::Watchpoint,
            ..
        })
    ));

    core.remove_watchpoint(ids[2]).unwrap();
    assert_eq!(target.watchpoint_unit(2, 2).1, 0);
    core.add_watchpoint(0x3000, 4, WatchpointAccess::Write)
        .unwrap();
    assert_eq!(target.watchpoint_unit(2, 2).0, 0x3000);
}

#[test]
fn unaligned_watchpoint_window_is_rejected() {
    let (mut session, target) = cluster();

    assert!(matches!(
        session
            .core(2)
            .unwrap()
            .add_watchpoint(0x2006, 4, WatchpointAccess::Write),
        Err(Error::Armv8a(_))
    ));
    assert_eq!(target.watchpoint_unit(2, 0).1, 0);
}
