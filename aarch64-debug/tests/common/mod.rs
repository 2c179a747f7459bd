#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use aarch64_debug::{FakeTarget, Session, SessionConfig, TargetEvent};

pub const CLUSTER: &str = include_str!("../cluster.yaml");

/// `B .`
pub const SPIN: u32 = 0x1400_0000;
/// `STR W2, [X1]`
pub const STORE_W2_TO_X1: u32 = 0xB900_0022;
/// `LDR W3, [X1]`
pub const LOAD_W3_FROM_X1: u32 = 0xB940_0023;
/// `SVC #0`
pub const SVC_0: u32 = 0xD400_0001;

pub const PC: usize = 32;

pub fn open(yaml: &str) -> (Session, FakeTarget) {
    let _ = pretty_env_logger::try_init();

    let config = SessionConfig::from_yaml_str(yaml).expect("Failed to parse the configuration");
    let target = FakeTarget::from_config(&config);
    let session =
        Session::new(Box::new(target.clone()), &config).expect("Failed to open the session");

    (session, target)
}

pub fn cluster() -> (Session, FakeTarget) {
    open(CLUSTER)
}

/// The cluster configuration with cpu2 halting on reset.
pub fn cluster_with_cpu2_reset_catch(extra: &str) -> String {
    CLUSTER.replace(
        "    cti: cti2\n",
        &format!("    cti: cti2\n    reset_catch: halt\n{extra}"),
    )
}

/// Records every event the session dispatches.
pub fn record_events(session: &mut Session) -> Rc<RefCell<Vec<(usize, TargetEvent)>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    session.add_event_listener(move |core, event| sink.borrow_mut().push((core, event)));

    events
}

/// Place `program` at `address` and point the PC of `core` at it.
pub fn start_at(target: &FakeTarget, core: usize, address: u64, program: &[u32]) {
    target.load_program(address, program);
    target.set_register(core, PC, address);
}
