//! # Run control for multi-core ARMv8-A targets
//!
//! This crate drives the external debug interface of AArch64 cores: halting and
//! resuming them, single stepping, hardware and software breakpoints, watchpoints,
//! memory access through the core and running code on behalf of the debugger. Cores of an
//! SMP cluster are halted and restarted together through their cross trigger interfaces.
//!
//! The debug port itself is abstracted by [`RegisterTransport`]. Any probe that can move
//! 32-bit words to addresses behind an access port can drive a target.
//!
//! # Examples
//!
//! ## Halting a core and reading memory
//!
//! ```no_run
//! # use aarch64_debug::{Error, RegisterTransport, Session, SessionConfig};
//! # fn open_probe() -> Box<dyn RegisterTransport> { unimplemented!() }
//! let config = SessionConfig::from_yaml_str(include_str!("../tests/cluster.yaml"))?;
//! let mut session = Session::new(open_probe(), &config)?;
//!
//! // Halts cpu0 and every core in its SMP group.
//! session.halt(0)?;
//!
//! let mut core = session.core(0)?;
//! let word = core.read_word_32(0x4000_0000)?;
//! # Ok::<(), Error>(())
//! ```
//!
//! aarch64-debug is built around the [`Session`], [`Core`] and [`RegisterTransport`] types.

/// All the interface bits for the supported architectures.
pub mod architecture;
pub mod config;

#[warn(missing_docs)]
mod core;
mod error;
pub mod probe;
pub mod semihosting;
#[warn(missing_docs)]
mod session;

pub use crate::config::{CoreConfig, CtiConfig, SessionConfig, SmpGroupConfig, Timeouts};
pub use crate::core::{
    AccessSize, BreakpointCause, BreakpointId, BreakpointKind, Core, CoreInformation,
    CoreInterface, CoreStatus, HaltReason, ParamDirection, RegisterId, RegisterParam,
    ResumeOptions, TargetEvent, WatchpointAccess, WatchpointId,
};
pub use crate::error::{Error, SlotResource};
pub use crate::probe::{RegisterTransport, TransportError};
pub use crate::semihosting::SemihostingCommand;
pub use crate::session::Session;

// Exports only used in tests
#[cfg(feature = "test")]
pub use crate::probe::fake_probe::FakeTarget;
