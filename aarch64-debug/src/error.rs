use crate::architecture::armv8a::Armv8aError;
use crate::probe::TransportError;
use thiserror::Error;

/// The hardware resource a breakpoint or watchpoint allocation ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotResource {
    /// Address matching breakpoint register pairs.
    Breakpoint,
    /// Context (ASID) matching breakpoint register pairs.
    ContextBreakpoint,
    /// Watchpoint register pairs.
    Watchpoint,
}

impl std::fmt::Display for SlotResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotResource::Breakpoint => f.write_str("breakpoint unit"),
            SlotResource::ContextBreakpoint => f.write_str("context aware breakpoint unit"),
            SlotResource::Watchpoint => f.write_str("watchpoint unit"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("The register transport failed")]
    Transport(#[from] TransportError),
    #[error("Core {core}: timed out waiting for {operation}")]
    Timeout {
        core: usize,
        operation: &'static str,
    },
    #[error("Core {0} is running but the operation requires it to be halted")]
    NotHalted(usize),
    #[error("Core {core}: no free {resource} left")]
    ResourceExhausted { core: usize, resource: SlotResource },
    #[error("Core {core}: debug exception at EL{exception_level} during {operation} (syndrome {syndrome:#010x})")]
    HardwareFault {
        core: usize,
        operation: &'static str,
        exception_level: u8,
        syndrome: u64,
    },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("An ARMv8-A specific error occurred")]
    Armv8a(#[from] Armv8aError),
    #[error("Core {0} does not exist")]
    CoreNotFound(usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("The configuration could not be parsed")]
    ConfigParse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The core an error refers to, if it refers to one.
    pub fn core(&self) -> Option<usize> {
        match self {
            Error::Timeout { core, .. }
            | Error::ResourceExhausted { core, .. }
            | Error::HardwareFault { core, .. } => Some(*core),
            Error::NotHalted(core) | Error::CoreNotFound(core) => Some(*core),
            _ => None,
        }
    }

    /// Returns `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
