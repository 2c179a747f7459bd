//! The target-independent core interface.

pub mod core_status;
pub mod memory_mapped_registers;
pub mod registers;

use std::time::Duration;

use crate::error::Error;

pub use self::core_status::{BreakpointCause, CoreStatus, HaltReason};
pub use self::registers::{DebugRegisterSnapshot, RegisterCache, RegisterId};

/// Information about the core after it halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreInformation {
    /// The current Program Counter.
    pub pc: u64,
}

/// Width of a single memory access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessSize {
    /// Byte
    U8,
    /// Halfword
    U16,
    /// Word
    U32,
    /// Doubleword
    U64,
}

impl AccessSize {
    /// Number of bytes moved per unit.
    pub fn bytes(self) -> usize {
        match self {
            AccessSize::U8 => 1,
            AccessSize::U16 => 2,
            AccessSize::U32 => 4,
            AccessSize::U64 => 8,
        }
    }
}

impl TryFrom<u32> for AccessSize {
    type Error = Error;

    fn try_from(size: u32) -> Result<Self, Self::Error> {
        match size {
            1 => Ok(AccessSize::U8),
            2 => Ok(AccessSize::U16),
            4 => Ok(AccessSize::U32),
            8 => Ok(AccessSize::U64),
            other => Err(Error::InvalidState(format!(
                "memory access size {other} is not one of 1, 2, 4 or 8"
            ))),
        }
    }
}

/// How a breakpoint is implemented.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// A breakpoint register pair matching the instruction address.
    Hardware,
    /// A halting instruction patched into memory.
    Software,
}

/// Handle of a breakpoint set on a core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

/// Handle of a watchpoint set on a core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchpointId(pub u32);

/// Which data accesses trigger a watchpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WatchpointAccess {
    /// Loads only.
    Read,
    /// Stores only.
    Write,
    /// Any access.
    ReadWrite,
}

/// Parameters of a resume.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ResumeOptions {
    /// Resume at this address instead of the current PC.
    pub address: Option<u64>,
    /// Step over a breakpoint placed at the resume address instead of halting on it again.
    pub handle_breakpoints: bool,
    /// The core runs on behalf of the debugger, e.g. an algorithm. It ends in
    /// [`CoreStatus::DebugRunning`] instead of [`CoreStatus::Running`].
    pub debug_execution: bool,
}

/// Direction of an algorithm register parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamDirection {
    /// Loaded before the run.
    In,
    /// Read back after the run.
    Out,
    /// Both.
    InOut,
}

/// A register passed into or out of an algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterParam {
    /// The register.
    pub id: RegisterId,
    /// Value passed in, or the value read back.
    pub value: u64,
    /// Whether the value is passed in, read back, or both.
    pub direction: ParamDirection,
}

impl RegisterParam {
    /// A register loaded with `value` before the run.
    pub fn input(id: RegisterId, value: u64) -> Self {
        Self {
            id,
            value,
            direction: ParamDirection::In,
        }
    }

    /// A register read back after the run.
    pub fn output(id: RegisterId) -> Self {
        Self {
            id,
            value: 0,
            direction: ParamDirection::Out,
        }
    }
}

/// State changes reported to session event listeners.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// The core halted.
    Halted,
    /// Halted after running on behalf of the debugger.
    DebugHalted,
    /// The core resumed.
    Resumed,
    /// The core resumed to run on behalf of the debugger.
    DebugResumed,
    /// The core is held in reset.
    ResetAsserted,
    /// The core left reset.
    ResetDeasserted,
}

/// A generic interface to control a core.
pub trait CoreInterface {
    /// Index of the core in its session.
    fn id(&self) -> usize;

    /// Wait until the core is halted. If the core does not halt on its own,
    /// a [`Error::Timeout`] error will be returned.
    fn wait_for_core_halted(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Check if the core is halted, without any bookkeeping.
    fn core_halted(&mut self) -> Result<bool, Error>;

    /// Read the hardware status and run debug entry bookkeeping on a transition.
    ///
    /// Returns the event describing the transition, if there was one.
    fn poll(&mut self) -> Result<Option<TargetEvent>, Error>;

    /// Returns the current status of the core.
    fn status(&mut self) -> Result<CoreStatus, Error>;

    /// The status as of the last poll, without touching the hardware.
    fn cached_status(&self) -> CoreStatus;

    /// Request a halt and return without waiting for it.
    fn request_halt(&mut self) -> Result<(), Error>;

    /// Halts the core and returns `Ok(info)` once the core is halted.
    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error>;

    /// Resume the core.
    fn resume(&mut self, options: ResumeOptions) -> Result<(), Error>;

    /// Continue to execute instructions from the current PC.
    fn run(&mut self) -> Result<(), Error> {
        self.resume(ResumeOptions::default())
    }

    /// Execute a single instruction, optionally from `address`.
    fn step(
        &mut self,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error>;

    /// Assert reset, using the configured reset strategy.
    fn reset_assert(&mut self) -> Result<(), Error>;

    /// Release reset and apply the reset catch policy.
    fn reset_deassert(&mut self) -> Result<(), Error>;

    /// Reset the core and halt it on the first instruction.
    fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error>;

    /// Read a core register, from the cache if possible.
    fn read_core_reg(&mut self, id: RegisterId) -> Result<u64, Error>;

    /// Write a core register. The value reaches the core when it resumes.
    fn write_core_reg(&mut self, id: RegisterId, value: u64) -> Result<(), Error>;

    /// Read `count` units of `size` bytes through the current translation regime.
    fn read_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error>;

    /// Write `count` units of `size` bytes through the current translation regime.
    fn write_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Like [`CoreInterface::read_memory`], with the MMU disabled for the transfer.
    fn read_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error>;

    /// Like [`CoreInterface::write_memory`], with the MMU disabled for the transfer.
    fn write_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Number of hardware breakpoint register pairs.
    fn available_breakpoint_units(&mut self) -> Result<u32, Error>;

    /// Set an address breakpoint.
    fn add_breakpoint(
        &mut self,
        address: u64,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<BreakpointId, Error>;

    /// Set a breakpoint matching a context ID (ASID).
    fn add_context_breakpoint(&mut self, asid: u32, length: u32) -> Result<BreakpointId, Error>;

    /// Set a breakpoint matching an address inside a context ID, using two linked units.
    fn add_hybrid_breakpoint(
        &mut self,
        address: u64,
        asid: u32,
        length: u32,
    ) -> Result<BreakpointId, Error>;

    /// Remove a breakpoint and free the resources it used.
    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error>;

    /// Set a watchpoint on `length` bytes at `address`.
    fn add_watchpoint(
        &mut self,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<WatchpointId, Error>;

    /// Remove a watchpoint.
    fn remove_watchpoint(&mut self, id: WatchpointId) -> Result<(), Error>;

    /// Address of the access that hit a watchpoint, for the current halt.
    fn watchpoint_hit_address(&self) -> Option<u64>;

    /// Execute code on the core and restore its context afterwards.
    fn run_algorithm(
        &mut self,
        entry_point: u64,
        exit_point: Option<u64>,
        params: &[RegisterParam],
        timeout: Duration,
    ) -> Result<Vec<RegisterParam>, Error>;

    /// Mask interrupts while single stepping.
    fn set_step_interrupt_masking(&mut self, enabled: bool);

    /// MMU state as of the last debug entry.
    fn mmu_enabled(&self) -> bool;

    /// Exception level as of the last debug entry.
    fn exception_level(&self) -> u8;

    /// Remove everything the debugger placed on the core.
    fn debug_core_stop(&mut self) -> Result<(), Error>;
}

/// Handle to one core of a [`crate::Session`].
///
/// The handle borrows the session, so only one core is driven at a time.
pub struct Core<'probe> {
    inner: Box<dyn CoreInterface + 'probe>,
}

impl<'probe> Core<'probe> {
    /// Create a new [`Core`].
    pub fn new(core: impl CoreInterface + 'probe) -> Core<'probe> {
        Self {
            inner: Box::new(core),
        }
    }

    /// Index of the core in its session.
    pub fn id(&self) -> usize {
        self.inner.id()
    }

    /// Wait until the core is halted. If the core does not halt on its own,
    /// a [`Error::Timeout`] error will be returned.
    #[tracing::instrument(skip(self))]
    pub fn wait_for_core_halted(&mut self, timeout: Duration) -> Result<(), Error> {
        self.inner.wait_for_core_halted(timeout)
    }

    /// Check if the core is halted, without any bookkeeping.
    pub fn core_halted(&mut self) -> Result<bool, Error> {
        self.inner.core_halted()
    }

    /// Read the hardware status and run debug entry bookkeeping on a transition.
    #[tracing::instrument(skip(self))]
    pub fn poll(&mut self) -> Result<Option<TargetEvent>, Error> {
        self.inner.poll()
    }

    /// Returns the current status of the core.
    pub fn status(&mut self) -> Result<CoreStatus, Error> {
        self.inner.status()
    }

    /// The status as of the last poll.
    pub fn cached_status(&self) -> CoreStatus {
        self.inner.cached_status()
    }

    /// Request a halt and return without waiting for it.
    #[tracing::instrument(skip(self))]
    pub fn request_halt(&mut self) -> Result<(), Error> {
        self.inner.request_halt()
    }

    /// Halts the core and returns `Ok(info)` once the core is halted.
    #[tracing::instrument(skip(self))]
    pub fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        self.inner.halt(timeout)
    }

    /// Resume this core only. Use [`crate::Session::resume`] to resume its SMP group.
    #[tracing::instrument(skip(self))]
    pub fn resume(&mut self, options: ResumeOptions) -> Result<(), Error> {
        self.inner.resume(options)
    }

    /// Continue to execute instructions from the current PC.
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), Error> {
        self.inner.run()
    }

    /// Execute a single instruction, optionally from `address`.
    #[tracing::instrument(skip(self))]
    pub fn step(
        &mut self,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error> {
        self.inner.step(address, handle_breakpoints)
    }

    /// Assert reset, using the configured reset strategy.
    #[tracing::instrument(skip(self))]
    pub fn reset_assert(&mut self) -> Result<(), Error> {
        self.inner.reset_assert()
    }

    /// Release reset and apply the reset catch policy.
    #[tracing::instrument(skip(self))]
    pub fn reset_deassert(&mut self) -> Result<(), Error> {
        self.inner.reset_deassert()
    }

    /// Reset the core and halt it on the first instruction.
    #[tracing::instrument(skip(self))]
    pub fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        self.inner.reset_and_halt(timeout)
    }

    /// Read a core register, from the cache if possible.
    pub fn read_core_reg(&mut self, id: impl Into<RegisterId>) -> Result<u64, Error> {
        self.inner.read_core_reg(id.into())
    }

    /// Write a core register. The value reaches the core when it resumes.
    pub fn write_core_reg(&mut self, id: impl Into<RegisterId>, value: u64) -> Result<(), Error> {
        self.inner.write_core_reg(id.into(), value)
    }

    /// Read `count` units of `size` bytes through the current translation regime.
    #[tracing::instrument(skip(self, data))]
    pub fn read_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.inner.read_memory(address, size, count, data)
    }

    /// Write `count` units of `size` bytes through the current translation regime.
    #[tracing::instrument(skip(self, data))]
    pub fn write_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        self.inner.write_memory(address, size, count, data)
    }

    /// Read physical memory, with the MMU disabled for the transfer.
    #[tracing::instrument(skip(self, data))]
    pub fn read_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.inner.read_phys_memory(address, size, count, data)
    }

    /// Write physical memory, with the MMU disabled for the transfer.
    #[tracing::instrument(skip(self, data))]
    pub fn write_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        self.inner.write_phys_memory(address, size, count, data)
    }

    /// Read an arbitrary byte range, using the widest accesses the alignment allows.
    pub fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        check_range(address, data.len())?;

        let mut offset = 0;
        while offset < data.len() {
            let current = address + offset as u64;
            let size = widest_access(current, data.len() - offset);
            let count = if size == AccessSize::U32 {
                (data.len() - offset) / 4
            } else {
                1
            };
            let length = size.bytes() * count;

            self.read_memory(current, size, count, &mut data[offset..offset + length])?;
            offset += length;
        }

        Ok(())
    }

    /// Write an arbitrary byte range, using the widest accesses the alignment allows.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        check_range(address, data.len())?;

        let mut offset = 0;
        while offset < data.len() {
            let current = address + offset as u64;
            let size = widest_access(current, data.len() - offset);
            let count = if size == AccessSize::U32 {
                (data.len() - offset) / 4
            } else {
                1
            };
            let length = size.bytes() * count;

            self.write_memory(current, size, count, &data[offset..offset + length])?;
            offset += length;
        }

        Ok(())
    }

    /// Read a 32-bit word.
    pub fn read_word_32(&mut self, address: u64) -> Result<u32, Error> {
        let mut buffer = [0u8; 4];
        self.read_memory(address, AccessSize::U32, 1, &mut buffer)?;

        Ok(u32::from_le_bytes(buffer))
    }

    /// Write a 32-bit word.
    pub fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), Error> {
        self.write_memory(address, AccessSize::U32, 1, &value.to_le_bytes())
    }

    /// Read a 64-bit word.
    pub fn read_word_64(&mut self, address: u64) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        self.read_memory(address, AccessSize::U64, 1, &mut buffer)?;

        Ok(u64::from_le_bytes(buffer))
    }

    /// Write a 64-bit word.
    pub fn write_word_64(&mut self, address: u64, value: u64) -> Result<(), Error> {
        self.write_memory(address, AccessSize::U64, 1, &value.to_le_bytes())
    }

    /// Number of hardware breakpoint register pairs.
    pub fn available_breakpoint_units(&mut self) -> Result<u32, Error> {
        self.inner.available_breakpoint_units()
    }

    /// Set an address breakpoint.
    #[tracing::instrument(skip(self))]
    pub fn add_breakpoint(
        &mut self,
        address: u64,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<BreakpointId, Error> {
        self.inner.add_breakpoint(address, length, kind)
    }

    /// Set a breakpoint matching a context ID (ASID).
    #[tracing::instrument(skip(self))]
    pub fn add_context_breakpoint(&mut self, asid: u32, length: u32) -> Result<BreakpointId, Error> {
        self.inner.add_context_breakpoint(asid, length)
    }

    /// Set a breakpoint matching an address inside a context ID.
    #[tracing::instrument(skip(self))]
    pub fn add_hybrid_breakpoint(
        &mut self,
        address: u64,
        asid: u32,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        self.inner.add_hybrid_breakpoint(address, asid, length)
    }

    /// Remove a breakpoint.
    #[tracing::instrument(skip(self))]
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.inner.remove_breakpoint(id)
    }

    /// Set a watchpoint.
    #[tracing::instrument(skip(self))]
    pub fn add_watchpoint(
        &mut self,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<WatchpointId, Error> {
        self.inner.add_watchpoint(address, length, access)
    }

    /// Remove a watchpoint.
    #[tracing::instrument(skip(self))]
    pub fn remove_watchpoint(&mut self, id: WatchpointId) -> Result<(), Error> {
        self.inner.remove_watchpoint(id)
    }

    /// Address of the access that hit a watchpoint, for the current halt.
    pub fn watchpoint_hit_address(&self) -> Option<u64> {
        self.inner.watchpoint_hit_address()
    }

    /// Execute code on the core and restore its context afterwards.
    #[tracing::instrument(skip(self, params))]
    pub fn run_algorithm(
        &mut self,
        entry_point: u64,
        exit_point: Option<u64>,
        params: &[RegisterParam],
        timeout: Duration,
    ) -> Result<Vec<RegisterParam>, Error> {
        self.inner
            .run_algorithm(entry_point, exit_point, params, timeout)
    }

    /// Mask interrupts while single stepping.
    pub fn set_step_interrupt_masking(&mut self, enabled: bool) {
        self.inner.set_step_interrupt_masking(enabled)
    }

    /// MMU state as of the last debug entry.
    pub fn mmu_enabled(&self) -> bool {
        self.inner.mmu_enabled()
    }

    /// Exception level as of the last debug entry.
    pub fn exception_level(&self) -> u8 {
        self.inner.exception_level()
    }

    /// Remove everything the debugger placed on the core.
    #[tracing::instrument(skip(self))]
    pub fn debug_core_stop(&mut self) -> Result<(), Error> {
        self.inner.debug_core_stop()
    }
}

/// The range must not wrap around the end of the address space.
fn check_range(address: u64, length: usize) -> Result<(), Error> {
    let Some(last) = (length as u64).checked_sub(1) else {
        return Ok(());
    };

    match address.checked_add(last) {
        Some(_) => Ok(()),
        None => Err(Error::InvalidState(format!(
            "{length} bytes at {address:#x} run past the end of the address space"
        ))),
    }
}

fn widest_access(address: u64, remaining: usize) -> AccessSize {
    if address % 4 == 0 && remaining >= 4 {
        AccessSize::U32
    } else if address % 2 == 0 && remaining >= 2 {
        AccessSize::U16
    } else {
        AccessSize::U8
    }
}
