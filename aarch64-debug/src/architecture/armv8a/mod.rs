//! Register types and the core interface for ARMv8-A

pub mod algorithm;
pub mod breakpoints;
pub mod cti;
pub mod dap;
pub mod debug_regs;
pub mod instructions;
pub mod memory;
pub mod sequences;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use self::{
    breakpoints::BreakpointUnits,
    cti::{Cti, CTI_CHANNEL_HALT, CTI_CHANNEL_RESTART},
    dap::Dap,
    debug_regs::{
        Dbgdtrrx, Dbgdtrtx, Edecr, Edprsr, Edrcr, Edscr, EdwarHi, EdwarLo, Editr,
    },
    instructions::{
        build_add_imm, build_mrs, build_msr, SystemRegister, DBGDTR_EL0, DLR_EL0, DSPSR_EL0,
    },
    sequences::Armv8aDebugSequence,
};
use crate::{
    config::{CoreDefinition, ResetCatch, ResetStrategy},
    core::{
        registers::AARCH64_REGISTER_COUNT, AccessSize, BreakpointCause, BreakpointId,
        BreakpointKind, CoreInformation, CoreInterface, CoreStatus, HaltReason, RegisterCache,
        RegisterId, RegisterParam, ResumeOptions, TargetEvent, WatchpointAccess, WatchpointId,
    },
    error::Error,
    probe::RegisterTransport,
    semihosting,
};

/// Errors for the ARMv8-A state machine
#[derive(thiserror::Error, Debug)]
pub enum Armv8aError {
    /// Invalid register number
    #[error("Register number {0} is not valid for ARMv8-A")]
    InvalidRegisterNumber(u16),

    /// The core is halted in AArch32 state.
    #[error("The core is halted in AArch32 state, only AArch64 is supported")]
    UnsupportedExecutionState,

    /// The core power domain is off.
    #[error("The core is powered down")]
    PoweredDown,

    /// The data buffer does not match the requested transfer.
    #[error("A transfer of {expected} bytes was requested with a buffer of {actual} bytes")]
    BufferSize { expected: usize, actual: usize },

    /// SCTLR is not accessible from EL0.
    #[error("Physical memory access with the MMU enabled requires EL1 or higher")]
    PhysicalAccessAtEl0,

    /// Breakpoints cover 2 or 4 bytes.
    #[error("A breakpoint length of {0} bytes is not supported")]
    UnsupportedBreakpointLength(u32),

    /// The address window can not be expressed with byte select or address mask.
    #[error("A watchpoint of {length} bytes at {address:#x} is not supported")]
    UnsupportedWatchpoint { address: u64, length: u64 },

    /// The original instruction did not read back after removing a software breakpoint.
    #[error("The original instruction at {0:#x} could not be restored")]
    BreakpointRestoreFailed(u64),

    /// The algorithm halted somewhere other than its exit point.
    #[error("The algorithm halted at {actual:#x} instead of {expected:#x}")]
    AlgorithmExitMismatch { expected: u64, actual: u64 },

    /// No such exception level.
    #[error("Exception level {0} is not valid")]
    InvalidExceptionLevel(u8),
}

/// Whether a halt request waits for the core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum HaltMode {
    Lazy,
    Sync,
}

/// Whether a restart waits for the core to leave Debug state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RestartMode {
    Lazy,
    Sync,
}

/// Which cores a restart pulse reaches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RestartScope {
    /// Only this core.
    Local,
    /// Every core whose restart channel is open to the cross trigger matrix.
    Group,
}

/// Debug control bits saved while a step is set up.
#[derive(Debug, Copy, Clone)]
pub(crate) struct StepContext {
    edecr: Edecr,
    interrupts_masked: bool,
}

/// Per-core state that outlives a single [`Armv8a`] handle.
#[derive(Debug)]
pub struct Armv8aState {
    pub(crate) current_state: CoreStatus,

    /// Reason to report for a halt this crate requested through the cross trigger matrix.
    pub(crate) pending_reason: Option<HaltReason>,

    pub(crate) register_cache: RegisterCache,

    pub(crate) is_64_bit: bool,

    pub(crate) exception_level: u8,

    /// SCTLR of the current exception level, as read on debug entry.
    pub(crate) sctlr: Option<u64>,

    /// SCTLR as currently programmed into the core.
    pub(crate) sctlr_current: Option<u64>,

    pub(crate) mmu_enabled: bool,

    pub(crate) watchpoint_address: Option<u64>,

    pub(crate) breakpoints: BreakpointUnits,

    /// Smallest data and instruction cache line, in bytes.
    pub(crate) cache_lines: Option<(u64, u64)>,

    pub(crate) step_interrupt_masking: bool,

    pub(crate) examined: bool,
}

impl Armv8aState {
    pub fn new(step_interrupt_masking: bool) -> Self {
        Self {
            current_state: CoreStatus::Unknown,
            pending_reason: None,
            register_cache: RegisterCache::new(),
            is_64_bit: false,
            exception_level: 0,
            sctlr: None,
            sctlr_current: None,
            mmu_enabled: false,
            watchpoint_address: None,
            breakpoints: BreakpointUnits::default(),
            cache_lines: None,
            step_interrupt_masking,
            examined: false,
        }
    }

    pub fn current_state(&self) -> CoreStatus {
        self.current_state
    }

    pub fn breakpoints(&self) -> &BreakpointUnits {
        &self.breakpoints
    }
}

/// Interface for interacting with an ARMv8-A core
pub struct Armv8a<'probe> {
    transport: &'probe mut dyn RegisterTransport,

    state: &'probe mut Armv8aState,

    definition: &'probe CoreDefinition,

    sequence: Arc<dyn Armv8aDebugSequence>,
}

impl<'probe> Armv8a<'probe> {
    /// Create a handle for the core. The core is examined the first time a handle is created.
    pub fn new(
        transport: &'probe mut dyn RegisterTransport,
        state: &'probe mut Armv8aState,
        definition: &'probe CoreDefinition,
        sequence: Arc<dyn Armv8aDebugSequence>,
    ) -> Result<Self, Error> {
        let mut core = Self {
            transport,
            state,
            definition,
            sequence,
        };

        if !core.state.examined {
            core.examine()?;
        }

        Ok(core)
    }

    pub fn definition(&self) -> &CoreDefinition {
        self.definition
    }

    pub(crate) fn state(&self) -> &Armv8aState {
        self.state
    }

    fn debug(&mut self) -> Dap<'_> {
        Dap::new(
            &mut *self.transport,
            self.definition.ap,
            self.definition.debug_base,
        )
    }

    fn cti(&mut self) -> Cti<'_> {
        Cti::new(Dap::new(
            &mut *self.transport,
            self.definition.cti_ap,
            self.definition.cti_base,
        ))
    }

    fn timeout(&self, operation: &'static str) -> Error {
        Error::Timeout {
            core: self.definition.id,
            operation,
        }
    }

    fn ensure_halted(&self) -> Result<(), Error> {
        if !self.state.current_state.is_halted() {
            return Err(Error::NotHalted(self.definition.id));
        }

        Ok(())
    }

    fn ensure_aarch64(&self) -> Result<(), Error> {
        if !self.state.is_64_bit {
            return Err(Armv8aError::UnsupportedExecutionState.into());
        }

        Ok(())
    }

    fn examine(&mut self) -> Result<(), Error> {
        tracing::debug!("Examining core {}", self.definition.name);

        self.sequence
            .debug_core_start(&mut *self.transport, self.definition)?;

        let eddfr: debug_regs::Eddfr = self.debug().read_register()?;
        self.state.breakpoints = BreakpointUnits::new(
            eddfr.brps() as usize + 1,
            eddfr.ctx_cmps() as usize + 1,
            eddfr.wrps() as usize + 1,
        );
        tracing::debug!(
            "{} breakpoint units ({} context aware), {} watchpoint units",
            eddfr.brps() + 1,
            eddfr.ctx_cmps() + 1,
            eddfr.wrps() + 1
        );
        self.clear_all_slots()?;

        self.state.examined = true;
        self.state.current_state = CoreStatus::Unknown;
        self.poll()?;

        tracing::debug!(
            "Core {} examined, state {:?}",
            self.definition.name,
            self.state.current_state
        );

        Ok(())
    }

    pub(crate) fn read_edscr(&mut self) -> Result<Edscr, Error> {
        Ok(self.debug().read_register()?)
    }

    /// Read-modify-write EDSCR.
    fn modify_edscr(&mut self, f: impl FnOnce(&mut Edscr)) -> Result<(), Error> {
        let mut edscr = self.read_edscr()?;
        f(&mut edscr);
        self.debug().write_register(edscr)?;

        Ok(())
    }

    /// Reading EDPRSR clears its sticky bits.
    fn read_edprsr(&mut self) -> Result<Edprsr, Error> {
        Ok(self.debug().read_register()?)
    }

    fn wait_for_edscr(
        &mut self,
        operation: &'static str,
        condition: impl Fn(&Edscr) -> bool,
    ) -> Result<Edscr, Error> {
        let timeout = self.definition.timeouts.halt();
        let start = Instant::now();

        loop {
            let edscr = self.read_edscr()?;
            if condition(&edscr) {
                return Ok(edscr);
            }
            if start.elapsed() >= timeout {
                return Err(self.timeout(operation));
            }
        }
    }

    /// Execute an instruction without looking at the error flag.
    fn execute_instruction_unchecked(&mut self, instruction: u32) -> Result<Edscr, Error> {
        self.ensure_halted()?;

        self.debug().write_register(Editr::from(instruction))?;

        self.wait_for_edscr("instruction completion", |edscr| edscr.ite())
    }

    /// Execute an instruction, turning a debug state exception into [`Error::HardwareFault`].
    fn execute_instruction_checked(
        &mut self,
        instruction: u32,
        operation: &'static str,
    ) -> Result<Edscr, Error> {
        let edscr = self.execute_instruction_unchecked(instruction)?;

        if edscr.err() {
            return Err(self.handle_fault(operation));
        }

        Ok(edscr)
    }

    /// Execute an instruction
    fn execute_instruction(&mut self, instruction: u32) -> Result<Edscr, Error> {
        self.execute_instruction_checked(instruction, "instruction execution")
    }

    /// Execute an instruction and read the 32-bit result from DBGDTRTX.
    fn execute_instruction_with_result_32(&mut self, instruction: u32) -> Result<u32, Error> {
        let edscr = self.execute_instruction(instruction)?;
        if !edscr.txfull() {
            self.wait_for_edscr("debug data transfer", |edscr| edscr.txfull())?;
        }

        let result: Dbgdtrtx = self.debug().read_register()?;

        Ok(result.value())
    }

    /// Execute an instruction and read the 64-bit result, high word from DBGDTRRX.
    fn execute_instruction_with_result_64(&mut self, instruction: u32) -> Result<u64, Error> {
        let edscr = self.execute_instruction(instruction)?;
        if !edscr.txfull() {
            self.wait_for_edscr("debug data transfer", |edscr| edscr.txfull())?;
        }

        let high: Dbgdtrrx = self.debug().read_register()?;
        let low: Dbgdtrtx = self.debug().read_register()?;

        Ok((high.value() as u64) << 32 | low.value() as u64)
    }

    fn execute_instruction_with_input_32(
        &mut self,
        instruction: u32,
        value: u32,
    ) -> Result<(), Error> {
        self.debug().write_register(Dbgdtrrx::from(value))?;
        self.execute_instruction(instruction)?;

        Ok(())
    }

    fn execute_instruction_with_input_64(
        &mut self,
        instruction: u32,
        value: u64,
    ) -> Result<(), Error> {
        self.debug().write_register(Dbgdtrtx::from((value >> 32) as u32))?;
        self.debug().write_register(Dbgdtrrx::from(value as u32))?;
        self.execute_instruction(instruction)?;

        Ok(())
    }

    fn handle_fault(&mut self, operation: &'static str) -> Error {
        match self.collect_fault(operation) {
            Ok(error) | Err(error) => error,
        }
    }

    /// Clear the sticky error and describe the exception the core took.
    fn collect_fault(&mut self, operation: &'static str) -> Result<Error, Error> {
        let mut edrcr = Edrcr::from(0);
        edrcr.set_cse(true);
        self.debug().write_register(edrcr)?;

        let edscr = self.read_edscr()?;
        let exception_level = edscr.el() as u8;
        self.state.exception_level = exception_level;

        // The exception replaced ELR/SPSR, make sure resume puts PC and PSTATE back.
        self.state.register_cache.mark_dirty(RegisterId::PC);
        self.state.register_cache.mark_dirty(RegisterId::CPSR);

        let syndrome = match instructions::esr(exception_level) {
            Some(esr) => self.read_syndrome(esr)?,
            None => 0,
        };

        tracing::debug!(
            "Core {}: exception at EL{} during {}, ESR {:#x}",
            self.definition.id,
            exception_level,
            operation,
            syndrome
        );

        Ok(Error::HardwareFault {
            core: self.definition.id,
            operation,
            exception_level,
            syndrome,
        })
    }

    fn read_syndrome(&mut self, esr: SystemRegister) -> Result<u64, Error> {
        self.prepare_for_clobber(0)?;

        if self.execute_instruction_unchecked(build_mrs(esr, 0))?.err() {
            self.debug().write_register(clear_sticky_error())?;
            return Ok(0);
        }

        let edscr = self.execute_instruction_unchecked(build_msr(DBGDTR_EL0, 0))?;
        if edscr.err() || !edscr.txfull() {
            self.debug().write_register(clear_sticky_error())?;
            return Ok(0);
        }

        let high: Dbgdtrrx = self.debug().read_register()?;
        let low: Dbgdtrtx = self.debug().read_register()?;

        Ok((high.value() as u64) << 32 | low.value() as u64)
    }

    /// Save a register in the cache before it gets overwritten by a debugger instruction sequence.
    fn prepare_for_clobber(&mut self, reg: u16) -> Result<(), Error> {
        let id = RegisterId(reg);

        if self.state.register_cache.get(id).is_none() {
            let value = self.read_core_reg_from_core(id)?;
            self.state.register_cache.fill(id, value);
        }
        self.state.register_cache.mark_dirty(id);

        Ok(())
    }

    fn read_core_reg_from_core(&mut self, id: RegisterId) -> Result<u64, Error> {
        match id.0 {
            0..=30 => self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, id.0)),
            31 => {
                self.prepare_for_clobber(0)?;
                self.execute_instruction(build_add_imm(0, 31, 0))?;
                self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, 0))
            }
            32 => {
                self.prepare_for_clobber(0)?;
                self.execute_instruction(build_mrs(DLR_EL0, 0))?;
                self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, 0))
            }
            33 => {
                self.prepare_for_clobber(0)?;
                self.execute_instruction(build_mrs(DSPSR_EL0, 0))?;
                self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, 0))
            }
            other => Err(Armv8aError::InvalidRegisterNumber(other).into()),
        }
    }

    fn write_core_reg_to_core(&mut self, id: RegisterId, value: u64) -> Result<(), Error> {
        match id.0 {
            0..=30 => self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, id.0), value),
            31 => {
                self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), value)?;
                self.execute_instruction(build_add_imm(31, 0, 0))?;
                Ok(())
            }
            32 => {
                self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), value)?;
                self.execute_instruction(build_msr(DLR_EL0, 0))?;
                Ok(())
            }
            33 => {
                self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), value)?;
                self.execute_instruction(build_msr(DSPSR_EL0, 0))?;
                Ok(())
            }
            other => Err(Armv8aError::InvalidRegisterNumber(other).into()),
        }
    }

    fn read_system_register(&mut self, register: SystemRegister) -> Result<u64, Error> {
        self.prepare_for_clobber(0)?;
        self.execute_instruction(build_mrs(register, 0))?;
        self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, 0))
    }

    fn write_system_register(&mut self, register: SystemRegister, value: u64) -> Result<(), Error> {
        self.prepare_for_clobber(0)?;
        self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), value)?;
        self.execute_instruction(build_msr(register, 0))?;

        Ok(())
    }

    fn read_core_reg_cached(&mut self, id: RegisterId) -> Result<u64, Error> {
        if usize::from(id.0) >= AARCH64_REGISTER_COUNT {
            return Err(Armv8aError::InvalidRegisterNumber(id.0).into());
        }

        if let Some(value) = self.state.register_cache.get(id) {
            return Ok(value);
        }

        self.ensure_halted()?;
        self.ensure_aarch64()?;

        let value = self.read_core_reg_from_core(id)?;
        self.state.register_cache.fill(id, value);

        Ok(value)
    }

    fn write_core_reg_cached(&mut self, id: RegisterId, value: u64) -> Result<(), Error> {
        if usize::from(id.0) >= AARCH64_REGISTER_COUNT {
            return Err(Armv8aError::InvalidRegisterNumber(id.0).into());
        }

        self.ensure_halted()?;
        self.ensure_aarch64()?;

        self.state.register_cache.set(id, value);

        Ok(())
    }

    /// Write all dirty registers to the core. SP, PC and CPSR are moved through x0,
    /// so x0 is saved first and restored last.
    fn writeback_registers(&mut self) -> Result<(), Error> {
        let special_dirty = [RegisterId::SP, RegisterId::PC, RegisterId::CPSR]
            .into_iter()
            .any(|id| self.state.register_cache.is_dirty(id));
        if special_dirty {
            self.prepare_for_clobber(0)?;
        }

        for (id, value) in self.state.register_cache.dirty_registers() {
            tracing::trace!("Writing back {} = {:#x}", id.name(), value);
            self.write_core_reg_to_core(id, value)?;
            self.state.register_cache.fill(id, value);
        }

        Ok(())
    }

    /// Read SCTLR of the current exception level and update the MMU flag.
    ///
    /// SCTLR is not accessible from EL0, the previous MMU state is kept there.
    fn refresh_sctlr(&mut self) -> Result<(), Error> {
        match instructions::sctlr(self.state.exception_level) {
            Some(register) => {
                let sctlr = self.read_system_register(register)?;
                self.state.sctlr = Some(sctlr);
                self.state.sctlr_current = Some(sctlr);
                self.state.mmu_enabled = sctlr & 1 != 0;
            }
            None => {
                self.state.sctlr = None;
                self.state.sctlr_current = None;
            }
        }

        Ok(())
    }

    /// Write the SCTLR value seen on debug entry back if it was changed since.
    fn restore_sctlr(&mut self) -> Result<(), Error> {
        if let (Some(original), Some(current)) = (self.state.sctlr, self.state.sctlr_current) {
            if original != current {
                let register = instructions::sctlr(self.state.exception_level).ok_or(
                    Armv8aError::InvalidExceptionLevel(self.state.exception_level),
                )?;
                self.write_system_register(register, original)?;
                self.state.sctlr_current = Some(original);
            }
        }

        Ok(())
    }

    /// Bookkeeping after the core entered Debug state.
    fn debug_entry(&mut self) -> Result<(), Error> {
        self.debug().write_register(clear_sticky_error())?;

        let edscr = self.read_edscr()?;
        let mut reason = edscr.halt_reason();
        let pending = self.state.pending_reason.take();
        if reason == HaltReason::Unknown {
            reason = pending.unwrap_or(HaltReason::Unknown);
        }

        self.state.exception_level = edscr.el() as u8;
        self.state.is_64_bit = edscr.currently_64_bit();
        self.state.register_cache.invalidate();
        self.state.current_state = CoreStatus::Halted(reason);

        self.state.watchpoint_address = None;
        if reason == HaltReason::Watchpoint {
            let low: EdwarLo = self.debug().read_register()?;
            let high: EdwarHi = self.debug().read_register()?;
            self.state.watchpoint_address = Some((high.address() as u64) << 32 | low.address() as u64);
        }

        if !self.state.is_64_bit {
            tracing::warn!(
                "Core {} halted in AArch32 state, register and memory access is unavailable",
                self.definition.id
            );
            return Ok(());
        }

        let pc = self.read_core_reg_cached(RegisterId::PC)?;
        self.read_core_reg_cached(RegisterId::CPSR)?;
        self.refresh_sctlr()?;

        if reason == HaltReason::Breakpoint(BreakpointCause::Software) {
            if let Some(command) = self.check_semihosting(pc)? {
                self.state.current_state =
                    CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Semihosting(command)));
            }
        }

        tracing::debug!(
            "Core {} halted at {:#x} in EL{}: {:?}",
            self.definition.id,
            pc,
            self.state.exception_level,
            self.state.current_state
        );

        Ok(())
    }

    fn check_semihosting(
        &mut self,
        pc: u64,
    ) -> Result<Option<semihosting::SemihostingCommand>, Error> {
        let mut instruction = [0u8; 4];
        if let Err(error) = self.read_memory_inner(pc, AccessSize::U32, 1, &mut instruction, false) {
            tracing::debug!("Could not read the instruction at {:#x}: {}", pc, error);
            return Ok(None);
        }

        if !semihosting::is_semihosting_trap(u32::from_le_bytes(instruction)) {
            return Ok(None);
        }

        semihosting::decode_semihosting_syscall(self).map(Some)
    }

    /// Request a halt through the CTI.
    pub(crate) fn halt_one(&mut self, mode: HaltMode) -> Result<(), Error> {
        tracing::debug!("Halting core {}", self.definition.id);

        self.state.pending_reason = Some(HaltReason::Request);
        self.modify_edscr(|edscr| edscr.set_hde(true))?;
        self.cti().pulse_channel(CTI_CHANNEL_HALT)?;

        if mode == HaltMode::Sync {
            self.wait_for_hardware_halt(self.definition.timeouts.halt(), "halt")?;
        }

        Ok(())
    }

    fn wait_for_hardware_halt(
        &mut self,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            if self.read_edprsr()?.halted() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(self.timeout(operation));
            }
        }
    }

    /// Let group wide halt requests reach this core.
    pub(crate) fn prepare_smp_halt(&mut self) -> Result<(), Error> {
        self.state.pending_reason = Some(HaltReason::Request);

        self.cti().ungate_channel(CTI_CHANNEL_HALT)?;
        self.modify_edscr(|edscr| edscr.set_hde(true))?;

        Ok(())
    }

    /// Set up the core to leave Debug state on the next restart event.
    pub(crate) fn prepare_restart(&mut self, scope: RestartScope) -> Result<(), Error> {
        self.modify_edscr(|edscr| edscr.set_hde(true))?;

        // Clear the sticky restart flag.
        self.read_edprsr()?;

        let timeout = self.definition.timeouts.halt();
        let mut cti = self.cti();
        cti.gate_channel(CTI_CHANNEL_HALT)?;
        if !cti.ack_halt(timeout)? {
            return Err(self.timeout("halt trigger acknowledge"));
        }

        match scope {
            RestartScope::Group => self.cti().ungate_channel(CTI_CHANNEL_RESTART)?,
            RestartScope::Local => self.cti().gate_channel(CTI_CHANNEL_RESTART)?,
        }

        Ok(())
    }

    /// Keep group wide restart requests away from this core.
    pub(crate) fn isolate_from_restart(&mut self) -> Result<(), Error> {
        self.cti().gate_channel(CTI_CHANNEL_RESTART)?;

        Ok(())
    }

    /// Restore PC, SCTLR and the dirty registers. Returns the resume address.
    pub(crate) fn restore_context(&mut self, address: Option<u64>) -> Result<u64, Error> {
        self.ensure_halted()?;

        let pc = match address {
            Some(address) => address,
            None => self.read_core_reg_cached(RegisterId::PC)?,
        } & !0b11;
        self.state.register_cache.set(RegisterId::PC, pc);

        self.restore_sctlr()?;
        self.writeback_registers()?;

        Ok(pc)
    }

    /// Pulse the restart channel.
    pub(crate) fn restart(&mut self, mode: RestartMode) -> Result<(), Error> {
        self.cti().pulse_channel(CTI_CHANNEL_RESTART)?;
        self.state.register_cache.invalidate();

        if mode == RestartMode::Sync {
            self.wait_for_restart()?;
        }

        Ok(())
    }

    /// Wait for the sticky restart flag.
    pub(crate) fn wait_for_restart(&mut self) -> Result<(), Error> {
        let timeout = self.definition.timeouts.halt();
        let start = Instant::now();
        loop {
            if self.read_edprsr()?.sdr() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(self.timeout("restart"));
            }
        }
    }

    /// Has the core left Debug state since [`Armv8a::prepare_restart`]?
    pub(crate) fn has_restarted(&mut self) -> Result<bool, Error> {
        let edprsr = self.read_edprsr()?;

        Ok(edprsr.sdr() || !edprsr.halted())
    }

    /// Record that the core left Debug state.
    pub(crate) fn finish_resume(&mut self, debug_execution: bool) -> TargetEvent {
        self.state.register_cache.invalidate();
        self.state.pending_reason = None;
        self.state.watchpoint_address = None;
        self.state.sctlr = None;
        self.state.sctlr_current = None;

        if debug_execution {
            self.state.current_state = CoreStatus::DebugRunning;
            TargetEvent::DebugResumed
        } else {
            self.state.current_state = CoreStatus::Running;
            TargetEvent::Resumed
        }
    }

    pub(crate) fn resume_core(
        &mut self,
        options: ResumeOptions,
        scope: RestartScope,
        mode: RestartMode,
    ) -> Result<TargetEvent, Error> {
        self.ensure_halted()?;

        let address = self.step_over_breakpoint(options)?;

        self.restore_context(address)?;
        self.prepare_restart(scope)?;
        self.restart(mode)?;

        Ok(self.finish_resume(options.debug_execution))
    }

    /// If a breakpoint sits at the resume address, execute that instruction first.
    ///
    /// Returns the address to resume at afterwards.
    pub(crate) fn step_over_breakpoint(&mut self, options: ResumeOptions) -> Result<Option<u64>, Error> {
        if !options.handle_breakpoints {
            return Ok(options.address);
        }

        let pc = match options.address {
            Some(address) => address,
            None => self.read_core_reg_cached(RegisterId::PC)?,
        } & !0b11;

        if self.state.breakpoints.breakpoint_at(pc).is_none() {
            return Ok(options.address);
        }

        tracing::debug!("Stepping over the breakpoint at {:#x}", pc);
        self.step_core(Some(pc), true)?;

        Ok(None)
    }

    /// Enable halting step and mask interrupts if configured.
    pub(crate) fn step_prepare(&mut self) -> Result<StepContext, Error> {
        self.ensure_halted()?;

        let mut edecr: Edecr = self.debug().read_register()?;
        // The saved value must never have SS set.
        edecr.set_ss(false);

        let mut stepping = edecr;
        stepping.set_ss(true);
        self.debug().write_register(stepping)?;

        let context = StepContext {
            edecr,
            interrupts_masked: self.state.step_interrupt_masking,
        };

        if context.interrupts_masked {
            if let Err(error) = self.modify_edscr(|edscr| edscr.set_intdis(0b11)) {
                self.step_cleanup(context)?;
                return Err(error);
            }
        }

        Ok(context)
    }

    /// Undo [`Armv8a::step_prepare`].
    pub(crate) fn step_cleanup(&mut self, context: StepContext) -> Result<(), Error> {
        self.debug().write_register(context.edecr)?;

        if context.interrupts_masked {
            self.modify_edscr(|edscr| edscr.set_intdis(0))?;
        }

        Ok(())
    }

    /// Restart the prepared core for one instruction and wait for it to halt again.
    pub(crate) fn step_execute(
        &mut self,
        context: StepContext,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error> {
        let outcome = if handle_breakpoints {
            match self.step_address(address) {
                Ok(pc) => self.with_breakpoint_lifted(pc, |core| core.step_run(Some(pc))),
                Err(error) => Err(error),
            }
        } else {
            self.step_run(address)
        };

        let cleanup = self.step_cleanup(context);
        outcome?;
        cleanup?;

        self.poll()?;
        self.ensure_halted()?;

        Ok(CoreInformation {
            pc: self.read_core_reg_cached(RegisterId::PC)?,
        })
    }

    fn step_address(&mut self, address: Option<u64>) -> Result<u64, Error> {
        Ok(match address {
            Some(address) => address,
            None => self.read_core_reg_cached(RegisterId::PC)?,
        } & !0b11)
    }

    fn step_run(&mut self, address: Option<u64>) -> Result<(), Error> {
        self.restore_context(address)?;
        self.prepare_restart(RestartScope::Local)?;
        self.restart(RestartMode::Lazy)?;
        self.state.current_state = CoreStatus::Running;

        let timeout = self.definition.timeouts.step();
        let start = Instant::now();
        let mut restarted = false;
        loop {
            let edprsr = self.read_edprsr()?;
            restarted |= edprsr.sdr();
            if restarted && edprsr.halted() {
                break;
            }
            if start.elapsed() >= timeout {
                // Some cores never complete a step over WFI, but an external halt request wakes them up.
                tracing::warn!(
                    "Core {} did not halt after a step, forcing a halt",
                    self.definition.id
                );
                self.halt_one(HaltMode::Sync)?;
                break;
            }
        }

        // Debug entry, so the core counts as halted again.
        self.poll_core()?;

        Ok(())
    }

    /// Single step this core only.
    pub(crate) fn step_core(
        &mut self,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error> {
        let context = self.step_prepare()?;
        self.step_execute(context, address, handle_breakpoints)
    }

    /// Read the hardware state and update the bookkeeping on a transition.
    pub(crate) fn poll_core(&mut self) -> Result<Option<TargetEvent>, Error> {
        let edprsr = self.read_edprsr()?;
        let previous = self.state.current_state;

        if edprsr.halted() {
            if previous.is_halted() {
                return Ok(None);
            }

            self.debug_entry()?;

            return Ok(match previous {
                CoreStatus::DebugRunning => Some(TargetEvent::DebugHalted),
                CoreStatus::Unknown => None,
                _ => Some(TargetEvent::Halted),
            });
        }

        if edprsr.r() {
            self.state.current_state = CoreStatus::Reset;
            return Ok(None);
        }

        match previous {
            CoreStatus::Running | CoreStatus::DebugRunning => Ok(None),
            CoreStatus::Halted(_) => {
                tracing::warn!(
                    "Core {} is running, but was expected to be halted",
                    self.definition.id
                );
                self.finish_resume(false);
                Ok(Some(TargetEvent::Resumed))
            }
            CoreStatus::Reset | CoreStatus::Unknown => {
                self.state.current_state = CoreStatus::Running;
                self.state.register_cache.invalidate();
                Ok(None)
            }
        }
    }

    /// Configure reset catch and assert reset using the configured strategy.
    pub(crate) fn assert_reset(&mut self, catch: ResetCatch) -> Result<(), Error> {
        self.prepare_reset(catch)?;

        match self.definition.reset_strategy {
            ResetStrategy::SystemReset => self.transport.target_reset_assert()?,
            ResetStrategy::WarmReset => self.warm_reset()?,
        }

        self.mark_reset();

        Ok(())
    }

    /// Reset this core alone through its power and reset control register.
    pub(crate) fn warm_reset(&mut self) -> Result<(), Error> {
        self.sequence.reset_system(
            &mut *self.transport,
            self.definition,
            self.definition.timeouts.halt(),
        )
    }

    pub(crate) fn prepare_reset(&mut self, catch: ResetCatch) -> Result<(), Error> {
        match catch {
            ResetCatch::Halt => self
                .sequence
                .reset_catch_set(&mut *self.transport, self.definition),
            ResetCatch::Run => self
                .sequence
                .reset_catch_clear(&mut *self.transport, self.definition),
        }
    }

    pub(crate) fn mark_reset(&mut self) {
        self.state.current_state = CoreStatus::Reset;
        self.state.register_cache.invalidate();
        self.state.pending_reason = None;
        self.state.watchpoint_address = None;
        self.state.sctlr = None;
        self.state.sctlr_current = None;
    }

    /// Bring the debug logic back up after reset and apply the reset catch policy.
    pub(crate) fn finish_reset(&mut self, catch: ResetCatch) -> Result<Option<TargetEvent>, Error> {
        self.sequence
            .debug_core_start(&mut *self.transport, self.definition)?;
        self.reapply_slots()?;

        if catch == ResetCatch::Halt {
            let timeout = self.definition.timeouts.reset_halt();
            let caught = match self.wait_for_hardware_halt(timeout, "reset catch") {
                Ok(()) => true,
                Err(error) if error.is_timeout() => false,
                Err(error) => return Err(error),
            };

            self.sequence
                .reset_catch_clear(&mut *self.transport, self.definition)?;

            if !caught {
                tracing::warn!(
                    "Core {} did not halt after reset, forcing a halt",
                    self.definition.id
                );
                self.halt_one(HaltMode::Sync)?;
            }
        }

        self.poll_core()
    }

    pub(crate) fn deassert_reset(&mut self, catch: ResetCatch) -> Result<Option<TargetEvent>, Error> {
        if self.definition.reset_strategy == ResetStrategy::SystemReset {
            self.transport.target_reset_deassert()?;
        }

        self.finish_reset(catch)
    }
}

fn clear_sticky_error() -> Edrcr {
    let mut edrcr = Edrcr::from(0);
    edrcr.set_cse(true);
    edrcr
}

impl<'probe> CoreInterface for Armv8a<'probe> {
    fn id(&self) -> usize {
        self.definition.id
    }

    fn wait_for_core_halted(&mut self, timeout: Duration) -> Result<(), Error> {
        self.wait_for_hardware_halt(timeout, "halt")?;
        self.poll_core()?;

        Ok(())
    }

    fn core_halted(&mut self) -> Result<bool, Error> {
        Ok(self.read_edprsr()?.halted())
    }

    fn poll(&mut self) -> Result<Option<TargetEvent>, Error> {
        self.poll_core()
    }

    fn status(&mut self) -> Result<CoreStatus, Error> {
        self.poll_core()?;

        Ok(self.state.current_state)
    }

    fn cached_status(&self) -> CoreStatus {
        self.state.current_state
    }

    fn request_halt(&mut self) -> Result<(), Error> {
        self.halt_one(HaltMode::Lazy)
    }

    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        if !self.state.current_state.is_halted() {
            self.halt_one(HaltMode::Lazy)?;
            self.wait_for_hardware_halt(timeout, "halt")?;
            self.poll_core()?;
        }

        Ok(CoreInformation {
            pc: self.read_core_reg_cached(RegisterId::PC)?,
        })
    }

    fn resume(&mut self, options: ResumeOptions) -> Result<(), Error> {
        self.resume_core(options, RestartScope::Local, RestartMode::Sync)?;

        Ok(())
    }

    fn step(
        &mut self,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error> {
        self.step_core(address, handle_breakpoints)
    }

    fn reset_assert(&mut self) -> Result<(), Error> {
        self.assert_reset(self.definition.reset_catch)
    }

    fn reset_deassert(&mut self) -> Result<(), Error> {
        self.deassert_reset(self.definition.reset_catch)?;

        Ok(())
    }

    fn reset_and_halt(&mut self, _timeout: Duration) -> Result<CoreInformation, Error> {
        self.assert_reset(ResetCatch::Halt)?;
        self.deassert_reset(ResetCatch::Halt)?;
        self.ensure_halted()?;

        Ok(CoreInformation {
            pc: self.read_core_reg_cached(RegisterId::PC)?,
        })
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u64, Error> {
        self.read_core_reg_cached(id)
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u64) -> Result<(), Error> {
        self.write_core_reg_cached(id, value)
    }

    fn read_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.read_memory_inner(address, size, count, data, false)
    }

    fn write_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        self.write_memory_inner(address, size, count, data, false)
    }

    fn read_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.read_memory_inner(address, size, count, data, true)
    }

    fn write_phys_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        self.write_memory_inner(address, size, count, data, true)
    }

    fn available_breakpoint_units(&mut self) -> Result<u32, Error> {
        Ok(self.state.breakpoints.slots().len() as u32)
    }

    fn add_breakpoint(
        &mut self,
        address: u64,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<BreakpointId, Error> {
        match kind {
            BreakpointKind::Hardware => self.add_hardware_breakpoint(address, length),
            BreakpointKind::Software => self.add_software_breakpoint(address, length),
        }
    }

    fn add_context_breakpoint(&mut self, asid: u32, length: u32) -> Result<BreakpointId, Error> {
        self.add_context_breakpoint_inner(asid, length)
    }

    fn add_hybrid_breakpoint(
        &mut self,
        address: u64,
        asid: u32,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        self.add_hybrid_breakpoint_inner(address, asid, length)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.remove_breakpoint_inner(id)
    }

    fn add_watchpoint(
        &mut self,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<WatchpointId, Error> {
        self.add_watchpoint_inner(address, length, access)
    }

    fn remove_watchpoint(&mut self, id: WatchpointId) -> Result<(), Error> {
        self.remove_watchpoint_inner(id)
    }

    fn watchpoint_hit_address(&self) -> Option<u64> {
        self.state.watchpoint_address
    }

    fn run_algorithm(
        &mut self,
        entry_point: u64,
        exit_point: Option<u64>,
        params: &[RegisterParam],
        timeout: Duration,
    ) -> Result<Vec<RegisterParam>, Error> {
        self.run_algorithm_inner(entry_point, exit_point, params, timeout)
    }

    fn set_step_interrupt_masking(&mut self, enabled: bool) {
        self.state.step_interrupt_masking = enabled;
    }

    fn mmu_enabled(&self) -> bool {
        self.state.mmu_enabled
    }

    fn exception_level(&self) -> u8 {
        self.state.exception_level
    }

    fn debug_core_stop(&mut self) -> Result<(), Error> {
        self.remove_all_breakpoints()?;

        if self.state.current_state.is_halted() && self.state.is_64_bit {
            self.restore_sctlr()?;
            self.writeback_registers()?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        architecture::armv8a::sequences::DefaultArmv8aSequence,
        config::Timeouts,
        probe::TransportError,
    };
    use pretty_assertions::assert_eq;

    pub(crate) const TEST_BASE_ADDRESS: u64 = 0x8000_1000;
    pub(crate) const TEST_CTI_ADDRESS: u64 = 0x8000_2000;

    #[derive(Debug)]
    enum ExpectedOp {
        Read { address: u64, value: u32 },
        Write { address: u64, value: u32 },
        Error { address: u64, error: TransportError },
    }

    /// A transport that checks every access against a script.
    pub(crate) struct MockProbe {
        expected_ops: VecDeque<ExpectedOp>,
    }

    impl MockProbe {
        pub fn new() -> Self {
            MockProbe {
                expected_ops: VecDeque::new(),
            }
        }

        pub fn expected_read(&mut self, address: u64, value: u32) {
            self.expected_ops
                .push_back(ExpectedOp::Read { address, value });
        }

        pub fn expected_write(&mut self, address: u64, value: u32) {
            self.expected_ops
                .push_back(ExpectedOp::Write { address, value });
        }

        /// The next access, read or write, to `address` fails with `error`.
        pub fn expected_error(&mut self, address: u64, error: TransportError) {
            self.expected_ops
                .push_back(ExpectedOp::Error { address, error });
        }

        pub fn is_done(&self) -> bool {
            self.expected_ops.is_empty()
        }
    }

    impl RegisterTransport for MockProbe {
        fn read_word_32(&mut self, _ap: u8, address: u64) -> Result<u32, TransportError> {
            match self.expected_ops.pop_front() {
                Some(ExpectedOp::Read {
                    address: expected,
                    value,
                }) => {
                    assert_eq!(
                        expected, address,
                        "Read from unexpected register: Expected {expected:#x} Actual: {address:#x}"
                    );
                    Ok(value)
                }
                Some(ExpectedOp::Error {
                    address: expected,
                    error,
                }) => {
                    assert_eq!(expected, address);
                    Err(error)
                }
                Some(op) => panic!("Expected {op:x?}, received read from {address:#x}"),
                None => panic!("Received unexpected read from {address:#x}"),
            }
        }

        fn write_word_32(
            &mut self,
            _ap: u8,
            address: u64,
            value: u32,
        ) -> Result<(), TransportError> {
            match self.expected_ops.pop_front() {
                Some(ExpectedOp::Write {
                    address: expected,
                    value: expected_value,
                }) => {
                    assert_eq!(
                        expected, address,
                        "Write to unexpected register: Expected {expected:#x} Actual: {address:#x}"
                    );
                    assert_eq!(
                        expected_value, value,
                        "Write value mismatch Expected {expected_value:#X} Actual: {value:#X}"
                    );
                    Ok(())
                }
                Some(ExpectedOp::Error {
                    address: expected,
                    error,
                }) => {
                    assert_eq!(expected, address);
                    Err(error)
                }
                Some(op) => {
                    panic!("Expected {op:x?}, received write of {value:#x} to {address:#x}")
                }
                None => panic!("Received unexpected write of {value:#x} to {address:#x}"),
            }
        }
    }

    pub(crate) fn test_definition() -> CoreDefinition {
        CoreDefinition {
            id: 0,
            name: "cpu0".to_string(),
            ap: 0,
            debug_base: TEST_BASE_ADDRESS,
            cti_ap: 0,
            cti_base: TEST_CTI_ADDRESS,
            reset_catch: ResetCatch::Run,
            reset_strategy: ResetStrategy::SystemReset,
            timeouts: Timeouts::default(),
        }
    }

    /// State of a core that was examined and is halted at EL1 in AArch64 state.
    pub(crate) fn halted_state() -> Armv8aState {
        let mut state = Armv8aState::new(true);
        state.examined = true;
        state.current_state = CoreStatus::Halted(HaltReason::Request);
        state.is_64_bit = true;
        state.exception_level = 1;
        state.breakpoints = BreakpointUnits::new(6, 2, 4);
        state
    }

    fn edscr_done(txfull: bool) -> u32 {
        let mut edscr = Edscr::from(0);
        edscr.set_status(Edscr::STATUS_EXTERNAL_REQUEST);
        edscr.set_ite(true);
        edscr.set_txfull(txfull);
        edscr.set_el(1);
        edscr.set_rw(0b1111);
        edscr.into()
    }

    pub(crate) fn add_instruction_expectations(probe: &mut MockProbe, instruction: u32) {
        probe.expected_write(TEST_BASE_ADDRESS + 0x084, instruction);
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, edscr_done(false));
    }

    pub(crate) fn add_read_reg_64_expectations(probe: &mut MockProbe, reg: u16, value: u64) {
        probe.expected_write(TEST_BASE_ADDRESS + 0x084, build_msr(DBGDTR_EL0, reg));
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, edscr_done(true));
        probe.expected_read(TEST_BASE_ADDRESS + 0x080, (value >> 32) as u32);
        probe.expected_read(TEST_BASE_ADDRESS + 0x08C, value as u32);
    }

    pub(crate) fn add_write_reg_64_expectations(probe: &mut MockProbe, reg: u16, value: u64) {
        probe.expected_write(TEST_BASE_ADDRESS + 0x08C, (value >> 32) as u32);
        probe.expected_write(TEST_BASE_ADDRESS + 0x080, value as u32);
        add_instruction_expectations(probe, build_mrs(DBGDTR_EL0, reg));
    }

    fn core<'probe>(
        probe: &'probe mut MockProbe,
        state: &'probe mut Armv8aState,
        definition: &'probe CoreDefinition,
    ) -> Armv8a<'probe> {
        Armv8a::new(probe, state, definition, DefaultArmv8aSequence::create()).unwrap()
    }

    #[test]
    fn examined_core_is_not_examined_again() {
        let mut probe = MockProbe::new();
        let mut state = halted_state();
        let definition = test_definition();

        let _core = core(&mut probe, &mut state, &definition);

        assert!(probe.is_done());
    }

    #[test]
    fn read_register_uses_cache() {
        let mut probe = MockProbe::new();
        add_read_reg_64_expectations(&mut probe, 3, 0x1234_5678_9ABC_DEF0);

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        assert_eq!(
            armv8a.read_core_reg(RegisterId::x(3)).unwrap(),
            0x1234_5678_9ABC_DEF0
        );
        // Second read is served from the cache.
        assert_eq!(
            armv8a.read_core_reg(RegisterId::x(3)).unwrap(),
            0x1234_5678_9ABC_DEF0
        );

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn read_pc_goes_through_x0() {
        let mut probe = MockProbe::new();
        add_read_reg_64_expectations(&mut probe, 0, 0x55);
        add_instruction_expectations(&mut probe, build_mrs(DLR_EL0, 0));
        add_read_reg_64_expectations(&mut probe, 0, 0x4000_0000);

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        assert_eq!(armv8a.read_core_reg(RegisterId::PC).unwrap(), 0x4000_0000);
        drop(armv8a);

        assert!(state.register_cache.is_dirty(RegisterId::x(0)));
        assert_eq!(state.register_cache.get(RegisterId::x(0)), Some(0x55));
        assert!(probe.is_done());
    }

    #[test]
    fn writeback_restores_x0_last() {
        let mut probe = MockProbe::new();
        add_write_reg_64_expectations(&mut probe, 0, 0x8000);
        add_instruction_expectations(&mut probe, build_msr(DLR_EL0, 0));
        add_write_reg_64_expectations(&mut probe, 0, 0x77);

        let mut state = halted_state();
        state.register_cache.fill(RegisterId::x(0), 0x77);
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        armv8a.write_core_reg(RegisterId::PC, 0x8000).unwrap();
        armv8a.writeback_registers().unwrap();

        drop(armv8a);
        assert!(state.register_cache.dirty_registers().is_empty());
        assert!(probe.is_done());
    }

    #[test]
    fn instruction_completion_is_polled() {
        let mut probe = MockProbe::new();
        probe.expected_write(TEST_BASE_ADDRESS + 0x084, instructions::NOP);
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, 0x13);
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, edscr_done(false));

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        armv8a.execute_instruction(instructions::NOP).unwrap();

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn instruction_fault_reports_syndrome() {
        let mut probe = MockProbe::new();
        let mut failed = Edscr::from(edscr_done(false));
        failed.set_err(true);

        probe.expected_write(TEST_BASE_ADDRESS + 0x084, instructions::NOP);
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, failed.into());
        // Clear sticky error, find the exception level
        probe.expected_write(TEST_BASE_ADDRESS + 0x090, 0b100);
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, edscr_done(false));
        // Save x0, read ESR_EL1 through it
        add_read_reg_64_expectations(&mut probe, 0, 0);
        add_instruction_expectations(&mut probe, 0xD538_5200);
        add_read_reg_64_expectations(&mut probe, 0, 0x9600_0010);

        let mut state = halted_state();
        state.register_cache.fill(RegisterId::PC, 0x4000);
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        let error = armv8a
            .execute_instruction_checked(instructions::NOP, "memory read")
            .unwrap_err();

        assert!(matches!(
            error,
            Error::HardwareFault {
                core: 0,
                operation: "memory read",
                exception_level: 1,
                syndrome: 0x9600_0010,
            }
        ));
        drop(armv8a);
        assert!(state.register_cache.is_dirty(RegisterId::PC));
        assert!(probe.is_done());
    }

    #[test]
    fn running_core_rejects_register_access_without_touching_hardware() {
        let mut probe = MockProbe::new();
        let mut state = halted_state();
        state.current_state = CoreStatus::Running;
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        assert!(matches!(
            armv8a.read_core_reg(RegisterId::x(1)),
            Err(Error::NotHalted(0))
        ));
        assert!(matches!(
            armv8a.write_core_reg(RegisterId::x(1), 5),
            Err(Error::NotHalted(0))
        ));

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn invalid_register_number() {
        let mut probe = MockProbe::new();
        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        assert!(matches!(
            armv8a.read_core_reg(RegisterId(40)),
            Err(Error::Armv8a(Armv8aError::InvalidRegisterNumber(40)))
        ));
    }

    #[test]
    fn lazy_halt_pulses_halt_channel() {
        let mut probe = MockProbe::new();
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, 0x0000_0002);
        probe.expected_write(TEST_BASE_ADDRESS + 0x088, 0x0000_4002);
        probe.expected_write(TEST_CTI_ADDRESS + 0x01C, 0b01);

        let mut state = halted_state();
        state.current_state = CoreStatus::Running;
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        armv8a.request_halt().unwrap();

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn prepare_restart_sequence() {
        let mut probe = MockProbe::new();
        // HDE
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, 0x0000_0013);
        probe.expected_write(TEST_BASE_ADDRESS + 0x088, 0x0000_4013);
        // Clear SDR
        probe.expected_read(TEST_BASE_ADDRESS + 0x314, 0x0000_0811);
        // Gate channel 0
        probe.expected_read(TEST_CTI_ADDRESS + 0x140, 0b01);
        probe.expected_write(TEST_CTI_ADDRESS + 0x140, 0b00);
        // Acknowledge the halt trigger
        probe.expected_write(TEST_CTI_ADDRESS + 0x010, 0b01);
        probe.expected_read(TEST_CTI_ADDRESS + 0x134, 0b00);
        // Ungate channel 1
        probe.expected_read(TEST_CTI_ADDRESS + 0x140, 0b00);
        probe.expected_write(TEST_CTI_ADDRESS + 0x140, 0b10);

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        armv8a.prepare_restart(RestartScope::Group).unwrap();

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn local_restart_closes_restart_channel() {
        let mut probe = MockProbe::new();
        probe.expected_read(TEST_BASE_ADDRESS + 0x088, 0x0000_4013);
        probe.expected_write(TEST_BASE_ADDRESS + 0x088, 0x0000_4013);
        probe.expected_read(TEST_BASE_ADDRESS + 0x314, 0x0000_0011);
        probe.expected_read(TEST_CTI_ADDRESS + 0x140, 0b11);
        probe.expected_write(TEST_CTI_ADDRESS + 0x140, 0b10);
        probe.expected_write(TEST_CTI_ADDRESS + 0x010, 0b01);
        probe.expected_read(TEST_CTI_ADDRESS + 0x134, 0b00);
        probe.expected_read(TEST_CTI_ADDRESS + 0x140, 0b10);
        probe.expected_write(TEST_CTI_ADDRESS + 0x140, 0b00);

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        armv8a.prepare_restart(RestartScope::Local).unwrap();

        drop(armv8a);
        assert!(probe.is_done());
    }

    #[test]
    fn transport_error_aborts_halt() {
        let mut probe = MockProbe::new();
        probe.expected_error(TEST_BASE_ADDRESS + 0x088, TransportError::NotConnected);

        let mut state = halted_state();
        state.current_state = CoreStatus::Running;
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);

        assert!(matches!(
            armv8a.request_halt(),
            Err(Error::Transport(TransportError::NotConnected))
        ));
        drop(armv8a);
        assert_eq!(state.current_state, CoreStatus::Running);
    }

    #[test]
    fn step_without_interrupt_masking_leaves_edscr_alone() {
        let mut probe = MockProbe::new();
        // Halting step on, then back off on cleanup.
        probe.expected_read(TEST_BASE_ADDRESS + 0x024, 0);
        probe.expected_write(TEST_BASE_ADDRESS + 0x024, 0b100);
        probe.expected_write(TEST_BASE_ADDRESS + 0x024, 0);

        let mut state = halted_state();
        let definition = test_definition();
        let mut armv8a = core(&mut probe, &mut state, &definition);
        armv8a.set_step_interrupt_masking(false);

        let context = armv8a.step_prepare().unwrap();
        assert!(!context.interrupts_masked);
        armv8a.step_cleanup(context).unwrap();

        drop(armv8a);
        assert!(probe.is_done());
        assert!(!state.step_interrupt_masking);
    }
}
