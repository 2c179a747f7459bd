//! Running code on a halted core on behalf of the debugger.

use std::time::{Duration, Instant};

use super::{
    instructions::{self, build_dcps, DRPS},
    Armv8a, Armv8aError, HaltMode, RestartMode, RestartScope,
};
use crate::{
    core::{
        registers::AARCH64_REGISTER_COUNT, DebugRegisterSnapshot, ParamDirection, RegisterId,
        RegisterParam, ResumeOptions,
    },
    error::Error,
};

impl<'probe> Armv8a<'probe> {
    /// Run the code at `entry_point` until it halts, then put the core back as it was.
    ///
    /// Registers marked [`ParamDirection::In`] or [`ParamDirection::InOut`] are loaded before
    /// the run. The returned parameters carry the values of the output registers after it.
    pub(super) fn run_algorithm_inner(
        &mut self,
        entry_point: u64,
        exit_point: Option<u64>,
        params: &[RegisterParam],
        timeout: Duration,
    ) -> Result<Vec<RegisterParam>, Error> {
        self.ensure_halted()?;
        self.ensure_aarch64()?;

        if let Some(param) = params
            .iter()
            .find(|param| usize::from(param.id.0) >= AARCH64_REGISTER_COUNT)
        {
            return Err(Armv8aError::InvalidRegisterNumber(param.id.0).into());
        }

        let snapshot = self.snapshot_registers()?;

        for param in params {
            if param.direction != ParamDirection::Out {
                self.write_core_reg_cached(param.id, param.value)?;
            }
        }

        tracing::debug!(
            "Core {}: running algorithm at {:#x}",
            self.definition.id,
            entry_point
        );

        self.resume_core(
            ResumeOptions {
                address: Some(entry_point),
                handle_breakpoints: false,
                debug_execution: true,
            },
            RestartScope::Local,
            RestartMode::Lazy,
        )?;

        if let Err(error) = self.wait_for_algorithm(timeout) {
            if error.is_timeout() {
                tracing::warn!(
                    "Algorithm on core {} did not finish, halting it",
                    self.definition.id
                );
                self.halt_one(HaltMode::Sync)?;
                self.poll_core()?;
                self.restore_snapshot(&snapshot)?;
            }
            return Err(error);
        }

        let pc = self.read_core_reg_cached(RegisterId::PC)?;
        let exit_check = match exit_point {
            Some(expected) if expected != pc => Err(Armv8aError::AlgorithmExitMismatch {
                expected,
                actual: pc,
            }),
            _ => Ok(()),
        };

        let mut results = Vec::with_capacity(params.len());
        for param in params {
            let value = match param.direction {
                ParamDirection::In => param.value,
                ParamDirection::Out | ParamDirection::InOut => self.read_core_reg_cached(param.id)?,
            };
            results.push(RegisterParam { value, ..*param });
        }

        self.restore_snapshot(&snapshot)?;
        exit_check?;

        Ok(results)
    }

    fn wait_for_algorithm(&mut self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            self.poll_core()?;
            if self.state.current_state.is_halted() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(self.timeout("algorithm"));
            }
        }
    }

    fn snapshot_registers(&mut self) -> Result<DebugRegisterSnapshot, Error> {
        let mut registers = [0u64; AARCH64_REGISTER_COUNT];
        for (index, value) in registers.iter_mut().enumerate() {
            *value = self.read_core_reg_cached(RegisterId(index as u16))?;
        }

        Ok(DebugRegisterSnapshot {
            registers,
            exception_level: self.state.exception_level,
        })
    }

    /// Return to the snapshot's exception level and rewrite every register that changed.
    fn restore_snapshot(&mut self, snapshot: &DebugRegisterSnapshot) -> Result<(), Error> {
        if self.state.exception_level != snapshot.exception_level {
            let cpsr = snapshot.get(RegisterId::CPSR).unwrap_or_default();
            self.change_exception_level(snapshot.exception_level, cpsr)?;
        }

        for (index, saved) in snapshot.registers.iter().enumerate() {
            let id = RegisterId(index as u16);
            if self.read_core_reg_cached(id)? != *saved {
                self.write_core_reg_cached(id, *saved)?;
            }
        }

        Ok(())
    }

    /// Move to exception level `target` without leaving Debug state.
    ///
    /// Higher levels are entered with DCPS. Lower ones are reached with DRPS, which returns
    /// to the level encoded in SPSR of the current level, so `cpsr` is placed there first.
    fn change_exception_level(&mut self, target: u8, cpsr: u64) -> Result<(), Error> {
        let current = self.state.exception_level;
        tracing::debug!(
            "Core {}: switching from EL{} to EL{}",
            self.definition.id,
            current,
            target
        );

        if target > current {
            if target > 3 {
                return Err(Armv8aError::InvalidExceptionLevel(target).into());
            }
            self.execute_instruction(build_dcps(target))?;
        } else {
            let spsr = instructions::spsr(current)
                .ok_or(Armv8aError::InvalidExceptionLevel(current))?;
            self.write_system_register(spsr, cpsr)?;
            self.execute_instruction(DRPS)?;
        }

        let edscr = self.read_edscr()?;
        self.state.exception_level = edscr.el() as u8;
        self.state.register_cache.invalidate();
        self.refresh_sctlr()?;

        if self.state.exception_level != target {
            return Err(Error::InvalidState(format!(
                "core {} is at EL{} after switching to EL{}",
                self.definition.id, self.state.exception_level, target
            )));
        }

        Ok(())
    }
}
