//! Memory access through the halted core.
//!
//! Aligned word transfers stream through the DCC in memory access mode. Everything else
//! executes one load or store per unit, with the address in `x0` and the data in `x1`.

use super::{
    debug_regs::{Dbgdtrrx, Dbgdtrtx},
    instructions::{
        self, build_dc_civac, build_ic_ivau, build_ldr, build_ldrb, build_ldrh, build_ldrw,
        build_mrs, build_msr, build_str, build_strb, build_strh, build_strw, CTR_EL0,
        DBGDTRRX_EL0, DBGDTRTX_EL0, DBGDTR_EL0, DSB_SY, ISB,
    },
    Armv8a, Armv8aError,
};
use crate::{
    core::{memory_mapped_registers::MemoryMappedRegister, AccessSize},
    error::Error,
};

impl<'probe> Armv8a<'probe> {
    fn check_transfer(size: AccessSize, count: usize, buffer: usize) -> Result<(), Error> {
        let expected = size.bytes() * count;
        if expected != buffer {
            return Err(Armv8aError::BufferSize {
                expected,
                actual: buffer,
            }
            .into());
        }

        Ok(())
    }

    pub(super) fn read_memory_inner(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &mut [u8],
        physical: bool,
    ) -> Result<(), Error> {
        Self::check_transfer(size, count, data.len())?;
        if count == 0 {
            return Ok(());
        }

        self.ensure_halted()?;
        self.ensure_aarch64()?;

        if physical && self.state.mmu_enabled {
            self.with_mmu_disabled(|core| core.read_cpu_memory(address, size, data))
        } else {
            self.read_cpu_memory(address, size, data)
        }
    }

    pub(super) fn write_memory_inner(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        data: &[u8],
        physical: bool,
    ) -> Result<(), Error> {
        Self::check_transfer(size, count, data.len())?;
        if count == 0 {
            return Ok(());
        }

        self.ensure_halted()?;
        self.ensure_aarch64()?;

        if physical && self.state.mmu_enabled {
            self.with_mmu_disabled(|core| core.write_cpu_memory(address, size, data))
        } else {
            self.write_cpu_memory(address, size, data)
        }
    }

    fn read_cpu_memory(&mut self, address: u64, size: AccessSize, data: &mut [u8]) -> Result<(), Error> {
        if size == AccessSize::U32 && address % 4 == 0 {
            self.read_memory_fast(address, data)
        } else {
            self.read_memory_slow(address, size, data)
        }
    }

    fn write_cpu_memory(&mut self, address: u64, size: AccessSize, data: &[u8]) -> Result<(), Error> {
        if size == AccessSize::U32 && address % 4 == 0 {
            self.write_memory_fast(address, data)
        } else {
            self.write_memory_slow(address, size, data)
        }
    }

    /// Run `f` with SCTLR.M cleared, so memory accesses use physical addresses.
    fn with_mmu_disabled<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let (Some(sctlr), Some(register)) = (
            self.state.sctlr_current,
            instructions::sctlr(self.state.exception_level),
        ) else {
            return Err(Armv8aError::PhysicalAccessAtEl0.into());
        };

        let disabled = sctlr & !1;
        self.write_system_register(register, disabled)?;
        self.state.sctlr_current = Some(disabled);

        let result = f(self);

        let restore = self.write_system_register(register, sctlr);
        if restore.is_ok() {
            self.state.sctlr_current = Some(sctlr);
        }

        let value = result?;
        restore?;

        Ok(value)
    }

    fn set_memory_access_mode(&mut self, enabled: bool) -> Result<(), Error> {
        self.modify_edscr(|edscr| edscr.set_ma(enabled))
    }

    fn check_memory_error(&mut self, operation: &'static str) -> Result<(), Error> {
        if self.read_edscr()?.err() {
            return Err(self.handle_fault(operation));
        }

        Ok(())
    }

    fn read_memory_fast(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let count = data.len() / 4;

        self.prepare_for_clobber(0)?;
        self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), address)?;
        // Fills DTRTX so the first read in memory access mode has something to return.
        self.execute_instruction(build_msr(DBGDTR_EL0, 0))?;

        self.set_memory_access_mode(true)?;

        // Each read returns the current DTRTX and loads the next word.
        let mut words = vec![0u32; count];
        let mut debug = self.debug();
        let transfer = debug
            .read32(Dbgdtrtx::ADDRESS_OFFSET)
            .and_then(|_| debug.read_repeated(Dbgdtrtx::ADDRESS_OFFSET, &mut words[..count - 1]));

        let normal_mode = self.set_memory_access_mode(false);
        transfer?;
        normal_mode?;

        let last: Dbgdtrtx = self.debug().read_register()?;
        words[count - 1] = last.value();

        self.check_memory_error("memory read")?;

        for (chunk, word) in data.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        Ok(())
    }

    fn write_memory_fast(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        self.prepare_for_clobber(0)?;
        self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), address)?;

        self.set_memory_access_mode(true)?;

        // Each write stores one word at x0 and advances it.
        let mut debug = self.debug();
        let transfer = debug
            .write_repeated(Dbgdtrrx::ADDRESS_OFFSET, &words)
            .and_then(|()| debug.flush());

        let normal_mode = self.set_memory_access_mode(false);
        transfer?;
        normal_mode?;

        self.check_memory_error("memory write")
    }

    fn read_memory_slow(
        &mut self,
        address: u64,
        size: AccessSize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        self.prepare_for_clobber(0)?;
        self.prepare_for_clobber(1)?;
        self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), address)?;

        let width = size.bytes();
        let load = match size {
            AccessSize::U8 => build_ldrb(1, 0, 1),
            AccessSize::U16 => build_ldrh(1, 0, 2),
            AccessSize::U32 => build_ldrw(1, 0, 4),
            AccessSize::U64 => build_ldr(1, 0, 8),
        };

        for chunk in data.chunks_exact_mut(width) {
            self.execute_instruction_checked(load, "memory read")?;

            if size == AccessSize::U64 {
                let value = self.execute_instruction_with_result_64(build_msr(DBGDTR_EL0, 1))?;
                chunk.copy_from_slice(&value.to_le_bytes());
            } else {
                let value = self.execute_instruction_with_result_32(build_msr(DBGDTRTX_EL0, 1))?;
                chunk.copy_from_slice(&value.to_le_bytes()[..width]);
            }
        }

        Ok(())
    }

    fn write_memory_slow(&mut self, address: u64, size: AccessSize, data: &[u8]) -> Result<(), Error> {
        self.prepare_for_clobber(0)?;
        self.prepare_for_clobber(1)?;
        self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), address)?;

        let width = size.bytes();
        let store = match size {
            AccessSize::U8 => build_strb(1, 0, 1),
            AccessSize::U16 => build_strh(1, 0, 2),
            AccessSize::U32 => build_strw(1, 0, 4),
            AccessSize::U64 => build_str(1, 0, 8),
        };

        for chunk in data.chunks_exact(width) {
            let mut bytes = [0u8; 8];
            bytes[..width].copy_from_slice(chunk);
            let value = u64::from_le_bytes(bytes);

            if size == AccessSize::U64 {
                self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 1), value)?;
            } else {
                self.execute_instruction_with_input_32(build_mrs(DBGDTRRX_EL0, 1), value as u32)?;
            }

            self.execute_instruction_checked(store, "memory write")?;
        }

        Ok(())
    }

    /// Smallest data and instruction cache line, from CTR_EL0.
    fn cache_line_sizes(&mut self) -> Result<(u64, u64), Error> {
        if let Some(lines) = self.state.cache_lines {
            return Ok(lines);
        }

        let ctr = self.read_system_register(CTR_EL0)?;
        let lines = (4 << ((ctr >> 16) & 0xF), 4 << (ctr & 0xF));
        tracing::debug!(
            "Core {}: data cache line {} bytes, instruction cache line {} bytes",
            self.definition.id,
            lines.0,
            lines.1
        );
        self.state.cache_lines = Some(lines);

        Ok(lines)
    }

    /// Make modified instructions in `address..address + length` visible to instruction fetch.
    pub(super) fn flush_instruction_range(&mut self, address: u64, length: u64) -> Result<(), Error> {
        let (data_line, instruction_line) = self.cache_line_sizes()?;
        let end = address.saturating_add(length);

        self.prepare_for_clobber(0)?;

        let mut line = address & !(data_line - 1);
        while line < end {
            self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), line)?;
            self.execute_instruction(build_dc_civac(0))?;
            line += data_line;
        }
        self.execute_instruction(DSB_SY)?;

        let mut line = address & !(instruction_line - 1);
        while line < end {
            self.execute_instruction_with_input_64(build_mrs(DBGDTR_EL0, 0), line)?;
            self.execute_instruction(build_ic_ivau(0))?;
            line += instruction_line;
        }
        self.execute_instruction(DSB_SY)?;
        self.execute_instruction(ISB)?;

        Ok(())
    }
}
