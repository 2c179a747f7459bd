//! A simulated multi-core ARMv8-A target.
//!
//! [`FakeTarget`] answers register accesses the way the external debug interface and the
//! cross trigger interface of each core would. Cores run a small subset of A64 (moves,
//! adds, branches, loads, stores, `WFI` and `HLT`), enough for test programs that halt on
//! breakpoints, touch watched data or spin.
//!
//! Execution is instantaneous: a restarted core runs until it halts, waits for an
//! interrupt, or used up its instruction budget, before the restart request returns.
#![allow(missing_docs)] // Don't require docs for test code

use std::{cell::RefCell, collections::HashMap, ops::Range, rc::Rc};

use super::{RegisterTransport, TransportError};
use crate::{
    architecture::armv8a::{
        debug_regs::{
            CtiApppulse, CtiControl, CtiGate, CtiIntack, CtiOuten, CtiTrigoutstatus, Dbgbcr,
            Dbgbvr, Dbgdtrrx, Dbgdtrtx, Dbgwcr, Dbgwvr, Eddfr, Edecr, Edesr, Editr, Edlar,
            Edprcr, Edprsr, Edrcr, Edscr, EdwarHi, EdwarLo, Oslar, BANK_STRIDE,
        },
        instructions::{
            self, build_msr, SystemRegister, CTR_EL0, DBGDTRTX_EL0, DBGDTR_EL0, DLR_EL0, DRPS,
            DSB_SY, DSPSR_EL0, ISB, NOP, WFI,
        },
    },
    config::SessionConfig,
    core::memory_mapped_registers::MemoryMappedRegister,
};

/// Syndrome of a synchronous external data abort at the current exception level.
pub const DATA_ABORT_SYNDROME: u64 = 0x9600_0010;

/// Syndrome of an instruction the simulation does not implement.
pub const UNDEFINED_SYNDROME: u64 = 0x0200_0000;

/// Syndrome of an `SVC` from AArch64, without the immediate.
pub const SVC_SYNDROME: u64 = 0x5600_0000;

/// Value of CTR_EL0: 64 byte data and instruction cache lines.
pub const CACHE_TYPE: u64 = 0x8444_C004;

const COMPONENT_SIZE: u64 = 0x1000;
const RUN_BUDGET: usize = 10_000;

const BREAKPOINT_UNITS: usize = 6;
const CONTEXT_BREAKPOINT_UNITS: usize = 2;
const WATCHPOINT_UNITS: usize = 4;

/// PSTATE after reset: EL1h with all exceptions masked.
const RESET_PSTATE: u64 = 0x3C5;

const HALT_TRIGGER: u32 = 1 << 0;

/// Physical memory shared by all cores.
#[derive(Debug, Default)]
struct Memory {
    bytes: HashMap<u64, u8>,
    faults: Vec<Range<u64>>,
    /// Writes starting at the key complete without changing memory, as long as the count lasts.
    lost_writes: HashMap<u64, usize>,
}

impl Memory {
    fn faults_at(&self, address: u64, length: usize) -> bool {
        (0..length as u64).any(|offset| {
            let byte = address.wrapping_add(offset);
            self.faults.iter().any(|region| region.contains(&byte))
        })
    }

    fn read(&self, address: u64, length: usize) -> Option<u64> {
        if self.faults_at(address, length) {
            return None;
        }

        let mut bytes = [0u8; 8];
        for (offset, byte) in bytes.iter_mut().take(length).enumerate() {
            *byte = self
                .bytes
                .get(&address.wrapping_add(offset as u64))
                .copied()
                .unwrap_or(0);
        }

        Some(u64::from_le_bytes(bytes))
    }

    fn write(&mut self, address: u64, length: usize, value: u64) -> bool {
        if self.faults_at(address, length) {
            return false;
        }

        if let Some(count) = self.lost_writes.get_mut(&address) {
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }

        for (offset, byte) in value.to_le_bytes().into_iter().take(length).enumerate() {
            self.bytes.insert(address.wrapping_add(offset as u64), byte);
        }

        true
    }
}

/// What an instruction executed in Non-debug state did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Continue,
    /// Enter Debug state with this EDSCR.STATUS.
    Halt(u32),
    /// Wait for an interrupt, or stuck on something the simulation can't execute.
    Wait,
}

#[derive(Debug, Clone, Copy, Default)]
struct Comparator {
    value: u64,
    control: u32,
}

/// A load or store with post-indexed addressing.
#[derive(Debug, Clone, Copy)]
struct PostIndexed {
    size: usize,
    load: bool,
    rt: usize,
    rn: usize,
    offset: i64,
}

impl PostIndexed {
    fn decode(instruction: u32) -> Option<Self> {
        if instruction & 0x3FA0_0C00 != 0x3800_0400 {
            return None;
        }

        Some(Self {
            size: 1 << (instruction >> 30),
            load: instruction & (1 << 22) != 0,
            rt: (instruction & 0x1F) as usize,
            rn: ((instruction >> 5) & 0x1F) as usize,
            offset: (((instruction >> 12) & 0x1FF) as i64) << 55 >> 55,
        })
    }
}

fn sysreg_key(register: SystemRegister) -> u32 {
    build_msr(register, 0) & 0x000F_FFE0
}

#[derive(Debug)]
struct SimCore {
    debug_base: u64,
    cti: Option<usize>,
    powered: bool,

    x: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
    /// Current exception level.
    el: u8,
    sctlr: [u64; 4],
    esr: [u64; 4],
    spsr: [u64; 4],
    contextidr: u32,
    /// Offset added to virtual addresses while the MMU is on.
    mmu_offset: u64,
    reset_vector: u64,
    /// Exception vector base, shared by all exception levels.
    vector_base: u64,

    halted: bool,
    status: u32,
    waiting: bool,
    in_reset: bool,

    hde: bool,
    ma: bool,
    intdis: u32,
    err: bool,
    txfull: bool,
    rxfull: bool,
    dtrrx: u32,
    dtrtx: u32,
    edecr: Edecr,
    reset_catch_pending: bool,
    oslk: bool,
    sdr: bool,
    sr: bool,
    edwar: u64,

    breakpoints: Vec<Comparator>,
    watchpoints: Vec<Comparator>,

    unhaltable: bool,
    ignored_halts: usize,
    cache_maintenance: usize,
}

impl SimCore {
    fn new(debug_base: u64, cti: Option<usize>) -> Self {
        Self {
            debug_base,
            cti,
            powered: true,
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: RESET_PSTATE,
            el: 1,
            sctlr: [0; 4],
            esr: [0; 4],
            spsr: [0; 4],
            contextidr: 0,
            mmu_offset: 0,
            reset_vector: 0,
            vector_base: 0,
            halted: false,
            status: Edscr::STATUS_NON_DEBUG,
            waiting: false,
            in_reset: false,
            hde: false,
            ma: false,
            intdis: 0,
            err: false,
            txfull: false,
            rxfull: false,
            dtrrx: 0,
            dtrtx: 0,
            edecr: Edecr::from(0),
            reset_catch_pending: false,
            oslk: true,
            sdr: false,
            sr: false,
            edwar: 0,
            breakpoints: vec![Comparator::default(); BREAKPOINT_UNITS],
            watchpoints: vec![Comparator::default(); WATCHPOINT_UNITS],
            unhaltable: false,
            ignored_halts: 0,
            cache_maintenance: 0,
        }
    }

    fn reg(&self, index: usize) -> u64 {
        self.x.get(index).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, index: usize, value: u64) {
        if let Some(register) = self.x.get_mut(index) {
            *register = value;
        }
    }

    /// Register operand where 31 means SP.
    fn reg_or_sp(&self, index: usize) -> u64 {
        if index == 31 {
            self.sp
        } else {
            self.reg(index)
        }
    }

    fn set_reg_or_sp(&mut self, index: usize, value: u64) {
        if index == 31 {
            self.sp = value;
        } else {
            self.set_reg(index, value);
        }
    }

    fn translate(&self, address: u64) -> u64 {
        let regime = usize::from(self.el.max(1));
        if self.sctlr[regime] & 1 != 0 {
            address.wrapping_add(self.mmu_offset)
        } else {
            address
        }
    }

    fn edscr(&self) -> u32 {
        let mut edscr = Edscr::from(0);
        edscr.set_rxfull(self.rxfull);
        edscr.set_txfull(self.txfull);
        edscr.set_ite(self.halted);
        edscr.set_intdis(self.intdis);
        edscr.set_ma(self.ma);
        edscr.set_hde(self.hde);
        edscr.set_rw(0b1111);
        edscr.set_el(u32::from(self.el));
        edscr.set_err(self.err);
        edscr.set_status(if self.halted {
            self.status
        } else {
            Edscr::STATUS_NON_DEBUG
        });

        edscr.into()
    }

    fn write_edscr(&mut self, value: u32) {
        let edscr = Edscr::from(value);
        self.hde = edscr.hde();
        self.ma = edscr.ma();
        self.intdis = edscr.intdis();
    }

    fn read_edprsr(&mut self) -> u32 {
        let mut edprsr = Edprsr::from(0);
        edprsr.set_pu(self.powered);
        edprsr.set_spd(!self.powered);

        if self.powered {
            edprsr.set_sdr(self.sdr);
            edprsr.set_oslk(self.oslk);
            edprsr.set_halted(self.halted);
            edprsr.set_sr(self.sr);
            edprsr.set_r(self.in_reset);

            self.sdr = false;
            self.sr = false;
        }

        edprsr.into()
    }

    fn eddfr(&self) -> u32 {
        let mut eddfr = Eddfr::from(0);
        eddfr.set_brps(BREAKPOINT_UNITS as u32 - 1);
        eddfr.set_ctx_cmps(CONTEXT_BREAKPOINT_UNITS as u32 - 1);
        eddfr.set_wrps(WATCHPOINT_UNITS as u32 - 1);

        eddfr.into()
    }

    /// A debug state exception: set the sticky error and record the syndrome.
    fn take_exception(&mut self, syndrome: u64) {
        self.err = true;
        self.el = self.el.max(1);
        self.esr[usize::from(self.el)] = syndrome;
    }

    fn enter_debug(&mut self, status: u32) {
        self.halted = true;
        self.waiting = false;
        self.status = status;
        self.pstate = (self.pstate & !0b1100) | (u64::from(self.el) << 2);
    }

    fn leave_debug(&mut self) {
        self.halted = false;
        self.sdr = true;
        self.waiting = false;
        self.status = Edscr::STATUS_NON_DEBUG;
        self.el = ((self.pstate >> 2) & 0b11) as u8;
    }

    /// Reset of everything but the external debug logic.
    fn reset_core(&mut self) {
        self.halted = false;
        self.waiting = false;
        self.sr = true;
        self.x = [0; 31];
        self.sp = 0;
        self.pc = self.reset_vector;
        self.pstate = RESET_PSTATE;
        self.el = 1;
        self.sctlr = [0; 4];
        self.ma = false;
        self.err = false;
    }

    fn cold_reset(&mut self) {
        self.reset_core();
        self.in_reset = true;
        self.oslk = true;
        self.hde = false;
        self.txfull = false;
        self.rxfull = false;
        for comparator in self.breakpoints.iter_mut().chain(self.watchpoints.iter_mut()) {
            comparator.control = 0;
        }
    }

    /// Leave reset, halting right away if reset catch is enabled.
    fn leave_reset(&mut self, memory: &mut Memory) {
        self.in_reset = false;

        if self.edecr.rce() {
            self.reset_catch_pending = true;
            self.enter_debug(Edscr::STATUS_RESET_CATCH);
        } else {
            self.run(memory, false);
        }
    }

    fn read_dtrtx(&mut self, memory: &mut Memory) -> u32 {
        let value = self.dtrtx;
        self.txfull = false;

        // Memory access mode: every read loads the next word.
        if self.halted && self.ma && !self.err {
            match memory.read(self.translate(self.x[0]), 4) {
                Some(word) => {
                    self.dtrtx = word as u32;
                    self.txfull = true;
                    self.x[0] = self.x[0].wrapping_add(4);
                }
                None => self.take_exception(DATA_ABORT_SYNDROME),
            }
        }

        value
    }

    fn write_dtrrx(&mut self, memory: &mut Memory, value: u32) {
        self.dtrrx = value;
        self.rxfull = true;

        // Memory access mode: every write stores a word.
        if self.halted && self.ma && !self.err {
            if memory.write(self.translate(self.x[0]), 4, u64::from(value)) {
                self.rxfull = false;
                self.x[0] = self.x[0].wrapping_add(4);
            } else {
                self.take_exception(DATA_ABORT_SYNDROME);
            }
        }
    }

    fn write_editr(&mut self, memory: &mut Memory, instruction: u32) {
        if !self.halted || self.err {
            return;
        }

        if let Err(syndrome) = self.execute_in_debug_state(memory, instruction) {
            self.take_exception(syndrome);
        }
    }

    fn el_register(&self, el: u8) -> Result<usize, u64> {
        if el == 0 || el > self.el {
            return Err(UNDEFINED_SYNDROME);
        }

        Ok(usize::from(el))
    }

    fn read_sysreg(&mut self, key: u32) -> Result<u64, u64> {
        if key == sysreg_key(DBGDTR_EL0) {
            self.rxfull = false;
            return Ok(u64::from(self.dtrtx) << 32 | u64::from(self.dtrrx));
        }
        if key == sysreg_key(DBGDTRTX_EL0) {
            self.rxfull = false;
            return Ok(u64::from(self.dtrrx));
        }
        if key == sysreg_key(DLR_EL0) {
            return Ok(self.pc);
        }
        if key == sysreg_key(DSPSR_EL0) {
            return Ok(self.pstate);
        }
        if key == sysreg_key(CTR_EL0) {
            return Ok(CACHE_TYPE);
        }

        for el in 1..=3u8 {
            if instructions::sctlr(el).map(sysreg_key) == Some(key) {
                return Ok(self.sctlr[self.el_register(el)?]);
            }
            if instructions::esr(el).map(sysreg_key) == Some(key) {
                return Ok(self.esr[self.el_register(el)?]);
            }
            if instructions::spsr(el).map(sysreg_key) == Some(key) {
                return Ok(self.spsr[self.el_register(el)?]);
            }
        }

        Err(UNDEFINED_SYNDROME)
    }

    fn write_sysreg(&mut self, key: u32, value: u64) -> Result<(), u64> {
        if key == sysreg_key(DBGDTR_EL0) {
            self.dtrrx = (value >> 32) as u32;
            self.dtrtx = value as u32;
            self.txfull = true;
            return Ok(());
        }
        if key == sysreg_key(DBGDTRTX_EL0) {
            self.dtrtx = value as u32;
            self.txfull = true;
            return Ok(());
        }
        if key == sysreg_key(DLR_EL0) {
            self.pc = value;
            return Ok(());
        }
        if key == sysreg_key(DSPSR_EL0) {
            self.pstate = value;
            return Ok(());
        }

        for el in 1..=3u8 {
            if instructions::sctlr(el).map(sysreg_key) == Some(key) {
                let index = self.el_register(el)?;
                self.sctlr[index] = value;
                return Ok(());
            }
            if instructions::esr(el).map(sysreg_key) == Some(key) {
                let index = self.el_register(el)?;
                self.esr[index] = value;
                return Ok(());
            }
            if instructions::spsr(el).map(sysreg_key) == Some(key) {
                let index = self.el_register(el)?;
                self.spsr[index] = value;
                return Ok(());
            }
        }

        Err(UNDEFINED_SYNDROME)
    }

    fn execute_in_debug_state(&mut self, memory: &mut Memory, instruction: u32) -> Result<(), u64> {
        // MSR / MRS
        if instruction & 0xFFD0_0000 == 0xD510_0000 {
            let rt = (instruction & 0x1F) as usize;
            let key = instruction & 0x000F_FFE0;

            if instruction & (1 << 21) != 0 {
                let value = self.read_sysreg(key)?;
                self.set_reg(rt, value);
            } else {
                self.write_sysreg(key, self.reg(rt))?;
            }
            return Ok(());
        }

        // ADD (immediate), 64-bit
        if instruction & 0xFF80_0000 == 0x9100_0000 {
            let rd = (instruction & 0x1F) as usize;
            let rn = ((instruction >> 5) & 0x1F) as usize;
            let imm = u64::from((instruction >> 10) & 0xFFF);
            let value = self.reg_or_sp(rn).wrapping_add(imm);
            self.set_reg_or_sp(rd, value);
            return Ok(());
        }

        if let Some(access) = PostIndexed::decode(instruction) {
            return self.load_store(memory, access).map(|_| ());
        }

        // DC CIVAC / IC IVAU
        if instruction & !0x1F == 0xD50B_7E20 || instruction & !0x1F == 0xD50B_7520 {
            self.cache_maintenance += 1;
            return Ok(());
        }

        if instruction == DSB_SY || instruction == ISB || instruction == NOP {
            return Ok(());
        }

        // DCPS<n>
        if instruction & !0b11 == 0xD4A0_0000 {
            let target = (instruction & 0b11) as u8;
            if target == 0 {
                return Err(UNDEFINED_SYNDROME);
            }
            self.el = self.el.max(target);
            return Ok(());
        }

        if instruction == DRPS {
            let index = self.el_register(self.el)?;
            let target = ((self.spsr[index] >> 2) & 0b11) as u8;
            if target > self.el {
                return Err(UNDEFINED_SYNDROME);
            }
            self.el = target;
            return Ok(());
        }

        Err(UNDEFINED_SYNDROME)
    }

    fn load_store(&mut self, memory: &mut Memory, access: PostIndexed) -> Result<Outcome, u64> {
        let base = self.reg_or_sp(access.rn);

        if !self.halted && self.watchpoint_hit(base, access.size, !access.load) {
            self.edwar = base;
            return Ok(Outcome::Halt(Edscr::STATUS_WATCHPOINT));
        }

        let physical = self.translate(base);
        if access.load {
            let value = memory
                .read(physical, access.size)
                .ok_or(DATA_ABORT_SYNDROME)?;
            self.set_reg(access.rt, value);
        } else {
            let mut value = self.reg(access.rt);
            if access.size < 8 {
                value &= (1 << (access.size * 8)) - 1;
            }
            if !memory.write(physical, access.size, value) {
                return Err(DATA_ABORT_SYNDROME);
            }
        }

        self.set_reg_or_sp(access.rn, base.wrapping_add(access.offset as u64));

        Ok(Outcome::Continue)
    }

    fn breakpoint_hit(&self) -> bool {
        let context_matches = |slot: usize| {
            self.breakpoints.get(slot).is_some_and(|linked| {
                let control = Dbgbcr::from(linked.control);
                control.e()
                    && control.bt() == Dbgbcr::BT_LINKED_CONTEXT
                    && linked.value as u32 == self.contextidr
            })
        };

        self.breakpoints.iter().any(|comparator| {
            let control = Dbgbcr::from(comparator.control);
            if !control.e() {
                return false;
            }

            match control.bt() {
                Dbgbcr::BT_ADDRESS => comparator.value & !0b11 == self.pc & !0b11,
                Dbgbcr::BT_LINKED_ADDRESS => {
                    comparator.value & !0b11 == self.pc & !0b11
                        && context_matches(control.lbn() as usize)
                }
                Dbgbcr::BT_CONTEXT => comparator.value as u32 == self.contextidr,
                _ => false,
            }
        })
    }

    fn watchpoint_hit(&self, address: u64, size: usize, store: bool) -> bool {
        self.watchpoints.iter().any(|comparator| {
            let control = Dbgwcr::from(comparator.control);
            if !control.e() {
                return false;
            }

            let access = if store { 0b10 } else { 0b01 };
            if control.lsc() & access == 0 {
                return false;
            }

            (0..size as u64).any(|offset| {
                let byte = address.wrapping_add(offset);
                if control.mask() > 0 {
                    let mask = !((1u64 << control.mask()) - 1);
                    byte & mask == comparator.value & mask
                } else {
                    byte & !0b111 == comparator.value & !0b111
                        && control.bas() & (1 << (byte & 0b111)) != 0
                }
            })
        })
    }

    /// Execute the instruction at PC in Non-debug state.
    fn step_instruction(&mut self, memory: &mut Memory) -> Outcome {
        let Some(instruction) = memory.read(self.translate(self.pc), 4) else {
            return Outcome::Wait;
        };
        let instruction = instruction as u32;

        // HLT
        if instruction & 0xFFE0_001F == 0xD440_0000 {
            return Outcome::Halt(Edscr::STATUS_HLT);
        }

        // SVC, taken to EL1 or the current level if higher.
        if instruction & 0xFFE0_001F == 0xD400_0001 {
            let offset = if self.el == 0 { 0x400 } else { 0x200 };
            let target = self.el.max(1);
            let index = usize::from(target);
            self.spsr[index] = self.pstate;
            self.esr[index] = SVC_SYNDROME | u64::from((instruction >> 5) & 0xFFFF);
            self.el = target;
            self.pstate = (RESET_PSTATE & !0b1100) | (u64::from(target) << 2);
            self.pc = self.vector_base.wrapping_add(offset);
            return Outcome::Continue;
        }

        if instruction == WFI {
            self.pc = self.pc.wrapping_add(4);
            return Outcome::Wait;
        }

        if instruction == NOP || instruction == DSB_SY || instruction == ISB {
            self.pc = self.pc.wrapping_add(4);
            return Outcome::Continue;
        }

        // B
        if instruction & 0xFC00_0000 == 0x1400_0000 {
            let offset = (((instruction & 0x03FF_FFFF) as i64) << 38 >> 38) * 4;
            self.pc = self.pc.wrapping_add(offset as u64);
            return Outcome::Continue;
        }

        // MOVZ
        if instruction & 0x7F80_0000 == 0x5280_0000 {
            let rd = (instruction & 0x1F) as usize;
            let shift = ((instruction >> 21) & 0b11) * 16;
            let mut value = u64::from((instruction >> 5) & 0xFFFF) << shift;
            if instruction & (1 << 31) == 0 {
                value &= 0xFFFF_FFFF;
            }
            self.set_reg(rd, value);
            self.pc = self.pc.wrapping_add(4);
            return Outcome::Continue;
        }

        // ADD (immediate), 64-bit
        if instruction & 0xFF80_0000 == 0x9100_0000 {
            let rd = (instruction & 0x1F) as usize;
            let rn = ((instruction >> 5) & 0x1F) as usize;
            let value = self
                .reg_or_sp(rn)
                .wrapping_add(u64::from((instruction >> 10) & 0xFFF));
            self.set_reg_or_sp(rd, value);
            self.pc = self.pc.wrapping_add(4);
            return Outcome::Continue;
        }

        // STR / LDR (32-bit, unsigned offset)
        if instruction & 0xFF80_0000 == 0xB900_0000 {
            let access = PostIndexed {
                size: 4,
                load: instruction & (1 << 22) != 0,
                rt: (instruction & 0x1F) as usize,
                rn: ((instruction >> 5) & 0x1F) as usize,
                offset: 0,
            };
            let displacement = u64::from((instruction >> 10) & 0xFFF) * 4;
            let base = self.reg_or_sp(access.rn);
            self.set_reg_or_sp(access.rn, base.wrapping_add(displacement));
            let outcome = self.load_store(memory, access);
            self.set_reg_or_sp(access.rn, base);

            return match outcome {
                Ok(Outcome::Continue) => {
                    self.pc = self.pc.wrapping_add(4);
                    Outcome::Continue
                }
                Ok(other) => other,
                Err(_) => Outcome::Wait,
            };
        }

        if let Some(access) = PostIndexed::decode(instruction) {
            return match self.load_store(memory, access) {
                Ok(Outcome::Continue) => {
                    self.pc = self.pc.wrapping_add(4);
                    Outcome::Continue
                }
                Ok(other) => other,
                Err(_) => Outcome::Wait,
            };
        }

        Outcome::Wait
    }

    /// Run in Non-debug state until something stops the core.
    fn run(&mut self, memory: &mut Memory, single_step: bool) {
        for _ in 0..RUN_BUDGET {
            if self.breakpoint_hit() {
                self.enter_debug(Edscr::STATUS_BREAKPOINT);
                return;
            }

            match self.step_instruction(memory) {
                Outcome::Continue => {}
                Outcome::Halt(status) => {
                    self.enter_debug(status);
                    return;
                }
                Outcome::Wait => {
                    self.waiting = true;
                    return;
                }
            }

            if single_step {
                self.enter_debug(Edscr::STATUS_STEP_NORMAL);
                return;
            }
        }
    }

    fn read_bank(&self, offset: u64) -> u32 {
        let (bank, base) = if offset >= Dbgwvr::ADDRESS_OFFSET {
            (&self.watchpoints, Dbgwvr::ADDRESS_OFFSET)
        } else {
            (&self.breakpoints, Dbgbvr::ADDRESS_OFFSET)
        };
        let index = ((offset - base) / BANK_STRIDE) as usize;
        let Some(comparator) = bank.get(index) else {
            return 0;
        };

        match (offset - base) % BANK_STRIDE {
            0 => comparator.value as u32,
            4 => (comparator.value >> 32) as u32,
            8 => comparator.control,
            _ => 0,
        }
    }

    fn write_bank(&mut self, offset: u64, value: u32) {
        let (bank, base) = if offset >= Dbgwvr::ADDRESS_OFFSET {
            (&mut self.watchpoints, Dbgwvr::ADDRESS_OFFSET)
        } else {
            (&mut self.breakpoints, Dbgbvr::ADDRESS_OFFSET)
        };
        let index = ((offset - base) / BANK_STRIDE) as usize;
        let Some(comparator) = bank.get_mut(index) else {
            return;
        };

        match (offset - base) % BANK_STRIDE {
            0 => comparator.value = (comparator.value & !0xFFFF_FFFF) | u64::from(value),
            4 => comparator.value = (comparator.value & 0xFFFF_FFFF) | u64::from(value) << 32,
            8 => comparator.control = value,
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct SimCti {
    base: u64,
    core: Option<usize>,
    enabled: bool,
    gate: u32,
    outen: [u32; 2],
    trigout: u32,
}

#[derive(Debug, Clone, Copy)]
enum Component {
    Debug(usize, u64),
    Cti(usize, u64),
}

#[derive(Debug, Default)]
struct Simulation {
    cores: Vec<SimCore>,
    ctis: Vec<SimCti>,
    memory: Memory,
    failing_writes: Vec<u64>,
    transfers_left: Option<usize>,
}

impl Simulation {
    fn component(&self, address: u64) -> Option<Component> {
        let within = |base: u64| (base..base + COMPONENT_SIZE).contains(&address);

        if let Some(index) = self.cores.iter().position(|core| within(core.debug_base)) {
            return Some(Component::Debug(
                index,
                address - self.cores[index].debug_base,
            ));
        }

        self.ctis
            .iter()
            .position(|cti| within(cti.base))
            .map(|index| Component::Cti(index, address - self.ctis[index].base))
    }

    fn check_link(&mut self, ap: u8, address: u64, write: bool) -> Result<(), TransportError> {
        if let Some(left) = self.transfers_left.as_mut() {
            if *left == 0 {
                return Err(TransportError::NotConnected);
            }
            *left -= 1;
        }

        if write {
            if let Some(position) = self.failing_writes.iter().position(|a| *a == address) {
                self.failing_writes.remove(position);
                return Err(TransportError::Fault { ap, address });
            }
        }

        Ok(())
    }

    fn read(&mut self, ap: u8, address: u64) -> Result<u32, TransportError> {
        self.check_link(ap, address, false)?;

        let value = match self.component(address) {
            Some(Component::Debug(core, offset)) => self.read_debug(core, offset),
            Some(Component::Cti(cti, offset)) => self.read_cti(cti, offset),
            None => return Err(TransportError::Fault { ap, address }),
        };

        tracing::trace!("[fake] read  {:#010x} = {:#010x}", address, value);

        Ok(value)
    }

    fn write(&mut self, ap: u8, address: u64, value: u32) -> Result<(), TransportError> {
        self.check_link(ap, address, true)?;

        tracing::trace!("[fake] write {:#010x} = {:#010x}", address, value);

        match self.component(address) {
            Some(Component::Debug(core, offset)) => self.write_debug(core, offset, value),
            Some(Component::Cti(cti, offset)) => self.write_cti(cti, offset, value),
            None => return Err(TransportError::Fault { ap, address }),
        }

        Ok(())
    }

    fn read_debug(&mut self, index: usize, offset: u64) -> u32 {
        let Simulation { cores, memory, .. } = self;
        let core = &mut cores[index];

        if !core.powered && offset != Edprsr::ADDRESS_OFFSET {
            return 0;
        }

        match offset {
            Edscr::ADDRESS_OFFSET => core.edscr(),
            Dbgdtrrx::ADDRESS_OFFSET => core.dtrrx,
            Dbgdtrtx::ADDRESS_OFFSET => core.read_dtrtx(memory),
            Edecr::ADDRESS_OFFSET => core.edecr.into(),
            Edesr::ADDRESS_OFFSET => {
                let mut edesr = Edesr::from(0);
                edesr.set_rc(core.reset_catch_pending);
                edesr.into()
            }
            EdwarLo::ADDRESS_OFFSET => core.edwar as u32,
            EdwarHi::ADDRESS_OFFSET => (core.edwar >> 32) as u32,
            Edprsr::ADDRESS_OFFSET => core.read_edprsr(),
            Eddfr::ADDRESS_OFFSET => core.eddfr(),
            offset if (Dbgbvr::ADDRESS_OFFSET..Dbgwvr::ADDRESS_OFFSET + 0x400).contains(&offset) => {
                core.read_bank(offset)
            }
            _ => 0,
        }
    }

    fn write_debug(&mut self, index: usize, offset: u64, value: u32) {
        let Simulation { cores, memory, .. } = self;
        let core = &mut cores[index];

        if !core.powered {
            return;
        }

        match offset {
            Edscr::ADDRESS_OFFSET => core.write_edscr(value),
            Editr::ADDRESS_OFFSET => core.write_editr(memory, value),
            Dbgdtrrx::ADDRESS_OFFSET => core.write_dtrrx(memory, value),
            Dbgdtrtx::ADDRESS_OFFSET => core.dtrtx = value,
            Edrcr::ADDRESS_OFFSET => {
                if Edrcr::from(value).cse() {
                    core.err = false;
                }
            }
            Edecr::ADDRESS_OFFSET => core.edecr = Edecr::from(value & 0b111),
            Edesr::ADDRESS_OFFSET => {
                if Edesr::from(value).rc() {
                    core.reset_catch_pending = false;
                }
            }
            Oslar::ADDRESS_OFFSET => core.oslk = Oslar::from(value).oslk(),
            Edlar::ADDRESS_OFFSET => {}
            Edprcr::ADDRESS_OFFSET => {
                if Edprcr::from(value).cwrr() && !core.in_reset {
                    core.reset_core();
                    core.leave_reset(memory);
                }
            }
            offset if (Dbgbvr::ADDRESS_OFFSET..Dbgwvr::ADDRESS_OFFSET + 0x400).contains(&offset) => {
                core.write_bank(offset, value)
            }
            _ => {}
        }
    }

    fn read_cti(&mut self, index: usize, offset: u64) -> u32 {
        let cti = &self.ctis[index];

        match offset {
            CtiControl::ADDRESS_OFFSET => u32::from(cti.enabled),
            CtiGate::ADDRESS_OFFSET => cti.gate,
            CtiTrigoutstatus::ADDRESS_OFFSET => cti.trigout,
            offset if offset == CtiOuten::ADDRESS_OFFSET => cti.outen[0],
            offset if offset == CtiOuten::ADDRESS_OFFSET + 4 => cti.outen[1],
            _ => 0,
        }
    }

    fn write_cti(&mut self, index: usize, offset: u64, value: u32) {
        if offset == CtiApppulse::ADDRESS_OFFSET {
            self.pulse(index, value);
            return;
        }

        let cti = &mut self.ctis[index];
        match offset {
            CtiControl::ADDRESS_OFFSET => cti.enabled = CtiControl::from(value).glben(),
            CtiGate::ADDRESS_OFFSET => cti.gate = value,
            CtiIntack::ADDRESS_OFFSET => cti.trigout &= !value,
            offset if offset == CtiOuten::ADDRESS_OFFSET => cti.outen[0] = value,
            offset if offset == CtiOuten::ADDRESS_OFFSET + 4 => cti.outen[1] = value,
            _ => {}
        }
    }

    /// An application pulse: local delivery, plus every CTI with the channel open on both
    /// ends of the matrix.
    fn pulse(&mut self, source: usize, channels: u32) {
        if !self.ctis[source].enabled {
            return;
        }

        for channel in 0..32 {
            let bit = 1u32 << channel;
            if channels & bit == 0 {
                continue;
            }

            let mut targets = vec![source];
            if self.ctis[source].gate & bit != 0 {
                targets.extend(self.ctis.iter().enumerate().filter_map(|(index, cti)| {
                    (index != source && cti.enabled && cti.gate & bit != 0).then_some(index)
                }));
            }

            for target in targets {
                self.deliver(target, bit);
            }
        }
    }

    fn deliver(&mut self, index: usize, channel: u32) {
        let cti = &mut self.ctis[index];
        let Some(core) = cti.core else {
            return;
        };

        if cti.outen[0] & channel != 0 {
            cti.trigout |= HALT_TRIGGER;
            self.halt_request(core);
        }
        if self.ctis[index].outen[1] & channel != 0 {
            self.restart_request(core);
        }
    }

    fn halt_request(&mut self, index: usize) {
        let core = &mut self.cores[index];

        if core.halted || core.in_reset || !core.powered || !core.hde || core.unhaltable {
            return;
        }
        if core.ignored_halts > 0 {
            core.ignored_halts -= 1;
            return;
        }

        core.enter_debug(Edscr::STATUS_EXTERNAL_REQUEST);
    }

    fn restart_request(&mut self, index: usize) {
        let Simulation {
            cores,
            ctis,
            memory,
            ..
        } = self;
        let core = &mut cores[index];

        if !core.halted || core.in_reset {
            return;
        }

        core.leave_debug();

        // A debug request that was never acknowledged halts the core again at once.
        let pending_halt = core
            .cti
            .is_some_and(|cti| ctis[cti].trigout & HALT_TRIGGER != 0);
        if pending_halt {
            core.enter_debug(Edscr::STATUS_EXTERNAL_REQUEST);
            return;
        }

        let single_step = core.edecr.ss();
        core.run(memory, single_step);
    }

    fn assert_reset(&mut self) {
        for core in &mut self.cores {
            core.cold_reset();
        }
    }

    fn deassert_reset(&mut self) {
        let Simulation { cores, memory, .. } = self;
        for core in cores.iter_mut() {
            core.leave_reset(memory);
        }
    }
}

/// A simulated target, shared between the test and the session using it as transport.
#[derive(Debug, Clone, Default)]
pub struct FakeTarget {
    simulation: Rc<RefCell<Simulation>>,
}

impl FakeTarget {
    /// One simulated core and CTI for every core and CTI of `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut ctis: Vec<SimCti> = config
            .ctis
            .iter()
            .map(|cti| SimCti {
                base: cti.base,
                ..Default::default()
            })
            .collect();

        let cores = config
            .cores
            .iter()
            .enumerate()
            .map(|(index, core)| {
                let cti = config.ctis.iter().position(|cti| cti.name == core.cti);
                if let Some(cti) = cti {
                    ctis[cti].core = Some(index);
                }
                SimCore::new(core.debug_base, cti)
            })
            .collect();

        Self {
            simulation: Rc::new(RefCell::new(Simulation {
                cores,
                ctis,
                ..Default::default()
            })),
        }
    }

    fn with_core<T>(&self, core: usize, f: impl FnOnce(&mut SimCore) -> T) -> T {
        f(&mut self.simulation.borrow_mut().cores[core])
    }

    /// Place A64 instructions in memory.
    pub fn load_program(&self, address: u64, program: &[u32]) {
        let bytes: Vec<u8> = program.iter().flat_map(|word| word.to_le_bytes()).collect();
        self.write_memory(address, &bytes);
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) {
        let mut simulation = self.simulation.borrow_mut();
        for (offset, byte) in data.iter().enumerate() {
            simulation
                .memory
                .bytes
                .insert(address + offset as u64, *byte);
        }
    }

    pub fn read_memory(&self, address: u64, length: usize) -> Vec<u8> {
        let simulation = self.simulation.borrow();
        (0..length as u64)
            .map(|offset| {
                simulation
                    .memory
                    .bytes
                    .get(&(address + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn memory_word(&self, address: u64) -> u32 {
        let bytes = self.read_memory(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// The next `count` writes the cores make to `address` are lost.
    pub fn lose_writes_to(&self, address: u64, count: usize) {
        self.simulation
            .borrow_mut()
            .memory
            .lost_writes
            .insert(address, count);
    }

    /// Accesses touching `region` abort.
    pub fn add_fault_region(&self, region: Range<u64>) {
        self.simulation.borrow_mut().memory.faults.push(region);
    }

    /// X0 to X30, then SP (31), PC (32) and PSTATE (33).
    pub fn register(&self, core: usize, index: usize) -> u64 {
        self.with_core(core, |core| match index {
            31 => core.sp,
            32 => core.pc,
            33 => core.pstate,
            index => core.reg(index),
        })
    }

    pub fn set_register(&self, core: usize, index: usize, value: u64) {
        self.with_core(core, |core| match index {
            31 => core.sp = value,
            32 => core.pc = value,
            33 => core.pstate = value,
            index => core.set_reg(index, value),
        })
    }

    pub fn is_halted(&self, core: usize) -> bool {
        self.with_core(core, |core| core.halted)
    }

    /// The core is running but makes no progress, e.g. in WFI.
    pub fn is_waiting(&self, core: usize) -> bool {
        self.with_core(core, |core| core.waiting)
    }

    pub fn halt_status(&self, core: usize) -> u32 {
        self.with_core(core, |core| core.status)
    }

    pub fn exception_level(&self, core: usize) -> u8 {
        self.with_core(core, |core| core.el)
    }

    /// Move the core to `el`, also for the PSTATE it resumes with.
    pub fn set_exception_level(&self, core: usize, el: u8) {
        self.with_core(core, |core| {
            core.el = el;
            core.pstate = (core.pstate & !0b1100) | (u64::from(el) << 2);
        })
    }

    pub fn sctlr(&self, core: usize, el: usize) -> u64 {
        self.with_core(core, |core| core.sctlr[el])
    }

    pub fn set_sctlr(&self, core: usize, el: usize, value: u64) {
        self.with_core(core, |core| core.sctlr[el] = value)
    }

    /// With the MMU on, virtual address `va` maps to physical `va + offset`.
    pub fn set_mmu_offset(&self, core: usize, offset: u64) {
        self.with_core(core, |core| core.mmu_offset = offset)
    }

    pub fn set_contextidr(&self, core: usize, contextidr: u32) {
        self.with_core(core, |core| core.contextidr = contextidr)
    }

    pub fn set_reset_vector(&self, core: usize, address: u64) {
        self.with_core(core, |core| core.reset_vector = address)
    }

    /// Synchronous exceptions from a lower level enter at `address + 0x400`.
    pub fn set_vector_base(&self, core: usize, address: u64) {
        self.with_core(core, |core| core.vector_base = address)
    }

    pub fn set_powered(&self, core: usize, powered: bool) {
        self.with_core(core, |core| core.powered = powered)
    }

    /// Halt requests never reach the core.
    pub fn set_unhaltable(&self, core: usize, unhaltable: bool) {
        self.with_core(core, |core| core.unhaltable = unhaltable)
    }

    /// The next `count` halt requests are lost.
    pub fn ignore_halt_requests(&self, core: usize, count: usize) {
        self.with_core(core, |core| core.ignored_halts = count)
    }

    /// (value, control) of breakpoint unit `slot`.
    pub fn breakpoint_unit(&self, core: usize, slot: usize) -> (u64, u32) {
        self.with_core(core, |core| {
            let unit = core.breakpoints[slot];
            (unit.value, unit.control)
        })
    }

    /// (value, control) of watchpoint unit `slot`.
    pub fn watchpoint_unit(&self, core: usize, slot: usize) -> (u64, u32) {
        self.with_core(core, |core| {
            let unit = core.watchpoints[slot];
            (unit.value, unit.control)
        })
    }

    /// Number of cache maintenance instructions executed in Debug state.
    pub fn cache_maintenance_count(&self, core: usize) -> usize {
        self.with_core(core, |core| core.cache_maintenance)
    }

    /// Gate register of the CTI of `core`.
    pub fn cti_gate(&self, core: usize) -> u32 {
        let simulation = self.simulation.borrow();
        simulation.cores[core]
            .cti
            .map(|cti| simulation.ctis[cti].gate)
            .unwrap_or(0)
    }

    /// The next write to `address` fails with a fault.
    pub fn fail_write_to(&self, address: u64) {
        self.simulation.borrow_mut().failing_writes.push(address);
    }

    /// Every transfer after the next `transfers` fails as if the probe was unplugged.
    pub fn fail_transport_after(&self, transfers: usize) {
        self.simulation.borrow_mut().transfers_left = Some(transfers);
    }
}

impl RegisterTransport for FakeTarget {
    fn read_word_32(&mut self, ap: u8, address: u64) -> Result<u32, TransportError> {
        self.simulation.borrow_mut().read(ap, address)
    }

    fn write_word_32(&mut self, ap: u8, address: u64, value: u32) -> Result<(), TransportError> {
        self.simulation.borrow_mut().write(ap, address, value)
    }

    fn target_reset_assert(&mut self) -> Result<(), TransportError> {
        self.simulation.borrow_mut().assert_reset();

        Ok(())
    }

    fn target_reset_deassert(&mut self) -> Result<(), TransportError> {
        self.simulation.borrow_mut().deassert_reset();

        Ok(())
    }
}
