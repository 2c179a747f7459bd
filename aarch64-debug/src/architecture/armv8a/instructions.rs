//! Contains helpers to build instructions for debugger use
//!
//! All encodings are A64 unless the function name says otherwise.

/// A system register, named by its `op0, op1, CRn, CRm, op2` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemRegister {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
}

impl SystemRegister {
    const fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Self {
        Self {
            op0,
            op1,
            crn,
            crm,
            op2,
        }
    }
}

/// DBGDTR_EL0, both DTR words as one 64-bit register.
pub const DBGDTR_EL0: SystemRegister = SystemRegister::new(2, 3, 0, 4, 0);
/// DBGDTRTX_EL0 when written, DBGDTRRX_EL0 when read.
pub const DBGDTRTX_EL0: SystemRegister = SystemRegister::new(2, 3, 0, 5, 0);
/// DBGDTRRX_EL0 when read.
pub const DBGDTRRX_EL0: SystemRegister = DBGDTRTX_EL0;
/// The PC to return to when leaving Debug state.
pub const DLR_EL0: SystemRegister = SystemRegister::new(3, 3, 4, 5, 1);
/// The PSTATE to restore when leaving Debug state.
pub const DSPSR_EL0: SystemRegister = SystemRegister::new(3, 3, 4, 5, 0);
/// Cache type register, holds the smallest cache line sizes.
pub const CTR_EL0: SystemRegister = SystemRegister::new(3, 3, 0, 0, 1);

/// SCTLR_ELx for EL1 to EL3.
pub fn sctlr(el: u8) -> Option<SystemRegister> {
    match el {
        1 => Some(SystemRegister::new(3, 0, 1, 0, 0)),
        2 => Some(SystemRegister::new(3, 4, 1, 0, 0)),
        3 => Some(SystemRegister::new(3, 6, 1, 0, 0)),
        _ => None,
    }
}

/// ESR_ELx for EL1 to EL3.
pub fn esr(el: u8) -> Option<SystemRegister> {
    match el {
        1 => Some(SystemRegister::new(3, 0, 5, 2, 0)),
        2 => Some(SystemRegister::new(3, 4, 5, 2, 0)),
        3 => Some(SystemRegister::new(3, 6, 5, 2, 0)),
        _ => None,
    }
}

/// SPSR_ELx for EL1 to EL3.
pub fn spsr(el: u8) -> Option<SystemRegister> {
    match el {
        1 => Some(SystemRegister::new(3, 0, 4, 0, 0)),
        2 => Some(SystemRegister::new(3, 4, 4, 0, 0)),
        3 => Some(SystemRegister::new(3, 6, 4, 0, 0)),
        _ => None,
    }
}

fn build_system_move(read: bool, sysreg: SystemRegister, reg: u16) -> u32 {
    let mut ret = 0b1101_0101_0001_0000_0000_0000_0000_0000;

    if read {
        ret |= 1 << 21;
    }
    ret |= ((sysreg.op0 as u32) & 0b1) << 19;
    ret |= (sysreg.op1 as u32) << 16;
    ret |= (sysreg.crn as u32) << 12;
    ret |= (sysreg.crm as u32) << 8;
    ret |= (sysreg.op2 as u32) << 5;
    ret |= reg as u32;

    ret
}

/// Build a MSR instruction, `MSR <sysreg>, X<reg>`
pub fn build_msr(sysreg: SystemRegister, reg: u16) -> u32 {
    build_system_move(false, sysreg, reg)
}

/// Build a MRS instruction, `MRS X<reg>, <sysreg>`
pub fn build_mrs(sysreg: SystemRegister, reg: u16) -> u32 {
    build_system_move(true, sysreg, reg)
}

fn build_post_index(base: u32, reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    let mut ret = base;

    ret |= ((imm as u32) & 0x1FF) << 12;
    ret |= (reg_source as u32) << 5;
    ret |= reg_target as u32;

    ret
}

/// `LDRB W<rt>, [X<rn>], #imm`
pub fn build_ldrb(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b0011_1000_0100_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `LDRH W<rt>, [X<rn>], #imm`
pub fn build_ldrh(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b0111_1000_0100_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `LDR W<rt>, [X<rn>], #imm`
pub fn build_ldrw(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b1011_1000_0100_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `LDR X<rt>, [X<rn>], #imm`
pub fn build_ldr(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b1111_1000_0100_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `STRB W<rt>, [X<rn>], #imm`
pub fn build_strb(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b0011_1000_0000_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `STRH W<rt>, [X<rn>], #imm`
pub fn build_strh(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b0111_1000_0000_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `STR W<rt>, [X<rn>], #imm`
pub fn build_strw(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b1011_1000_0000_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `STR X<rt>, [X<rn>], #imm`
pub fn build_str(reg_target: u16, reg_source: u16, imm: i16) -> u32 {
    build_post_index(0b1111_1000_0000_0000_0000_0100_0000_0000, reg_target, reg_source, imm)
}

/// `ADD X<rd>, X<rn>, #imm`, with register 31 meaning SP.
pub fn build_add_imm(rd: u16, rn: u16, imm: u16) -> u32 {
    let mut ret = 0b1001_0001_0000_0000_0000_0000_0000_0000;

    ret |= ((imm as u32) & 0xFFF) << 10;
    ret |= (rn as u32) << 5;
    ret |= rd as u32;

    ret
}

/// `MOVZ X<rd>, #imm, LSL #(16 * shift)`
pub fn build_movz(rd: u16, imm: u16, shift: u8) -> u32 {
    let mut ret = 0b1101_0010_1000_0000_0000_0000_0000_0000;

    ret |= ((shift as u32) & 0b11) << 21;
    ret |= (imm as u32) << 5;
    ret |= rd as u32;

    ret
}

/// `DC CIVAC, X<reg>`, clean and invalidate data cache line by VA to point of coherency.
pub fn build_dc_civac(reg: u16) -> u32 {
    0b1101_0101_0000_1011_0111_1110_0010_0000 | reg as u32
}

/// `IC IVAU, X<reg>`, invalidate instruction cache line by VA to point of unification.
pub fn build_ic_ivau(reg: u16) -> u32 {
    0b1101_0101_0000_1011_0111_0101_0010_0000 | reg as u32
}

/// `DSB SY`
pub const DSB_SY: u32 = 0xD503_3F9F;

/// `ISB`
pub const ISB: u32 = 0xD503_3FDF;

/// `NOP`
pub const NOP: u32 = 0xD503_201F;

/// `WFI`
pub const WFI: u32 = 0xD503_207F;

/// `DRPS`, return to the exception level held in SPSR of the current level.
pub const DRPS: u32 = 0xD6BF_03E0;

/// `DCPS<el>`, switch to exception level `el` while staying in Debug state.
pub fn build_dcps(el: u8) -> u32 {
    0b1101_0100_1010_0000_0000_0000_0000_0000 | ((el as u32) & 0b11)
}

/// `HLT #imm`
pub fn build_hlt(imm: u16) -> u32 {
    0b1101_0100_0100_0000_0000_0000_0000_0000 | ((imm as u32) << 5)
}

/// `HLT #imm` in T32. Only 6 bits of immediate exist.
pub fn build_hlt_t32(imm: u8) -> u16 {
    0xBA80 | ((imm as u16) & 0x3F)
}
